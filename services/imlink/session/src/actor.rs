//! Tokio task that owns one [`Session`] and performs its I/O.
//!
//! Every mutation of the session happens inside [`SessionActor::run`]:
//! caller commands, transport bytes, heartbeat deadlines, the retry sweep and
//! reconnect attempts are all serialized through one `select!` loop.
//! Background work (connects, reconnect delays) re-enters through the command
//! channel carrying a generation token, so results that arrive after a
//! forced disconnect are dropped.

use bytes::Bytes;
use std::future::pending;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{SessionError, TransportError};
use crate::events::DisconnectReason;
use crate::heartbeat::{HeartbeatMode, NetworkSample};
use crate::message::SendOptions;
use crate::session::{Session, SessionSnapshot, SessionType};
use crate::state::ConnectState;
use crate::transport::{Connection, ConnectionWriter, Transport, TransportEvent};

/// Command queue depth per session
pub const COMMAND_QUEUE_DEPTH: usize = 256;

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

/// Messages accepted by a session actor
pub enum SessionCommand {
    /// Connect; resolves once the transport is up or has failed
    Connect {
        /// Completion
        reply: Reply<()>,
    },
    /// Frame and write a message; resolves with (message id, sequence)
    Send {
        /// Body
        payload: Bytes,
        /// Per-send options
        options: SendOptions,
        /// Completion
        reply: Reply<(String, u32)>,
    },
    /// Orderly disconnect
    Disconnect {
        /// Completion
        reply: Reply<()>,
    },
    /// Drop the connection and cancel every timer
    ForceDisconnect {
        /// Reported reason
        reason: DisconnectReason,
    },
    /// Switch heartbeat mode
    SetHeartbeatMode(HeartbeatMode),
    /// External link sample
    NetworkSample(NetworkSample),
    /// Reachability change
    NetworkAvailable(bool),
    /// Bytes received for this session outside its own transport reader
    Inbound(Bytes),
    /// Hand a reconnect to the session's policy
    ScheduleReconnect,
    /// A scheduled reconnect delay elapsed
    ReconnectAttempt {
        /// Policy generation the attempt was scheduled under
        generation: u64,
    },
    /// Background connect finished
    ConnectCompleted {
        /// Session generation the connect was started under
        generation: u64,
        /// Connected (and secured) transport, or why not
        result: Result<Box<dyn Connection>, TransportError>,
    },
    /// Current connection state
    State {
        /// Completion
        reply: oneshot::Sender<ConnectState>,
    },
    /// Status view
    Snapshot {
        /// Completion
        reply: oneshot::Sender<SessionSnapshot>,
    },
    /// Stop the actor and hand the session back
    Shutdown,
}

impl std::fmt::Debug for SessionCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionCommand::Connect { .. } => "Connect",
            SessionCommand::Send { .. } => "Send",
            SessionCommand::Disconnect { .. } => "Disconnect",
            SessionCommand::ForceDisconnect { .. } => "ForceDisconnect",
            SessionCommand::SetHeartbeatMode(_) => "SetHeartbeatMode",
            SessionCommand::NetworkSample(_) => "NetworkSample",
            SessionCommand::NetworkAvailable(_) => "NetworkAvailable",
            SessionCommand::Inbound(_) => "Inbound",
            SessionCommand::ScheduleReconnect => "ScheduleReconnect",
            SessionCommand::ReconnectAttempt { .. } => "ReconnectAttempt",
            SessionCommand::ConnectCompleted { .. } => "ConnectCompleted",
            SessionCommand::State { .. } => "State",
            SessionCommand::Snapshot { .. } => "Snapshot",
            SessionCommand::Shutdown => "Shutdown",
        };
        f.write_str(name)
    }
}

/// The task side of a running session
pub struct SessionActor {
    session: Session,
    transport: Arc<dyn Transport>,
    commands: mpsc::Receiver<SessionCommand>,
    self_tx: mpsc::WeakSender<SessionCommand>,
    writer: Option<Box<dyn ConnectionWriter>>,
    inbound: Option<mpsc::Receiver<TransportEvent>>,
    connecting: Option<JoinHandle<()>>,
    connect_waiters: Vec<Reply<()>>,
}

impl SessionActor {
    /// Drive the session until shutdown or until every handle is dropped
    pub async fn run(mut self) -> Session {
        let mut sweep = tokio::time::interval(self.session.config().retry_sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let heartbeat_at = self.session.next_heartbeat_deadline();
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                event = recv_transport(&mut self.inbound) => self.handle_transport(event).await,
                _ = sleep_until_opt(heartbeat_at) => self.on_heartbeat_timer().await,
                _ = sweep.tick() => self.on_retry_sweep().await,
            }
        }

        self.stop_connecting();
        self.close_writer().await;
        if self.session.state() != ConnectState::Disconnected {
            self.session.force_disconnect(DisconnectReason::UserInitiated);
        }
        self.resolve_waiters(Err(SessionError::ActorStopped));
        debug!(session_id = %self.session.id(), "session actor stopped");
        self.session
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Connect { reply } => self.connect(reply),
            SessionCommand::Send {
                payload,
                options,
                reply,
            } => {
                let result = self.send(payload, options).await;
                let _ = reply.send(result);
            }
            SessionCommand::Disconnect { reply } => {
                self.disconnect().await;
                let _ = reply.send(Ok(()));
            }
            SessionCommand::ForceDisconnect { reason } => {
                self.stop_connecting();
                self.close_writer().await;
                self.session.force_disconnect(reason);
                self.resolve_waiters(Err(SessionError::NotConnected(ConnectState::Disconnected)));
            }
            SessionCommand::SetHeartbeatMode(mode) => {
                self.session.set_heartbeat_mode(mode, Instant::now())
            }
            SessionCommand::NetworkSample(sample) => self.session.report_network_sample(sample),
            SessionCommand::NetworkAvailable(available) => {
                self.session.set_network_available(available);
            }
            SessionCommand::Inbound(bytes) => {
                if self.session.is_connected() {
                    self.handle_transport(Some(TransportEvent::Data(bytes))).await;
                } else {
                    debug!(
                        session_id = %self.session.id(),
                        len = bytes.len(),
                        "inbound bytes dropped while disconnected"
                    );
                }
            }
            SessionCommand::ScheduleReconnect => self.schedule_reconnect(),
            SessionCommand::ReconnectAttempt { generation } => self.reconnect_attempt(generation),
            SessionCommand::ConnectCompleted { generation, result } => {
                self.connect_completed(generation, result).await
            }
            SessionCommand::State { reply } => {
                let _ = reply.send(self.session.state());
            }
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(self.session.snapshot());
            }
            SessionCommand::Shutdown => {}
        }
    }

    fn connect(&mut self, reply: Reply<()>) {
        match self.session.state() {
            ConnectState::Connected => {
                let _ = reply.send(Ok(()));
            }
            ConnectState::Connecting => self.connect_waiters.push(reply),
            _ => match self.session.begin_connect(false) {
                Ok(generation) => {
                    self.connect_waiters.push(reply);
                    self.spawn_connect(generation);
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
        }
    }

    fn spawn_connect(&mut self, generation: u64) {
        let config = self.session.config();
        let (host, port) = (config.host.clone(), config.port);
        let (use_tls, tls) = (config.use_tls, config.tls.clone());
        let timeout = config.connect_timeout;
        let transport = self.transport.clone();
        let weak = self.self_tx.clone();

        self.stop_connecting();
        self.connecting = Some(tokio::spawn(async move {
            let attempt = async {
                let conn = transport.connect(&host, port).await?;
                if use_tls {
                    conn.start_secure(&tls).await
                } else {
                    Ok(conn)
                }
            };
            let result = match tokio::time::timeout(timeout, attempt).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(timeout)),
            };
            if let Some(tx) = weak.upgrade() {
                let _ = tx
                    .send(SessionCommand::ConnectCompleted { generation, result })
                    .await;
            }
        }));
    }

    fn stop_connecting(&mut self) {
        if let Some(task) = self.connecting.take() {
            task.abort();
        }
    }

    async fn connect_completed(
        &mut self,
        generation: u64,
        result: Result<Box<dyn Connection>, TransportError>,
    ) {
        self.connecting = None;
        if generation != self.session.generation()
            || self.session.state() != ConnectState::Connecting
        {
            debug!(
                session_id = %self.session.id(),
                generation,
                current = self.session.generation(),
                "stale connect result dropped"
            );
            return;
        }

        let conn = match result {
            Ok(conn) => conn,
            Err(e) => {
                let reason = match e {
                    TransportError::Timeout(_) => DisconnectReason::ConnectionTimeout,
                    _ => DisconnectReason::NetworkError,
                };
                self.session.connection_failed(reason);
                self.resolve_waiters(Err(SessionError::Transport(e)));
                return;
            }
        };

        let peer = conn.peer_addr();
        let (writer, inbound) = conn.split();
        let frames = match self.session.connection_established(Instant::now()) {
            Ok(frames) => frames,
            Err(e) => {
                error!(session_id = %self.session.id(), error = %e, "connect bookkeeping failed");
                self.session.force_disconnect(DisconnectReason::ProtocolError);
                self.resolve_waiters(Err(e));
                return;
            }
        };
        self.writer = Some(writer);
        self.inbound = Some(inbound);
        info!(session_id = %self.session.id(), ?peer, "transport up");

        self.resolve_waiters(Ok(()));
        self.write_all(frames).await;
    }

    fn resolve_waiters(&mut self, result: Result<(), SessionError>) {
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }

    fn schedule_reconnect(&mut self) {
        let weak = self.self_tx.clone();
        let scheduled = self.session.schedule_reconnect(move |generation| async move {
            if let Some(tx) = weak.upgrade() {
                let _ = tx.send(SessionCommand::ReconnectAttempt { generation }).await;
            }
        });
        if scheduled.is_none() {
            debug!(session_id = %self.session.id(), "reconnect not scheduled");
        }
    }

    fn reconnect_attempt(&mut self, generation: u64) {
        if !self.session.is_reconnect_current(generation)
            || self.session.state() != ConnectState::Disconnected
        {
            debug!(session_id = %self.session.id(), generation, "stale reconnect attempt dropped");
            return;
        }
        match self.session.begin_connect(true) {
            Ok(generation) => self.spawn_connect(generation),
            Err(e) => warn!(session_id = %self.session.id(), error = %e, "reconnect refused"),
        }
    }

    async fn send(
        &mut self,
        payload: Bytes,
        options: SendOptions,
    ) -> Result<(String, u32), SessionError> {
        let (id, seq, frame) = self.session.prepare_send(payload, options)?;
        match self.write(&frame).await {
            Ok(()) => {
                self.session.mark_sent(&id, Instant::now())?;
                Ok((id, seq))
            }
            Err(e) => {
                self.session.mark_send_failed(&id, e.to_string());
                self.lose_connection(DisconnectReason::SocketError).await;
                Err(SessionError::Transport(e))
            }
        }
    }

    async fn disconnect(&mut self) {
        match self.session.state() {
            ConnectState::Disconnected => {}
            ConnectState::Connected => {
                if let Err(e) = self.session.disconnect() {
                    warn!(session_id = %self.session.id(), error = %e, "disconnect refused");
                }
                self.close_writer().await;
                self.session.disconnect_complete();
            }
            ConnectState::Connecting | ConnectState::Disconnecting => {
                self.stop_connecting();
                self.close_writer().await;
                self.session.force_disconnect(DisconnectReason::UserInitiated);
                self.resolve_waiters(Err(SessionError::NotConnected(ConnectState::Disconnected)));
            }
        }
    }

    async fn handle_transport(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Data(bytes)) => {
                let outcome = self.session.handle_bytes(&bytes, Instant::now());
                if !self.write_all(outcome.replies).await {
                    return;
                }
                if let Some(fatal) = outcome.fatal {
                    error!(session_id = %self.session.id(), error = %fatal, "fatal protocol error");
                    self.lose_connection(DisconnectReason::ProtocolError).await;
                }
            }
            Some(TransportEvent::Closed(Some(e))) => {
                debug!(session_id = %self.session.id(), error = %e, "transport read failed");
                self.lose_connection(DisconnectReason::SocketError).await;
            }
            Some(TransportEvent::Closed(None)) | None => {
                self.lose_connection(DisconnectReason::NetworkError).await;
            }
        }
    }

    async fn on_heartbeat_timer(&mut self) {
        let tick = self.session.heartbeat_tick(Instant::now());
        if tick.dead {
            self.lose_connection(DisconnectReason::HeartbeatTimeout).await;
            return;
        }
        if let Some((seq, frame)) = tick.frame {
            if let Err(e) = self.write(&frame).await {
                warn!(session_id = %self.session.id(), seq, error = %e, "heartbeat write failed");
                let dead = self.session.heartbeat_send_failed(seq);
                let reason = if dead {
                    DisconnectReason::HeartbeatTimeout
                } else {
                    DisconnectReason::SocketError
                };
                self.lose_connection(reason).await;
            }
        }
    }

    async fn on_retry_sweep(&mut self) {
        let frames = self.session.sweep_retries(Instant::now());
        self.write_all(frames).await;
    }

    async fn write(&mut self, frame: &Bytes) -> Result<(), TransportError> {
        let writer = self.writer.as_mut().ok_or(TransportError::Closed)?;
        writer.send(frame).await?;
        self.session.record_outbound(frame.len());
        Ok(())
    }

    async fn write_all(&mut self, frames: Vec<Bytes>) -> bool {
        for frame in frames {
            if let Err(e) = self.write(&frame).await {
                warn!(session_id = %self.session.id(), error = %e, "write failed");
                self.lose_connection(DisconnectReason::SocketError).await;
                return false;
            }
        }
        true
    }

    async fn lose_connection(&mut self, reason: DisconnectReason) {
        self.close_writer().await;
        if matches!(
            self.session.state(),
            ConnectState::Connected | ConnectState::Disconnecting
        ) {
            self.session.connection_lost(reason);
        }
    }

    async fn close_writer(&mut self) {
        self.inbound = None;
        if let Some(mut writer) = self.writer.take() {
            writer.close().await;
        }
    }
}

async fn recv_transport(
    inbound: &mut Option<mpsc::Receiver<TransportEvent>>,
) -> Option<TransportEvent> {
    match inbound {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => pending().await,
    }
}

/// Caller side of a running session
#[derive(Debug)]
pub struct SessionHandle {
    id: Uuid,
    session_type: SessionType,
    tx: mpsc::Sender<SessionCommand>,
    join: JoinHandle<Session>,
}

impl SessionHandle {
    /// Move `session` onto its own task
    pub fn spawn(session: Session, transport: Arc<dyn Transport>) -> Self {
        let (tx, commands) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (id, session_type) = (session.id(), session.session_type());
        let actor = SessionActor {
            session,
            transport,
            commands,
            self_tx: tx.downgrade(),
            writer: None,
            inbound: None,
            connecting: None,
            connect_waiters: Vec::new(),
        };
        let join = tokio::spawn(actor.run());
        Self {
            id,
            session_type,
            tx,
            join,
        }
    }

    /// Session id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Session type
    pub fn session_type(&self) -> SessionType {
        self.session_type
    }

    /// Whether the actor has exited
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    async fn command(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| SessionError::ActorStopped)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.command(make(reply)).await?;
        rx.await.map_err(|_| SessionError::ActorStopped)
    }

    /// Connect and wait for the transport
    pub async fn connect(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::Connect { reply }).await?
    }

    /// Send a message. Returns (message id, sequence) once written; delivery
    /// is reported through events.
    pub async fn send(
        &self,
        payload: Bytes,
        options: SendOptions,
    ) -> Result<(String, u32), SessionError> {
        self.request(|reply| SessionCommand::Send {
            payload,
            options,
            reply,
        })
        .await?
    }

    /// Orderly disconnect
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::Disconnect { reply }).await?
    }

    /// Drop the connection and cancel all timers
    pub async fn force_disconnect(&self, reason: DisconnectReason) -> Result<(), SessionError> {
        self.command(SessionCommand::ForceDisconnect { reason }).await
    }

    /// Switch heartbeat mode
    pub async fn set_heartbeat_mode(&self, mode: HeartbeatMode) -> Result<(), SessionError> {
        self.command(SessionCommand::SetHeartbeatMode(mode)).await
    }

    /// Feed an external link sample
    pub async fn report_network_sample(&self, sample: NetworkSample) -> Result<(), SessionError> {
        self.command(SessionCommand::NetworkSample(sample)).await
    }

    /// Report reachability
    pub async fn set_network_available(&self, available: bool) -> Result<(), SessionError> {
        self.command(SessionCommand::NetworkAvailable(available)).await
    }

    /// Feed bytes to the session's parser as if read from its transport
    pub async fn deliver_inbound(&self, bytes: Bytes) -> Result<(), SessionError> {
        self.command(SessionCommand::Inbound(bytes)).await
    }

    /// Ask the session's reconnect policy for the next attempt
    pub async fn schedule_reconnect(&self) -> Result<(), SessionError> {
        self.command(SessionCommand::ScheduleReconnect).await
    }

    /// Current connection state
    pub async fn state(&self) -> Result<ConnectState, SessionError> {
        self.request(|reply| SessionCommand::State { reply }).await
    }

    /// Status view
    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        self.request(|reply| SessionCommand::Snapshot { reply }).await
    }

    /// Stop the actor and take the session back
    pub async fn shutdown(self) -> Result<Session, SessionError> {
        let _ = self.tx.send(SessionCommand::Shutdown).await;
        self.join.await.map_err(|_| SessionError::ActorStopped)
    }
}
