//! Registry of running sessions and the client-facing facade over them.
//!
//! The coordinator keeps one session per [`SessionType`], routes sends by
//! session id, by type or by content type, and runs a dispatcher task that
//! fans [`SessionEvent`]s out to registered observers. Reconnects requested by
//! a session are handed back to that session's own reconnect policy.

use bytes::Bytes;
use dashmap::DashMap;
use imlink_wire::{ContentType, TlvBuilder};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::actor::SessionHandle;
use crate::error::SessionError;
use crate::events::{
    DeliveryObserver, DisconnectReason, EventSink, HeartbeatObserver, MessageObserver,
    SessionEvent, StateObserver,
};
use crate::heartbeat::{HeartbeatMode, NetworkSample};
use crate::message::SendOptions;
use crate::pool::{PoolConfig, SessionPool};
use crate::session::{SessionConfig, SessionSnapshot, SessionType};
use crate::state::ConnectState;
use crate::transport::Transport;

/// Content routes installed at startup
pub fn default_routes() -> HashMap<ContentType, SessionType> {
    HashMap::from([
        (ContentType::Text, SessionType::Chat),
        (ContentType::Location, SessionType::Chat),
        (ContentType::Custom, SessionType::Chat),
        (ContentType::Image, SessionType::Media),
        (ContentType::Audio, SessionType::Media),
        (ContentType::Video, SessionType::Media),
        (ContentType::File, SessionType::Media),
    ])
}

/// Coordinator settings
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Pool limits
    pub pool: PoolConfig,
    /// Settings for new sessions; type, host and port are filled in per connect
    pub session: SessionConfig,
    /// Initial content routing table
    pub routes: HashMap<ContentType, SessionType>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            session: SessionConfig::default(),
            routes: default_routes(),
        }
    }
}

#[derive(Debug)]
struct ManagedSession {
    handle: SessionHandle,
    host: String,
    port: u16,
}

#[derive(Debug, Default)]
struct Observers {
    state: Vec<Arc<dyn StateObserver>>,
    delivery: Vec<Arc<dyn DeliveryObserver>>,
    heartbeat: Vec<Arc<dyn HeartbeatObserver>>,
    message: Vec<Arc<dyn MessageObserver>>,
}

/// Top-level session registry
#[derive(Debug)]
pub struct NetworkCoordinator {
    config: CoordinatorConfig,
    transport: Arc<dyn Transport>,
    pool: SessionPool,
    sessions: DashMap<Uuid, Arc<ManagedSession>>,
    by_type: DashMap<SessionType, Uuid>,
    states: DashMap<Uuid, (SessionType, ConnectState)>,
    routing: RwLock<HashMap<ContentType, SessionType>>,
    observers: std::sync::RwLock<Observers>,
    events: EventSink,
    network_available: AtomicBool,
    dispatcher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl NetworkCoordinator {
    /// Build the coordinator, start its pool and event dispatcher
    pub async fn start(config: CoordinatorConfig, transport: Arc<dyn Transport>) -> Arc<Self> {
        let (events, rx) = EventSink::channel();
        let coordinator = Arc::new(Self {
            pool: SessionPool::new(config.pool),
            routing: RwLock::new(config.routes.clone()),
            config,
            transport,
            sessions: DashMap::new(),
            by_type: DashMap::new(),
            states: DashMap::new(),
            observers: std::sync::RwLock::new(Observers::default()),
            events,
            network_available: AtomicBool::new(true),
            dispatcher: std::sync::Mutex::new(None),
        });
        coordinator.pool.start().await;

        let task = tokio::spawn(dispatch(Arc::downgrade(&coordinator), rx));
        *coordinator
            .dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(task);
        info!("network coordinator started");
        coordinator
    }

    /// Session pool backing the registry
    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    fn managed(&self, session_id: Uuid) -> Result<Arc<ManagedSession>, SessionError> {
        self.sessions
            .get(&session_id)
            .map(|entry| entry.value().clone())
            .ok_or(SessionError::UnknownSession(session_id))
    }

    fn managed_for_type(&self, session_type: SessionType) -> Option<Arc<ManagedSession>> {
        let id = *self.by_type.get(&session_type)?;
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    fn all_managed(&self) -> Vec<Arc<ManagedSession>> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Session currently serving `session_type`
    pub fn session_for_type(&self, session_type: SessionType) -> Option<Uuid> {
        self.by_type.get(&session_type).map(|id| *id)
    }

    /// Ids of all registered sessions
    pub fn session_ids(&self) -> Vec<Uuid> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    /// Connect the session for `session_type`, creating or reusing one.
    ///
    /// A failed connect leaves the session registered so its reconnect
    /// policy can keep trying; the error is still returned.
    pub async fn connect(
        &self,
        session_type: SessionType,
        host: &str,
        port: u16,
    ) -> Result<Uuid, SessionError> {
        if let Some(existing) = self.managed_for_type(session_type) {
            if existing.host == host && existing.port == port {
                existing.handle.connect().await?;
                return Ok(existing.handle.id());
            }
            info!(%session_type, host, port, "endpoint changed, replacing session");
            drop(existing);
            self.disconnect_type(session_type).await?;
        }

        let config = SessionConfig {
            session_type,
            host: host.to_string(),
            port,
            ..self.config.session.clone()
        };
        let mut session = self.pool.acquire(session_type, config).await?;
        session.set_event_sink(self.events.clone());
        session.set_network_available(self.network_available.load(Ordering::SeqCst));

        let id = session.id();
        let state = session.state();
        let handle = SessionHandle::spawn(session, self.transport.clone());
        let managed = Arc::new(ManagedSession {
            handle,
            host: host.to_string(),
            port,
        });
        self.sessions.insert(id, managed.clone());
        self.by_type.insert(session_type, id);
        self.states.insert(id, (session_type, state));
        info!(session_id = %id, %session_type, host, port, "session registered");

        managed.handle.connect().await?;
        Ok(id)
    }

    fn unregister(&self, session_id: Uuid) -> Option<Arc<ManagedSession>> {
        let (_, managed) = self.sessions.remove(&session_id)?;
        self.by_type
            .remove_if(&managed.handle.session_type(), |_, id| *id == session_id);
        self.states.remove(&session_id);
        Some(managed)
    }

    /// Disconnect the session for `session_type` and return it to the pool
    pub async fn disconnect_type(&self, session_type: SessionType) -> Result<(), SessionError> {
        let id = self
            .session_for_type(session_type)
            .ok_or(SessionError::NoSessionForType(session_type))?;
        let Some(managed) = self.unregister(id) else {
            return Ok(());
        };
        if let Err(e) = managed.handle.disconnect().await {
            debug!(session_id = %id, error = %e, "disconnect on stopped session");
        }
        match Arc::try_unwrap(managed) {
            Ok(managed) => {
                let session = managed.handle.shutdown().await?;
                let pooled = self.pool.release(session).await;
                info!(session_id = %id, %session_type, pooled, "session disconnected");
            }
            Err(managed) => self.retire_shared(id, managed).await,
        }
        Ok(())
    }

    /// A caller still holds the handle, so the session cannot be taken back.
    /// Stop it in place and give up its pool slot.
    async fn retire_shared(&self, session_id: Uuid, managed: Arc<ManagedSession>) {
        let _ = managed
            .handle
            .force_disconnect(DisconnectReason::UserInitiated)
            .await;
        self.pool.forget(managed.handle.session_type()).await;
        debug!(session_id = %session_id, "session still referenced, retired without pooling");
    }

    /// Disconnect every session
    pub async fn disconnect_all(&self) {
        let types: Vec<SessionType> = self.by_type.iter().map(|entry| *entry.key()).collect();
        for session_type in types {
            if let Err(e) = self.disconnect_type(session_type).await {
                warn!(%session_type, error = %e, "disconnect failed");
            }
        }
    }

    /// Drop a session without pooling it. Its timers are cancelled first.
    pub async fn remove_session(&self, session_id: Uuid) -> Result<(), SessionError> {
        let managed = self
            .unregister(session_id)
            .ok_or(SessionError::UnknownSession(session_id))?;
        let _ = managed
            .handle
            .force_disconnect(DisconnectReason::UserInitiated)
            .await;
        match Arc::try_unwrap(managed) {
            Ok(managed) => {
                let session = managed.handle.shutdown().await?;
                self.pool.remove(session).await;
            }
            Err(managed) => self.retire_shared(session_id, managed).await,
        }
        info!(session_id = %session_id, "session removed");
        Ok(())
    }

    /// Send through a specific session
    pub async fn send(
        &self,
        session_id: Uuid,
        payload: Bytes,
        options: SendOptions,
    ) -> Result<(String, u32), SessionError> {
        self.managed(session_id)?.handle.send(payload, options).await
    }

    /// Send through the session serving `session_type`
    pub async fn send_through_type(
        &self,
        session_type: SessionType,
        payload: Bytes,
        options: SendOptions,
    ) -> Result<(String, u32), SessionError> {
        let managed = self
            .managed_for_type(session_type)
            .ok_or(SessionError::NoSessionForType(session_type))?;
        managed.handle.send(payload, options).await
    }

    /// Send through the session type routed for `content_type`
    pub async fn send_with_auto_route(
        &self,
        content_type: ContentType,
        payload: Bytes,
        options: SendOptions,
    ) -> Result<(String, u32), SessionError> {
        let session_type = self
            .routing
            .read()
            .await
            .get(&content_type)
            .copied()
            .ok_or(SessionError::NoRoute(content_type))?;
        debug!(?content_type, %session_type, "auto-routed send");
        self.send_through_type(session_type, payload, options).await
    }

    /// Encode `text` as a TLV text field and auto-route it
    pub async fn send_text(&self, text: &str) -> Result<(String, u32), SessionError> {
        let body = TlvBuilder::new().text(ContentType::Text, text).build()?;
        self.send_with_auto_route(ContentType::Text, body, SendOptions::default())
            .await
    }

    /// Route `content_type` to `session_type`
    pub async fn configure_routing(&self, content_type: ContentType, session_type: SessionType) {
        self.routing.write().await.insert(content_type, session_type);
        info!(?content_type, %session_type, "routing updated");
    }

    /// Current routing table
    pub async fn routes(&self) -> HashMap<ContentType, SessionType> {
        self.routing.read().await.clone()
    }

    /// Feed bytes received elsewhere to a session's parser
    pub async fn route_inbound(&self, session_id: Uuid, bytes: Bytes) -> Result<(), SessionError> {
        self.managed(session_id)?.handle.deliver_inbound(bytes).await
    }

    /// Live state of the session for `session_type`; `Disconnected` if none
    pub async fn connection_state(&self, session_type: SessionType) -> ConnectState {
        match self.managed_for_type(session_type) {
            Some(managed) => managed
                .handle
                .state()
                .await
                .unwrap_or(ConnectState::Disconnected),
            None => ConnectState::Disconnected,
        }
    }

    /// Whether the session for `session_type` is connected
    pub async fn is_connected(&self, session_type: SessionType) -> bool {
        self.connection_state(session_type).await == ConnectState::Connected
    }

    /// Last reported state per session type, as seen by the dispatcher
    pub fn all_connection_states(&self) -> HashMap<SessionType, ConnectState> {
        self.states
            .iter()
            .map(|entry| {
                let (session_type, state) = *entry.value();
                (session_type, state)
            })
            .collect()
    }

    /// Status view of one session
    pub async fn snapshot(&self, session_id: Uuid) -> Result<SessionSnapshot, SessionError> {
        self.managed(session_id)?.handle.snapshot().await
    }

    /// Reachability came back; recoverable sessions reconnect
    pub async fn network_did_become_available(&self) {
        self.network_available.store(true, Ordering::SeqCst);
        info!("network available");
        for managed in self.all_managed() {
            let _ = managed.handle.set_network_available(true).await;
        }
    }

    /// Reachability lost; scheduled reconnects are cancelled
    pub async fn network_did_become_unavailable(&self) {
        self.network_available.store(false, Ordering::SeqCst);
        warn!("network unavailable");
        for managed in self.all_managed() {
            let _ = managed.handle.set_network_available(false).await;
        }
    }

    /// Whether reachability is currently reported
    pub fn is_network_available(&self) -> bool {
        self.network_available.load(Ordering::SeqCst)
    }

    /// Feed a link-quality sample to every session's heartbeat
    pub async fn report_network_sample(&self, sample: NetworkSample) {
        for managed in self.all_managed() {
            let _ = managed.handle.report_network_sample(sample).await;
        }
    }

    /// Switch every session's heartbeat mode
    pub async fn set_heartbeat_mode(&self, mode: HeartbeatMode) {
        info!(?mode, "heartbeat mode change");
        for managed in self.all_managed() {
            let _ = managed.handle.set_heartbeat_mode(mode).await;
        }
    }

    /// Hand a reconnect to the session's own policy
    pub async fn schedule_reconnect_for_session(
        &self,
        session_id: Uuid,
    ) -> Result<(), SessionError> {
        if !self.is_network_available() {
            debug!(session_id = %session_id, "reconnect deferred until network returns");
            return Ok(());
        }
        self.managed(session_id)?.handle.schedule_reconnect().await
    }

    fn write_observers(&self) -> std::sync::RwLockWriteGuard<'_, Observers> {
        self.observers.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register for connection state notifications
    pub fn add_state_observer(&self, observer: Arc<dyn StateObserver>) {
        self.write_observers().state.push(observer);
    }

    /// Register for delivery notifications
    pub fn add_delivery_observer(&self, observer: Arc<dyn DeliveryObserver>) {
        self.write_observers().delivery.push(observer);
    }

    /// Register for heartbeat notifications
    pub fn add_heartbeat_observer(&self, observer: Arc<dyn HeartbeatObserver>) {
        self.write_observers().heartbeat.push(observer);
    }

    /// Register for inbound messages
    pub fn add_message_observer(&self, observer: Arc<dyn MessageObserver>) {
        self.write_observers().message.push(observer);
    }

    /// Disconnect everything and stop background work
    pub async fn shutdown(&self) {
        self.disconnect_all().await;
        for id in self.session_ids() {
            let _ = self.remove_session(id).await;
        }
        self.pool.log_status().await;
        self.pool.stop().await;
        if let Some(task) = self
            .dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        info!("network coordinator stopped");
    }

    async fn handle_event(&self, event: SessionEvent) {
        if let SessionEvent::NeedsReconnect {
            session_id,
            session_type,
            reason,
        } = &event
        {
            info!(session_id = %session_id, %session_type, ?reason, "session needs reconnect");
            if let Err(e) = self.schedule_reconnect_for_session(*session_id).await {
                warn!(session_id = %session_id, error = %e, "reconnect scheduling failed");
            }
            return;
        }

        if let SessionEvent::StateChanged {
            session_id,
            session_type,
            new,
            ..
        } = &event
        {
            if let Some(mut entry) = self.states.get_mut(session_id) {
                *entry = (*session_type, *new);
            }
        }

        let observers = self.observers.read().unwrap_or_else(|e| e.into_inner());
        match event {
            SessionEvent::StateChanged {
                session_id,
                session_type,
                old,
                new,
            } => {
                for o in &observers.state {
                    o.on_state_changed(session_id, session_type, old, new);
                }
            }
            SessionEvent::Disconnected {
                session_id, reason, ..
            } => {
                for o in &observers.state {
                    o.on_disconnected(session_id, reason);
                }
            }
            SessionEvent::ReconnectExhausted {
                session_id,
                attempts,
            } => {
                error!(session_id = %session_id, attempts, "reconnect attempts exhausted");
                for o in &observers.state {
                    o.on_reconnect_exhausted(session_id, attempts);
                }
            }
            SessionEvent::MessageSent {
                session_id,
                message_id,
                sequence,
            } => {
                for o in &observers.delivery {
                    o.on_sent(session_id, &message_id, sequence);
                }
            }
            SessionEvent::MessageAcked {
                session_id,
                message_id,
                rtt,
                ..
            } => {
                for o in &observers.delivery {
                    o.on_acked(session_id, &message_id, rtt);
                }
            }
            SessionEvent::MessageRetried {
                session_id,
                message_id,
                attempt,
                ..
            } => {
                for o in &observers.delivery {
                    o.on_retried(session_id, &message_id, attempt);
                }
            }
            SessionEvent::MessageFailed {
                session_id,
                message_id,
                reason,
                ..
            } => {
                for o in &observers.delivery {
                    o.on_failed(session_id, &message_id, &reason);
                }
            }
            SessionEvent::MessageReceived(message) => {
                for o in &observers.message {
                    o.on_message(&message);
                }
            }
            SessionEvent::HeartbeatSent {
                session_id,
                sequence,
            } => {
                for o in &observers.heartbeat {
                    o.on_heartbeat_sent(session_id, sequence);
                }
            }
            SessionEvent::HeartbeatAcked {
                session_id, rtt, ..
            } => {
                for o in &observers.heartbeat {
                    o.on_heartbeat_acked(session_id, rtt);
                }
            }
            SessionEvent::HeartbeatTimeout {
                session_id,
                consecutive_losses,
                ..
            } => {
                for o in &observers.heartbeat {
                    o.on_heartbeat_timeout(session_id, consecutive_losses);
                }
            }
            SessionEvent::SequenceWarning {
                session_id,
                category,
                counter,
            } => {
                for o in &observers.heartbeat {
                    o.on_sequence_warning(session_id, category, counter);
                }
            }
            other => debug!(session_id = %other.session_id(), event = ?other, "session event"),
        }
    }
}

impl Drop for NetworkCoordinator {
    fn drop(&mut self) {
        if let Some(task) = self
            .dispatcher
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

async fn dispatch(
    coordinator: Weak<NetworkCoordinator>,
    mut rx: mpsc::UnboundedReceiver<SessionEvent>,
) {
    while let Some(event) = rx.recv().await {
        let Some(this) = coordinator.upgrade() else {
            break;
        };
        this.handle_event(event).await;
    }
    debug!("event dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{FailureReason, InboundMessage};
    use crate::reconnect::ReconnectConfig;
    use crate::transport::TcpTransport;
    use imlink_wire::{
        decode, decode_tlv, encode, MessageType, PacketHeader, TagPolicy, DEFAULT_MAX_DEPTH,
        HEADER_SIZE,
    };
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn read_frame(peer: &mut TcpStream) -> (PacketHeader, Bytes) {
        let mut header = [0u8; HEADER_SIZE];
        peer.read_exact(&mut header).await.unwrap();
        let len = u32::from_be_bytes([header[20], header[21], header[22], header[23]]) as usize;
        let mut frame = header.to_vec();
        frame.resize(HEADER_SIZE + len, 0);
        peer.read_exact(&mut frame[HEADER_SIZE..]).await.unwrap();
        decode(&Bytes::from(frame)).unwrap()
    }

    async fn eventually<F: Fn() -> bool>(check: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap()
    }

    #[derive(Debug, Default)]
    struct Recorder {
        log: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn contains(&self, entry: &str) -> bool {
            self.log.lock().unwrap().iter().any(|e| e == entry)
        }

        fn count(&self, entry: &str) -> usize {
            self.log.lock().unwrap().iter().filter(|e| *e == entry).count()
        }
    }

    impl StateObserver for Recorder {
        fn on_state_changed(&self, _: Uuid, _: SessionType, _: ConnectState, new: ConnectState) {
            self.log.lock().unwrap().push(format!("state:{new}"));
        }
    }

    impl DeliveryObserver for Recorder {
        fn on_acked(&self, _: Uuid, message_id: &str, _: Option<Duration>) {
            self.log.lock().unwrap().push(format!("acked:{message_id}"));
        }

        fn on_failed(&self, _: Uuid, message_id: &str, reason: &FailureReason) {
            self.log.lock().unwrap().push(format!("failed:{message_id}:{reason:?}"));
        }
    }

    impl MessageObserver for Recorder {
        fn on_message(&self, message: &InboundMessage) {
            let text = String::from_utf8_lossy(&message.payload).into_owned();
            self.log.lock().unwrap().push(format!("message:{text}"));
        }
    }

    fn fast_config() -> CoordinatorConfig {
        let mut config = CoordinatorConfig::default();
        config.session.reconnect = ReconnectConfig {
            max_attempts: 5,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
        };
        config
    }

    async fn start() -> Arc<NetworkCoordinator> {
        NetworkCoordinator::start(fast_config(), Arc::new(TcpTransport)).await
    }

    #[tokio::test]
    async fn test_send_through_type_and_ack() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let coordinator = start().await;
        let recorder = Arc::new(Recorder::default());
        coordinator.add_state_observer(recorder.clone());
        coordinator.add_delivery_observer(recorder.clone());
        coordinator.add_message_observer(recorder.clone());

        let id = coordinator
            .connect(SessionType::Chat, "127.0.0.1", port)
            .await
            .unwrap();
        assert_eq!(coordinator.session_for_type(SessionType::Chat), Some(id));
        let (mut peer, _) = listener.accept().await.unwrap();
        read_frame(&mut peer).await;

        let (message_id, seq) = coordinator
            .send_through_type(SessionType::Chat, Bytes::from_static(b"hi"), SendOptions::default())
            .await
            .unwrap();
        let (header, body) = read_frame(&mut peer).await;
        assert_eq!(&body[..], b"hi");
        let ack_header = PacketHeader::new(MessageType::Ack, seq, header.session_id);
        let ack = encode(&ack_header, b"").unwrap();
        peer.write_all(&ack).await.unwrap();

        let expected = format!("acked:{message_id}");
        eventually(|| recorder.contains(&expected)).await;

        let ping = encode(&PacketHeader::new(MessageType::Normal, 1, 0), b"ping").unwrap();
        peer.write_all(&ping).await.unwrap();
        let (ack, _) = read_frame(&mut peer).await;
        assert_eq!((ack.msg_type, ack.sequence), (MessageType::Ack, 1));
        eventually(|| recorder.contains("message:ping")).await;
        assert!(recorder.contains("state:connected"));
        assert!(coordinator.is_connected(SessionType::Chat).await);
        assert_eq!(
            coordinator.all_connection_states().get(&SessionType::Chat),
            Some(&ConnectState::Connected)
        );
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_auto_route() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let coordinator = start().await;
        coordinator
            .connect(SessionType::Chat, "127.0.0.1", port)
            .await
            .unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();
        read_frame(&mut peer).await;

        coordinator.send_text("hello").await.unwrap();
        let (_, body) = read_frame(&mut peer).await;
        let fields = decode_tlv(&body, TagPolicy::default(), DEFAULT_MAX_DEPTH).unwrap();
        assert!(fields.contains_key(&ContentType::Text.tag()));

        let err = coordinator
            .send_with_auto_route(
                ContentType::Audio,
                Bytes::from_static(b"a"),
                SendOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::NoSessionForType(SessionType::Media));

        coordinator
            .configure_routing(ContentType::Audio, SessionType::Chat)
            .await;
        coordinator
            .send_with_auto_route(
                ContentType::Audio,
                Bytes::from_static(b"a"),
                SendOptions::default(),
            )
            .await
            .unwrap();
        let (_, body) = read_frame(&mut peer).await;
        assert_eq!(&body[..], b"a");
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_unrouted_content_and_unknown_session() {
        let coordinator = NetworkCoordinator::start(
            CoordinatorConfig {
                routes: HashMap::new(),
                ..fast_config()
            },
            Arc::new(TcpTransport),
        )
        .await;
        let err = coordinator.send_text("x").await.unwrap_err();
        assert_eq!(err, SessionError::NoRoute(ContentType::Text));

        let unknown = Uuid::new_v4();
        let err = coordinator
            .send(unknown, Bytes::new(), SendOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::UnknownSession(unknown));
        assert_eq!(
            coordinator.connection_state(SessionType::Media).await,
            ConnectState::Disconnected
        );
    }

    #[tokio::test]
    async fn test_peer_drop_triggers_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let coordinator = start().await;
        let recorder = Arc::new(Recorder::default());
        coordinator.add_state_observer(recorder.clone());

        coordinator
            .connect(SessionType::Signaling, "127.0.0.1", port)
            .await
            .unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();
        read_frame(&mut peer).await;
        drop(peer);

        let (mut peer, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        let (hello, _) = read_frame(&mut peer).await;
        assert_eq!(hello.msg_type, MessageType::Control);
        eventually(|| recorder.count("state:connected") == 2).await;
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_disconnect_type_returns_session_to_pool() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let coordinator = start().await;

        let first = coordinator
            .connect(SessionType::Chat, "127.0.0.1", port)
            .await
            .unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();
        read_frame(&mut peer).await;

        coordinator.disconnect_type(SessionType::Chat).await.unwrap();
        assert_eq!(coordinator.session_for_type(SessionType::Chat), None);
        assert_eq!(coordinator.pool().pooled_count(SessionType::Chat).await, 1);

        let second = coordinator
            .connect(SessionType::Chat, "127.0.0.1", port)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(coordinator.snapshot(second).await.unwrap().use_count, 2);

        coordinator.remove_session(second).await.unwrap();
        assert!(coordinator.session_ids().is_empty());
        assert_eq!(coordinator.pool().pooled_count(SessionType::Chat).await, 0);
    }

    async fn send_unacked(
        coordinator: &NetworkCoordinator,
        peer: &mut TcpStream,
        session_type: SessionType,
        body: &'static [u8],
    ) -> String {
        let (message_id, _) = coordinator
            .send_through_type(session_type, Bytes::from_static(body), SendOptions::default())
            .await
            .unwrap();
        read_frame(peer).await;
        message_id
    }

    #[tokio::test]
    async fn test_removed_session_reports_in_flight_failures() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let coordinator = start().await;
        let recorder = Arc::new(Recorder::default());
        coordinator.add_delivery_observer(recorder.clone());

        let id = coordinator
            .connect(SessionType::Chat, "127.0.0.1", port)
            .await
            .unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();
        read_frame(&mut peer).await;
        let first = send_unacked(&coordinator, &mut peer, SessionType::Chat, b"one").await;
        let second = send_unacked(&coordinator, &mut peer, SessionType::Chat, b"two").await;

        coordinator.remove_session(id).await.unwrap();
        for message_id in [first, second] {
            let expected = format!("failed:{message_id}:SessionClosed");
            eventually(|| recorder.contains(&expected)).await;
        }
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_exhausted_reconnect_reports_in_flight_failures() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut config = fast_config();
        config.session.reconnect.max_attempts = 1;
        let coordinator = NetworkCoordinator::start(config, Arc::new(TcpTransport)).await;
        let recorder = Arc::new(Recorder::default());
        coordinator.add_delivery_observer(recorder.clone());

        coordinator
            .connect(SessionType::Signaling, "127.0.0.1", port)
            .await
            .unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();
        read_frame(&mut peer).await;
        let message_id =
            send_unacked(&coordinator, &mut peer, SessionType::Signaling, b"stranded").await;

        drop(listener);
        drop(peer);
        let expected = format!("failed:{message_id}:SessionClosed");
        eventually(|| recorder.contains(&expected)).await;
        assert_eq!(
            coordinator.connection_state(SessionType::Signaling).await,
            ConnectState::Disconnected
        );
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_shared_handle_is_retired_on_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let coordinator = start().await;
        let recorder = Arc::new(Recorder::default());
        coordinator.add_delivery_observer(recorder.clone());

        let id = coordinator
            .connect(SessionType::Chat, "127.0.0.1", port)
            .await
            .unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();
        read_frame(&mut peer).await;
        let message_id = send_unacked(&coordinator, &mut peer, SessionType::Chat, b"held").await;
        let held = coordinator
            .sessions
            .get(&id)
            .map(|entry| entry.value().clone())
            .unwrap();

        coordinator.disconnect_type(SessionType::Chat).await.unwrap();
        assert_eq!(coordinator.session_for_type(SessionType::Chat), None);
        assert_eq!(coordinator.pool().pooled_count(SessionType::Chat).await, 0);
        assert_eq!(coordinator.pool().stats().await.active, 0);
        assert_eq!(held.handle.state().await.unwrap(), ConnectState::Disconnected);

        let expected = format!("failed:{message_id}:SessionClosed");
        eventually(|| recorder.contains(&expected)).await;
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_route_inbound_reaches_parser() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let coordinator = start().await;
        let recorder = Arc::new(Recorder::default());
        coordinator.add_message_observer(recorder.clone());

        let id = coordinator
            .connect(SessionType::Media, "127.0.0.1", port)
            .await
            .unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();
        read_frame(&mut peer).await;

        let header = PacketHeader::new(MessageType::Normal, 42, 0);
        let frame = encode(&header, b"relayed").unwrap();
        coordinator
            .route_inbound(id, frame.slice(..10))
            .await
            .unwrap();
        coordinator.route_inbound(id, frame.slice(10..)).await.unwrap();

        let (ack, _) = read_frame(&mut peer).await;
        assert_eq!((ack.msg_type, ack.sequence), (MessageType::Ack, 42));
        eventually(|| recorder.contains("message:relayed")).await;

        let err = coordinator
            .route_inbound(Uuid::new_v4(), Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::UnknownSession(_)));
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_unavailable_network_defers_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let coordinator = start().await;
        coordinator
            .connect(SessionType::Chat, "127.0.0.1", port)
            .await
            .unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();
        read_frame(&mut peer).await;

        coordinator.network_did_become_unavailable().await;
        drop(peer);
        eventually(|| {
            coordinator.all_connection_states().get(&SessionType::Chat)
                == Some(&ConnectState::Disconnected)
        })
        .await;
        let no_reconnect =
            tokio::time::timeout(Duration::from_millis(300), listener.accept()).await;
        assert!(no_reconnect.is_err());

        coordinator.network_did_become_available().await;
        let (mut peer, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        read_frame(&mut peer).await;
        coordinator.shutdown().await;
    }
}
