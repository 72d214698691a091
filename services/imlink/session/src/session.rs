//! A single client session, independent of any socket.
//!
//! `Session` binds the connection state machine, sequence allocator, pending
//! message table, frame parser, heartbeat controller and reconnect policy for
//! one logical connection. It performs no I/O: callers feed it transport
//! events and write out the frames it returns. [`crate::actor`] drives it on a
//! tokio task; the pool moves it by value between uses.

use bytes::Bytes;
use imlink_wire::{
    Features, FrameBuilder, FrameParser, Handshake, MessageType, ParsedPacket, ParserConfig,
    ProtocolVersion, TransformRegistry, WireError,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SessionError;
use crate::events::{DisconnectReason, EventSink, FailureReason, InboundMessage, SessionEvent};
use crate::heartbeat::{
    HeartbeatConfig, HeartbeatController, HeartbeatMode, HeartbeatVerdict, NetworkSample,
};
use crate::message::{MessageContext, MessageState, PendingTable, RetryConfig, SendOptions};
use crate::reconnect::{ReconnectConfig, ReconnectPolicy, ScheduledAttempt};
use crate::sequence::{MessageCategory, SequenceConfig, SequenceManager};
use crate::state::{ConnectEvent, ConnectState, ConnectStateMachine};
use crate::transport::TlsSettings;

/// Inbound sequences remembered for duplicate suppression
pub const RECENT_INBOUND_WINDOW: usize = 1024;

/// Default connect deadline
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default period of the retry sweep
pub const DEFAULT_RETRY_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Logical channel a session serves
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    /// General purpose
    #[default]
    Default = 0,
    /// Chat messages
    Chat = 1,
    /// Media transfer
    Media = 2,
    /// Call signaling
    Signaling = 3,
}

impl SessionType {
    /// Every session type
    pub const ALL: [SessionType; 4] = [
        SessionType::Default,
        SessionType::Chat,
        SessionType::Media,
        SessionType::Signaling,
    ];
}

impl TryFrom<u8> for SessionType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SessionType::Default),
            1 => Ok(SessionType::Chat),
            2 => Ok(SessionType::Media),
            3 => Ok(SessionType::Signaling),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for SessionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionType::Default => "default",
            SessionType::Chat => "chat",
            SessionType::Media => "media",
            SessionType::Signaling => "signaling",
        };
        f.write_str(s)
    }
}

/// Configuration for one session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Channel this session serves
    pub session_type: SessionType,
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Upgrade the connection to TLS after connect
    pub use_tls: bool,
    /// TLS material when `use_tls` is set
    pub tls: TlsSettings,
    /// Ask for reconnects after recoverable losses
    pub auto_reconnect: bool,
    /// Deadline for connect (and TLS handshake)
    pub connect_timeout: Duration,
    /// Features offered in the handshake
    pub features: Features,
    /// Period of the retry sweep
    pub retry_sweep_interval: Duration,
    /// Heartbeat tuning
    pub heartbeat: HeartbeatConfig,
    /// Reconnect backoff
    pub reconnect: ReconnectConfig,
    /// Message retry policy
    pub retry: RetryConfig,
    /// Sequence thresholds
    pub sequence: SequenceConfig,
    /// Inbound parser settings
    pub parser: ParserConfig,
    /// Body transforms for both directions
    pub registry: TransformRegistry,
}

impl SessionConfig {
    /// Defaults for `session_type` against `host:port`
    pub fn new(session_type: SessionType, host: impl Into<String>, port: u16) -> Self {
        Self {
            session_type,
            host: host.into(),
            port,
            ..Default::default()
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_type: SessionType::Default,
            host: "127.0.0.1".to_string(),
            port: 0,
            use_tls: false,
            tls: TlsSettings::default(),
            auto_reconnect: true,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            features: Features::default(),
            retry_sweep_interval: DEFAULT_RETRY_SWEEP_INTERVAL,
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
            retry: RetryConfig::default(),
            sequence: SequenceConfig::default(),
            parser: ParserConfig::default(),
            registry: TransformRegistry::new(),
        }
    }
}

/// Statistics for a session
#[derive(Clone, Debug, Default, Serialize)]
pub struct SessionStats {
    /// Total bytes received
    pub bytes_in: u64,
    /// Total bytes sent
    pub bytes_out: u64,
    /// Number of frames received
    pub frames_received: u64,
    /// Number of frames sent
    pub frames_sent: u64,
    /// Messages acknowledged
    pub messages_acked: u64,
    /// Messages abandoned
    pub messages_failed: u64,
    /// Most recent heartbeat RTT
    pub last_rtt: Option<Duration>,
}

/// Read-only view of a session for status reporting
#[derive(Clone, Debug, Serialize)]
pub struct SessionSnapshot {
    /// Session id
    pub id: Uuid,
    /// Session type
    pub session_type: SessionType,
    /// Connection state
    pub state: ConnectState,
    /// Messages awaiting an ACK
    pub pending: usize,
    /// Times the session was handed out by the pool
    pub use_count: u32,
    /// Heartbeat mode
    pub heartbeat_mode: HeartbeatMode,
    /// Current heartbeat interval
    pub heartbeat_interval: Duration,
    /// Negotiated protocol version
    pub version: Option<ProtocolVersion>,
    /// Counters
    pub stats: SessionStats,
}

/// Frames and verdicts produced by one batch of inbound bytes
#[derive(Debug, Default)]
pub struct InboundOutcome {
    /// Frames to write back (ACKs)
    pub replies: Vec<Bytes>,
    /// Set when the connection must be dropped
    pub fatal: Option<WireError>,
}

/// Result of one heartbeat timer tick
#[derive(Debug, Default)]
pub struct HeartbeatTick {
    /// Heartbeat to write: (sequence, frame)
    pub frame: Option<(u32, Bytes)>,
    /// Loss threshold reached
    pub dead: bool,
}

/// A session and everything it owns
pub struct Session {
    id: Uuid,
    short_id: u16,
    config: SessionConfig,
    state: ConnectStateMachine,
    sequences: SequenceManager,
    reconnect: ReconnectPolicy,
    heartbeat: HeartbeatController,
    pending: PendingTable,
    parser: FrameParser,
    events: EventSink,
    negotiated: Option<Handshake>,
    recent_inbound: VecDeque<u32>,
    recent_set: HashSet<u32>,
    disconnect_reason: DisconnectReason,
    network_available: bool,
    generation: u64,
    created_at: Instant,
    last_active: Instant,
    use_count: u32,
    stats: SessionStats,
}

impl Session {
    /// Create a disconnected session
    pub fn new(config: SessionConfig) -> Self {
        let id = Uuid::new_v4();
        let now = Instant::now();
        let mut session = Self {
            id,
            short_id: imlink_wire::session_id_from_uuid(id.as_bytes()),
            state: ConnectStateMachine::new(),
            sequences: SequenceManager::new(config.sequence),
            reconnect: ReconnectPolicy::new(config.reconnect),
            heartbeat: HeartbeatController::new(config.heartbeat),
            pending: PendingTable::new(),
            parser: FrameParser::with_registry(config.parser.clone(), config.registry.clone()),
            events: EventSink::discard(),
            negotiated: None,
            recent_inbound: VecDeque::with_capacity(RECENT_INBOUND_WINDOW),
            recent_set: HashSet::with_capacity(RECENT_INBOUND_WINDOW),
            disconnect_reason: DisconnectReason::None,
            network_available: true,
            generation: 0,
            created_at: now,
            last_active: now,
            use_count: 0,
            stats: SessionStats::default(),
            config,
        };
        session.install_handlers();
        session
    }

    /// Route notifications to `sink`
    pub fn set_event_sink(&mut self, sink: EventSink) {
        self.events = sink;
        self.install_handlers();
    }

    fn install_handlers(&mut self) {
        let (id, session_type) = (self.id, self.config.session_type);

        let sink = self.events.clone();
        self.state
            .set_state_change_handler(Box::new(move |old, new| {
                sink.emit(SessionEvent::StateChanged {
                    session_id: id,
                    session_type,
                    old,
                    new,
                })
            }));

        let sink = self.events.clone();
        self.sequences.set_reset_handler(Box::new(move |category| {
            sink.emit(SessionEvent::SequenceReset {
                session_id: id,
                category,
            })
        }));

        let sink = self.events.clone();
        self.sequences
            .set_warning_handler(Box::new(move |category, counter| {
                sink.emit(SessionEvent::SequenceWarning {
                    session_id: id,
                    category,
                    counter,
                })
            }));

        let sink = self.events.clone();
        self.reconnect
            .set_max_attempts_handler(Box::new(move |attempts| {
                sink.emit(SessionEvent::ReconnectExhausted {
                    session_id: id,
                    attempts,
                })
            }));
    }

    /// Session id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// 16-bit id carried in frame headers
    pub fn short_id(&self) -> u16 {
        self.short_id
    }

    /// Session type
    pub fn session_type(&self) -> SessionType {
        self.config.session_type
    }

    /// Configuration
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Connection state
    pub fn state(&self) -> ConnectState {
        self.state.state()
    }

    /// Whether the session can send
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectState::Connected
    }

    /// Connect-attempt token; results carrying an older one are stale
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Sequence allocator
    pub fn sequences(&self) -> &SequenceManager {
        &self.sequences
    }

    /// Pending outbound messages
    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    /// Number of messages awaiting an ACK
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Heartbeat controller
    pub fn heartbeat(&self) -> &HeartbeatController {
        &self.heartbeat
    }

    /// Reconnect policy
    pub fn reconnect(&self) -> &ReconnectPolicy {
        &self.reconnect
    }

    /// Handshake agreed with the peer on the current connection
    pub fn negotiated(&self) -> Option<&Handshake> {
        self.negotiated.as_ref()
    }

    /// Why the last connection ended
    pub fn disconnect_reason(&self) -> DisconnectReason {
        self.disconnect_reason
    }

    /// Counters
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// When the session was created
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Last acquire, release or traffic
    pub fn last_active(&self) -> Instant {
        self.last_active
    }

    /// Times handed out by the pool
    pub fn use_count(&self) -> u32 {
        self.use_count
    }

    /// Status view
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            session_type: self.config.session_type,
            state: self.state(),
            pending: self.pending.len(),
            use_count: self.use_count,
            heartbeat_mode: self.heartbeat.mode(),
            heartbeat_interval: self.heartbeat.current_interval(),
            version: self.negotiated.map(|h| h.version),
            stats: self.stats.clone(),
        }
    }

    /// Enter `Connecting`. Returns the token the connect result must carry.
    pub fn begin_connect(&mut self, reconnecting: bool) -> Result<u64, SessionError> {
        let event = if reconnecting {
            ConnectEvent::Reconnect
        } else {
            ConnectEvent::Connect
        };
        self.state.send_event(event)?;
        self.generation += 1;
        info!(
            session_id = %self.id,
            session_type = %self.config.session_type,
            host = %self.config.host,
            port = self.config.port,
            reconnecting,
            "connecting"
        );
        Ok(self.generation)
    }

    /// Transport is up. Returns the handshake followed by every message still
    /// awaiting an ACK from before the loss.
    pub fn connection_established(&mut self, now: Instant) -> Result<Vec<Bytes>, SessionError> {
        self.state.send_event(ConnectEvent::ConnectSuccess)?;
        self.reconnect.reset();
        self.disconnect_reason = DisconnectReason::None;
        self.negotiated = None;
        self.parser.reset();
        self.heartbeat.start(now);
        self.last_active = now;

        let seq = self.sequences.next_sequence(MessageCategory::Control);
        let hello = Handshake {
            version: ProtocolVersion::CURRENT,
            features: self.config.features,
        };
        let mut frames = vec![FrameBuilder::new(MessageType::Control, seq, self.short_id)
            .body(hello.to_body())
            .build(&self.config.registry)?];

        let replay = self.pending.replay(now, &self.config.registry);
        if !replay.is_empty() {
            info!(session_id = %self.id, count = replay.len(), "replaying unacknowledged messages");
        }
        frames.extend(replay);

        info!(session_id = %self.id, session_type = %self.config.session_type, "connected");
        Ok(frames)
    }

    /// Connect attempt failed. Returns whether a reconnect should be scheduled.
    pub fn connection_failed(&mut self, reason: DisconnectReason) -> bool {
        if self.state.can_handle_event(ConnectEvent::ConnectFailure) {
            let _ = self.state.send_event(ConnectEvent::ConnectFailure);
        } else {
            self.state.force_state(ConnectState::Disconnected);
        }
        warn!(session_id = %self.id, ?reason, "connect failed");
        self.teardown(reason)
    }

    /// Established connection broke. Returns whether a reconnect should be scheduled.
    pub fn connection_lost(&mut self, reason: DisconnectReason) -> bool {
        if self.state() == ConnectState::Connected {
            let _ = self.state.send_event(ConnectEvent::NetworkError);
        }
        if self.state() == ConnectState::Disconnecting {
            let _ = self.state.send_event(ConnectEvent::DisconnectComplete);
        } else {
            self.state.force_state(ConnectState::Disconnected);
        }
        warn!(session_id = %self.id, ?reason, pending = self.pending.len(), "connection lost");
        self.teardown(reason)
    }

    fn teardown(&mut self, reason: DisconnectReason) -> bool {
        self.heartbeat.stop();
        self.parser.reset();
        self.disconnect_reason = reason;
        self.events.emit(SessionEvent::Disconnected {
            session_id: self.id,
            session_type: self.config.session_type,
            reason,
        });
        if self.is_final(reason) {
            self.abandon_pending();
            return false;
        }
        self.request_reconnect(reason)
    }

    /// No reconnect can follow this loss, whatever reachability does later
    fn is_final(&self, reason: DisconnectReason) -> bool {
        !self.config.auto_reconnect || !reason.is_recoverable() || self.reconnect.is_exhausted()
    }

    /// Fail every pending message with `SessionClosed`
    pub fn abandon_pending(&mut self) {
        for ctx in self.pending.clear() {
            self.report_failure(ctx, FailureReason::SessionClosed);
        }
    }

    fn request_reconnect(&mut self, reason: DisconnectReason) -> bool {
        if !self.config.auto_reconnect
            || !self.network_available
            || !reason.is_recoverable()
            || self.reconnect.is_exhausted()
        {
            return false;
        }
        self.events.emit(SessionEvent::NeedsReconnect {
            session_id: self.id,
            session_type: self.config.session_type,
            reason,
        });
        true
    }

    /// Hand `attempt` to the reconnect policy. It runs after the backoff delay
    /// with the policy generation it was scheduled under.
    pub fn schedule_reconnect<F, Fut>(&mut self, attempt: F) -> Option<ScheduledAttempt>
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        if self.state() != ConnectState::Disconnected || !self.network_available {
            return None;
        }
        let Some(scheduled) = self.reconnect.attempt_connection(attempt) else {
            if self.reconnect.is_exhausted() {
                self.abandon_pending();
            }
            return None;
        };
        self.events.emit(SessionEvent::ReconnectScheduled {
            session_id: self.id,
            attempt: scheduled.attempt,
            delay: scheduled.delay,
        });
        Some(scheduled)
    }

    /// Whether a reconnect token is still live
    pub fn is_reconnect_current(&self, generation: u64) -> bool {
        self.reconnect.is_current(generation)
    }

    /// Sequence and frame an outbound message. Returns (message id, sequence, frame).
    pub fn prepare_send(
        &mut self,
        payload: Bytes,
        options: SendOptions,
    ) -> Result<(String, u32, Bytes), SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected(self.state()));
        }

        let category = options.category.unwrap_or(MessageCategory::Normal);
        let (seq, wrapped) = self.sequences.allocate(category);
        if wrapped {
            self.flush_category(category);
        }
        let builder = FrameBuilder::new(MessageType::Normal, seq, self.short_id)
            .encrypt(options.encrypt)
            .compress(options.compress);
        let header = *builder.header();
        let frame = builder.body(payload.clone()).build(&self.config.registry)?;

        let mut ctx = MessageContext::new(
            self.id,
            header,
            category,
            payload,
            options.priority,
            self.config.retry,
        );
        ctx.transition(MessageState::Sending)?;
        let id = ctx.id.clone();
        self.pending.insert(ctx)?;
        debug!(session_id = %self.id, message_id = %id, seq, "message prepared");
        Ok((id, seq, frame))
    }

    /// The counter for `category` wrapped; nothing pending may keep an old
    /// sequence that the new cycle will hand out again
    fn flush_category(&mut self, category: MessageCategory) {
        let flushed = self.pending.drain_category(category);
        if !flushed.is_empty() {
            warn!(
                session_id = %self.id,
                ?category,
                count = flushed.len(),
                "failing messages across sequence reset"
            );
        }
        for ctx in flushed {
            self.report_failure(ctx, FailureReason::SequenceReset);
        }
    }

    /// First write of `message_id` completed
    pub fn mark_sent(&mut self, message_id: &str, now: Instant) -> Result<(), SessionError> {
        self.pending.mark_sent(message_id, now)?;
        self.last_active = now;
        let sequence = self
            .pending
            .get(message_id)
            .map(|ctx| ctx.sequence)
            .unwrap_or_default();
        self.events.emit(SessionEvent::MessageSent {
            session_id: self.id,
            message_id: message_id.to_string(),
            sequence,
        });
        Ok(())
    }

    /// First write of `message_id` failed; the message is abandoned
    pub fn mark_send_failed(&mut self, message_id: &str, error: String) {
        if let Ok(ctx) = self.pending.fail(message_id) {
            self.report_failure(ctx, FailureReason::SendFailed(error));
        }
    }

    fn report_failure(&mut self, ctx: MessageContext, reason: FailureReason) {
        self.stats.messages_failed += 1;
        warn!(
            session_id = %self.id,
            message_id = %ctx.id,
            seq = ctx.sequence,
            retries = ctx.retry_count,
            ?reason,
            "message failed"
        );
        self.events.emit(SessionEvent::MessageFailed {
            session_id: self.id,
            message_id: ctx.id,
            sequence: ctx.sequence,
            reason,
        });
    }

    /// Count bytes written by the transport
    pub fn record_outbound(&mut self, bytes: usize) {
        self.stats.bytes_out += bytes as u64;
        self.stats.frames_sent += 1;
    }

    /// Feed bytes in arrival order and dispatch every complete frame
    pub fn handle_bytes(&mut self, data: &[u8], now: Instant) -> InboundOutcome {
        let mut outcome = InboundOutcome::default();
        self.stats.bytes_in += data.len() as u64;

        let mut offset = 0;
        loop {
            let consumed = self.parser.feed(&data[offset..]);
            offset += consumed;

            let mut progressed = false;
            loop {
                match self.parser.next_packet() {
                    Ok(Some(packet)) => {
                        progressed = true;
                        self.handle_packet(packet, now, &mut outcome);
                        if outcome.fatal.is_some() {
                            return outcome;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        progressed = true;
                        self.protocol_error(&e);
                        if e.is_fatal_to_connection() {
                            outcome.fatal = Some(e);
                            return outcome;
                        }
                        break;
                    }
                }
            }

            if offset >= data.len() {
                break;
            }
            if consumed == 0 && !progressed {
                self.protocol_error(&WireError::BufferOverflow(data.len() - offset));
            }
        }
        outcome
    }

    fn protocol_error(&mut self, error: &WireError) {
        warn!(session_id = %self.id, error = %error, "protocol error, resetting parser");
        self.parser.reset();
        self.events.emit(SessionEvent::ProtocolError {
            session_id: self.id,
            error: error.to_string(),
        });
    }

    fn handle_packet(&mut self, packet: ParsedPacket, now: Instant, outcome: &mut InboundOutcome) {
        let seq = packet.header.sequence;
        self.stats.frames_received += 1;
        self.last_active = now;

        match packet.header.msg_type {
            MessageType::Ack => self.handle_ack(seq, now),
            MessageType::Heartbeat => match self.heartbeat.heartbeat_acknowledged(seq, now) {
                Some(rtt) => self.heartbeat_acked(seq, rtt),
                None => debug!(session_id = %self.id, seq, "unsolicited heartbeat"),
            },
            MessageType::Control => {
                self.push_ack(seq, outcome);
                let Some(handshake) = packet.tlv.as_ref().and_then(Handshake::from_tlv) else {
                    debug!(session_id = %self.id, seq, "control frame without handshake");
                    return;
                };
                match ProtocolVersion::CURRENT.negotiate(handshake.version) {
                    Ok(version) => {
                        let features = self.config.features & handshake.features;
                        self.negotiated = Some(Handshake { version, features });
                        info!(session_id = %self.id, %version, ?features, "version negotiated");
                        self.events.emit(SessionEvent::VersionNegotiated {
                            session_id: self.id,
                            version,
                            features,
                        });
                    }
                    Err(e) => {
                        self.protocol_error(&e);
                        outcome.fatal = Some(e);
                    }
                }
            }
            MessageType::Normal => {
                self.push_ack(seq, outcome);
                if !self.remember_inbound(seq) {
                    debug!(session_id = %self.id, seq, "duplicate inbound message");
                    return;
                }
                if let Some(e) = packet.tlv_error {
                    debug!(session_id = %self.id, seq, error = %e, "delivering body as opaque");
                }
                self.events.emit(SessionEvent::MessageReceived(InboundMessage {
                    session_id: self.id,
                    session_type: self.config.session_type,
                    sequence: seq,
                    msg_type: packet.header.msg_type,
                    payload: packet.payload,
                    tlv: packet.tlv,
                }));
            }
        }
    }

    fn handle_ack(&mut self, seq: u32, now: Instant) {
        if let Some(ctx) = self.pending.ack(seq, now) {
            let rtt = ctx.sent_at.map(|sent| now.saturating_duration_since(sent));
            self.stats.messages_acked += 1;
            debug!(session_id = %self.id, message_id = %ctx.id, seq, "message acked");
            self.events.emit(SessionEvent::MessageAcked {
                session_id: self.id,
                message_id: ctx.id,
                sequence: seq,
                rtt,
            });
        } else if let Some(rtt) = self.heartbeat.heartbeat_acknowledged(seq, now) {
            self.heartbeat_acked(seq, rtt);
        } else {
            debug!(session_id = %self.id, seq, "ack for unknown sequence");
        }
    }

    fn heartbeat_acked(&mut self, seq: u32, rtt: Duration) {
        self.stats.last_rtt = Some(rtt);
        self.events.emit(SessionEvent::HeartbeatAcked {
            session_id: self.id,
            sequence: seq,
            rtt,
        });
    }

    fn push_ack(&mut self, seq: u32, outcome: &mut InboundOutcome) {
        match FrameBuilder::new(MessageType::Ack, seq, self.short_id).build(&self.config.registry) {
            Ok(frame) => outcome.replies.push(frame),
            Err(e) => warn!(session_id = %self.id, seq, error = %e, "ack encoding failed"),
        }
    }

    fn remember_inbound(&mut self, seq: u32) -> bool {
        if !self.recent_set.insert(seq) {
            return false;
        }
        if self.recent_inbound.len() == RECENT_INBOUND_WINDOW {
            if let Some(oldest) = self.recent_inbound.pop_front() {
                self.recent_set.remove(&oldest);
            }
        }
        self.recent_inbound.push_back(seq);
        true
    }

    /// Retransmit or fail overdue messages. Returns frames to write.
    pub fn sweep_retries(&mut self, now: Instant) -> Vec<Bytes> {
        if !self.is_connected() {
            return Vec::new();
        }
        let outcome = self.pending.sweep(now, &self.config.registry);
        for failed in outcome.failed {
            self.report_failure(failed, FailureReason::RetryExhausted);
        }
        outcome
            .retransmits
            .into_iter()
            .map(|r| {
                debug!(
                    session_id = %self.id,
                    seq = r.sequence,
                    attempt = r.attempt,
                    "retransmitting"
                );
                self.events.emit(SessionEvent::MessageRetried {
                    session_id: self.id,
                    message_id: r.message_id,
                    sequence: r.sequence,
                    attempt: r.attempt,
                });
                r.frame
            })
            .collect()
    }

    /// Expire overdue heartbeats and produce the next one when due
    pub fn heartbeat_tick(&mut self, now: Instant) -> HeartbeatTick {
        let mut tick = HeartbeatTick::default();
        if !self.is_connected() {
            return tick;
        }

        for seq in self.heartbeat.expired(now) {
            let verdict = self.heartbeat.handle_heartbeat_timeout(seq);
            if self.heartbeat_verdict(seq, verdict) {
                tick.dead = true;
            }
        }
        if tick.dead {
            return tick;
        }

        if self.heartbeat.is_due(now) {
            self.heartbeat.adjust_interval(now);
            let seq = self.heartbeat.send_heartbeat(&self.sequences, now);
            match FrameBuilder::new(MessageType::Heartbeat, seq, self.short_id)
                .build(&self.config.registry)
            {
                Ok(frame) => {
                    self.events.emit(SessionEvent::HeartbeatSent {
                        session_id: self.id,
                        sequence: seq,
                    });
                    tick.frame = Some((seq, frame));
                }
                Err(e) => {
                    warn!(session_id = %self.id, seq, error = %e, "heartbeat encoding failed");
                    tick.dead = self.heartbeat_send_failed(seq);
                }
            }
        }
        tick
    }

    /// A heartbeat write failed. Returns whether the link is now considered dead.
    pub fn heartbeat_send_failed(&mut self, seq: u32) -> bool {
        let verdict = self.heartbeat.send_heartbeat_failed(seq);
        self.heartbeat_verdict(seq, verdict)
    }

    fn heartbeat_verdict(&mut self, seq: u32, verdict: HeartbeatVerdict) -> bool {
        let (consecutive_losses, dead) = match verdict {
            HeartbeatVerdict::Alive { consecutive_losses } => (consecutive_losses, false),
            HeartbeatVerdict::Dead { consecutive_losses } => (consecutive_losses, true),
        };
        self.events.emit(SessionEvent::HeartbeatTimeout {
            session_id: self.id,
            sequence: seq,
            consecutive_losses,
        });
        dead
    }

    /// Next instant the heartbeat timer must fire
    pub fn next_heartbeat_deadline(&self) -> Option<Instant> {
        if self.is_connected() {
            self.heartbeat.next_deadline()
        } else {
            None
        }
    }

    /// Start an orderly disconnect: `Connected -> Disconnecting`
    pub fn disconnect(&mut self) -> Result<(), SessionError> {
        self.state.send_event(ConnectEvent::Disconnect)?;
        self.disconnect_reason = DisconnectReason::UserInitiated;
        self.reconnect.stop_retrying();
        self.heartbeat.stop();
        info!(session_id = %self.id, "disconnecting");
        Ok(())
    }

    /// Orderly disconnect finished: `Disconnecting -> Disconnected`
    pub fn disconnect_complete(&mut self) {
        if self.state.send_event(ConnectEvent::DisconnectComplete).is_err() {
            return;
        }
        self.parser.reset();
        self.abandon_pending();
        self.events.emit(SessionEvent::Disconnected {
            session_id: self.id,
            session_type: self.config.session_type,
            reason: self.disconnect_reason,
        });
    }

    /// Drop to `Disconnected` from any state and invalidate every timer and
    /// in-flight connect. Pending messages fail with `SessionClosed`.
    pub fn force_disconnect(&mut self, reason: DisconnectReason) {
        self.reconnect.stop_retrying();
        self.heartbeat.stop();
        self.parser.reset();
        self.generation += 1;
        let was = self.state();
        let _ = self.state.send_event(ConnectEvent::ForceDisconnect);
        self.disconnect_reason = reason;
        self.abandon_pending();
        if was != ConnectState::Disconnected {
            info!(session_id = %self.id, ?reason, "force disconnected");
            self.events.emit(SessionEvent::Disconnected {
                session_id: self.id,
                session_type: self.config.session_type,
                reason,
            });
        }
    }

    /// Clear per-use state before the session is pooled. Pending messages
    /// fail with `SessionClosed`; sequence counters carry over.
    pub fn reset_for_reuse(&mut self) {
        self.abandon_pending();
        self.reconnect.reset();
        self.heartbeat.stop();
        self.parser.reset();
        self.state.force_state(ConnectState::Disconnected);
        self.generation += 1;
        self.negotiated = None;
        self.recent_inbound.clear();
        self.recent_set.clear();
        self.disconnect_reason = DisconnectReason::None;
    }

    /// Record a pool hand-out
    pub fn mark_acquired(&mut self, now: Instant) {
        self.use_count += 1;
        self.last_active = now;
    }

    /// Record a return to the pool
    pub fn mark_released(&mut self, now: Instant) {
        self.last_active = now;
    }

    /// Switch heartbeat mode
    pub fn set_heartbeat_mode(&mut self, mode: HeartbeatMode, now: Instant) {
        if self.heartbeat.set_mode(mode, now) {
            self.events.emit(SessionEvent::HeartbeatModeChanged {
                session_id: self.id,
                mode,
                interval: self.heartbeat.current_interval(),
            });
        }
    }

    /// Feed an external RTT/loss sample
    pub fn report_network_sample(&mut self, sample: NetworkSample) {
        self.heartbeat.record_network_sample(sample);
    }

    /// Reachability changed. Returns whether a reconnect should be scheduled.
    pub fn set_network_available(&mut self, available: bool) -> bool {
        let was = self.network_available;
        self.network_available = available;
        if !available {
            self.reconnect.stop_retrying();
            return false;
        }
        if was || self.state() != ConnectState::Disconnected {
            return false;
        }
        if !self.disconnect_reason.is_recoverable() {
            return false;
        }
        self.reconnect.reset();
        self.request_reconnect(self.disconnect_reason)
    }

    /// Whether reachability is currently reported
    pub fn network_available(&self) -> bool {
        self.network_available
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("session_type", &self.config.session_type)
            .field("state", &self.state())
            .field("pending", &self.pending.len())
            .field("use_count", &self.use_count)
            .field("generation", &self.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heartbeat::ModeParams;
    use imlink_wire::{decode, encode, ContentType, PacketHeader, TlvBuilder};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn session_with_events(config: SessionConfig) -> (Session, UnboundedReceiver<SessionEvent>) {
        let (sink, rx) = EventSink::channel();
        let mut session = Session::new(config);
        session.set_event_sink(sink);
        (session, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn connected(config: SessionConfig) -> (Session, UnboundedReceiver<SessionEvent>, Instant) {
        let (mut session, mut rx) = session_with_events(config);
        let now = Instant::now();
        session.begin_connect(false).unwrap();
        session.connection_established(now).unwrap();
        drain(&mut rx);
        (session, rx, now)
    }

    fn peer_frame(msg_type: MessageType, seq: u32, body: &[u8]) -> Bytes {
        encode(&PacketHeader::new(msg_type, seq, 7), body).unwrap()
    }

    #[test]
    fn test_connect_sends_handshake() {
        let (mut session, mut rx) = session_with_events(SessionConfig::default());
        let generation = session.begin_connect(false).unwrap();
        assert_eq!(generation, 1);
        assert_eq!(session.state(), ConnectState::Connecting);

        let frames = session.connection_established(Instant::now()).unwrap();
        assert_eq!(frames.len(), 1);
        let (header, body) = decode(&frames[0]).unwrap();
        assert_eq!(header.msg_type, MessageType::Control);
        assert_eq!(header.session_id, session.short_id());
        let hello = Handshake {
            version: ProtocolVersion::CURRENT,
            features: Features::default(),
        };
        assert_eq!(body, hello.to_body());

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::StateChanged { new: ConnectState::Connected, .. }
        )));
    }

    #[test]
    fn test_send_requires_connection() {
        let mut session = Session::new(SessionConfig::default());
        let err = session
            .prepare_send(Bytes::from_static(b"hi"), SendOptions::default())
            .unwrap_err();
        assert_eq!(err, SessionError::NotConnected(ConnectState::Disconnected));
    }

    #[test]
    fn test_send_and_ack() {
        let (mut session, mut rx, now) = connected(SessionConfig::default());
        let body = TlvBuilder::new().text(ContentType::Text, "hello").build().unwrap();
        let (id, seq, frame) = session.prepare_send(body.clone(), SendOptions::default()).unwrap();
        let (header, decoded) = decode(&frame).unwrap();
        assert_eq!(header.sequence, seq);
        assert_eq!(decoded, body);

        session.mark_sent(&id, now).unwrap();
        assert_eq!(session.pending_count(), 1);

        let later = now + Duration::from_millis(40);
        let outcome = session.handle_bytes(&peer_frame(MessageType::Ack, seq, b""), later);
        assert!(outcome.replies.is_empty());
        assert_eq!(session.pending_count(), 0);

        let events = drain(&mut rx);
        assert!(matches!(
            &events[0],
            SessionEvent::MessageSent { sequence, .. } if *sequence == seq
        ));
        assert!(matches!(
            &events[1],
            SessionEvent::MessageAcked { message_id, rtt: Some(rtt), .. }
                if *message_id == id && *rtt == Duration::from_millis(40)
        ));
    }

    #[test]
    fn test_inbound_is_acked_and_deduplicated() {
        let (mut session, mut rx, now) = connected(SessionConfig::default());
        let frame = peer_frame(MessageType::Normal, 0x0000_0011, b"opaque");

        let first = session.handle_bytes(&frame, now);
        let second = session.handle_bytes(&frame, now);

        for outcome in [&first, &second] {
            assert_eq!(outcome.replies.len(), 1);
            let (header, _) = decode(&outcome.replies[0]).unwrap();
            assert_eq!(header.msg_type, MessageType::Ack);
            assert_eq!(header.sequence, 0x11);
        }
        let received: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::MessageReceived(_)))
            .collect();
        assert_eq!(received.len(), 1);
    }

    #[test]
    fn test_fragmented_inbound() {
        let (mut session, mut rx, now) = connected(SessionConfig::default());
        let frame = peer_frame(MessageType::Normal, 5, b"split across reads");
        let (a, b) = frame.split_at(10);

        assert!(session.handle_bytes(a, now).replies.is_empty());
        assert_eq!(session.handle_bytes(b, now).replies.len(), 1);
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(
                e,
                SessionEvent::MessageReceived(m) if &m.payload[..] == b"split across reads"
            )));
    }

    #[test]
    fn test_bad_magic_resets_parser() {
        let (mut session, mut rx, now) = connected(SessionConfig::default());
        let outcome = session.handle_bytes(&[0u8; 28], now);
        assert!(outcome.fatal.is_none());
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, SessionEvent::ProtocolError { .. })));

        let outcome = session.handle_bytes(&peer_frame(MessageType::Normal, 1, b"ok"), now);
        assert_eq!(outcome.replies.len(), 1);
    }

    #[test]
    fn test_handshake_negotiation() {
        let (mut session, mut rx, now) = connected(SessionConfig {
            features: Features::BASIC | Features::READ_RECEIPT,
            ..Default::default()
        });
        let peer = Handshake {
            version: ProtocolVersion { major: 1, minor: 3 },
            features: Features::BASIC | Features::GROUP_CHAT,
        };
        let hello = peer_frame(MessageType::Control, 0x0200_0001, &peer.to_body());
        let outcome = session.handle_bytes(&hello, now);
        assert!(outcome.fatal.is_none());

        let negotiated = session.negotiated().unwrap();
        assert_eq!(negotiated.version, ProtocolVersion { major: 1, minor: 0 });
        assert_eq!(negotiated.features, Features::BASIC);
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, SessionEvent::VersionNegotiated { .. })));
    }

    #[test]
    fn test_major_version_mismatch_is_fatal() {
        let (mut session, _rx, now) = connected(SessionConfig::default());
        let peer = Handshake {
            version: ProtocolVersion { major: 2, minor: 0 },
            features: Features::BASIC,
        };
        let hello = peer_frame(MessageType::Control, 1, &peer.to_body());
        let outcome = session.handle_bytes(&hello, now);
        assert!(matches!(
            outcome.fatal,
            Some(WireError::VersionUnsupported { major: 2, .. })
        ));
    }

    #[test]
    fn test_heartbeat_loss_declares_dead() {
        let fixed = ModeParams {
            base: Duration::from_secs(30),
            min: Duration::from_secs(30),
            max: Duration::from_secs(30),
        };
        let (mut session, mut rx, start) = connected(SessionConfig {
            heartbeat: HeartbeatConfig {
                foreground: fixed,
                ..Default::default()
            },
            ..Default::default()
        });

        let mut sent = 0;
        let mut dead_at = None;
        for k in 1..=8u64 {
            let tick = session.heartbeat_tick(start + Duration::from_secs(15 * k));
            if tick.frame.is_some() {
                sent += 1;
            }
            if tick.dead {
                dead_at = Some(k);
                break;
            }
        }
        assert_eq!(sent, 3);
        assert_eq!(dead_at, Some(7));
        let timeouts = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::HeartbeatTimeout { .. }))
            .count();
        assert_eq!(timeouts, 3);
    }

    #[test]
    fn test_heartbeat_echo_records_rtt() {
        let (mut session, mut rx, start) = connected(SessionConfig::default());
        let due = session.heartbeat().next_send_at().unwrap();
        let (seq, _) = session.heartbeat_tick(due).frame.unwrap();

        let echo = peer_frame(MessageType::Heartbeat, seq, b"");
        session.handle_bytes(&echo, due + Duration::from_millis(80));
        assert_eq!(session.stats().last_rtt, Some(Duration::from_millis(80)));
        assert!(start < due);
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, SessionEvent::HeartbeatAcked { .. })));
    }

    #[test]
    fn test_connection_lost_requests_reconnect() {
        let (mut session, mut rx, _) = connected(SessionConfig::default());
        assert!(session.connection_lost(DisconnectReason::NetworkError));
        assert_eq!(session.state(), ConnectState::Disconnected);
        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::NeedsReconnect { reason: DisconnectReason::NetworkError, .. }
        )));

        let (mut offline, _rx, _) = connected(SessionConfig::default());
        offline.set_network_available(false);
        assert!(!offline.connection_lost(DisconnectReason::NetworkError));
    }

    #[test]
    fn test_pending_survives_reconnect() {
        let (mut session, _rx, now) = connected(SessionConfig::default());
        let (id, seq, _) = session
            .prepare_send(Bytes::from_static(b"keep"), SendOptions::default())
            .unwrap();
        session.mark_sent(&id, now).unwrap();
        session.connection_lost(DisconnectReason::SocketError);

        session.begin_connect(true).unwrap();
        let frames = session.connection_established(now).unwrap();
        assert_eq!(frames.len(), 2);
        let (header, body) = decode(&frames[1]).unwrap();
        assert_eq!(header.sequence, seq);
        assert_eq!(&body[..], b"keep");
        assert_eq!(session.pending().get(&id).unwrap().retry_count, 0);
    }

    fn failures(events: &[SessionEvent]) -> Vec<FailureReason> {
        events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::MessageFailed { reason, .. } => Some(reason.clone()),
                _ => None,
            })
            .collect()
    }

    fn send_unacked(session: &mut Session, body: &'static [u8], now: Instant) -> (String, u32) {
        let (id, seq, _) = session
            .prepare_send(Bytes::from_static(body), SendOptions::default())
            .unwrap();
        session.mark_sent(&id, now).unwrap();
        (id, seq)
    }

    #[test]
    fn test_sequence_reset_fails_pending_in_category() {
        let config = SessionConfig {
            sequence: SequenceConfig {
                warning_threshold: 2,
                reset_threshold: 3,
            },
            ..SessionConfig::default()
        };
        let (mut session, mut rx, now) = connected(config);

        let seqs: Vec<u32> = (0..5)
            .map(|_| send_unacked(&mut session, b"m", now).1)
            .collect();
        assert_eq!(seqs, vec![1, 2, 1, 2, 1]);
        assert_eq!(session.pending_count(), 1);
        assert_eq!(failures(&drain(&mut rx)), vec![FailureReason::SequenceReset; 4]);

        session.handle_bytes(&peer_frame(MessageType::Ack, 1, b""), now);
        assert_eq!(session.pending_count(), 0);
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, SessionEvent::MessageAcked { sequence: 1, .. })));
    }

    #[test]
    fn test_loss_without_auto_reconnect_fails_pending() {
        let config = SessionConfig {
            auto_reconnect: false,
            ..SessionConfig::default()
        };
        let (mut session, mut rx, now) = connected(config);
        send_unacked(&mut session, b"a", now);
        send_unacked(&mut session, b"b", now);
        drain(&mut rx);

        assert!(!session.connection_lost(DisconnectReason::SocketError));
        assert_eq!(session.pending_count(), 0);
        assert_eq!(failures(&drain(&mut rx)), vec![FailureReason::SessionClosed; 2]);
    }

    #[test]
    fn test_exhausted_reconnect_fails_pending() {
        let config = SessionConfig {
            reconnect: ReconnectConfig {
                max_attempts: 0,
                ..ReconnectConfig::default()
            },
            ..SessionConfig::default()
        };
        let (mut session, mut rx, now) = connected(config);
        send_unacked(&mut session, b"a", now);
        assert!(session.connection_lost(DisconnectReason::SocketError));
        assert_eq!(session.pending_count(), 1);
        drain(&mut rx);

        assert!(session.schedule_reconnect(|_| async {}).is_none());
        assert_eq!(session.pending_count(), 0);
        let events = drain(&mut rx);
        assert_eq!(failures(&events), vec![FailureReason::SessionClosed]);
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::ReconnectExhausted { attempts: 0, .. })));
    }

    #[test]
    fn test_force_disconnect_fails_pending() {
        let (mut session, mut rx, now) = connected(SessionConfig::default());
        send_unacked(&mut session, b"a", now);
        drain(&mut rx);

        session.force_disconnect(DisconnectReason::UserInitiated);
        assert_eq!(session.pending_count(), 0);
        assert_eq!(failures(&drain(&mut rx)), vec![FailureReason::SessionClosed]);
    }

    #[test]
    fn test_reset_for_reuse_keeps_sequences() {
        let (mut session, mut rx, now) = connected(SessionConfig::default());
        let (id, seq, _) = session
            .prepare_send(Bytes::from_static(b"x"), SendOptions::default())
            .unwrap();
        session.mark_sent(&id, now).unwrap();
        drain(&mut rx);

        session.reset_for_reuse();
        assert_eq!(session.pending_count(), 0);
        assert_eq!(session.state(), ConnectState::Disconnected);
        assert_eq!(session.sequences().current_sequence(MessageCategory::Normal), seq);

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::MessageFailed { reason: FailureReason::SessionClosed, .. }
        )));
    }

    #[test]
    fn test_force_disconnect_invalidates_generation() {
        let mut session = Session::new(SessionConfig::default());
        let generation = session.begin_connect(false).unwrap();
        session.force_disconnect(DisconnectReason::UserInitiated);
        assert_ne!(session.generation(), generation);
        assert_eq!(session.state(), ConnectState::Disconnected);
    }

    #[test]
    fn test_orderly_disconnect() {
        let (mut session, mut rx, _) = connected(SessionConfig::default());
        session.disconnect().unwrap();
        assert_eq!(session.state(), ConnectState::Disconnecting);
        session.disconnect_complete();
        assert_eq!(session.state(), ConnectState::Disconnected);
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            SessionEvent::Disconnected { reason: DisconnectReason::UserInitiated, .. }
        )));
    }
}
