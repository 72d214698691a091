//! One-way session notifications and the observer traits that consume them.

use bytes::Bytes;
use imlink_wire::{Features, MessageType, ProtocolVersion, TlvMap};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::heartbeat::HeartbeatMode;
use crate::sequence::MessageCategory;
use crate::state::ConnectState;
use crate::SessionType;

/// Why a connection went away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// Not disconnected
    #[default]
    None,
    /// Caller asked for it
    UserInitiated,
    /// Transport failed
    NetworkError,
    /// Heartbeat loss threshold reached
    HeartbeatTimeout,
    /// Idle too long
    IdleTimeout,
    /// Connect did not finish in time
    ConnectionTimeout,
    /// Socket-level error
    SocketError,
    /// App moved to background
    AppBackgrounded,
    /// Reconnect forced by the caller
    ForceReconnect,
    /// Peer violated the protocol
    ProtocolError,
}

impl DisconnectReason {
    /// Whether the reason warrants an automatic reconnect
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            DisconnectReason::NetworkError
                | DisconnectReason::HeartbeatTimeout
                | DisconnectReason::ConnectionTimeout
                | DisconnectReason::SocketError
                | DisconnectReason::ForceReconnect
        )
    }
}

/// Why a message was abandoned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// No ACK after the last retry
    RetryExhausted,
    /// Session was closed or recycled with the message pending
    SessionClosed,
    /// The category's sequence counter wrapped while the message was pending
    SequenceReset,
    /// Transport write failed
    SendFailed(String),
    /// Frame could not be encoded
    Protocol(String),
}

/// A delivered inbound application frame
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Receiving session
    pub session_id: Uuid,
    /// Receiving session type
    pub session_type: SessionType,
    /// Peer sequence
    pub sequence: u32,
    /// Header message type
    pub msg_type: MessageType,
    /// Opened body
    pub payload: Bytes,
    /// Decoded TLV fields, if the body parsed as TLV
    pub tlv: Option<TlvMap>,
}

/// Everything a session reports
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Connection state machine moved
    StateChanged {
        /// Session id
        session_id: Uuid,
        /// Session type
        session_type: SessionType,
        /// Previous state
        old: ConnectState,
        /// New state
        new: ConnectState,
    },
    /// Connection went away
    Disconnected {
        /// Session id
        session_id: Uuid,
        /// Session type
        session_type: SessionType,
        /// Cause
        reason: DisconnectReason,
    },
    /// Handshake completed
    VersionNegotiated {
        /// Session id
        session_id: Uuid,
        /// Agreed version
        version: ProtocolVersion,
        /// Features both sides support
        features: Features,
    },
    /// Message written for the first time
    MessageSent {
        /// Session id
        session_id: Uuid,
        /// Message id
        message_id: String,
        /// Sequence
        sequence: u32,
    },
    /// Message acknowledged
    MessageAcked {
        /// Session id
        session_id: Uuid,
        /// Message id
        message_id: String,
        /// Sequence
        sequence: u32,
        /// Time from last write to ACK
        rtt: Option<Duration>,
    },
    /// Message retransmitted
    MessageRetried {
        /// Session id
        session_id: Uuid,
        /// Message id
        message_id: String,
        /// Sequence
        sequence: u32,
        /// Retry number
        attempt: u32,
    },
    /// Message abandoned
    MessageFailed {
        /// Session id
        session_id: Uuid,
        /// Message id
        message_id: String,
        /// Sequence
        sequence: u32,
        /// Cause
        reason: FailureReason,
    },
    /// Application frame received
    MessageReceived(InboundMessage),
    /// Heartbeat written
    HeartbeatSent {
        /// Session id
        session_id: Uuid,
        /// Heartbeat sequence
        sequence: u32,
    },
    /// Heartbeat echoed
    HeartbeatAcked {
        /// Session id
        session_id: Uuid,
        /// Heartbeat sequence
        sequence: u32,
        /// Round trip
        rtt: Duration,
    },
    /// Heartbeat missed its deadline
    HeartbeatTimeout {
        /// Session id
        session_id: Uuid,
        /// Heartbeat sequence
        sequence: u32,
        /// Losses in a row
        consecutive_losses: u32,
    },
    /// Heartbeat mode switched
    HeartbeatModeChanged {
        /// Session id
        session_id: Uuid,
        /// New mode
        mode: HeartbeatMode,
        /// Interval after the switch
        interval: Duration,
    },
    /// Counter passed the warning threshold
    SequenceWarning {
        /// Session id
        session_id: Uuid,
        /// Category
        category: MessageCategory,
        /// Counter value
        counter: u32,
    },
    /// Counter was reset
    SequenceReset {
        /// Session id
        session_id: Uuid,
        /// Category
        category: MessageCategory,
    },
    /// Session lost its connection and wants a reconnect scheduled
    NeedsReconnect {
        /// Session id
        session_id: Uuid,
        /// Session type
        session_type: SessionType,
        /// Cause
        reason: DisconnectReason,
    },
    /// Reconnect attempt scheduled
    ReconnectScheduled {
        /// Session id
        session_id: Uuid,
        /// Attempt number
        attempt: u32,
        /// Delay before the attempt
        delay: Duration,
    },
    /// Reconnect budget spent
    ReconnectExhausted {
        /// Session id
        session_id: Uuid,
        /// Attempts made
        attempts: u32,
    },
    /// Peer sent something unparseable
    ProtocolError {
        /// Session id
        session_id: Uuid,
        /// Description
        error: String,
    },
}

impl SessionEvent {
    /// Session the event belongs to
    pub fn session_id(&self) -> Uuid {
        match self {
            SessionEvent::StateChanged { session_id, .. }
            | SessionEvent::Disconnected { session_id, .. }
            | SessionEvent::VersionNegotiated { session_id, .. }
            | SessionEvent::MessageSent { session_id, .. }
            | SessionEvent::MessageAcked { session_id, .. }
            | SessionEvent::MessageRetried { session_id, .. }
            | SessionEvent::MessageFailed { session_id, .. }
            | SessionEvent::HeartbeatSent { session_id, .. }
            | SessionEvent::HeartbeatAcked { session_id, .. }
            | SessionEvent::HeartbeatTimeout { session_id, .. }
            | SessionEvent::HeartbeatModeChanged { session_id, .. }
            | SessionEvent::SequenceWarning { session_id, .. }
            | SessionEvent::SequenceReset { session_id, .. }
            | SessionEvent::NeedsReconnect { session_id, .. }
            | SessionEvent::ReconnectScheduled { session_id, .. }
            | SessionEvent::ReconnectExhausted { session_id, .. }
            | SessionEvent::ProtocolError { session_id, .. } => *session_id,
            SessionEvent::MessageReceived(msg) => msg.session_id,
        }
    }
}

/// Non-blocking event publisher; a dropped receiver silently discards events
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl EventSink {
    /// Create a sink and its receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that drops everything
    pub fn discard() -> Self {
        Self { tx: None }
    }

    /// Publish an event
    pub fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::discard()
    }
}

/// Connection state notifications
pub trait StateObserver: Send + Sync + std::fmt::Debug {
    /// State machine moved
    fn on_state_changed(
        &self,
        _session_id: Uuid,
        _session_type: SessionType,
        _old: ConnectState,
        _new: ConnectState,
    ) {
    }

    /// Connection went away
    fn on_disconnected(&self, _session_id: Uuid, _reason: DisconnectReason) {}

    /// Reconnect budget spent
    fn on_reconnect_exhausted(&self, _session_id: Uuid, _attempts: u32) {}
}

/// Delivery notifications for outbound messages
pub trait DeliveryObserver: Send + Sync + std::fmt::Debug {
    /// First write
    fn on_sent(&self, _session_id: Uuid, _message_id: &str, _sequence: u32) {}

    /// ACK received
    fn on_acked(&self, _session_id: Uuid, _message_id: &str, _rtt: Option<Duration>) {}

    /// Retransmitted
    fn on_retried(&self, _session_id: Uuid, _message_id: &str, _attempt: u32) {}

    /// Abandoned
    fn on_failed(&self, _session_id: Uuid, _message_id: &str, _reason: &FailureReason) {}
}

/// Heartbeat notifications
pub trait HeartbeatObserver: Send + Sync + std::fmt::Debug {
    /// Heartbeat written
    fn on_heartbeat_sent(&self, _session_id: Uuid, _sequence: u32) {}

    /// Echo received
    fn on_heartbeat_acked(&self, _session_id: Uuid, _rtt: Duration) {}

    /// Deadline missed
    fn on_heartbeat_timeout(&self, _session_id: Uuid, _consecutive_losses: u32) {}

    /// Sequence counter nearing its reset threshold
    fn on_sequence_warning(&self, _session_id: Uuid, _category: MessageCategory, _counter: u32) {}
}

/// Inbound application messages
pub trait MessageObserver: Send + Sync + std::fmt::Debug {
    /// Frame delivered
    fn on_message(&self, message: &InboundMessage);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sink_delivers_in_order() {
        let (sink, mut rx) = EventSink::channel();
        let id = Uuid::new_v4();
        sink.emit(SessionEvent::HeartbeatSent {
            session_id: id,
            sequence: 1,
        });
        sink.emit(SessionEvent::SequenceReset {
            session_id: id,
            category: MessageCategory::Normal,
        });

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, SessionEvent::HeartbeatSent { sequence: 1, .. }));
        assert_eq!(rx.recv().await.unwrap().session_id(), id);
    }

    #[test]
    fn test_emit_after_receiver_drop_is_silent() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.emit(SessionEvent::ReconnectExhausted {
            session_id: Uuid::nil(),
            attempts: 5,
        });
        EventSink::discard().emit(SessionEvent::ReconnectExhausted {
            session_id: Uuid::nil(),
            attempts: 5,
        });
    }

    #[test]
    fn test_recoverable_reasons() {
        assert!(DisconnectReason::HeartbeatTimeout.is_recoverable());
        assert!(DisconnectReason::NetworkError.is_recoverable());
        assert!(!DisconnectReason::UserInitiated.is_recoverable());
        assert!(!DisconnectReason::ProtocolError.is_recoverable());
    }
}
