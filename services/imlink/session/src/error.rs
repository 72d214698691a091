//! Error types for the session layer.

use imlink_wire::{ContentType, TlvError, WireError};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::message::MessageState;
use crate::state::{ConnectEvent, ConnectState};
use crate::SessionType;

/// Rejected connection state machine event
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateError {
    /// No transition registered for (state, event)
    #[error("invalid transition: {event:?} in state {state:?}")]
    InvalidTransition {
        /// State when the event arrived
        state: ConnectState,
        /// Rejected event
        event: ConnectEvent,
    },
}

/// Rejected message lifecycle step
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    /// Transition not in the message transition table
    #[error("illegal message transition {from:?} -> {to:?}")]
    IllegalTransition {
        /// Current state
        from: MessageState,
        /// Requested state
        to: MessageState,
    },

    /// No pending message with this id
    #[error("unknown message {0}")]
    UnknownMessage(String),

    /// Another pending message already holds this sequence
    #[error("sequence {0:#010x} is already awaiting an ack")]
    DuplicateSequence(u32),
}

/// Transport failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// TCP connect failed
    #[error("connect to {addr} failed: {reason}")]
    Connect {
        /// Target address
        addr: String,
        /// Underlying error
        reason: String,
    },

    /// Read or write failed
    #[error("io: {0}")]
    Io(String),

    /// TLS setup or handshake failed
    #[error("tls: {0}")]
    Tls(String),

    /// Built without the `tls` feature
    #[error("tls support not compiled in")]
    TlsUnavailable,

    /// Connect attempt exceeded its deadline
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    /// Connection already closed
    #[error("connection closed")]
    Closed,
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Session-level failures surfaced to callers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Operation needs a connected session
    #[error("session not connected (state {0:?})")]
    NotConnected(ConnectState),

    /// State machine refused the event
    #[error(transparent)]
    State(#[from] StateError),

    /// Message lifecycle violation
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// Frame encoding failed
    #[error("wire: {0}")]
    Wire(#[from] WireError),

    /// Body encoding failed
    #[error("tlv: {0}")]
    Tlv(#[from] TlvError),

    /// Transport failure
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    /// Session task has exited
    #[error("session task stopped")]
    ActorStopped,

    /// No session registered under this id
    #[error("unknown session {0}")]
    UnknownSession(Uuid),

    /// No session registered for this type
    #[error("no session for type {0:?}")]
    NoSessionForType(SessionType),

    /// Routing table has no entry for this content type
    #[error("no route for content type {0:?}")]
    NoRoute(ContentType),

    /// Session pool refused the request
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Session pool failures
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Pool has been stopped
    #[error("session pool is not running")]
    NotRunning,

    /// Pool for this type is already full
    #[error("pool for {0:?} is full")]
    Full(SessionType),
}
