//! Client session engine for the imlink protocol.
//!
//! This crate turns the framing in `imlink-wire` into reliable, long-lived
//! client sessions over TCP (optionally TLS):
//!
//! - **Sequencing**: per-category 32-bit sequence numbers with proactive reset
//! - **Delivery**: pending-message table, ACK matching, timed retransmission
//! - **Connection state**: explicit state machine with change notifications
//! - **Reconnect**: exponential backoff with jitter and a bounded attempt budget
//! - **Heartbeat**: mode-aware adaptive interval driven by RTT and loss samples
//! - **Pooling**: per-type reuse of idle sessions
//! - **Coordination**: one session per type, content routing, observer fan-out
//!
//! Each running session is owned by a [`SessionActor`] task; callers talk to
//! it through a [`SessionHandle`], or through the [`NetworkCoordinator`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use imlink_session::{CoordinatorConfig, NetworkCoordinator, SessionType, TcpTransport};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let coordinator =
//!     NetworkCoordinator::start(CoordinatorConfig::default(), Arc::new(TcpTransport)).await;
//!
//! coordinator.connect(SessionType::Chat, "127.0.0.1", 9000).await?;
//! let (message_id, sequence) = coordinator.send_text("hello").await?;
//! println!("sent {message_id} as {sequence:#010x}");
//!
//! coordinator.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod actor;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod message;
pub mod pool;
pub mod reconnect;
pub mod sequence;
pub mod session;
pub mod state;
pub mod transport;

// Re-export main types
pub use actor::{SessionActor, SessionCommand, SessionHandle};
pub use coordinator::{default_routes, CoordinatorConfig, NetworkCoordinator};
pub use error::{LifecycleError, PoolError, SessionError, StateError, TransportError};
pub use events::{
    DeliveryObserver, DisconnectReason, EventSink, FailureReason, HeartbeatObserver,
    InboundMessage, MessageObserver, SessionEvent, StateObserver,
};
pub use heartbeat::{
    HeartbeatConfig, HeartbeatController, HeartbeatMode, HeartbeatVerdict, ModeParams,
    NetworkCondition, NetworkQuality, NetworkSample,
};
pub use message::{
    MessageContext, MessagePriority, MessageState, PendingTable, RetryConfig, SendOptions,
};
pub use pool::{check_healthy_for_session, PoolConfig, PoolStats, SessionPool};
pub use reconnect::{ReconnectConfig, ReconnectPolicy, ScheduledAttempt};
pub use sequence::{MessageCategory, SequenceConfig, SequenceManager};
pub use session::{
    Session, SessionConfig, SessionSnapshot, SessionStats, SessionType,
};
pub use state::{ConnectEvent, ConnectState, ConnectStateMachine};
pub use transport::{
    Connection, ConnectionWriter, IoStream, TcpConnection, TcpTransport, TlsSettings, Transport,
    TransportEvent,
};

// Re-export TLS functionality when available
#[cfg(feature = "tls")]
pub use transport::tls::{connect_tls, make_client_config};
