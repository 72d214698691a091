//! Outbound message lifecycle and the pending-acknowledgement table.

use bytes::Bytes;
use imlink_wire::{
    CompressType, EncryptType, FrameBuilder, MessageType, PacketHeader, TransformRegistry,
    WireError,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::LifecycleError;
use crate::sequence::MessageCategory;

/// Default retransmissions before a message fails
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default wait for an ACK before retransmitting
pub const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_secs(10);

/// Delivery state of one outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageState {
    /// Built, not yet written
    Created,
    /// Being written to the transport
    Sending,
    /// Written, waiting for the peer's ACK
    AwaitingAck,
    /// ACK received (terminal)
    Acked,
    /// ACK deadline passed
    TimedOut,
    /// Retransmission in progress
    Retrying,
    /// Retries exhausted or delivery abandoned (terminal)
    Failed,
}

impl MessageState {
    /// Whether no further transition is possible
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageState::Acked | MessageState::Failed)
    }

    /// Whether `self -> to` is in the transition table
    pub fn can_transition_to(self, to: MessageState) -> bool {
        use MessageState::*;
        matches!(
            (self, to),
            (Created, Sending)
                | (Sending, AwaitingAck)
                | (AwaitingAck, Acked)
                | (AwaitingAck, TimedOut)
                | (TimedOut, Retrying)
                | (Retrying, AwaitingAck)
                | (Created, Failed)
                | (Sending, Failed)
                | (AwaitingAck, Failed)
                | (TimedOut, Failed)
                | (Retrying, Failed)
        )
    }
}

/// Send priority hint
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum MessagePriority {
    /// Background traffic
    Low,
    /// Regular traffic
    #[default]
    Normal,
    /// User-visible traffic
    High,
    /// Must go out first
    Critical,
}

/// Retry policy for outbound messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Retransmissions allowed after the first send
    pub max_retries: u32,
    /// Wait for an ACK before each retransmission
    pub retry_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_timeout: DEFAULT_RETRY_TIMEOUT,
        }
    }
}

/// Per-send options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SendOptions {
    /// Priority hint
    pub priority: MessagePriority,
    /// Sequence category; `Normal` unless the body is media or control
    pub category: Option<MessageCategory>,
    /// Body encryption
    pub encrypt: EncryptType,
    /// Body compression
    pub compress: CompressType,
}

/// One outbound message tracked until it is acknowledged or fails
#[derive(Debug, Clone)]
pub struct MessageContext {
    /// Unique message id
    pub id: String,
    /// Owning session
    pub session_id: Uuid,
    /// Header message type
    pub msg_type: MessageType,
    /// Sequence category
    pub category: MessageCategory,
    /// Priority hint
    pub priority: MessagePriority,
    /// Raw body
    pub payload: Bytes,
    /// Allocated sequence
    pub sequence: u32,
    /// Creation time
    pub created_at: Instant,
    /// Last write time (first send or latest retransmission)
    pub sent_at: Option<Instant>,
    /// ACK time
    pub delivered_at: Option<Instant>,
    /// Read-receipt time
    pub read_at: Option<Instant>,
    /// Latest retransmission time
    pub last_retry_at: Option<Instant>,
    /// Retransmissions so far
    pub retry_count: u32,
    /// Retransmission budget
    pub max_retries: u32,
    /// ACK deadline per attempt
    pub retry_timeout: Duration,
    header: PacketHeader,
    state: MessageState,
}

impl MessageContext {
    /// Create a context for a freshly sequenced message
    pub fn new(
        session_id: Uuid,
        header: PacketHeader,
        category: MessageCategory,
        payload: Bytes,
        priority: MessagePriority,
        retry: RetryConfig,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id,
            msg_type: header.msg_type,
            category,
            priority,
            payload,
            sequence: header.sequence,
            created_at: Instant::now(),
            sent_at: None,
            delivered_at: None,
            read_at: None,
            last_retry_at: None,
            retry_count: 0,
            max_retries: retry.max_retries,
            retry_timeout: retry.retry_timeout,
            header,
            state: MessageState::Created,
        }
    }

    /// Current state
    pub fn state(&self) -> MessageState {
        self.state
    }

    /// Header the message was framed with
    pub fn header(&self) -> &PacketHeader {
        &self.header
    }

    /// Body encryption
    pub fn encrypt(&self) -> EncryptType {
        self.header.encrypt
    }

    /// Body compression
    pub fn compress(&self) -> CompressType {
        self.header.compress
    }

    /// Apply a transition from the table; illegal ones are logged and refused
    pub fn transition(&mut self, to: MessageState) -> Result<(), LifecycleError> {
        if !self.state.can_transition_to(to) {
            warn!(
                message_id = %self.id,
                seq = self.sequence,
                from = ?self.state,
                to = ?to,
                "illegal message transition"
            );
            return Err(LifecycleError::IllegalTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// Retries remain and the message is not finished
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries && !self.state.is_terminal()
    }

    /// `can_retry` and the ACK deadline for the latest write has passed
    pub fn should_retry(&self, now: Instant) -> bool {
        self.can_retry() && self.ack_overdue(now)
    }

    fn ack_overdue(&self, now: Instant) -> bool {
        match self.sent_at {
            Some(sent) => now.saturating_duration_since(sent) >= self.retry_timeout,
            None => false,
        }
    }

    /// Re-encode the original body under the original sequence
    pub fn build_retry_packet(&self, registry: &TransformRegistry) -> Result<Bytes, WireError> {
        FrameBuilder::from_header(self.header)
            .timestamp(imlink_wire::unix_timestamp())
            .body(self.payload.clone())
            .build(registry)
    }

    /// Sending, awaiting an ACK or between retries
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self.state,
            MessageState::Sending
                | MessageState::AwaitingAck
                | MessageState::TimedOut
                | MessageState::Retrying
        )
    }

    /// Acked or failed
    pub fn is_completed(&self) -> bool {
        self.state.is_terminal()
    }

    /// Written and not yet acknowledged
    pub fn is_waiting_for_ack(&self) -> bool {
        self.state == MessageState::AwaitingAck
    }

    /// Timed out and due for a retransmission
    pub fn needs_retransmission(&self) -> bool {
        self.state == MessageState::TimedOut && self.can_retry()
    }

    /// Human-readable state
    pub fn state_display(&self) -> &'static str {
        match self.state {
            MessageState::Created => "created",
            MessageState::Sending => "sending",
            MessageState::AwaitingAck => "awaiting ack",
            MessageState::Acked => "acked",
            MessageState::TimedOut => "timed out",
            MessageState::Retrying => "retrying",
            MessageState::Failed => "failed",
        }
    }

    /// Record a read receipt; only meaningful once delivered
    pub fn mark_read(&mut self, now: Instant) -> bool {
        if self.state != MessageState::Acked {
            return false;
        }
        self.read_at = Some(now);
        true
    }
}

/// A retransmission produced by `PendingTable::sweep`
#[derive(Debug, Clone)]
pub struct Retransmit {
    /// Message id
    pub message_id: String,
    /// Unchanged sequence
    pub sequence: u32,
    /// Retry number (1-based)
    pub attempt: u32,
    /// Encoded frame
    pub frame: Bytes,
}

/// Result of one retry sweep
#[derive(Debug, Default)]
pub struct SweepOutcome {
    /// Frames to write again
    pub retransmits: Vec<Retransmit>,
    /// Messages removed after exhausting their retries
    pub failed: Vec<MessageContext>,
}

/// Outbound messages owned by a session, keyed by id and by sequence
#[derive(Debug, Default)]
pub struct PendingTable {
    by_id: HashMap<String, MessageContext>,
    by_seq: HashMap<u32, String>,
}

impl PendingTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked messages
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Whether nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Track a message. A sequence can be held by one message at a time.
    pub fn insert(&mut self, ctx: MessageContext) -> Result<(), LifecycleError> {
        if self.by_seq.contains_key(&ctx.sequence) {
            return Err(LifecycleError::DuplicateSequence(ctx.sequence));
        }
        self.by_seq.insert(ctx.sequence, ctx.id.clone());
        self.by_id.insert(ctx.id.clone(), ctx);
        Ok(())
    }

    /// Whether some message holds `sequence`
    pub fn contains_sequence(&self, sequence: u32) -> bool {
        self.by_seq.contains_key(&sequence)
    }

    /// Look up by id
    pub fn get(&self, id: &str) -> Option<&MessageContext> {
        self.by_id.get(id)
    }

    /// Look up by sequence
    pub fn get_by_sequence(&self, sequence: u32) -> Option<&MessageContext> {
        self.by_seq.get(&sequence).and_then(|id| self.by_id.get(id))
    }

    /// Move a message through the table
    pub fn transition(&mut self, id: &str, to: MessageState) -> Result<(), LifecycleError> {
        let ctx = self
            .by_id
            .get_mut(id)
            .ok_or_else(|| LifecycleError::UnknownMessage(id.to_string()))?;
        ctx.transition(to)
    }

    /// Record a completed write: `Sending -> AwaitingAck`
    pub fn mark_sent(&mut self, id: &str, now: Instant) -> Result<(), LifecycleError> {
        let ctx = self
            .by_id
            .get_mut(id)
            .ok_or_else(|| LifecycleError::UnknownMessage(id.to_string()))?;
        ctx.transition(MessageState::AwaitingAck)?;
        ctx.sent_at = Some(now);
        Ok(())
    }

    /// Fail and remove one message
    pub fn fail(&mut self, id: &str) -> Result<MessageContext, LifecycleError> {
        let ctx = self
            .by_id
            .get_mut(id)
            .ok_or_else(|| LifecycleError::UnknownMessage(id.to_string()))?;
        ctx.transition(MessageState::Failed)?;
        self.remove(id)
            .ok_or_else(|| LifecycleError::UnknownMessage(id.to_string()))
    }

    /// Apply an inbound ACK; the message leaves the table
    pub fn ack(&mut self, sequence: u32, now: Instant) -> Option<MessageContext> {
        let id = self.by_seq.get(&sequence)?.clone();
        let ctx = self.by_id.get_mut(&id)?;
        if ctx.transition(MessageState::Acked).is_err() {
            debug!(seq = sequence, state = ?ctx.state(), "ack for message not awaiting one");
            return None;
        }
        ctx.delivered_at = Some(now);
        self.remove(&id)
    }

    /// Time out overdue messages, retransmitting or failing them
    pub fn sweep(&mut self, now: Instant, registry: &TransformRegistry) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();
        let overdue: Vec<String> = self
            .by_id
            .values()
            .filter(|ctx| ctx.is_waiting_for_ack() && ctx.ack_overdue(now))
            .map(|ctx| ctx.id.clone())
            .collect();

        for id in overdue {
            let Some(ctx) = self.by_id.get_mut(&id) else {
                continue;
            };
            if ctx.transition(MessageState::TimedOut).is_err() {
                continue;
            }

            if !ctx.can_retry() {
                if ctx.transition(MessageState::Failed).is_ok() {
                    if let Some(failed) = self.remove(&id) {
                        outcome.failed.push(failed);
                    }
                }
                continue;
            }

            let frame = match ctx.build_retry_packet(registry) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(message_id = %id, error = %e, "retry encoding failed");
                    if ctx.transition(MessageState::Failed).is_ok() {
                        if let Some(failed) = self.remove(&id) {
                            outcome.failed.push(failed);
                        }
                    }
                    continue;
                }
            };

            // TimedOut -> Retrying -> AwaitingAck cannot fail from here
            let _ = ctx.transition(MessageState::Retrying);
            ctx.retry_count += 1;
            ctx.last_retry_at = Some(now);
            ctx.sent_at = Some(now);
            let _ = ctx.transition(MessageState::AwaitingAck);

            outcome.retransmits.push(Retransmit {
                message_id: id.clone(),
                sequence: ctx.sequence,
                attempt: ctx.retry_count,
                frame,
            });
        }
        outcome
    }

    /// Frames for every message still awaiting an ACK, for replay after a
    /// reconnect. Does not count as a retry.
    pub fn replay(&mut self, now: Instant, registry: &TransformRegistry) -> Vec<Bytes> {
        let mut frames = Vec::new();
        for ctx in self.by_id.values_mut() {
            if !ctx.is_waiting_for_ack() {
                continue;
            }
            match ctx.build_retry_packet(registry) {
                Ok(frame) => {
                    ctx.sent_at = Some(now);
                    frames.push(frame);
                }
                Err(e) => warn!(message_id = %ctx.id, error = %e, "replay encoding failed"),
            }
        }
        frames
    }

    /// Fail and remove everything (session teardown or reuse)
    pub fn clear(&mut self) -> Vec<MessageContext> {
        self.by_seq.clear();
        self.by_id
            .drain()
            .map(|(_, mut ctx)| {
                let _ = ctx.transition(MessageState::Failed);
                ctx
            })
            .collect()
    }

    /// Fail and remove every message of `category`
    pub fn drain_category(&mut self, category: MessageCategory) -> Vec<MessageContext> {
        let ids: Vec<String> = self
            .by_id
            .values()
            .filter(|ctx| ctx.category == category)
            .map(|ctx| ctx.id.clone())
            .collect();
        ids.iter()
            .filter_map(|id| self.remove(id))
            .map(|mut ctx| {
                let _ = ctx.transition(MessageState::Failed);
                ctx
            })
            .collect()
    }

    fn remove(&mut self, id: &str) -> Option<MessageContext> {
        let ctx = self.by_id.remove(id)?;
        self.by_seq.remove(&ctx.sequence);
        Some(ctx)
    }
}
