//! Per-type pool of idle sessions.
//!
//! Sessions move by value: `acquire` hands one out and forgets it, `release`
//! takes it back. A session is therefore never pooled and held by a caller at
//! the same time.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::error::PoolError;
use crate::session::{Session, SessionConfig, SessionType};
use crate::state::ConnectState;

/// Pool limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Idle sessions kept per type
    pub max_per_type: usize,
    /// Idle time before eviction
    pub max_idle: Duration,
    /// Period of the background cleanup
    pub cleanup_interval: Duration,
    /// Hand-outs before a session is retired
    pub max_reuse: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_per_type: 3,
            max_idle: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
            max_reuse: 50,
        }
    }
}

/// Pool counters. Informational only.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolStats {
    /// Acquires served from the pool
    pub hits: u64,
    /// Acquires that built a new session
    pub misses: u64,
    /// Sessions built
    pub created: u64,
    /// Sessions dropped on release or removal
    pub discarded: u64,
    /// Idle sessions evicted as unhealthy
    pub evicted: u64,
    /// Sessions currently handed out
    pub active: usize,
    /// Sessions currently idle in the pool
    pub pooled: usize,
}

impl PoolStats {
    /// `hits / (hits + misses)`, zero before the first acquire
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug)]
struct PoolInner {
    idle: HashMap<SessionType, VecDeque<Session>>,
    active: HashMap<SessionType, usize>,
    stats: PoolStats,
    running: bool,
    paused: bool,
}

impl PoolInner {
    fn pooled(&self) -> usize {
        self.idle.values().map(VecDeque::len).sum()
    }

    fn active(&self) -> usize {
        self.active.values().sum()
    }

    fn release_active(&mut self, session_type: SessionType) {
        if let Some(count) = self.active.get_mut(&session_type) {
            *count = count.saturating_sub(1);
        }
    }
}

/// Whether an idle session may be handed out again
pub fn check_healthy_for_session(session: &Session, config: &PoolConfig, now: Instant) -> bool {
    let idle_for = now.saturating_duration_since(session.last_active());
    idle_for < config.max_idle
        && session.use_count() < config.max_reuse
        && matches!(
            session.state(),
            ConnectState::Disconnected | ConnectState::Connected
        )
}

fn evict_unhealthy(
    inner: &mut PoolInner,
    config: &PoolConfig,
    only: Option<SessionType>,
    now: Instant,
) -> usize {
    let mut evicted = 0;
    for (session_type, queue) in inner.idle.iter_mut() {
        if only.is_some_and(|t| t != *session_type) {
            continue;
        }
        let before = queue.len();
        queue.retain(|s| check_healthy_for_session(s, config, now));
        evicted += before - queue.len();
    }
    inner.stats.evicted += evicted as u64;
    evicted
}

/// Idle session pool keyed by [`SessionType`]
#[derive(Debug)]
pub struct SessionPool {
    config: PoolConfig,
    inner: Arc<Mutex<PoolInner>>,
    cleanup: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SessionPool {
    /// Create an empty, running pool without background cleanup
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(PoolInner {
                idle: HashMap::new(),
                active: HashMap::new(),
                stats: PoolStats::default(),
                running: true,
                paused: false,
            })),
            cleanup: std::sync::Mutex::new(None),
        }
    }

    /// Limits
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Whether `session` could be handed out now
    pub fn check_healthy(&self, session: &Session) -> bool {
        check_healthy_for_session(session, &self.config, Instant::now())
    }

    /// Take a healthy idle session of `session_type` for the same endpoint, or
    /// build one from `config`
    pub async fn acquire(
        &self,
        session_type: SessionType,
        config: SessionConfig,
    ) -> Result<Session, PoolError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        if !inner.running {
            return Err(PoolError::NotRunning);
        }

        if !inner.paused {
            let mut rejected = 0u64;
            let mut found = None;
            if let Some(queue) = inner.idle.get_mut(&session_type) {
                let before = queue.len();
                queue.retain(|session| check_healthy_for_session(session, &self.config, now));
                rejected = (before - queue.len()) as u64;
                // sessions for other endpoints stay queued
                found = queue
                    .iter()
                    .position(|session| {
                        let endpoint = session.config();
                        endpoint.host == config.host && endpoint.port == config.port
                    })
                    .and_then(|pos| queue.remove(pos));
            }
            inner.stats.evicted += rejected;

            if let Some(mut session) = found {
                session.mark_acquired(now);
                inner.stats.hits += 1;
                *inner.active.entry(session_type).or_default() += 1;
                debug!(
                    session_id = %session.id(),
                    %session_type,
                    use_count = session.use_count(),
                    "session reused from pool"
                );
                return Ok(session);
            }
        }

        let mut session = Session::new(SessionConfig {
            session_type,
            ..config
        });
        session.mark_acquired(now);
        inner.stats.misses += 1;
        inner.stats.created += 1;
        *inner.active.entry(session_type).or_default() += 1;
        debug!(session_id = %session.id(), %session_type, "session created");
        Ok(session)
    }

    /// Return a session. It is reset for reuse and pooled when limits allow,
    /// otherwise dropped. Returns whether it was pooled.
    pub async fn release(&self, mut session: Session) -> bool {
        let session_type = session.session_type();
        session.reset_for_reuse();

        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        inner.release_active(session_type);

        let pooled_for_type = inner.idle.get(&session_type).map_or(0, VecDeque::len);
        let keep = inner.running
            && !inner.paused
            && session.use_count() < self.config.max_reuse
            && pooled_for_type < self.config.max_per_type;
        if !keep {
            inner.stats.discarded += 1;
            debug!(session_id = %session.id(), %session_type, "session discarded on release");
            return false;
        }

        session.mark_released(now);
        debug!(session_id = %session.id(), %session_type, "session returned to pool");
        inner.idle.entry(session_type).or_default().push_back(session);
        true
    }

    /// Retire a handed-out session without pooling it. Pending messages fail.
    pub async fn remove(&self, mut session: Session) {
        session.abandon_pending();
        let mut inner = self.inner.lock().await;
        inner.release_active(session.session_type());
        inner.stats.discarded += 1;
        debug!(session_id = %session.id(), "session removed");
    }

    /// Release the active slot of a session that will never come back
    pub async fn forget(&self, session_type: SessionType) {
        let mut inner = self.inner.lock().await;
        inner.release_active(session_type);
        inner.stats.discarded += 1;
        debug!(%session_type, "session slot released without the session");
    }

    /// Evict unhealthy idle sessions of every type. Returns how many went.
    pub async fn cleanup(&self) -> usize {
        let mut inner = self.inner.lock().await;
        evict_unhealthy(&mut inner, &self.config, None, Instant::now())
    }

    /// Evict unhealthy idle sessions of one type
    pub async fn cleanup_type(&self, session_type: SessionType) -> usize {
        let mut inner = self.inner.lock().await;
        evict_unhealthy(&mut inner, &self.config, Some(session_type), Instant::now())
    }

    /// Pre-build idle sessions up to the per-type limit. Returns how many were added.
    pub async fn warmup(
        &self,
        session_type: SessionType,
        count: usize,
        config: SessionConfig,
    ) -> Result<usize, PoolError> {
        let mut inner = self.inner.lock().await;
        if !inner.running {
            return Err(PoolError::NotRunning);
        }
        let queue = inner.idle.entry(session_type).or_default();
        let room = self.config.max_per_type.saturating_sub(queue.len());
        if room == 0 {
            return Err(PoolError::Full(session_type));
        }
        let added = count.min(room);
        for _ in 0..added {
            queue.push_back(Session::new(SessionConfig {
                session_type,
                ..config.clone()
            }));
        }
        inner.stats.created += added as u64;
        info!(%session_type, added, "pool warmed up");
        Ok(added)
    }

    /// Spawn the periodic cleanup task and accept sessions
    pub async fn start(&self) {
        self.inner.lock().await.running = true;

        let inner = self.inner.clone();
        let config = self.config;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.cleanup_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let mut guard = inner.lock().await;
                let evicted = evict_unhealthy(&mut guard, &config, None, Instant::now());
                if evicted > 0 {
                    debug!(evicted, "pool cleanup");
                }
            }
        });

        let mut cleanup = self.cleanup.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = cleanup.replace(task) {
            previous.abort();
        }
        info!(max_per_type = self.config.max_per_type, "session pool started");
    }

    /// Stop cleanup, drop every idle session and refuse further acquires
    pub async fn stop(&self) {
        if let Some(task) = self
            .cleanup
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        let mut inner = self.inner.lock().await;
        inner.running = false;
        let dropped = inner.pooled();
        inner.idle.clear();
        inner.stats.discarded += dropped as u64;
        info!(dropped, "session pool stopped");
    }

    /// Bypass pooling: acquires build fresh sessions, releases drop them
    pub async fn pause(&self) {
        self.inner.lock().await.paused = true;
    }

    /// Resume pooling
    pub async fn resume(&self) {
        self.inner.lock().await.paused = false;
    }

    /// Whether pooling is bypassed
    pub async fn is_paused(&self) -> bool {
        self.inner.lock().await.paused
    }

    /// Whether acquires are accepted
    pub async fn is_running(&self) -> bool {
        self.inner.lock().await.running
    }

    /// Counters with current occupancy
    pub async fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().await;
        PoolStats {
            active: inner.active(),
            pooled: inner.pooled(),
            ..inner.stats.clone()
        }
    }

    /// Zero the counters
    pub async fn reset_stats(&self) {
        self.inner.lock().await.stats = PoolStats::default();
    }

    /// Idle sessions of `session_type`
    pub async fn pooled_count(&self, session_type: SessionType) -> usize {
        let inner = self.inner.lock().await;
        inner.idle.get(&session_type).map_or(0, VecDeque::len)
    }

    /// Idle plus handed-out sessions of `session_type`
    pub async fn session_count(&self, session_type: SessionType) -> usize {
        let inner = self.inner.lock().await;
        inner.idle.get(&session_type).map_or(0, VecDeque::len)
            + inner.active.get(&session_type).copied().unwrap_or(0)
    }

    /// Per-type occupancy and counters as JSON
    pub async fn detailed_info(&self) -> serde_json::Value {
        let inner = self.inner.lock().await;
        let per_type: serde_json::Map<String, serde_json::Value> = SessionType::ALL
            .iter()
            .map(|t| {
                let idle = inner.idle.get(t).map_or(0, VecDeque::len);
                let active = inner.active.get(t).copied().unwrap_or(0);
                (
                    t.to_string(),
                    serde_json::json!({ "pooled": idle, "active": active }),
                )
            })
            .collect();
        serde_json::json!({
            "running": inner.running,
            "paused": inner.paused,
            "config": self.config,
            "stats": PoolStats {
                active: inner.active(),
                pooled: inner.pooled(),
                ..inner.stats.clone()
            },
            "hit_rate": inner.stats.hit_rate(),
            "types": per_type,
        })
    }

    /// Log occupancy and hit rate
    pub async fn log_status(&self) {
        let stats = self.stats().await;
        info!(
            active = stats.active,
            pooled = stats.pooled,
            hits = stats.hits,
            misses = stats.misses,
            hit_rate = format!("{:.2}", stats.hit_rate()),
            "session pool status"
        );
    }
}

impl Default for SessionPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl Drop for SessionPool {
    fn drop(&mut self) {
        if let Some(task) = self
            .cleanup
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventSink, FailureReason, SessionEvent};
    use crate::message::SendOptions;
    use bytes::Bytes;

    fn chat_config() -> SessionConfig {
        SessionConfig::new(SessionType::Chat, "127.0.0.1", 9000)
    }

    #[tokio::test]
    async fn test_reacquire_returns_same_session() {
        let pool = SessionPool::default();
        let mut session = pool.acquire(SessionType::Chat, chat_config()).await.unwrap();
        let id = session.id();

        session.begin_connect(false).unwrap();
        session.connection_established(Instant::now()).unwrap();
        let (msg, _, _) = session
            .prepare_send(Bytes::from_static(b"pending"), SendOptions::default())
            .unwrap();
        session.mark_sent(&msg, Instant::now()).unwrap();
        assert_eq!(session.pending_count(), 1);

        assert!(pool.release(session).await);
        let again = pool.acquire(SessionType::Chat, chat_config()).await.unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(again.use_count(), 2);
        assert_eq!(again.pending_count(), 0);
        assert_eq!(again.state(), ConnectState::Disconnected);

        let stats = pool.stats().await;
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert_eq!(stats.hit_rate(), 0.5);
        assert_eq!(stats.active, 1);
    }

    #[tokio::test]
    async fn test_other_endpoint_stays_pooled() {
        let pool = SessionPool::default();
        let s = pool.acquire(SessionType::Chat, chat_config()).await.unwrap();
        let pooled_id = s.id();
        pool.release(s).await;

        let elsewhere = SessionConfig::new(SessionType::Chat, "127.0.0.1", 9001);
        let fresh = pool.acquire(SessionType::Chat, elsewhere).await.unwrap();
        assert_ne!(fresh.id(), pooled_id);
        assert_eq!(pool.pooled_count(SessionType::Chat).await, 1);
        assert_eq!(pool.stats().await.evicted, 0);

        let again = pool.acquire(SessionType::Chat, chat_config()).await.unwrap();
        assert_eq!(again.id(), pooled_id);
    }

    #[tokio::test]
    async fn test_remove_fails_pending_and_frees_slot() {
        let pool = SessionPool::default();
        let (sink, mut rx) = EventSink::channel();
        let mut session = pool.acquire(SessionType::Chat, chat_config()).await.unwrap();
        session.set_event_sink(sink);
        session.begin_connect(false).unwrap();
        session.connection_established(Instant::now()).unwrap();
        let (msg, _, _) = session
            .prepare_send(Bytes::from_static(b"in flight"), SendOptions::default())
            .unwrap();
        session.mark_sent(&msg, Instant::now()).unwrap();

        pool.remove(session).await;
        let mut failed = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::MessageFailed { message_id, reason, .. } = event {
                failed.push((message_id, reason));
            }
        }
        assert_eq!(failed, vec![(msg, FailureReason::SessionClosed)]);

        let other = pool.acquire(SessionType::Media, chat_config()).await.unwrap();
        drop(other);
        pool.forget(SessionType::Media).await;
        let stats = pool.stats().await;
        assert_eq!(stats.active, 0);
        assert_eq!(stats.discarded, 2);
    }

    #[tokio::test]
    async fn test_types_are_separate() {
        let pool = SessionPool::default();
        let chat = pool.acquire(SessionType::Chat, chat_config()).await.unwrap();
        let chat_id = chat.id();
        pool.release(chat).await;

        let media = pool.acquire(SessionType::Media, chat_config()).await.unwrap();
        assert_ne!(media.id(), chat_id);
        assert_eq!(media.session_type(), SessionType::Media);
        assert_eq!(pool.pooled_count(SessionType::Chat).await, 1);
        assert_eq!(pool.session_count(SessionType::Media).await, 1);
    }

    #[tokio::test]
    async fn test_capacity_and_reuse_limits() {
        let pool = SessionPool::new(PoolConfig {
            max_per_type: 1,
            max_reuse: 2,
            ..Default::default()
        });

        let a = pool.acquire(SessionType::Chat, chat_config()).await.unwrap();
        let b = pool.acquire(SessionType::Chat, chat_config()).await.unwrap();
        assert!(pool.release(a).await);
        assert!(!pool.release(b).await);

        let a = pool.acquire(SessionType::Chat, chat_config()).await.unwrap();
        assert_eq!(a.use_count(), 2);
        assert!(!pool.release(a).await);
        assert_eq!(pool.pooled_count(SessionType::Chat).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_sessions_expire() {
        let pool = SessionPool::default();
        let s = pool.acquire(SessionType::Chat, chat_config()).await.unwrap();
        pool.release(s).await;

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(pool.cleanup_type(SessionType::Media).await, 0);
        assert_eq!(pool.cleanup().await, 1);
        assert_eq!(pool.pooled_count(SessionType::Chat).await, 0);
        assert_eq!(pool.stats().await.evicted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_cleanup() {
        let pool = SessionPool::default();
        pool.start().await;
        let s = pool.acquire(SessionType::Chat, chat_config()).await.unwrap();
        pool.release(s).await;

        tokio::time::sleep(Duration::from_secs(360 + 1)).await;
        assert_eq!(pool.pooled_count(SessionType::Chat).await, 0);
        pool.stop().await;
        assert!(matches!(
            pool.acquire(SessionType::Chat, chat_config()).await,
            Err(PoolError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_warmup_and_pause() {
        let pool = SessionPool::default();
        assert_eq!(pool.warmup(SessionType::Signaling, 5, chat_config()).await, Ok(3));
        assert_eq!(
            pool.warmup(SessionType::Signaling, 1, chat_config()).await,
            Err(PoolError::Full(SessionType::Signaling))
        );

        pool.pause().await;
        let s = pool.acquire(SessionType::Signaling, chat_config()).await.unwrap();
        assert_eq!(s.use_count(), 1);
        assert!(!pool.release(s).await);
        pool.resume().await;
        assert_eq!(pool.pooled_count(SessionType::Signaling).await, 3);

        let info = pool.detailed_info().await;
        assert_eq!(info["types"]["signaling"]["pooled"], 3);
        pool.reset_stats().await;
        assert_eq!(pool.stats().await.created, 0);
    }
}
