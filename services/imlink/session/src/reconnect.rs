//! Bounded exponential backoff for reconnects.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default attempt budget
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default first delay
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(2);

/// Default delay ceiling
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Jitter bounds applied to every delay
pub const JITTER_RANGE: (f64, f64) = (0.9, 1.1);

/// Backoff parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectConfig {
    /// Attempts before giving up until `reset`
    pub max_attempts: u32,
    /// Delay before the first attempt
    pub base_delay: Duration,
    /// Delay ceiling
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

/// Called once with the attempt count when the budget runs out
pub type MaxAttemptsHandler = Box<dyn Fn(u32) + Send + Sync>;

/// An attempt that has been scheduled
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledAttempt {
    /// 1-based attempt number
    pub attempt: u32,
    /// Wait before the attempt runs
    pub delay: Duration,
    /// Token the attempt was scheduled under
    pub generation: u64,
}

/// Reconnect policy owned by one session
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    current_attempt: u32,
    generation: u64,
    exhausted: bool,
    pending: Option<JoinHandle<()>>,
    on_max_attempts: Option<MaxAttemptsHandler>,
}

impl ReconnectPolicy {
    /// Create a policy with no attempts made
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            current_attempt: 0,
            generation: 0,
            exhausted: false,
            pending: None,
            on_max_attempts: None,
        }
    }

    /// Install the exhaustion callback
    pub fn set_max_attempts_handler(&mut self, handler: MaxAttemptsHandler) {
        self.on_max_attempts = Some(handler);
    }

    /// Attempts scheduled since the last success or reset
    pub fn current_attempt(&self) -> u32 {
        self.current_attempt
    }

    /// Current token; attempts carrying an older one are stale
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether `generation` still matches the live schedule
    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.generation
    }

    /// Whether the budget is spent
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Whether an attempt is waiting to run
    pub fn is_scheduled(&self) -> bool {
        self.pending.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    /// Delay for the next attempt with random jitter
    pub fn calculate_delay(&self) -> Duration {
        let jitter = rand::thread_rng().gen_range(JITTER_RANGE.0..=JITTER_RANGE.1);
        self.delay_for_attempt(self.current_attempt, jitter)
    }

    /// `min(base * 2^attempt * jitter, max)`
    pub fn delay_for_attempt(&self, attempt: u32, jitter: f64) -> Duration {
        let factor = 2f64.powi(attempt.min(30) as i32) * jitter;
        let delay = self.config.base_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.config.max_delay.as_secs_f64()))
    }

    /// Schedule `attempt` to run after the backoff delay on a background task.
    ///
    /// Each call counts as one failure. Returns `None` once the budget is
    /// spent; the exhaustion callback fires on that first refusal and no
    /// further attempts are scheduled until `reset`.
    pub fn attempt_connection<F, Fut>(&mut self, attempt: F) -> Option<ScheduledAttempt>
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.exhausted {
            return None;
        }
        if self.current_attempt >= self.config.max_attempts {
            self.exhausted = true;
            warn!(attempts = self.current_attempt, "reconnect attempts exhausted");
            if let Some(handler) = &self.on_max_attempts {
                handler(self.current_attempt);
            }
            return None;
        }

        let delay = self.calculate_delay();
        self.current_attempt += 1;
        let generation = self.generation;
        let scheduled = ScheduledAttempt {
            attempt: self.current_attempt,
            delay,
            generation,
        };

        if let Some(previous) = self.pending.take() {
            previous.abort();
        }
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            attempt(generation).await;
        }));

        info!(
            attempt = scheduled.attempt,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );
        Some(scheduled)
    }

    /// Cancel any scheduled attempt and invalidate its token
    pub fn stop_retrying(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
        self.generation += 1;
        debug!(generation = self.generation, "reconnect schedule invalidated");
    }

    /// Forget past failures (after a successful connect or on request)
    pub fn reset(&mut self) {
        self.stop_retrying();
        self.current_attempt = 0;
        self.exhausted = false;
    }
}

impl Drop for ReconnectPolicy {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
    }
}

impl std::fmt::Debug for ReconnectPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectPolicy")
            .field("config", &self.config)
            .field("current_attempt", &self.current_attempt)
            .field("generation", &self.generation)
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(ReconnectConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    #[test]
    fn test_delay_formula() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for_attempt(0, 1.0), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(1, 1.0), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(3, 1.0), Duration::from_secs(16));
        assert_eq!(policy.delay_for_attempt(4, 1.0), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(2, 0.9), Duration::from_secs_f64(7.2));
    }

    #[test]
    fn test_delay_monotonic_with_worst_case_jitter() {
        let policy = ReconnectPolicy::default();
        for attempt in 0..10 {
            let high = policy.delay_for_attempt(attempt, JITTER_RANGE.1);
            let low_next = policy.delay_for_attempt(attempt + 1, JITTER_RANGE.0);
            assert!(low_next >= high || low_next == DEFAULT_MAX_DELAY);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_run_after_delay() {
        let mut policy = ReconnectPolicy::default();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let scheduled = policy
            .attempt_connection(move |generation| async move {
                tx.send(generation).ok();
            })
            .unwrap();
        assert_eq!(scheduled.attempt, 1);
        assert!(scheduled.delay >= Duration::from_millis(1800));
        assert!(scheduled.delay <= Duration::from_millis(2200));

        assert_eq!(rx.recv().await, Some(0));
        assert_eq!(policy.current_attempt(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_and_reset() {
        let exhausted = Arc::new(AtomicU32::new(0));
        let mut policy = ReconnectPolicy::new(ReconnectConfig {
            max_attempts: 2,
            ..Default::default()
        });
        let e = exhausted.clone();
        policy.set_max_attempts_handler(Box::new(move |attempts| {
            assert_eq!(attempts, 2);
            e.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(policy.attempt_connection(|_| async {}).is_some());
        assert!(policy.attempt_connection(|_| async {}).is_some());
        assert!(policy.attempt_connection(|_| async {}).is_none());
        assert!(policy.attempt_connection(|_| async {}).is_none());
        assert_eq!(exhausted.load(Ordering::SeqCst), 1);
        assert!(policy.is_exhausted());

        policy.reset();
        assert_eq!(policy.current_attempt(), 0);
        let next = policy.attempt_connection(|_| async {}).unwrap();
        assert_eq!(next.attempt, 1);
        assert!(next.delay <= Duration::from_millis(2200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_retrying_cancels_pending_attempt() {
        let ran = Arc::new(AtomicU32::new(0));
        let mut policy = ReconnectPolicy::default();
        let r = ran.clone();
        let scheduled = policy
            .attempt_connection(move |_| async move {
                r.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        policy.stop_retrying();
        assert!(!policy.is_current(scheduled.generation));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
