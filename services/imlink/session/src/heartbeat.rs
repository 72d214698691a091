//! Adaptive heartbeat controller.
//!
//! The interval starts at the mode's base and is rescaled from RTT and loss
//! samples: poor links heartbeat less often (a dead link is detected by the loss
//! counter, not by heartbeat frequency), good links slightly more often. Every
//! adjustment is clamped to the mode's bounds and jittered by ±10%.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::sequence::{category_of, MessageCategory, SequenceManager};

/// Reference RTT for quality buckets
pub const RTT_REFERENCE: Duration = Duration::from_millis(200);

/// Lower bound on the heartbeat ACK deadline
pub const HEARTBEAT_TIMEOUT_FLOOR: Duration = Duration::from_secs(15);

/// Consecutive losses before the connection is declared dead
pub const DEFAULT_LOSS_THRESHOLD: u32 = 3;

/// Window after a mode change during which quality adjustments are skipped
pub const MODE_GRACE_WINDOW: Duration = Duration::from_secs(10);

/// Application lifecycle modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatMode {
    /// App in foreground
    #[default]
    Foreground,
    /// App in background
    Background,
    /// Battery saver
    LowPower,
    /// No heartbeats at all
    Suspended,
}

/// Interval bounds for one mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeParams {
    /// Starting interval
    pub base: Duration,
    /// Lower clamp
    pub min: Duration,
    /// Upper clamp
    pub max: Duration,
}

impl ModeParams {
    const fn secs(base: u64, min: u64, max: u64) -> Self {
        Self {
            base: Duration::from_secs(base),
            min: Duration::from_secs(min),
            max: Duration::from_secs(max),
        }
    }
}

/// Heartbeat tuning
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeartbeatConfig {
    /// Foreground bounds
    pub foreground: ModeParams,
    /// Background bounds
    pub background: ModeParams,
    /// Low-power bounds (also pins the interval while suspended)
    pub low_power: ModeParams,
    /// Minimum ACK deadline
    pub timeout_floor: Duration,
    /// Consecutive losses before the link is dead
    pub loss_threshold: u32,
    /// Grace window after a mode change
    pub grace_window: Duration,
    /// Samples kept by the network estimator
    pub sample_window: usize,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            foreground: ModeParams::secs(30, 15, 300),
            background: ModeParams::secs(90, 45, 600),
            low_power: ModeParams::secs(120, 60, 900),
            timeout_floor: HEARTBEAT_TIMEOUT_FLOOR,
            loss_threshold: DEFAULT_LOSS_THRESHOLD,
            grace_window: MODE_GRACE_WINDOW,
            sample_window: 10,
        }
    }
}

impl HeartbeatConfig {
    /// Bounds for `mode`; suspended uses the low-power bounds
    pub fn params(&self, mode: HeartbeatMode) -> ModeParams {
        match mode {
            HeartbeatMode::Foreground => self.foreground,
            HeartbeatMode::Background => self.background,
            HeartbeatMode::LowPower | HeartbeatMode::Suspended => self.low_power,
        }
    }
}

/// Discretized link quality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkQuality {
    /// RTT ≤ ½ reference, loss < 1%
    Excellent,
    /// RTT ≤ reference, loss < 5%
    Good,
    /// RTT ≤ 2× reference, loss < 10%
    Fair,
    /// Anything worse
    Poor,
}

impl NetworkQuality {
    /// Interval scale factor
    pub fn factor(self) -> f64 {
        match self {
            NetworkQuality::Excellent => 0.8,
            NetworkQuality::Good => 1.0,
            NetworkQuality::Fair => 1.5,
            NetworkQuality::Poor => 2.5,
        }
    }

    /// Bucket an RTT and loss rate
    pub fn classify(rtt: Duration, loss_rate: f64) -> Self {
        if rtt <= RTT_REFERENCE / 2 && loss_rate < 0.01 {
            NetworkQuality::Excellent
        } else if rtt <= RTT_REFERENCE && loss_rate < 0.05 {
            NetworkQuality::Good
        } else if rtt <= RTT_REFERENCE * 2 && loss_rate < 0.10 {
            NetworkQuality::Fair
        } else {
            NetworkQuality::Poor
        }
    }
}

/// One externally observed link sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkSample {
    /// Round-trip time
    pub rtt: Duration,
    /// Loss rate in `[0, 1]`
    pub loss_rate: f64,
}

/// Sliding RTT/loss estimator; recent samples weigh more
#[derive(Debug, Clone)]
pub struct NetworkCondition {
    window: usize,
    rtts: VecDeque<Duration>,
    outcomes: VecDeque<bool>,
    external_loss: Option<f64>,
}

impl NetworkCondition {
    /// Create an estimator keeping `window` samples
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            rtts: VecDeque::with_capacity(window),
            outcomes: VecDeque::with_capacity(window),
            external_loss: None,
        }
    }

    /// Record a successful heartbeat
    pub fn record_rtt(&mut self, rtt: Duration) {
        push_bounded(&mut self.rtts, rtt, self.window);
        push_bounded(&mut self.outcomes, true, self.window);
    }

    /// Record a lost probe
    pub fn record_loss(&mut self) {
        push_bounded(&mut self.outcomes, false, self.window);
    }

    /// Fold in an external sample
    pub fn record_sample(&mut self, sample: NetworkSample) {
        push_bounded(&mut self.rtts, sample.rtt, self.window);
        self.external_loss = Some(sample.loss_rate.clamp(0.0, 1.0));
    }

    /// Linearly weighted RTT, newest sample heaviest
    pub fn smoothed_rtt(&self) -> Option<Duration> {
        if self.rtts.is_empty() {
            return None;
        }
        let (mut sum, mut weights) = (0.0, 0.0);
        for (i, rtt) in self.rtts.iter().enumerate() {
            let w = (i + 1) as f64;
            sum += rtt.as_secs_f64() * w;
            weights += w;
        }
        Some(Duration::from_secs_f64(sum / weights))
    }

    /// Fraction of lost probes, or the latest external loss rate if higher
    pub fn loss_rate(&self) -> f64 {
        let probed = if self.outcomes.is_empty() {
            0.0
        } else {
            let lost = self.outcomes.iter().filter(|ok| !**ok).count();
            lost as f64 / self.outcomes.len() as f64
        };
        probed.max(self.external_loss.unwrap_or(0.0))
    }

    /// Current quality bucket; `Good` until there is data
    pub fn quality(&self) -> NetworkQuality {
        match self.smoothed_rtt() {
            Some(rtt) => NetworkQuality::classify(rtt, self.loss_rate()),
            None if self.loss_rate() > 0.0 => {
                NetworkQuality::classify(RTT_REFERENCE, self.loss_rate())
            }
            None => NetworkQuality::Good,
        }
    }

    /// Poor link with real loss
    pub fn is_congested(&self) -> bool {
        self.quality() == NetworkQuality::Poor && self.loss_rate() >= 0.10
    }

    /// Drop all samples
    pub fn clear(&mut self) {
        self.rtts.clear();
        self.outcomes.clear();
        self.external_loss = None;
    }
}

fn push_bounded<T>(queue: &mut VecDeque<T>, value: T, window: usize) {
    if queue.len() == window {
        queue.pop_front();
    }
    queue.push_back(value);
}

/// `clamp(base * quality.factor() * jitter, min, max)`
pub fn compute_interval(params: ModeParams, quality: NetworkQuality, jitter: f64) -> Duration {
    let scaled = params.base.as_secs_f64() * quality.factor() * jitter;
    Duration::from_secs_f64(scaled).clamp(params.min, params.max)
}

/// Outcome of a missed heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatVerdict {
    /// Still under the loss threshold
    Alive {
        /// Consecutive losses so far
        consecutive_losses: u32,
    },
    /// Threshold reached; the connection should be considered dead
    Dead {
        /// Consecutive losses that tripped it
        consecutive_losses: u32,
    },
}

/// Heartbeat scheduling and ACK tracking for one session
#[derive(Debug)]
pub struct HeartbeatController {
    config: HeartbeatConfig,
    mode: HeartbeatMode,
    current_interval: Duration,
    condition: NetworkCondition,
    pending: HashMap<u32, Instant>,
    consecutive_losses: u32,
    grace_until: Option<Instant>,
    running: bool,
    next_send: Option<Instant>,
}

impl HeartbeatController {
    /// Create a stopped controller in foreground mode
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            current_interval: config.foreground.base,
            condition: NetworkCondition::new(config.sample_window),
            config,
            mode: HeartbeatMode::Foreground,
            pending: HashMap::new(),
            consecutive_losses: 0,
            grace_until: None,
            running: false,
            next_send: None,
        }
    }

    /// Current mode
    pub fn mode(&self) -> HeartbeatMode {
        self.mode
    }

    /// Current interval
    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    /// Network estimator
    pub fn condition(&self) -> &NetworkCondition {
        &self.condition
    }

    /// Whether monitoring is active
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Heartbeats awaiting an echo
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether `seq` is one of our outstanding heartbeats
    pub fn is_pending(&self, seq: u32) -> bool {
        self.pending.contains_key(&seq)
    }

    /// Whether `seq` belongs to the heartbeat category
    pub fn is_heartbeat_sequence(&self, seq: u32) -> bool {
        category_of(seq) == Some(MessageCategory::Heartbeat)
    }

    /// Whether the estimator reports congestion
    pub fn is_network_congested(&self) -> bool {
        self.condition.is_congested()
    }

    /// Begin monitoring; the first heartbeat goes out one interval from `now`
    pub fn start(&mut self, now: Instant) {
        self.running = true;
        self.consecutive_losses = 0;
        self.pending.clear();
        self.schedule_next(now);
        debug!(interval_ms = self.current_interval.as_millis() as u64, "heartbeat started");
    }

    /// Stop monitoring and forget outstanding heartbeats
    pub fn stop(&mut self) {
        self.running = false;
        self.pending.clear();
        self.next_send = None;
    }

    /// ACK deadline for one heartbeat
    pub fn heartbeat_timeout(&self) -> Duration {
        (self.current_interval / 2).max(self.config.timeout_floor)
    }

    /// When the next heartbeat is due, if one will be sent
    pub fn next_send_at(&self) -> Option<Instant> {
        self.next_send
    }

    /// Earliest instant at which `poll` has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        if !self.running {
            return None;
        }
        let timeout = self.heartbeat_timeout();
        let expiry = self.pending.values().map(|sent| *sent + timeout).min();
        match (self.next_send, expiry) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Whether a heartbeat is due at `now`
    pub fn is_due(&self, now: Instant) -> bool {
        self.running && self.next_send.map(|at| now >= at).unwrap_or(false)
    }

    /// Allocate a heartbeat sequence and start tracking it
    pub fn send_heartbeat(&mut self, sequences: &SequenceManager, now: Instant) -> u32 {
        let (seq, wrapped) = sequences.allocate(MessageCategory::Heartbeat);
        if wrapped {
            // echoes from the new cycle must not match old heartbeats
            self.pending.clear();
        }
        self.pending.insert(seq, now);
        self.schedule_next(now);
        debug!(seq, "heartbeat sent");
        seq
    }

    /// A heartbeat write failed; counts as a loss
    pub fn send_heartbeat_failed(&mut self, seq: u32) -> HeartbeatVerdict {
        self.handle_heartbeat_timeout(seq)
    }

    /// Echo received. Returns the RTT when `seq` was outstanding.
    pub fn heartbeat_acknowledged(&mut self, seq: u32, now: Instant) -> Option<Duration> {
        let sent = self.pending.remove(&seq)?;
        let rtt = now.saturating_duration_since(sent);
        self.condition.record_rtt(rtt);
        self.consecutive_losses = 0;
        Some(rtt)
    }

    /// Outstanding heartbeats whose deadline has passed
    pub fn expired(&self, now: Instant) -> Vec<u32> {
        let timeout = self.heartbeat_timeout();
        let mut seqs: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, sent)| now.saturating_duration_since(**sent) >= timeout)
            .map(|(seq, _)| *seq)
            .collect();
        seqs.sort_unstable();
        seqs
    }

    /// Give up on `seq` and count a loss
    pub fn handle_heartbeat_timeout(&mut self, seq: u32) -> HeartbeatVerdict {
        self.pending.remove(&seq);
        self.condition.record_loss();
        self.consecutive_losses += 1;

        let consecutive_losses = self.consecutive_losses;
        if consecutive_losses >= self.config.loss_threshold {
            warn!(seq, consecutive_losses, "heartbeat loss threshold reached");
            self.consecutive_losses = 0;
            HeartbeatVerdict::Dead { consecutive_losses }
        } else {
            debug!(seq, consecutive_losses, "heartbeat timed out");
            HeartbeatVerdict::Alive { consecutive_losses }
        }
    }

    /// Fold an external sample into the estimator
    pub fn record_network_sample(&mut self, sample: NetworkSample) {
        self.condition.record_sample(sample);
    }

    /// Recompute the interval from the estimator with random jitter
    pub fn adjust_interval(&mut self, now: Instant) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.9..=1.1);
        self.adjust_interval_with(self.condition.quality(), jitter, now)
    }

    /// Recompute the interval for an explicit quality and jitter
    pub fn adjust_interval_with(
        &mut self,
        quality: NetworkQuality,
        jitter: f64,
        now: Instant,
    ) -> Duration {
        let params = self.config.params(self.mode);
        if self.mode == HeartbeatMode::Suspended {
            self.current_interval = params.max;
            return self.current_interval;
        }
        if self.grace_until.map(|until| now < until).unwrap_or(false) {
            return self.current_interval;
        }
        self.current_interval = compute_interval(params, quality, jitter);
        self.current_interval
    }

    /// Switch mode; resets the interval to the new base and opens a grace window.
    /// Returns whether the mode changed.
    pub fn set_mode(&mut self, mode: HeartbeatMode, now: Instant) -> bool {
        if mode == self.mode {
            return false;
        }
        info!(from = ?self.mode, to = ?mode, "heartbeat mode changed");
        self.mode = mode;
        let params = self.config.params(mode);
        self.current_interval = if mode == HeartbeatMode::Suspended {
            params.max
        } else {
            params.base
        };
        self.grace_until = Some(now + self.config.grace_window);
        if self.running {
            self.schedule_next(now);
        }
        true
    }

    fn schedule_next(&mut self, now: Instant) {
        self.next_send = if self.mode == HeartbeatMode::Suspended {
            None
        } else {
            Some(now + self.current_interval)
        };
    }
}

impl Default for HeartbeatController {
    fn default() -> Self {
        Self::new(HeartbeatConfig::default())
    }
}
