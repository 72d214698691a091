//! Per-category sequence allocation.
//!
//! A sequence is `category (8 bits) | counter (24 bits)`. Each category counts
//! on its own and is reset well before the counter space runs out, so an
//! in-flight sequence is never handed out twice.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::{info, warn};

/// Bits the counter occupies below the category
pub const CATEGORY_SHIFT: u32 = 24;

/// Counter mask
pub const COUNTER_MASK: u32 = 0x00FF_FFFF;

/// Counter value that triggers a one-time warning
pub const DEFAULT_WARNING_THRESHOLD: u32 = 0x00E0_0000;

/// Counter value at which the category is reset (~94% of the counter space)
pub const DEFAULT_RESET_THRESHOLD: u32 = 0x00F0_0000;

/// Logical message class with its own counter
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageCategory {
    /// Application messages
    Normal = 0,
    /// Heartbeats
    Heartbeat = 1,
    /// Control frames
    Control = 2,
    /// Media messages
    Media = 3,
}

impl MessageCategory {
    /// Every category, in counter-slot order
    pub const ALL: [MessageCategory; 4] = [
        MessageCategory::Normal,
        MessageCategory::Heartbeat,
        MessageCategory::Control,
        MessageCategory::Media,
    ];

    fn slot(self) -> usize {
        self as usize
    }
}

impl TryFrom<u8> for MessageCategory {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageCategory::Normal),
            1 => Ok(MessageCategory::Heartbeat),
            2 => Ok(MessageCategory::Control),
            3 => Ok(MessageCategory::Media),
            other => Err(other),
        }
    }
}

/// Pack a category and counter into a sequence
pub fn pack_sequence(category: MessageCategory, counter: u32) -> u32 {
    ((category as u32) << CATEGORY_SHIFT) | (counter & COUNTER_MASK)
}

/// Category encoded in a sequence
pub fn category_of(sequence: u32) -> Option<MessageCategory> {
    MessageCategory::try_from((sequence >> CATEGORY_SHIFT) as u8).ok()
}

/// Counter encoded in a sequence
pub fn counter_of(sequence: u32) -> u32 {
    sequence & COUNTER_MASK
}

/// Thresholds for counter warnings and resets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceConfig {
    /// Counter value that emits a warning once per cycle
    pub warning_threshold: u32,
    /// Counter value that forces a reset
    pub reset_threshold: u32,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            warning_threshold: DEFAULT_WARNING_THRESHOLD,
            reset_threshold: DEFAULT_RESET_THRESHOLD,
        }
    }
}

/// Called with the category just before its counter wraps to zero
pub type ResetHandler = Box<dyn Fn(MessageCategory) + Send + Sync>;

/// Called once per cycle when a counter passes the warning threshold
pub type WarningHandler = Box<dyn Fn(MessageCategory, u32) + Send + Sync>;

#[derive(Debug, Default)]
struct Counters {
    last: [u32; 4],
    warned: [bool; 4],
}

/// Sequence allocator owned by one session
pub struct SequenceManager {
    config: SequenceConfig,
    counters: Mutex<Counters>,
    reset_handler: Option<ResetHandler>,
    warning_handler: Option<WarningHandler>,
}

impl SequenceManager {
    /// Create an allocator with every counter at zero
    pub fn new(config: SequenceConfig) -> Self {
        Self {
            config,
            counters: Mutex::new(Counters::default()),
            reset_handler: None,
            warning_handler: None,
        }
    }

    /// Install the reset callback. It runs while the allocator is locked and
    /// must not allocate from the same manager.
    pub fn set_reset_handler(&mut self, handler: ResetHandler) {
        self.reset_handler = Some(handler);
    }

    /// Install the near-threshold warning callback
    pub fn set_warning_handler(&mut self, handler: WarningHandler) {
        self.warning_handler = Some(handler);
    }

    /// Allocate the next sequence for `category`
    pub fn next_sequence(&self, category: MessageCategory) -> u32 {
        self.allocate(category).0
    }

    /// Allocate the next sequence for `category` and report whether the
    /// counter was reset to produce it
    pub fn allocate(&self, category: MessageCategory) -> (u32, bool) {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let slot = category.slot();

        let mut next = counters.last[slot] + 1;
        let mut wrapped = false;
        if next >= self.config.reset_threshold {
            info!(?category, counter = counters.last[slot], "sequence counter reset");
            if let Some(handler) = &self.reset_handler {
                handler(category);
            }
            counters.warned[slot] = false;
            wrapped = true;
            next = 1;
        } else if next >= self.config.warning_threshold && !counters.warned[slot] {
            warn!(?category, counter = next, "sequence counter nearing reset threshold");
            counters.warned[slot] = true;
            if let Some(handler) = &self.warning_handler {
                handler(category, next);
            }
        }

        counters.last[slot] = next;
        (pack_sequence(category, next), wrapped)
    }

    /// Last sequence handed out for `category`
    pub fn current_sequence(&self, category: MessageCategory) -> u32 {
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        pack_sequence(category, counters.last[category.slot()])
    }

    /// Whether `sequence` belongs to `category`
    pub fn is_sequence_for_category(&self, sequence: u32, category: MessageCategory) -> bool {
        category_of(sequence) == Some(category)
    }

    #[cfg(test)]
    fn seed(&self, category: MessageCategory, counter: u32) {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters.last[category.slot()] = counter;
    }
}

impl std::fmt::Debug for SequenceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("SequenceManager")
            .field("config", &self.config)
            .field("last", &counters.last)
            .finish()
    }
}

impl Default for SequenceManager {
    fn default() -> Self {
        Self::new(SequenceConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_pack_and_mask() {
        let seq = pack_sequence(MessageCategory::Heartbeat, 0x12_3456);
        assert_eq!(seq, 0x0112_3456);
        assert_eq!(category_of(seq), Some(MessageCategory::Heartbeat));
        assert_eq!(counter_of(seq), 0x12_3456);
        assert_eq!(category_of(0x0900_0000), None);
    }

    #[test]
    fn test_categories_count_independently() {
        let manager = SequenceManager::default();
        assert_eq!(manager.next_sequence(MessageCategory::Normal), 0x0000_0001);
        assert_eq!(manager.next_sequence(MessageCategory::Normal), 0x0000_0002);
        assert_eq!(manager.next_sequence(MessageCategory::Heartbeat), 0x0100_0001);
        assert_eq!(manager.current_sequence(MessageCategory::Normal), 0x0000_0002);
        assert_eq!(manager.current_sequence(MessageCategory::Media), 0x0300_0000);
        assert!(manager.is_sequence_for_category(0x0100_0001, MessageCategory::Heartbeat));
        assert!(!manager.is_sequence_for_category(0x0100_0001, MessageCategory::Normal));
    }

    #[test]
    fn test_strictly_increasing() {
        let manager = SequenceManager::default();
        let mut last = 0;
        for _ in 0..1000 {
            let seq = manager.next_sequence(MessageCategory::Control);
            assert!(counter_of(seq) > last);
            last = counter_of(seq);
        }
    }

    #[test]
    fn test_reset_fires_exactly_once() {
        let resets = Arc::new(AtomicU32::new(0));
        let warnings = Arc::new(AtomicU32::new(0));
        let mut manager = SequenceManager::new(SequenceConfig {
            warning_threshold: 8,
            reset_threshold: 10,
        });
        let r = resets.clone();
        manager.set_reset_handler(Box::new(move |cat| {
            assert_eq!(cat, MessageCategory::Normal);
            r.fetch_add(1, Ordering::SeqCst);
        }));
        let w = warnings.clone();
        manager.set_warning_handler(Box::new(move |_, counter| {
            assert_eq!(counter, 8);
            w.fetch_add(1, Ordering::SeqCst);
        }));

        let seqs: Vec<u32> = (0..12)
            .map(|_| counter_of(manager.next_sequence(MessageCategory::Normal)))
            .collect();

        assert_eq!(seqs, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 1, 2, 3]);
        assert_eq!(resets.load(Ordering::SeqCst), 1);
        assert_eq!(warnings.load(Ordering::SeqCst), 1);
        assert_eq!(manager.next_sequence(MessageCategory::Heartbeat), 0x0100_0001);
    }

    #[test]
    fn test_allocate_flags_the_wrapping_call() {
        let manager = SequenceManager::new(SequenceConfig {
            warning_threshold: 2,
            reset_threshold: 3,
        });
        let flags: Vec<(u32, bool)> = (0..4)
            .map(|_| {
                let (seq, wrapped) = manager.allocate(MessageCategory::Media);
                (counter_of(seq), wrapped)
            })
            .collect();
        assert_eq!(flags, vec![(1, false), (2, false), (1, true), (2, false)]);
    }

    #[test]
    fn test_default_thresholds() {
        let manager = SequenceManager::default();
        manager.seed(MessageCategory::Media, DEFAULT_RESET_THRESHOLD - 1);
        assert_eq!(manager.next_sequence(MessageCategory::Media), 0x0300_0001);
    }

    #[test]
    fn test_concurrent_allocation_has_no_duplicates() {
        let manager = Arc::new(SequenceManager::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = manager.clone();
                std::thread::spawn(move || {
                    (0..500)
                        .map(|_| m.next_sequence(MessageCategory::Normal))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for seq in handle.join().unwrap() {
                assert!(seen.insert(seq), "duplicate sequence {seq:#x}");
            }
        }
        assert_eq!(seen.len(), 4000);
    }
}
