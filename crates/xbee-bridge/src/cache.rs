//! Duplicate filter for outgoing bus updates
//!
//! Remote nodes report the same values over and over (periodic IO samples,
//! read-back queries after every command). The DuplicateFilter keeps the
//! last value published on each topic and suppresses an identical value
//! until the check window has passed.
//!
//! This is a per-topic debounce, not a rate limiter: a different value is
//! always published immediately.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::config::BridgeSettings;

/// Last value published on a topic
#[derive(Debug, Clone)]
struct PublishRecord {
    /// When the value was published
    published_at: Instant,
    /// The published value
    value: String,
}

/// Filter statistics for monitoring
#[derive(Debug, Clone, Default)]
pub struct FilterStats {
    /// Total publish attempts checked
    pub total_checks: u64,
    /// Attempts suppressed as duplicates
    pub duplicates_suppressed: u64,
    /// Attempts that passed through
    pub published: u64,
    /// Records replaced after their window expired
    pub window_expirations: u64,
}

impl FilterStats {
    /// Get the duplicate rate (0.0 to 1.0)
    pub fn duplicate_rate(&self) -> f64 {
        if self.total_checks == 0 {
            0.0
        } else {
            self.duplicates_suppressed as f64 / self.total_checks as f64
        }
    }
}

/// LRU-bounded per-topic duplicate filter
#[derive(Debug)]
pub struct DuplicateFilter {
    /// Last publish per topic
    records: LruCache<String, PublishRecord>,
    /// Suppression window
    window: Duration,
    /// Statistics
    stats: FilterStats,
}

impl DuplicateFilter {
    /// Create with custom capacity and window
    pub fn new(capacity: usize, window: Duration) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            records: LruCache::new(cap),
            window,
            stats: FilterStats::default(),
        }
    }

    /// Create from bridge settings
    pub fn from_settings(settings: &BridgeSettings) -> Self {
        Self::new(
            settings.duplicate_cache_size,
            settings.duplicate_check_window,
        )
    }

    /// Decide whether `value` should be published on `topic` at `now`
    ///
    /// Returns `false` when the same value was published on the topic less
    /// than one window ago. Otherwise the attempt is recorded and `true`
    /// is returned.
    pub fn should_publish(&mut self, topic: &str, value: &str, now: Instant) -> bool {
        self.stats.total_checks += 1;

        if let Some(record) = self.records.get(topic) {
            let elapsed = now.saturating_duration_since(record.published_at);
            if record.value == value && elapsed < self.window {
                debug!(topic, value, "Duplicate removed");
                self.stats.duplicates_suppressed += 1;
                return false;
            }
            if elapsed >= self.window {
                self.stats.window_expirations += 1;
            }
        }

        self.records.put(
            topic.to_string(),
            PublishRecord {
                published_at: now,
                value: value.to_string(),
            },
        );
        trace!(topic, value, "Publish recorded");
        self.stats.published += 1;
        true
    }

    /// Drop the record for `topic`, e.g. after the publish failed
    pub fn forget(&mut self, topic: &str) {
        if self.records.pop(topic).is_some() {
            self.stats.published = self.stats.published.saturating_sub(1);
        }
    }

    /// Get the number of tracked topics
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if no topic is tracked
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Get filter statistics
    pub fn stats(&self) -> FilterStats {
        self.stats.clone()
    }

    /// Forget all records
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Get the configured window
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Get the filter capacity
    pub fn capacity(&self) -> usize {
        self.records.cap().get()
    }
}

impl Default for DuplicateFilter {
    fn default() -> Self {
        Self::from_settings(&BridgeSettings::default())
    }
}
