//! Bar Types and Last-Bar Cache
//!
//! OHLCV bars as delivered to chart callbacks, plus the bounded cache of
//! the most recent bar per `(symbol, resolution)`.
//!
//! # Ordering rule
//!
//! Against a previous bar, an incoming bar is classified by
//! [`CacheOutcome::classify`]:
//! - older than the previous one: stale, dropped
//! - same time: applied only if some OHLCV field differs by more than
//!   [`PRICE_EPSILON`]
//! - newer: applied
//!
//! The series cache applies the rule to every bar it sees, including
//! history seeds, so it only moves forward in time. Delivery applies the
//! same rule per subscriber against what that subscriber last received,
//! falling back to the history bar of the series. Every subscriber sees
//! non-decreasing bar times.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Absolute tolerance used when comparing OHLCV fields.
pub const PRICE_EPSILON: f64 = 1e-9;

/// Default number of keys held by the bar cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

// =============================================================================
// Bar
// =============================================================================

/// A single OHLCV bar. `time` is epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Bar {
    /// Bar open time, epoch milliseconds.
    pub time: i64,
    /// Open price.
    pub open: f64,
    /// High price.
    pub high: f64,
    /// Low price.
    pub low: f64,
    /// Close price.
    pub close: f64,
    /// Traded volume.
    pub volume: f64,
}

impl Bar {
    /// Whether every OHLCV field matches `other` within [`PRICE_EPSILON`].
    #[must_use]
    pub fn same_values(&self, other: &Self) -> bool {
        [
            (self.open, other.open),
            (self.high, other.high),
            (self.low, other.low),
            (self.close, other.close),
            (self.volume, other.volume),
        ]
        .iter()
        .all(|(a, b)| (a - b).abs() <= PRICE_EPSILON)
    }
}

/// Read a JSON value as a finite number, accepting numeric strings.
///
/// Missing, non-numeric and non-finite values all become `0.0`.
#[must_use]
pub fn number_or_zero(value: Option<&serde_json::Value>) -> f64 {
    let parsed = match value {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite()).unwrap_or(0.0)
}

// =============================================================================
// Cache Key
// =============================================================================

/// Cache key: one chart series.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BarKey {
    /// Instrument symbol.
    pub symbol: String,
    /// Resolution (timeframe) string, e.g. `1`, `60`, `1D`.
    pub resolution: String,
}

impl BarKey {
    /// Create a key.
    #[must_use]
    pub fn new(symbol: impl Into<String>, resolution: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            resolution: resolution.into(),
        }
    }
}

impl fmt::Display for BarKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}__{}", self.symbol, self.resolution)
    }
}

// =============================================================================
// Bar Cache
// =============================================================================

/// Result of offering a bar to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// No bar was cached for the key.
    Inserted,
    /// A newer bar, or a same-time bar with changed values, replaced the cached one.
    Replaced,
    /// Older than the cached bar; dropped.
    Stale,
    /// Same time and same values as the cached bar; dropped.
    Duplicate,
}

impl CacheOutcome {
    /// Classify `bar` against the previously accepted bar, if any.
    #[must_use]
    pub fn classify(previous: Option<&Bar>, bar: &Bar) -> Self {
        match previous {
            None => Self::Inserted,
            Some(previous) if bar.time < previous.time => Self::Stale,
            Some(previous) if bar.time == previous.time && bar.same_values(previous) => {
                Self::Duplicate
            }
            Some(_) => Self::Replaced,
        }
    }

    /// Whether the bar should be delivered to the subscriber.
    #[must_use]
    pub const fn is_accepted(self) -> bool {
        matches!(self, Self::Inserted | Self::Replaced)
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedBar {
    latest: Bar,
    history: Option<Bar>,
}

/// Bounded last-bar cache with oldest-inserted eviction.
#[derive(Debug)]
pub struct BarCache {
    capacity: usize,
    entries: IndexMap<BarKey, CachedBar>,
}

impl Default for BarCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl BarCache {
    /// Create a cache holding at most `capacity` keys (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: IndexMap::new(),
        }
    }

    /// Offer a streamed bar, applying the ordering rule.
    pub fn apply(&mut self, key: BarKey, bar: Bar) -> CacheOutcome {
        let existing = self.entries.get(&key).copied();
        let outcome = CacheOutcome::classify(existing.as_ref().map(|e| &e.latest), &bar);
        if outcome.is_accepted() {
            self.store(
                key,
                CachedBar {
                    latest: bar,
                    history: existing.and_then(|e| e.history),
                },
            );
        }
        outcome
    }

    /// Offer the last bar of a history response.
    ///
    /// A bar older than the cached one is ignored, so an older page never
    /// moves the series back in time. Returns whether the bar was taken.
    pub fn seed(&mut self, key: BarKey, bar: Bar) -> bool {
        let latest = self.entries.get(&key).map(|e| e.latest);
        if CacheOutcome::classify(latest.as_ref(), &bar) == CacheOutcome::Stale {
            return false;
        }
        self.store(
            key,
            CachedBar {
                latest: bar,
                history: Some(bar),
            },
        );
        true
    }

    /// Cached bar for a key.
    #[must_use]
    pub fn get(&self, key: &BarKey) -> Option<&Bar> {
        self.entries.get(key).map(|e| &e.latest)
    }

    /// Last history bar seeded for a key, if still cached.
    #[must_use]
    pub fn history(&self, key: &BarKey) -> Option<&Bar> {
        self.entries.get(key).and_then(|e| e.history.as_ref())
    }

    /// Drop the cached bar for a key.
    pub fn remove(&mut self, key: &BarKey) -> Option<Bar> {
        self.entries.shift_remove(key).map(|e| e.latest)
    }

    /// Drop the cached bars for all given keys.
    pub fn remove_all<'a>(&mut self, keys: impl IntoIterator<Item = &'a BarKey>) {
        for key in keys {
            self.entries.shift_remove(key);
        }
    }

    /// Number of cached keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of cached keys.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    fn store(&mut self, key: BarKey, entry: CachedBar) {
        // Re-inserting moves the key to the newest position.
        self.entries.shift_remove(&key);
        self.entries.insert(key, entry);
        while self.entries.len() > self.capacity {
            self.entries.shift_remove_index(0);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;
    use test_case::test_case;

    use super::*;

    fn bar(time: i64, close: f64) -> Bar {
        Bar {
            time,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close,
            volume: 100.0,
        }
    }

    fn key() -> BarKey {
        BarKey::new("SSE:600519", "1")
    }

    #[test]
    fn first_bar_is_inserted() {
        let mut cache = BarCache::default();
        assert_eq!(cache.apply(key(), bar(100, 1.5)), CacheOutcome::Inserted);
        assert_eq!(cache.get(&key()).unwrap().time, 100);
    }

    #[test]
    fn identical_repeat_is_duplicate() {
        let mut cache = BarCache::default();
        cache.apply(key(), bar(100, 1.5));
        assert_eq!(cache.apply(key(), bar(100, 1.5)), CacheOutcome::Duplicate);
    }

    #[test]
    fn repeat_within_epsilon_is_duplicate() {
        let mut cache = BarCache::default();
        cache.apply(key(), bar(100, 1.5));
        assert_eq!(
            cache.apply(key(), bar(100, 1.5 + 1e-12)),
            CacheOutcome::Duplicate
        );
    }

    #[test]
    fn same_time_with_new_close_replaces() {
        let mut cache = BarCache::default();
        cache.apply(key(), bar(100, 1.5));
        assert_eq!(cache.apply(key(), bar(100, 1.6)), CacheOutcome::Replaced);
        assert!((cache.get(&key()).unwrap().close - 1.6).abs() < f64::EPSILON);
    }

    #[test]
    fn older_bar_is_stale() {
        let mut cache = BarCache::default();
        cache.apply(key(), bar(200, 1.5));
        assert_eq!(cache.apply(key(), bar(100, 9.0)), CacheOutcome::Stale);
        assert_eq!(cache.get(&key()).unwrap().time, 200);
    }

    #[test]
    fn evicts_oldest_inserted_key() {
        let mut cache = BarCache::new(2);
        cache.apply(BarKey::new("A", "1"), bar(1, 1.0));
        cache.apply(BarKey::new("B", "1"), bar(1, 1.0));
        cache.apply(BarKey::new("C", "1"), bar(1, 1.0));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&BarKey::new("A", "1")).is_none());
        assert!(cache.get(&BarKey::new("C", "1")).is_some());
    }

    #[test]
    fn replacement_refreshes_position() {
        let mut cache = BarCache::new(2);
        cache.apply(BarKey::new("A", "1"), bar(1, 1.0));
        cache.apply(BarKey::new("B", "1"), bar(1, 1.0));
        cache.apply(BarKey::new("A", "1"), bar(2, 1.0));
        cache.apply(BarKey::new("C", "1"), bar(1, 1.0));

        assert!(cache.get(&BarKey::new("A", "1")).is_some());
        assert!(cache.get(&BarKey::new("B", "1")).is_none());
    }

    #[test]
    fn older_history_page_does_not_rewind_series() {
        let mut cache = BarCache::default();
        cache.apply(key(), bar(500, 1.0));
        assert!(!cache.seed(key(), bar(100, 1.0)));
        assert_eq!(cache.get(&key()).unwrap().time, 500);
        assert_eq!(cache.apply(key(), bar(200, 1.0)), CacheOutcome::Stale);
    }

    #[test]
    fn history_seed_sets_floor_and_latest() {
        let mut cache = BarCache::default();
        assert!(cache.seed(key(), bar(100, 1.0)));
        assert_eq!(cache.history(&key()).unwrap().time, 100);
        assert_eq!(cache.apply(key(), bar(50, 1.0)), CacheOutcome::Stale);

        cache.apply(key(), bar(300, 1.0));
        assert_eq!(cache.get(&key()).unwrap().time, 300);
        assert_eq!(cache.history(&key()).unwrap().time, 100);
    }

    #[test_case(None, 100, CacheOutcome::Inserted ; "nothing before")]
    #[test_case(Some(200), 100, CacheOutcome::Stale ; "older")]
    #[test_case(Some(100), 100, CacheOutcome::Duplicate ; "same bar")]
    #[test_case(Some(100), 200, CacheOutcome::Replaced ; "newer")]
    fn classify_against_previous(previous: Option<i64>, time: i64, expected: CacheOutcome) {
        let previous = previous.map(|t| bar(t, 1.5));
        assert_eq!(
            CacheOutcome::classify(previous.as_ref(), &bar(time, 1.5)),
            expected
        );
    }

    #[test]
    fn remove_all_clears_given_keys() {
        let mut cache = BarCache::default();
        cache.apply(BarKey::new("A", "1"), bar(1, 1.0));
        cache.apply(BarKey::new("B", "1"), bar(1, 1.0));
        cache.remove_all(&[BarKey::new("A", "1")]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        assert_eq!(BarCache::new(0).capacity(), 1);
    }

    #[test]
    fn key_display() {
        assert_eq!(key().to_string(), "SSE:600519__1");
    }

    #[test_case(Some(json!(12.5)), 12.5 ; "number")]
    #[test_case(Some(json!("7.25")), 7.25 ; "numeric string")]
    #[test_case(Some(json!("abc")), 0.0 ; "garbage string")]
    #[test_case(Some(json!(null)), 0.0 ; "null")]
    #[test_case(None, 0.0 ; "missing")]
    fn lenient_numbers(value: Option<serde_json::Value>, expected: f64) {
        assert!((number_or_zero(value.as_ref()) - expected).abs() < f64::EPSILON);
    }

    proptest! {
        #[test]
        fn accepted_times_never_decrease(times in proptest::collection::vec(0i64..50, 1..64)) {
            let mut cache = BarCache::default();
            let mut delivered = Vec::new();
            for (i, time) in times.iter().enumerate() {
                #[allow(clippy::cast_precision_loss)]
                let close = (i % 3) as f64;
                if cache.apply(key(), bar(*time, close)).is_accepted() {
                    delivered.push(*time);
                }
            }
            prop_assert!(delivered.windows(2).all(|w| w[0] <= w[1]));
        }
    }
}
