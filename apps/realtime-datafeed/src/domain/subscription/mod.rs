//! Subscription Registry
//!
//! The caller's desired set of bar and quote subscriptions, kept
//! independently of connection state.
//!
//! # Design
//!
//! The registry tracks two things:
//! - the live subscriptions, keyed by subscriber UID (bars) or listener
//!   GUID (quotes), in insertion order
//! - the last signature successfully sent for each key
//! - the last bar delivered to each bar subscriber
//!
//! A resync compares the two to decide what must be re-sent. A full resync
//! clears the synchronized side so everything goes out again.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::domain::bars::{Bar, BarKey};

// =============================================================================
// Handlers
// =============================================================================

/// Invoked with each accepted bar.
pub type BarHandler = Arc<dyn Fn(Bar) + Send + Sync>;

/// Invoked when the caller must discard its own chart data for a series.
pub type ResetCacheHandler = Arc<dyn Fn() + Send + Sync>;

/// Invoked with each batch of quotes.
pub type QuoteHandler = Arc<dyn Fn(&[serde_json::Value]) + Send + Sync>;

/// Wrap a closure as a [`BarHandler`].
pub fn bar_handler(f: impl Fn(Bar) + Send + Sync + 'static) -> BarHandler {
    Arc::new(f)
}

/// Wrap a closure as a [`ResetCacheHandler`].
pub fn reset_handler(f: impl Fn() + Send + Sync + 'static) -> ResetCacheHandler {
    Arc::new(f)
}

/// Wrap a closure as a [`QuoteHandler`].
pub fn quote_handler(f: impl Fn(&[serde_json::Value]) + Send + Sync + 'static) -> QuoteHandler {
    Arc::new(f)
}

// =============================================================================
// Subscriptions
// =============================================================================

/// A streamed bar series for one chart.
#[derive(Clone)]
pub struct BarSubscription {
    /// Instrument symbol.
    pub symbol: String,
    /// Resolution string.
    pub resolution: String,
    /// Optional trading session identifier.
    pub session: Option<String>,
    /// Per-bar callback.
    pub on_bar: BarHandler,
    /// Optional reset-cache callback.
    pub on_reset_cache: Option<ResetCacheHandler>,
}

impl BarSubscription {
    /// Cache key for this series.
    #[must_use]
    pub fn key(&self) -> BarKey {
        BarKey::new(self.symbol.clone(), self.resolution.clone())
    }

    /// Signature used to detect whether a resend is needed.
    #[must_use]
    pub fn signature(&self) -> Signature {
        Signature::Bars {
            symbol: self.symbol.clone(),
            resolution: self.resolution.clone(),
            session: self.session.clone(),
        }
    }
}

impl fmt::Debug for BarSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BarSubscription")
            .field("symbol", &self.symbol)
            .field("resolution", &self.resolution)
            .field("session", &self.session)
            .field("has_reset_handler", &self.on_reset_cache.is_some())
            .finish_non_exhaustive()
    }
}

/// A quote listener over a set of symbols.
#[derive(Clone)]
pub struct QuoteSubscription {
    /// Primary symbols.
    pub symbols: Vec<String>,
    /// Symbols the backend should stream at a higher rate.
    pub fast_symbols: Vec<String>,
    /// Batch callback.
    pub on_quotes: QuoteHandler,
}

impl QuoteSubscription {
    /// Signature over the sorted symbol sets.
    #[must_use]
    pub fn signature(&self) -> Signature {
        let mut symbols = self.symbols.clone();
        symbols.sort();
        symbols.dedup();
        let mut fast_symbols = self.fast_symbols.clone();
        fast_symbols.sort();
        fast_symbols.dedup();
        Signature::Quotes {
            symbols,
            fast_symbols,
        }
    }

    /// Primary then fast symbols, first occurrence kept.
    #[must_use]
    pub fn all_symbols(&self) -> Vec<String> {
        let mut seen = Vec::with_capacity(self.symbols.len() + self.fast_symbols.len());
        for symbol in self.symbols.iter().chain(&self.fast_symbols) {
            if !seen.contains(symbol) {
                seen.push(symbol.clone());
            }
        }
        seen
    }
}

impl fmt::Debug for QuoteSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuoteSubscription")
            .field("symbols", &self.symbols)
            .field("fast_symbols", &self.fast_symbols)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Keys and Signatures
// =============================================================================

/// Registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubscriptionKey {
    /// Bar subscription by subscriber UID.
    Bars(String),
    /// Quote subscription by listener GUID.
    Quotes(String),
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bars(uid) => write!(f, "bars:{uid}"),
            Self::Quotes(guid) => write!(f, "quotes:{guid}"),
        }
    }
}

/// Comparable summary of a subscription's wire parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signature {
    /// Bar series parameters.
    Bars {
        /// Symbol.
        symbol: String,
        /// Resolution.
        resolution: String,
        /// Session, if any.
        session: Option<String>,
    },
    /// Sorted quote symbol sets.
    Quotes {
        /// Sorted primary symbols.
        symbols: Vec<String>,
        /// Sorted fast symbols.
        fast_symbols: Vec<String>,
    },
}

/// Result of storing a bar subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarUpsert {
    /// New subscriber UID.
    Created,
    /// Existing subscriber UID replaced.
    Replaced {
        /// Whether the session differs from the stored one.
        session_changed: bool,
    },
}

/// Result of storing a quote subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuoteUpsert {
    /// New listener GUID.
    Created,
    /// Existing listener with different symbol sets.
    Changed,
    /// Existing listener with identical symbol sets; only the callback changed.
    Unchanged,
}

// =============================================================================
// Registry
// =============================================================================

/// Desired subscriptions plus their last synchronized signatures.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    bars: IndexMap<String, BarSubscription>,
    quotes: IndexMap<String, QuoteSubscription>,
    synced: HashMap<SubscriptionKey, Signature>,
    delivered: HashMap<String, Bar>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store or replace a bar subscription.
    ///
    /// Replacing keeps the original insertion position. Moving to another
    /// series or session forgets the last delivered bar.
    pub fn upsert_bar(&mut self, uid: &str, subscription: BarSubscription) -> BarUpsert {
        match self.bars.get_mut(uid) {
            Some(existing) => {
                let session_changed = existing.session != subscription.session;
                if session_changed || existing.key() != subscription.key() {
                    self.delivered.remove(uid);
                }
                *existing = subscription;
                BarUpsert::Replaced { session_changed }
            }
            None => {
                self.bars.insert(uid.to_string(), subscription);
                BarUpsert::Created
            }
        }
    }

    /// Remove a bar subscription and forget its synchronized signature.
    pub fn remove_bar(&mut self, uid: &str) -> Option<BarSubscription> {
        self.synced.remove(&SubscriptionKey::Bars(uid.to_string()));
        self.delivered.remove(uid);
        self.bars.shift_remove(uid)
    }

    /// Look up a bar subscription.
    #[must_use]
    pub fn bar(&self, uid: &str) -> Option<&BarSubscription> {
        self.bars.get(uid)
    }

    /// Last bar delivered to a subscriber.
    #[must_use]
    pub fn last_delivered(&self, uid: &str) -> Option<&Bar> {
        self.delivered.get(uid)
    }

    /// Record a bar handed to a subscriber's callback.
    pub fn record_delivered(&mut self, uid: &str, bar: Bar) {
        if self.bars.contains_key(uid) {
            self.delivered.insert(uid.to_string(), bar);
        }
    }

    /// Forget what the given subscribers last received.
    pub fn forget_delivered<'a>(&mut self, uids: impl IntoIterator<Item = &'a String>) {
        for uid in uids {
            self.delivered.remove(uid);
        }
    }

    /// Store or replace a quote subscription.
    pub fn upsert_quote(&mut self, guid: &str, subscription: QuoteSubscription) -> QuoteUpsert {
        match self.quotes.get_mut(guid) {
            Some(existing) => {
                let unchanged = existing.signature() == subscription.signature();
                *existing = subscription;
                if unchanged {
                    QuoteUpsert::Unchanged
                } else {
                    QuoteUpsert::Changed
                }
            }
            None => {
                self.quotes.insert(guid.to_string(), subscription);
                QuoteUpsert::Created
            }
        }
    }

    /// Remove a quote subscription and forget its synchronized signature.
    pub fn remove_quote(&mut self, guid: &str) -> Option<QuoteSubscription> {
        self.synced
            .remove(&SubscriptionKey::Quotes(guid.to_string()));
        self.quotes.shift_remove(guid)
    }

    /// Look up a quote subscription.
    #[must_use]
    pub fn quote(&self, guid: &str) -> Option<&QuoteSubscription> {
        self.quotes.get(guid)
    }

    /// Bar subscriptions in insertion order.
    pub fn bar_entries(&self) -> impl Iterator<Item = (&String, &BarSubscription)> {
        self.bars.iter()
    }

    /// Quote subscriptions in insertion order.
    pub fn quote_entries(&self) -> impl Iterator<Item = (&String, &QuoteSubscription)> {
        self.quotes.iter()
    }

    /// Number of bar subscriptions.
    #[must_use]
    pub fn bar_count(&self) -> usize {
        self.bars.len()
    }

    /// Number of quote subscriptions.
    #[must_use]
    pub fn quote_count(&self) -> usize {
        self.quotes.len()
    }

    /// Whether there are no subscriptions of either kind.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bars.is_empty() && self.quotes.is_empty()
    }

    /// Current signature of a live subscription.
    #[must_use]
    pub fn live_signature(&self, key: &SubscriptionKey) -> Option<Signature> {
        match key {
            SubscriptionKey::Bars(uid) => self.bars.get(uid).map(BarSubscription::signature),
            SubscriptionKey::Quotes(guid) => {
                self.quotes.get(guid).map(QuoteSubscription::signature)
            }
        }
    }

    /// Last signature sent for a key.
    #[must_use]
    pub fn synced_signature(&self, key: &SubscriptionKey) -> Option<&Signature> {
        self.synced.get(key)
    }

    /// Whether the live subscription differs from what was last sent.
    #[must_use]
    pub fn needs_sync(&self, key: &SubscriptionKey) -> bool {
        match self.live_signature(key) {
            Some(live) => self.synced.get(key) != Some(&live),
            None => false,
        }
    }

    /// Record a successful send.
    pub fn mark_synced(&mut self, key: SubscriptionKey, signature: Signature) {
        self.synced.insert(key, signature);
    }

    /// Forget everything that was sent.
    pub fn clear_synced(&mut self) {
        self.synced.clear();
    }

    /// Number of keys with a synchronized signature.
    #[must_use]
    pub fn synced_count(&self) -> usize {
        self.synced.len()
    }
}

// =============================================================================
// Tests
// =============================================================================
