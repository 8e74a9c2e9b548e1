//! Resync Engine
//!
//! Turns a resync request into a plan: which reset-cache callbacks to run,
//! which cache keys to clear, and which subscribe frames to send. Planning
//! works on a snapshot of the registry; the engine re-checks each entry
//! against the live registry before sending, so entries removed or changed
//! mid-run are skipped rather than replayed stale.
//!
//! # Modes
//!
//! - **Full**: every active bar subscription gets its reset callback and
//!   its cache key cleared, the synchronized map is wiped, and every entry
//!   is re-sent in insertion order (bars, then quotes).
//! - **Targeted**: the targeted bar subscriptions get their reset callback
//!   and cache clear; entries that are targeted or whose live signature
//!   differs from the synchronized one are re-sent.

use indexmap::IndexSet;

use crate::domain::bars::BarKey;
use crate::domain::subscription::{
    ResetCacheHandler, Signature, SubscriptionKey, SubscriptionRegistry,
};
use crate::infrastructure::realtime::messages::ClientMessage;

/// What a resync covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResyncScope {
    /// Everything.
    Full,
    /// Unsynchronized entries plus the given keys.
    Targeted(IndexSet<SubscriptionKey>),
}

/// A request to resync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResyncRequest {
    /// Coverage.
    pub scope: ResyncScope,
    /// Trigger, for logs.
    pub reason: String,
}

impl ResyncRequest {
    /// Full resync.
    #[must_use]
    pub fn full(reason: impl Into<String>) -> Self {
        Self {
            scope: ResyncScope::Full,
            reason: reason.into(),
        }
    }

    /// Resync of unsynchronized entries only.
    #[must_use]
    pub fn incremental(reason: impl Into<String>) -> Self {
        Self {
            scope: ResyncScope::Targeted(IndexSet::new()),
            reason: reason.into(),
        }
    }

    /// Resync targeting one key.
    #[must_use]
    pub fn targeted(key: SubscriptionKey, reason: impl Into<String>) -> Self {
        let mut targets = IndexSet::new();
        targets.insert(key);
        Self {
            scope: ResyncScope::Targeted(targets),
            reason: reason.into(),
        }
    }

    /// Whether this is a full resync.
    #[must_use]
    pub const fn is_full(&self) -> bool {
        matches!(self.scope, ResyncScope::Full)
    }

    /// Fold another request into this one: full dominates, targets are
    /// unioned, the later reason wins.
    pub fn merge(&mut self, other: Self) {
        self.scope = match (std::mem::replace(&mut self.scope, ResyncScope::Full), other.scope) {
            (ResyncScope::Targeted(mut mine), ResyncScope::Targeted(theirs)) => {
                mine.extend(theirs);
                ResyncScope::Targeted(mine)
            }
            _ => ResyncScope::Full,
        };
        self.reason = other.reason;
    }
}

/// Accumulates reset triggers seen while handling one inbound message.
#[derive(Debug, Default)]
pub struct PendingResync(Option<ResyncRequest>);

impl PendingResync {
    /// Add a trigger.
    pub fn push(&mut self, request: ResyncRequest) {
        match &mut self.0 {
            Some(pending) => pending.merge(request),
            None => self.0 = Some(request),
        }
    }

    /// Take the coalesced request, if any.
    pub const fn take(&mut self) -> Option<ResyncRequest> {
        self.0.take()
    }
}

/// A frame to send during a resync, with the signature it synchronizes.
#[derive(Debug, Clone)]
pub struct PlannedSend {
    /// Registry key.
    pub key: SubscriptionKey,
    /// Signature at planning time.
    pub signature: Signature,
    /// Frame to send.
    pub message: ClientMessage,
}

/// Everything a resync run will do, in order.
#[derive(Default)]
pub struct ResyncPlan {
    /// Reset-cache callbacks, invoked before anything is cleared.
    pub reset_handlers: Vec<(String, ResetCacheHandler)>,
    /// Cache keys to clear.
    pub clear_keys: Vec<BarKey>,
    /// Bar subscribers whose last delivered bar is forgotten.
    pub clear_subscribers: Vec<String>,
    /// Whether to wipe the synchronized map.
    pub clear_synced: bool,
    /// Frames to send, in insertion order.
    pub sends: Vec<PlannedSend>,
}

impl std::fmt::Debug for ResyncPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResyncPlan")
            .field("reset_handlers", &self.reset_handlers.len())
            .field("clear_keys", &self.clear_keys)
            .field("clear_subscribers", &self.clear_subscribers)
            .field("clear_synced", &self.clear_synced)
            .field("sends", &self.sends)
            .finish()
    }
}

/// Builds resync plans from registry snapshots.
#[derive(Debug, Default, Clone, Copy)]
pub struct ResyncEngine;

impl ResyncEngine {
    /// Plan a resync against the current registry.
    #[must_use]
    pub fn plan(request: &ResyncRequest, registry: &SubscriptionRegistry) -> ResyncPlan {
        let mut plan = ResyncPlan {
            clear_synced: request.is_full(),
            ..ResyncPlan::default()
        };

        let is_reset_target = |key: &SubscriptionKey| match &request.scope {
            ResyncScope::Full => true,
            ResyncScope::Targeted(targets) => targets.contains(key),
        };

        for (uid, subscription) in registry.bar_entries() {
            let key = SubscriptionKey::Bars(uid.clone());
            if is_reset_target(&key) {
                if let Some(handler) = &subscription.on_reset_cache {
                    plan.reset_handlers.push((uid.clone(), handler.clone()));
                }
                plan.clear_keys.push(subscription.key());
                plan.clear_subscribers.push(uid.clone());
            }
        }

        let keys = registry
            .bar_entries()
            .map(|(uid, _)| SubscriptionKey::Bars(uid.clone()))
            .chain(
                registry
                    .quote_entries()
                    .map(|(guid, _)| SubscriptionKey::Quotes(guid.clone())),
            );
        for key in keys {
            if is_reset_target(&key) || registry.needs_sync(&key) {
                plan.sends.extend(Self::subscribe_frame(registry, key));
            }
        }

        plan
    }

    /// The subscribe frame that synchronizes one live entry.
    #[must_use]
    pub fn subscribe_frame(
        registry: &SubscriptionRegistry,
        key: SubscriptionKey,
    ) -> Option<PlannedSend> {
        let (signature, message) = match &key {
            SubscriptionKey::Bars(uid) => {
                let subscription = registry.bar(uid)?;
                (
                    subscription.signature(),
                    ClientMessage::Subscribe {
                        symbol: subscription.symbol.clone(),
                        resolution: subscription.resolution.clone(),
                        session: subscription.session.clone(),
                        subscriber_uid: uid.clone(),
                    },
                )
            }
            SubscriptionKey::Quotes(guid) => {
                let subscription = registry.quote(guid)?;
                (
                    subscription.signature(),
                    ClientMessage::SubscribeQuotes {
                        listener_guid: guid.clone(),
                        symbols: subscription.symbols.clone(),
                        fast_symbols: subscription.fast_symbols.clone(),
                    },
                )
            }
        };
        Some(PlannedSend {
            key,
            signature,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::domain::subscription::{
        BarSubscription, QuoteSubscription, bar_handler, quote_handler, reset_handler,
    };

    fn bar_sub(symbol: &str, with_reset: bool) -> BarSubscription {
        BarSubscription {
            symbol: symbol.to_string(),
            resolution: "1".to_string(),
            session: None,
            on_bar: bar_handler(|_| {}),
            on_reset_cache: with_reset.then(|| reset_handler(|| {})),
        }
    }

    fn quote_sub(symbols: &[&str]) -> QuoteSubscription {
        QuoteSubscription {
            symbols: symbols.iter().map(ToString::to_string).collect(),
            fast_symbols: vec![],
            on_quotes: quote_handler(|_| {}),
        }
    }

    fn mark_all_synced(registry: &mut SubscriptionRegistry) {
        let plan = ResyncEngine::plan(&ResyncRequest::full("test"), registry);
        for send in plan.sends {
            registry.mark_synced(send.key, send.signature);
        }
    }

    #[test]
    fn full_plan_covers_everything_in_order() {
        let mut registry = SubscriptionRegistry::new();
        registry.upsert_bar("A", bar_sub("X", true));
        registry.upsert_quote("L", quote_sub(&["Q"]));
        registry.upsert_bar("B", bar_sub("Y", false));
        mark_all_synced(&mut registry);

        let plan = ResyncEngine::plan(&ResyncRequest::full("connection_reset"), &registry);
        assert!(plan.clear_synced);
        assert_eq!(plan.reset_handlers.len(), 1);
        assert_eq!(plan.clear_keys.len(), 2);
        let kinds: Vec<_> = plan.sends.iter().map(|s| s.key.to_string()).collect();
        assert_eq!(kinds, vec!["bars:A", "bars:B", "quotes:L"]);
    }

    #[test]
    fn incremental_plan_sends_only_unsynced() {
        let mut registry = SubscriptionRegistry::new();
        registry.upsert_bar("A", bar_sub("X", true));
        mark_all_synced(&mut registry);
        registry.upsert_quote("L", quote_sub(&["Q"]));

        let plan = ResyncEngine::plan(&ResyncRequest::incremental("connected"), &registry);
        assert!(!plan.clear_synced);
        assert!(plan.reset_handlers.is_empty());
        assert!(plan.clear_keys.is_empty());
        assert_eq!(plan.sends.len(), 1);
        assert_eq!(plan.sends[0].key, SubscriptionKey::Quotes("L".to_string()));
    }

    #[test]
    fn targeted_plan_resets_only_target() {
        let mut registry = SubscriptionRegistry::new();
        registry.upsert_bar("A", bar_sub("X", true));
        registry.upsert_bar("B", bar_sub("Y", true));
        mark_all_synced(&mut registry);

        let request = ResyncRequest::targeted(SubscriptionKey::Bars("B".to_string()), "session");
        let plan = ResyncEngine::plan(&request, &registry);

        assert_eq!(plan.reset_handlers.len(), 1);
        assert_eq!(plan.reset_handlers[0].0, "B");
        assert_eq!(plan.clear_keys, vec![BarKey::new("Y", "1")]);
        assert_eq!(plan.clear_subscribers, vec!["B".to_string()]);
        assert_eq!(plan.sends.len(), 1);
    }

    #[test]
    fn targeting_unknown_key_is_a_noop() {
        let mut registry = SubscriptionRegistry::new();
        registry.upsert_bar("A", bar_sub("X", true));
        mark_all_synced(&mut registry);

        let request = ResyncRequest::targeted(SubscriptionKey::Bars("gone".to_string()), "reset");
        let plan = ResyncEngine::plan(&request, &registry);
        assert!(plan.sends.is_empty());
        assert!(plan.reset_handlers.is_empty());
    }

    #[test]
    fn merge_full_dominates_and_last_reason_wins() {
        let mut pending = PendingResync::default();
        pending.push(ResyncRequest::targeted(
            SubscriptionKey::Bars("A".to_string()),
            "subscription_reset",
        ));
        pending.push(ResyncRequest::full("connection_reset"));
        pending.push(ResyncRequest::targeted(
            SubscriptionKey::Bars("B".to_string()),
            "late",
        ));

        let merged = pending.take().unwrap();
        assert!(merged.is_full());
        assert_eq!(merged.reason, "late");
        assert!(pending.take().is_none());
    }

    #[test]
    fn merge_unions_targets() {
        let mut request =
            ResyncRequest::targeted(SubscriptionKey::Bars("A".to_string()), "first");
        request.merge(ResyncRequest::targeted(
            SubscriptionKey::Bars("B".to_string()),
            "second",
        ));
        match request.scope {
            ResyncScope::Targeted(targets) => assert_eq!(targets.len(), 2),
            ResyncScope::Full => panic!("expected targeted scope"),
        }
    }

    #[test]
    fn each_reset_handler_planned_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut registry = SubscriptionRegistry::new();
        registry.upsert_bar(
            "A",
            BarSubscription {
                on_reset_cache: Some(reset_handler(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
                ..bar_sub("X", false)
            },
        );

        let plan = ResyncEngine::plan(&ResyncRequest::full("test"), &registry);
        for (_, handler) in &plan.reset_handlers {
            handler();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
