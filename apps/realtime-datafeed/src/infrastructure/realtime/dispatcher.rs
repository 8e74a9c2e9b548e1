//! Stream Dispatcher
//!
//! Routes decoded server frames. Data frames are delivered to the
//! registered callbacks directly; control frames are turned into a
//! [`Directive`] for the engine, which owns the connection and the queue.
//!
//! A bar is checked against what its own subscriber last received, so two
//! charts on one series each get their copy. The series cache is kept in
//! step for seeding and reset clearing.
//!
//! Callbacks are looked up in the registry at delivery time, so a frame for
//! a removed subscription has nothing to call and is dropped. A panicking
//! callback is caught and logged; it never unwinds into the engine.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::domain::bars::{Bar, BarCache, CacheOutcome};
use crate::domain::subscription::{SubscriptionKey, SubscriptionRegistry};
use crate::infrastructure::metrics::{self, DropReason};
use crate::infrastructure::realtime::messages::{
    AdapterStatusMessage, BarMessage, QuoteMessage, ServerMessage, is_healthy_status,
};
use crate::infrastructure::realtime::resync::ResyncRequest;

/// What the engine must do after a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Liveness acknowledgment received.
    Pong,
    /// Send an `ack_warning` for this warning id.
    Acknowledge(String),
    /// Resync the registry.
    Resync(ResyncRequest),
    /// Upstream health report.
    Health {
        /// Whether the upstream is healthy.
        healthy: bool,
        /// Status word or reason, for logs.
        reason: String,
        /// Whether the backend asked for a full resync.
        force_reset: bool,
    },
}

/// Run a caller callback, containing any panic.
pub(crate) fn invoke_guarded(callback: &str, target: &str, f: impl FnOnce()) -> bool {
    if catch_unwind(AssertUnwindSafe(f)).is_ok() {
        return true;
    }
    tracing::error!(callback, target, "Subscriber callback panicked");
    metrics::record_callback_panic(callback);
    false
}

/// Routes inbound frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct StreamDispatcher;

impl StreamDispatcher {
    /// Create a dispatcher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Handle one frame.
    pub fn dispatch(
        &self,
        message: ServerMessage,
        registry: &mut SubscriptionRegistry,
        cache: &mut BarCache,
    ) -> Option<Directive> {
        metrics::record_frame_received(message.kind());

        match message {
            ServerMessage::Bar(bar) => {
                Self::deliver_bar(bar, registry, cache);
                None
            }
            ServerMessage::Quote(quote) => {
                Self::deliver_quotes(&quote, registry);
                None
            }
            ServerMessage::Error(error) => {
                tracing::error!(
                    code = ?error.code,
                    listener_guid = ?error.listener_guid,
                    detail = error.message.as_deref().unwrap_or_default(),
                    "Realtime error"
                );
                None
            }
            ServerMessage::Subscribed(ack) => {
                tracing::debug!(subscriber_uid = ?ack.subscriber_uid, "Realtime subscribed");
                None
            }
            ServerMessage::QuoteSubscribed(ack) => {
                tracing::debug!(listener_guid = ?ack.listener_guid, "Realtime quotes subscribed");
                None
            }
            ServerMessage::AdapterStatus(status) => Some(Self::adapter_health(&status)),
            ServerMessage::ConnectionStatus(status) => Some(Directive::Health {
                healthy: is_healthy_status(&status.status),
                reason: format!("connection_status:{}", status.status),
                force_reset: false,
            }),
            ServerMessage::ConnectionReset(reset) => {
                let reason = reset
                    .reason
                    .unwrap_or_else(|| "connection_reset".to_string());
                tracing::warn!(reason = %reason, "Server requested connection reset");
                Some(Directive::Resync(ResyncRequest::full(reason)))
            }
            ServerMessage::SubscriptionReset(reset) => {
                if registry.bar(&reset.subscriber_uid).is_none() {
                    tracing::debug!(
                        subscriber_uid = %reset.subscriber_uid,
                        "Subscription reset for unknown subscriber"
                    );
                    metrics::record_dropped(DropReason::UnknownTarget);
                    return None;
                }
                let reason = reset
                    .reason
                    .unwrap_or_else(|| "subscription_reset".to_string());
                tracing::info!(
                    subscriber_uid = %reset.subscriber_uid,
                    reason = %reason,
                    "Server requested subscription reset"
                );
                Some(Directive::Resync(ResyncRequest::targeted(
                    SubscriptionKey::Bars(reset.subscriber_uid),
                    reason,
                )))
            }
            ServerMessage::SystemWarning(warning) => {
                tracing::warn!(
                    warning_id = %warning.warning_id,
                    requires_ack = warning.requires_ack,
                    detail = warning.message.as_deref().unwrap_or_default(),
                    "System warning"
                );
                warning
                    .requires_ack
                    .then_some(Directive::Acknowledge(warning.warning_id))
            }
            ServerMessage::Pong => Some(Directive::Pong),
            ServerMessage::Hello => {
                tracing::debug!("Realtime hello");
                None
            }
            ServerMessage::Unrecognized { kind, reason } => {
                tracing::debug!(kind = ?kind, reason = %reason, "Ignoring unrecognized frame");
                metrics::record_dropped(DropReason::Unrecognized);
                None
            }
        }
    }

    fn deliver_bar(
        message: BarMessage,
        registry: &mut SubscriptionRegistry,
        cache: &mut BarCache,
    ) {
        let uid = message.subscriber_uid;
        let Some(subscription) = registry.bar(&uid) else {
            tracing::trace!(subscriber_uid = %uid, "Bar for unknown subscriber");
            metrics::record_dropped(DropReason::UnknownTarget);
            return;
        };
        let key = subscription.key();
        let on_bar = Arc::clone(&subscription.on_bar);

        let bar = Bar::from(message.bar);
        let previous = registry
            .last_delivered(&uid)
            .or_else(|| cache.history(&key))
            .copied();
        cache.apply(key, bar);

        match CacheOutcome::classify(previous.as_ref(), &bar) {
            CacheOutcome::Inserted | CacheOutcome::Replaced => {
                registry.record_delivered(&uid, bar);
                invoke_guarded("on_bar", &uid, || on_bar(bar));
            }
            CacheOutcome::Stale => {
                tracing::trace!(subscriber_uid = %uid, time = bar.time, "Dropping stale bar");
                metrics::record_dropped(DropReason::StaleBar);
            }
            CacheOutcome::Duplicate => {
                metrics::record_dropped(DropReason::DuplicateBar);
            }
        }
    }

    fn deliver_quotes(message: &QuoteMessage, registry: &SubscriptionRegistry) {
        let Some(subscription) = registry.quote(&message.listener_guid) else {
            tracing::trace!(listener_guid = %message.listener_guid, "Quotes for unknown listener");
            metrics::record_dropped(DropReason::UnknownTarget);
            return;
        };

        let on_quotes = &subscription.on_quotes;
        invoke_guarded("on_quotes", &message.listener_guid, || {
            on_quotes(&message.quotes);
        });
    }

    fn adapter_health(status: &AdapterStatusMessage) -> Directive {
        if let Some(expires) = status.auth_token_exp_ms {
            tracing::debug!(auth_token_exp_ms = expires, "Adapter auth token expiry");
        }
        let healthy = is_healthy_status(&status.status);
        let reason = status
            .reason
            .clone()
            .unwrap_or_else(|| format!("adapter_status:{}", status.status));
        if healthy {
            tracing::info!(status = %status.status, reason = %reason, "Adapter status update");
        } else {
            tracing::warn!(status = %status.status, reason = %reason, "Adapter status update");
        }
        Directive::Health {
            healthy,
            reason,
            force_reset: status.reset.unwrap_or(false),
        }
    }
}
