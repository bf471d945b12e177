//! Subscription registry
//!
//! Maps a message type tag to an ordered list of independent consumer
//! callbacks. Dispatch iterates over a snapshot of the list, so handlers
//! may subscribe or unsubscribe from within a callback without corrupting
//! the iteration. Each call is isolated: a panicking handler is logged and
//! the remaining handlers (and the state transition) still run.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, error};

type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Registry of per-tag message handlers
#[derive(Default)]
pub struct SubscriptionRegistry {
    handlers: DashMap<String, Vec<(u64, Handler)>>,
    next_id: AtomicU64,
}

/// Token returned by `subscribe`; removes exactly the handler instance it
/// was issued for. Ignoring the token keeps the subscription alive for the
/// lifetime of the registry.
pub struct SubscriptionHandle {
    registry: Arc<SubscriptionRegistry>,
    tag: String,
    id: u64,
}

impl SubscriptionHandle {
    /// Remove the handler this token was issued for
    pub fn unsubscribe(self) {
        if let Some(mut entry) = self.registry.handlers.get_mut(&self.tag) {
            entry.retain(|(id, _)| *id != self.id);
        }
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler to the list for `tag`, creating the list if absent.
    /// Insertion order defines invocation order.
    pub fn subscribe<F>(self: &Arc<Self>, tag: impl Into<String>, handler: F) -> SubscriptionHandle
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let tag = tag.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .entry(tag.clone())
            .or_default()
            .push((id, Arc::new(handler)));
        debug!("Subscribed handler {} for '{}'", id, tag);

        SubscriptionHandle {
            registry: Arc::clone(self),
            tag,
            id,
        }
    }

    /// Invoke each handler currently registered for `tag`, in registration
    /// order. Handlers run against a snapshot taken at dispatch time.
    pub fn dispatch(&self, tag: &str, data: &Value) {
        let snapshot: Vec<(u64, Handler)> = match self.handlers.get(tag) {
            Some(entry) => entry.value().clone(),
            None => return,
        };

        for (id, handler) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(data))).is_err() {
                error!("Handler {} for '{}' panicked; continuing", id, tag);
            }
        }
    }

    /// Number of handlers currently registered for `tag`
    pub fn handler_count(&self, tag: &str) -> usize {
        self.handlers.get(tag).map_or(0, |entry| entry.len())
    }
}
