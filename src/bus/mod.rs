//! Process-local correlation bus.
//!
//! Publishers emit a [`Topic`] with a [`Payload`]; subscribers register a set
//! of topics and are invoked once every topic in the set has been published
//! at least once since registration.
//!
//! # Module Structure
//!
//! - `topic` - Topic, correlation key, payload and delivery types
//! - `waiter` - Future adapter over a one-shot compound subscription
//! - `barrier` - Readiness barrier built on a compound subscription
//!
//! # Semantics
//!
//! ```text
//! subscribe({A, B, C}, h)
//! publish(B) -> nothing        received = {B}
//! publish(A) -> nothing        received = {A, B}
//! publish(B) -> nothing        first payload for B is kept
//! publish(C) -> h({A, B, C})   one-shot: removed
//! ```
//!
//! There is no replay: a subscription only sees publications made after it
//! was registered.

pub mod barrier;
mod topic;
mod waiter;

pub use barrier::{Barrier, BarrierError, Milestone};
pub use topic::{CorrelationKey, Delivery, Payload, Resolution, Topic};
pub use waiter::Waiter;

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::oneshot;

/// Default per-topic subscriber count before a leak warning is logged.
pub const DEFAULT_MAX_SUBSCRIBERS: usize = 50;

/// Identifier of a registered subscription (monotonic = registration order).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type OnceHandler = Box<dyn FnOnce(Delivery) + Send>;
type PersistentHandler = Arc<dyn Fn(Delivery) + Send + Sync>;

enum Handler {
    Once(OnceHandler),
    Persistent(PersistentHandler),
}

struct Subscription {
    awaited: FxHashSet<Topic>,
    received: FxHashMap<Topic, Payload>,
    handler: Handler,
}

/// A handler that became due during one publication.
enum Due {
    Once(OnceHandler, Delivery),
    Persistent(PersistentHandler, Delivery),
}

#[derive(Default)]
struct Table {
    next_id: u64,
    /// Subscriptions in registration order.
    subscriptions: BTreeMap<SubscriptionId, Subscription>,
    /// Topic → subscriptions awaiting it, ascending.
    index: FxHashMap<Topic, Vec<SubscriptionId>>,
}

/// The correlation bus.
pub struct Bus {
    table: Mutex<Table>,
    max_subscribers: usize,
}

impl Bus {
    pub fn new() -> Self {
        Self::with_max_subscribers(DEFAULT_MAX_SUBSCRIBERS)
    }

    pub fn with_max_subscribers(max_subscribers: usize) -> Self {
        Self {
            table: Mutex::new(Table::default()),
            max_subscribers,
        }
    }

    // =========================================================================
    // Subscribe
    // =========================================================================

    /// Register a one-shot subscription over `topics`.
    ///
    /// An empty topic set is trivially satisfied: the handler runs immediately.
    pub fn subscribe<I, F>(&self, topics: I, handler: F) -> SubscriptionId
    where
        I: IntoIterator<Item = Topic>,
        F: FnOnce(Delivery) + Send + 'static,
    {
        self.register(topics, Handler::Once(Box::new(handler)))
    }

    /// Register a subscription that re-fires every time its whole topic set
    /// is freshly satisfied.
    pub fn subscribe_persistent<I, F>(&self, topics: I, handler: F) -> SubscriptionId
    where
        I: IntoIterator<Item = Topic>,
        F: Fn(Delivery) + Send + Sync + 'static,
    {
        self.register(topics, Handler::Persistent(Arc::new(handler)))
    }

    /// Register a one-shot compound subscription and return a future of its delivery.
    ///
    /// Dropping the returned [`Waiter`] before it completes unsubscribes.
    pub fn wait_all<I>(self: &Arc<Self>, topics: I) -> Waiter
    where
        I: IntoIterator<Item = Topic>,
    {
        let (tx, rx) = oneshot::channel();
        let id = self.subscribe(topics, move |delivery| {
            let _ = tx.send(delivery);
        });
        Waiter::new(Arc::downgrade(self), id, rx)
    }

    fn register<I>(&self, topics: I, handler: Handler) -> SubscriptionId
    where
        I: IntoIterator<Item = Topic>,
    {
        let awaited: FxHashSet<Topic> = topics.into_iter().collect();

        let mut table = self.table.lock();
        let id = SubscriptionId(table.next_id);
        table.next_id += 1;

        if awaited.is_empty() {
            drop(table);
            invoke(match handler {
                Handler::Once(h) => Due::Once(h, Delivery::default()),
                Handler::Persistent(h) => Due::Persistent(h, Delivery::default()),
            });
            return id;
        }

        for topic in &awaited {
            let subscribers = table.index.entry(topic.clone()).or_default();
            subscribers.push(id);
            if subscribers.len() > self.max_subscribers {
                crate::log!(
                    "bus";
                    "warning: {} subscribers on `{}` (max {}), possible subscription leak",
                    subscribers.len(),
                    topic,
                    self.max_subscribers
                );
            }
        }

        table.subscriptions.insert(
            id,
            Subscription {
                awaited,
                received: FxHashMap::default(),
                handler,
            },
        );
        id
    }

    /// Remove a subscription. Returns false if it already fired or never existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut table = self.table.lock();
        match table.subscriptions.remove(&id) {
            Some(sub) => {
                table.unindex(id, &sub.awaited);
                true
            }
            None => false,
        }
    }

    // =========================================================================
    // Publish
    // =========================================================================

    /// Publish `payload` on `topic`.
    ///
    /// Every subscription completed by this publication fires, in registration
    /// order, after the bus lock is released (handlers may publish or subscribe).
    /// Returns the number of handlers invoked.
    pub fn publish(&self, topic: Topic, payload: Payload) -> usize {
        let due = self.collect_due(&topic, payload);
        let count = due.len();
        for d in due {
            invoke(d);
        }
        count
    }

    fn collect_due(&self, topic: &Topic, payload: Payload) -> Vec<Due> {
        let mut table = self.table.lock();
        let Some(ids) = table.index.get(topic).cloned() else {
            return Vec::new();
        };

        let mut due = Vec::new();
        for id in ids {
            let Some(sub) = table.subscriptions.get_mut(&id) else {
                continue;
            };
            if !sub.received.contains_key(topic) {
                sub.received.insert(topic.clone(), payload.clone());
            }
            if sub.received.len() < sub.awaited.len() {
                continue;
            }

            let received = std::mem::take(&mut sub.received);
            if let Handler::Persistent(handler) = &sub.handler {
                due.push(Due::Persistent(Arc::clone(handler), Delivery::new(received)));
                continue;
            }

            // One-shot: remove before invoking so it can never fire twice
            if let Some(sub) = table.subscriptions.remove(&id) {
                table.unindex(id, &sub.awaited);
                if let Handler::Once(handler) = sub.handler {
                    due.push(Due::Once(handler, Delivery::new(received)));
                }
            }
        }
        due
    }

    // =========================================================================
    // Diagnostics channel
    // =========================================================================

    /// Report a diagnostic on the reserved channel.
    ///
    /// Logged directly when nobody listens, so reports are never lost.
    pub fn report(&self, message: impl Into<String>) {
        let message = message.into();
        if self.publish(Topic::Diagnostic, Payload::Diagnostic(message.clone())) == 0 {
            crate::log!("error"; "{}", message);
        }
    }

    /// Listen on the diagnostic channel for the lifetime of the bus.
    pub fn on_diagnostic<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.subscribe_persistent([Topic::Diagnostic], move |delivery| {
            if let Some(Payload::Diagnostic(message)) = delivery.get(&Topic::Diagnostic) {
                handler(message);
            }
        })
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Topics a live subscription is still waiting for.
    pub fn outstanding(&self, id: SubscriptionId) -> Option<Vec<Topic>> {
        let table = self.table.lock();
        let sub = table.subscriptions.get(&id)?;
        Some(
            sub.awaited
                .iter()
                .filter(|t| !sub.received.contains_key(*t))
                .cloned()
                .collect(),
        )
    }

    /// Number of live subscriptions awaiting `topic`.
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.table.lock().index.get(topic).map_or(0, Vec::len)
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.table.lock().subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus").field("subscriptions", &self.len()).finish()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Table {
    fn unindex(&mut self, id: SubscriptionId, topics: &FxHashSet<Topic>) {
        for topic in topics {
            if let Some(ids) = self.index.get_mut(topic) {
                ids.retain(|other| *other != id);
                if ids.is_empty() {
                    self.index.remove(topic);
                }
            }
        }
    }
}

/// Run one handler; a panicking handler must not starve the rest of the publication.
fn invoke(due: Due) {
    let result = catch_unwind(AssertUnwindSafe(|| match due {
        Due::Once(handler, delivery) => handler(delivery),
        Due::Persistent(handler, delivery) => handler(delivery),
    }));
    if result.is_err() {
        crate::log!("error"; "bus handler panicked");
    }
}

// =============================================================================
// Tests
// =============================================================================
