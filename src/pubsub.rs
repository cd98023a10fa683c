//! # Publish/Subscribe Bus
//!
//! A process-local topic → callback registry. The stores use a single topic,
//! `"append"`, published with the origin stream id as payload after every
//! committed append; subscriptions and the HTTP server listen on it to learn
//! that new records exist.
//!
//! ## Delivery Semantics
//!
//! `publish` invokes every matching callback synchronously, under the
//! registry lock. That gives one hard guarantee: a cancelled subscription is
//! never invoked again. The flip side is a hard requirement on callbacks:
//! they must not block and must not touch the bus; in practice every callback
//! in this crate forwards the payload into a channel and returns.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

// =============================================================================
// Publisher
// =============================================================================

/// Callback invoked with `(topic, payload)` on every matching publish.
pub type Callback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// A cheaply clonable handle to a callback registry.
///
/// All clones share the same registry; a store hands clones to its
/// subscriptions so they can listen for appends.
#[derive(Clone, Default)]
pub struct Publisher {
    registry: Arc<Mutex<Registry>>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    entries: HashMap<String, Vec<(u64, Callback)>>,
}

impl Publisher {
    /// Creates an empty publisher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback for a topic.
    ///
    /// The returned [`Subscription`] removes the callback when cancelled or
    /// dropped.
    pub fn subscribe(&self, topic: &str, callback: Callback) -> Subscription {
        let mut registry = self.registry.lock().expect("pubsub registry poisoned");
        let id = registry.next_id;
        registry.next_id += 1;
        registry
            .entries
            .entry(topic.to_string())
            .or_default()
            .push((id, callback));
        Subscription {
            id,
            topic: topic.to_string(),
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Delivers a payload to every callback registered for the topic.
    pub fn publish(&self, topic: &str, payload: &str) {
        let registry = self.registry.lock().expect("pubsub registry poisoned");
        if let Some(entries) = registry.entries.get(topic) {
            for (_, callback) in entries {
                callback(topic, payload);
            }
        }
    }

    /// Number of live subscriptions on a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        let registry = self.registry.lock().expect("pubsub registry poisoned");
        registry.entries.get(topic).map_or(0, Vec::len)
    }
}

// =============================================================================
// Subscription Handle
// =============================================================================

/// Handle to a registered callback; removing it stops delivery.
pub struct Subscription {
    id: u64,
    topic: String,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    /// Unregisters the callback. After this returns the callback is
    /// guaranteed not to run again.
    pub fn cancel(&self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut registry = registry.lock().expect("pubsub registry poisoned");
            if let Some(entries) = registry.entries.get_mut(&self.topic) {
                entries.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn publish_reaches_matching_subscribers_only() {
        let bus = Publisher::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_a = hits.clone();
        let _a = bus.subscribe(
            "append",
            Arc::new(move |topic, payload| {
                assert_eq!(topic, "append");
                assert_eq!(payload, "foo");
                hits_a.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let hits_b = hits.clone();
        let _b = bus.subscribe(
            "other",
            Arc::new(move |_, _| {
                hits_b.fetch_add(100, Ordering::SeqCst);
            }),
        );

        bus.publish("append", "foo");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelled_subscription_is_not_delivered() {
        let bus = Publisher::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_cb = hits.clone();
        let sub = bus.subscribe(
            "append",
            Arc::new(move |_, _| {
                hits_cb.fetch_add(1, Ordering::SeqCst);
            }),
        );

        bus.publish("append", "foo");
        sub.cancel();
        bus.publish("append", "foo");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count("append"), 0);
    }

    #[test]
    fn drop_unregisters() {
        let bus = Publisher::new();
        {
            let _sub = bus.subscribe("append", Arc::new(|_, _| {}));
            assert_eq!(bus.subscriber_count("append"), 1);
        }
        assert_eq!(bus.subscriber_count("append"), 0);
    }

    #[test]
    fn clones_share_one_registry() {
        let bus = Publisher::new();
        let other = bus.clone();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_cb = hits.clone();
        let _sub = other.subscribe(
            "append",
            Arc::new(move |_, _| {
                hits_cb.fetch_add(1, Ordering::SeqCst);
            }),
        );

        bus.publish("append", "bar");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
