//! Change event delivery
//!
//! ```text
//! TransferEngine ──┐
//!                  ├──► EventBus (unbounded mpsc) ──► DeliveryWorker ──► subscribers
//! Poll loop ───────┘
//! ```
//!
//! Producers never block. A single delivery task drains the queue in FIFO
//! order and calls every subscriber, in registration order, before taking
//! the next event. Each callback runs in isolation: an error or a panic is
//! logged and delivery carries on with the next subscriber.

use crate::clock::Timestamp;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Who produced a change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOrigin {
    /// Written through this process's transfer engine
    Local,
    /// Detected by the change monitor
    External,
}

/// Notification that an object was created or changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Key of the new or changed object
    pub file_name: String,
    pub origin: ChangeOrigin,
    /// Store timestamp, known only for externally detected changes
    pub last_modified: Option<Timestamp>,
}

impl ChangeEvent {
    pub fn local(file_name: impl Into<String>) -> Self {
        ChangeEvent {
            file_name: file_name.into(),
            origin: ChangeOrigin::Local,
            last_modified: None,
        }
    }

    pub fn external(file_name: impl Into<String>, last_modified: Timestamp) -> Self {
        ChangeEvent {
            file_name: file_name.into(),
            origin: ChangeOrigin::External,
            last_modified: Some(last_modified),
        }
    }
}

/// Error a subscriber may report back
pub type SubscriberError = Box<dyn std::error::Error + Send + Sync>;

/// Subscriber callback
pub type Subscriber = Arc<dyn Fn(&ChangeEvent) -> Result<(), SubscriberError> + Send + Sync>;

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

/// Registered callbacks, ordered by registration
#[derive(Default)]
struct SubscriberRegistry {
    next_id: AtomicU64,
    // Ids are allocated monotonically, so key order is registration order
    callbacks: RwLock<BTreeMap<SubscriptionId, Subscriber>>,
}

impl SubscriberRegistry {
    fn snapshot(&self) -> Vec<(SubscriptionId, Subscriber)> {
        self.callbacks
            .read()
            .iter()
            .map(|(id, cb)| (*id, Arc::clone(cb)))
            .collect()
    }
}

/// Ordered, unbounded event channel plus its subscriber list.
///
/// Clones share the same channel and subscribers. The bus is closed until
/// `open()` hands out the receiving end; events published while closed are
/// dropped.
#[derive(Clone, Default)]
pub struct EventBus {
    sender: Arc<Mutex<Option<mpsc::UnboundedSender<ChangeEvent>>>>,
    registry: Arc<SubscriberRegistry>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("open", &self.is_open())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback; it sees every event delivered from now on
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ChangeEvent) -> Result<(), SubscriberError> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.registry.next_id.fetch_add(1, Ordering::Relaxed));
        self.registry.callbacks.write().insert(id, Arc::new(callback));
        id
    }

    /// Remove a callback. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.registry.callbacks.write().remove(&id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.callbacks.read().len()
    }

    pub fn is_open(&self) -> bool {
        self.sender.lock().is_some()
    }

    /// Enqueue an event without blocking. Returns false if the bus is closed.
    pub fn publish(&self, event: ChangeEvent) -> bool {
        match self.sender.lock().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => {
                debug!("Event bus closed, dropping event for {}", event.file_name);
                false
            }
        }
    }

    /// Open a fresh channel and return the worker that drains it.
    ///
    /// Any previous channel is closed first.
    pub fn open(&self) -> DeliveryWorker {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.sender.lock() = Some(tx);
        DeliveryWorker {
            rx,
            registry: Arc::clone(&self.registry),
        }
    }

    /// Stop accepting events. The worker drains what is queued, then exits.
    pub fn close(&self) {
        self.sender.lock().take();
    }
}

/// Drains the bus and fans events out to subscribers
pub struct DeliveryWorker {
    rx: mpsc::UnboundedReceiver<ChangeEvent>,
    registry: Arc<SubscriberRegistry>,
}

impl DeliveryWorker {
    /// Run until the bus is closed and the queue is empty.
    /// Returns the number of events delivered.
    pub async fn run(mut self) -> u64 {
        let mut delivered = 0u64;
        while let Some(event) = self.rx.recv().await {
            self.dispatch(&event);
            delivered += 1;
        }
        debug!("Delivery worker exiting after {} events", delivered);
        delivered
    }

    fn dispatch(&self, event: &ChangeEvent) {
        // Snapshot so callbacks may (un)subscribe without deadlocking
        for (id, callback) in self.registry.snapshot() {
            match catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(
                        "Subscriber {:?} failed on {}: {}",
                        id, event.file_name, e
                    );
                }
                Err(_) => {
                    error!("Subscriber {:?} panicked on {}", id, event.file_name);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(bus: &EventBus, log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> SubscriptionId {
        let log = Arc::clone(log);
        bus.subscribe(move |e| {
            log.lock().push(format!("{}:{}", tag, e.file_name));
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_fifo_and_registration_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        recorder(&bus, &log, "first");
        recorder(&bus, &log, "second");

        let worker = bus.open();
        assert!(bus.publish(ChangeEvent::local("a")));
        assert!(bus.publish(ChangeEvent::local("b")));
        bus.close();

        assert_eq!(worker.run().await, 2);
        assert_eq!(
            *log.lock(),
            vec!["first:a", "second:a", "first:b", "second:b"]
        );
    }

    #[tokio::test]
    async fn test_publish_when_closed_is_dropped() {
        let bus = EventBus::new();
        assert!(!bus.is_open());
        assert!(!bus.publish(ChangeEvent::local("lost")));

        let worker = bus.open();
        bus.close();
        assert!(!bus.publish(ChangeEvent::local("late")));
        assert_eq!(worker.run().await, 0);
    }

    #[tokio::test]
    async fn test_close_drains_queued_events() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        recorder(&bus, &log, "s");

        let worker = bus.open();
        for i in 0..100 {
            bus.publish(ChangeEvent::local(format!("k{}", i)));
        }
        bus.close();

        let task = tokio::spawn(worker.run());
        assert_eq!(task.await.unwrap(), 100);
        assert_eq!(log.lock().len(), 100);
        assert_eq!(log.lock()[99], "s:k99");
    }

    #[tokio::test]
    async fn test_failing_subscriber_is_isolated() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe(|_| Err("subscriber rejected event".into()));
        bus.subscribe(|e| {
            if e.file_name == "boom" {
                panic!("subscriber panicked");
            }
            Ok(())
        });
        recorder(&bus, &log, "ok");

        let worker = bus.open();
        bus.publish(ChangeEvent::local("boom"));
        bus.publish(ChangeEvent::local("fine"));
        bus.close();

        assert_eq!(worker.run().await, 2);
        assert_eq!(*log.lock(), vec!["ok:boom", "ok:fine"]);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let first = recorder(&bus, &log, "first");
        recorder(&bus, &log, "second");
        assert_eq!(bus.subscriber_count(), 2);

        assert!(bus.unsubscribe(first));
        assert!(!bus.unsubscribe(first));

        let worker = bus.open();
        bus.publish(ChangeEvent::local("a"));
        bus.close();
        worker.run().await;

        assert_eq!(*log.lock(), vec!["second:a"]);
    }

    #[tokio::test]
    async fn test_reopen_gives_fresh_channel() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        recorder(&bus, &log, "s");

        let first = bus.open();
        bus.publish(ChangeEvent::local("one"));
        bus.close();
        first.run().await;

        let second = bus.open();
        bus.publish(ChangeEvent::local("two"));
        bus.close();
        second.run().await;

        assert_eq!(*log.lock(), vec!["s:one", "s:two"]);
    }

    #[test]
    fn test_event_constructors() {
        let e = ChangeEvent::external("x", Timestamp(42));
        assert_eq!(e.origin, ChangeOrigin::External);
        assert_eq!(e.last_modified, Some(Timestamp(42)));
        assert_eq!(ChangeEvent::local("x").last_modified, None);
    }
}
