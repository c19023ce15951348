//! Bucket Change Monitor
//!
//! Polls the bucket listing on an interval and publishes a `ChangeEvent`
//! for every object whose `last_modified` is newer than the watermark.
//!
//! ## Architecture
//!
//! ```text
//! start() ──► PollLoop task ──list──► scan vs watermark ──► EventBus
//!         └─► DeliveryWorker task ◄──────────────────────────┘
//! stop()  ──► cancel ──► join poll loop ──► close bus ──► join delivery
//! ```
//!
//! The watermark starts at `Timestamp::MIN`, so the first cycle after
//! `start()` reports every object already in the bucket. It only moves
//! once per cycle, to the newest timestamp in that cycle's listing.
//!
//! Writes made through this process's `TransferEngine` are registered in
//! `LocalWrites`; the poll loop consumes those instead of publishing them,
//! so each local write is announced once, by the engine.

use crate::clock::Timestamp;
use crate::config::MonitorConfig;
use crate::error::{BucketError, BucketResult};
use crate::events::{ChangeEvent, EventBus};
use crate::store::{ObjectRecord, ObjectStoreClient};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// ============================================================================
// LocalWrites - keys written by this process, pending observation
// ============================================================================

#[derive(Debug, Default)]
struct LocalWritesInner {
    /// Only track while a monitor runs, so the map cannot grow unobserved
    tracking: bool,
    /// key -> writes not yet seen by the poll loop
    pending: HashMap<String, usize>,
}

/// Keys written through the transfer engine that the poll loop should not
/// re-announce. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct LocalWrites {
    inner: Arc<Mutex<LocalWritesInner>>,
}

impl LocalWrites {
    /// Mark `key` as being written locally. The mark is withdrawn when the
    /// returned guard drops unless it is committed.
    pub fn register(&self, key: &str) -> PendingWrite<'_> {
        let mut inner = self.inner.lock();
        if !inner.tracking {
            return PendingWrite { writes: self, key: None };
        }
        *inner.pending.entry(key.to_string()).or_insert(0) += 1;
        PendingWrite {
            writes: self,
            key: Some(key.to_string()),
        }
    }

    /// Consume one mark for `key`. True if the change came from us.
    pub fn consume(&self, key: &str) -> bool {
        self.take_one(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, key: &str) {
        self.take_one(key);
    }

    fn take_one(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        let Some(count) = inner.pending.get_mut(key) else {
            return false;
        };
        *count -= 1;
        if *count == 0 {
            inner.pending.remove(key);
        }
        true
    }

    fn set_tracking(&self, tracking: bool) {
        let mut inner = self.inner.lock();
        inner.tracking = tracking;
        inner.pending.clear();
    }
}

/// Registration of an in-flight local write
#[must_use = "dropping a PendingWrite without commit() withdraws the registration"]
pub struct PendingWrite<'a> {
    writes: &'a LocalWrites,
    key: Option<String>,
}

impl PendingWrite<'_> {
    /// The write reached the store; keep the mark for the poll loop
    pub fn commit(mut self) {
        self.key = None;
    }
}

impl Drop for PendingWrite<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.writes.release(&key);
        }
    }
}

// ============================================================================
// PollLoop - owns the watermark
// ============================================================================

/// The background polling task. Owns the watermark exclusively.
pub struct PollLoop {
    store: Arc<dyn ObjectStoreClient>,
    bus: EventBus,
    local_writes: LocalWrites,
    config: MonitorConfig,
    watermark: Timestamp,
    cancel: CancellationToken,
}

impl PollLoop {
    fn new(
        store: Arc<dyn ObjectStoreClient>,
        bus: EventBus,
        local_writes: LocalWrites,
        config: MonitorConfig,
        cancel: CancellationToken,
    ) -> Self {
        PollLoop {
            store,
            bus,
            local_writes,
            config,
            watermark: Timestamp::MIN,
            cancel,
        }
    }

    /// Poll until cancelled. Returns the final watermark.
    pub async fn run(mut self) -> Timestamp {
        debug!(
            "Poll loop started (interval {:?}, backoff {:?})",
            self.config.poll_interval, self.config.error_backoff
        );
        loop {
            let listing = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = self.store.list(&self.config.prefix) => result,
            };

            let pause = match listing {
                Ok(records) => {
                    let published = self.scan(records);
                    if published > 0 {
                        debug!("Poll cycle published {} changes", published);
                    }
                    self.config.poll_interval
                }
                Err(e) => {
                    let err = BucketError::ListingFailure(e);
                    warn!("{}; retrying in {:?}", err, self.config.error_backoff);
                    self.config.error_backoff
                }
            };

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
        debug!("Poll loop stopped at watermark {}", self.watermark);
        self.watermark
    }

    /// Publish records newer than the watermark, then advance it to the
    /// newest timestamp of this listing. Returns the number published.
    fn scan(&mut self, mut records: Vec<ObjectRecord>) -> usize {
        records.retain(|r| r.last_modified > self.watermark);
        // Announce in modification order
        records.sort_by(|a, b| {
            a.last_modified
                .cmp(&b.last_modified)
                .then_with(|| a.key.cmp(&b.key))
        });

        let cycle_max = records
            .last()
            .map(|r| r.last_modified)
            .unwrap_or(self.watermark);

        let mut published = 0;
        for record in records {
            if self.cancel.is_cancelled() {
                return published;
            }
            if self.local_writes.consume(&record.key) {
                debug!("Skipping own write {}", record.key);
                continue;
            }
            debug!("Detected change to {} at {}", record.key, record.last_modified);
            if self
                .bus
                .publish(ChangeEvent::external(record.key, record.last_modified))
            {
                published += 1;
            }
        }

        debug_assert!(cycle_max >= self.watermark, "watermark must not move backwards");
        self.watermark = cycle_max;
        published
    }
}

// ============================================================================
// ChangeMonitor - start/stop lifecycle
// ============================================================================

/// Handles of a running monitor
struct MonitorState {
    cancel: CancellationToken,
    poll_task: JoinHandle<Timestamp>,
    delivery_task: JoinHandle<u64>,
}

/// Background detector of externally created or modified objects
pub struct ChangeMonitor {
    store: Arc<dyn ObjectStoreClient>,
    bus: EventBus,
    local_writes: LocalWrites,
    config: MonitorConfig,
    state: tokio::sync::Mutex<Option<MonitorState>>,
    running: AtomicBool,
}

impl std::fmt::Debug for ChangeMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeMonitor")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish()
    }
}

impl ChangeMonitor {
    pub fn new(
        store: Arc<dyn ObjectStoreClient>,
        bus: EventBus,
        local_writes: LocalWrites,
        config: MonitorConfig,
    ) -> BucketResult<Self> {
        if config.poll_interval.is_zero() {
            return Err(BucketError::Config("poll_interval must be non-zero".to_string()));
        }
        Ok(ChangeMonitor {
            store,
            bus,
            local_writes,
            config,
            state: tokio::sync::Mutex::new(None),
            running: AtomicBool::new(false),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawn the poll loop and the delivery worker. No-op if running.
    /// Returns without waiting for the first poll.
    pub async fn start(&self) {
        let mut state = self.state.lock().await;
        if state.is_some() {
            debug!("Change monitor already running");
            return;
        }

        self.local_writes.set_tracking(true);
        let worker = self.bus.open();
        let cancel = CancellationToken::new();
        let poll_loop = PollLoop::new(
            Arc::clone(&self.store),
            self.bus.clone(),
            self.local_writes.clone(),
            self.config.clone(),
            cancel.clone(),
        );

        *state = Some(MonitorState {
            cancel,
            poll_task: tokio::spawn(poll_loop.run()),
            delivery_task: tokio::spawn(worker.run()),
        });
        self.running.store(true, Ordering::Release);
        info!(
            "Change monitor started (prefix {:?}, interval {:?})",
            self.config.prefix, self.config.poll_interval
        );
    }

    /// Cancel polling, drain queued events and wait for both tasks to end.
    /// No-op if not running.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        let Some(running) = state.take() else {
            debug!("Change monitor not running");
            return;
        };

        running.cancel.cancel();
        match running.poll_task.await {
            Ok(watermark) => debug!("Poll loop joined at watermark {}", watermark),
            Err(e) => error!("Poll loop task failed: {}", e),
        }

        // Poll loop is gone; close so the worker drains and exits
        self.bus.close();
        match running.delivery_task.await {
            Ok(delivered) => debug!("Delivery worker joined after {} events", delivered),
            Err(e) => error!("Delivery worker task failed: {}", e),
        }

        self.local_writes.set_tracking(false);
        self.running.store(false, Ordering::Release);
        info!("Change monitor stopped");
    }
}

impl Drop for ChangeMonitor {
    fn drop(&mut self) {
        // Dropped without stop(): let both tasks wind down on their own
        if let Some(running) = self.state.get_mut().take() {
            running.cancel.cancel();
            self.bus.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimulatedClock;
    use crate::store::{InMemoryObjectStore, SimulatedObjectStore, SimulatedStoreConfig};
    use bytes::Bytes;
    use std::time::Duration;

    type Seen = Arc<Mutex<Vec<ChangeEvent>>>;

    fn record(key: &str, ms: u64) -> ObjectRecord {
        ObjectRecord {
            key: key.to_string(),
            last_modified: Timestamp(ms),
        }
    }

    fn collect(bus: &EventBus) -> Seen {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(move |e| {
            sink.lock().push(e.clone());
            Ok(())
        });
        seen
    }

    fn test_loop(bus: &EventBus, local_writes: &LocalWrites) -> PollLoop {
        PollLoop::new(
            Arc::new(InMemoryObjectStore::new()),
            bus.clone(),
            local_writes.clone(),
            MonitorConfig::test(),
            CancellationToken::new(),
        )
    }

    async fn wait_for(seen: &Seen, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while seen.lock().len() < n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("timed out waiting for events");
    }

    #[tokio::test]
    async fn test_scan_uses_single_watermark_per_cycle() {
        let bus = EventBus::new();
        let seen = collect(&bus);
        let worker = bus.open();
        let mut poll = test_loop(&bus, &LocalWrites::default());

        // First cycle reports everything, in modification order
        assert_eq!(poll.scan(vec![record("b", 200), record("a", 100)]), 2);
        assert_eq!(poll.watermark, Timestamp(200));

        // Nothing newer: nothing published, watermark unchanged
        assert_eq!(poll.scan(vec![record("a", 100), record("b", 200)]), 0);
        assert_eq!(poll.watermark, Timestamp(200));

        // Equal timestamp is not newer; backdated write is not newer
        assert_eq!(poll.scan(vec![record("c", 200), record("d", 150), record("b", 300)]), 1);
        assert_eq!(poll.watermark, Timestamp(300));

        bus.close();
        worker.run().await;
        let keys: Vec<_> = seen.lock().iter().map(|e| e.file_name.clone()).collect();
        assert_eq!(keys, vec!["a", "b", "b"]);
    }

    #[tokio::test]
    async fn test_scan_skips_local_writes_once() {
        let bus = EventBus::new();
        let seen = collect(&bus);
        let worker = bus.open();
        let local_writes = LocalWrites::default();
        local_writes.set_tracking(true);
        let mut poll = test_loop(&bus, &local_writes);

        local_writes.register("mine").commit();
        assert_eq!(poll.scan(vec![record("mine", 10), record("theirs", 10)]), 1);
        assert!(local_writes.is_empty());

        // A later external change to the same key is reported
        assert_eq!(poll.scan(vec![record("mine", 20)]), 1);

        bus.close();
        worker.run().await;
        let keys: Vec<_> = seen.lock().iter().map(|e| e.file_name.clone()).collect();
        assert_eq!(keys, vec!["theirs", "mine"]);
    }

    #[test]
    fn test_pending_write_released_unless_committed() {
        let local_writes = LocalWrites::default();
        local_writes.set_tracking(true);

        drop(local_writes.register("failed"));
        assert!(local_writes.is_empty());

        local_writes.register("ok").commit();
        assert_eq!(local_writes.len(), 1);
        assert!(local_writes.consume("ok"));
        assert!(!local_writes.consume("ok"));
    }

    #[test]
    fn test_consume_takes_one_mark_per_write() {
        let local_writes = LocalWrites::default();
        local_writes.set_tracking(true);

        local_writes.register("k").commit();
        local_writes.register("k").commit();
        assert_eq!(local_writes.len(), 1);

        assert!(local_writes.consume("k"));
        assert!(!local_writes.is_empty());
        assert!(local_writes.consume("k"));
        assert!(local_writes.is_empty());
        assert!(!local_writes.consume("k"));
    }

    #[test]
    fn test_rejects_zero_poll_interval() {
        let config = MonitorConfig {
            poll_interval: Duration::ZERO,
            ..MonitorConfig::test()
        };
        let result = ChangeMonitor::new(
            Arc::new(InMemoryObjectStore::new()),
            EventBus::new(),
            LocalWrites::default(),
            config,
        );
        assert!(matches!(result, Err(BucketError::Config(_))));
    }

    #[test]
    fn test_no_tracking_while_stopped() {
        let local_writes = LocalWrites::default();
        local_writes.register("k").commit();
        assert!(local_writes.is_empty());
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let monitor = ChangeMonitor::new(
            Arc::new(InMemoryObjectStore::new()),
            EventBus::new(),
            LocalWrites::default(),
            MonitorConfig::test(),
        )
        .unwrap();

        monitor.stop().await;
        assert!(!monitor.is_running());

        monitor.start().await;
        monitor.start().await;
        assert!(monitor.is_running());

        monitor.stop().await;
        monitor.stop().await;
        assert!(!monitor.is_running());

        // Restart after stop works
        monitor.start().await;
        assert!(monitor.is_running());
        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_detects_external_write() {
        let clock = SimulatedClock::new(1_000);
        let store = InMemoryObjectStore::with_clock(clock.clone());
        store.put("existing", Bytes::from_static(b"old")).await.unwrap();

        let bus = EventBus::new();
        let seen = collect(&bus);
        let monitor = ChangeMonitor::new(
            Arc::new(store.clone()),
            bus,
            LocalWrites::default(),
            MonitorConfig::test(),
        )
        .unwrap();
        monitor.start().await;

        // First cycle reports what is already there
        wait_for(&seen, 1).await;

        clock.advance_ms(10);
        store.put("incoming/new.csv", Bytes::from_static(b"1,2,3")).await.unwrap();
        wait_for(&seen, 2).await;
        monitor.stop().await;

        let events = seen.lock().clone();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], ChangeEvent::external("existing", Timestamp(1_000)));
        assert_eq!(events[1], ChangeEvent::external("incoming/new.csv", Timestamp(1_010)));
    }

    #[tokio::test]
    async fn test_listing_failures_back_off_and_recover() {
        let inner = InMemoryObjectStore::new();
        let store = SimulatedObjectStore::new(inner.clone(), SimulatedStoreConfig::no_faults());
        store.fail_next_lists(2);
        inner.put("a", Bytes::from_static(b"1")).await.unwrap();

        let bus = EventBus::new();
        let seen = collect(&bus);
        let monitor = ChangeMonitor::new(
            Arc::new(store.clone()),
            bus,
            LocalWrites::default(),
            MonitorConfig::test(),
        )
        .unwrap();
        monitor.start().await;
        wait_for(&seen, 1).await;
        monitor.stop().await;

        let stats = store.stats();
        assert_eq!(stats.list_failures, 2);
        assert!(stats.list_attempts >= 3);
        assert_eq!(seen.lock()[0].file_name, "a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_listing_failure_waits_for_error_backoff() {
        let store = SimulatedObjectStore::new(InMemoryObjectStore::new(), SimulatedStoreConfig::no_faults());
        store.fail_next_lists(1);
        let config = MonitorConfig {
            poll_interval: Duration::from_millis(10),
            error_backoff: Duration::from_secs(30),
            prefix: String::new(),
        };
        let monitor = ChangeMonitor::new(
            Arc::new(store.clone()),
            EventBus::new(),
            LocalWrites::default(),
            config,
        )
        .unwrap();
        monitor.start().await;

        // Many poll intervals later, still inside the backoff
        tokio::time::sleep(Duration::from_secs(29)).await;
        let stats = store.stats();
        assert_eq!(stats.list_attempts, 1);
        assert_eq!(stats.list_failures, 1);

        // Backoff over: polling resumes at the normal interval
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(store.stats().list_attempts >= 2);
        assert_eq!(store.stats().list_failures, 1);

        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_stop_interrupts_sleep() {
        let config = MonitorConfig {
            poll_interval: Duration::from_secs(3600),
            ..MonitorConfig::test()
        };
        let monitor = ChangeMonitor::new(
            Arc::new(InMemoryObjectStore::new()),
            EventBus::new(),
            LocalWrites::default(),
            config,
        )
        .unwrap();
        monitor.start().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(Duration::from_secs(1), monitor.stop())
            .await
            .expect("stop must not wait for the poll interval");
        assert!(!monitor.is_running());
    }

    #[tokio::test]
    async fn test_stop_delivers_already_queued_events() {
        let bus = EventBus::new();
        let seen = collect(&bus);
        let monitor = ChangeMonitor::new(
            Arc::new(InMemoryObjectStore::new()),
            bus.clone(),
            LocalWrites::default(),
            MonitorConfig::test(),
        )
        .unwrap();
        monitor.start().await;
        for i in 0..20 {
            bus.publish(ChangeEvent::local(format!("k{}", i)));
        }
        monitor.stop().await;

        assert_eq!(seen.lock().len(), 20);
        assert!(!bus.is_open());
    }
}
