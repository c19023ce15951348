//! Modification Timestamps and Clock Abstraction
//!
//! Object stores report `last_modified` as wall-clock milliseconds. The
//! change monitor compares these against its watermark, so the type is
//! totally ordered and has a well-defined minimum.
//!
//! Stores that stamp objects themselves (the in-memory store) take a
//! `Clock`, which lets tests control time explicitly:
//! - `ProductionClock`: Uses real system time
//! - `SimulatedClock`: Only advances when told to

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Modification timestamp in Unix milliseconds
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Smallest representable timestamp. Every listed object is newer.
    pub const MIN: Timestamp = Timestamp(0);

    pub fn from_millis(ms: u64) -> Self {
        Timestamp(ms)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Convert a filesystem/system time, clamping pre-epoch values to `MIN`
    pub fn from_system_time(time: SystemTime) -> Self {
        time.duration_since(UNIX_EPOCH)
            .map(|d| Timestamp(d.as_millis() as u64))
            .unwrap_or(Timestamp::MIN)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Source of `last_modified` stamps
pub trait Clock: Send + Sync + Clone + 'static {
    fn now(&self) -> Timestamp;
}

/// Production clock using real system time
#[derive(Debug, Clone, Copy, Default)]
pub struct ProductionClock;

impl ProductionClock {
    pub fn new() -> Self {
        ProductionClock
    }
}

impl Clock for ProductionClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_system_time(SystemTime::now())
    }
}

/// Simulated clock for deterministic testing
///
/// Time only advances when explicitly told to via `advance_ms()`.
/// Clones share the same underlying time.
#[derive(Debug, Clone)]
pub struct SimulatedClock {
    time_ms: Arc<AtomicU64>,
}

impl Default for SimulatedClock {
    fn default() -> Self {
        Self::new(0)
    }
}

impl SimulatedClock {
    /// Create a new simulated clock starting at the given time
    pub fn new(start_ms: u64) -> Self {
        SimulatedClock {
            time_ms: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    /// Advance time by milliseconds
    pub fn advance_ms(&self, ms: u64) {
        self.time_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.time_ms.load(Ordering::SeqCst))
    }
}
