//! Simulated Object Store with Fault Injection
//!
//! Wraps another store and fails operations either at random (seeded
//! ChaCha RNG, so a seed always reproduces the same fault sequence) or on
//! demand. Every call is recorded so tests can assert on exactly what the
//! store was asked to do.

use super::{ByteStream, CompletedPart, ObjectRecord, ObjectStoreClient, StoreFuture, UploadId};
use bytes::Bytes;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::sync::Arc;
use std::time::Duration;

/// Configuration for simulated fault injection
#[derive(Debug, Clone)]
pub struct SimulatedStoreConfig {
    /// RNG seed for reproducible fault sequences
    pub seed: u64,
    /// Probability of PUT failure
    pub put_fail_prob: f64,
    /// Probability of GET failure
    pub get_fail_prob: f64,
    /// Probability of LIST failure
    pub list_fail_prob: f64,
    /// Probability of part upload failure
    pub part_fail_prob: f64,
    /// Probability of multipart completion failure
    pub complete_fail_prob: f64,
    /// Probability of multipart abort failure
    pub abort_fail_prob: f64,
    /// Always fail the upload of this part number
    pub fail_on_part: Option<u32>,
    /// Simulated latency range in microseconds (min, max)
    pub latency_range_us: (u64, u64),
}

impl SimulatedStoreConfig {
    /// High chaos configuration for stress testing
    pub fn high_chaos(seed: u64) -> Self {
        SimulatedStoreConfig {
            seed,
            put_fail_prob: 0.05,
            get_fail_prob: 0.05,
            list_fail_prob: 0.10,
            part_fail_prob: 0.05,
            complete_fail_prob: 0.05,
            abort_fail_prob: 0.05,
            fail_on_part: None,
            latency_range_us: (1_000, 20_000),
        }
    }

    /// No faults - for baseline testing
    pub fn no_faults() -> Self {
        SimulatedStoreConfig {
            seed: 0,
            put_fail_prob: 0.0,
            get_fail_prob: 0.0,
            list_fail_prob: 0.0,
            part_fail_prob: 0.0,
            complete_fail_prob: 0.0,
            abort_fail_prob: 0.0,
            fail_on_part: None,
            latency_range_us: (0, 0),
        }
    }
}

/// A store operation as seen by the simulated store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    Put { key: String },
    Get { key: String },
    Exists { key: String },
    List { prefix: String },
    CreateMultipart { key: String },
    UploadPart { key: String, part_number: u32 },
    CompleteMultipart { key: String, part_numbers: Vec<u32> },
    AbortMultipart { key: String },
}

/// Statistics for fault injection
#[derive(Debug, Clone, Default)]
pub struct SimulatedStoreStats {
    pub put_attempts: u64,
    pub put_failures: u64,
    pub get_attempts: u64,
    pub get_failures: u64,
    pub list_attempts: u64,
    pub list_failures: u64,
    pub part_attempts: u64,
    pub part_failures: u64,
    pub complete_attempts: u64,
    pub complete_failures: u64,
    pub abort_attempts: u64,
    pub abort_failures: u64,
}

struct SimulatedStoreInner {
    rng: ChaCha8Rng,
    stats: SimulatedStoreStats,
    calls: Vec<StoreCall>,
    /// Lists to fail unconditionally before random faults apply
    forced_list_failures: u32,
}

/// Simulated object store that wraps another store and injects faults
pub struct SimulatedObjectStore<S: ObjectStoreClient> {
    inner_store: S,
    config: SimulatedStoreConfig,
    state: Arc<Mutex<SimulatedStoreInner>>,
}

impl<S: ObjectStoreClient + Clone> Clone for SimulatedObjectStore<S> {
    fn clone(&self) -> Self {
        SimulatedObjectStore {
            inner_store: self.inner_store.clone(),
            config: self.config.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<S: ObjectStoreClient> std::fmt::Debug for SimulatedObjectStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedObjectStore")
            .field("config", &self.config)
            .finish()
    }
}

impl<S: ObjectStoreClient> SimulatedObjectStore<S> {
    /// Create a new simulated store
    pub fn new(inner_store: S, config: SimulatedStoreConfig) -> Self {
        SimulatedObjectStore {
            inner_store,
            state: Arc::new(Mutex::new(SimulatedStoreInner {
                rng: ChaCha8Rng::seed_from_u64(config.seed),
                stats: SimulatedStoreStats::default(),
                calls: Vec::new(),
                forced_list_failures: 0,
            })),
            config,
        }
    }

    /// Get current statistics
    pub fn stats(&self) -> SimulatedStoreStats {
        self.state.lock().stats.clone()
    }

    /// Every call received so far, in order
    pub fn calls(&self) -> Vec<StoreCall> {
        self.state.lock().calls.clone()
    }

    /// Make the next `n` list calls fail
    pub fn fail_next_lists(&self, n: u32) {
        self.state.lock().forced_list_failures = n;
    }

    fn record(&self, call: StoreCall) {
        self.state.lock().calls.push(call);
    }

    fn roll(&self, prob: f64) -> bool {
        prob > 0.0 && self.state.lock().rng.gen_bool(prob.min(1.0))
    }

    async fn latency(&self) {
        let (min, max) = self.config.latency_range_us;
        if min == 0 && max == 0 {
            return;
        }
        let latency_us = if max > min {
            self.state.lock().rng.gen_range(min..max)
        } else {
            min
        };
        if latency_us > 0 {
            tokio::time::sleep(Duration::from_micros(latency_us)).await;
        }
    }

    fn injected(op: &str) -> IoError {
        IoError::new(ErrorKind::Other, format!("simulated {} failure", op))
    }
}

impl<S: ObjectStoreClient> ObjectStoreClient for SimulatedObjectStore<S> {
    fn put<'a>(&'a self, key: &'a str, data: Bytes) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.record(StoreCall::Put { key: key.to_string() });
            self.state.lock().stats.put_attempts += 1;
            self.latency().await;

            if self.roll(self.config.put_fail_prob) {
                self.state.lock().stats.put_failures += 1;
                return Err(Self::injected("put"));
            }
            self.inner_store.put(key, data).await
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ByteStream> {
        Box::pin(async move {
            self.record(StoreCall::Get { key: key.to_string() });
            self.state.lock().stats.get_attempts += 1;
            self.latency().await;

            if self.roll(self.config.get_fail_prob) {
                self.state.lock().stats.get_failures += 1;
                return Err(Self::injected("get"));
            }
            self.inner_store.get(key).await
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            self.record(StoreCall::Exists { key: key.to_string() });
            self.inner_store.exists(key).await
        })
    }

    fn list<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<ObjectRecord>> {
        Box::pin(async move {
            self.record(StoreCall::List {
                prefix: prefix.to_string(),
            });
            self.state.lock().stats.list_attempts += 1;
            self.latency().await;

            let forced = {
                let mut s = self.state.lock();
                if s.forced_list_failures > 0 {
                    s.forced_list_failures -= 1;
                    true
                } else {
                    false
                }
            };
            if forced || self.roll(self.config.list_fail_prob) {
                self.state.lock().stats.list_failures += 1;
                return Err(Self::injected("list"));
            }
            self.inner_store.list(prefix).await
        })
    }

    fn create_multipart<'a>(&'a self, key: &'a str) -> StoreFuture<'a, UploadId> {
        Box::pin(async move {
            self.record(StoreCall::CreateMultipart { key: key.to_string() });
            self.inner_store.create_multipart(key).await
        })
    }

    fn upload_part<'a>(
        &'a self,
        key: &'a str,
        upload_id: &'a UploadId,
        part_number: u32,
        data: Bytes,
    ) -> StoreFuture<'a, CompletedPart> {
        Box::pin(async move {
            self.record(StoreCall::UploadPart {
                key: key.to_string(),
                part_number,
            });
            self.state.lock().stats.part_attempts += 1;
            self.latency().await;

            if self.config.fail_on_part == Some(part_number) || self.roll(self.config.part_fail_prob)
            {
                self.state.lock().stats.part_failures += 1;
                return Err(Self::injected("upload part"));
            }
            self.inner_store
                .upload_part(key, upload_id, part_number, data)
                .await
        })
    }

    fn complete_multipart<'a>(
        &'a self,
        key: &'a str,
        upload_id: &'a UploadId,
        parts: Vec<CompletedPart>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.record(StoreCall::CompleteMultipart {
                key: key.to_string(),
                part_numbers: parts.iter().map(|p| p.part_number).collect(),
            });
            self.state.lock().stats.complete_attempts += 1;
            self.latency().await;

            if self.roll(self.config.complete_fail_prob) {
                self.state.lock().stats.complete_failures += 1;
                return Err(Self::injected("complete multipart"));
            }
            self.inner_store
                .complete_multipart(key, upload_id, parts)
                .await
        })
    }

    fn abort_multipart<'a>(
        &'a self,
        key: &'a str,
        upload_id: &'a UploadId,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.record(StoreCall::AbortMultipart { key: key.to_string() });
            self.state.lock().stats.abort_attempts += 1;

            if self.roll(self.config.abort_fail_prob) {
                self.state.lock().stats.abort_failures += 1;
                return Err(Self::injected("abort multipart"));
            }
            self.inner_store.abort_multipart(key, upload_id).await
        })
    }
}

/// Convenience: calls of one kind, for assertions
pub fn count_calls(calls: &[StoreCall], pred: impl Fn(&StoreCall) -> bool) -> usize {
    calls.iter().filter(|c| pred(c)).count()
}
