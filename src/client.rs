//! Public entry point
//!
//! `BucketClient` wires one store, one event bus and the shared
//! local-write set into a `TransferEngine` and a `ChangeMonitor`, and
//! exposes their operations as a single surface.

use crate::config::BucketConfig;
use crate::error::BucketResult;
use crate::events::{ChangeEvent, EventBus, SubscriberError, SubscriptionId};
use crate::monitor::{ChangeMonitor, LocalWrites};
use crate::store::{open_store, ObjectStoreClient};
use crate::transfer::{ObjectReader, TransferEngine};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tokio::io::AsyncRead;

/// Read/write access to one bucket plus change notifications
#[derive(Debug)]
pub struct BucketClient {
    engine: TransferEngine,
    monitor: ChangeMonitor,
    bus: EventBus,
}

impl BucketClient {
    /// Build a client over an already constructed store.
    /// Fails with `Config` if `config` does not validate.
    pub fn new(store: Arc<dyn ObjectStoreClient>, config: &BucketConfig) -> BucketResult<Self> {
        config.validate()?;
        let bus = EventBus::new();
        let local_writes = LocalWrites::default();
        let engine = TransferEngine::new(
            Arc::clone(&store),
            bus.clone(),
            local_writes.clone(),
            &config.transfer,
        )?;
        let monitor = ChangeMonitor::new(store, bus.clone(), local_writes, config.monitor.clone())?;
        Ok(BucketClient {
            engine,
            monitor,
            bus,
        })
    }

    /// Build the store named by `config`, then the client
    pub async fn from_config(config: &BucketConfig) -> BucketResult<Self> {
        let store = open_store(config).await?;
        Self::new(store, config)
    }

    /// Write-once put of a whole object
    pub async fn write(&self, key: &str, data: impl Into<Bytes>) -> BucketResult<()> {
        self.engine.write(key, data).await
    }

    /// Serialize `value` as JSON and `write` it
    pub async fn write_object<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> BucketResult<()> {
        self.engine.write_object(key, value).await
    }

    /// Multipart upload of everything `reader` yields
    pub async fn write_large<R>(&self, key: &str, reader: R) -> BucketResult<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.engine.write_large(key, reader).await
    }

    pub async fn read(&self, key: &str) -> BucketResult<Bytes> {
        self.engine.read(key).await
    }

    pub async fn read_object<T: DeserializeOwned>(&self, key: &str) -> BucketResult<T> {
        self.engine.read_object(key).await
    }

    /// Stream an object without buffering it
    pub async fn read_large(&self, key: &str) -> BucketResult<ObjectReader> {
        self.engine.read_large(key).await
    }

    /// Start watching the bucket
    pub async fn start(&self) {
        self.monitor.start().await
    }

    /// Stop watching; returns once background tasks have ended
    pub async fn stop(&self) {
        self.monitor.stop().await
    }

    pub fn is_running(&self) -> bool {
        self.monitor.is_running()
    }

    /// Register a callback for every new or changed object
    pub fn on_new_file<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ChangeEvent) -> Result<(), SubscriberError> + Send + Sync + 'static,
    {
        self.bus.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    pub fn chunk_size(&self) -> usize {
        self.engine.chunk_size()
    }
}
