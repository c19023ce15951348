//! bucket-watch: read/write access to an S3-compatible bucket with
//! multipart transfers and polling-based change notifications.
//!
//! ```text
//! BucketClient
//!   ├── TransferEngine ──┐
//!   ├── ChangeMonitor ───┼──► ObjectStoreClient (memory | local fs | S3)
//!   └── EventBus ◄───────┘ events from both, delivered to subscribers
//! ```

pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod monitor;
pub mod observability;
pub mod store;
pub mod transfer;

pub use client::BucketClient;
pub use clock::{Clock, ProductionClock, SimulatedClock, Timestamp};
pub use config::{BucketConfig, MonitorConfig, StoreType, TransferConfig, MIN_CHUNK_SIZE};
pub use error::{BucketError, BucketResult};
pub use events::{ChangeEvent, ChangeOrigin, EventBus, SubscriberError, SubscriptionId};
pub use monitor::ChangeMonitor;
pub use store::{open_store, ObjectRecord, ObjectStoreClient};
pub use transfer::{ObjectReader, TransferEngine, UploadSession};
