//! Object Store Abstraction
//!
//! Trait-based boundary to an S3-compatible bucket. Everything the transfer
//! engine and change monitor need goes through `ObjectStoreClient`; nothing
//! else in the crate talks to storage.
//!
//! Implementations:
//! - `InMemoryObjectStore`: For unit tests, with a controllable clock
//! - `LocalFsObjectStore`: For development and local testing
//! - `SimulatedObjectStore`: Fault-injecting wrapper for failure tests
//! - `S3ObjectStore`: For production (feature-gated)

pub mod local_fs;
pub mod memory;
#[cfg(feature = "s3")]
pub mod s3;
pub mod simulated;

pub use local_fs::LocalFsObjectStore;
pub use memory::InMemoryObjectStore;
#[cfg(feature = "s3")]
pub use s3::S3ObjectStore;
pub use simulated::{
    count_calls, SimulatedObjectStore, SimulatedStoreConfig, SimulatedStoreStats, StoreCall,
};

use crate::clock::Timestamp;
use crate::config::{BucketConfig, StoreType};
use crate::error::{BucketError, BucketResult};
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io::Result as IoResult;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future returned by every store operation
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = IoResult<T>> + Send + 'a>>;

/// Forward-only body of a retrieved object
pub type ByteStream = BoxStream<'static, IoResult<Bytes>>;

/// One entry of a bucket listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    /// Object key
    pub key: String,
    /// Last modification time reported by the store
    pub last_modified: Timestamp,
}

/// Opaque multipart session token issued by the store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadId(pub String);

impl UploadId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UploadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Receipt for an uploaded part, passed back on completion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    /// 1-based part number
    pub part_number: u32,
    /// Store-issued tag (ETag) for the part
    pub tag: String,
}

/// Object store contract, bound to a single bucket at construction.
///
/// `ErrorKind::NotFound` means a missing key or unknown upload session.
/// `ErrorKind::InvalidInput` means the multipart protocol was violated.
pub trait ObjectStoreClient: Send + Sync + 'static {
    /// Put an object (create or overwrite)
    fn put<'a>(&'a self, key: &'a str, data: Bytes) -> StoreFuture<'a, ()>;

    /// Open an object's contents as a byte stream
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ByteStream>;

    /// Check if an object exists
    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool>;

    /// List every object under `prefix` with its modification time
    fn list<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<ObjectRecord>>;

    /// Start a multipart upload session
    fn create_multipart<'a>(&'a self, key: &'a str) -> StoreFuture<'a, UploadId>;

    /// Upload one part of a session
    fn upload_part<'a>(
        &'a self,
        key: &'a str,
        upload_id: &'a UploadId,
        part_number: u32,
        data: Bytes,
    ) -> StoreFuture<'a, CompletedPart>;

    /// Assemble the object from the given ordered parts
    fn complete_multipart<'a>(
        &'a self,
        key: &'a str,
        upload_id: &'a UploadId,
        parts: Vec<CompletedPart>,
    ) -> StoreFuture<'a, ()>;

    /// Discard a session and any parts uploaded to it
    fn abort_multipart<'a>(&'a self, key: &'a str, upload_id: &'a UploadId)
        -> StoreFuture<'a, ()>;
}

impl<T: ObjectStoreClient + ?Sized> ObjectStoreClient for Arc<T> {
    fn put<'a>(&'a self, key: &'a str, data: Bytes) -> StoreFuture<'a, ()> {
        (**self).put(key, data)
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ByteStream> {
        (**self).get(key)
    }

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        (**self).exists(key)
    }

    fn list<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<ObjectRecord>> {
        (**self).list(prefix)
    }

    fn create_multipart<'a>(&'a self, key: &'a str) -> StoreFuture<'a, UploadId> {
        (**self).create_multipart(key)
    }

    fn upload_part<'a>(
        &'a self,
        key: &'a str,
        upload_id: &'a UploadId,
        part_number: u32,
        data: Bytes,
    ) -> StoreFuture<'a, CompletedPart> {
        (**self).upload_part(key, upload_id, part_number, data)
    }

    fn complete_multipart<'a>(
        &'a self,
        key: &'a str,
        upload_id: &'a UploadId,
        parts: Vec<CompletedPart>,
    ) -> StoreFuture<'a, ()> {
        (**self).complete_multipart(key, upload_id, parts)
    }

    fn abort_multipart<'a>(
        &'a self,
        key: &'a str,
        upload_id: &'a UploadId,
    ) -> StoreFuture<'a, ()> {
        (**self).abort_multipart(key, upload_id)
    }
}

/// Tag for a part's content: part number plus CRC32 of the bytes
pub(crate) fn part_tag(part_number: u32, data: &[u8]) -> String {
    format!("{}-{:08x}", part_number, crc32fast::hash(data))
}

/// Build the collaborator selected by `config`
pub async fn open_store(config: &BucketConfig) -> BucketResult<Arc<dyn ObjectStoreClient>> {
    config.validate()?;
    match config.store_type {
        StoreType::InMemory => Ok(Arc::new(InMemoryObjectStore::new())),
        StoreType::LocalFs => {
            let path = config
                .local_path
                .clone()
                .ok_or_else(|| BucketError::Config("local_path is required".to_string()))?;
            let store = LocalFsObjectStore::open(path).await?;
            Ok(Arc::new(store))
        }
        #[cfg(feature = "s3")]
        StoreType::S3 => {
            let s3 = config
                .s3
                .clone()
                .ok_or_else(|| BucketError::Config("s3 section is required".to_string()))?;
            Ok(Arc::new(S3ObjectStore::new(s3)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_tag_depends_on_content_and_number() {
        assert_eq!(part_tag(1, b"abc"), part_tag(1, b"abc"));
        assert_ne!(part_tag(1, b"abc"), part_tag(2, b"abc"));
        assert_ne!(part_tag(1, b"abc"), part_tag(1, b"abd"));
        assert!(part_tag(3, b"").starts_with("3-"));
    }

    #[tokio::test]
    async fn test_open_store_in_memory() {
        let config = BucketConfig::test();
        let store = open_store(&config).await.unwrap();
        assert!(store.list("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_store_local_fs_requires_path() {
        let mut config = BucketConfig::test();
        config.store_type = StoreType::LocalFs;
        config.local_path = None;
        assert!(matches!(
            open_store(&config).await,
            Err(BucketError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_arc_store_delegates() {
        let store = Arc::new(InMemoryObjectStore::new());
        let shared: Arc<dyn ObjectStoreClient> = store.clone();
        shared.put("k", Bytes::from_static(b"v")).await.unwrap();
        assert!(store.exists("k").await.unwrap());
    }
}
