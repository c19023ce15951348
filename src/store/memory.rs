//! In-memory object store for unit tests and simulation
//!
//! Objects are stamped with the store's `Clock`, so tests can place
//! "external" writes at exact times with a `SimulatedClock`.

use super::{part_tag, ByteStream, CompletedPart, ObjectRecord, ObjectStoreClient, StoreFuture, UploadId};
use crate::clock::{Clock, ProductionClock, Timestamp};
use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::io::{Error as IoError, ErrorKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    last_modified: Timestamp,
}

#[derive(Debug)]
struct PendingUpload {
    key: String,
    /// part number -> (tag, data)
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Debug, Default)]
struct StoreState {
    objects: HashMap<String, StoredObject>,
    uploads: HashMap<UploadId, PendingUpload>,
}

/// In-memory object store. Clones share the same bucket.
#[derive(Debug)]
pub struct InMemoryObjectStore<C: Clock = ProductionClock> {
    state: Arc<RwLock<StoreState>>,
    next_upload: Arc<AtomicU64>,
    clock: C,
}

impl InMemoryObjectStore<ProductionClock> {
    /// Create a new in-memory object store stamped with system time
    pub fn new() -> Self {
        Self::with_clock(ProductionClock::new())
    }
}

impl Default for InMemoryObjectStore<ProductionClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> Clone for InMemoryObjectStore<C> {
    fn clone(&self) -> Self {
        InMemoryObjectStore {
            state: Arc::clone(&self.state),
            next_upload: Arc::clone(&self.next_upload),
            clock: self.clock.clone(),
        }
    }
}

impl<C: Clock> InMemoryObjectStore<C> {
    /// Create a store whose `last_modified` stamps come from `clock`
    pub fn with_clock(clock: C) -> Self {
        InMemoryObjectStore {
            state: Arc::new(RwLock::new(StoreState::default())),
            next_upload: Arc::new(AtomicU64::new(1)),
            clock,
        }
    }

    /// Place an object with an explicit timestamp, bypassing the clock.
    ///
    /// Stands in for a writer outside this process (for testing).
    pub fn insert_external(&self, key: &str, data: impl Into<Bytes>, last_modified: Timestamp) {
        self.state.write().objects.insert(
            key.to_string(),
            StoredObject {
                data: data.into(),
                last_modified,
            },
        );
    }

    /// Get the number of stored objects (for testing)
    pub fn len(&self) -> usize {
        self.state.read().objects.len()
    }

    /// Check if empty (for testing)
    pub fn is_empty(&self) -> bool {
        self.state.read().objects.is_empty()
    }

    /// Number of multipart sessions neither completed nor aborted
    pub fn pending_uploads(&self) -> usize {
        self.state.read().uploads.len()
    }

    fn session_mismatch(upload_id: &UploadId, key: &str) -> IoError {
        IoError::new(
            ErrorKind::NotFound,
            format!("No upload {} for key {}", upload_id, key),
        )
    }
}

impl<C: Clock> ObjectStoreClient for InMemoryObjectStore<C> {
    fn put<'a>(&'a self, key: &'a str, data: Bytes) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let obj = StoredObject {
                data,
                last_modified: self.clock.now(),
            };
            self.state.write().objects.insert(key.to_string(), obj);
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ByteStream> {
        Box::pin(async move {
            let data = self
                .state
                .read()
                .objects
                .get(key)
                .map(|obj| obj.data.clone())
                .ok_or_else(|| IoError::new(ErrorKind::NotFound, format!("Key not found: {}", key)))?;
            let stream: ByteStream = Box::pin(futures::stream::iter([Ok(data)]));
            Ok(stream)
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move { Ok(self.state.read().objects.contains_key(key)) })
    }

    fn list<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<ObjectRecord>> {
        Box::pin(async move {
            let state = self.state.read();
            let mut records: Vec<ObjectRecord> = state
                .objects
                .iter()
                .filter(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| ObjectRecord {
                    key: k.clone(),
                    last_modified: v.last_modified,
                })
                .collect();

            // Sort by key for consistent ordering
            records.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(records)
        })
    }

    fn create_multipart<'a>(&'a self, key: &'a str) -> StoreFuture<'a, UploadId> {
        Box::pin(async move {
            let n = self.next_upload.fetch_add(1, Ordering::Relaxed);
            let upload_id = UploadId(format!("mem-upload-{}", n));
            self.state.write().uploads.insert(
                upload_id.clone(),
                PendingUpload {
                    key: key.to_string(),
                    parts: BTreeMap::new(),
                },
            );
            Ok(upload_id)
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
            if part_number == 0 {
                return Err(IoError::new(
                    ErrorKind::InvalidInput,
                    "part numbers start at 1",
                ));
            }
            let mut state = self.state.write();
            let upload = state
                .uploads
                .get_mut(upload_id)
                .filter(|u| u.key == key)
                .ok_or_else(|| Self::session_mismatch(upload_id, key))?;
            let tag = part_tag(part_number, &data);
            upload.parts.insert(part_number, (tag.clone(), data));
            Ok(CompletedPart { part_number, tag })
        })
    }

    fn complete_multipart<'a>(
        &'a self,
        key: &'a str,
        upload_id: &'a UploadId,
        parts: Vec<CompletedPart>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.write();
            let upload = state
                .uploads
                .get(upload_id)
                .filter(|u| u.key == key)
                .ok_or_else(|| Self::session_mismatch(upload_id, key))?;

            // Parts must be exactly 1..=n in order, each matching what was uploaded
            let mut body = BytesMut::new();
            for (expected, part) in (1u32..).zip(parts.iter()) {
                if part.part_number != expected {
                    return Err(IoError::new(
                        ErrorKind::InvalidInput,
                        format!(
                            "part sequence broken: expected {}, got {}",
                            expected, part.part_number
                        ),
                    ));
                }
                match upload.parts.get(&part.part_number) {
                    Some((tag, data)) if *tag == part.tag => body.extend_from_slice(data),
                    _ => {
                        return Err(IoError::new(
                            ErrorKind::InvalidInput,
                            format!("unknown tag for part {}", part.part_number),
                        ))
                    }
                }
            }

            state.uploads.remove(upload_id);
            let obj = StoredObject {
                data: body.freeze(),
                last_modified: self.clock.now(),
            };
            state.objects.insert(key.to_string(), obj);
            Ok(())
        })
    }

    fn abort_multipart<'a>(
        &'a self,
        key: &'a str,
        upload_id: &'a UploadId,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.write();
            match state.uploads.get(upload_id) {
                Some(u) if u.key == key => {
                    state.uploads.remove(upload_id);
                    Ok(())
                }
                _ => Err(Self::session_mismatch(upload_id, key)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimulatedClock;
    use futures::TryStreamExt;

    async fn read_all(store: &impl ObjectStoreClient, key: &str) -> Vec<u8> {
        let chunks: Vec<Bytes> = store.get(key).await.unwrap().try_collect().await.unwrap();
        chunks.concat()
    }

    #[tokio::test]
    async fn test_inmemory_put_get() {
        let store = InMemoryObjectStore::new();

        store.put("test/key1", Bytes::from_static(b"hello world")).await.unwrap();
        assert_eq!(read_all(&store, "test/key1").await, b"hello world");
    }

    #[tokio::test]
    async fn test_inmemory_get_missing() {
        let store = InMemoryObjectStore::new();
        let err = store.get("nope").await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_inmemory_exists() {
        let store = InMemoryObjectStore::new();

        assert!(!store.exists("test/key1").await.unwrap());
        store.put("test/key1", Bytes::from_static(b"data")).await.unwrap();
        assert!(store.exists("test/key1").await.unwrap());
    }

    #[tokio::test]
    async fn test_inmemory_list_uses_clock() {
        let clock = SimulatedClock::new(1_000);
        let store = InMemoryObjectStore::with_clock(clock.clone());

        store.put("incoming/a", Bytes::from_static(b"1")).await.unwrap();
        clock.advance_ms(500);
        store.put("incoming/b", Bytes::from_static(b"2")).await.unwrap();
        store.put("other/c", Bytes::from_static(b"3")).await.unwrap();

        let records = store.list("incoming/").await.unwrap();
        assert_eq!(
            records,
            vec![
                ObjectRecord {
                    key: "incoming/a".to_string(),
                    last_modified: Timestamp(1_000)
                },
                ObjectRecord {
                    key: "incoming/b".to_string(),
                    last_modified: Timestamp(1_500)
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_multipart_assembles_parts_in_order() {
        let store = InMemoryObjectStore::new();
        let id = store.create_multipart("big").await.unwrap();

        let p1 = store.upload_part("big", &id, 1, Bytes::from_static(b"hello ")).await.unwrap();
        let p2 = store.upload_part("big", &id, 2, Bytes::from_static(b"world")).await.unwrap();
        assert_eq!(store.pending_uploads(), 1);

        store.complete_multipart("big", &id, vec![p1, p2]).await.unwrap();
        assert_eq!(read_all(&store, "big").await, b"hello world");
        assert_eq!(store.pending_uploads(), 0);
    }

    #[tokio::test]
    async fn test_multipart_rejects_gapped_sequence() {
        let store = InMemoryObjectStore::new();
        let id = store.create_multipart("big").await.unwrap();

        let _p1 = store.upload_part("big", &id, 1, Bytes::from_static(b"a")).await.unwrap();
        let p2 = store.upload_part("big", &id, 2, Bytes::from_static(b"b")).await.unwrap();

        let err = store.complete_multipart("big", &id, vec![p2]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(!store.exists("big").await.unwrap());
    }

    #[tokio::test]
    async fn test_multipart_rejects_stale_tag() {
        let store = InMemoryObjectStore::new();
        let id = store.create_multipart("big").await.unwrap();

        let mut p1 = store.upload_part("big", &id, 1, Bytes::from_static(b"a")).await.unwrap();
        p1.tag = "bogus".to_string();

        let err = store.complete_multipart("big", &id, vec![p1]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_multipart_zero_parts_yields_empty_object() {
        let store = InMemoryObjectStore::new();
        let id = store.create_multipart("empty").await.unwrap();

        store.complete_multipart("empty", &id, Vec::new()).await.unwrap();
        assert!(store.exists("empty").await.unwrap());
        assert!(read_all(&store, "empty").await.is_empty());
    }

    #[tokio::test]
    async fn test_abort_discards_session() {
        let store = InMemoryObjectStore::new();
        let id = store.create_multipart("big").await.unwrap();
        store.upload_part("big", &id, 1, Bytes::from_static(b"a")).await.unwrap();

        store.abort_multipart("big", &id).await.unwrap();
        assert_eq!(store.pending_uploads(), 0);
        assert!(!store.exists("big").await.unwrap());

        // Session is gone
        let err = store.abort_multipart("big", &id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_upload_part_wrong_key() {
        let store = InMemoryObjectStore::new();
        let id = store.create_multipart("big").await.unwrap();

        let err = store
            .upload_part("other", &id, 1, Bytes::from_static(b"a"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
