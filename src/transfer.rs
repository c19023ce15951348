//! Transfer Engine
//!
//! Whole-object and multipart reads/writes against an `ObjectStoreClient`.
//!
//! ## Multipart writes
//!
//! ```text
//! reader ──► 5 MiB chunks ──► upload_part(1..n) ──► complete(parts)
//!                  │                 │
//!                  └── any error ────┴──► abort(upload) ──► TransferFailure
//! ```
//!
//! Parts are uploaded one at a time, so part numbers are assigned and
//! completed strictly in order. Successful writes publish a `ChangeEvent`.

use crate::config::TransferConfig;
use crate::error::{BucketError, BucketResult};
use crate::events::{ChangeEvent, EventBus};
use crate::monitor::LocalWrites;
use crate::store::{ByteStream, CompletedPart, ObjectStoreClient, UploadId};
use bytes::{Bytes, BytesMut};
use futures::TryStreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Result as IoResult;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};

/// Forward-only reader over a stored object's body.
/// Dropping it releases the underlying response.
pub type ObjectReader = StreamReader<ByteStream, Bytes>;

/// State of one multipart upload, owned by the call performing it
#[derive(Debug)]
pub struct UploadSession {
    upload_id: UploadId,
    /// Number the next uploaded part will get
    part_number: u32,
    completed_parts: Vec<CompletedPart>,
}

impl UploadSession {
    fn new(upload_id: UploadId) -> Self {
        UploadSession {
            upload_id,
            part_number: 1,
            completed_parts: Vec::new(),
        }
    }

    pub fn upload_id(&self) -> &UploadId {
        &self.upload_id
    }

    /// Parts acknowledged so far, in upload order
    pub fn completed_parts(&self) -> &[CompletedPart] {
        &self.completed_parts
    }

    fn next_part_number(&self) -> u32 {
        self.part_number
    }

    fn record(&mut self, part: CompletedPart) {
        debug_assert_eq!(part.part_number, self.part_number, "parts must complete in order");
        self.completed_parts.push(part);
        self.part_number += 1;
    }
}

/// Aborts the session in the background if the write future is dropped
/// before finishing (caller cancelled mid-upload).
struct SessionGuard {
    store: Arc<dyn ObjectStoreClient>,
    key: String,
    session: UploadSession,
    finished: bool,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(
                "Upload {} for {} dropped outside a runtime, not aborted",
                self.session.upload_id, self.key
            );
            return;
        };
        let store = Arc::clone(&self.store);
        let key = std::mem::take(&mut self.key);
        let upload_id = self.session.upload_id.clone();
        handle.spawn(async move {
            if let Err(e) = store.abort_multipart(&key, &upload_id).await {
                warn!("Abort of cancelled upload {} for {} failed: {}", upload_id, key, e);
            }
        });
    }
}

/// Moves object bytes between callers and the store
#[derive(Clone)]
pub struct TransferEngine {
    store: Arc<dyn ObjectStoreClient>,
    bus: EventBus,
    local_writes: LocalWrites,
    chunk_size: usize,
}

impl std::fmt::Debug for TransferEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferEngine")
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

impl TransferEngine {
    pub fn new(
        store: Arc<dyn ObjectStoreClient>,
        bus: EventBus,
        local_writes: LocalWrites,
        config: &TransferConfig,
    ) -> BucketResult<Self> {
        if config.chunk_size == 0 {
            return Err(BucketError::Config("chunk_size must be non-zero".to_string()));
        }
        Ok(TransferEngine {
            store,
            bus,
            local_writes,
            chunk_size: config.chunk_size,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Write a whole object. Fails with `AlreadyExists` if `key` is present.
    pub async fn write(&self, key: &str, data: impl Into<Bytes>) -> BucketResult<()> {
        // Check-then-put is not atomic: two writers racing on one key can both succeed
        if self.store.exists(key).await? {
            return Err(BucketError::AlreadyExists {
                key: key.to_string(),
            });
        }

        let pending = self.local_writes.register(key);
        self.store
            .put(key, data.into())
            .await
            .map_err(|e| BucketError::from_store(key, e))?;
        pending.commit();

        debug!("Wrote {}", key);
        self.bus.publish(ChangeEvent::local(key));
        Ok(())
    }

    /// Encode `value` as JSON and write it with `write` semantics
    pub async fn write_object<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> BucketResult<()> {
        let data = serde_json::to_vec(value).map_err(|source| BucketError::Encode {
            key: key.to_string(),
            source,
        })?;
        self.write(key, data).await
    }

    /// Stream `reader` into the store as a multipart upload.
    ///
    /// On any failure the upload session is aborted before the error is
    /// returned; abort errors are only logged.
    pub async fn write_large<R>(&self, key: &str, reader: R) -> BucketResult<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        let pending = self.local_writes.register(key);
        let upload_id = self
            .store
            .create_multipart(key)
            .await
            .map_err(|e| BucketError::from_store(key, e))?;

        let mut guard = SessionGuard {
            store: Arc::clone(&self.store),
            key: key.to_string(),
            session: UploadSession::new(upload_id),
            finished: false,
        };

        if let Err(source) = self.upload_all(key, &mut guard.session, reader).await {
            let upload_id = guard.session.upload_id.clone();
            if let Err(e) = self.store.abort_multipart(key, &upload_id).await {
                warn!("Failed to abort upload {} for {}: {}", upload_id, key, e);
            }
            guard.finished = true;
            return Err(BucketError::TransferFailure {
                key: key.to_string(),
                upload_id: upload_id.0,
                source,
            });
        }
        guard.finished = true;
        pending.commit();

        info!(
            "Uploaded {} in {} parts",
            key,
            guard.session.completed_parts.len()
        );
        self.bus.publish(ChangeEvent::local(key));
        Ok(())
    }

    async fn upload_all<R>(&self, key: &str, session: &mut UploadSession, mut reader: R) -> IoResult<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        loop {
            let chunk = read_chunk(&mut reader, self.chunk_size).await?;
            if chunk.is_empty() {
                break;
            }
            let short = chunk.len() < self.chunk_size;

            let part_number = session.next_part_number();
            let part = self
                .store
                .upload_part(key, &session.upload_id, part_number, chunk)
                .await?;
            debug!("Uploaded part {} of {}", part_number, key);
            session.record(part);

            // A short chunk means the reader is exhausted
            if short {
                break;
            }
        }

        self.store
            .complete_multipart(key, &session.upload_id, session.completed_parts.clone())
            .await
    }

    /// Read a whole object into memory
    pub async fn read(&self, key: &str) -> BucketResult<Bytes> {
        let stream = self
            .store
            .get(key)
            .await
            .map_err(|e| BucketError::from_store(key, e))?;
        let body = stream
            .try_fold(BytesMut::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await
            .map_err(|e| BucketError::from_store(key, e))?;
        Ok(body.freeze())
    }

    /// Read an object and decode it from JSON
    pub async fn read_object<T: DeserializeOwned>(&self, key: &str) -> BucketResult<T> {
        let data = self.read(key).await?;
        serde_json::from_slice(&data).map_err(|source| BucketError::Decode {
            key: key.to_string(),
            source,
        })
    }

    /// Open an object as a lazy reader sourced directly from the store
    pub async fn read_large(&self, key: &str) -> BucketResult<ObjectReader> {
        let stream = self
            .store
            .get(key)
            .await
            .map_err(|e| BucketError::from_store(key, e))?;
        Ok(StreamReader::new(stream))
    }
}

/// Fill up to `size` bytes from `reader`. Shorter only at end of input.
async fn read_chunk<R: AsyncRead + Unpin>(reader: &mut R, size: usize) -> IoResult<Bytes> {
    let mut buf = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(Bytes::from(buf))
}
