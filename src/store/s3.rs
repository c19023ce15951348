//! S3 Object Store Implementation
//!
//! Provides an S3-compatible object store for production use.
//! Uses the `object_store` crate from the Arrow ecosystem, both its plain
//! object API and its low-level `MultipartStore` API, which exposes upload
//! ids and part numbers directly.
//!
//! Supports:
//! - AWS S3
//! - S3-compatible services (MinIO, LocalStack, etc.)
//! - Custom endpoints

use super::{ByteStream, CompletedPart, ObjectRecord, ObjectStoreClient, StoreFuture, UploadId};
use crate::clock::Timestamp;
use crate::config::S3Config;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::multipart::{MultipartStore, PartId};
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore as _;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::sync::Arc;

/// S3 Object Store for production deployments
#[derive(Clone)]
pub struct S3ObjectStore {
    store: Arc<AmazonS3>,
    prefix: String,
}

impl S3ObjectStore {
    /// Create a new S3 object store
    ///
    /// Credentials come from the environment:
    /// - AWS_ACCESS_KEY_ID
    /// - AWS_SECRET_ACCESS_KEY
    /// - AWS_REGION (or uses config.region)
    /// - AWS_ENDPOINT (or uses config.endpoint for MinIO)
    pub fn new(config: S3Config) -> IoResult<Self> {
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(&config.bucket)
            .with_region(&config.region);

        // Use custom endpoint for S3-compatible services (MinIO)
        if let Some(endpoint) = &config.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }

        let store = builder.build().map_err(|e| {
            IoError::new(
                ErrorKind::InvalidInput,
                format!("Failed to create S3 store: {}", e),
            )
        })?;

        Ok(S3ObjectStore {
            store: Arc::new(store),
            prefix: config.prefix.trim_matches('/').to_string(),
        })
    }

    /// Get the full path with prefix
    fn full_path(&self, key: &str) -> ObjectPath {
        if self.prefix.is_empty() {
            ObjectPath::from(key)
        } else {
            ObjectPath::from(format!("{}/{}", self.prefix, key))
        }
    }

    /// Strip prefix from path
    fn strip_prefix(&self, path: &ObjectPath) -> String {
        let path_str = path.to_string();
        if self.prefix.is_empty() {
            path_str
        } else {
            let prefix_with_slash = format!("{}/", self.prefix);
            path_str
                .strip_prefix(&prefix_with_slash)
                .unwrap_or(&path_str)
                .to_string()
        }
    }

    /// Convert object_store errors to IoError
    fn map_error(err: object_store::Error) -> IoError {
        match &err {
            object_store::Error::NotFound { .. } => IoError::new(ErrorKind::NotFound, err.to_string()),
            object_store::Error::AlreadyExists { .. } => {
                IoError::new(ErrorKind::AlreadyExists, err.to_string())
            }
            object_store::Error::Precondition { .. } => {
                IoError::new(ErrorKind::InvalidInput, err.to_string())
            }
            _ => IoError::new(ErrorKind::Other, err.to_string()),
        }
    }
}

impl std::fmt::Debug for S3ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3ObjectStore")
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl ObjectStoreClient for S3ObjectStore {
    fn put<'a>(&'a self, key: &'a str, data: Bytes) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let path = self.full_path(key);
            self.store
                .put(&path, data.into())
                .await
                .map_err(Self::map_error)?;
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ByteStream> {
        Box::pin(async move {
            let path = self.full_path(key);
            let result = self.store.get(&path).await.map_err(Self::map_error)?;
            Ok(result.into_stream().map_err(Self::map_error).boxed())
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let path = self.full_path(key);
            match self.store.head(&path).await {
                Ok(_) => Ok(true),
                Err(object_store::Error::NotFound { .. }) => Ok(false),
                Err(e) => Err(Self::map_error(e)),
            }
        })
    }

    fn list<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<ObjectRecord>> {
        Box::pin(async move {
            // S3 paginates internally; the stream yields the complete key set
            let base = if self.prefix.is_empty() {
                None
            } else {
                Some(ObjectPath::from(self.prefix.as_str()))
            };
            let metas: Vec<_> = self
                .store
                .list(base.as_ref())
                .try_collect()
                .await
                .map_err(Self::map_error)?;

            let mut records: Vec<ObjectRecord> = metas
                .into_iter()
                .map(|meta| ObjectRecord {
                    key: self.strip_prefix(&meta.location),
                    last_modified: Timestamp::from_millis(
                        meta.last_modified.timestamp_millis().try_into().unwrap_or(0),
                    ),
                })
                .filter(|r| r.key.starts_with(prefix))
                .collect();
            records.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(records)
        })
    }

    fn create_multipart<'a>(&'a self, key: &'a str) -> StoreFuture<'a, UploadId> {
        Box::pin(async move {
            let path = self.full_path(key);
            let id = self
                .store
                .create_multipart(&path)
                .await
                .map_err(Self::map_error)?;
            Ok(UploadId(id))
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
                return Err(IoError::new(ErrorKind::InvalidInput, "part numbers start at 1"));
            }
            let path = self.full_path(key);
            // object_store numbers parts from zero
            let part = self
                .store
                .put_part(&path, &upload_id.0, (part_number - 1) as usize, data.into())
                .await
                .map_err(Self::map_error)?;
            Ok(CompletedPart {
                part_number,
                tag: part.content_id,
            })
        })
    }

    fn complete_multipart<'a>(
        &'a self,
        key: &'a str,
        upload_id: &'a UploadId,
        parts: Vec<CompletedPart>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let path = self.full_path(key);

            // S3 rejects a completion with no parts: drop the session and
            // write the empty object directly
            if parts.is_empty() {
                self.store
                    .abort_multipart(&path, &upload_id.0)
                    .await
                    .map_err(Self::map_error)?;
                self.store
                    .put(&path, Bytes::new().into())
                    .await
                    .map_err(Self::map_error)?;
                return Ok(());
            }

            let part_ids = parts
                .into_iter()
                .map(|p| PartId { content_id: p.tag })
                .collect();
            self.store
                .complete_multipart(&path, &upload_id.0, part_ids)
                .await
                .map_err(Self::map_error)?;
            Ok(())
        })
    }

    fn abort_multipart<'a>(
        &'a self,
        key: &'a str,
        upload_id: &'a UploadId,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let path = self.full_path(key);
            self.store
                .abort_multipart(&path, &upload_id.0)
                .await
                .map_err(Self::map_error)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_prefix(prefix: &str) -> S3ObjectStore {
        S3ObjectStore::new(S3Config {
            bucket: "test-bucket".to_string(),
            prefix: prefix.to_string(),
            region: "us-east-1".to_string(),
            endpoint: Some("http://localhost:9000".to_string()),
        })
        .unwrap()
    }

    #[test]
    fn test_full_path_with_prefix() {
        let store = store_with_prefix("incoming/");
        assert_eq!(
            store.full_path("reports/q1.json").to_string(),
            "incoming/reports/q1.json"
        );
    }

    #[test]
    fn test_full_path_without_prefix() {
        let store = store_with_prefix("");
        assert_eq!(store.full_path("reports/q1.json").to_string(), "reports/q1.json");
    }

    #[test]
    fn test_strip_prefix() {
        let store = store_with_prefix("incoming");
        let path = ObjectPath::from("incoming/reports/q1.json");
        assert_eq!(store.strip_prefix(&path), "reports/q1.json");
    }
}
