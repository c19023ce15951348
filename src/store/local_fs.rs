//! Local filesystem object store for development
//!
//! A directory plays the bucket. Multipart parts are staged under
//! `.multipart/<upload id>/` and concatenated into place on completion.

use super::{part_tag, ByteStream, CompletedPart, ObjectRecord, ObjectStoreClient, StoreFuture, UploadId};
use crate::clock::Timestamp;
use bytes::Bytes;
use futures::StreamExt;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

/// Staging directory for multipart sessions, hidden from listings
const MULTIPART_DIR: &str = ".multipart";

/// Local filesystem object store
#[derive(Debug, Clone)]
pub struct LocalFsObjectStore {
    base_path: PathBuf,
}

impl LocalFsObjectStore {
    /// Use `base_path` as the bucket root, creating it if needed
    pub async fn open(base_path: PathBuf) -> IoResult<Self> {
        tokio::fs::create_dir_all(&base_path).await?;
        Ok(LocalFsObjectStore { base_path })
    }

    /// Get the base path
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Resolve a key to a path, refusing keys that escape the root
    fn full_path(&self, key: &str) -> IoResult<PathBuf> {
        let relative = Path::new(key);
        let escapes = relative.components().any(|c| {
            !matches!(c, std::path::Component::Normal(_))
        });
        if key.is_empty() || escapes || key.starts_with(MULTIPART_DIR) {
            return Err(IoError::new(
                ErrorKind::InvalidInput,
                format!("Invalid object key: {}", key),
            ));
        }
        Ok(self.base_path.join(relative))
    }

    fn upload_dir(&self, upload_id: &UploadId) -> IoResult<PathBuf> {
        if upload_id.as_str().contains(['/', '\\', '.']) {
            return Err(IoError::new(
                ErrorKind::InvalidInput,
                format!("Invalid upload id: {}", upload_id),
            ));
        }
        Ok(self.base_path.join(MULTIPART_DIR).join(upload_id.as_str()))
    }

    async fn ensure_parent(path: &Path) -> IoResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Check that `upload_id` belongs to `key`
    async fn check_session(&self, key: &str, upload_id: &UploadId) -> IoResult<PathBuf> {
        let dir = self.upload_dir(upload_id)?;
        match tokio::fs::read_to_string(dir.join("key")).await {
            Ok(owner) if owner == key => Ok(dir),
            Ok(_) => Err(IoError::new(
                ErrorKind::NotFound,
                format!("No upload {} for key {}", upload_id, key),
            )),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(IoError::new(
                ErrorKind::NotFound,
                format!("No upload {} for key {}", upload_id, key),
            )),
            Err(e) => Err(e),
        }
    }

    fn walk_dir(dir: &Path, base: &Path, prefix: &str, records: &mut Vec<ObjectRecord>) -> IoResult<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();

            if path.is_dir() {
                if dir == base && entry.file_name() == MULTIPART_DIR {
                    continue;
                }
                Self::walk_dir(&path, base, prefix, records)?;
            } else if path.is_file() {
                let Ok(relative) = path.strip_prefix(base) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");

                if key.starts_with(prefix) {
                    let metadata = entry.metadata()?;
                    records.push(ObjectRecord {
                        key,
                        last_modified: metadata
                            .modified()
                            .map(Timestamp::from_system_time)
                            .unwrap_or(Timestamp::MIN),
                    });
                }
            }
        }
        Ok(())
    }
}

impl ObjectStoreClient for LocalFsObjectStore {
    fn put<'a>(&'a self, key: &'a str, data: Bytes) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let path = self.full_path(key)?;
            Self::ensure_parent(&path).await?;
            tokio::fs::write(&path, &data).await
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ByteStream> {
        Box::pin(async move {
            let path = self.full_path(key)?;
            let file = tokio::fs::File::open(&path).await?;
            Ok(ReaderStream::new(file).boxed())
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let path = self.full_path(key)?;
            match tokio::fs::metadata(&path).await {
                Ok(meta) => Ok(meta.is_file()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e),
            }
        })
    }

    fn list<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<ObjectRecord>> {
        Box::pin(async move {
            let base = self.base_path.clone();
            let prefix = prefix.to_string();

            // Directory walking is blocking; keep it off the runtime threads
            let mut records = tokio::task::spawn_blocking(move || {
                let mut records = Vec::new();
                Self::walk_dir(&base, &base, &prefix, &mut records)?;
                Ok::<_, IoError>(records)
            })
            .await
            .map_err(|e| IoError::new(ErrorKind::Other, e))??;

            records.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(records)
        })
    }

    fn create_multipart<'a>(&'a self, key: &'a str) -> StoreFuture<'a, UploadId> {
        Box::pin(async move {
            self.full_path(key)?;
            let upload_id = UploadId(format!("{:016x}", rand::random::<u64>()));
            let dir = self.upload_dir(&upload_id)?;
            tokio::fs::create_dir_all(&dir).await?;
            tokio::fs::write(dir.join("key"), key.as_bytes()).await?;
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
                return Err(IoError::new(ErrorKind::InvalidInput, "part numbers start at 1"));
            }
            let dir = self.check_session(key, upload_id).await?;
            tokio::fs::write(dir.join(format!("part-{:05}", part_number)), &data).await?;
            Ok(CompletedPart {
                part_number,
                tag: part_tag(part_number, &data),
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
            let dir = self.check_session(key, upload_id).await?;
            let target = self.full_path(key)?;
            Self::ensure_parent(&target).await?;

            // Assemble next to the target, then rename into place
            let staging = dir.join("assembled");
            let mut out = tokio::fs::File::create(&staging).await?;
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
                let data = tokio::fs::read(dir.join(format!("part-{:05}", part.part_number))).await?;
                if part_tag(part.part_number, &data) != part.tag {
                    return Err(IoError::new(
                        ErrorKind::InvalidInput,
                        format!("unknown tag for part {}", part.part_number),
                    ));
                }
                out.write_all(&data).await?;
            }
            out.flush().await?;
            drop(out);

            tokio::fs::rename(&staging, &target).await?;
            tokio::fs::remove_dir_all(&dir).await
        })
    }

    fn abort_multipart<'a>(
        &'a self,
        key: &'a str,
        upload_id: &'a UploadId,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let dir = self.check_session(key, upload_id).await?;
            tokio::fs::remove_dir_all(&dir).await
        })
    }
}
