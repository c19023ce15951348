//! Configuration for bucket access, monitoring and transfers
//!
//! Loaded from TOML, with `BUCKET_WATCH_*` environment variables taking
//! precedence for the tunables.

use crate::error::{BucketError, BucketResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Smallest part size S3 accepts for every part but the last (5 MiB)
pub const MIN_CHUNK_SIZE: usize = 5 * 1024 * 1024;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketConfig {
    /// Object store backend
    pub store_type: StoreType,
    /// Root directory (for LocalFs store)
    pub local_path: Option<PathBuf>,
    /// S3 configuration (for S3 store)
    #[cfg(feature = "s3")]
    pub s3: Option<S3Config>,
    /// Change monitor settings
    pub monitor: MonitorConfig,
    /// Transfer settings
    pub transfer: TransferConfig,
}

impl Default for BucketConfig {
    fn default() -> Self {
        BucketConfig {
            store_type: StoreType::InMemory,
            local_path: None,
            #[cfg(feature = "s3")]
            s3: None,
            monitor: MonitorConfig::default(),
            transfer: TransferConfig::default(),
        }
    }
}

impl BucketConfig {
    /// Create config for a local directory bucket
    pub fn local(path: PathBuf) -> Self {
        BucketConfig {
            store_type: StoreType::LocalFs,
            local_path: Some(path),
            ..Self::default()
        }
    }

    /// Create config for testing (in-memory, fast polling)
    pub fn test() -> Self {
        BucketConfig {
            monitor: MonitorConfig::test(),
            ..Self::default()
        }
    }

    /// Parse a TOML document
    pub fn from_toml_str(s: &str) -> BucketResult<Self> {
        toml::from_str(s).map_err(|e| BucketError::Config(e.to_string()))
    }

    /// Read and parse a TOML file
    pub fn from_file(path: &Path) -> BucketResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| BucketError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    /// Apply `BUCKET_WATCH_*` environment overrides
    pub fn with_env_overrides(mut self) -> BucketResult<Self> {
        if let Some(ms) = env_number("BUCKET_WATCH_POLL_INTERVAL_MS")? {
            self.monitor.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_number("BUCKET_WATCH_ERROR_BACKOFF_MS")? {
            self.monitor.error_backoff = Duration::from_millis(ms);
        }
        if let Some(size) = env_number("BUCKET_WATCH_CHUNK_SIZE")? {
            self.transfer.chunk_size = size as usize;
        }
        if let Ok(prefix) = std::env::var("BUCKET_WATCH_PREFIX") {
            self.monitor.prefix = prefix;
        }
        Ok(self)
    }

    /// Reject settings the store or the monitor cannot work with
    pub fn validate(&self) -> BucketResult<()> {
        if self.monitor.poll_interval.is_zero() {
            return Err(BucketError::Config("poll_interval must be non-zero".to_string()));
        }
        if self.transfer.chunk_size < MIN_CHUNK_SIZE {
            return Err(BucketError::Config(format!(
                "chunk_size {} is below the multipart minimum of {} bytes",
                self.transfer.chunk_size, MIN_CHUNK_SIZE
            )));
        }
        match self.store_type {
            StoreType::InMemory => {}
            StoreType::LocalFs if self.local_path.is_none() => {
                return Err(BucketError::Config(
                    "local_path is required for the LocalFs store".to_string(),
                ));
            }
            StoreType::LocalFs => {}
            #[cfg(feature = "s3")]
            StoreType::S3 if self.s3.is_none() => {
                return Err(BucketError::Config(
                    "an [s3] section is required for the S3 store".to_string(),
                ));
            }
            #[cfg(feature = "s3")]
            StoreType::S3 => {}
        }
        Ok(())
    }
}

fn env_number(name: &str) -> BucketResult<Option<u64>> {
    match std::env::var(name) {
        Ok(v) => v
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| BucketError::Config(format!("{} must be a number, got {:?}", name, v))),
        Err(_) => Ok(None),
    }
}

/// Type of object store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreType {
    /// In-memory store (for tests)
    InMemory,
    /// Local filesystem
    LocalFs,
    /// Amazon S3 or compatible
    #[cfg(feature = "s3")]
    S3,
}

/// S3 configuration
#[cfg(feature = "s3")]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    /// S3 bucket name
    pub bucket: String,
    /// Key prefix within bucket
    #[serde(default)]
    pub prefix: String,
    /// AWS region
    pub region: String,
    /// Custom endpoint (for S3-compatible services like MinIO)
    pub endpoint: Option<String>,
}

/// Change monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Sleep between poll cycles (default: 5s)
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
    /// Sleep after a failed listing (default: 30s)
    #[serde(with = "duration_millis")]
    pub error_backoff: Duration,
    /// Only watch keys under this prefix (default: whole bucket)
    pub prefix: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            poll_interval: Duration::from_secs(5),
            error_backoff: Duration::from_secs(30),
            prefix: String::new(),
        }
    }
}

impl MonitorConfig {
    /// Configuration for tests (fast polling, short backoff)
    pub fn test() -> Self {
        MonitorConfig {
            poll_interval: Duration::from_millis(50),
            error_backoff: Duration::from_millis(200),
            prefix: String::new(),
        }
    }
}

/// Transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Multipart chunk size in bytes (default: 5 MiB)
    pub chunk_size: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            chunk_size: MIN_CHUNK_SIZE,
        }
    }
}

/// Serde helper for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BucketConfig::default();
        assert_eq!(config.store_type, StoreType::InMemory);
        assert_eq!(config.monitor.poll_interval, Duration::from_secs(5));
        assert_eq!(config.monitor.error_backoff, Duration::from_secs(30));
        assert_eq!(config.transfer.chunk_size, 5_242_880);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_monitor_config_serialization() {
        let config = MonitorConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: MonitorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config.poll_interval, parsed.poll_interval);
        assert_eq!(config.error_backoff, parsed.error_backoff);
    }

    #[test]
    fn test_from_toml() {
        let config = BucketConfig::from_toml_str(
            r#"
            store_type = "LocalFs"
            local_path = "/tmp/bucket"

            [monitor]
            poll_interval = 1000
            prefix = "incoming/"
            "#,
        )
        .unwrap();

        assert_eq!(config.store_type, StoreType::LocalFs);
        assert_eq!(config.local_path, Some(PathBuf::from("/tmp/bucket")));
        assert_eq!(config.monitor.poll_interval, Duration::from_secs(1));
        // Unset fields keep their defaults
        assert_eq!(config.monitor.error_backoff, Duration::from_secs(30));
        assert_eq!(config.monitor.prefix, "incoming/");
        assert_eq!(config.transfer.chunk_size, MIN_CHUNK_SIZE);
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let err = BucketConfig::from_toml_str("store_type = 42").unwrap_err();
        assert!(matches!(err, BucketError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_small_chunks() {
        let mut config = BucketConfig::test();
        config.transfer.chunk_size = 1024;
        assert!(matches!(config.validate(), Err(BucketError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = BucketConfig::test();
        config.monitor.poll_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_local_config() {
        let config = BucketConfig::local(PathBuf::from("/tmp/bucket"));
        assert_eq!(config.store_type, StoreType::LocalFs);
        assert!(config.validate().is_ok());

        let missing = BucketConfig {
            local_path: None,
            ..config
        };
        assert!(missing.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("BUCKET_WATCH_POLL_INTERVAL_MS", "250");
        std::env::set_var("BUCKET_WATCH_PREFIX", "uploads/");
        let config = BucketConfig::default().with_env_overrides().unwrap();
        std::env::remove_var("BUCKET_WATCH_POLL_INTERVAL_MS");
        std::env::remove_var("BUCKET_WATCH_PREFIX");

        assert_eq!(config.monitor.poll_interval, Duration::from_millis(250));
        assert_eq!(config.monitor.prefix, "uploads/");
    }
}
