// cache-core/src/config.rs

//! Configuration management for the dataset cache.
//!
//! This module provides configuration parsing from TOML files, environment
//! variable overrides, and validation of configuration values.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{CacheError, Result};

// Top-level cache configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub storage: StorageConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinator: Option<CoordinatorConfig>,
    pub keyed_store: KeyedStoreConfig,
}

/// Storage backend type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendType {
    /// Local (or shared network) filesystem.
    #[default]
    Local,
    /// S3-compatible object storage with a local mirror.
    S3,
    /// Google Cloud Storage with a local mirror.
    Gcs,
}

impl StorageBackendType {
    /// Returns true for backends that keep a local mirror of a remote object.
    pub fn is_cloud(&self) -> bool {
        !matches!(self, Self::Local)
    }
}

// Storage configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage backend type: "local", "s3" or "gcs".
    pub backend: StorageBackendType,
    // Root directory of the local backend.
    pub storage_dir: PathBuf,
    // Bucket name (cloud backends).
    pub bucket: String,
    // Object-path prefix inside the bucket (cloud backends).
    pub bucket_prefix: String,
    // Root of the local mirror (cloud backends).
    pub local_cache_dir: PathBuf,
    /// S3-specific configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Config>,
    /// GCS-specific configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gcs: Option<GcsConfig>,
}

/// S3-compatible storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    /// AWS region (e.g., "us-east-1").
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// AWS access key ID (if not using instance credentials).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_key_id: Option<String>,
    /// AWS secret access key (if not using instance credentials).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_access_key: Option<String>,
    /// AWS session token (for temporary credentials).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    /// Maximum number of idle pooled connections per host.
    pub max_connections: usize,
    /// File size threshold (bytes) above which uploads go multipart.
    pub multipart_threshold: u64,
    /// Chunk size (bytes) for multipart upload parts.
    pub multipart_chunk_size: usize,
    /// Maximum number of retries the object store client performs.
    pub max_retries: u32,
    /// Initial delay (milliseconds) between retries.
    pub retry_delay_ms: u64,
    /// Maximum delay (milliseconds) between retries.
    pub max_retry_delay_ms: u64,
    /// Connection timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Request timeout in milliseconds.
    pub request_timeout_ms: u64,
    /// Use path-style addressing against AWS. Custom endpoints (MinIO and
    /// the like) are always addressed by path.
    pub force_path_style: bool,
    /// Whether to allow HTTP (non-TLS) connections.
    pub allow_http: bool,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            max_connections: 64,
            multipart_threshold: 100 * 1024 * 1024, // 100 MB
            multipart_chunk_size: 32 * 1024 * 1024, // 32 MB
            max_retries: 5,
            retry_delay_ms: 100,
            max_retry_delay_ms: 30_000,
            connect_timeout_ms: 5_000,
            request_timeout_ms: 30_000,
            force_path_style: false,
            allow_http: false,
        }
    }
}

impl S3Config {
    /// Apply environment variable overrides to S3 configuration.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("DSC_S3_REGION") {
            self.region = val;
        }
        if let Ok(val) = std::env::var("DSC_S3_ENDPOINT") {
            self.endpoint = Some(val);
        }
        if let Ok(val) = std::env::var("DSC_S3_ACCESS_KEY_ID") {
            self.access_key_id = Some(val);
        }
        if let Ok(val) = std::env::var("DSC_S3_SECRET_ACCESS_KEY") {
            self.secret_access_key = Some(val);
        }
        if let Ok(val) = std::env::var("DSC_S3_SESSION_TOKEN") {
            self.session_token = Some(val);
        }
        if let Ok(val) = std::env::var("DSC_S3_MAX_RETRIES") {
            if let Ok(v) = val.parse() {
                self.max_retries = v;
            }
        }
        if let Ok(val) = std::env::var("DSC_S3_MULTIPART_THRESHOLD") {
            if let Ok(v) = val.parse() {
                self.multipart_threshold = v;
            }
        }
        if let Ok(val) = std::env::var("DSC_S3_FORCE_PATH_STYLE") {
            if let Ok(v) = val.parse() {
                self.force_path_style = v;
            }
        }
        if let Ok(val) = std::env::var("DSC_S3_ALLOW_HTTP") {
            if let Ok(v) = val.parse() {
                self.allow_http = v;
            }
        }
        self
    }

    /// Validate S3 configuration.
    pub fn validate(&self) -> Result<()> {
        if self.region.is_empty() {
            return Err(CacheError::config("storage.s3.region must not be empty"));
        }
        if self.multipart_chunk_size < 5 * 1024 * 1024 {
            return Err(CacheError::config(
                "storage.s3.multipart_chunk_size must be at least 5 MB (S3 minimum)",
            ));
        }
        if self.connect_timeout_ms == 0 || self.request_timeout_ms == 0 {
            return Err(CacheError::config(
                "storage.s3 timeouts must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Google Cloud Storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GcsConfig {
    /// Path to a service account key file; falls back to ambient credentials.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_account_path: Option<PathBuf>,
}

/// Connection settings for the reader/writer lock coordinator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Base URL, `ws://host:port` or `wss://host:port`.
    pub url: String,
    /// Accept any server certificate (wss only).
    pub skip_verify: bool,
    /// Extra CA certificate (PEM) trusted in addition to the web PKI roots.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<PathBuf>,
    /// Name to verify the server certificate against instead of the URL host.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
}

impl CoordinatorConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn is_tls(&self) -> bool {
        self.url.starts_with("wss://")
    }

    /// Validate coordinator configuration.
    pub fn validate(&self) -> Result<()> {
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(CacheError::config(format!(
                "coordinator.url must start with ws:// or wss://, got '{}'",
                self.url
            )));
        }
        if !self.is_tls() && (self.skip_verify || self.ca_file.is_some()) {
            return Err(CacheError::config(
                "coordinator TLS options require a wss:// url",
            ));
        }
        Ok(())
    }
}

// Keyed store (LMDB) tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyedStoreConfig {
    // Records per write transaction.
    pub write_frequency: u64,
    // Initial map size in bytes.
    pub initial_map_size: usize,
    // How many times the map may double before a build gives up.
    pub max_map_growths: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackendType::Local,
            storage_dir: PathBuf::from("./cache"),
            bucket: String::new(),
            bucket_prefix: String::new(),
            local_cache_dir: PathBuf::from("./local-cache"),
            s3: None,
            gcs: None,
        }
    }
}

impl Default for KeyedStoreConfig {
    fn default() -> Self {
        Self {
            write_frequency: 5000,
            initial_map_size: 1024 * 1024 * 1024, // 1 GiB
            max_map_growths: 16,
        }
    }
}

impl FromStr for CacheConfig {
    type Err = CacheError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| CacheError::config_with_source("failed to parse TOML config", e))
    }
}

impl CacheConfig {
    /// Configuration for a local-filesystem cache rooted at `storage_dir`.
    pub fn local(storage_dir: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.storage.storage_dir = storage_dir.into();
        config
    }

    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CacheError::storage_with_source(path, "failed to read config file", e)
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Environment variables are prefixed with `DSC_`. For example:
    // - `DSC_STORAGE_BACKEND` overrides `storage.backend` ("local", "s3", "gcs")
    // - `DSC_STORAGE_DIR` overrides `storage.storage_dir`
    // - `DSC_BUCKET` overrides `storage.bucket`
    // - `DSC_COORDINATOR_URL` overrides `coordinator.url`
    // - `DSC_S3_REGION` overrides `storage.s3.region`
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        // Storage overrides
        if let Ok(val) = std::env::var("DSC_STORAGE_BACKEND") {
            match val.to_lowercase().as_str() {
                "local" | "lfs" => self.storage.backend = StorageBackendType::Local,
                "s3" => self.storage.backend = StorageBackendType::S3,
                "gcs" => self.storage.backend = StorageBackendType::Gcs,
                _ => {} // ignore invalid values
            }
        }
        if let Ok(val) = std::env::var("DSC_STORAGE_DIR") {
            self.storage.storage_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("DSC_BUCKET") {
            self.storage.bucket = val;
        }
        if let Ok(val) = std::env::var("DSC_BUCKET_PREFIX") {
            self.storage.bucket_prefix = val;
        }
        if let Ok(val) = std::env::var("DSC_LOCAL_CACHE_DIR") {
            self.storage.local_cache_dir = PathBuf::from(val);
        }

        if self.storage.backend == StorageBackendType::S3 || self.storage.s3.is_some() {
            let s3_config = self.storage.s3.take().unwrap_or_default().with_env_overrides();
            self.storage.s3 = Some(s3_config);
        }
        if let Ok(val) = std::env::var("DSC_GCS_SERVICE_ACCOUNT_PATH") {
            let mut gcs = self.storage.gcs.take().unwrap_or_default();
            gcs.service_account_path = Some(PathBuf::from(val));
            self.storage.gcs = Some(gcs);
        }

        // Coordinator overrides - create CoordinatorConfig if the URL is set
        if let Ok(val) = std::env::var("DSC_COORDINATOR_URL") {
            let mut coordinator = self.coordinator.take().unwrap_or_default();
            coordinator.url = val;
            self.coordinator = Some(coordinator);
        }
        if let Some(coordinator) = self.coordinator.as_mut() {
            if let Ok(val) = std::env::var("DSC_COORDINATOR_SKIP_VERIFY") {
                if let Ok(v) = val.parse() {
                    coordinator.skip_verify = v;
                }
            }
            if let Ok(val) = std::env::var("DSC_COORDINATOR_CA_FILE") {
                coordinator.ca_file = Some(PathBuf::from(val));
            }
            if let Ok(val) = std::env::var("DSC_COORDINATOR_SERVER_NAME") {
                coordinator.server_name = Some(val);
            }
        }

        // Keyed store overrides
        if let Ok(val) = std::env::var("DSC_KEYED_STORE_WRITE_FREQUENCY") {
            if let Ok(v) = val.parse() {
                self.keyed_store.write_frequency = v;
            }
        }
        if let Ok(val) = std::env::var("DSC_KEYED_STORE_INITIAL_MAP_SIZE") {
            if let Ok(v) = val.parse() {
                self.keyed_store.initial_map_size = v;
            }
        }
        if let Ok(val) = std::env::var("DSC_KEYED_STORE_MAX_MAP_GROWTHS") {
            if let Ok(v) = val.parse() {
                self.keyed_store.max_map_growths = v;
            }
        }

        self
    }

    // Validate all configuration values.
    //
    // # Errors
    //
    // Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        match self.storage.backend {
            StorageBackendType::Local => {
                if self.storage.storage_dir.as_os_str().is_empty() {
                    return Err(CacheError::config(
                        "storage.storage_dir must not be empty",
                    ));
                }
            }
            StorageBackendType::S3 | StorageBackendType::Gcs => {
                if self.storage.bucket.is_empty() {
                    return Err(CacheError::config("storage.bucket must not be empty"));
                }
                if self.storage.local_cache_dir.as_os_str().is_empty() {
                    return Err(CacheError::config(
                        "storage.local_cache_dir must not be empty",
                    ));
                }
                if self.coordinator.is_none() {
                    return Err(CacheError::config(
                        "coordinator configuration is required for cloud backends",
                    ));
                }
            }
        }

        if let Some(s3) = &self.storage.s3 {
            s3.validate()?;
        }
        if let Some(coordinator) = &self.coordinator {
            coordinator.validate()?;
        }

        if self.keyed_store.write_frequency == 0 {
            return Err(CacheError::config(
                "keyed_store.write_frequency must be greater than 0",
            ));
        }
        if self.keyed_store.initial_map_size == 0 {
            return Err(CacheError::config(
                "keyed_store.initial_map_size must be greater than 0",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();

        assert_eq!(config.storage.backend, StorageBackendType::Local);
        assert_eq!(config.storage.storage_dir, PathBuf::from("./cache"));
        assert!(config.storage.bucket.is_empty());
        assert!(config.storage.s3.is_none());
        assert!(config.coordinator.is_none());

        assert_eq!(config.keyed_store.write_frequency, 5000);
        assert_eq!(config.keyed_store.initial_map_size, 1024 * 1024 * 1024);
        assert_eq!(config.keyed_store.max_map_growths, 16);
    }

    #[test]
    fn test_default_validates() {
        assert!(CacheConfig::default().validate().is_ok());
    }

    #[test]
    fn test_from_str_empty() {
        let config: CacheConfig = "".parse().unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_str_cloud() {
        let toml = r#"
            [storage]
            backend = "s3"
            bucket = "datasets"
            bucket_prefix = "team-a"
            local_cache_dir = "/var/cache/datasets"

            [storage.s3]
            region = "eu-west-1"
            endpoint = "http://localhost:9000"
            force_path_style = true
            allow_http = true

            [coordinator]
            url = "wss://coordinator:10245"
            ca_file = "/etc/ssl/coordinator.pem"
            server_name = "coordinator.internal"

            [keyed_store]
            write_frequency = 100
        "#;
        let config: CacheConfig = toml.parse().unwrap();

        assert_eq!(config.storage.backend, StorageBackendType::S3);
        assert!(config.storage.backend.is_cloud());
        assert_eq!(config.storage.bucket, "datasets");
        assert_eq!(config.storage.bucket_prefix, "team-a");
        let s3 = config.storage.s3.as_ref().unwrap();
        assert_eq!(s3.region, "eu-west-1");
        assert!(s3.force_path_style);

        let coordinator = config.coordinator.as_ref().unwrap();
        assert!(coordinator.is_tls());
        assert_eq!(coordinator.server_name.as_deref(), Some("coordinator.internal"));
        assert_eq!(config.keyed_store.write_frequency, 100);
        // Untouched fields keep defaults
        assert_eq!(config.keyed_store.max_map_growths, 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_str_invalid_toml() {
        let result: std::result::Result<CacheConfig, _> = "invalid = [".parse();
        assert!(result.is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [storage]
            storage_dir = "/tmp/datasets"
            "#
        )
        .unwrap();

        let config = CacheConfig::from_file(file.path()).unwrap();
        assert_eq!(config.storage.storage_dir, PathBuf::from("/tmp/datasets"));
    }

    #[test]
    fn test_from_file_not_found() {
        let result = CacheConfig::from_file("/nonexistent/config.toml");
        assert!(matches!(result, Err(CacheError::Storage { .. })));
    }

    #[test]
    fn test_cloud_requires_bucket_and_coordinator() {
        let mut config = CacheConfig::default();
        config.storage.backend = StorageBackendType::Gcs;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("bucket"));

        config.storage.bucket = "datasets".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("coordinator"));

        config.coordinator = Some(CoordinatorConfig::new("ws://localhost:10245"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_coordinator_url_scheme() {
        let config = CoordinatorConfig::new("http://localhost:10245");
        assert!(config.validate().is_err());

        let mut config = CoordinatorConfig::new("ws://localhost:10245");
        config.skip_verify = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_keyed_store() {
        let mut config = CacheConfig::default();
        config.keyed_store.write_frequency = 0;
        assert!(config.validate().is_err());

        let mut config = CacheConfig::default();
        config.keyed_store.initial_map_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_s3_config_validate_chunk_size_too_small() {
        let config = S3Config {
            multipart_chunk_size: 1024,
            ..Default::default()
        };
        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("5 MB"));
    }

    // Helper to clear all DSC_ environment variables for test isolation
    fn clear_dsc_env_vars() {
        for (key, _) in std::env::vars() {
            if key.starts_with("DSC_") {
                std::env::remove_var(&key);
            }
        }
    }

    // Environment variable tests are combined into a single test to avoid
    // race conditions when tests run in parallel, since env vars are global state.
    #[test]
    fn test_env_overrides() {
        clear_dsc_env_vars();

        std::env::set_var("DSC_STORAGE_BACKEND", "s3");
        std::env::set_var("DSC_BUCKET", "env-bucket");
        std::env::set_var("DSC_COORDINATOR_URL", "ws://env:10245");
        std::env::set_var("DSC_S3_REGION", "ap-south-1");
        std::env::set_var("DSC_KEYED_STORE_WRITE_FREQUENCY", "250");

        let config = CacheConfig::default().with_env_overrides();

        assert_eq!(config.storage.backend, StorageBackendType::S3);
        assert_eq!(config.storage.bucket, "env-bucket");
        assert_eq!(config.coordinator.as_ref().unwrap().url, "ws://env:10245");
        assert_eq!(config.storage.s3.as_ref().unwrap().region, "ap-south-1");
        assert_eq!(config.keyed_store.write_frequency, 250);

        clear_dsc_env_vars();

        // Invalid values are ignored
        std::env::set_var("DSC_STORAGE_BACKEND", "ftp");
        std::env::set_var("DSC_KEYED_STORE_MAX_MAP_GROWTHS", "many");

        let config = CacheConfig::default().with_env_overrides();
        assert_eq!(config.storage.backend, StorageBackendType::Local);
        assert_eq!(config.keyed_store.max_map_growths, 16);

        clear_dsc_env_vars();
    }

    #[test]
    fn test_serialize_roundtrip() {
        let mut original = CacheConfig::local("/data/cache");
        original.coordinator = Some(CoordinatorConfig::new("ws://localhost:1"));
        let toml_str = toml::to_string(&original).unwrap();
        let parsed: CacheConfig = toml_str.parse().unwrap();

        assert_eq!(original.storage.storage_dir, parsed.storage.storage_dir);
        assert_eq!(
            original.coordinator.unwrap().url,
            parsed.coordinator.unwrap().url
        );
    }
}
