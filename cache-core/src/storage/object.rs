// cache-core/src/storage/object.rs

//! Cloud storage backend on top of the object_store crate.
//!
//! One type serves S3-compatible stores, Google Cloud Storage and the
//! in-memory store used in tests. Transient failures are retried with the
//! [`RetryPolicy`], each retry logged at warn level; anything else surfaces
//! as a `Transport` error.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use object_store::memory::InMemory;
use object_store::{MultipartUpload, ObjectStore, PutPayload};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::retry::{classify, is_transient, with_retries, Attempt, RetryPolicy};
use super::traits::StorageBackend;
use crate::config::S3Config;
#[cfg(feature = "gcs")]
use crate::config::GcsConfig;
use crate::error::{CacheError, Result};

const DEFAULT_MULTIPART_THRESHOLD: u64 = 100 * 1024 * 1024;
const DEFAULT_MULTIPART_CHUNK_SIZE: usize = 32 * 1024 * 1024;

/// Object store backed cache storage.
pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
    storage_type: &'static str,
    bucket: String,
    prefix: String,
    retry: RetryPolicy,
    multipart_threshold: u64,
    multipart_chunk_size: usize,
}

impl std::fmt::Debug for ObjectStoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreBackend")
            .field("storage_type", &self.storage_type)
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl ObjectStoreBackend {
    /// Wraps an already-built store.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        storage_type: &'static str,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            storage_type,
            bucket: bucket.into(),
            prefix: prefix.into(),
            retry: RetryPolicy::default(),
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
            multipart_chunk_size: DEFAULT_MULTIPART_CHUNK_SIZE,
        }
    }

    /// An in-process store, useful for tests and dry runs.
    pub fn in_memory(bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self::new(Arc::new(InMemory::new()), "memory", bucket, prefix)
    }

    /// Builds an S3-compatible backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be configured.
    #[cfg(feature = "s3")]
    pub fn s3(config: &S3Config, bucket: &str, prefix: &str) -> Result<Self> {
        let store = s3_builder(config, bucket)
            .build()
            .map_err(|e| CacheError::config_with_source("failed to build S3 client", e))?;

        Ok(Self::new(Arc::new(store), "s3", bucket, prefix).with_transfer_settings(config))
    }

    /// Builds a Google Cloud Storage backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the GCS client cannot be configured.
    #[cfg(feature = "gcs")]
    pub fn gcs(config: &GcsConfig, bucket: &str, prefix: &str) -> Result<Self> {
        use object_store::gcp::GoogleCloudStorageBuilder;

        let mut builder = GoogleCloudStorageBuilder::from_env()
            .with_bucket_name(bucket)
            .with_retry(no_inner_retries());
        if let Some(path) = &config.service_account_path {
            builder = builder.with_service_account_path(path.to_string_lossy());
        }

        let store = builder
            .build()
            .map_err(|e| CacheError::config_with_source("failed to build GCS client", e))?;

        Ok(Self::new(Arc::new(store), "gcs", bucket, prefix))
    }

    /// Applies retry and multipart settings.
    #[must_use]
    pub fn with_transfer_settings(mut self, config: &S3Config) -> Self {
        self.retry = RetryPolicy::from(config);
        self.multipart_threshold = config.multipart_threshold;
        self.multipart_chunk_size = config.multipart_chunk_size.max(1);
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_multipart(mut self, threshold: u64, chunk_size: usize) -> Self {
        self.multipart_threshold = threshold;
        self.multipart_chunk_size = chunk_size.max(1);
        self
    }

    fn resolve_path(&self, path: &Path) -> object_store::path::Path {
        let path_str = path.to_string_lossy();
        let relative = path_str.trim_start_matches('/');
        let prefix = self.prefix.trim_matches('/');
        if prefix.is_empty() {
            object_store::path::Path::from(relative)
        } else {
            object_store::path::Path::from(format!("{prefix}/{relative}"))
        }
    }

    /// Missing objects and unusable paths are storage errors; every other
    /// failure talking to the store is a transport error.
    fn convert_error(&self, path: &Path, message: &str, error: object_store::Error) -> CacheError {
        let url = format!("{}://{}/{}", self.storage_type, self.bucket, path.display());
        match error {
            object_store::Error::NotFound { .. }
            | object_store::Error::InvalidPath { .. }
            | object_store::Error::NotSupported { .. }
            | object_store::Error::NotImplemented => {
                CacheError::storage(PathBuf::from(url), format!("{message}: {error}"))
            }
            error => CacheError::transport_with_source(url, message, error),
        }
    }

    async fn put_single(&self, source: &Path, location: &object_store::path::Path) -> Result<()> {
        let data = fs::read(source)
            .await
            .map_err(|e| CacheError::storage_with_source(source, "failed to read upload source", e))?;
        let payload = PutPayload::from(data);

        with_retries(&self.retry, || {
            let store = Arc::clone(&self.store);
            let payload = payload.clone();
            async move {
                match store.put(location, payload).await {
                    Ok(_) => Attempt::Done(()),
                    Err(e) => classify(e),
                }
            }
        })
        .await
        .map_err(|e| self.convert_error(source, "failed to put object", e))
    }

    async fn put_multipart(&self, source: &Path, location: &object_store::path::Path) -> Result<()> {
        let mut upload = self
            .store
            .put_multipart(location)
            .await
            .map_err(|e| self.convert_error(source, "failed to initiate multipart upload", e))?;

        let mut file = File::open(source)
            .await
            .map_err(|e| CacheError::storage_with_source(source, "failed to open upload source", e))?;
        let mut parts = 0usize;
        loop {
            let mut chunk = Vec::with_capacity(self.multipart_chunk_size);
            let read = (&mut file)
                .take(self.multipart_chunk_size as u64)
                .read_to_end(&mut chunk)
                .await
                .map_err(|e| CacheError::storage_with_source(source, "failed to read upload source", e));
            let read = match read {
                Ok(read) => read,
                Err(e) => {
                    abort_upload(upload.as_mut(), source).await;
                    return Err(e);
                }
            };
            if read == 0 {
                break;
            }
            if let Err(e) = upload.put_part(PutPayload::from(chunk)).await {
                abort_upload(upload.as_mut(), source).await;
                return Err(self.convert_error(source, "failed to upload part", e));
            }
            parts += 1;
        }

        upload
            .complete()
            .await
            .map_err(|e| self.convert_error(source, "failed to complete multipart upload", e))?;
        tracing::debug!("Uploaded {} in {} parts", location, parts);
        Ok(())
    }
}

#[cfg(feature = "s3")]
fn client_options(config: &S3Config) -> object_store::ClientOptions {
    use std::time::Duration;

    object_store::ClientOptions::new()
        .with_allow_http(config.allow_http)
        .with_connect_timeout(Duration::from_millis(config.connect_timeout_ms))
        .with_timeout(Duration::from_millis(config.request_timeout_ms))
        .with_pool_max_idle_per_host(config.max_connections)
}

#[cfg(feature = "s3")]
fn s3_builder(config: &S3Config, bucket: &str) -> object_store::aws::AmazonS3Builder {
    let mut builder = object_store::aws::AmazonS3Builder::from_env()
        .with_bucket_name(bucket)
        .with_region(&config.region)
        .with_client_options(client_options(config))
        .with_retry(no_inner_retries());

    if let Some(endpoint) = &config.endpoint {
        builder = builder.with_endpoint(endpoint);
    }
    if let Some(access_key) = &config.access_key_id {
        builder = builder.with_access_key_id(access_key);
    }
    if let Some(secret_key) = &config.secret_access_key {
        builder = builder.with_secret_access_key(secret_key);
    }
    if let Some(token) = &config.session_token {
        builder = builder.with_token(token);
    }
    // object_store addresses buckets by path unless told otherwise.
    if !config.force_path_style && config.endpoint.is_none() {
        builder = builder.with_virtual_hosted_style_request(true);
    }
    builder
}

// Retries are driven by RetryPolicy so they can be observed and tuned in one place.
#[cfg(any(feature = "s3", feature = "gcs"))]
fn no_inner_retries() -> object_store::RetryConfig {
    object_store::RetryConfig {
        max_retries: 0,
        ..Default::default()
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    fn storage_type(&self) -> &'static str {
        self.storage_type
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn local_path(&self) -> Option<&Path> {
        None
    }

    async fn verify(&self) -> Result<()> {
        let prefix = self.resolve_path(Path::new(""));
        let prefix = (!prefix.to_string().is_empty()).then_some(prefix);
        with_retries(&self.retry, || {
            let store = Arc::clone(&self.store);
            let prefix = prefix.clone();
            async move {
                match store.list_with_delimiter(prefix.as_ref()).await {
                    Ok(_) => Attempt::Done(()),
                    Err(e) => classify(e),
                }
            }
        })
        .await
        .map_err(|e| {
            CacheError::config_with_source(format!("bucket `{}` is not accessible", self.bucket), e)
        })
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.remote_timestamp(path).await?.is_some())
    }

    async fn remote_timestamp(&self, path: &Path) -> Result<Option<DateTime<Utc>>> {
        let location = self.resolve_path(path);
        with_retries(&self.retry, || {
            let store = Arc::clone(&self.store);
            let location = location.clone();
            async move {
                match store.head(&location).await {
                    Ok(meta) => Attempt::Done(Some(meta.last_modified)),
                    Err(object_store::Error::NotFound { .. }) => Attempt::Done(None),
                    Err(e) => classify(e),
                }
            }
        })
        .await
        .map_err(|e| self.convert_error(path, "failed to read object metadata", e))
    }

    async fn download(&self, path: &Path, destination: &Path) -> Result<()> {
        let location = self.resolve_path(path);
        let parent = destination.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).await.map_err(|e| {
            CacheError::storage_with_source(parent, "failed to create parent directories", e)
        })?;
        let staging = super::staging_path(destination);

        let result = with_retries(&self.retry, || {
            let store = Arc::clone(&self.store);
            let location = location.clone();
            let staging = staging.clone();
            async move { stream_to_file(store.as_ref(), &location, &staging).await }
        })
        .await;

        match result {
            Ok(bytes) => {
                fs::rename(&staging, destination).await.map_err(|e| {
                    CacheError::storage_with_source(destination, "failed to move download into place", e)
                })?;
                tracing::info!("Downloaded {} ({} bytes) to {}", location, bytes, destination.display());
                Ok(())
            }
            Err(e) => {
                if let Err(cleanup) = fs::remove_file(&staging).await {
                    super::log_cleanup_failure(&staging, &cleanup);
                }
                Err(e.into_cache_error(self, path))
            }
        }
    }

    async fn upload(&self, source: &Path, path: &Path) -> Result<()> {
        let location = self.resolve_path(path);
        let size = fs::metadata(source)
            .await
            .map_err(|e| CacheError::storage_with_source(source, "failed to stat upload source", e))?
            .len();

        if size >= self.multipart_threshold {
            self.put_multipart(source, &location).await?;
        } else {
            self.put_single(source, &location).await?;
        }
        tracing::info!("Uploaded {} ({} bytes) to {}", source.display(), size, location);
        Ok(())
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        let location = self.resolve_path(path);
        with_retries(&self.retry, || {
            let store = Arc::clone(&self.store);
            let location = location.clone();
            async move {
                match store.delete(&location).await {
                    Ok(()) | Err(object_store::Error::NotFound { .. }) => Attempt::Done(()),
                    Err(e) => classify(e),
                }
            }
        })
        .await
        .map_err(|e| self.convert_error(path, "failed to delete object", e))
    }
}

async fn abort_upload(upload: &mut dyn MultipartUpload, source: &Path) {
    if let Err(e) = upload.abort().await {
        tracing::warn!("Failed to abort multipart upload of {}: {}", source.display(), e);
    }
}

enum DownloadError {
    Remote(object_store::Error),
    Local(PathBuf, std::io::Error),
}

impl std::fmt::Display for DownloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote(e) => write!(f, "{e}"),
            Self::Local(path, e) => write!(f, "{}: {e}", path.display()),
        }
    }
}

impl DownloadError {
    fn into_cache_error(self, backend: &ObjectStoreBackend, path: &Path) -> CacheError {
        match self {
            Self::Remote(e) => backend.convert_error(path, "failed to download object", e),
            Self::Local(local, e) => {
                CacheError::storage_with_source(local, "failed to write download", e)
            }
        }
    }
}

async fn stream_to_file(
    store: &dyn ObjectStore,
    location: &object_store::path::Path,
    staging: &Path,
) -> Attempt<u64, DownloadError> {
    let remote = |e: object_store::Error| {
        if is_transient(&e) {
            Attempt::Transient(DownloadError::Remote(e))
        } else {
            Attempt::Fatal(DownloadError::Remote(e))
        }
    };
    let local = |e: std::io::Error| Attempt::Fatal(DownloadError::Local(staging.to_path_buf(), e));

    let result = match store.get(location).await {
        Ok(result) => result,
        Err(e) => return remote(e),
    };
    let mut file = match File::create(staging).await {
        Ok(file) => file,
        Err(e) => return local(e),
    };

    let mut written = 0u64;
    let mut chunks = result.into_stream();
    while let Some(chunk) = chunks.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => return remote(e),
        };
        if let Err(e) = file.write_all(&chunk).await {
            return local(e);
        }
        written += chunk.len() as u64;
    }
    if let Err(e) = file.sync_all().await {
        return local(e);
    }
    Attempt::Done(written)
}
