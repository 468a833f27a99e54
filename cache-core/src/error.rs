// cache-core/src/error.rs

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {

    #[error("Storage error at '{path}': {message}")]
    Storage {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("No cache found for dataset '{dataset_id}' version '{dataset_version}'")]
    NotFound {
        dataset_id: String,
        dataset_version: String,
    },

    #[error("Keyed store already exists at '{path}'")]
    AlreadyExists {
        path: PathBuf,
    },

    #[error("Key '{key}' not found in keyed store '{path}'")]
    KeyNotFound {
        key: String,
        path: PathBuf,
    },

    #[error("Cannot shard {num_keys} keys into {num_shards} shards with drop_remainder")]
    InsufficientKeys {
        num_keys: usize,
        num_shards: usize,
    },

    #[error("Invalid configuration: {message}")]
    InvalidConfiguration {
        message: String,
    },

    #[error("Shard {shard_index} out of range (total shards: {num_shards})")]
    InvalidShard {
        shard_index: usize,
        num_shards: usize,
    },

    #[error("Keyed store error at '{path}': {message}")]
    KeyedStore {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<heed::Error>,
    },

    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
    },

    #[error("Transport error talking to '{endpoint}': {message}")]
    Transport {
        endpoint: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Lock on '{resource}' was not granted: {message}")]
    LockNotGranted {
        resource: String,
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, CacheError>;

// Convenience constructors
impl CacheError {

    pub fn storage(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn storage_with_source(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn not_found(dataset_id: impl Into<String>, dataset_version: impl Into<String>) -> Self {
        Self::NotFound {
            dataset_id: dataset_id.into(),
            dataset_version: dataset_version.into(),
        }
    }

    pub fn already_exists(path: impl Into<PathBuf>) -> Self {
        Self::AlreadyExists { path: path.into() }
    }

    pub fn key_not_found(key: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::KeyNotFound {
            key: key.into(),
            path: path.into(),
        }
    }

    pub fn insufficient_keys(num_keys: usize, num_shards: usize) -> Self {
        Self::InsufficientKeys { num_keys, num_shards }
    }

    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            message: message.into(),
        }
    }

    pub fn invalid_shard(shard_index: usize, num_shards: usize) -> Self {
        Self::InvalidShard { shard_index, num_shards }
    }

    pub fn keyed_store(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::KeyedStore {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn keyed_store_with_source(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: heed::Error,
    ) -> Self {
        Self::KeyedStore {
            path: path.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    pub fn transport(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            endpoint: endpoint.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn transport_with_source(
        endpoint: impl Into<String>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            endpoint: endpoint.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn lock_not_granted(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::LockNotGranted {
            resource: resource.into(),
            message: message.into(),
        }
    }
}
