// cache-core/src/lib.rs

//! Dataset Cache - Core Library
//!
//! This crate materializes record sequences into single-file keyed stores,
//! replays them with reproducible sharding and shuffling, keeps them on a
//! local filesystem or a cloud bucket, and coordinates concurrent builders
//! through a reader/writer lock server.

pub mod config;
pub mod error;
pub mod keyed;

// Re-export commonly used types for convenience
pub use config::CacheConfig;
pub use error::{CacheError, Result};

pub mod dataset;
pub use dataset::{DataRef, RecordSource, Stream, StreamOptions};

pub mod storage;
pub use storage::StorageBackend;

pub mod coordinator;
pub use coordinator::{CoordinatorServer, RwCoordinatorClient};

pub mod store;
pub use store::CacheStore;
