// cache-core/src/dataset/mod.rs

//! Dataset replay: sharding, shuffling and restartable streams.
//!
//! Records are produced once through a [`RecordSource`], materialized in a
//! keyed store, and read back through a [`DataRef`]. Every stream visits the
//! key list of its shard in an order fixed by its [`StreamOptions`].
//!
//! # Example
//!
//! ```ignore
//! use cache_core::dataset::StreamOptions;
//!
//! let dataref = store.fetch("mnist", "1.0")?;
//! let mut stream = dataref.stream(&StreamOptions {
//!     shuffle: true,
//!     shuffle_seed: Some(7),
//!     shard_rank: 0,
//!     num_shards: 4,
//!     ..Default::default()
//! })?;
//!
//! for epoch in 0..3 {
//!     for record in stream.iter() {
//!         let bytes = record?;
//!         // Hand bytes to the consumer
//!     }
//! }
//! ```

mod keys;
mod replay;
mod source;
mod stream;

pub use keys::{shard_keys, shuffle_keys, ShardOptions};
pub use replay::{EpochPass, ReplayGenerator, ReplayOptions};
pub use source::{decode_record, encode_record, RecordSource};
pub use stream::{DataRef, Stream, StreamOptions, StreamPass};
