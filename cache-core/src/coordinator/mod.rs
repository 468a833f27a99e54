// cache-core/src/coordinator/mod.rs

//! Cross-process reader/writer locking over WebSockets.
//!
//! The lock server ([`CoordinatorServer`]) arbitrates named resources; the
//! blocking [`RwCoordinatorClient`] acquires a lock by opening a connection
//! and holds it for as long as the connection stays open. A client that
//! crashes or loses its network releases everything it held.
//!
//! ```no_run
//! use cache_core::config::CoordinatorConfig;
//! use cache_core::coordinator::{
//!     CoordinatorServer, LockResource, RwCoordinatorClient, ServerOptions,
//! };
//!
//! # fn example() -> cache_core::Result<()> {
//! let server = CoordinatorServer::bind("127.0.0.1:0", ServerOptions::default())?.spawn()?;
//! let client = RwCoordinatorClient::new(&CoordinatorConfig::new(server.url()))?;
//!
//! let resource = LockResource::new("s3", "my-bucket", "mnist/1.0/cache.mdb");
//! let hold = client.write_lock(&resource)?;
//! // Exclusive section
//! hold.release()?;
//! # Ok(())
//! # }
//! ```

mod client;
mod lock;
pub mod protocol;
mod server;
pub mod tls;

pub use client::{LockHold, LockStream, RwCoordinatorClient};
pub use lock::{LockState, ReadGuard, ResourceLock, WriteGuard};
pub use protocol::{LockMode, LockResource};
pub use server::{CoordinatorHandle, CoordinatorServer, ServerOptions};
