// cache-core/src/coordinator/server.rs

//! WebSocket lock server.
//!
//! Each connection holds at most one lock on one resource. The lock is
//! requested on upgrade, granted with a single text frame, and released as
//! soon as the connection ends, cleanly or not. A resource's lock state is
//! dropped once no connection holds or waits for it.

use std::future::Future;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use dashmap::DashMap;
use futures::stream::{SplitStream, StreamExt};
use futures::SinkExt;
use tokio::sync::oneshot;

use super::lock::{ReadGuard, ResourceLock, WriteGuard};
use super::protocol::{resource_key, LockMode, READ_LOCK_PARAM};
use crate::error::{CacheError, Result};

/// Time granted to in-flight responses when stopping via `/shutdown`.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Options for [`CoordinatorServer::bind`].
#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    /// Serve `wss://` with this configuration instead of plain `ws://`.
    pub tls: Option<Arc<rustls::ServerConfig>>,
    /// Expose `POST /shutdown`, which stops the server.
    pub enable_shutdown_endpoint: bool,
}

#[derive(Clone)]
struct ServerState {
    locks: Arc<DashMap<String, Arc<ResourceLock>>>,
    handle: Handle,
}

impl ServerState {
    // Locks are created on first use.
    fn lock_for(&self, key: &str) -> Arc<ResourceLock> {
        if let Some(lock) = self.locks.get(key) {
            return Arc::clone(lock.value());
        }
        Arc::clone(self.locks.entry(key.to_string()).or_default().value())
    }

    /// Removes the lock for `key` if only the map still references it.
    /// Callers drop their own `Arc` first.
    fn forget_if_idle(&self, key: &str) {
        if self.locks.remove_if(key, |_, lock| Arc::strong_count(lock) == 1).is_some() {
            tracing::trace!("Forgot idle lock on {}", key);
        }
    }
}

/// A bound, not yet running lock server.
pub struct CoordinatorServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    options: ServerOptions,
    locks: Arc<DashMap<String, Arc<ResourceLock>>>,
}

impl CoordinatorServer {
    /// Binds the listening socket. Port 0 picks a free port.
    ///
    /// # Errors
    ///
    /// Returns `Transport` if the address cannot be bound.
    pub fn bind(addr: impl ToSocketAddrs, options: ServerOptions) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .map_err(|e| CacheError::transport_with_source("coordinator", "failed to bind", e))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| CacheError::transport_with_source("coordinator", "failed to configure listener", e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| CacheError::transport_with_source("coordinator", "failed to read local address", e))?;

        Ok(Self {
            listener,
            local_addr,
            options,
            locks: Arc::new(DashMap::new()),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `ws://` or `wss://` base URL clients should connect to.
    pub fn url(&self) -> String {
        let scheme = if self.options.tls.is_some() { "wss" } else { "ws" };
        format!("{scheme}://{}", self.local_addr)
    }

    /// Serves until `shutdown` resolves, `/shutdown` is called, or the
    /// listener fails.
    pub async fn serve(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        let handle = Handle::new();
        let state = ServerState {
            locks: Arc::clone(&self.locks),
            handle: handle.clone(),
        };

        let mut router = Router::new().route("/*resource", get(lock_handler));
        if self.options.enable_shutdown_endpoint {
            router = router.route("/shutdown", post(shutdown_handler).get(shutdown_handler));
        }
        let app = router.with_state(state).into_make_service();

        let watcher = handle.clone();
        tokio::spawn(async move {
            shutdown.await;
            watcher.shutdown();
        });

        let endpoint = self.url();
        tracing::info!("RW coordinator listening on {}", endpoint);

        let served = match self.options.tls {
            Some(tls) => {
                axum_server::from_tcp_rustls(self.listener, RustlsConfig::from_config(tls))
                    .handle(handle)
                    .serve(app)
                    .await
            }
            None => axum_server::from_tcp(self.listener).handle(handle).serve(app).await,
        };
        served.map_err(|e| CacheError::transport_with_source(&endpoint, "coordinator server failed", e))?;

        tracing::info!("RW coordinator on {} stopped", endpoint);
        Ok(())
    }

    /// Runs the server on a dedicated thread with its own single-threaded
    /// runtime.
    pub fn spawn(self) -> Result<CoordinatorHandle> {
        let local_addr = self.local_addr;
        let url = self.url();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| CacheError::transport_with_source(&url, "failed to build runtime", e))?;

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let thread = std::thread::Builder::new()
            .name("rw-coordinator".to_string())
            .spawn(move || {
                runtime.block_on(self.serve(async move {
                    let _ = stop_rx.await;
                }))
            })
            .map_err(|e| CacheError::transport_with_source(&url, "failed to spawn server thread", e))?;

        Ok(CoordinatorHandle {
            local_addr,
            url,
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }
}

/// A running coordinator. Dropping the handle stops the server.
pub struct CoordinatorHandle {
    local_addr: SocketAddr,
    url: String,
    stop: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<Result<()>>>,
}

impl CoordinatorHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Stops the server, dropping every held lock, and waits for the thread.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| CacheError::transport(&self.url, "coordinator thread panicked"))?,
            None => Ok(()),
        }
    }
}

impl Drop for CoordinatorHandle {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!("Coordinator shutdown failed: {}", e);
        }
    }
}

async fn lock_handler(State(state): State<ServerState>, uri: Uri, ws: WebSocketUpgrade) -> Response {
    let Some(mode) = LockMode::from_query(uri.query()) else {
        let message = format!("missing or invalid `{READ_LOCK_PARAM}` query parameter");
        return (StatusCode::BAD_REQUEST, message).into_response();
    };
    let resource = resource_key(uri.path()).to_string();

    ws.on_upgrade(move |socket| async move {
        let lock = state.lock_for(&resource);
        hold_lock(socket, &lock, mode, &resource).await;
        drop(lock);
        state.forget_if_idle(&resource);
    })
}

async fn shutdown_handler(State(state): State<ServerState>) -> &'static str {
    tracing::info!("Shutdown requested over HTTP");
    state.handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
    "shutting down"
}

// Kept alive for the lifetime of the connection.
enum Held {
    Read { _guard: ReadGuard },
    Write { _guard: WriteGuard },
}

async fn acquire(lock: &Arc<ResourceLock>, mode: LockMode) -> Held {
    match mode {
        LockMode::Read => Held::Read {
            _guard: lock.read().await,
        },
        LockMode::Write => Held::Write {
            _guard: lock.write().await,
        },
    }
}

/// Resolves once the peer closes the connection or it breaks.
async fn closed(receiver: &mut SplitStream<WebSocket>) {
    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Close(_)) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

async fn hold_lock(socket: WebSocket, lock: &Arc<ResourceLock>, mode: LockMode, resource: &str) {
    let (mut sender, mut receiver) = socket.split();

    let held = tokio::select! {
        held = acquire(lock, mode) => held,
        _ = closed(&mut receiver) => {
            tracing::debug!("Client left while waiting for {} lock on {}", mode, resource);
            return;
        }
    };
    tracing::debug!("Granted {} lock on {}", mode, resource);

    if sender.send(Message::Text(mode.grant_token().into())).await.is_err() {
        tracing::debug!("Client left before {} grant on {} was delivered", mode, resource);
        return;
    }

    closed(&mut receiver).await;
    drop(held);
    tracing::debug!("Released {} lock on {}", mode, resource);

    // Flushes the reply to the client's close frame.
    let _ = sender.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_ephemeral_port() {
        let server = CoordinatorServer::bind("127.0.0.1:0", ServerOptions::default()).unwrap();
        assert_ne!(server.local_addr().port(), 0);
        assert!(server.url().starts_with("ws://127.0.0.1:"));
    }

    #[test]
    fn test_lock_for_reuses_resource() {
        let state = ServerState {
            locks: Arc::new(DashMap::new()),
            handle: Handle::new(),
        };
        let first = state.lock_for("s3/b/ds/1/cache.mdb");
        let second = state.lock_for("s3/b/ds/1/cache.mdb");
        let other = state.lock_for("s3/b/ds/2/cache.mdb");
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[tokio::test]
    async fn test_idle_locks_are_forgotten() {
        let state = ServerState {
            locks: Arc::new(DashMap::new()),
            handle: Handle::new(),
        };
        let key = "s3/b/ds/1/cache.mdb";

        let lock = state.lock_for(key);
        let guard = lock.write().await;
        drop(lock);
        state.forget_if_idle(key);
        assert!(state.locks.contains_key(key));

        let waiter = state.lock_for(key);
        drop(guard);
        state.forget_if_idle(key);
        assert!(state.locks.contains_key(key));

        drop(waiter);
        state.forget_if_idle(key);
        assert!(state.locks.is_empty());
    }

    #[test]
    fn test_spawn_and_stop() {
        let handle = CoordinatorServer::bind("127.0.0.1:0", ServerOptions::default())
            .unwrap()
            .spawn()
            .unwrap();
        let addr = handle.local_addr();
        handle.stop().unwrap();
        assert!(std::net::TcpStream::connect(addr).is_err());
    }
}
