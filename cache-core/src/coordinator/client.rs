// cache-core/src/coordinator/client.rs

//! Blocking client for the lock server.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, StreamOwned};
use tungstenite::client::IntoClientRequest;
use tungstenite::error::ProtocolError;
use tungstenite::{Message, WebSocket};

use super::protocol::{LockMode, LockResource};
use super::tls;
use crate::config::CoordinatorConfig;
use crate::error::{CacheError, Result};

/// Byte stream under a lock connection.
pub enum LockStream {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Read for LockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.read(buf),
            Self::Tls(stream) => stream.read(buf),
        }
    }
}

impl Write for LockStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.write(buf),
            Self::Tls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(stream) => stream.flush(),
            Self::Tls(stream) => stream.flush(),
        }
    }
}

/// Client side of the reader/writer lock protocol.
///
/// Every acquisition opens its own connection; the returned [`LockHold`]
/// keeps it open until dropped or released.
#[derive(Clone)]
pub struct RwCoordinatorClient {
    url: String,
    tls: Option<Arc<ClientConfig>>,
    server_name: Option<String>,
}

impl std::fmt::Debug for RwCoordinatorClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RwCoordinatorClient")
            .field("url", &self.url)
            .field("tls", &self.tls.is_some())
            .field("server_name", &self.server_name)
            .finish()
    }
}

impl RwCoordinatorClient {
    /// Creates a client. No connection is made until a lock is requested.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the URL or TLS settings are invalid.
    pub fn new(config: &CoordinatorConfig) -> Result<Self> {
        config.validate()?;
        let tls = if config.is_tls() {
            Some(Arc::new(tls::client_config(config)?))
        } else {
            None
        };

        Ok(Self {
            url: config.url.trim_end_matches('/').to_string(),
            tls,
            server_name: config.server_name.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Blocks until a shared lock on `resource` is granted.
    pub fn read_lock(&self, resource: &LockResource) -> Result<LockHold> {
        self.acquire(resource, LockMode::Read)
    }

    /// Blocks until an exclusive lock on `resource` is granted.
    pub fn write_lock(&self, resource: &LockResource) -> Result<LockHold> {
        self.acquire(resource, LockMode::Write)
    }

    /// Opens the WebSocket for `resource` without waiting for the grant.
    pub fn connect(&self, resource: &LockResource, mode: LockMode) -> Result<WebSocket<LockStream>> {
        let target = format!("{}{}", self.url, resource.request_target(mode));
        let request = target
            .as_str()
            .into_client_request()
            .map_err(|e| CacheError::transport_with_source(&target, "invalid coordinator request", e))?;

        let uri = request.uri();
        let host = uri
            .host()
            .ok_or_else(|| CacheError::transport(&target, "coordinator url has no host"))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let default_port = if self.tls.is_some() { 443 } else { 80 };
        let port = uri.port_u16().unwrap_or(default_port);

        let tcp = TcpStream::connect((host.as_str(), port))
            .map_err(|e| CacheError::transport_with_source(&target, "failed to connect to coordinator", e))?;
        let _ = tcp.set_nodelay(true);

        let stream = match &self.tls {
            Some(config) => {
                let name = self.server_name.clone().unwrap_or_else(|| host.clone());
                let server_name = ServerName::try_from(name)
                    .map_err(|e| CacheError::transport_with_source(&target, "invalid TLS server name", e))?;
                let connection = ClientConnection::new(Arc::clone(config), server_name)
                    .map_err(|e| CacheError::transport_with_source(&target, "failed to start TLS", e))?;
                LockStream::Tls(Box::new(StreamOwned::new(connection, tcp)))
            }
            None => LockStream::Plain(tcp),
        };

        let (socket, _response) = tungstenite::client(request, stream)
            .map_err(|e| CacheError::transport(&target, format!("handshake failed: {e}")))?;
        Ok(socket)
    }

    fn acquire(&self, resource: &LockResource, mode: LockMode) -> Result<LockHold> {
        let mut socket = self.connect(resource, mode)?;
        let denied = |message: String| CacheError::lock_not_granted(resource.to_string(), message);

        loop {
            match socket.read() {
                Ok(Message::Text(token)) if token == mode.grant_token() => break,
                Ok(Message::Text(token)) => {
                    return Err(denied(format!("unexpected reply `{token}`")));
                }
                Ok(Message::Close(_)) => {
                    return Err(denied("coordinator closed the connection".to_string()));
                }
                Ok(_) => {}
                Err(e) => return Err(denied(format!("connection lost while waiting: {e}"))),
            }
        }
        tracing::debug!("Acquired {} lock on {}", mode, resource);

        Ok(LockHold {
            socket: Some(socket),
            resource: resource.clone(),
            mode,
        })
    }
}

/// A granted lock. Dropping it closes the connection, which releases the
/// lock on the server.
pub struct LockHold {
    socket: Option<WebSocket<LockStream>>,
    resource: LockResource,
    mode: LockMode,
}

impl LockHold {
    pub fn resource(&self) -> &LockResource {
        &self.resource
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Closes the connection and waits until the server has acknowledged
    /// the close, so the release is visible to other clients on return.
    pub fn release(mut self) -> Result<()> {
        let Some(mut socket) = self.socket.take() else {
            return Ok(());
        };
        let endpoint = self.resource.to_string();
        socket
            .close(None)
            .map_err(|e| CacheError::transport(&endpoint, format!("failed to close lock connection: {e}")))?;
        loop {
            match socket.read() {
                Ok(_) => {}
                Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => break,
                Err(tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake)) => break,
                Err(tungstenite::Error::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => {
                    return Err(CacheError::transport(&endpoint, format!("failed to close lock connection: {e}")));
                }
            }
        }
        tracing::debug!("Released {} lock on {}", self.mode, self.resource);
        Ok(())
    }
}

impl std::fmt::Debug for LockHold {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHold")
            .field("resource", &self.resource)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl Drop for LockHold {
    fn drop(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            let _ = socket.close(None);
            let _ = socket.flush();
        }
    }
}
