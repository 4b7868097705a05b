//! TCP listener with optional TLS termination.
//!
//! The listener binds once per `serve` call. When the listen scheme terminates
//! TLS, every accepted socket is handshaken with the single certificate issued
//! at bind time before any forwarding logic reads from it.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::info;

use super::listen::ListenSpec;
use crate::error::ProxyError;

/// A bidirectional byte stream, plain or TLS.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Conn for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Boxed connection handed to the forwarding paths.
pub type BoxConn = Box<dyn Conn>;

/// Statistics for a proxy.
#[derive(Debug, Default)]
pub struct ProxyStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Total connections currently active.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Inbound TLS handshakes that failed.
    pub handshakes_failed: AtomicU64,
    /// Target resolutions that failed.
    pub resolve_failed: AtomicU64,
    /// Backend dials or upgrades that failed.
    pub backend_failed: AtomicU64,
    /// Bytes relayed to backends (raw mode).
    pub bytes_to_backend: AtomicU64,
    /// Bytes relayed from backends (raw mode).
    pub bytes_from_backend: AtomicU64,
}

impl ProxyStats {
    pub(crate) fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Bound acceptor, optionally wrapping accepted sockets in TLS.
pub struct ProxyListener {
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    local_addr: SocketAddr,
}

impl ProxyListener {
    /// Bind the listen address. `tls` is present for terminating schemes.
    pub async fn bind(
        spec: &ListenSpec,
        tls: Option<Arc<ServerConfig>>,
    ) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind((spec.host.as_str(), spec.port))
            .await
            .map_err(|source| ProxyError::Bind {
                addr: spec.bind_addr(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            scheme = %spec.scheme,
            tls = tls.is_some(),
            "Listener bound"
        );

        Ok(Self {
            listener,
            acceptor: tls.map(TlsAcceptor::from),
            local_addr,
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the next inbound socket.
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.listener.accept().await
    }

    /// Handshake for this connection: a clone of the TLS acceptor, if any.
    pub fn handshaker(&self) -> Handshaker {
        Handshaker {
            acceptor: self.acceptor.clone(),
        }
    }
}

/// Completes the inbound side of an accepted socket.
#[derive(Clone)]
pub struct Handshaker {
    acceptor: Option<TlsAcceptor>,
}

impl Handshaker {
    /// Terminate TLS if configured, otherwise pass the socket through.
    pub async fn complete(&self, stream: TcpStream) -> io::Result<BoxConn> {
        match &self.acceptor {
            Some(acceptor) => Ok(Box::new(acceptor.accept(stream).await?)),
            None => Ok(Box::new(stream)),
        }
    }
}
