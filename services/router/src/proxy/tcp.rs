//! Raw TCP/TLS relay path.
//!
//! One target resolution per accepted connection. Resolution, dial and
//! upgrade failures drop the inbound connection without forwarding a byte.

use std::io;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Url;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use super::listen::target_host_port;
use super::listener::BoxConn;
use super::pipe::pipe;
use super::server::{Proxy, ProxyOptions};
use super::tls::backend_server_name;
use crate::error::ProxyError;

/// Connection-level relay for `tcp` and `tls` listeners.
pub(crate) struct TcpRelay {
    connector: TlsConnector,
    connect_timeout: Option<Duration>,
    idle_timeout: Option<Duration>,
}

impl TcpRelay {
    pub(crate) fn new(options: &ProxyOptions) -> Result<Self, ProxyError> {
        Ok(Self {
            connector: TlsConnector::from(options.backend_tls.client_config()?),
            connect_timeout: options.connect_timeout,
            idle_timeout: options.idle_timeout,
        })
    }

    /// Handle a single connection.
    pub(crate) async fn handle(&self, proxy: &Proxy, inbound: BoxConn) -> Result<()> {
        let stats = proxy.stats_handle();

        let target = match proxy.resolver().resolve().await {
            Ok(target) => target,
            Err(e) => {
                stats.resolve_failed.fetch_add(1, Ordering::Relaxed);
                return Err(e.context("resolve target"));
            }
        };

        let backend = match self.dial(&target).await {
            Ok(backend) => backend,
            Err(e) => {
                stats.backend_failed.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        debug!(target = %target, "Connected to backend");

        proxy.notify_observer(&target);

        let (bytes_to_backend, bytes_from_backend) = pipe(inbound, backend, self.idle_timeout)
            .await
            .context("relay")?;

        stats
            .bytes_to_backend
            .fetch_add(bytes_to_backend, Ordering::Relaxed);
        stats
            .bytes_from_backend
            .fetch_add(bytes_from_backend, Ordering::Relaxed);

        debug!(
            bytes_to_backend = bytes_to_backend,
            bytes_from_backend = bytes_from_backend,
            "Connection closed"
        );

        Ok(())
    }

    /// Dial the target, upgrading to TLS for `tls://` targets.
    async fn dial(&self, target: &Url) -> Result<BoxConn> {
        let (host, port) = target_host_port(target)?;

        let connect = TcpStream::connect((host.as_str(), port));
        let stream = match self.connect_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, connect).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
            },
            None => connect.await,
        }
        .with_context(|| format!("dial {target}"))?;

        if target.scheme() != "tls" {
            return Ok(Box::new(stream));
        }

        let server_name = backend_server_name(&host)?;
        let tls = self
            .connector
            .connect(server_name, stream)
            .await
            .with_context(|| format!("tls handshake with {target}"))?;
        Ok(Box::new(tls))
    }
}
