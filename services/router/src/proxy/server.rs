//! Proxy lifecycle: bind, accept, dispatch, shutdown.
//!
//! State machine: `Unbound -> Bound -> Stopped`. Binding happens once inside
//! [`Proxy::serve`]; a failed setup goes straight to `Stopped`. The proxy is
//! not restartable.
//!
//! Two shutdown primitives exist:
//! - [`Proxy::close`] marks the proxy closed before closing the listener, so
//!   `serve` returns `Ok(())`.
//! - [`Proxy::terminate`] closes the listener only, so `serve` surfaces
//!   [`ProxyError::ListenerClosed`].
//!
//! Neither cancels in-flight connections; they run until a peer disconnects.

use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn, Instrument};

use super::http::HttpForwarder;
use super::listen::{ForwardingMode, ListenSpec};
use super::listener::{BoxConn, ProxyListener, ProxyStats};
use super::target::{RequestObserver, TargetResolver};
use super::tcp::TcpRelay;
use super::tls::{self, BackendTls, CertificateIssuer};
use crate::error::ProxyError;

/// How the HTTP path answers with the backend response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseHead {
    /// Forward backend status and end-to-end headers along with the body.
    #[default]
    Passthrough,
    /// Forward the body only; status is always 200 and backend headers are
    /// dropped.
    BodyOnly,
}

/// Tunables for a proxy. Defaults block forever, like a bare socket.
#[derive(Debug, Clone, Default)]
pub struct ProxyOptions {
    /// Timeout for dialing backends (both modes). `None` waits indefinitely.
    pub connect_timeout: Option<Duration>,
    /// Per-read idle timeout for raw relays. `None` waits indefinitely.
    pub idle_timeout: Option<Duration>,
    /// Authentication policy for `tls://` targets.
    pub backend_tls: BackendTls,
    /// Response head handling in HTTP mode.
    pub response_head: ResponseHead,
}

/// Serving state of a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeState {
    /// `serve` has not bound a listener yet.
    Unbound,
    /// Listener bound and accepting.
    Bound(SocketAddr),
    /// Serving finished, or setup failed.
    Stopped,
}

/// Per-serve forwarding path, selected by the listen scheme.
#[derive(Clone)]
enum Dispatch {
    Http(Arc<HttpForwarder>),
    Relay(Arc<TcpRelay>),
}

/// A single listen address forwarding to dynamically resolved backends.
pub struct Proxy {
    hostname: String,
    listen: Url,
    resolver: Arc<dyn TargetResolver>,
    observer: Option<Arc<dyn RequestObserver>>,
    issuer: Arc<dyn CertificateIssuer>,
    options: ProxyOptions,
    started: AtomicBool,
    closed: AtomicBool,
    shutdown_requested: AtomicBool,
    shutdown: Notify,
    state: watch::Sender<ServeState>,
    stats: Arc<ProxyStats>,
}

impl Proxy {
    /// Create a proxy. Nothing is bound until [`Proxy::serve`].
    pub fn new(
        hostname: impl Into<String>,
        listen: Url,
        resolver: Arc<dyn TargetResolver>,
        issuer: Arc<dyn CertificateIssuer>,
    ) -> Self {
        let (state, _) = watch::channel(ServeState::Unbound);
        Self {
            hostname: hostname.into(),
            listen,
            resolver,
            observer: None,
            issuer,
            options: ProxyOptions::default(),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
            shutdown: Notify::new(),
            state,
            stats: Arc::new(ProxyStats::default()),
        }
    }

    /// Attach an observer for raw connections.
    pub fn with_observer(mut self, observer: Arc<dyn RequestObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Replace the default options.
    pub fn with_options(mut self, options: ProxyOptions) -> Self {
        self.options = options;
        self
    }

    /// Hostname used for certificate issuance.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Listen URL as configured.
    pub fn listen(&self) -> &Url {
        &self.listen
    }

    pub fn options(&self) -> &ProxyOptions {
        &self.options
    }

    /// Get proxy statistics.
    pub fn stats(&self) -> &ProxyStats {
        &self.stats
    }

    /// Current serving state.
    pub fn state(&self) -> ServeState {
        *self.state.borrow()
    }

    /// Bound address, once the listener exists.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.state() {
            ServeState::Bound(addr) => Some(addr),
            _ => None,
        }
    }

    /// Wait until `serve` has bound its listener.
    ///
    /// Fails with [`ProxyError::NotServing`] if setup failed or serving has
    /// already stopped.
    pub async fn wait_bound(&self) -> Result<SocketAddr, ProxyError> {
        let mut rx = self.state.subscribe();
        let state = *rx
            .wait_for(|s| *s != ServeState::Unbound)
            .await
            .map_err(|_| ProxyError::NotServing)?;
        match state {
            ServeState::Bound(addr) => Ok(addr),
            _ => Err(ProxyError::NotServing),
        }
    }

    pub(crate) fn resolver(&self) -> &dyn TargetResolver {
        self.resolver.as_ref()
    }

    pub(crate) fn stats_handle(&self) -> &Arc<ProxyStats> {
        &self.stats
    }

    /// Run the observer, if any. A panicking observer is logged and ignored.
    pub(crate) fn notify_observer(&self, target: &Url) {
        let Some(observer) = &self.observer else {
            return;
        };
        if catch_unwind(AssertUnwindSafe(|| observer.observe(self, target))).is_err() {
            warn!(target = %target, "Request observer panicked");
        }
    }

    /// Bind the listener and serve until shutdown or a fatal accept error.
    pub async fn serve(self: Arc<Self>) -> Result<(), ProxyError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ProxyError::AlreadyStarted);
        }

        let result = match self.setup().await {
            Ok((listener, dispatch)) => {
                self.state
                    .send_replace(ServeState::Bound(listener.local_addr()));
                self.accept_loop(listener, dispatch).await
            }
            Err(e) => {
                error!(
                    hostname = %self.hostname,
                    listen = %self.listen,
                    reason = e.reason_code(),
                    error = %e,
                    "Proxy setup failed"
                );
                Err(e)
            }
        };

        self.state.send_replace(ServeState::Stopped);
        result
    }

    async fn setup(&self) -> Result<(ProxyListener, Dispatch), ProxyError> {
        let spec = ListenSpec::from_url(&self.listen)?;

        let server_tls = if spec.scheme.terminates_tls() {
            let cert = self.issuer.issue(&self.hostname).await.map_err(|e| {
                ProxyError::Certificate {
                    hostname: self.hostname.clone(),
                    detail: format!("{e:#}"),
                }
            })?;
            Some(tls::server_config(cert)?)
        } else {
            None
        };

        let listener = ProxyListener::bind(&spec, server_tls).await?;

        let dispatch = match spec.scheme.mode() {
            ForwardingMode::Http => {
                // Port 0 binds advertise the port clients can actually reach.
                let advertised_port = match spec.port {
                    0 => listener.local_addr().port(),
                    port => port,
                };
                Dispatch::Http(Arc::new(HttpForwarder::new(
                    &self.options,
                    spec.scheme,
                    advertised_port,
                )?))
            }
            ForwardingMode::Relay => Dispatch::Relay(Arc::new(TcpRelay::new(&self.options)?)),
        };

        info!(
            hostname = %self.hostname,
            listen = %self.listen,
            bind_addr = %listener.local_addr(),
            "Proxy serving"
        );

        Ok((listener, dispatch))
    }

    async fn accept_loop(
        self: &Arc<Self>,
        listener: ProxyListener,
        dispatch: Dispatch,
    ) -> Result<(), ProxyError> {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.shutdown.notified() => None,
                accepted = listener.accept() => Some(accepted),
            };

            match accepted {
                Some(Ok((stream, peer_addr))) => {
                    self.stats.connection_opened();

                    let proxy = Arc::clone(self);
                    let handshaker = listener.handshaker();
                    let dispatch = dispatch.clone();

                    tokio::spawn(
                        async move {
                            let result = match handshaker.complete(stream).await {
                                Ok(conn) => proxy.dispatch(&dispatch, conn, peer_addr).await,
                                Err(e) => {
                                    proxy
                                        .stats
                                        .handshakes_failed
                                        .fetch_add(1, Ordering::Relaxed);
                                    Err(anyhow::Error::new(e).context("tls handshake"))
                                }
                            };

                            if let Err(e) = result {
                                debug!(peer_addr = %peer_addr, error = %e, "Connection error");
                            }

                            proxy.stats.connection_closed();
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Some(Err(e)) => {
                    if self.closed.load(Ordering::Acquire) {
                        return Ok(());
                    }
                    error!(error = %e, "Accept error");
                    return Err(ProxyError::Accept(e));
                }
                None => {
                    drop(listener);
                    if self.closed.load(Ordering::Acquire) {
                        info!(hostname = %self.hostname, "Proxy closed");
                        return Ok(());
                    }
                    warn!(hostname = %self.hostname, "Listener terminated");
                    return Err(ProxyError::ListenerClosed);
                }
            }
        }
    }

    async fn dispatch(
        self: &Arc<Self>,
        dispatch: &Dispatch,
        conn: BoxConn,
        peer_addr: SocketAddr,
    ) -> anyhow::Result<()> {
        match dispatch {
            Dispatch::Http(forwarder) => {
                Arc::clone(forwarder)
                    .serve_connection(Arc::clone(self), conn, peer_addr)
                    .await
            }
            Dispatch::Relay(relay) => relay.handle(self, conn).await,
        }
    }

    /// Mark the proxy closed, then close the listener. `serve` returns
    /// `Ok(())`.
    pub fn close(&self) -> Result<(), ProxyError> {
        self.ensure_bound()?;
        self.closed.store(true, Ordering::Release);
        self.close_listener()
    }

    /// Close the listener without marking the proxy closed. `serve` returns
    /// [`ProxyError::ListenerClosed`].
    pub fn terminate(&self) -> Result<(), ProxyError> {
        self.ensure_bound()?;
        self.close_listener()
    }

    fn ensure_bound(&self) -> Result<(), ProxyError> {
        match self.state() {
            ServeState::Bound(_) => Ok(()),
            ServeState::Unbound => Err(ProxyError::NotServing),
            ServeState::Stopped => Err(ProxyError::ListenerClosed),
        }
    }

    fn close_listener(&self) -> Result<(), ProxyError> {
        if self.shutdown_requested.swap(true, Ordering::AcqRel) {
            return Err(ProxyError::ListenerClosed);
        }
        // Stored as a permit if the accept loop is not currently waiting.
        self.shutdown.notify_one();
        Ok(())
    }
}
