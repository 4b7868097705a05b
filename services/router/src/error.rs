//! Error types for the router proxy.

use std::io;

use thiserror::Error;

/// Proxy errors with standardized reason codes.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Listen URL uses a scheme other than http, https, tcp or tls.
    #[error("unknown listener scheme: {0}")]
    UnsupportedScheme(String),

    /// Listen URL is missing a host or port, or cannot be parsed.
    #[error("invalid listen address: {0}")]
    InvalidListen(String),

    /// Target URL cannot be dialed (missing host or port).
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// Could not bind the listener socket.
    #[error("bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Certificate issuance for the proxy hostname failed.
    #[error("certificate for {hostname}: {detail}")]
    Certificate { hostname: String, detail: String },

    /// TLS configuration could not be built.
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    /// Accept failed for a reason other than shutdown.
    #[error("accept error: {0}")]
    Accept(#[source] io::Error),

    /// The listener was closed without an intentional shutdown.
    #[error("use of closed network listener")]
    ListenerClosed,

    /// Shutdown requested before the listener was bound.
    #[error("proxy is not serving")]
    NotServing,

    /// Serve was called a second time.
    #[error("proxy already started")]
    AlreadyStarted,

    /// Outbound HTTP client could not be built.
    #[error("http client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ProxyError::UnsupportedScheme(_) => "unsupported_scheme",
            ProxyError::InvalidListen(_) => "invalid_listen",
            ProxyError::InvalidTarget(_) => "invalid_target",
            ProxyError::Bind { .. } => "bind_failed",
            ProxyError::Certificate { .. } => "certificate_failed",
            ProxyError::Tls(_) => "tls_error",
            ProxyError::Accept(_) => "accept_failed",
            ProxyError::ListenerClosed => "listener_closed",
            ProxyError::NotServing => "not_serving",
            ProxyError::AlreadyStarted => "already_started",
            ProxyError::HttpClient(_) => "http_client_error",
            ProxyError::Io(_) => "io_error",
        }
    }

    /// Whether this error happened while setting up `serve`, before accepting.
    pub fn is_setup_failure(&self) -> bool {
        matches!(
            self,
            ProxyError::UnsupportedScheme(_)
                | ProxyError::InvalidListen(_)
                | ProxyError::Bind { .. }
                | ProxyError::Certificate { .. }
                | ProxyError::Tls(_)
                | ProxyError::HttpClient(_)
        )
    }
}
