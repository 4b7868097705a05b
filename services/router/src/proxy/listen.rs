//! Listen specification parsing.
//!
//! The listen URL scheme selects both TLS termination and the forwarding mode:
//! - `http`, `https`: HTTP forwarding (request-level target resolution)
//! - `tcp`, `tls`: raw relay (connection-level target resolution)
//!
//! `https` and `tls` terminate TLS at the proxy.

use std::fmt;
use std::str::FromStr;

use reqwest::Url;

use crate::error::ProxyError;

/// Scheme of a listen URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenScheme {
    Http,
    Https,
    Tcp,
    Tls,
}

/// How accepted connections are forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardingMode {
    /// Request-level reverse proxying.
    Http,
    /// Byte-for-byte relay.
    Relay,
}

impl ListenScheme {
    /// Whether the proxy terminates TLS for this scheme.
    pub fn terminates_tls(self) -> bool {
        matches!(self, ListenScheme::Https | ListenScheme::Tls)
    }

    /// Forwarding mode selected by this scheme.
    pub fn mode(self) -> ForwardingMode {
        match self {
            ListenScheme::Http | ListenScheme::Https => ForwardingMode::Http,
            ListenScheme::Tcp | ListenScheme::Tls => ForwardingMode::Relay,
        }
    }

    /// Scheme name as it appears in the URL.
    pub fn as_str(self) -> &'static str {
        match self {
            ListenScheme::Http => "http",
            ListenScheme::Https => "https",
            ListenScheme::Tcp => "tcp",
            ListenScheme::Tls => "tls",
        }
    }

    fn default_port(self) -> Option<u16> {
        match self {
            ListenScheme::Http => Some(80),
            ListenScheme::Https => Some(443),
            ListenScheme::Tcp | ListenScheme::Tls => None,
        }
    }
}

impl FromStr for ListenScheme {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(ListenScheme::Http),
            "https" => Ok(ListenScheme::Https),
            "tcp" => Ok(ListenScheme::Tcp),
            "tls" => Ok(ListenScheme::Tls),
            other => Err(ProxyError::UnsupportedScheme(other.to_string())),
        }
    }
}

impl fmt::Display for ListenScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed listen URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenSpec {
    pub scheme: ListenScheme,
    /// Host without IPv6 brackets, suitable for `(host, port)` binding.
    pub host: String,
    pub port: u16,
}

impl ListenSpec {
    /// Validate a listen URL. Fails on unknown schemes before anything else.
    pub fn from_url(url: &Url) -> Result<Self, ProxyError> {
        let scheme: ListenScheme = url.scheme().parse()?;

        let host = url_host(url)
            .ok_or_else(|| ProxyError::InvalidListen(format!("missing host in {url}")))?;

        let port = url
            .port()
            .or_else(|| scheme.default_port())
            .ok_or_else(|| ProxyError::InvalidListen(format!("missing port in {url}")))?;

        Ok(Self { scheme, host, port })
    }

    /// Bind address in `host:port` form (IPv6 hosts bracketed).
    pub fn bind_addr(&self) -> String {
        join_host_port(&self.host, self.port)
    }
}

impl FromStr for ListenSpec {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(s).map_err(|e| ProxyError::InvalidListen(format!("{s}: {e}")))?;
        Self::from_url(&url)
    }
}

/// Resolve the dialable `(host, port)` of a target URL.
pub fn target_host_port(target: &Url) -> Result<(String, u16), ProxyError> {
    let host = url_host(target)
        .ok_or_else(|| ProxyError::InvalidTarget(format!("missing host in {target}")))?;
    let port = target
        .port_or_known_default()
        .ok_or_else(|| ProxyError::InvalidTarget(format!("missing port in {target}")))?;
    Ok((host, port))
}

/// Join a host and port, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

fn url_host(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    (!host.is_empty()).then(|| host.to_string())
}
