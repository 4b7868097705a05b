//! Protocol-dual reverse proxy.
//!
//! This module provides:
//! - Listener setup with optional TLS termination
//! - HTTP forwarding with per-request target resolution
//! - Raw TCP/TLS relaying with per-connection target resolution
//! - Close/terminate shutdown primitives
//!
//! ## Architecture
//!
//! ```text
//!                            +-> HTTP forwarder --(reqwest)--> Backend
//! Client -> Listener -> TLS? |
//!                            +-> TCP relay --(pipe, tls?)----> Backend
//!                                     ^
//!                              Target resolver (every request / connection)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let proxy = Arc::new(Proxy::new(
//!     "app.example.com",
//!     Url::parse("https://0.0.0.0:443")?,
//!     Arc::new(StaticTarget::parse("http://10.0.0.5:3000")?),
//!     Arc::new(SelfSignedIssuer),
//! ));
//! tokio::spawn(Arc::clone(&proxy).serve());
//! // ...
//! proxy.close()?;
//! ```

mod http;
mod listen;
mod listener;
mod pipe;
mod server;
mod target;
mod tcp;
mod tls;

pub use http::{
    bad_gateway, BoxError, ProxyBody, X_FORWARDED_FOR, X_FORWARDED_PORT, X_FORWARDED_PROTO,
};
pub use listen::{join_host_port, target_host_port, ForwardingMode, ListenScheme, ListenSpec};
pub use listener::{BoxConn, Conn, ProxyStats};
pub use pipe::{pipe, DRAIN_TIMEOUT};
pub use server::{Proxy, ProxyOptions, ResponseHead, ServeState};
pub use target::{FileTarget, FnTarget, RequestObserver, StaticTarget, TargetResolver};
pub use tls::{
    backend_server_name, server_config, BackendTls, CaIssuer, CertificateIssuer,
    IssuedCertificate, SelfSignedIssuer,
};
