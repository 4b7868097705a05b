//! Proxy factory.
//!
//! The router owns the certificate issuer shared by every proxy it creates and
//! the default options applied to them. Tracking which proxies are live, and
//! for which hostnames, is left to the caller.

use std::sync::Arc;

use reqwest::Url;
use tracing::debug;

use crate::proxy::{CertificateIssuer, Proxy, ProxyOptions, RequestObserver, TargetResolver};

pub struct Router {
    issuer: Arc<dyn CertificateIssuer>,
    options: ProxyOptions,
}

impl Router {
    /// Create a router issuing certificates through `issuer`.
    pub fn new(issuer: Arc<dyn CertificateIssuer>) -> Self {
        Self {
            issuer,
            options: ProxyOptions::default(),
        }
    }

    /// Options applied to proxies created from now on.
    pub fn with_options(mut self, options: ProxyOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &ProxyOptions {
        &self.options
    }

    /// Build a proxy for `hostname` listening on `listen`.
    pub fn new_proxy(
        &self,
        hostname: impl Into<String>,
        listen: Url,
        resolver: Arc<dyn TargetResolver>,
        observer: Option<Arc<dyn RequestObserver>>,
    ) -> Arc<Proxy> {
        let hostname = hostname.into();
        debug!(hostname = %hostname, listen = %listen, "Creating proxy");

        let mut proxy = Proxy::new(hostname, listen, resolver, Arc::clone(&self.issuer))
            .with_options(self.options.clone());
        if let Some(observer) = observer {
            proxy = proxy.with_observer(observer);
        }
        Arc::new(proxy)
    }
}
