//! plfm-vt router
//!
//! Runs one protocol-dual proxy from environment configuration.
//!
//! This service:
//! - Binds the listen URL (http, https, tcp or tls)
//! - Terminates TLS with a certificate issued for the configured hostname
//! - Resolves the backend on every request (HTTP) or connection (raw)
//! - Closes cleanly on Ctrl-C

use std::sync::Arc;

use anyhow::{Context, Result};
use plfm_router::{
    CaIssuer, CertificateIssuer, FileTarget, ProxyOptions, Router, SelfSignedIssuer,
    StaticTarget, TargetResolver,
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

use config::{Config, IssuerKind, TargetSource};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to ROUTER_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting plfm-vt router");
    info!(
        hostname = %config.hostname,
        listen = %config.listen,
        response_head = ?config.response_head,
        connect_timeout_ms = config.connect_timeout.map(|d| d.as_millis() as u64),
        idle_timeout_ms = config.idle_timeout.map(|d| d.as_millis() as u64),
        "Configuration loaded"
    );

    let issuer: Arc<dyn CertificateIssuer> = match &config.issuer {
        IssuerKind::SelfSigned => Arc::new(SelfSignedIssuer),
        IssuerKind::Ca { common_name } => {
            let ca = CaIssuer::generate(common_name)?;
            if let Some(path) = &config.ca_cert_out {
                std::fs::write(path, ca.ca_cert_pem())
                    .with_context(|| format!("write CA certificate to {}", path.display()))?;
                info!(path = %path.display(), "Router CA certificate written");
            }
            Arc::new(ca)
        }
    };

    let resolver: Arc<dyn TargetResolver> = match &config.target {
        TargetSource::Static(url) => Arc::new(StaticTarget::new(url.clone())),
        TargetSource::File(path) => Arc::new(FileTarget::new(path)),
    };

    let router = Router::new(issuer).with_options(ProxyOptions {
        connect_timeout: config.connect_timeout,
        idle_timeout: config.idle_timeout,
        backend_tls: config.backend_tls()?,
        response_head: config.response_head,
    });

    let proxy = router.new_proxy(
        config.hostname.clone(),
        config.listen.clone(),
        resolver,
        None,
    );

    let shutdown_proxy = Arc::clone(&proxy);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            if let Err(e) = shutdown_proxy.close() {
                error!(error = %e, "Close failed");
            }
        }
    });

    proxy.serve().await.context("proxy stopped")?;

    info!("Router stopped");
    Ok(())
}
