//! Router configuration.
//!
//! The binary runs a single proxy; everything is env-driven.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use plfm_router::{BackendTls, ResponseHead};
use reqwest::Url;
use rustls::RootCertStore;

/// Where the backend target comes from.
#[derive(Debug, Clone)]
pub enum TargetSource {
    /// Fixed target URL.
    Static(Url),
    /// File re-read on every request/connection.
    File(PathBuf),
}

/// How listener certificates are issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssuerKind {
    SelfSigned,
    /// Router CA with the given common name.
    Ca { common_name: String },
}

/// Router configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Hostname certificates are issued for.
    pub hostname: String,

    /// Listen URL (http, https, tcp or tls).
    pub listen: Url,

    /// Backend target source.
    pub target: TargetSource,

    /// Backend dial timeout (none by default).
    pub connect_timeout: Option<Duration>,

    /// Raw relay idle timeout (none by default).
    pub idle_timeout: Option<Duration>,

    /// PEM roots for validating `tls://` backends. Unset skips validation.
    pub backend_ca_file: Option<PathBuf>,

    /// HTTP response head handling.
    pub response_head: ResponseHead,

    /// Certificate issuer.
    pub issuer: IssuerKind,

    /// Where to write the router CA certificate (PEM), if using a CA issuer.
    pub ca_cert_out: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let hostname = var("ROUTER_HOSTNAME").unwrap_or_else(|| "localhost".to_string());

        let listen = var("ROUTER_LISTEN").context("Missing listen url. Set ROUTER_LISTEN.")?;
        let listen = Url::parse(&listen).context("ROUTER_LISTEN must be a url.")?;

        let target = match (var("ROUTER_TARGET"), var("ROUTER_TARGET_FILE")) {
            (Some(url), None) => TargetSource::Static(
                Url::parse(&url).context("ROUTER_TARGET must be a url.")?,
            ),
            (None, Some(path)) => TargetSource::File(PathBuf::from(path)),
            (Some(_), Some(_)) => bail!("Set only one of ROUTER_TARGET and ROUTER_TARGET_FILE."),
            (None, None) => bail!("Missing target. Set ROUTER_TARGET or ROUTER_TARGET_FILE."),
        };

        let connect_timeout = millis(&var, "ROUTER_CONNECT_TIMEOUT_MS")?;
        let idle_timeout = millis(&var, "ROUTER_IDLE_TIMEOUT_MS")?;

        let backend_ca_file = var("ROUTER_BACKEND_CA_FILE").map(PathBuf::from);

        let response_head = match var("ROUTER_RESPONSE_HEAD").as_deref() {
            None | Some("passthrough") => ResponseHead::Passthrough,
            Some("body-only") => ResponseHead::BodyOnly,
            Some(other) => {
                bail!("ROUTER_RESPONSE_HEAD must be passthrough or body-only, got {other}.")
            }
        };

        let issuer = match var("ROUTER_CA_COMMON_NAME") {
            Some(common_name) => IssuerKind::Ca { common_name },
            None => IssuerKind::SelfSigned,
        };

        let ca_cert_out = var("ROUTER_CA_CERT_OUT").map(PathBuf::from);

        let log_level = var("ROUTER_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            hostname,
            listen,
            target,
            connect_timeout,
            idle_timeout,
            backend_ca_file,
            response_head,
            issuer,
            ca_cert_out,
            log_level,
        })
    }

    /// Backend TLS policy; reads the CA file if one is configured.
    pub fn backend_tls(&self) -> Result<BackendTls> {
        let Some(path) = &self.backend_ca_file else {
            return Ok(BackendTls::SkipVerification);
        };

        let pem = std::fs::read(path)
            .with_context(|| format!("read ROUTER_BACKEND_CA_FILE {}", path.display()))?;
        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
            let cert = cert.with_context(|| format!("parse {}", path.display()))?;
            roots
                .add(cert)
                .with_context(|| format!("add root from {}", path.display()))?;
        }
        if roots.is_empty() {
            bail!("No certificates found in {}.", path.display());
        }

        Ok(BackendTls::Verify(Arc::new(roots)))
    }
}

fn millis(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<Duration>> {
    var(key)
        .map(|v| v.parse::<u64>())
        .transpose()
        .with_context(|| format!("{key} must be an integer (milliseconds)."))
        .map(|ms| ms.filter(|ms| *ms > 0).map(Duration::from_millis))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_minimal_config() {
        let config = load(&[
            ("ROUTER_LISTEN", "tcp://0.0.0.0:5432"),
            ("ROUTER_TARGET", "tls://db.internal:5432"),
        ])
        .unwrap();

        assert_eq!(config.hostname, "localhost");
        assert_eq!(config.listen.scheme(), "tcp");
        assert!(matches!(config.target, TargetSource::Static(_)));
        assert!(config.connect_timeout.is_none());
        assert!(config.idle_timeout.is_none());
        assert_eq!(config.response_head, ResponseHead::Passthrough);
        assert_eq!(config.issuer, IssuerKind::SelfSigned);
        assert!(matches!(
            config.backend_tls().unwrap(),
            BackendTls::SkipVerification
        ));
    }

    #[test]
    fn test_full_config() {
        let config = load(&[
            ("ROUTER_HOSTNAME", "app.example.com"),
            ("ROUTER_LISTEN", "https://0.0.0.0:443"),
            ("ROUTER_TARGET_FILE", "/run/router/target"),
            ("ROUTER_CONNECT_TIMEOUT_MS", "2000"),
            ("ROUTER_IDLE_TIMEOUT_MS", "0"),
            ("ROUTER_RESPONSE_HEAD", "body-only"),
            ("ROUTER_CA_COMMON_NAME", "router CA"),
        ])
        .unwrap();

        assert_eq!(config.hostname, "app.example.com");
        assert!(matches!(config.target, TargetSource::File(_)));
        assert_eq!(config.connect_timeout, Some(Duration::from_secs(2)));
        assert!(config.idle_timeout.is_none());
        assert_eq!(config.response_head, ResponseHead::BodyOnly);
        assert_eq!(
            config.issuer,
            IssuerKind::Ca {
                common_name: "router CA".to_string()
            }
        );
    }

    #[test]
    fn test_target_required() {
        assert!(load(&[("ROUTER_LISTEN", "tcp://0.0.0.0:1")]).is_err());
        assert!(load(&[
            ("ROUTER_LISTEN", "tcp://0.0.0.0:1"),
            ("ROUTER_TARGET", "tcp://a:1"),
            ("ROUTER_TARGET_FILE", "/tmp/t"),
        ])
        .is_err());
    }

    #[test]
    fn test_invalid_values() {
        assert!(load(&[
            ("ROUTER_LISTEN", "tcp://0.0.0.0:1"),
            ("ROUTER_TARGET", "tcp://a:1"),
            ("ROUTER_CONNECT_TIMEOUT_MS", "soon"),
        ])
        .is_err());
        assert!(load(&[
            ("ROUTER_LISTEN", "tcp://0.0.0.0:1"),
            ("ROUTER_TARGET", "tcp://a:1"),
            ("ROUTER_RESPONSE_HEAD", "headers"),
        ])
        .is_err());
    }
}
