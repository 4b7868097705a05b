//! Target resolution and connection observation.
//!
//! A [`TargetResolver`] is consulted on every HTTP request and every raw
//! connection. Nothing is cached: a resolver may hand out a different backend
//! on each call, which is how backends move behind a stable listen address.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Url;

use super::server::Proxy;

/// Supplies the backend endpoint to dial.
#[async_trait]
pub trait TargetResolver: Send + Sync {
    /// Resolve the target for one request or connection.
    async fn resolve(&self) -> Result<Url>;
}

/// Notified once per accepted raw connection, before relaying starts.
pub trait RequestObserver: Send + Sync {
    fn observe(&self, proxy: &Proxy, target: &Url);
}

impl<F> RequestObserver for F
where
    F: Fn(&Proxy, &Url) + Send + Sync,
{
    fn observe(&self, proxy: &Proxy, target: &Url) {
        self(proxy, target)
    }
}

/// Resolver that always returns the same URL.
#[derive(Debug, Clone)]
pub struct StaticTarget {
    target: Url,
}

impl StaticTarget {
    pub fn new(target: Url) -> Self {
        Self { target }
    }

    /// Parse the target URL.
    pub fn parse(target: &str) -> Result<Self> {
        let target = Url::parse(target).with_context(|| format!("invalid target url {target}"))?;
        Ok(Self::new(target))
    }
}

#[async_trait]
impl TargetResolver for StaticTarget {
    async fn resolve(&self) -> Result<Url> {
        Ok(self.target.clone())
    }
}

/// Resolver that re-reads a target URL from a file on every call.
///
/// The file holds a single URL; surrounding whitespace is ignored. Rewriting
/// the file moves new traffic to a different backend without a restart.
#[derive(Debug, Clone)]
pub struct FileTarget {
    path: PathBuf,
}

impl FileTarget {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TargetResolver for FileTarget {
    async fn resolve(&self) -> Result<Url> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("read target file {}", self.path.display()))?;
        let trimmed = contents.trim();
        if trimmed.is_empty() {
            anyhow::bail!("target file {} is empty", self.path.display());
        }
        Url::parse(trimmed).with_context(|| format!("invalid target url {trimmed}"))
    }
}

type ResolveFuture = Pin<Box<dyn Future<Output = Result<Url>> + Send>>;

/// Resolver backed by a closure returning a future.
pub struct FnTarget {
    f: Box<dyn Fn() -> ResolveFuture + Send + Sync>,
}

impl FnTarget {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Url>> + Send + 'static,
    {
        Self {
            f: Box::new(move || Box::pin(f())),
        }
    }
}

#[async_trait]
impl TargetResolver for FnTarget {
    async fn resolve(&self) -> Result<Url> {
        (self.f)().await
    }
}
