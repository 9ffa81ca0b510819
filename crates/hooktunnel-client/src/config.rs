//! Tunnel client configuration and configuration sources.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Boxed error returned by configuration sources.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Snapshot of everything needed to dial the relay.
///
/// Snapshots are replaced wholesale when credentials are refreshed, never
/// patched in place.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Client identity registered with the relay.
    pub id: String,
    /// Relay address; `http(s)://` and bare `host:port` forms are accepted.
    pub relay_addr: String,
    /// Bearer credential presented during the handshake.
    pub token: String,
    /// Retry policy; unset fields take defaults.
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl TunnelConfig {
    pub fn new(id: impl Into<String>, relay_addr: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            relay_addr: relay_addr.into(),
            token: token.into(),
            retry: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Relay address in the WebSocket scheme.
    pub fn relay_url(&self) -> String {
        make_ws_url(&self.relay_addr)
    }
}

impl fmt::Debug for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelConfig")
            .field("id", &self.id)
            .field("relay_addr", &self.relay_addr)
            .field("token", &"<redacted>")
            .field("retry", &self.retry)
            .finish()
    }
}

/// Convert a relay address to the WebSocket URL scheme.
///
/// `https://` becomes `wss://`, `http://` becomes `ws://`, addresses without
/// a scheme get `ws://`, and `ws(s)://` addresses are returned unchanged.
pub fn make_ws_url(addr: &str) -> String {
    if let Some(rest) = addr.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = addr.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if addr.starts_with("ws://") || addr.starts_with("wss://") {
        addr.to_string()
    } else {
        format!("ws://{addr}")
    }
}

/// Source of fresh [`TunnelConfig`] snapshots.
///
/// Called once at construction and again whenever the working credential
/// stops being usable. Any `Fn() -> Result<TunnelConfig, E>` closure is a
/// configurer.
#[async_trait]
pub trait Configurer: Send + Sync + 'static {
    async fn configure(&self) -> Result<TunnelConfig, BoxError>;
}

#[async_trait]
impl<F, E> Configurer for F
where
    F: Fn() -> Result<TunnelConfig, E> + Send + Sync + 'static,
    E: Into<BoxError>,
{
    async fn configure(&self) -> Result<TunnelConfig, BoxError> {
        self().map_err(Into::into)
    }
}

/// Configurer that re-reads a JSON file on every call.
///
/// A credential rotated on disk is picked up at the next refresh.
#[derive(Debug, Clone)]
pub struct FileConfigurer {
    path: PathBuf,
}

impl FileConfigurer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Configurer for FileConfigurer {
    async fn configure(&self) -> Result<TunnelConfig, BoxError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| format!("failed to read {}: {e}", self.path.display()))?;
        let config = serde_json::from_str(&raw)
            .map_err(|e| format!("invalid config {}: {e}", self.path.display()))?;
        Ok(config)
    }
}
