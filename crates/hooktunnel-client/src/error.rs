//! Tunnel client error types.

use std::time::Duration;

use http::StatusCode;

/// Result type alias using [`TunnelError`].
pub type Result<T> = std::result::Result<T, TunnelError>;

/// Errors surfaced by the tunnel client.
///
/// Raw transport failures never reach callers; the connector classifies
/// them into one of these variants.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TunnelError {
    /// The client was closed.
    #[error("client is closed")]
    ClientClosed,

    /// The session is being repaired; retry the call later.
    #[error("client is reconnecting")]
    Reconnecting,

    /// The relay rejected the credential.
    #[error("authentication with relay failed")]
    AuthFailed,

    /// The dial failed with an outcome that must not be retried.
    #[error("could not connect to relay{}", fmt_status(.status))]
    RetryFailed { status: Option<StatusCode> },

    /// The retry budget ran out before a dial succeeded.
    #[error("retry timed out after {}ms", .0.as_millis())]
    RetryTimedOut(Duration),

    /// The configurer failed to produce a fresh configuration.
    #[error("configuration refresh failed: {0}")]
    ConfigRefresh(String),
}

impl TunnelError {
    /// Whether the condition is expected to clear on its own.
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Reconnecting)
    }

    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::RetryTimedOut(_))
    }
}

pub(crate) fn fmt_status(status: &Option<StatusCode>) -> String {
    status.map_or_else(String::new, |s| format!(" (status {})", s.as_u16()))
}
