//! Transport dialing and handshake outcome classification.

use async_trait::async_trait;
use http::{HeaderMap, StatusCode};

use crate::error::fmt_status;

/// Status and headers the relay answered the handshake with.
#[derive(Debug, Clone, Default)]
pub struct HandshakeResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl HandshakeResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
        }
    }

    /// Header value as a string, or empty when absent or not valid UTF-8.
    pub fn header_str(&self, name: &str) -> &str {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
    }
}

/// A failed handshake.
///
/// `response` is `None` when the relay could not be reached at all.
#[derive(Debug, thiserror::Error)]
#[error("{message}{}", fmt_response(.response))]
pub struct DialError {
    pub response: Option<HandshakeResponse>,
    pub message: String,
}

impl DialError {
    /// Network-level failure; no response was received.
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self {
            response: None,
            message: message.into(),
        }
    }

    /// The relay answered with a non-upgrade response.
    pub fn rejected(response: HandshakeResponse, message: impl Into<String>) -> Self {
        Self {
            response: Some(response),
            message: message.into(),
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.response.as_ref().map(|r| r.status)
    }
}

fn fmt_response(response: &Option<HandshakeResponse>) -> String {
    fmt_status(&response.as_ref().map(|r| r.status))
}

/// Upgrades a connection to the relay into a bidirectional transport.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Transport: Send + 'static;

    async fn dial(
        &self,
        url: &str,
        headers: &HeaderMap,
    ) -> Result<(Self::Transport, HandshakeResponse), DialError>;
}

/// What to do with a handshake outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialVerdict {
    /// The transport is up.
    Connected,
    /// Transient failure; dial again after a delay.
    ShouldRetry,
    /// The relay definitively refused the request.
    NotRetryable,
    /// The relay rejected the credential.
    AuthFailure,
}

/// Classify a handshake outcome.
///
/// No response at all is retryable since the relay may be restarting.
/// Success and client-error statuses on a failed handshake are final, with
/// 401 reported separately so the caller can refresh credentials.
pub fn classify(handshake_ok: bool, status: Option<StatusCode>) -> DialVerdict {
    if handshake_ok {
        return DialVerdict::Connected;
    }
    match status {
        None => DialVerdict::ShouldRetry,
        Some(StatusCode::UNAUTHORIZED) => DialVerdict::AuthFailure,
        Some(s) if s.is_success() || s.is_client_error() => DialVerdict::NotRetryable,
        Some(_) => DialVerdict::ShouldRetry,
    }
}

impl<T> From<&Result<T, DialError>> for DialVerdict {
    fn from(result: &Result<T, DialError>) -> Self {
        match result {
            Ok(_) => Self::Connected,
            Err(e) => classify(false, e.status()),
        }
    }
}
