//! WebSocket transport dialer.

use std::time::Duration;

use async_trait::async_trait;
use http::HeaderMap;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, client::IntoClientRequest};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

use crate::dial::{DialError, Dialer, HandshakeResponse};

/// Default bound on a single WebSocket handshake.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport produced by [`WsDialer`].
pub type WsTransport = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Dials the relay over WebSocket (`ws://` or `wss://`).
#[derive(Debug, Clone)]
pub struct WsDialer {
    connect_timeout: Duration,
}

impl WsDialer {
    pub fn new() -> Self {
        // `Err` means a provider is already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Bound each handshake; an expired handshake counts as unreachable.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Default for WsDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dialer for WsDialer {
    type Transport = WsTransport;

    async fn dial(
        &self,
        url: &str,
        headers: &HeaderMap,
    ) -> Result<(Self::Transport, HandshakeResponse), DialError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| DialError::unreachable(format!("invalid relay url {url}: {e}")))?;
        request
            .headers_mut()
            .extend(headers.iter().map(|(k, v)| (k.clone(), v.clone())));

        let handshake = tokio::time::timeout(self.connect_timeout, connect_async(request))
            .await
            .map_err(|_| {
                DialError::unreachable(format!(
                    "handshake timed out after {}ms",
                    self.connect_timeout.as_millis()
                ))
            })?;

        match handshake {
            Ok((stream, response)) => {
                let response = HandshakeResponse {
                    status: response.status(),
                    headers: response.headers().clone(),
                };
                Ok((stream, response))
            }
            Err(tungstenite::Error::Http(response)) => {
                debug!(status = response.status().as_u16(), "relay refused upgrade");
                let message = format!("relay refused upgrade: {}", response.status());
                let response = HandshakeResponse {
                    status: response.status(),
                    headers: response.headers().clone(),
                };
                Err(DialError::rejected(response, message))
            }
            Err(e) => Err(DialError::unreachable(e.to_string())),
        }
    }
}
