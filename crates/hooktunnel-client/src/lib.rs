//! Hooktunnel client.
//!
//! Keeps an outbound, multiplexed session to a relay alive and exposes the
//! streams the relay opens through a listener-style [`TunnelClient::accept`].
//! The session is rebuilt in the background whenever it dies; credentials
//! are refreshed from a [`Configurer`] before each reconnect attempt.
//!
//! The multiplexing protocol is pluggable through [`Multiplexer`]; the
//! transport is dialed by a [`Dialer`], with [`WsDialer`] provided for
//! WebSocket relays.

pub mod client;
pub mod config;
pub mod connector;
pub mod credential;
pub mod dial;
pub mod error;
pub mod retry;
pub mod session;
pub mod tracing_init;
pub mod ws;

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod testing;

pub use client::{ClientBuilder, ClientState, TunnelClient};
pub use config::{BoxError, Configurer, FileConfigurer, TunnelConfig, make_ws_url};
pub use connector::{CLIENT_ID_HEADER, CLIENT_URL_HEADER, Connection, Connector};
pub use credential::{Freshness, is_token_usable};
pub use dial::{DialError, DialVerdict, Dialer, HandshakeResponse, classify};
pub use error::{Result, TunnelError};
pub use retry::RetryPolicy;
pub use session::{MuxSession, Multiplexer};
pub use ws::{WsDialer, WsTransport};
