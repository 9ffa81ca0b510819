//! Multiplexed session capability layered over a transport.
//!
//! The stream multiplexing protocol itself lives outside this crate; the
//! client only needs passive acceptance and teardown.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;

/// A session carrying many logical streams over one transport.
#[async_trait]
pub trait MuxSession: Send + Sync + 'static {
    type Stream: Send + 'static;

    /// Wait for the relay to open the next stream.
    ///
    /// An error means the session is dead.
    async fn accept(&self) -> io::Result<Self::Stream>;

    /// Tear the session down. Must be idempotent.
    async fn close(&self) -> io::Result<()>;

    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Builds the client side of a session over a freshly dialed transport.
pub trait Multiplexer<T>: Send + Sync + 'static {
    type Session: MuxSession;

    fn client(&self, transport: T) -> Self::Session;
}
