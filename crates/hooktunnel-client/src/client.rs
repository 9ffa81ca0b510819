//! Tunnel client that keeps a multiplexed session to the relay alive.
//!
//! Callers use [`TunnelClient::accept`] the way they would a listening
//! socket. When the session dies the client flips to `Broken`, answers
//! accepts with [`TunnelError::Reconnecting`] and repairs itself in a
//! background task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::Stream;
use tokio::runtime::Handle;
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::Configurer;
use crate::connector::Connector;
use crate::credential::{self, Freshness};
use crate::dial::Dialer;
use crate::error::{Result, TunnelError};
use crate::session::{MuxSession, Multiplexer};

/// Minimum gap between a failed repair and the next accept-triggered one.
const DEFAULT_REPAIR_COOLDOWN: Duration = Duration::from_secs(5);

/// Backoff bounds used by [`TunnelClient::incoming`] on temporary errors.
const INCOMING_MIN_BACKOFF: Duration = Duration::from_millis(5);
const INCOMING_MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Lifecycle of a tunnel client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// A live session serves accepts.
    Running,
    /// The session died; a repair is in flight or has failed.
    Broken,
    /// Shut down. Terminal.
    Closed,
}

type StreamOf<M, T> = <<M as Multiplexer<T>>::Session as MuxSession>::Stream;

/// State guarded by the client's main lock.
struct Shared<S> {
    state: ClientState,
    session: Option<Arc<S>>,
    /// Bumped on every session swap so stale accepts can be detected.
    generation: u64,
    /// Handed to accept callers while not `Running`.
    accept_err: Option<TunnelError>,
    repairing: bool,
    last_repair_failure: Option<Instant>,
}

impl<S> Shared<S> {
    fn pending_error(&self) -> TunnelError {
        self.accept_err.clone().unwrap_or(TunnelError::Reconnecting)
    }
}

struct Inner<D: Dialer, M: Multiplexer<D::Transport>> {
    id: String,
    connector: Connector<D>,
    multiplexer: M,
    shared: Mutex<Shared<M::Session>>,
    /// Public URL register; written by repairs, read without the main lock.
    url: watch::Sender<String>,
    closed: watch::Sender<bool>,
    repair_cooldown: Duration,
    /// Runtime the client was built on; all background work is spawned here.
    runtime: Handle,
}

/// Builder for [`TunnelClient`].
pub struct ClientBuilder<D, M> {
    configurer: Arc<dyn Configurer>,
    dialer: D,
    multiplexer: M,
    freshness: Freshness,
    repair_cooldown: Duration,
}

impl<D, M> ClientBuilder<D, M>
where
    D: Dialer,
    M: Multiplexer<D::Transport>,
{
    /// Replace the credential freshness check (defaults to JWT expiry).
    #[must_use]
    pub fn with_freshness(mut self, check: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.freshness = Arc::new(check);
        self
    }

    /// Minimum time between a failed repair and the next one.
    #[must_use]
    pub const fn with_repair_cooldown(mut self, cooldown: Duration) -> Self {
        self.repair_cooldown = cooldown;
        self
    }

    /// Connect to the relay. Fails unless a first session is established.
    pub async fn connect(self) -> Result<TunnelClient<D, M>> {
        let connector = Connector::new(self.configurer, self.dialer, self.freshness).await?;
        let id = connector.config().await.id;
        let conn = connector.connect().await?;
        let session = Arc::new(self.multiplexer.client(conn.transport));
        info!(client_id = %id, url = %conn.url, "Tunnel client running");

        let shared = Shared {
            state: ClientState::Running,
            session: Some(session),
            generation: 0,
            accept_err: None,
            repairing: false,
            last_repair_failure: None,
        };
        let inner = Inner {
            id,
            connector,
            multiplexer: self.multiplexer,
            shared: Mutex::new(shared),
            url: watch::channel(conn.url).0,
            closed: watch::channel(false).0,
            repair_cooldown: self.repair_cooldown,
            runtime: Handle::current(),
        };
        Ok(TunnelClient {
            inner: Arc::new(inner),
        })
    }
}

/// Listener-style client for streams tunneled through a relay.
///
/// Cloning is cheap; clones share the same session and state.
pub struct TunnelClient<D: Dialer, M: Multiplexer<D::Transport>> {
    inner: Arc<Inner<D, M>>,
}

impl<D: Dialer, M: Multiplexer<D::Transport>> Clone for TunnelClient<D, M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D, M> TunnelClient<D, M>
where
    D: Dialer,
    M: Multiplexer<D::Transport>,
{
    pub fn builder(configurer: impl Configurer, dialer: D, multiplexer: M) -> ClientBuilder<D, M> {
        ClientBuilder {
            configurer: Arc::new(configurer),
            dialer,
            multiplexer,
            freshness: credential::jwt_freshness(),
            repair_cooldown: DEFAULT_REPAIR_COOLDOWN,
        }
    }

    /// Connect with default settings.
    pub async fn connect(configurer: impl Configurer, dialer: D, multiplexer: M) -> Result<Self> {
        Self::builder(configurer, dialer, multiplexer).connect().await
    }

    /// Accept the next stream the relay opens.
    ///
    /// Never waits for a repair: while the session is down this returns the
    /// pending error at once. An accept still waiting on a session that a
    /// repair replaces also returns [`TunnelError::Reconnecting`]; call again.
    pub async fn accept(&self) -> Result<StreamOf<M, D::Transport>> {
        if self.is_closed() {
            return Err(TunnelError::ClientClosed);
        }

        let (session, generation) = {
            let mut shared = self.inner.shared.lock().await;
            match shared.state {
                ClientState::Running => {}
                ClientState::Closed => return Err(TunnelError::ClientClosed),
                ClientState::Broken => {
                    let err = shared.pending_error();
                    if self.inner.repair_due(&shared) {
                        shared.accept_err = Some(TunnelError::Reconnecting);
                        Inner::spawn_repair(&self.inner, &mut shared);
                    }
                    return Err(err);
                }
            }
            let Some(session) = shared.session.clone() else {
                return Err(shared.pending_error());
            };
            (session, shared.generation)
        };

        let accepted = session.accept().await;

        let mut shared = self.inner.shared.lock().await;
        if self.is_closed() {
            return Err(TunnelError::ClientClosed);
        }
        if shared.generation != generation || shared.state != ClientState::Running {
            // The session was superseded while we waited; whatever it
            // produced is discarded.
            return Err(shared.pending_error());
        }
        match accepted {
            Ok(stream) => Ok(stream),
            Err(e) => {
                warn!(client_id = %self.inner.id, error = %e, "Session failed, reconnecting");
                shared.state = ClientState::Broken;
                shared.accept_err = Some(TunnelError::Reconnecting);
                Inner::spawn_repair(&self.inner, &mut shared);
                Err(TunnelError::Reconnecting)
            }
        }
    }

    /// Stream of accepted streams.
    ///
    /// Temporary errors are absorbed with a short capped backoff; other
    /// errors are yielded. The stream ends once the client is closed.
    pub fn incoming(&self) -> impl Stream<Item = Result<StreamOf<M, D::Transport>>> + Send + 'static {
        let client = self.clone();
        async_stream::stream! {
            let mut backoff = INCOMING_MIN_BACKOFF;
            loop {
                match client.accept().await {
                    Ok(stream) => {
                        backoff = INCOMING_MIN_BACKOFF;
                        yield Ok(stream);
                        continue;
                    }
                    Err(TunnelError::ClientClosed) => break,
                    Err(e) if e.is_temporary() => {}
                    Err(e) => yield Err(e),
                }
                tokio::select! {
                    () = tokio::time::sleep(backoff) => {}
                    () = client.closed() => {}
                }
                backoff = (backoff * 2).min(INCOMING_MAX_BACKOFF);
            }
        }
    }

    /// Public URL the relay currently serves this client under.
    pub fn url(&self) -> String {
        self.inner.url.borrow().clone()
    }

    /// Watch the public URL; it changes when a repair lands on a new one.
    pub fn url_updates(&self) -> watch::Receiver<String> {
        self.inner.url.subscribe()
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Local address of the current session, if there is one.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let shared = self.inner.shared.lock().await;
        shared.session.as_ref().and_then(|s| s.local_addr())
    }

    pub async fn state(&self) -> ClientState {
        self.inner.shared.lock().await.state
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Shut the client down.
    ///
    /// Idempotent and callable from any thread. Returns immediately; the
    /// session is torn down in the background on the client's runtime. A
    /// repair already in flight is not cancelled, but it will
    /// not install its session.
    pub fn close(&self) {
        let first = self.inner.closed.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        });
        if !first {
            return;
        }

        info!(client_id = %self.inner.id, "Closing tunnel client");
        let inner = Arc::clone(&self.inner);
        self.inner.runtime.spawn(async move {
            let mut shared = inner.shared.lock().await;
            shared.state = ClientState::Closed;
            shared.accept_err = Some(TunnelError::ClientClosed);
            shared.generation = shared.generation.wrapping_add(1);
            if let Some(session) = shared.session.take() {
                if let Err(e) = session.close().await {
                    warn!(client_id = %inner.id, error = %e, "Failed to close session");
                }
            }
        });
    }
}

impl<D, M> Inner<D, M>
where
    D: Dialer,
    M: Multiplexer<D::Transport>,
{
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Whether a `Broken` client should start another repair now.
    fn repair_due(&self, shared: &Shared<M::Session>) -> bool {
        !shared.repairing
            && shared
                .last_repair_failure
                .is_none_or(|at| at.elapsed() >= self.repair_cooldown)
    }

    /// Start a repair task unless one is already running.
    fn spawn_repair(this: &Arc<Self>, shared: &mut Shared<M::Session>) {
        if shared.repairing || this.is_closed() {
            return;
        }
        shared.repairing = true;
        let inner = Arc::clone(this);
        this.runtime.spawn(async move { inner.repair().await });
    }

    /// Run one connector invocation and install the result.
    async fn repair(&self) {
        info!(client_id = %self.id, "Repairing tunnel session");
        let result = self.connector.connect().await;

        let mut shared = self.shared.lock().await;
        shared.repairing = false;
        let conn = match result {
            Ok(conn) => conn,
            Err(e) => {
                warn!(client_id = %self.id, error = %e, "Unable to reconnect to relay");
                if !self.is_closed() {
                    shared.accept_err = Some(e);
                    shared.last_repair_failure = Some(Instant::now());
                }
                return;
            }
        };

        let session = self.multiplexer.client(conn.transport);
        if self.is_closed() {
            drop(shared);
            info!(client_id = %self.id, "Client closed during repair, discarding session");
            if let Err(e) = session.close().await {
                warn!(client_id = %self.id, error = %e, "Failed to close discarded session");
            }
            return;
        }

        if let Some(old) = shared.session.take() {
            if let Err(e) = old.close().await {
                warn!(client_id = %self.id, error = %e, "Failed to close previous session");
            }
        }
        shared.session = Some(Arc::new(session));
        shared.generation = shared.generation.wrapping_add(1);
        shared.state = ClientState::Running;
        shared.accept_err = None;
        shared.last_repair_failure = None;
        self.url.send_replace(conn.url.clone());
        info!(client_id = %self.id, url = %conn.url, "Tunnel session repaired");
    }
}
