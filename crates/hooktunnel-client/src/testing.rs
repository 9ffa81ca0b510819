//! Scripted dialer and controllable sessions for unit tests.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use http::{HeaderMap, HeaderValue, StatusCode};
use tokio::sync::{Notify, mpsc, watch};

use crate::connector::CLIENT_URL_HEADER;
use crate::dial::{DialError, Dialer, HandshakeResponse};
use crate::session::{MuxSession, Multiplexer};

/// Outcome of one scripted dial.
#[derive(Clone)]
pub(crate) enum Step {
    /// No response, as if the relay were down.
    Unreachable,
    /// The relay refused the upgrade with this status.
    Status(u16),
    /// Handshake succeeds and the relay assigns this public URL.
    Connect(&'static str),
    /// Wait for the gate to be notified, then connect.
    Gated(Arc<Notify>, &'static str),
}

#[derive(Default)]
struct DialerState {
    script: Mutex<VecDeque<Step>>,
    dials: AtomicUsize,
    last_headers: Mutex<Option<HeaderMap>>,
}

/// Dialer that replays a script; once exhausted it repeats `fallback`.
#[derive(Clone)]
pub(crate) struct ScriptedDialer {
    state: Arc<DialerState>,
    fallback: Step,
}

impl ScriptedDialer {
    pub(crate) fn new(steps: impl IntoIterator<Item = Step>, fallback: Step) -> Self {
        let state = DialerState {
            script: Mutex::new(steps.into_iter().collect()),
            ..Default::default()
        };
        Self {
            state: Arc::new(state),
            fallback,
        }
    }

    pub(crate) fn push(&self, step: Step) {
        self.state.script.lock().unwrap().push_back(step);
    }

    pub(crate) fn dials(&self) -> usize {
        self.state.dials.load(Ordering::SeqCst)
    }

    pub(crate) fn last_headers(&self) -> HeaderMap {
        self.state.last_headers.lock().unwrap().clone().unwrap_or_default()
    }
}

/// Transport handed out by [`ScriptedDialer`]; carries the dial number.
#[derive(Debug)]
pub(crate) struct MockTransport(pub(crate) usize);

#[async_trait]
impl Dialer for ScriptedDialer {
    type Transport = MockTransport;

    async fn dial(
        &self,
        _url: &str,
        headers: &HeaderMap,
    ) -> Result<(MockTransport, HandshakeResponse), DialError> {
        let n = self.state.dials.fetch_add(1, Ordering::SeqCst);
        *self.state.last_headers.lock().unwrap() = Some(headers.clone());
        let step = self
            .state
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        let public_url = match step {
            Step::Unreachable => return Err(DialError::unreachable("connection refused")),
            Step::Status(code) => {
                let status = StatusCode::from_u16(code).unwrap();
                return Err(DialError::rejected(HandshakeResponse::new(status), "refused"));
            }
            Step::Connect(url) => url,
            Step::Gated(gate, url) => {
                gate.notified().await;
                url
            }
        };
        let mut response = HandshakeResponse::new(StatusCode::SWITCHING_PROTOCOLS);
        response
            .headers
            .insert(CLIENT_URL_HEADER, HeaderValue::from_static(public_url));
        Ok((MockTransport(n), response))
    }
}

/// Test-side control over one mock session.
#[derive(Clone)]
pub(crate) struct SessionHandle {
    tx: mpsc::UnboundedSender<io::Result<u32>>,
    closes: Arc<AtomicUsize>,
    pub(crate) transport: usize,
}

impl SessionHandle {
    /// Make the relay open a stream with this id.
    pub(crate) fn open(&self, stream: u32) {
        let _ = self.tx.send(Ok(stream));
    }

    /// Make the next accept fail as if the transport broke.
    pub(crate) fn fail(&self) {
        let _ = self
            .tx
            .send(Err(io::Error::new(io::ErrorKind::ConnectionReset, "transport broken")));
    }

    pub(crate) fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

pub(crate) struct MockSession {
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<io::Result<u32>>>,
    /// Latched once the session fails or is closed; every accept errors after.
    dead: watch::Sender<bool>,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl MuxSession for MockSession {
    type Stream = u32;

    async fn accept(&self) -> io::Result<u32> {
        let mut dead = self.dead.subscribe();
        tokio::select! {
            next = async { self.rx.lock().await.recv().await } => {
                let next = next.unwrap_or_else(|| Err(io::ErrorKind::UnexpectedEof.into()));
                if next.is_err() {
                    self.dead.send_replace(true);
                }
                next
            }
            _ = dead.wait_for(|d| *d) => Err(io::Error::other("session is dead")),
        }
    }

    async fn close(&self) -> io::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.dead.send_replace(true);
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        "127.0.0.1:7000".parse().ok()
    }
}

/// Multiplexer that records a [`SessionHandle`] for every session built.
#[derive(Clone, Default)]
pub(crate) struct MockMultiplexer {
    sessions: Arc<Mutex<Vec<SessionHandle>>>,
}

impl MockMultiplexer {
    pub(crate) fn session(&self, index: usize) -> SessionHandle {
        self.sessions.lock().unwrap()[index].clone()
    }

    pub(crate) fn count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

impl Multiplexer<MockTransport> for MockMultiplexer {
    type Session = MockSession;

    fn client(&self, transport: MockTransport) -> MockSession {
        let (tx, rx) = mpsc::unbounded_channel();
        let closes = Arc::new(AtomicUsize::new(0));
        self.sessions.lock().unwrap().push(SessionHandle {
            tx,
            closes: Arc::clone(&closes),
            transport: transport.0,
        });
        MockSession {
            rx: tokio::sync::Mutex::new(rx),
            dead: watch::channel(false).0,
            closes,
        }
    }
}

/// Poll `check` until it holds or a second passes.
pub(crate) async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    check()
}
