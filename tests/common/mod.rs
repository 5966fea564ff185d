#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]
#![allow(
    dead_code,
    reason = "Each integration test binary uses a different subset of these helpers"
)]

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt as _;
use petsitter_chat::Result;
use petsitter_chat::ws::session::PING_FRAME;
use petsitter_chat::ws::{ConnectionState, Connector, Link, Transport, TransportEvent, WsError};
use tokio::sync::{Semaphore, mpsc, watch};
use url::Url;

/// Reply the server sends to a heartbeat probe.
pub const PONG_FRAME: &str = r#"{"type":"info","message":"pong"}"#;

/// Generous upper bound for anything the tests wait on. Time is paused in most tests, so
/// this only bounds virtual time.
pub const WAIT: Duration = Duration::from_secs(600);

#[derive(Default)]
struct Recorded {
    endpoints: Vec<Url>,
    sent: Vec<String>,
    closes: Vec<u16>,
    peers: Vec<mpsc::UnboundedSender<TransportEvent>>,
    refuse_next: usize,
    refuse_all: bool,
    fail_sends: bool,
    stall_sends: bool,
    auto_pong: bool,
}

/// In-memory [`Connector`] that records everything the connection manager does and lets the
/// test play the server side of every link it hands out.
#[derive(Clone, Default)]
pub struct FakeConnector {
    recorded: Arc<Mutex<Recorded>>,
    gate: Option<Arc<Semaphore>>,
}

impl FakeConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens hang until [`Self::release_open`] is called, one release per open.
    #[must_use]
    pub fn gated() -> Self {
        Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Self::default()
        }
    }

    /// Let one pending (or future) open complete.
    pub fn release_open(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }

    /// Answer every heartbeat probe with a pong.
    #[must_use]
    pub fn with_auto_pong(self) -> Self {
        self.recorded().auto_pong = true;
        self
    }

    /// Fail the next `count` connection attempts.
    pub fn refuse_next(&self, count: usize) {
        self.recorded().refuse_next = count;
    }

    /// Fail every connection attempt until told otherwise.
    pub fn refuse_all(&self, refuse: bool) {
        self.recorded().refuse_all = refuse;
    }

    /// Make every write to an open transport fail.
    pub fn fail_sends(&self, fail: bool) {
        self.recorded().fail_sends = fail;
    }

    /// Make every write to an open transport hang forever, like a peer that stopped reading.
    pub fn stall_sends(&self, stall: bool) {
        self.recorded().stall_sends = stall;
    }

    /// Number of connection attempts made, successful or not.
    #[must_use]
    pub fn opens(&self) -> usize {
        self.recorded().endpoints.len()
    }

    #[must_use]
    pub fn endpoints(&self) -> Vec<Url> {
        self.recorded().endpoints.clone()
    }

    /// Every frame written, heartbeat probes included.
    #[must_use]
    pub fn sent(&self) -> Vec<String> {
        self.recorded().sent.clone()
    }

    /// Frames written, without heartbeat probes.
    #[must_use]
    pub fn sent_messages(&self) -> Vec<String> {
        self.recorded()
            .sent
            .iter()
            .filter(|frame| frame.as_str() != PING_FRAME)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn pings(&self) -> usize {
        self.recorded()
            .sent
            .iter()
            .filter(|frame| frame.as_str() == PING_FRAME)
            .count()
    }

    /// Close codes the manager sent, in order.
    #[must_use]
    pub fn closes(&self) -> Vec<u16> {
        self.recorded().closes.clone()
    }

    /// Push a text frame from the server on the most recent link.
    pub fn server_send(&self, text: &str) {
        self.push(TransportEvent::Message(text.to_owned()));
    }

    /// Close the most recent link from the server side.
    pub fn server_close(&self, code: u16) {
        self.push(TransportEvent::Closed { code });
    }

    /// Report a transport error on the most recent link.
    pub fn server_error(&self, reason: &str) {
        self.push(TransportEvent::Error(reason.to_owned()));
    }

    /// Close the link handed out by the `index`th successful open.
    pub fn close_link(&self, index: usize, code: u16) {
        if let Some(peer) = self.recorded().peers.get(index) {
            _ = peer.send(TransportEvent::Closed { code });
        }
    }

    fn push(&self, event: TransportEvent) {
        if let Some(peer) = self.recorded().peers.last() {
            _ = peer.send(event);
        }
    }

    fn recorded(&self) -> MutexGuard<'_, Recorded> {
        self.recorded.lock().unwrap()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, endpoint: &Url) -> Result<Link> {
        self.recorded().endpoints.push(endpoint.clone());

        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }

        let (peer, rx) = mpsc::unbounded_channel();
        {
            let mut recorded = self.recorded();
            if recorded.refuse_all {
                return Err(WsError::ConnectionClosed.into());
            }
            if recorded.refuse_next > 0 {
                recorded.refuse_next -= 1;
                return Err(WsError::ConnectionClosed.into());
            }
            recorded.peers.push(peer.clone());
        }

        let events = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed();
        let transport = FakeTransport {
            recorded: Arc::clone(&self.recorded),
            peer,
        };

        Ok(Link::new(Box::new(transport), events))
    }
}

struct FakeTransport {
    recorded: Arc<Mutex<Recorded>>,
    peer: mpsc::UnboundedSender<TransportEvent>,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&mut self, frame: String) -> Result<()> {
        let stalled = self.recorded.lock().unwrap().stall_sends;
        if stalled {
            std::future::pending::<()>().await;
        }

        let mut recorded = self.recorded.lock().unwrap();
        if recorded.fail_sends {
            return Err(WsError::ConnectionClosed.into());
        }
        if recorded.auto_pong && frame == PING_FRAME {
            _ = self.peer.send(TransportEvent::Message(PONG_FRAME.to_owned()));
        }
        recorded.sent.push(frame);
        Ok(())
    }

    async fn close(&mut self, code: u16) -> Result<()> {
        self.recorded.lock().unwrap().closes.push(code);
        Ok(())
    }
}

/// Wait until the watched state satisfies `predicate` and return it.
pub async fn wait_for_state<F>(
    rx: &mut watch::Receiver<ConnectionState>,
    predicate: F,
) -> ConnectionState
where
    F: FnMut(&ConnectionState) -> bool,
{
    let state = tokio::time::timeout(WAIT, rx.wait_for(predicate))
        .await
        .unwrap()
        .unwrap();
    *state
}

pub async fn wait_connected(rx: &mut watch::Receiver<ConnectionState>) -> ConnectionState {
    wait_for_state(rx, |state| state.is_connected()).await
}

/// Let the driver task drain whatever is already queued for it.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}
