#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::fmt::Debug;
use std::future::pending;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt as _;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, Sleep, sleep, timeout};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::config::Config;
use super::error::WsError;
use super::session::{
    ABNORMAL_CLOSURE, ConnectionState, Effect, Event, Notice, PING_FRAME, Session, Timer,
};
use super::traits::MessageParser;
use super::transport::{Connector, Link, TransportEvent};
use crate::Result;

/// Broadcast channel capacity for incoming messages.
const BROADCAST_CAPACITY: usize = 1024;

/// Broadcast channel capacity for advisory notices.
const NOTICE_CAPACITY: usize = 64;

/// What [`ConnectionManager::send`] did with a message.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The connection was open; the frame went straight to the transport
    Sent,
    /// The connection was not open; the frame waits in the outbound queue
    Queued,
}

enum Command {
    Connect,
    Send(String),
    Resume,
}

/// Manages one logical chat session over an unreliable WebSocket.
///
/// This connection manager handles all connection concerns:
/// - Establishing the connection on demand, idempotently
/// - Automatic reconnection with capped exponential backoff and jitter
/// - Heartbeat monitoring via ping/pong with a staleness grace window
/// - Buffering outbound frames while offline and flushing them in order
/// - Broadcasting parsed inbound messages to multiple subscribers
///
/// The protocol itself lives in [`Session`]; a background task feeds it transport events,
/// timer expiries and caller commands one at a time and carries out the resulting effects.
///
/// # Type Parameters
///
/// - `M`: Message type that implements [`DeserializeOwned`] among other "helper" types
/// - `P`: Parser type that implements [`MessageParser<M>`]
///
/// # Example
///
/// ```ignore
/// let connection = ConnectionManager::new(endpoint, Config::default(), ChatParser, connector);
/// connection.connect()?;
///
/// let mut rx = connection.subscribe();
/// while let Ok(msg) = rx.recv().await {
///     println!("Received: {:?}", msg);
/// }
/// ```
pub struct ConnectionManager<M, P>
where
    M: DeserializeOwned + Debug + Clone + Send + 'static,
    P: MessageParser<M>,
{
    inner: Arc<Shared<M>>,
    _phantom: PhantomData<P>,
}

impl<M, P> Clone for ConnectionManager<M, P>
where
    M: DeserializeOwned + Debug + Clone + Send + 'static,
    P: MessageParser<M>,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _phantom: PhantomData,
        }
    }
}

/// Handle state shared by every clone of a [`ConnectionManager`].
struct Shared<M> {
    /// Sender channel for commands to the driver task
    command_tx: mpsc::UnboundedSender<Command>,
    /// Watch channel sender for state changes (enables reconnection detection)
    state_tx: watch::Sender<ConnectionState>,
    /// Broadcast sender for incoming messages
    broadcast_tx: broadcast::Sender<M>,
    /// Broadcast sender for advisory notices
    notice_tx: broadcast::Sender<Notice>,
    /// Cancelled exactly once, on dispose
    cancel: CancellationToken,
}

impl<M> Shared<M> {
    fn dispose(&self) {
        self.cancel.cancel();
        publish_state(&self.state_tx, ConnectionState::Disconnected);
    }
}

impl<M> Drop for Shared<M> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<M, P> ConnectionManager<M, P>
where
    M: DeserializeOwned + Debug + Clone + Send + 'static,
    P: MessageParser<M>,
{
    /// Create a new connection manager and start its driver task.
    ///
    /// The manager starts [`ConnectionState::Disconnected`]; call [`Self::connect`] (or send
    /// something) to open the transport. The `parser` turns inbound frames into `M`s and the
    /// `connector` opens transports to `endpoint`.
    pub fn new(
        endpoint: Url,
        config: Config,
        parser: P,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (notice_tx, _) = broadcast::channel(NOTICE_CAPACITY);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let cancel = CancellationToken::new();

        let driver = Driver {
            write_timeout: config.heartbeat_timeout,
            session: Session::new(config),
            endpoint,
            connector,
            parser,
            link: None,
            opening: None,
            timers: Timers::default(),
            state_tx: state_tx.clone(),
            broadcast_tx: broadcast_tx.clone(),
            notice_tx: notice_tx.clone(),
            cancel: cancel.clone(),
        };

        tokio::spawn(driver.run(command_rx));

        Self {
            inner: Arc::new(Shared {
                command_tx,
                state_tx,
                broadcast_tx,
                notice_tx,
                cancel,
            }),
            _phantom: PhantomData,
        }
    }

    /// Open the transport if none is connecting or open. Calling this while connected is a
    /// no-op; calling it after the manager gave up starts a fresh round of attempts.
    pub fn connect(&self) -> Result<()> {
        self.command(Command::Connect)
    }

    /// Send a message to the server.
    ///
    /// The message is serialized immediately; a serialization failure is returned and the
    /// message is not queued. Otherwise the frame is either written to the open transport or
    /// buffered until the next successful open, in which case a connection attempt is started
    /// if the manager is idle. Transport failures are never returned from here.
    pub fn send<R: Serialize>(&self, request: &R) -> Result<SendOutcome> {
        let frame = serde_json::to_string(request)?;

        let outcome = if self.state().is_connected() {
            SendOutcome::Sent
        } else {
            SendOutcome::Queued
        };
        self.command(Command::Send(frame))?;

        Ok(outcome)
    }

    /// Tell the manager the hosting session became visible again.
    ///
    /// A connection that has not seen a pong within the staleness bound is replaced
    /// immediately instead of waiting for the next heartbeat.
    pub fn notify_visible(&self) -> Result<()> {
        self.command(Command::Resume)
    }

    /// Close the transport with a normal closure and stop every timer.
    ///
    /// Once this returns no further message, notice or state change is published. Safe to
    /// call more than once. Dropping the last handle has the same effect.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    /// Whether [`Self::dispose`] has run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Subscribe to incoming messages.
    ///
    /// Each call returns a new independent receiver. Multiple subscribers can
    /// receive messages concurrently without blocking each other.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<M> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Subscribe to advisory notices such as "reconnected" or "gave up".
    #[must_use]
    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.inner.notice_tx.subscribe()
    }

    fn command(&self, command: Command) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(WsError::Disposed.into());
        }
        self.inner
            .command_tx
            .send(command)
            .map_err(|_e| WsError::Disposed)?;
        Ok(())
    }
}

fn publish_state(state_tx: &watch::Sender<ConnectionState>, state: ConnectionState) {
    state_tx.send_if_modified(|current| {
        if *current == state {
            false
        } else {
            *current = state;
            true
        }
    });
}

/// One pending instance per timer series; arming replaces the slot.
#[derive(Default)]
struct Timers {
    heartbeat: Option<Pin<Box<Sleep>>>,
    pong_timeout: Option<Pin<Box<Sleep>>>,
    reconnect: Option<Pin<Box<Sleep>>>,
}

impl Timers {
    fn slot(&mut self, timer: Timer) -> &mut Option<Pin<Box<Sleep>>> {
        match timer {
            Timer::Heartbeat => &mut self.heartbeat,
            Timer::PongTimeout => &mut self.pong_timeout,
            Timer::Reconnect => &mut self.reconnect,
        }
    }
}

async fn expire(slot: &mut Option<Pin<Box<Sleep>>>) {
    match slot {
        Some(timer) => timer.as_mut().await,
        None => pending().await,
    }
}

async fn opened(slot: &mut Option<BoxFuture<'static, Result<Link>>>) -> Result<Link> {
    match slot {
        Some(opening) => opening.await,
        None => pending().await,
    }
}

/// Bound one transport write by `limit` and abandon it once the manager is disposed.
async fn bounded_write<F>(cancel: &CancellationToken, limit: Duration, write: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    tokio::select! {
        biased;

        () = cancel.cancelled() => Err(WsError::Disposed.into()),
        result = timeout(limit, write) => result.map_err(|_elapsed| WsError::Timeout)?,
    }
}

async fn next_event(link: &mut Option<Link>) -> TransportEvent {
    match link {
        Some(link) => link.events.next().await.unwrap_or(TransportEvent::Closed {
            code: ABNORMAL_CLOSURE,
        }),
        None => pending().await,
    }
}

/// Background task that owns the session, the transport and the timers.
struct Driver<M, P> {
    session: Session,
    /// Upper bound on any single write or close handshake
    write_timeout: Duration,
    endpoint: Url,
    connector: Arc<dyn Connector>,
    parser: P,
    link: Option<Link>,
    opening: Option<BoxFuture<'static, Result<Link>>>,
    timers: Timers,
    state_tx: watch::Sender<ConnectionState>,
    broadcast_tx: broadcast::Sender<M>,
    notice_tx: broadcast::Sender<Notice>,
    cancel: CancellationToken,
}

impl<M, P> Driver<M, P>
where
    M: DeserializeOwned + Debug + Clone + Send + 'static,
    P: MessageParser<M>,
{
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let event = tokio::select! {
                biased;

                () = self.cancel.cancelled() => Event::Dispose,

                Some(command) = commands.recv() => match command {
                    Command::Connect => Event::Connect,
                    Command::Send(frame) => Event::Send { frame },
                    Command::Resume => Event::Resumed { now: Instant::now() },
                },

                result = opened(&mut self.opening) => {
                    self.opening = None;
                    match result {
                        Ok(link) => {
                            self.link = Some(link);
                            Event::Opened { now: Instant::now() }
                        }
                        Err(e) => {
                            #[cfg(feature = "tracing")]
                            tracing::warn!(endpoint = %self.endpoint, error = %e, "Unable to connect");
                            #[cfg(not(feature = "tracing"))]
                            let _: &crate::error::Error = &e;
                            Event::Closed { code: ABNORMAL_CLOSURE }
                        }
                    }
                }

                event = next_event(&mut self.link) => match event {
                    TransportEvent::Message(text) => {
                        #[cfg(feature = "tracing")]
                        tracing::trace!(%text, "Received WebSocket text message");
                        Event::Frame { text, now: Instant::now() }
                    }
                    TransportEvent::Closed { code } => {
                        self.link = None;
                        Event::Closed { code }
                    }
                    TransportEvent::Error(reason) => Event::Errored { reason },
                },

                () = expire(&mut self.timers.heartbeat) => {
                    self.timers.heartbeat = None;
                    Event::HeartbeatDue
                }

                () = expire(&mut self.timers.pong_timeout) => {
                    self.timers.pong_timeout = None;
                    Event::PongOverdue { now: Instant::now() }
                }

                () = expire(&mut self.timers.reconnect) => {
                    self.timers.reconnect = None;
                    Event::ReconnectDue
                }
            };

            self.step(event).await;

            if self.session.is_disposed() {
                #[cfg(feature = "tracing")]
                tracing::debug!(endpoint = %self.endpoint, "Connection manager disposed");
                break;
            }
        }
    }

    /// Reduce one event and execute its effects, feeding failed writes back in.
    async fn step(&mut self, event: Event) {
        let mut next = Some(event);

        while let Some(event) = next.take() {
            let effects = self.session.reduce(event);
            let undelivered = self.apply(effects).await;
            // After dispose the run loop reduces `Dispose` next, which still closes the link
            if !undelivered.is_empty() && !self.cancel.is_cancelled() {
                next = Some(Event::Undelivered {
                    frames: undelivered,
                });
            }
        }

        if !self.cancel.is_cancelled() {
            publish_state(&self.state_tx, self.session.state());
        }
    }

    /// Execute effects in order. Returns the frames that could not be written; once one write
    /// fails, every later frame in the batch is returned unwritten to keep the queue ordered.
    ///
    /// Every write and close handshake is bounded by the heartbeat timeout, so a peer that
    /// stops reading cannot stall the driver.
    async fn apply(&mut self, effects: Vec<Effect>) -> Vec<String> {
        let mut undelivered = Vec::new();

        for effect in effects {
            match effect {
                Effect::Open => self.open(),
                Effect::Transmit(frame) => {
                    if !undelivered.is_empty() {
                        undelivered.push(frame);
                        continue;
                    }
                    let Some(link) = self.link.as_mut() else {
                        undelivered.push(frame);
                        continue;
                    };
                    let write = link.transport.send(frame.clone());
                    if let Err(e) = bounded_write(&self.cancel, self.write_timeout, write).await {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(error = %e, "Transmit failed, requeueing frame");
                        #[cfg(not(feature = "tracing"))]
                        let _: &crate::error::Error = &e;
                        undelivered.push(frame);
                    }
                }
                Effect::Probe => {
                    if let Some(link) = self.link.as_mut()
                        && let Err(e) = bounded_write(
                            &self.cancel,
                            self.write_timeout,
                            link.transport.send(PING_FRAME.to_owned()),
                        )
                        .await
                    {
                        #[cfg(feature = "tracing")]
                        tracing::debug!(error = %e, "Heartbeat probe could not be written");
                        #[cfg(not(feature = "tracing"))]
                        let _: &crate::error::Error = &e;
                    }
                }
                Effect::Close(code) => {
                    self.opening = None;
                    let Some(mut link) = self.link.take() else {
                        continue;
                    };
                    if code == ABNORMAL_CLOSURE {
                        continue;
                    }
                    let closed = timeout(self.write_timeout, link.transport.close(code))
                        .await
                        .unwrap_or_else(|_elapsed| Err(WsError::Timeout.into()));
                    if let Err(e) = closed {
                        #[cfg(feature = "tracing")]
                        tracing::debug!(code, error = %e, "Close handshake failed");
                        #[cfg(not(feature = "tracing"))]
                        let _: &crate::error::Error = &e;
                    }
                }
                Effect::Arm { timer, after } => {
                    *self.timers.slot(timer) = Some(Box::pin(sleep(after)));
                }
                Effect::Cancel(timer) => {
                    *self.timers.slot(timer) = None;
                }
                Effect::Deliver(text) => self.deliver(&text),
                Effect::Notify(notice) => {
                    if !self.cancel.is_cancelled() {
                        #[cfg(feature = "tracing")]
                        tracing::info!(%notice, "Connection notice");
                        _ = self.notice_tx.send(notice);
                    }
                }
            }
        }

        undelivered
    }

    fn open(&mut self) {
        self.link = None;
        let connector = Arc::clone(&self.connector);
        let endpoint = self.endpoint.clone();

        #[cfg(feature = "tracing")]
        tracing::debug!(%endpoint, "Opening chat connection");

        self.opening = Some(Box::pin(
            async move { connector.connect(&endpoint).await },
        ));
    }

    fn deliver(&self, text: &str) {
        if self.cancel.is_cancelled() {
            return;
        }

        match self.parser.parse(text.as_bytes()) {
            Ok(messages) => {
                for message in messages {
                    #[cfg(feature = "tracing")]
                    tracing::trace!(?message, "Parsed WebSocket message");
                    _ = self.broadcast_tx.send(message);
                }
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%text, error = %e, "Failed to parse WebSocket message");
                #[cfg(not(feature = "tracing"))]
                let _: &crate::error::Error = &e;
            }
        }
    }
}
