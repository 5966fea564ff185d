//! Connection state machine.
//!
//! [`Session`] holds everything the connection manager knows about one logical chat
//! session: the connection state, the outbound queue, the reconnect counter and the
//! heartbeat liveness timestamp. It never performs I/O. Each [`Event`] fed to
//! [`Session::reduce`] yields the [`Effect`]s the caller must execute, in order.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff as _;
use rand::rngs::StdRng;
use rand::{Rng as _, SeedableRng as _};
use serde::Deserialize;
use tokio::time::Instant;

use super::config::Config;

/// Close code for a caller-requested shutdown. Never followed by a reconnect.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close frame carried no status code.
pub const NO_STATUS_RECEIVED: u16 = 1005;
/// Close code reported when the socket dropped without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;
/// Close code used when a heartbeat went unanswered past the staleness bound.
pub const HEARTBEAT_TIMEOUT: u16 = 4000;
/// Close code used when a stale connection is found after the session became visible again.
pub const STALE_ON_RESUME: u16 = 4001;

/// Heartbeat probe sent to the server.
pub const PING_FRAME: &str = r#"{"action":"ping"}"#;

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Attempting to connect
    Connecting,
    /// Successfully connected
    Connected {
        /// When the connection was established
        since: Instant,
    },
    /// Waiting to reconnect after failure
    Reconnecting {
        /// Current reconnection attempt number, starting at 1
        attempt: u32,
    },
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}

/// Advisory notices for the user interface. None of them require action except
/// [`Notice::GaveUp`], after which only an explicit connect recovers.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    /// The connection came back after at least one failed attempt
    Reconnected,
    /// The connection is lost and another attempt is scheduled
    Reconnecting {
        /// Attempt number, starting at 1
        attempt: u32,
        /// Attempt bound, `None` when retrying forever
        max: Option<u32>,
    },
    /// The attempt bound was reached; no more automatic reconnects
    GaveUp {
        /// Number of attempts made
        attempts: u32,
    },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reconnected => write!(f, "reconnected"),
            Self::Reconnecting {
                attempt,
                max: Some(max),
            } => write!(f, "connection lost, reconnecting (attempt {attempt}/{max})"),
            Self::Reconnecting { attempt, max: None } => {
                write!(f, "connection lost, reconnecting (attempt {attempt})")
            }
            Self::GaveUp { .. } => write!(f, "failed to connect after multiple attempts"),
        }
    }
}

/// The three timer series the session runs. Each one has at most one pending instance.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timer {
    /// Next heartbeat probe
    Heartbeat,
    /// Deadline for the reply to the last probe
    PongTimeout,
    /// Next reconnection attempt
    Reconnect,
}

/// Inputs to the state machine.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The caller asked for a connection
    Connect,
    /// The transport finished opening
    Opened { now: Instant },
    /// A text frame arrived
    Frame { text: String, now: Instant },
    /// The transport closed
    Closed { code: u16 },
    /// The transport reported an error
    Errored { reason: String },
    /// The caller sent a serialized frame
    Send { frame: String },
    /// These frames were handed to the transport but could not be written
    Undelivered { frames: Vec<String> },
    /// The heartbeat timer fired
    HeartbeatDue,
    /// The pong timeout fired
    PongOverdue { now: Instant },
    /// The reconnect timer fired
    ReconnectDue,
    /// The host reports the session is visible again
    Resumed { now: Instant },
    /// Tear everything down
    Dispose,
}

/// Work the caller must carry out on behalf of the state machine.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Open a new transport to the session endpoint
    Open,
    /// Write an application frame. On failure, report it back as [`Event::Undelivered`]
    Transmit(String),
    /// Write the heartbeat probe. Failures are dropped
    Probe,
    /// Close the current transport with this code. No close event is expected back.
    /// [`ABNORMAL_CLOSURE`] drops the transport without a close handshake
    Close(u16),
    /// Start `timer`, replacing any pending instance
    Arm { timer: Timer, after: Duration },
    /// Stop `timer` if pending
    Cancel(Timer),
    /// Forward an inbound frame to subscribers
    Deliver(String),
    /// Publish an advisory notice
    Notify(Notice),
}

#[derive(Deserialize)]
struct Envelope<'a> {
    #[serde(rename = "type", borrow, default)]
    kind: Option<&'a str>,
    #[serde(borrow, default)]
    message: Option<&'a str>,
}

fn is_heartbeat_reply(text: &str) -> bool {
    serde_json::from_str::<Envelope<'_>>(text)
        .is_ok_and(|envelope| envelope.kind == Some("info") && envelope.message == Some("pong"))
}

/// State of one logical chat session.
pub struct Session {
    config: Config,
    state: ConnectionState,
    queue: VecDeque<String>,
    attempts: u32,
    backoff: ExponentialBackoff,
    last_pong: Option<Instant>,
    /// A transport is opening or open
    live: bool,
    /// The attempt bound was hit; only an explicit connect restarts
    exhausted: bool,
    disposed: bool,
    rng: StdRng,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("queued", &self.queue.len())
            .field("attempts", &self.attempts)
            .field("last_pong", &self.last_pong)
            .field("live", &self.live)
            .field("exhausted", &self.exhausted)
            .field("disposed", &self.disposed)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a disconnected session with an OS-seeded jitter source.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::with_rng(config, StdRng::from_os_rng())
    }

    /// Create a session with a caller-provided jitter source.
    #[must_use]
    pub fn with_rng(config: Config, rng: StdRng) -> Self {
        let backoff = config.reconnect.clone().into();
        Self {
            config,
            state: ConnectionState::Disconnected,
            queue: VecDeque::new(),
            attempts: 0,
            backoff,
            last_pong: None,
            live: false,
            exhausted: false,
            disposed: false,
            rng,
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Frames waiting for an open transport, oldest first.
    pub fn queued(&self) -> impl Iterator<Item = &str> {
        self.queue.iter().map(String::as_str)
    }

    /// Abnormal closes since the last successful open.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether [`Event::Dispose`] has been reduced.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Advance the state machine by one event.
    pub fn reduce(&mut self, event: Event) -> Vec<Effect> {
        let mut effects = Vec::new();

        if self.disposed {
            #[cfg(feature = "tracing")]
            tracing::trace!(?event, "Ignoring event for disposed session");
            return effects;
        }

        match event {
            Event::Connect => self.on_connect(&mut effects),
            Event::Opened { now } => self.on_opened(now, &mut effects),
            Event::Frame { text, now } => self.on_frame(text, now, &mut effects),
            Event::Closed { code } => self.on_closed(code, &mut effects),
            Event::Errored { reason } => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%reason, state = %self.state, "Transport error");
                #[cfg(not(feature = "tracing"))]
                let _: &String = &reason;
            }
            Event::Send { frame } => self.on_send(frame, &mut effects),
            Event::Undelivered { frames } => self.on_undelivered(frames, &mut effects),
            Event::HeartbeatDue => {
                if self.state.is_connected() {
                    effects.push(Effect::Probe);
                    effects.push(Effect::Arm {
                        timer: Timer::PongTimeout,
                        after: self.config.heartbeat_timeout,
                    });
                    effects.push(Effect::Arm {
                        timer: Timer::Heartbeat,
                        after: self.config.heartbeat_interval,
                    });
                }
            }
            Event::PongOverdue { now } => self.on_pong_overdue(now, &mut effects),
            Event::ReconnectDue => {
                if matches!(self.state, ConnectionState::Reconnecting { .. }) && !self.live {
                    self.open(&mut effects);
                }
            }
            Event::Resumed { now } => self.on_resumed(now, &mut effects),
            Event::Dispose => self.on_dispose(&mut effects),
        }

        effects
    }

    fn open(&mut self, effects: &mut Vec<Effect>) {
        self.live = true;
        self.state = ConnectionState::Connecting;
        effects.push(Effect::Open);
    }

    fn on_connect(&mut self, effects: &mut Vec<Effect>) {
        if self.live {
            return;
        }
        if self.exhausted {
            self.exhausted = false;
            self.attempts = 0;
            self.backoff.reset();
        }
        effects.push(Effect::Cancel(Timer::Reconnect));
        self.open(effects);
    }

    fn on_opened(&mut self, now: Instant, effects: &mut Vec<Effect>) {
        if !self.live || self.state != ConnectionState::Connecting {
            return;
        }

        let recovered = self.attempts > 0;
        self.attempts = 0;
        self.backoff.reset();
        self.state = ConnectionState::Connected { since: now };
        self.last_pong = Some(now);

        #[cfg(feature = "tracing")]
        tracing::debug!(queued = self.queue.len(), "Chat connection established");

        effects.push(Effect::Arm {
            timer: Timer::Heartbeat,
            after: self.config.heartbeat_interval,
        });
        if recovered {
            effects.push(Effect::Notify(Notice::Reconnected));
        }
        effects.extend(self.queue.drain(..).map(Effect::Transmit));
    }

    fn on_frame(&mut self, text: String, now: Instant, effects: &mut Vec<Effect>) {
        if is_heartbeat_reply(&text) {
            self.last_pong = Some(now);
            effects.push(Effect::Cancel(Timer::PongTimeout));
        } else {
            effects.push(Effect::Deliver(text));
        }
    }

    fn on_closed(&mut self, code: u16, effects: &mut Vec<Effect>) {
        if !self.live {
            #[cfg(feature = "tracing")]
            tracing::trace!(code, "Ignoring close for a transport that is already gone");
            return;
        }
        self.live = false;
        self.after_close(code, effects);
    }

    fn after_close(&mut self, code: u16, effects: &mut Vec<Effect>) {
        effects.push(Effect::Cancel(Timer::Heartbeat));
        effects.push(Effect::Cancel(Timer::PongTimeout));

        if code == NORMAL_CLOSURE {
            #[cfg(feature = "tracing")]
            tracing::debug!("Chat connection closed normally");
            self.state = ConnectionState::Disconnected;
            return;
        }

        let max = self.config.reconnect.max_attempts;
        if max.is_some_and(|max| self.attempts >= max) {
            #[cfg(feature = "tracing")]
            tracing::error!(attempts = self.attempts, "Giving up on chat connection");
            self.state = ConnectionState::Disconnected;
            self.exhausted = true;
            effects.push(Effect::Notify(Notice::GaveUp {
                attempts: self.attempts,
            }));
            return;
        }

        let base = self
            .backoff
            .next_backoff()
            .unwrap_or(self.config.reconnect.max_backoff);
        let delay = base + self.jitter();
        let attempt = self.attempts.saturating_add(1);

        #[cfg(feature = "tracing")]
        tracing::warn!(code, attempt, ?delay, "Chat connection lost, scheduling reconnect");

        self.state = ConnectionState::Reconnecting { attempt };
        effects.push(Effect::Arm {
            timer: Timer::Reconnect,
            after: delay,
        });
        if attempt > 1 {
            effects.push(Effect::Notify(Notice::Reconnecting { attempt, max }));
        }
        self.attempts = attempt;
    }

    fn jitter(&mut self) -> Duration {
        let max = u64::try_from(self.config.reconnect.max_jitter.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(self.rng.random_range(0..=max))
    }

    fn is_fresh(&self, now: Instant) -> bool {
        self.last_pong
            .is_some_and(|pong| now.saturating_duration_since(pong) <= self.config.stale_after)
    }

    fn on_send(&mut self, frame: String, effects: &mut Vec<Effect>) {
        if self.state.is_connected() {
            if self.queue.is_empty() {
                effects.push(Effect::Transmit(frame));
            } else {
                self.queue.push_back(frame);
                effects.extend(self.queue.drain(..).map(Effect::Transmit));
            }
            return;
        }

        self.queue.push_back(frame);
        if self.state == ConnectionState::Disconnected && !self.live && !self.exhausted {
            self.open(effects);
        }
    }

    fn on_undelivered(&mut self, frames: Vec<String>, effects: &mut Vec<Effect>) {
        for frame in frames.into_iter().rev() {
            self.queue.push_front(frame);
        }

        if self.live && self.state.is_connected() {
            // Nothing more goes out on a link that failed a write; the next open flushes
            #[cfg(feature = "tracing")]
            tracing::warn!(queued = self.queue.len(), "Write failed, dropping chat connection");
            effects.push(Effect::Close(ABNORMAL_CLOSURE));
            self.live = false;
            self.after_close(ABNORMAL_CLOSURE, effects);
        }
    }

    fn on_pong_overdue(&mut self, now: Instant, effects: &mut Vec<Effect>) {
        if !self.state.is_connected() {
            return;
        }
        if self.is_fresh(now) {
            // A single dropped reply is tolerated while the last pong is recent enough
            #[cfg(feature = "tracing")]
            tracing::debug!("Pong overdue but connection still within staleness bound");
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::warn!("Heartbeat timed out, closing stale chat connection");
        effects.push(Effect::Close(HEARTBEAT_TIMEOUT));
        self.live = false;
        self.after_close(HEARTBEAT_TIMEOUT, effects);
    }

    fn on_resumed(&mut self, now: Instant, effects: &mut Vec<Effect>) {
        match self.state {
            ConnectionState::Connected { .. } if !self.is_fresh(now) => {
                #[cfg(feature = "tracing")]
                tracing::info!("Stale chat connection after resume, reconnecting now");
                effects.push(Effect::Cancel(Timer::Heartbeat));
                effects.push(Effect::Cancel(Timer::PongTimeout));
                effects.push(Effect::Close(STALE_ON_RESUME));
                self.live = false;
                self.open(effects);
            }
            ConnectionState::Reconnecting { .. } if !self.live => {
                effects.push(Effect::Cancel(Timer::Reconnect));
                self.open(effects);
            }
            _ => {}
        }
    }

    fn on_dispose(&mut self, effects: &mut Vec<Effect>) {
        self.disposed = true;
        self.state = ConnectionState::Disconnected;
        self.queue.clear();

        effects.push(Effect::Cancel(Timer::Heartbeat));
        effects.push(Effect::Cancel(Timer::PongTimeout));
        effects.push(Effect::Cancel(Timer::Reconnect));
        if self.live {
            self.live = false;
            effects.push(Effect::Close(NORMAL_CLOSURE));
        }
    }
}
