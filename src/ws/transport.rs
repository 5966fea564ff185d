//! Capability interface between the connection manager and a concrete socket.
//!
//! The manager never touches a socket library directly. It asks a [`Connector`] for a
//! [`Link`], writes through the link's [`Transport`], and reads [`TransportEvent`]s from the
//! link's event stream. Tests plug in an in-memory connector here.

use async_trait::async_trait;
use futures::stream::BoxStream;
use url::Url;

use crate::Result;

/// Something that happened on an open transport.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A text frame arrived
    Message(String),
    /// The transport closed with the given close code
    Closed {
        /// WebSocket close code reported by the peer or the socket layer
        code: u16,
    },
    /// The transport reported an error; a close usually follows
    Error(String),
}

/// Write half of an open transport.
#[async_trait]
pub trait Transport: Send {
    /// Transmit one text frame.
    async fn send(&mut self, frame: String) -> Result<()>;

    /// Start a close handshake with the given close code.
    async fn close(&mut self, code: u16) -> Result<()>;
}

/// Opens transports to an endpoint.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new transport to `endpoint`.
    async fn connect(&self, endpoint: &Url) -> Result<Link>;
}

/// An open transport: its write half plus the stream of events from the read half.
pub struct Link {
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) events: BoxStream<'static, TransportEvent>,
}

impl Link {
    #[must_use]
    pub fn new(transport: Box<dyn Transport>, events: BoxStream<'static, TransportEvent>) -> Self {
        Self { transport, events }
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").finish_non_exhaustive()
    }
}
