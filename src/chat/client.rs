use std::sync::Arc;

use async_stream::try_stream;
use futures::Stream;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use url::Url;

use super::state::{Anonymous, Identified, State};
use super::types::request::ChatRequest;
use super::types::response::{ServerEvent, parse_events};
use super::types::{RoomId, UserId};
use crate::Result;
use crate::error::Error;
use crate::ws::config::Config;
use crate::ws::{
    ConnectionManager, ConnectionState, Connector, MessageParser, Notice, SendOutcome, WsError,
};

/// Connection manager specialised for chat frames.
pub type ChatConnection = ConnectionManager<ServerEvent, ChatParser>;

/// Parses inbound chat frames into [`ServerEvent`]s.
#[non_exhaustive]
#[derive(Clone, Debug, Default)]
pub struct ChatParser;

impl MessageParser<ServerEvent> for ChatParser {
    fn parse(&self, bytes: &[u8]) -> Result<Vec<ServerEvent>> {
        parse_events(bytes)
    }
}

/// Real-time chat client for the marketplace.
///
/// - [`Client<Anonymous>`]: no user, no connection
/// - [`Client<Identified>`]: one live session for one user
///
/// Switching users means signing out and identifying again, which tears down the old
/// session and starts a new one.
///
/// # Example
///
/// ```rust, no_run
/// use petsitter_chat::chat::Client;
/// use petsitter_chat::ws::config::Config;
/// use futures::StreamExt as _;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = Client::new("wss://chat.petsitter.app/ws", Config::default())?;
/// let client = client.identify("u1")?;
///
/// client.send_message(12_u64, "Is Biscuit still eating well?")?;
///
/// let mut stream = Box::pin(client.room_events(12_u64));
/// while let Some(event) = stream.next().await {
///     println!("{:?}", event?);
/// }
/// # Ok(())
/// # }
/// ```
pub struct Client<S: State = Anonymous> {
    /// Base endpoint for the WebSocket, without the user parameter
    base: Url,
    /// Configuration for every session this client opens
    config: Config,
    /// Opens transports for new sessions
    connector: Arc<dyn Connector>,
    /// Current state of the client
    state: S,
}

impl<S: State + std::fmt::Debug> std::fmt::Debug for Client<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("base", &self.base.as_str())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

fn parse_base(base_url: &str) -> Result<Url> {
    let base = Url::parse(base_url)?;
    if !matches!(base.scheme(), "ws" | "wss") {
        return Err(Error::validation(format!(
            "chat endpoint must use ws or wss, got {}",
            base.scheme()
        )));
    }
    Ok(base)
}

/// `<base>?user_id=<id>`, keeping any query parameters the base already has.
fn session_endpoint(base: &Url, user_id: &UserId) -> Url {
    let mut endpoint = base.clone();
    endpoint
        .query_pairs_mut()
        .append_pair("user_id", user_id.as_str());
    endpoint
}

impl Client<Anonymous> {
    /// Create a client that talks to `base_url` over real WebSockets.
    #[cfg(feature = "ws")]
    pub fn new(base_url: &str, config: Config) -> Result<Self> {
        Self::with_connector(base_url, config, Arc::new(crate::ws::TungsteniteConnector))
    }

    /// Create a client that opens its transports through `connector`.
    pub fn with_connector(
        base_url: &str,
        config: Config,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        Ok(Self {
            base: parse_base(base_url)?,
            config,
            connector,
            state: Anonymous,
        })
    }

    /// Start a chat session for `user_id` and begin connecting.
    pub fn identify<U: Into<UserId>>(self, user_id: U) -> Result<Client<Identified>> {
        let user_id = user_id.into();
        let endpoint = session_endpoint(&self.base, &user_id);

        #[cfg(feature = "tracing")]
        tracing::debug!(%user_id, "Starting chat session");

        let connection = ConnectionManager::new(
            endpoint,
            self.config.clone(),
            ChatParser,
            Arc::clone(&self.connector),
        );
        connection.connect()?;

        Ok(Client {
            base: self.base,
            config: self.config,
            connector: self.connector,
            state: Identified {
                user_id,
                connection,
            },
        })
    }
}

impl Client<Identified> {
    /// End the session and return to the anonymous state.
    #[must_use]
    pub fn sign_out(self) -> Client<Anonymous> {
        #[cfg(feature = "tracing")]
        tracing::debug!(user_id = %self.state.user_id, "Ending chat session");

        self.state.connection.dispose();

        Client {
            base: self.base,
            config: self.config,
            connector: self.connector,
            state: Anonymous,
        }
    }

    /// The user this session belongs to.
    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.state.user_id
    }

    /// The underlying connection manager.
    #[must_use]
    pub fn connection(&self) -> &ChatConnection {
        &self.state.connection
    }

    /// Post `message` to `room_id`. Buffered while offline.
    pub fn send_message<R: Into<RoomId>, T: Into<String>>(
        &self,
        room_id: R,
        message: T,
    ) -> Result<SendOutcome> {
        self.state
            .connection
            .send(&ChatRequest::send_message(room_id, message))
    }

    /// Send any serializable frame over the session.
    pub fn send<R: Serialize>(&self, request: &R) -> Result<SendOutcome> {
        self.state.connection.send(request)
    }

    /// Stream every inbound event except heartbeat replies.
    pub fn events(&self) -> impl Stream<Item = Result<ServerEvent>> + use<> {
        filtered(self.state.connection.subscribe(), |_| true)
    }

    /// Stream the events that belong to `room_id`.
    pub fn room_events<R: Into<RoomId>>(
        &self,
        room_id: R,
    ) -> impl Stream<Item = Result<ServerEvent>> + use<R> {
        let room_id = room_id.into();
        filtered(self.state.connection.subscribe(), move |event| {
            event.is_for_room(&room_id)
        })
    }

    /// Get the current connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.state.connection.state()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state.connection.state_receiver()
    }

    /// Subscribe to advisory notices (reconnecting, reconnected, gave up).
    #[must_use]
    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.state.connection.notices()
    }

    /// Tell the session the app is in the foreground again.
    pub fn notify_visible(&self) -> Result<()> {
        self.state.connection.notify_visible()
    }

    /// Connect again after the session gave up. A no-op while connected.
    pub fn reconnect(&self) -> Result<()> {
        self.state.connection.connect()
    }
}

// Methods available in any state
impl<S: State> Client<S> {
    /// The base endpoint sessions are opened against.
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// The configuration used for new sessions.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }
}

fn filtered<F>(
    mut rx: broadcast::Receiver<ServerEvent>,
    keep: F,
) -> impl Stream<Item = Result<ServerEvent>>
where
    F: Fn(&ServerEvent) -> bool,
{
    try_stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if keep(&event) {
                        yield event;
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("Chat subscription lagged, missed {n} messages");
                    Err(WsError::Lagged { count: n })?;
                }
                Err(RecvError::Closed) => {
                    break;
                }
            }
        }
    }
}
