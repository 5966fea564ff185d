//! Core WebSocket infrastructure.
//!
//! This module provides generic connection management that can be specialized for
//! different message types using traits and the strategy pattern.
//!
//! # Architecture
//!
//! - [`Session`]: Pure connection state machine (events in, effects out)
//! - [`ConnectionManager`]: Background driver that executes the session's effects against a
//!   real transport, with heartbeat, reconnection and offline buffering
//! - [`Connector`] / [`Transport`]: Capability interface a socket library plugs into
//! - [`MessageParser`]: Trait for parsing incoming WebSocket messages
//!
//! # Example
//!
//! ```ignore
//! let connection = ConnectionManager::new(endpoint, Config::default(), ChatParser, connector);
//! connection.connect()?;
//! connection.send(&request)?;
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod session;
pub mod traits;
pub mod transport;
#[cfg(feature = "ws")]
pub mod tungstenite;

pub use connection::{ConnectionManager, SendOutcome};
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use session::{ConnectionState, Notice, Session};
pub use traits::*;
pub use transport::{Connector, Link, Transport, TransportEvent};
#[cfg(feature = "ws")]
pub use tungstenite::TungsteniteConnector;
