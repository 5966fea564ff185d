#![expect(
    clippy::module_name_repetitions,
    reason = "Re-exported names intentionally match their modules for API clarity"
)]

//! Real-time chat client for the pet-sitting marketplace.
//!
//! A [`Client`] starts out [`Anonymous`](state::Anonymous). Identifying a user opens one
//! chat session for that user: the [`ChatConnection`] keeps it alive across network drops,
//! buffers messages sent while offline and streams inbound events.
//!
//! # Example
//!
//! ```rust, no_run
//! use petsitter_chat::chat::Client;
//! use petsitter_chat::ws::config::Config;
//! use futures::StreamExt as _;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = Client::new("wss://chat.petsitter.app/ws", Config::default())?
//!         .identify("u1")?;
//!
//!     let mut events = Box::pin(client.events());
//!     while let Some(event) = events.next().await {
//!         println!("{:?}", event?);
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod state;
pub mod types;

// Re-export commonly used types
pub use client::{ChatConnection, ChatParser, Client};
pub use types::request::{ChatRequest, SendMessage};
pub use types::response::{NEW_MESSAGE_EVENT, ServerEvent, parse_events};
pub use types::{RoomId, UserId};
