#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod chat;
pub mod error;
pub mod ws;

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Environment variable the demo reads the chat endpoint from.
pub const ENDPOINT_VAR: &str = "PETSITTER_CHAT_URL";
