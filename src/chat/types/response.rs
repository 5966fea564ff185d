use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::RoomId;
use crate::ws::WsError;

/// `type` of the event the server pushes when a message lands in a room.
pub const NEW_MESSAGE_EVENT: &str = "new_message";

/// Inbound chat envelope.
///
/// Only `type` and `room_id` are interpreted; everything else is kept verbatim in
/// [`ServerEvent::fields`] for the caller.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServerEvent {
    /// Event kind (e.g. `new_message`, `info`, `error`)
    #[serde(rename = "type")]
    pub event_type: String,
    /// Room the event belongs to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    /// Remaining event-specific fields
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ServerEvent {
    /// Whether this is a new-message notice.
    #[must_use]
    pub fn is_new_message(&self) -> bool {
        self.event_type == NEW_MESSAGE_EVENT
    }

    /// Whether this event belongs to `room_id`. A string `"12"` on the wire matches room `12`.
    #[must_use]
    pub fn is_for_room(&self, room_id: &RoomId) -> bool {
        self.room_id.as_ref().is_some_and(|id| id.matches(room_id))
    }

    /// Look up an event-specific field.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// The `message` field, when it is a string.
    #[must_use]
    pub fn message_text(&self) -> Option<&str> {
        self.field("message").and_then(Value::as_str)
    }
}

/// Parse one inbound frame into events. Accepts a single object or an array of objects.
pub fn parse_events(bytes: &[u8]) -> crate::Result<Vec<ServerEvent>> {
    // Handle empty or whitespace-only input (server keepalive messages)
    let trimmed = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .map_or(&[][..], |start| &bytes[start..]);

    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    if trimmed.first() == Some(&b'[') {
        Ok(serde_json::from_slice(trimmed).map_err(WsError::MessageParse)?)
    } else {
        let event: ServerEvent = serde_json::from_slice(trimmed).map_err(WsError::MessageParse)?;
        Ok(vec![event])
    }
}
