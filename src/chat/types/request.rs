use bon::Builder;
use serde::Serialize;

use super::RoomId;

/// Outbound chat frame, tagged by its `action` field.
#[non_exhaustive]
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ChatRequest {
    /// Post a message to a room
    SendMessage(SendMessage),
}

impl ChatRequest {
    /// Create a request that posts `message` to `room_id`.
    #[must_use]
    pub fn send_message<R: Into<RoomId>, S: Into<String>>(room_id: R, message: S) -> Self {
        Self::SendMessage(
            SendMessage::builder()
                .room_id(room_id)
                .message(message)
                .build(),
        )
    }
}

impl From<SendMessage> for ChatRequest {
    fn from(request: SendMessage) -> Self {
        Self::SendMessage(request)
    }
}

/// Body of a `send_message` action.
#[non_exhaustive]
#[derive(Clone, Debug, Serialize, Builder)]
pub struct SendMessage {
    /// Room the message goes to
    #[builder(into)]
    pub room_id: RoomId,
    /// Message text
    #[builder(into)]
    pub message: String,
}
