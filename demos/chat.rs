//! Chat session walkthrough.
//!
//! Connects as a user, posts a message to a room, and logs room events, connection state
//! changes and notices until Ctrl-C.
//!
//! Run with tracing enabled:
//! ```sh
//! PETSITTER_CHAT_URL=ws://localhost:8000/ws/chat/ RUST_LOG=info \
//!     cargo run --example chat --features ws,tracing -- u1 12
//! ```

use futures::StreamExt as _;
use petsitter_chat::ENDPOINT_VAR;
use petsitter_chat::chat::{Client, RoomId};
use petsitter_chat::ws::config::Config;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let endpoint =
        std::env::var(ENDPOINT_VAR).unwrap_or_else(|_| "ws://localhost:8000/ws/chat/".to_owned());
    let mut args = std::env::args().skip(1);
    let user_id = args.next().unwrap_or_else(|| "u1".to_owned());
    let room_id: RoomId = args
        .next()
        .map_or(RoomId::Number(1), |room| match room.parse::<u64>() {
            Ok(id) => RoomId::Number(id),
            Err(_) => RoomId::Text(room),
        });

    let client = Client::new(&endpoint, Config::default())?.identify(user_id.as_str())?;
    info!(%endpoint, user_id = %client.user_id(), "Chat session started");

    let outcome = client.send_message(room_id.clone(), "Hello from the demo")?;
    info!(?outcome, room_id = %room_id, "Posted greeting");

    let mut states = client.state_receiver();
    let mut notices = client.notices();
    let mut room = Box::pin(client.room_events(room_id.clone()));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                info!(%state, "Connection state");
            }
            notice = notices.recv() => match notice {
                Ok(notice) => warn!(%notice, "Connection notice"),
                Err(RecvError::Lagged(count)) => warn!(count, "Missed connection notices"),
                Err(RecvError::Closed) => break,
            },
            event = room.next() => match event {
                Some(Ok(event)) => info!(
                    event_type = %event.event_type,
                    message = ?event.message_text(),
                    "Room event"
                ),
                Some(Err(e)) => warn!(error = %e, "Room stream error"),
                None => break,
            },
        }
    }

    let client = client.sign_out();
    info!(base = %client.base_url(), "Signed out");

    Ok(())
}
