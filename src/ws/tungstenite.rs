//! [`Connector`] backed by `tokio-tungstenite`.

use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::session::NO_STATUS_RECEIVED;
use super::transport::{Connector, Link, Transport, TransportEvent};
use crate::Result;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsReadError = tokio_tungstenite::tungstenite::Error;

/// Opens plain or TLS WebSocket connections.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

struct TungsteniteTransport {
    write: SplitSink<WsStream, Message>,
}

#[async_trait]
impl Transport for TungsteniteTransport {
    async fn send(&mut self, frame: String) -> Result<()> {
        self.write.send(Message::Text(frame.into())).await?;
        Ok(())
    }

    async fn close(&mut self, code: u16) -> Result<()> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: "".into(),
        };
        self.write.send(Message::Close(Some(frame))).await?;
        self.write.close().await?;
        Ok(())
    }
}

fn to_event(message: std::result::Result<Message, WsReadError>) -> Option<TransportEvent> {
    match message {
        Ok(Message::Text(text)) => Some(TransportEvent::Message(text.to_string())),
        Ok(Message::Close(frame)) => Some(TransportEvent::Closed {
            code: frame.map_or(NO_STATUS_RECEIVED, |frame| u16::from(frame.code)),
        }),
        Err(e) => Some(TransportEvent::Error(e.to_string())),
        // Binary frames and protocol-level ping/pong carry nothing for the session
        Ok(_) => None,
    }
}

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, endpoint: &Url) -> Result<Link> {
        let (ws_stream, _) = connect_async(endpoint.as_str()).await?;
        let (write, read) = ws_stream.split();

        let events = read
            .filter_map(|message| async move { to_event(message) })
            .boxed();

        Ok(Link::new(Box::new(TungsteniteTransport { write }), events))
    }
}
