use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::debug;
use url::Url;

use crate::api::{WireChat, WireMessage};
use crate::error::SessionError;
use crate::session::{ChatRef, IncomingMessage};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionInit<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    token: &'a str,
    client_version: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum ServerFrame {
    ConnectionOpen,
    ConnectionError {
        #[serde(default)]
        message: String,
    },
    NewMessage {
        chat: WireChat,
        message: WireMessage,
    },
    #[serde(other)]
    Other,
}

/// Websocket subscription to the account's new-message events.
pub struct UpdateStream {
    ws: tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
}

impl UpdateStream {
    pub async fn connect(url: &str, token: &str) -> Result<Self, SessionError> {
        let url = Url::parse(url)?;
        let (ws, _) = connect_async(url).await?;
        let mut stream = Self { ws };

        stream.send_connection_init(token).await?;
        // A bad frame here means the stream never opened, not a bad event.
        stream.wait_for_connection_open().await.map_err(|error| match error {
            SessionError::Protocol(error) => SessionError::Handshake(error.to_string()),
            other => other,
        })?;
        debug!("update stream open");
        Ok(stream)
    }

    /// Next new-message event. Frames of other types are skipped.
    pub async fn next_message(&mut self) -> Result<IncomingMessage, SessionError> {
        loop {
            match self.read_frame().await? {
                ServerFrame::NewMessage { chat, message } => return Ok(incoming(chat, message)),
                ServerFrame::ConnectionError { message } => return Err(connection_error(message)),
                ServerFrame::ConnectionOpen | ServerFrame::Other => {}
            }
        }
    }

    async fn send_connection_init(&mut self, token: &str) -> Result<(), SessionError> {
        let init = ConnectionInit {
            kind: "connectionInit",
            token,
            client_version: env!("CARGO_PKG_VERSION"),
        };
        let payload = serde_json::to_string(&init)?;
        self.ws.send(WsMessage::Text(payload)).await?;
        Ok(())
    }

    async fn wait_for_connection_open(&mut self) -> Result<(), SessionError> {
        loop {
            match self.read_frame().await? {
                ServerFrame::ConnectionOpen => return Ok(()),
                ServerFrame::ConnectionError { message } => return Err(connection_error(message)),
                _ => {}
            }
        }
    }

    async fn read_frame(&mut self) -> Result<ServerFrame, SessionError> {
        loop {
            let message = self.ws.next().await.ok_or(SessionError::ConnectionClosed)??;
            match message {
                WsMessage::Text(text) => return Ok(serde_json::from_str(&text)?),
                WsMessage::Binary(data) => return Ok(serde_json::from_slice(&data)?),
                WsMessage::Close(_) => return Err(SessionError::ConnectionClosed),
                WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
                _ => continue,
            }
        }
    }
}

fn incoming(chat: WireChat, message: WireMessage) -> IncomingMessage {
    IncomingMessage {
        chat: ChatRef::from(chat),
        message_id: message.id,
        date: message.date,
        text: message.text,
        sender_id: message.sender_id,
        reply: message.reply_to,
    }
}

fn connection_error(message: String) -> SessionError {
    if message.is_empty() {
        return SessionError::ConnectionClosed;
    }
    SessionError::Api {
        code: 0,
        description: message,
    }
}
