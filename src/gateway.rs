use rand::{RngCore, rngs::OsRng};
use tracing::info;

use crate::api::ApiClient;
use crate::error::SessionError;
use crate::realtime::UpdateStream;
use crate::session::{ChatLookup, ChatRef, ForumTopic, HistoryMessage, HistoryRequest, IncomingMessage, Session};

/// [`Session`] backed by the platform gateway: HTTP calls for queries and
/// sends, a websocket for the event stream.
pub struct GatewaySession {
    api: ApiClient,
    realtime_url: String,
    token: String,
    updates: Option<UpdateStream>,
}

impl GatewaySession {
    pub fn new(api_base_url: String, realtime_url: String, token: String) -> Self {
        Self {
            api: ApiClient::new(api_base_url, token.clone()),
            realtime_url,
            token,
            updates: None,
        }
    }
}

impl Session for GatewaySession {
    async fn resolve_chat(&mut self, lookup: &ChatLookup) -> Result<ChatRef, SessionError> {
        self.api.resolve_chat(lookup).await
    }

    async fn list_dialogs(&mut self) -> Result<Vec<ChatRef>, SessionError> {
        self.api.get_dialogs().await
    }

    async fn list_forum_topics(&mut self, chat: &ChatRef) -> Result<Vec<ForumTopic>, SessionError> {
        self.api.get_forum_topics(chat).await
    }

    async fn get_history(&mut self, request: &HistoryRequest) -> Result<Vec<HistoryMessage>, SessionError> {
        self.api.get_history(request).await
    }

    async fn can_send(&mut self, chat: &ChatRef) -> Result<bool, SessionError> {
        self.api.can_send_messages(chat).await
    }

    async fn send_message(&mut self, chat: &ChatRef, text: &str) -> Result<i64, SessionError> {
        let random_id = OsRng.next_u64() as i64;
        self.api.send_message(chat, text, random_id).await
    }

    /// Connects on first use. A failed stream is dropped and reconnected on
    /// the following call; malformed frames keep the connection.
    async fn next_event(&mut self) -> Result<Option<IncomingMessage>, SessionError> {
        if self.updates.is_none() {
            let stream = UpdateStream::connect(&self.realtime_url, &self.token).await?;
            info!(url = %self.realtime_url, "subscribed to new messages");
            self.updates = Some(stream);
        }
        let Some(updates) = self.updates.as_mut() else {
            return Err(SessionError::ConnectionClosed);
        };

        match updates.next_message().await {
            Ok(message) => Ok(Some(message)),
            Err(error @ SessionError::Protocol(_)) => Err(error),
            Err(error) => {
                self.updates = None;
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    use super::*;

    const OPEN: &str = r#"{"type": "connectionOpen"}"#;
    const NEW_MESSAGE: &str = r#"{
        "type": "newMessage",
        "chat": {"id": 123, "type": "supergroup", "title": "Group"},
        "message": {"id": 55, "date": 1700000000, "text": "hello"}
    }"#;

    /// How the local server treats each connection, in accept order.
    struct Script {
        frames: Vec<&'static str>,
        close: bool,
    }

    /// Serves one script per accepted connection and counts connections.
    async fn serve(scripts: Vec<Script>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let url = format!("ws://{}", listener.local_addr().expect("local addr"));
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);

        tokio::spawn(async move {
            for script in scripts {
                let Ok((tcp, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let mut ws = tokio_tungstenite::accept_async(tcp).await.expect("server handshake");
                let _init = ws.next().await;
                for frame in script.frames {
                    ws.send(WsMessage::Text(frame.to_string())).await.expect("send frame");
                }
                if script.close {
                    let _ = ws.close(None).await;
                } else {
                    while ws.next().await.is_some() {}
                }
            }
        });

        (url, accepted)
    }

    fn session(realtime_url: String) -> GatewaySession {
        GatewaySession::new("http://127.0.0.1:9".into(), realtime_url, "token".into())
    }

    async fn next(session: &mut GatewaySession) -> Result<Option<IncomingMessage>, SessionError> {
        tokio::time::timeout(Duration::from_secs(5), session.next_event())
            .await
            .expect("event within timeout")
    }

    #[tokio::test]
    async fn malformed_frames_keep_the_connection() {
        let (url, accepted) = serve(vec![Script {
            frames: vec![OPEN, "not json", NEW_MESSAGE],
            close: false,
        }])
        .await;
        let mut session = session(url);

        assert!(matches!(next(&mut session).await, Err(SessionError::Protocol(_))));
        let event = next(&mut session).await.expect("event").expect("open stream");
        assert_eq!(event.message_id, 55);
        assert_eq!(event.chat.normalized_id(), -100123);
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closed_streams_reconnect_on_the_next_call() {
        let (url, accepted) = serve(vec![
            Script {
                frames: vec![OPEN],
                close: true,
            },
            Script {
                frames: vec![OPEN, NEW_MESSAGE],
                close: false,
            },
        ])
        .await;
        let mut session = session(url);

        assert!(matches!(next(&mut session).await, Err(SessionError::ConnectionClosed)));
        assert!(session.updates.is_none());
        let event = next(&mut session).await.expect("event").expect("open stream");
        assert_eq!(event.message_id, 55);
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn garbage_during_the_handshake_is_not_a_bad_event() {
        let (url, accepted) = serve(vec![Script {
            frames: vec!["not json"],
            close: false,
        }])
        .await;
        let mut session = session(url);

        assert!(matches!(next(&mut session).await, Err(SessionError::Handshake(_))));
        assert!(session.updates.is_none());
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }
}
