use serde::Serialize;
use tracing::{info, warn};

use crate::error::SessionError;
use crate::session::{ChatLookup, ChatRef, Session, retry_rate_limited};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum SendOutcome {
    #[serde(rename_all = "camelCase")]
    Sent { chat_id: i64, message_id: i64 },
    NotFound,
    Forbidden,
    EmptyText,
}

impl SendOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, SendOutcome::Sent { .. })
    }
}

/// Resolves the chat, checks that the account may post there, then sends.
///
/// Unknown chats and missing permissions are outcomes, not errors.
pub async fn send_message<S: Session>(
    session: &mut S,
    lookup: &ChatLookup,
    text: &str,
) -> Result<SendOutcome, SessionError> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(SendOutcome::EmptyText);
    }

    let chat = match retry_rate_limited("resolve chat", async || session.resolve_chat(lookup).await).await {
        Ok(chat) => chat,
        Err(error) if error.is_not_found() => {
            warn!(%lookup, "chat not found");
            return Ok(SendOutcome::NotFound);
        }
        Err(error) => return Err(error),
    };

    match retry_rate_limited("check permissions", async || session.can_send(&chat).await).await {
        Ok(true) => {}
        Ok(false) => return Ok(denied(&chat)),
        Err(error) if error.is_forbidden() => return Ok(denied(&chat)),
        Err(error) => return Err(error),
    }

    match retry_rate_limited("send message", async || session.send_message(&chat, text).await).await {
        Ok(message_id) => {
            info!(chat_id = chat.normalized_id(), message_id, "message sent");
            Ok(SendOutcome::Sent {
                chat_id: chat.normalized_id(),
                message_id,
            })
        }
        Err(error) if error.is_forbidden() => Ok(denied(&chat)),
        Err(error) => Err(error),
    }
}

fn denied(chat: &ChatRef) -> SendOutcome {
    warn!(chat_id = chat.normalized_id(), "no permission to post in chat");
    SendOutcome::Forbidden
}
