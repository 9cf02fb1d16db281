use serde::Serialize;
use tracing::{info, warn};

use crate::error::SessionError;
use crate::session::{ChatKind, ChatRef, ForumTopic, Session, retry_rate_limited};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatSummary {
    pub name: String,
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: ChatKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topics: Option<Vec<ForumTopic>>,
}

/// Lists every dialog, with the topic list of each forum.
pub async fn snapshot_chats<S: Session>(session: &mut S) -> Result<Vec<ChatSummary>, SessionError> {
    let dialogs = retry_rate_limited("list dialogs", async || session.list_dialogs().await).await?;
    info!(dialogs = dialogs.len(), "building chat snapshot");

    let mut summaries = Vec::with_capacity(dialogs.len());
    for chat in dialogs {
        let topics = if chat.kind.is_forum() {
            Some(forum_topics(session, &chat).await?)
        } else {
            None
        };
        summaries.push(ChatSummary {
            name: chat.display_name(),
            id: chat.normalized_id(),
            kind: chat.kind,
            topics,
        });
    }
    Ok(summaries)
}

async fn forum_topics<S: Session>(session: &mut S, chat: &ChatRef) -> Result<Vec<ForumTopic>, SessionError> {
    match retry_rate_limited("list forum topics", async || session.list_forum_topics(chat).await).await {
        Err(SessionError::Forbidden(reason)) => {
            warn!(chat_id = chat.normalized_id(), %reason, "topics are not accessible");
            Ok(Vec::new())
        }
        result => result,
    }
}
