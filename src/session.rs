//! The session capability the core runs against.
//!
//! Everything the fetcher, monitor, snapshot and send paths need from the
//! platform goes through [`Session`]. The concrete network implementation
//! lives in `gateway`; tests use [`fake::FakeSession`].

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::SessionError;
use crate::normalize;

/// Matches `t.me/name`, `https://t.me/name` and `@name`.
static USERNAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(?:https?://)?t\.me/|@)?([A-Za-z][A-Za-z0-9_]{2,31})/?$").expect("valid username regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Private,
    Group,
    Supergroup,
    Broadcast,
    #[serde(rename = "forum")]
    ForumSupergroup,
}

impl ChatKind {
    /// Supergroups, broadcast channels and forums share the marker-prefixed id space.
    pub fn is_large_container(self) -> bool {
        matches!(
            self,
            ChatKind::Supergroup | ChatKind::Broadcast | ChatKind::ForumSupergroup
        )
    }

    pub fn is_forum(self) -> bool {
        self == ChatKind::ForumSupergroup
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChatKind::Private => "private",
            ChatKind::Group => "group",
            ChatKind::Supergroup => "supergroup",
            ChatKind::Broadcast => "broadcast",
            ChatKind::ForumSupergroup => "forum",
        }
    }
}

impl fmt::Display for ChatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A chat as observed at resolution time. `kind` never changes afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRef {
    pub raw_id: i64,
    pub kind: ChatKind,
    pub title: Option<String>,
    pub username: Option<String>,
}

impl ChatRef {
    pub fn normalized_id(&self) -> i64 {
        normalize::normalize(self)
    }

    /// Title, then `@username`, then the normalized id.
    pub fn display_name(&self) -> String {
        if let Some(title) = self.title.as_deref().map(str::trim).filter(|title| !title.is_empty()) {
            return title.to_string();
        }
        if let Some(username) = self.username.as_deref().filter(|name| !name.is_empty()) {
            return format!("@{username}");
        }
        self.normalized_id().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicRef {
    pub forum_chat_id: i64,
    pub topic_id: i64,
}

impl TopicRef {
    /// Topic thread of a message, if the chat is a forum and the message sits
    /// in a thread. The top-level anchor wins over the direct reply target.
    pub fn derive(chat: &ChatRef, reply: Option<&ReplyHeader>) -> Option<TopicRef> {
        if !chat.kind.is_forum() {
            return None;
        }
        let reply = reply?;
        let topic_id = reply.reply_to_top_id.or(reply.reply_to_msg_id)?;
        Some(TopicRef {
            forum_chat_id: chat.normalized_id(),
            topic_id,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyHeader {
    pub reply_to_msg_id: Option<i64>,
    pub reply_to_top_id: Option<i64>,
}

/// A new message delivered on the live event stream.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    pub chat: ChatRef,
    pub message_id: i64,
    pub date: DateTime<Utc>,
    pub text: String,
    pub sender_id: Option<i64>,
    pub reply: Option<ReplyHeader>,
}

/// One entry of a chat's history, in the shape written to the history file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryMessage {
    pub id: i64,
    pub date: DateTime<Utc>,
    pub text: String,
    pub sender_id: Option<i64>,
    pub reply_to: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRequest {
    pub chat: ChatRef,
    pub topic_id: Option<i64>,
    /// Only messages older than this id; 0 starts from the newest.
    pub offset_id: i64,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForumTopic {
    pub id: i64,
    pub title: String,
}

/// How an operator refers to a chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatLookup {
    Id(i64),
    Username(String),
}

#[derive(Debug, thiserror::Error)]
#[error("not a chat id or username: {0:?}")]
pub struct ChatLookupError(String);

impl FromStr for ChatLookup {
    type Err = ChatLookupError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let raw = input.trim();
        if let Ok(id) = raw.parse::<i64>() {
            return Ok(ChatLookup::Id(id));
        }
        USERNAME_RE
            .captures(raw)
            .map(|caps| ChatLookup::Username(caps[1].to_string()))
            .ok_or_else(|| ChatLookupError(raw.to_string()))
    }
}

impl fmt::Display for ChatLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatLookup::Id(id) => write!(f, "{id}"),
            ChatLookup::Username(name) => write!(f, "@{name}"),
        }
    }
}

/// An authenticated, connected account handle.
///
/// Operations take `&mut self`: one core action holds the handle at a time.
pub trait Session {
    async fn resolve_chat(&mut self, lookup: &ChatLookup) -> Result<ChatRef, SessionError>;

    async fn list_dialogs(&mut self) -> Result<Vec<ChatRef>, SessionError>;

    async fn list_forum_topics(&mut self, chat: &ChatRef) -> Result<Vec<ForumTopic>, SessionError>;

    /// Newest-first page of messages older than `request.offset_id`.
    async fn get_history(&mut self, request: &HistoryRequest) -> Result<Vec<HistoryMessage>, SessionError>;

    async fn can_send(&mut self, chat: &ChatRef) -> Result<bool, SessionError>;

    /// Returns the id of the sent message.
    async fn send_message(&mut self, chat: &ChatRef, text: &str) -> Result<i64, SessionError>;

    /// Waits for the next new-message event. `None` once the stream has closed.
    async fn next_event(&mut self) -> Result<Option<IncomingMessage>, SessionError>;
}

/// Runs `call` until it returns something other than a rate limit, sleeping
/// for the advertised wait in between. Rate limits never surface as errors.
pub async fn retry_rate_limited<T>(
    operation: &'static str,
    mut call: impl AsyncFnMut() -> Result<T, SessionError>,
) -> Result<T, SessionError> {
    loop {
        let error = match call().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        let Some(wait) = error.rate_limit_wait() else {
            return Err(error);
        };
        warn!(operation, retry_after_secs = wait.as_secs(), "rate limited, waiting");
        tokio::time::sleep(wait).await;
    }
}

#[cfg(test)]
pub mod fake {
    use std::collections::{HashMap, VecDeque};

    use chrono::TimeZone;

    use super::*;

    pub fn chat(raw_id: i64, kind: ChatKind, title: &str) -> ChatRef {
        ChatRef {
            raw_id,
            kind,
            title: Some(title.to_string()),
            username: None,
        }
    }

    pub fn history_message(id: i64) -> HistoryMessage {
        HistoryMessage {
            id,
            date: Utc
                .timestamp_opt(1_700_000_000 + id, 0)
                .single()
                .expect("valid timestamp"),
            text: format!("message {id}"),
            sender_id: Some(42),
            reply_to: None,
        }
    }

    /// Scripted in-memory session.
    #[derive(Default)]
    pub struct FakeSession {
        pub chats: Vec<ChatRef>,
        pub topics: HashMap<i64, Result<Vec<ForumTopic>, ()>>,
        /// Newest-first backing history, each with the topic it belongs to.
        pub history: Vec<(Option<i64>, HistoryMessage)>,
        /// Errors to return instead of a page, keyed by 0-based request index.
        pub history_errors: HashMap<usize, SessionError>,
        pub history_requests: Vec<HistoryRequest>,
        pub request_times: Vec<tokio::time::Instant>,
        pub denied: Vec<i64>,
        pub send_errors: VecDeque<SessionError>,
        pub sent: Vec<(i64, String)>,
        pub events: VecDeque<Result<IncomingMessage, SessionError>>,
        /// Keep the stream open once `events` is drained instead of closing it.
        pub hold_open: bool,
        pub topic_errors: VecDeque<SessionError>,
        /// Errors returned ahead of the normal answer, keyed by method name
        /// (`resolve_chat`, `list_dialogs`, `can_send`).
        pub call_errors: HashMap<&'static str, VecDeque<SessionError>>,
    }

    impl FakeSession {
        pub fn with_history(ids: impl IntoIterator<Item = i64>) -> Self {
            let mut history: Vec<_> = ids.into_iter().map(|id| (None, history_message(id))).collect();
            history.sort_by(|a, b| b.1.id.cmp(&a.1.id));
            Self {
                history,
                ..Self::default()
            }
        }

        pub fn fail_next(&mut self, method: &'static str, error: SessionError) {
            self.call_errors.entry(method).or_default().push_back(error);
        }

        fn scripted_error(&mut self, method: &'static str) -> Result<(), SessionError> {
            match self.call_errors.get_mut(method).and_then(VecDeque::pop_front) {
                Some(error) => Err(error),
                None => Ok(()),
            }
        }
    }

    impl Session for FakeSession {
        async fn resolve_chat(&mut self, lookup: &ChatLookup) -> Result<ChatRef, SessionError> {
            self.scripted_error("resolve_chat")?;
            self.chats
                .iter()
                .find(|chat| match lookup {
                    ChatLookup::Id(id) => chat.raw_id == *id || chat.normalized_id() == *id,
                    ChatLookup::Username(name) => chat.username.as_deref() == Some(name.as_str()),
                })
                .cloned()
                .ok_or_else(|| SessionError::NotFound(lookup.to_string()))
        }

        async fn list_dialogs(&mut self) -> Result<Vec<ChatRef>, SessionError> {
            self.scripted_error("list_dialogs")?;
            Ok(self.chats.clone())
        }

        async fn list_forum_topics(&mut self, chat: &ChatRef) -> Result<Vec<ForumTopic>, SessionError> {
            if let Some(error) = self.topic_errors.pop_front() {
                return Err(error);
            }
            match self.topics.get(&chat.raw_id) {
                Some(Ok(topics)) => Ok(topics.clone()),
                Some(Err(())) => Err(SessionError::Forbidden("topics".into())),
                None => Ok(Vec::new()),
            }
        }

        async fn get_history(&mut self, request: &HistoryRequest) -> Result<Vec<HistoryMessage>, SessionError> {
            let index = self.history_requests.len();
            self.history_requests.push(request.clone());
            self.request_times.push(tokio::time::Instant::now());
            if let Some(error) = self.history_errors.remove(&index) {
                return Err(error);
            }
            Ok(self
                .history
                .iter()
                .filter(|(_, message)| request.offset_id == 0 || message.id < request.offset_id)
                .filter(|(topic, _)| request.topic_id.is_none() || *topic == request.topic_id)
                .take(request.limit)
                .map(|(_, message)| message.clone())
                .collect())
        }

        async fn can_send(&mut self, chat: &ChatRef) -> Result<bool, SessionError> {
            self.scripted_error("can_send")?;
            Ok(!self.denied.contains(&chat.raw_id))
        }

        async fn send_message(&mut self, chat: &ChatRef, text: &str) -> Result<i64, SessionError> {
            if let Some(error) = self.send_errors.pop_front() {
                return Err(error);
            }
            self.sent.push((chat.normalized_id(), text.to_string()));
            Ok(1000 + self.sent.len() as i64)
        }

        async fn next_event(&mut self) -> Result<Option<IncomingMessage>, SessionError> {
            match self.events.pop_front() {
                Some(Ok(event)) => Ok(Some(event)),
                Some(Err(error)) => Err(error),
                None if self.hold_open => std::future::pending().await,
                None => Ok(None),
            }
        }
    }
}
