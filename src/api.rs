use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::SessionError;
use crate::session::{ChatKind, ChatLookup, ChatRef, ForumTopic, HistoryMessage, HistoryRequest, ReplyHeader};

#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    token: String,
    http: Client,
}

impl ApiClient {
    pub fn new(base_url: String, token: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            http: Client::new(),
        }
    }

    pub async fn resolve_chat(&self, lookup: &ChatLookup) -> Result<ChatRef, SessionError> {
        let mut payload = serde_json::Map::new();
        match lookup {
            ChatLookup::Id(id) => payload.insert("chatId".to_string(), json!(id)),
            ChatLookup::Username(name) => payload.insert("username".to_string(), json!(name)),
        };
        let result: ResolveChatResult = self.post("resolveChat", payload).await?;
        Ok(result.chat.into())
    }

    pub async fn get_dialogs(&self) -> Result<Vec<ChatRef>, SessionError> {
        let result: GetDialogsResult = self.post("getDialogs", serde_json::Map::new()).await?;
        Ok(result.chats.into_iter().map(ChatRef::from).collect())
    }

    pub async fn get_forum_topics(&self, chat: &ChatRef) -> Result<Vec<ForumTopic>, SessionError> {
        let mut payload = serde_json::Map::new();
        payload.insert("chatId".to_string(), json!(chat.normalized_id()));
        let result: GetForumTopicsResult = self.post("getForumTopics", payload).await?;
        Ok(result.topics)
    }

    pub async fn get_history(&self, request: &HistoryRequest) -> Result<Vec<HistoryMessage>, SessionError> {
        let mut payload = serde_json::Map::new();
        payload.insert("chatId".to_string(), json!(request.chat.normalized_id()));
        payload.insert("offsetId".to_string(), json!(request.offset_id));
        payload.insert("limit".to_string(), json!(request.limit));
        if let Some(topic_id) = request.topic_id {
            payload.insert("topicId".to_string(), json!(topic_id));
        }
        let result: GetHistoryResult = self.post("getHistory", payload).await?;
        Ok(result.messages.into_iter().map(HistoryMessage::from).collect())
    }

    pub async fn can_send_messages(&self, chat: &ChatRef) -> Result<bool, SessionError> {
        let mut payload = serde_json::Map::new();
        payload.insert("chatId".to_string(), json!(chat.normalized_id()));
        let result: ChatPermissionsResult = self.post("getChatPermissions", payload).await?;
        Ok(result.can_send_messages)
    }

    pub async fn send_message(&self, chat: &ChatRef, text: &str, random_id: i64) -> Result<i64, SessionError> {
        let mut payload = serde_json::Map::new();
        payload.insert("chatId".to_string(), json!(chat.normalized_id()));
        payload.insert("text".to_string(), json!(text));
        payload.insert("randomId".to_string(), json!(random_id));
        let result: SendMessageResult = self.post("sendMessage", payload).await?;
        Ok(result.message_id)
    }

    async fn post<T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        payload: serde_json::Map<String, Value>,
    ) -> Result<T, SessionError> {
        let url = format!("{}/{method}", self.base_url);
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        let retry_after_header = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok());
        let body = response.bytes().await?;

        let envelope: ApiResponse = match serde_json::from_slice(&body) {
            Ok(envelope) => envelope,
            Err(error) if status.is_success() => return Err(SessionError::Protocol(error)),
            Err(_) => {
                let description = status.canonical_reason().unwrap_or("unexpected status").to_string();
                return Err(classify_error(status, None, description, retry_after_header));
            }
        };

        if envelope.ok && status.is_success() {
            let result = envelope.result.unwrap_or(Value::Null);
            return Ok(serde_json::from_value(result)?);
        }

        let retry_after = envelope
            .parameters
            .and_then(|parameters| parameters.retry_after)
            .or(retry_after_header);
        let description = envelope
            .description
            .unwrap_or_else(|| "Unknown error".to_string());
        Err(classify_error(status, envelope.error_code, description, retry_after))
    }
}

/// Maps a failed gateway response onto the session error taxonomy.
pub fn classify_error(
    status: StatusCode,
    error_code: Option<i32>,
    description: String,
    retry_after: Option<u64>,
) -> SessionError {
    let code = error_code.unwrap_or(i32::from(status.as_u16()));
    let flood_wait = description
        .strip_prefix("FLOOD_WAIT_")
        .and_then(|secs| secs.parse::<u64>().ok());

    if let Some(secs) = retry_after.or(flood_wait) {
        return SessionError::RateLimited {
            retry_after: Duration::from_secs(secs),
        };
    }
    if code == 429 {
        return SessionError::RateLimited {
            retry_after: Duration::from_secs(1),
        };
    }
    if code == 403 {
        return SessionError::Forbidden(description);
    }
    let upper = description.to_ascii_uppercase();
    let looks_missing = ["NOT_FOUND", "NOT FOUND", "INVALID", "NOT_OCCUPIED"]
        .iter()
        .any(|needle| upper.contains(needle));
    if code == 404 || (code == 400 && looks_missing) {
        return SessionError::NotFound(description);
    }
    SessionError::Api { code, description }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireChat {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: Option<String>,
    pub username: Option<String>,
    #[serde(default)]
    pub is_forum: bool,
}

impl From<WireChat> for ChatRef {
    fn from(chat: WireChat) -> Self {
        let kind = match chat.kind.as_str() {
            "private" | "user" => ChatKind::Private,
            "channel" | "broadcast" => ChatKind::Broadcast,
            "forum" => ChatKind::ForumSupergroup,
            "supergroup" if chat.is_forum => ChatKind::ForumSupergroup,
            "supergroup" => ChatKind::Supergroup,
            _ => ChatKind::Group,
        };
        ChatRef {
            raw_id: chat.id,
            kind,
            title: chat.title,
            username: chat.username,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub id: i64,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub text: String,
    pub sender_id: Option<i64>,
    pub reply_to: Option<ReplyHeader>,
}

impl From<WireMessage> for HistoryMessage {
    fn from(message: WireMessage) -> Self {
        HistoryMessage {
            id: message.id,
            date: message.date,
            text: message.text,
            sender_id: message.sender_id,
            reply_to: message.reply_to.and_then(|reply| reply.reply_to_msg_id),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResolveChatResult {
    chat: WireChat,
}

#[derive(Debug, Deserialize)]
struct GetDialogsResult {
    chats: Vec<WireChat>,
}

#[derive(Debug, Deserialize)]
struct GetForumTopicsResult {
    topics: Vec<ForumTopic>,
}

#[derive(Debug, Deserialize)]
struct GetHistoryResult {
    messages: Vec<WireMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatPermissionsResult {
    can_send_messages: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageResult {
    message_id: i64,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    result: Option<Value>,
    error_code: Option<i32>,
    description: Option<String>,
    parameters: Option<ResponseParameters>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limits_carry_the_wait() {
        let error = classify_error(
            StatusCode::TOO_MANY_REQUESTS,
            Some(429),
            "Too Many Requests: retry after 12".into(),
            Some(12),
        );
        assert_eq!(error.rate_limit_wait(), Some(Duration::from_secs(12)));

        let error = classify_error(StatusCode::BAD_REQUEST, Some(420), "FLOOD_WAIT_35".into(), None);
        assert_eq!(error.rate_limit_wait(), Some(Duration::from_secs(35)));

        let error = classify_error(StatusCode::TOO_MANY_REQUESTS, None, "slow down".into(), None);
        assert_eq!(error.rate_limit_wait(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn missing_chats_are_not_found() {
        assert!(classify_error(StatusCode::NOT_FOUND, None, "Not Found".into(), None).is_not_found());
        assert!(
            classify_error(StatusCode::BAD_REQUEST, Some(400), "USERNAME_NOT_OCCUPIED".into(), None).is_not_found()
        );
        assert!(classify_error(StatusCode::BAD_REQUEST, Some(400), "CHANNEL_INVALID".into(), None).is_not_found());
    }

    #[test]
    fn forbidden_and_generic_errors() {
        assert!(
            classify_error(StatusCode::FORBIDDEN, Some(403), "CHAT_WRITE_FORBIDDEN".into(), None).is_forbidden()
        );
        let error = classify_error(StatusCode::INTERNAL_SERVER_ERROR, None, "boom".into(), None);
        assert!(matches!(error, SessionError::Api { code: 500, .. }));
        let error = classify_error(StatusCode::BAD_REQUEST, Some(400), "MESSAGE_TOO_LONG".into(), None);
        assert!(matches!(error, SessionError::Api { code: 400, .. }));
    }

    #[test]
    fn wire_chats_map_to_kinds() {
        let chats: Vec<WireChat> = serde_json::from_value(json!([
            {"id": 1, "type": "private", "title": "Alice"},
            {"id": -5, "type": "group", "title": "Friends"},
            {"id": 123, "type": "supergroup", "title": "Devs", "username": "devs"},
            {"id": 124, "type": "supergroup", "title": "Forum", "isForum": true},
            {"id": 456, "type": "channel", "title": "News"}
        ]))
        .expect("valid chats");
        let kinds: Vec<ChatKind> = chats.into_iter().map(|chat| ChatRef::from(chat).kind).collect();
        assert_eq!(
            kinds,
            vec![
                ChatKind::Private,
                ChatKind::Group,
                ChatKind::Supergroup,
                ChatKind::ForumSupergroup,
                ChatKind::Broadcast
            ]
        );
    }

    #[test]
    fn wire_messages_become_history_entries() {
        let message: WireMessage = serde_json::from_value(json!({
            "id": 10,
            "date": 1700000000,
            "text": "hi",
            "senderId": 42,
            "replyTo": {"replyToMsgId": 9, "replyToTopId": 3}
        }))
        .expect("valid message");
        let entry = HistoryMessage::from(message);
        assert_eq!(entry.reply_to, Some(9));
        assert_eq!(entry.sender_id, Some(42));
        assert_eq!(entry.date.timestamp(), 1_700_000_000);

        let bare: WireMessage =
            serde_json::from_value(json!({"id": 11, "date": 1700000001})).expect("valid message");
        assert_eq!(bare.text, "");
        assert_eq!(HistoryMessage::from(bare).reply_to, None);
    }
}
