//! Operator chat/topic filters and the matcher used by the live monitor.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::session::{ChatRef, TopicRef};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterParseError {
    #[error("expected key=value, got {0:?}")]
    MissingValue(String),
    #[error("unknown filter key {0:?} (expected id, username, title or topics)")]
    UnknownKey(String),
    #[error("invalid {key} value {value:?}")]
    InvalidNumber { key: &'static str, value: String },
    #[error("{0} given more than once")]
    Duplicate(&'static str),
}

/// One filter entry. Every populated field must match; absent fields match
/// anything. A filter with no fields at all matches every message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(
        default,
        deserialize_with = "username_without_at",
        skip_serializing_if = "Option::is_none"
    )]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topics: Option<BTreeSet<i64>>,
}

impl ChatFilter {
    /// True when no field constrains anything.
    pub fn is_match_all(&self) -> bool {
        self.id.is_none() && self.username.is_none() && self.title.is_none() && !self.restricts_topics()
    }

    fn restricts_topics(&self) -> bool {
        self.topics.as_ref().is_some_and(|topics| !topics.is_empty())
    }

    /// `chat_id` must already be normalized.
    fn accepts(&self, chat: &ChatRef, chat_id: i64, topic: Option<&TopicRef>) -> bool {
        if self.id.is_some_and(|id| id != chat_id) {
            return false;
        }
        if let Some(title) = &self.title {
            if chat.title.as_deref() != Some(title.as_str()) {
                return false;
            }
        }
        if let Some(username) = &self.username {
            if chat.username.as_deref() != Some(username.as_str()) {
                return false;
            }
        }
        match &self.topics {
            Some(topics) if !topics.is_empty() => {
                topic.is_some_and(|topic| topics.contains(&topic.topic_id))
            }
            _ => true,
        }
    }
}

/// True if any filter accepts the message's chat and topic. Filters are
/// tried in order and the first acceptance wins.
pub fn matches(chat: &ChatRef, topic: Option<&TopicRef>, filters: &[ChatFilter]) -> bool {
    let chat_id = chat.normalized_id();
    filters.iter().any(|filter| filter.accepts(chat, chat_id, topic))
}

/// Parses `id=-100123;topics=7,8` style expressions. An empty expression or
/// `*` is the match-everything filter.
impl FromStr for ChatFilter {
    type Err = FilterParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let mut filter = ChatFilter::default();
        let raw = input.trim();
        if raw.is_empty() || raw == "*" {
            return Ok(filter);
        }

        for part in raw.split(';').map(str::trim).filter(|part| !part.is_empty()) {
            let (key, value) = part
                .split_once('=')
                .map(|(key, value)| (key.trim().to_ascii_lowercase(), value.trim()))
                .ok_or_else(|| FilterParseError::MissingValue(part.to_string()))?;

            match key.as_str() {
                "id" => {
                    let id = value.parse().map_err(|_| FilterParseError::InvalidNumber {
                        key: "id",
                        value: value.to_string(),
                    })?;
                    set_once(&mut filter.id, id, "id")?;
                }
                "username" => {
                    let username = value.trim_start_matches('@').to_string();
                    set_once(&mut filter.username, username, "username")?;
                }
                "title" => set_once(&mut filter.title, value.to_string(), "title")?,
                "topics" | "topic" => {
                    let topics = value
                        .split(',')
                        .map(str::trim)
                        .filter(|topic| !topic.is_empty())
                        .map(|topic| {
                            topic.parse().map_err(|_| FilterParseError::InvalidNumber {
                                key: "topics",
                                value: topic.to_string(),
                            })
                        })
                        .collect::<Result<BTreeSet<i64>, _>>()?;
                    set_once(&mut filter.topics, topics, "topics")?;
                }
                _ => return Err(FilterParseError::UnknownKey(key)),
            }
        }
        Ok(filter)
    }
}

fn username_without_at<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let username = Option::<String>::deserialize(deserializer)?;
    Ok(username.map(|name| name.trim_start_matches('@').to_string()))
}

fn set_once<T>(slot: &mut Option<T>, value: T, key: &'static str) -> Result<(), FilterParseError> {
    if slot.is_some() {
        return Err(FilterParseError::Duplicate(key));
    }
    *slot = Some(value);
    Ok(())
}

impl fmt::Display for ChatFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_match_all() {
            return f.write_str("*");
        }
        let mut parts = Vec::new();
        if let Some(id) = self.id {
            parts.push(format!("id={id}"));
        }
        if let Some(username) = &self.username {
            parts.push(format!("username={username}"));
        }
        if let Some(title) = &self.title {
            parts.push(format!("title={title}"));
        }
        if let Some(topics) = self.topics.as_ref().filter(|topics| !topics.is_empty()) {
            let list: Vec<String> = topics.iter().map(i64::to_string).collect();
            parts.push(format!("topics={}", list.join(",")));
        }
        f.write_str(&parts.join(";"))
    }
}
