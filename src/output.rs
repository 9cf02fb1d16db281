use serde::Serialize;
use thiserror::Error;
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::filter::ChatFilter;
use crate::send::SendOutcome;
use crate::session::HistoryMessage;
use crate::snapshot::ChatSummary;

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterCheck {
    pub filter: ChatFilter,
    pub expression: String,
    pub matches_everything: bool,
}

impl FilterCheck {
    pub fn new(filter: ChatFilter) -> Self {
        Self {
            expression: filter.to_string(),
            matches_everything: filter.is_match_all(),
            filter,
        }
    }
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), OutputError> {
    let payload = serde_json::to_string_pretty(value)?;
    println!("{payload}");
    Ok(())
}

pub fn print_chat_list(chats: &[ChatSummary], json: bool) -> Result<(), OutputError> {
    if json {
        return print_json(chats);
    }

    let mut name_width = display_width("name");
    for chat in chats {
        name_width = name_width.max(display_width(&chat.name));
    }
    name_width = name_width.min(32);

    println!(
        "{}  {}  {}  {}",
        pad_left("id", 15),
        pad_right("type", 10),
        pad_right("name", name_width),
        pad_right("topics", 6),
    );
    for chat in chats {
        let topics = chat
            .topics
            .as_ref()
            .map_or_else(|| "-".to_string(), |topics| topics.len().to_string());
        println!(
            "{}  {}  {}  {}",
            pad_left(&chat.id.to_string(), 15),
            pad_right(chat.kind.as_str(), 10),
            pad_right(&truncate_display(&chat.name, name_width), name_width),
            pad_left(&topics, 6),
        );
        for topic in chat.topics.iter().flatten() {
            println!(
                "{}  {}  {}",
                pad_left("", 15),
                pad_left(&format!("#{}", topic.id), 10),
                truncate_display(&topic.title, name_width),
            );
        }
    }
    Ok(())
}

/// Prints the newest `tail` messages of a fetched history.
pub fn print_history(messages: &[HistoryMessage], tail: usize, json: bool) -> Result<(), OutputError> {
    if json {
        return print_json(messages);
    }

    println!(
        "{}  {}  {}  {}",
        pad_left("id", 8),
        pad_right("date", 20),
        pad_left("from", 12),
        pad_right("text", 64),
    );
    for message in messages.iter().take(tail) {
        let sender = message
            .sender_id
            .map_or_else(|| "-".to_string(), |id| id.to_string());
        println!(
            "{}  {}  {}  {}",
            pad_left(&message.id.to_string(), 8),
            pad_right(&message.date.format("%Y-%m-%d %H:%M:%S").to_string(), 20),
            pad_left(&sender, 12),
            truncate_display(&preview_text(&message.text), 64),
        );
    }
    if messages.len() > tail {
        println!("... {} older messages not shown", messages.len() - tail);
    }
    Ok(())
}

pub fn print_filter_checks(checks: &[FilterCheck], json: bool) -> Result<(), OutputError> {
    if json {
        return print_json(checks);
    }

    for (index, check) in checks.iter().enumerate() {
        if check.matches_everything {
            println!("{:>3}. {}  (matches every message)", index + 1, check.expression);
        } else {
            println!("{:>3}. {}", index + 1, check.expression);
        }
    }
    Ok(())
}

pub fn print_send_outcome(outcome: &SendOutcome, json: bool) -> Result<(), OutputError> {
    if json {
        return print_json(outcome);
    }

    match outcome {
        SendOutcome::Sent { chat_id, message_id } => println!("Sent message {message_id} to {chat_id}."),
        SendOutcome::NotFound => println!("Chat not found."),
        SendOutcome::Forbidden => println!("You are not allowed to post in this chat."),
        SendOutcome::EmptyText => println!("Nothing to send."),
    }
    Ok(())
}

fn preview_text(value: &str) -> String {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        "<no text>".to_string()
    } else {
        collapsed
    }
}

fn display_width(value: &str) -> usize {
    UnicodeWidthStr::width(value)
}

fn truncate_display(value: &str, max_width: usize) -> String {
    if display_width(value) <= max_width {
        return value.to_string();
    }
    let ellipsis = "...";
    let mut width = 0usize;
    let mut output = String::new();
    for ch in value.chars() {
        let ch_width = UnicodeWidthChar::width(ch).unwrap_or(0);
        if width + ch_width + ellipsis.len() > max_width {
            break;
        }
        output.push(ch);
        width += ch_width;
    }
    output.push_str(ellipsis);
    output
}

fn pad_right(value: &str, width: usize) -> String {
    let mut output = value.to_string();
    let current = display_width(value);
    if current < width {
        output.push_str(&" ".repeat(width - current));
    }
    output
}

fn pad_left(value: &str, width: usize) -> String {
    let current = display_width(value);
    if current >= width {
        return value.to_string();
    }
    let mut output = " ".repeat(width - current);
    output.push_str(value);
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_respects_wide_characters() {
        assert_eq!(truncate_display("short", 10), "short");
        assert_eq!(truncate_display("abcdefghijkl", 8), "abcde...");
        let wide = truncate_display("日本語のチャット名", 9);
        assert!(display_width(&wide) <= 9);
        assert!(wide.ends_with("..."));
    }

    #[test]
    fn padding_uses_display_width() {
        assert_eq!(pad_left("7", 3), "  7");
        assert_eq!(pad_right("日本", 6), "日本  ");
        assert_eq!(pad_right("toolong", 3), "toolong");
    }

    #[test]
    fn previews_collapse_whitespace() {
        assert_eq!(preview_text("line one\n\nline   two"), "line one line two");
        assert_eq!(preview_text("  \n "), "<no text>");
    }

    #[test]
    fn filter_checks_flag_match_all() {
        let check = FilterCheck::new(ChatFilter::default());
        assert!(check.matches_everything);
        assert_eq!(check.expression, "*");
        let check = FilterCheck::new("id=-100123".parse().expect("valid filter"));
        assert!(!check.matches_everything);
    }
}
