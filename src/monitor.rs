//! Live listener that keeps messages matching the operator's filters.
//!
//! Events are handled one at a time, to completion, before the next one is
//! awaited. Matches accumulate in memory and the whole buffer is rewritten to
//! the sink every [`FLUSH_EVERY`] records, and once more when the run ends if
//! anything is still unflushed.
//!
//! The full rewrite costs O(n) per flush and grows without bound over a long
//! run. It is kept because the output file is a single JSON array that other
//! tools read whole.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::SessionError;
use crate::filter::{self, ChatFilter};
use crate::session::{IncomingMessage, Session, TopicRef};
use crate::store::{RecordSink, StoreError};

pub const FLUSH_EVERY: usize = 10;

/// Pause before asking a failed event stream for more.
const STREAM_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitoredMessageRecord {
    pub chat_id: i64,
    pub chat_name: String,
    pub message_id: i64,
    #[serde(rename = "date")]
    pub timestamp: DateTime<Utc>,
    pub text: String,
    pub sender_id: Option<i64>,
    pub forum_id: Option<i64>,
    pub topic_id: Option<i64>,
}

impl MonitoredMessageRecord {
    fn new(event: &IncomingMessage, chat_id: i64, topic: Option<TopicRef>) -> Self {
        Self {
            chat_id,
            chat_name: event.chat.display_name(),
            message_id: event.message_id,
            timestamp: event.date,
            text: event.text.clone(),
            sender_id: event.sender_id,
            forum_id: topic.map(|topic| topic.forum_chat_id),
            topic_id: topic.map(|topic| topic.topic_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    Cancelled,
    StreamClosed,
}

pub struct Monitor<'s, S, K> {
    session: &'s mut S,
    sink: K,
    filters: Vec<ChatFilter>,
    records: Vec<MonitoredMessageRecord>,
    flushed: usize,
}

impl<'s, S: Session, K: RecordSink> Monitor<'s, S, K> {
    pub fn new(session: &'s mut S, filters: Vec<ChatFilter>, sink: K) -> Self {
        Self {
            session,
            sink,
            filters,
            records: Vec::new(),
            flushed: 0,
        }
    }

    pub fn records(&self) -> &[MonitoredMessageRecord] {
        &self.records
    }

    #[cfg(test)]
    pub fn sink(&self) -> &K {
        &self.sink
    }

    /// Listens until `shutdown` resolves or the event stream closes.
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) -> MonitorExit {
        tokio::pin!(shutdown);
        info!(filters = self.filters.len(), "listening for new messages");

        let exit = loop {
            let next = tokio::select! {
                biased;
                _ = &mut shutdown => break MonitorExit::Cancelled,
                next = self.session.next_event() => next,
            };

            let pause = match next {
                Ok(Some(event)) => {
                    if let Err(error) = self.handle(&event) {
                        error!(message_id = event.message_id, %error, "failed to handle message");
                    }
                    continue;
                }
                Ok(None) => break MonitorExit::StreamClosed,
                Err(SessionError::RateLimited { retry_after }) => {
                    warn!(retry_after_secs = retry_after.as_secs(), "event stream rate limited");
                    retry_after
                }
                Err(SessionError::Protocol(error)) => {
                    warn!(%error, "skipping malformed event");
                    continue;
                }
                Err(error) => {
                    warn!(%error, "event stream failed, retrying");
                    STREAM_RETRY_DELAY
                }
            };

            tokio::select! {
                biased;
                _ = &mut shutdown => break MonitorExit::Cancelled,
                _ = tokio::time::sleep(pause) => {}
            }
        };

        if self.flushed != self.records.len() {
            if let Err(error) = self.flush() {
                error!(%error, "final flush failed");
            }
        }
        info!(matched = self.records.len(), ?exit, "monitor stopped");
        exit
    }

    /// Returns whether the event matched.
    fn handle(&mut self, event: &IncomingMessage) -> Result<bool, StoreError> {
        let chat_id = event.chat.normalized_id();
        let topic = TopicRef::derive(&event.chat, event.reply.as_ref());

        if !filter::matches(&event.chat, topic.as_ref(), &self.filters) {
            debug!(chat_id, message_id = event.message_id, "message did not match any filter");
            return Ok(false);
        }

        self.records.push(MonitoredMessageRecord::new(event, chat_id, topic));
        info!(
            chat_id,
            message_id = event.message_id,
            topic_id = topic.map(|topic| topic.topic_id),
            total = self.records.len(),
            "matched message"
        );

        if self.records.len() % FLUSH_EVERY == 0 {
            self.flush()?;
        }
        Ok(true)
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        self.sink.write_snapshot(&self.records)?;
        self.flushed = self.records.len();
        debug!(records = self.flushed, "flushed monitored messages");
        Ok(())
    }
}
