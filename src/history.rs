//! Backward sweep over a chat's message history.
//!
//! The sweep starts at the newest message and walks towards the oldest in
//! batches of at most [`MAX_BATCH`]. The cursor is the id of the oldest
//! message fetched so far. Rate-limit signals suspend the sweep and repeat
//! the same request; any other failure ends it.
//!
//! A total limit is enforced between batches by shrinking the next request,
//! so a well-behaved transport never returns more than asked. A transport
//! that ignores the requested size can still overshoot by up to one batch.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::session::{ChatRef, HistoryMessage, HistoryRequest, Session, retry_rate_limited};

pub const MAX_BATCH: usize = 100;

/// Pause between successful batches.
pub const BATCH_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SweepState {
    Sweeping { offset_id: i64, remaining: Option<usize> },
    Done,
    Failed,
}

/// A single, non-restartable history sweep. Pull batches with
/// [`HistoryFetcher::next_batch`] until it yields `None`.
pub struct HistoryFetcher<'s, S> {
    session: &'s mut S,
    chat: ChatRef,
    topic_id: Option<i64>,
    state: SweepState,
    batch_delay: Duration,
    delay_pending: bool,
    fetched: usize,
}

impl<'s, S: Session> HistoryFetcher<'s, S> {
    pub fn new(session: &'s mut S, chat: ChatRef, topic_id: Option<i64>, total_limit: Option<usize>) -> Self {
        Self {
            session,
            chat,
            topic_id,
            state: SweepState::Sweeping {
                offset_id: 0,
                remaining: total_limit,
            },
            batch_delay: BATCH_DELAY,
            delay_pending: false,
            fetched: 0,
        }
    }

    #[cfg(test)]
    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }

    /// Messages returned so far.
    pub fn fetched(&self) -> usize {
        self.fetched
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self.state, SweepState::Sweeping { .. })
    }

    /// Next newest-first batch, or `None` once the sweep is over.
    ///
    /// After an error the sweep is failed and every later call yields `None`.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<HistoryMessage>>, SessionError> {
        let SweepState::Sweeping { offset_id, remaining } = self.state else {
            return Ok(None);
        };

        if self.delay_pending {
            tokio::time::sleep(self.batch_delay).await;
            self.delay_pending = false;
        }

        let request = HistoryRequest {
            chat: self.chat.clone(),
            topic_id: self.topic_id,
            offset_id,
            limit: remaining.map_or(MAX_BATCH, |remaining| remaining.min(MAX_BATCH)),
        };

        debug!(
            chat_id = self.chat.normalized_id(),
            offset_id,
            limit = request.limit,
            "requesting history batch"
        );
        let session = &mut *self.session;
        let result = retry_rate_limited("fetch history", async || session.get_history(&request).await).await;
        match result {
            Ok(batch) => Ok(self.advance(offset_id, remaining, batch)),
            Err(error) => {
                self.state = SweepState::Failed;
                Err(error)
            }
        }
    }

    /// Drains the sweep into `out`. Messages already pushed stay in `out`
    /// when an error is returned.
    pub async fn collect_into(&mut self, out: &mut Vec<HistoryMessage>) -> Result<usize, SessionError> {
        let start = out.len();
        while let Some(batch) = self.next_batch().await? {
            out.extend(batch);
            info!(fetched = self.fetched, "history batch saved to buffer");
        }
        Ok(out.len() - start)
    }

    fn advance(
        &mut self,
        offset_id: i64,
        remaining: Option<usize>,
        batch: Vec<HistoryMessage>,
    ) -> Option<Vec<HistoryMessage>> {
        let Some(oldest) = batch.iter().map(|message| message.id).min() else {
            self.state = SweepState::Done;
            return None;
        };

        self.fetched += batch.len();
        let remaining = remaining.map(|remaining| remaining.saturating_sub(batch.len()));

        self.state = if remaining == Some(0) {
            SweepState::Done
        } else if offset_id != 0 && oldest >= offset_id {
            warn!(offset_id, oldest, "history cursor did not move, stopping sweep");
            SweepState::Done
        } else {
            self.delay_pending = true;
            SweepState::Sweeping {
                offset_id: oldest,
                remaining,
            }
        };
        Some(batch)
    }
}
