//! Canonical chat ids.
//!
//! User-facing and bot-facing APIs disagree on how container chats are
//! numbered: supergroups, broadcast channels and forums appear either as a
//! bare positive id or with a `-100` prefix. Every comparison and every
//! persisted record uses the prefixed form produced here.

use crate::session::{ChatKind, ChatRef};

/// Decimal prefix carried by normalized container ids.
pub const CONTAINER_MARKER: &str = "-100";

pub fn normalize(chat: &ChatRef) -> i64 {
    normalize_id(chat.kind, chat.raw_id)
}

pub fn normalize_id(kind: ChatKind, raw_id: i64) -> i64 {
    if !kind.is_large_container() || has_marker(raw_id) {
        return raw_id;
    }
    prefix_marker(raw_id.unsigned_abs()).unwrap_or(raw_id)
}

pub fn has_marker(id: i64) -> bool {
    id.to_string().starts_with(CONTAINER_MARKER)
}

/// `-100` followed by the decimal digits of `magnitude`, or `None` if that
/// does not fit in an `i64`.
fn prefix_marker(magnitude: u64) -> Option<i64> {
    let digits = magnitude.checked_ilog10().map_or(1, |log| log + 1);
    let scale = 10_i64.checked_pow(digits)?;
    let magnitude = i64::try_from(magnitude).ok()?;
    100_i64.checked_mul(scale)?.checked_add(magnitude).map(|value| -value)
}
