//! The temporal "as of" rule shared by every level of the hierarchy.
//!
//! Organizations, urls and endpoints all carry the same window fields
//! (created_on, is_dead, is_dead_since). Whether an entity counts "as of"
//! a moment is decided here and nowhere else.

use crate::models::Lifespan;
use time::OffsetDateTime;

/// An entity is included as of `when` if it was created before that moment
/// and either is still alive, or died after `when`.
pub fn alive_at(lifespan: &Lifespan, when: OffsetDateTime) -> bool {
    if lifespan.created_on > when {
        return false;
    }
    if !lifespan.is_dead {
        return true;
    }
    match lifespan.is_dead_since {
        Some(died) => when <= died,
        // Marked dead without a date: treat as dead for any moment. Data like
        // this is an import artifact and should not resurrect history.
        None => false,
    }
}

/// Deterministic "most recent as of" selection: highest `(at, id)` wins, so
/// two rows sharing a timestamp are ordered by insertion sequence.
pub fn more_recent(a: (OffsetDateTime, u64), b: (OffsetDateTime, u64)) -> bool {
    a > b
}
