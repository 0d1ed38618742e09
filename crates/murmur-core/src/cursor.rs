//! Backward-in-time pagination cursor.

use std::borrow::Borrow;

use crate::message::Message;

/// Pagination state for one feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    /// Next page ends (inclusive `until`) at this timestamp
    Before(u64),
    /// An under-full page was received; nothing older will be asked for
    Exhausted,
}

impl Cursor {
    /// Cursor for a fresh feed starting at wall-clock `now`.
    pub fn start(now: u64) -> Self {
        Cursor::Before(now)
    }

    pub fn next_boundary(&self) -> Option<u64> {
        match self {
            Cursor::Before(at) => Some(*at),
            Cursor::Exhausted => None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Cursor::Exhausted)
    }

    /// Cursor after receiving `page`.
    ///
    /// A full page moves the boundary one second below its oldest message so
    /// the next query always makes progress. Anything else sharing that oldest
    /// second but cut off by the page limit is skipped.
    pub fn advance<M: Borrow<Message>>(self, page: &[M], page_size: usize) -> Self {
        if self.is_exhausted() || page.len() < page_size {
            return Cursor::Exhausted;
        }
        match page.iter().map(|m| <M as Borrow<Message>>::borrow(m).created_at).min() {
            Some(0) | None => Cursor::Exhausted,
            Some(oldest) => Cursor::Before(oldest - 1),
        }
    }
}
