//! Error types for murmur-core.
//!
//! Transport failures are absorbed inside the engine and surface as "no data
//! this cycle"; validation failures are returned to whoever asked for the
//! write.

use std::time::Duration;

use thiserror::Error;

/// Result type for murmur-core operations.
pub type Result<T> = std::result::Result<T, FeedError>;

/// Errors produced by the feed engine and its collaborators.
#[derive(Debug, Error)]
pub enum FeedError {
    /// A write was attempted without a signing identity.
    #[error("cannot publish while logged out")]
    NotAuthenticated,

    /// The draft carries no content reference.
    #[error("draft has no content")]
    EmptyDraft,

    /// A reply targets a placeholder that has no network id yet.
    #[error("cannot reply to {0} before it is confirmed")]
    UnconfirmedParent(String),

    /// Deletion requested for a message authored by someone else.
    #[error("you can only delete your own messages")]
    NotOwner,

    /// The referenced message is not held by any loaded feed.
    #[error("unknown message: {0}")]
    UnknownMessage(String),

    /// A feed key or id could not be parsed.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Relay query or broadcast failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// A network call did not finish before its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// No upload server accepted the payload.
    #[error("upload failed: {0}")]
    Upload(String),

    /// Configuration could not be loaded or is inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl FeedError {
    /// Whether the error came from the network rather than from the caller.
    pub fn is_transport(&self) -> bool {
        matches!(self, FeedError::Transport(_) | FeedError::Timeout(_))
    }
}

/// Extension trait for adding context to foreign errors while mapping them
/// into [`FeedError`].
///
/// # Example
/// ```ignore
/// client.fetch_events(filter, timeout).await.transport("fetch page")?;
/// ```
pub trait ResultExt<T> {
    /// Map the error into [`FeedError::Transport`], prefixed with `ctx`.
    fn transport(self, ctx: &str) -> Result<T>;

    /// Map the error into [`FeedError::Upload`], prefixed with `ctx`.
    fn upload(self, ctx: &str) -> Result<T>;
}

impl<T, E: std::fmt::Display> ResultExt<T> for std::result::Result<T, E> {
    fn transport(self, ctx: &str) -> Result<T> {
        self.map_err(|e| FeedError::Transport(format!("{}: {}", ctx, e)))
    }

    fn upload(self, ctx: &str) -> Result<T> {
        self.map_err(|e| FeedError::Upload(format!("{}: {}", ctx, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_context_is_prefixed() {
        let res: std::result::Result<(), &str> = Err("connection reset");
        let err = res.transport("fetch page").unwrap_err();
        assert_eq!(err.to_string(), "transport error: fetch page: connection reset");
        assert!(err.is_transport());
    }

    #[test]
    fn validation_errors_are_not_transport() {
        assert!(!FeedError::NotAuthenticated.is_transport());
        assert!(!FeedError::EmptyDraft.is_transport());
        assert!(FeedError::Timeout(Duration::from_millis(1500)).is_transport());
    }
}
