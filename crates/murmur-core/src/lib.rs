//! Feed synchronization and thread reconstruction for Nostr voice messages.
//!
//! Signed messages arrive out of order, duplicated, and late from several
//! relays. This crate turns them into stable threaded feeds:
//!
//! - [`cursor`] pages each feed backwards in time;
//! - [`cache`] keeps one independent partition per feed;
//! - [`thread`] rebuilds reply trees from the flat message set;
//! - [`poller`] merges new replies and deletions while a feed is open;
//! - [`drafts`] and [`FeedEngine::publish`] show the local user's messages
//!   immediately and swap in the confirmed copy once relays have it.
//!
//! Relays and signing sit behind the [`MessageStore`] and [`Publisher`]
//! traits; [`RelayStore`] and [`RelayPublisher`] implement them with
//! nostr-sdk.

pub mod cache;
pub mod config;
pub mod cursor;
pub mod drafts;
pub mod error;
pub mod feed;
pub mod message;
pub mod poller;
pub mod store;
pub mod thread;
pub mod upload;

#[cfg(test)]
mod testing;

pub use cache::{FeedKey, Page, Partition};
pub use config::FeedConfig;
pub use drafts::{Draft, DraftState};
pub use error::{FeedError, Result};
pub use feed::{FeedEngine, FeedUpdate, PageLoad, PublishOutcome};
pub use message::Message;
pub use poller::{spawn_poller, PollReport, PollerHandle};
pub use store::{MessageStore, Publisher, RelayPublisher, RelayStore};
pub use thread::ThreadNode;
pub use upload::BlossomUploader;
