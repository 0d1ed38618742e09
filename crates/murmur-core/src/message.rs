//! Flat message model.
//!
//! Every event a relay hands us is stored as-is in this flat shape; reply
//! structure is derived from the tags at render time (see [`crate::thread`]).

use std::sync::atomic::{AtomicU64, Ordering};

use nostr_sdk::prelude::*;
use serde::{Deserialize, Serialize};

/// Nostr event kinds the feed understands.
pub mod kind {
    /// NIP-02: Follow list
    pub const CONTACT_LIST: u16 = 3;
    /// NIP-09: Deletion request
    pub const DELETION: u16 = 5;
    /// Voice message; `content` is the media URL
    pub const VOICE_MESSAGE: u16 = 1222;
    /// Blossom user server list
    pub const BLOSSOM_SERVER_LIST: u16 = 10063;
}

/// Prefix of locally generated placeholder ids. Network ids are 64 hex chars
/// and can never start with it.
pub const PENDING_PREFIX: &str = "pending-";

static PENDING_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    /// Author public key (hex)
    pub author: String,
    /// Unix seconds
    pub created_at: u64,
    pub kind: u16,
    /// Opaque payload reference, typically a media URL
    pub content: String,
    /// Nostr-style tags, e.g. `[["e", "abc", "", "root"], ["p", "pubkey"]]`
    pub tags: Vec<Vec<String>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sig: String,
    /// Local placeholder still waiting for its confirmed copy
    #[serde(default)]
    pub pending: bool,
    /// Local placeholder whose broadcast failed
    #[serde(default)]
    pub failed: bool,
}

impl Message {
    pub fn new(
        id: impl Into<String>,
        author: impl Into<String>,
        created_at: u64,
        kind: u16,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            author: author.into(),
            created_at,
            kind,
            content: content.into(),
            tags: Vec::new(),
            sig: String::new(),
            pending: false,
            failed: false,
        }
    }

    pub fn with_tags(mut self, tags: Vec<Vec<String>>) -> Self {
        self.tags = tags;
        self
    }

    /// Build an optimistic placeholder with a fresh temporary id.
    pub fn placeholder(
        author: impl Into<String>,
        kind: u16,
        content: impl Into<String>,
        tags: Vec<Vec<String>>,
    ) -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        let seq = PENDING_SEQ.fetch_add(1, Ordering::Relaxed);
        let id = format!("{}{}-{}", PENDING_PREFIX, now.as_nanos(), seq);

        let mut msg = Self::new(id, author, now.as_secs(), kind, content).with_tags(tags);
        msg.pending = true;
        msg
    }

    pub fn is_placeholder(&self) -> bool {
        self.id.starts_with(PENDING_PREFIX)
    }

    /// Copy of this placeholder flagged as failed.
    pub fn as_failed(&self) -> Self {
        let mut msg = self.clone();
        msg.pending = false;
        msg.failed = true;
        msg
    }

    pub fn linkage(&self) -> Linkage<'_> {
        Linkage::of(self)
    }

    /// Second element of every tag named `name`.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.first().map(String::as_str) == Some(name))
            .filter_map(|t| t.get(1).map(String::as_str))
    }

    pub fn has_hashtag(&self, hashtag: &str) -> bool {
        self.tag_values("t").any(|t| t.eq_ignore_ascii_case(hashtag))
    }
}

impl From<&Event> for Message {
    fn from(event: &Event) -> Self {
        Self {
            id: event.id.to_hex(),
            author: event.pubkey.to_hex(),
            created_at: event.created_at.as_secs(),
            kind: event.kind.as_u16(),
            content: event.content.clone(),
            tags: event.tags.iter().map(|t| t.as_slice().to_vec()).collect(),
            sig: event.sig.to_string(),
            pending: false,
            failed: false,
        }
    }
}

/// Reply linkage declared by a message's marked `e` tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Linkage<'a> {
    /// Thread root (`["e", id, relay, "root"]`)
    pub root: Option<&'a str>,
    /// Immediate parent (`["e", id, relay, "reply"]`)
    pub reply: Option<&'a str>,
}

impl<'a> Linkage<'a> {
    pub fn of(msg: &'a Message) -> Self {
        let mut linkage = Linkage::default();
        for tag in &msg.tags {
            if tag.len() < 4 || tag[0] != "e" {
                continue;
            }
            match tag[3].as_str() {
                "root" if linkage.root.is_none() => linkage.root = Some(tag[1].as_str()),
                "reply" if linkage.reply.is_none() => linkage.reply = Some(tag[1].as_str()),
                _ => {}
            }
        }
        linkage
    }

    /// Neither marker present.
    pub fn is_root(&self) -> bool {
        self.root.is_none() && self.reply.is_none()
    }

    /// Whether either marker references `id`.
    pub fn references(&self, id: &str) -> bool {
        self.root == Some(id) || self.reply == Some(id)
    }
}

/// Tags for a reply to `parent`: replies to replies inherit the parent's
/// thread root, otherwise the parent itself is the root.
pub fn reply_tags(parent: &Message) -> Vec<Vec<String>> {
    let root = parent.linkage().root.unwrap_or(&parent.id).to_string();
    vec![
        vec!["e".into(), root, String::new(), "root".into()],
        vec!["e".into(), parent.id.clone(), String::new(), "reply".into()],
        vec!["p".into(), parent.author.clone()],
    ]
}

/// Convert flat tags back into nostr-sdk tags, skipping malformed entries.
pub fn to_nostr_tags(tags: &[Vec<String>]) -> Vec<Tag> {
    tags.iter().filter_map(|t| Tag::parse(t).ok()).collect()
}
