//! In-memory collaborators for engine tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nostr_sdk::prelude::*;

use crate::error::{FeedError, Result};
use crate::message::{kind, to_nostr_tags, Message};
use crate::store::{MessageStore, Publisher};

/// A relay answering filters from a shared in-memory message list.
#[derive(Default)]
pub struct MemoryRelay {
    messages: Mutex<Vec<Message>>,
    offline: AtomicBool,
    queries: AtomicUsize,
}

impl MemoryRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, msg: Message) {
        let mut messages = self.messages.lock().unwrap();
        if !messages.iter().any(|m| m.id == msg.id) {
            messages.push(msg);
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

impl MessageStore for MemoryRelay {
    async fn query(&self, filters: Vec<Filter>, timeout: Duration) -> Result<Vec<Message>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(FeedError::Timeout(timeout));
        }

        let held = self.messages.lock().unwrap().clone();
        let mut out: Vec<Message> = Vec::new();
        for filter in &filters {
            let mut matched: Vec<&Message> = held.iter().filter(|m| matches(filter, m)).collect();
            matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            if let Some(limit) = filter.limit {
                matched.truncate(limit);
            }
            for m in matched {
                if !out.iter().any(|o| o.id == m.id) {
                    out.push(m.clone());
                }
            }
        }
        Ok(out)
    }
}

fn matches(filter: &Filter, msg: &Message) -> bool {
    let ids = filter.ids.as_ref().map_or(true, |ids| ids.iter().any(|id| id.to_hex() == msg.id));
    let authors = filter
        .authors
        .as_ref()
        .map_or(true, |authors| authors.iter().any(|pk| pk.to_hex() == msg.author));
    let kinds = filter.kinds.as_ref().map_or(true, |kinds| kinds.iter().any(|k| k.as_u16() == msg.kind));
    let since = filter.since.map_or(true, |s| msg.created_at >= s.as_secs());
    let until = filter.until.map_or(true, |u| msg.created_at <= u.as_secs());
    let tags = filter.generic_tags.iter().all(|(letter, values)| {
        let name = letter.to_string();
        let hit = msg.tag_values(&name).any(|v| values.contains(v));
        hit
    });
    ids && authors && kinds && since && until && tags
}

/// A publisher signing with local keys and "broadcasting" into a
/// [`MemoryRelay`].
pub struct MemoryPublisher {
    keys: Option<Keys>,
    relay: Arc<MemoryRelay>,
    reject: AtomicBool,
    stall: AtomicBool,
    published: Mutex<Vec<Message>>,
}

impl MemoryPublisher {
    pub fn new(keys: Option<Keys>, relay: Arc<MemoryRelay>) -> Arc<Self> {
        Arc::new(Self {
            keys,
            relay,
            reject: AtomicBool::new(false),
            stall: AtomicBool::new(false),
            published: Mutex::new(Vec::new()),
        })
    }

    /// Make every relay refuse further broadcasts.
    pub fn set_reject(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    /// Make broadcasts hang forever instead of answering.
    pub fn set_stalled(&self, stall: bool) {
        self.stall.store(stall, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<Message> {
        self.published.lock().unwrap().clone()
    }
}

impl Publisher for MemoryPublisher {
    async fn identity(&self) -> Option<String> {
        self.keys.as_ref().map(|k| k.public_key().to_hex())
    }

    async fn publish(&self, kind: u16, content: &str, tags: &[Vec<String>]) -> Result<Message> {
        let keys = self.keys.as_ref().ok_or(FeedError::NotAuthenticated)?;
        if self.stall.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.reject.load(Ordering::SeqCst) {
            return Err(FeedError::Transport("no relay accepted the event".into()));
        }
        let event = EventBuilder::new(Kind::from_u16(kind), content)
            .tags(to_nostr_tags(tags))
            .sign_with_keys(keys)
            .map_err(|e| FeedError::Transport(e.to_string()))?;

        let msg = Message::from(&event);
        self.relay.insert(msg.clone());
        self.published.lock().unwrap().push(msg.clone());
        Ok(msg)
    }
}

/// A signed voice message.
pub fn signed(keys: &Keys, created_at: u64, content: &str, tags: Vec<Vec<String>>) -> Message {
    signed_kind(keys, kind::VOICE_MESSAGE, created_at, content, tags)
}

pub fn signed_kind(keys: &Keys, kind: u16, created_at: u64, content: &str, tags: Vec<Vec<String>>) -> Message {
    let event = EventBuilder::new(Kind::from_u16(kind), content)
        .tags(to_nostr_tags(&tags))
        .custom_created_at(Timestamp::from_secs(created_at))
        .sign_with_keys(keys)
        .unwrap();
    Message::from(&event)
}
