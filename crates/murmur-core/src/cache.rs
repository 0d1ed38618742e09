//! Keyed view cache.
//!
//! Each feed (global, following, a hashtag, an author, a single thread) is an
//! independent [`Partition`] of paginated [`Page`]s. Partitions are held as
//! `Arc` snapshots and replaced wholesale on every change, so a reader that
//! grabbed a snapshot keeps a consistent view while writers move on.
//!
//! The cache knows nothing about how partitions relate to each other: an event
//! that touches several feeds is projected into each of them by the caller.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cursor::Cursor;
use crate::message::Message;
use crate::thread::{self, ThreadNode};

/// Identity of a feed view.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeedKey {
    Global,
    /// Authors followed by the given pubkey (hex)
    Following(String),
    Hashtag(String),
    Author(String),
    /// A single message and everything replying to it
    Thread(String),
}

impl fmt::Display for FeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedKey::Global => write!(f, "global"),
            FeedKey::Following(pk) => write!(f, "following:{}", pk),
            FeedKey::Hashtag(tag) => write!(f, "#{}", tag),
            FeedKey::Author(pk) => write!(f, "author:{}", pk),
            FeedKey::Thread(id) => write!(f, "thread:{}", id),
        }
    }
}

/// Messages returned by one pagination step.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    /// The `until` boundary that produced this page
    pub boundary: u64,
    pub messages: Vec<Arc<Message>>,
}

impl Page {
    pub fn new(boundary: u64, messages: Vec<Arc<Message>>) -> Self {
        Self { boundary, messages }
    }
}

#[derive(Debug, Clone)]
pub struct Partition {
    pub key: FeedKey,
    pub pages: Vec<Page>,
    pub cursor: Cursor,
    /// Resolved author restriction (the follow list of a following feed)
    pub scope: Option<Arc<Vec<String>>>,
    /// Bumped whenever the partition is created or reset; late pages from an
    /// older generation are discarded
    pub generation: u64,
    observers: usize,
}

impl Partition {
    fn new(key: FeedKey, now: u64, generation: u64) -> Self {
        Self {
            key,
            pages: Vec::new(),
            cursor: Cursor::start(now),
            scope: None,
            generation,
            observers: 1,
        }
    }

    pub fn messages(&self) -> impl Iterator<Item = &Arc<Message>> {
        self.pages.iter().flat_map(|p| p.messages.iter())
    }

    pub fn find(&self, id: &str) -> Option<&Arc<Message>> {
        self.messages().find(|m| m.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.find(id).is_some()
    }

    pub fn is_loaded(&self) -> bool {
        !self.pages.is_empty()
    }

    pub fn observers(&self) -> usize {
        self.observers
    }

    /// Current threaded view of this partition.
    pub fn threads(&self) -> Vec<ThreadNode> {
        thread::assemble(self.messages())
    }

    /// Ids of the root-level messages held.
    pub fn root_ids(&self) -> impl Iterator<Item = &str> {
        self.messages().filter(|m| m.linkage().is_root()).map(|m| m.id.as_str())
    }

    /// Whether a new root message belongs in this feed.
    pub fn admits_root(&self, msg: &Message) -> bool {
        match &self.key {
            FeedKey::Global => true,
            FeedKey::Author(pk) => &msg.author == pk,
            FeedKey::Hashtag(tag) => msg.has_hashtag(tag),
            FeedKey::Following(_) => self.scope.as_ref().is_some_and(|s| s.contains(&msg.author)),
            FeedKey::Thread(_) => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct ViewCache {
    partitions: HashMap<FeedKey, Arc<Partition>>,
    /// Ids removed by deletion; never re-admitted by later pages
    tombstones: HashSet<String>,
    next_generation: u64,
}

impl ViewCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer, creating the partition on first subscription.
    /// Returns the partition's generation.
    pub fn subscribe(&mut self, key: FeedKey, now: u64) -> u64 {
        if let Some(existing) = self.partitions.get_mut(&key) {
            let part = Arc::make_mut(existing);
            part.observers += 1;
            return part.generation;
        }
        self.next_generation += 1;
        let generation = self.next_generation;
        self.partitions.insert(key.clone(), Arc::new(Partition::new(key, now, generation)));
        generation
    }

    /// Drop an observer. Returns true when the partition was discarded.
    pub fn unsubscribe(&mut self, key: &FeedKey) -> bool {
        let Some(existing) = self.partitions.get_mut(key) else {
            return false;
        };
        let part = Arc::make_mut(existing);
        part.observers = part.observers.saturating_sub(1);
        if part.observers == 0 {
            self.partitions.remove(key);
            return true;
        }
        false
    }

    /// Snapshot of a partition.
    pub fn partition(&self, key: &FeedKey) -> Option<Arc<Partition>> {
        self.partitions.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<FeedKey> {
        self.partitions.keys().cloned().collect()
    }

    /// Append a fetched page and advance the cursor. Returns how many
    /// messages were new to the partition.
    ///
    /// The cursor advances on the page as fetched; ids already held or
    /// deleted are then filtered out. Pages for a partition that is gone or
    /// was reset since the fetch started are dropped (`None`).
    pub fn append_page(&mut self, key: &FeedKey, generation: u64, page: Page, page_size: usize) -> Option<usize> {
        let mut next = (**self.current(key, generation)?).clone();
        next.cursor = next.cursor.advance(&page.messages, page_size);

        let fresh: Vec<Arc<Message>> = {
            let mut held: HashSet<&str> = next.messages().map(|m| m.id.as_str()).collect();
            page.messages
                .iter()
                .filter(|m| !self.tombstones.contains(&m.id) && held.insert(m.id.as_str()))
                .cloned()
                .collect()
        };
        let count = fresh.len();
        next.pages.push(Page::new(page.boundary, fresh));
        self.partitions.insert(key.clone(), Arc::new(next));
        Some(count)
    }

    /// Record the resolved author scope of a partition.
    pub fn set_scope(&mut self, key: &FeedKey, generation: u64, scope: Arc<Vec<String>>) -> bool {
        let Some(current) = self.current(key, generation) else {
            return false;
        };
        let mut next = (**current).clone();
        next.scope = Some(scope);
        self.partitions.insert(key.clone(), Arc::new(next));
        true
    }

    /// Forget every page and restart pagination from `now`, keeping observers.
    pub fn reset(&mut self, key: &FeedKey, now: u64) -> Option<u64> {
        let current = self.partitions.get(key)?;
        self.next_generation += 1;
        let mut next = Partition::new(key.clone(), now, self.next_generation);
        next.observers = current.observers;
        next.scope = current.scope.clone();
        self.partitions.insert(key.clone(), Arc::new(next));
        Some(self.next_generation)
    }

    /// Replace a partition's pages with `transform` applied to the latest
    /// snapshot. `None` from the transform means "unchanged".
    pub fn mutate<F>(&mut self, key: &FeedKey, transform: F) -> bool
    where
        F: FnOnce(&Partition) -> Option<Vec<Page>>,
    {
        let Some(current) = self.partitions.get(key) else {
            return false;
        };
        let Some(pages) = transform(current) else {
            return false;
        };
        let mut next = (**current).clone();
        next.pages = pages;
        self.partitions.insert(key.clone(), Arc::new(next));
        true
    }

    /// Run `transform` against every partition. Returns the keys that changed.
    pub fn apply_all<F>(&mut self, mut transform: F) -> Vec<FeedKey>
    where
        F: FnMut(&Partition) -> Option<Vec<Page>>,
    {
        let mut changed = Vec::new();
        for key in self.keys() {
            if self.mutate(&key, &mut transform) {
                changed.push(key);
            }
        }
        changed
    }

    /// Remove `id` (and its thread, if it is a root) from every partition and
    /// keep it out of any page fetched later.
    pub fn remove_everywhere(&mut self, id: &str) -> Vec<FeedKey> {
        self.tombstones.insert(id.to_string());
        self.apply_all(|part| without_message(part, id))
    }

    pub fn is_removed(&self, id: &str) -> bool {
        self.tombstones.contains(id)
    }

    /// First copy of `id` held by any partition.
    pub fn find(&self, id: &str) -> Option<Arc<Message>> {
        self.partitions.values().find_map(|p| p.find(id).cloned())
    }

    fn current(&self, key: &FeedKey, generation: u64) -> Option<&Arc<Partition>> {
        self.partitions.get(key).filter(|p| p.generation == generation)
    }
}

// ============================================================================
// Page transforms
// ============================================================================

/// Place a reply next to its thread root. `None` when the root is not held
/// or the reply already is.
pub fn with_reply(part: &Partition, reply: &Arc<Message>) -> Option<Vec<Page>> {
    let root = reply.linkage().root?;
    if part.contains(&reply.id) {
        return None;
    }
    let page_idx = part.pages.iter().position(|p| p.messages.iter().any(|m| m.id == root))?;
    let mut pages = part.pages.clone();
    pages[page_idx].messages.push(Arc::clone(reply));
    Some(pages)
}

/// Put a new root message at the head of a loaded feed.
pub fn with_root(part: &Partition, msg: &Arc<Message>) -> Option<Vec<Page>> {
    if !part.is_loaded() || part.contains(&msg.id) || !part.admits_root(msg) {
        return None;
    }
    let mut pages = part.pages.clone();
    pages[0].messages.insert(0, Arc::clone(msg));
    Some(pages)
}

/// Swap the entry `old_id` for `new` in place. When a different message with
/// `new`'s id is already held the old entry is removed instead, so the feed
/// never shows both.
pub fn with_replacement(part: &Partition, old_id: &str, new: &Arc<Message>) -> Option<Vec<Page>> {
    if !part.contains(old_id) {
        return None;
    }
    let duplicate = new.id != old_id && part.contains(&new.id);
    let pages = part
        .pages
        .iter()
        .map(|page| {
            let messages = page
                .messages
                .iter()
                .filter_map(|m| match (m.id == old_id, duplicate) {
                    (true, true) => None,
                    (true, false) => Some(Arc::clone(new)),
                    (false, _) => Some(Arc::clone(m)),
                })
                .collect();
            Page::new(page.boundary, messages)
        })
        .collect();
    Some(pages)
}

/// Remove `id`, and when it roots a thread, every message of that thread.
pub fn without_message(part: &Partition, id: &str) -> Option<Vec<Page>> {
    let doomed = |m: &Arc<Message>| m.id == id || m.linkage().root == Some(id);
    if !part.messages().any(|m| doomed(m)) {
        return None;
    }
    let pages = part
        .pages
        .iter()
        .map(|page| {
            let messages = page.messages.iter().filter(|m| !doomed(*m)).cloned().collect();
            Page::new(page.boundary, messages)
        })
        .collect();
    Some(pages)
}
