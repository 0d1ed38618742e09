//! Feed engine.
//!
//! [`FeedEngine`] ties the pieces together: it pages feeds in from the
//! [`MessageStore`], keeps them in the [`ViewCache`], stages optimistic drafts
//! and reconciles them with their confirmed copies, and fans every change out
//! as a [`FeedUpdate`].
//!
//! All mutable state lives behind one async mutex. It is never held across a
//! network call: each operation snapshots what it needs, releases the lock,
//! talks to the network, then re-acquires the lock and applies its change to
//! whatever the state looks like by then.

use std::collections::HashMap;
use std::sync::Arc;

use nostr_sdk::prelude::{EventId, Filter, Kind, PublicKey, Timestamp};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};

use crate::cache::{self, FeedKey, Page, Partition, ViewCache};
use crate::config::FeedConfig;
use crate::drafts::{self, Draft, DraftRegistry, DraftState};
use crate::error::{FeedError, Result};
use crate::message::{kind, Message, PENDING_PREFIX};
use crate::store::{MessageStore, Publisher};
use crate::thread::ThreadNode;

/// Buffered updates per receiver before slow receivers start lagging.
const UPDATE_CAPACITY: usize = 256;

/// Everything the engine mutates.
#[derive(Debug, Default)]
pub struct FeedState {
    pub cache: ViewCache,
    pub drafts: DraftRegistry,
    /// Ids already applied by the live poller or a settlement, with their
    /// timestamps so they can age out of the poll window
    pub seen: HashMap<String, u64>,
}

impl FeedState {
    /// Settle placeholder `temp_id` with its confirmed copy across every
    /// partition. Only the first settlement of a placeholder does anything;
    /// later calls (from the poller or the reconciler, whichever lost) return
    /// `None`.
    pub fn settle(&mut self, temp_id: &str, confirmed: &Arc<Message>) -> Option<Vec<FeedKey>> {
        if !self.drafts.confirm(temp_id, &confirmed.id) {
            return None;
        }
        self.seen.insert(confirmed.id.clone(), confirmed.created_at);
        Some(self.cache.apply_all(|part| cache::with_replacement(part, temp_id, confirmed)))
    }

    /// Insert `msg` into every partition it belongs to: replies next to their
    /// held root, roots at the head of feeds that admit them.
    pub fn project(&mut self, msg: &Arc<Message>) -> Vec<FeedKey> {
        if msg.linkage().is_root() {
            self.cache.apply_all(|part| cache::with_root(part, msg))
        } else {
            self.cache.apply_all(|part| cache::with_reply(part, msg))
        }
    }

    /// Record `msg` as applied. Returns false if it already was.
    pub fn mark_seen(&mut self, msg: &Message) -> bool {
        self.seen.insert(msg.id.clone(), msg.created_at).is_none()
    }

    /// Forget ids older than `cutoff`; polls never look that far back again.
    pub fn expire_seen(&mut self, cutoff: u64) {
        self.seen.retain(|_, at| *at >= cutoff);
    }

    /// Put unsettled placeholders back into `key` after its pages changed.
    fn restore_drafts(&mut self, key: &FeedKey) {
        let placeholders: Vec<Arc<Message>> = self.drafts.unsettled().cloned().collect();
        for placeholder in &placeholders {
            let is_root = placeholder.linkage().is_root();
            self.cache.mutate(key, |part| {
                if is_root {
                    cache::with_root(part, placeholder)
                } else {
                    cache::with_reply(part, placeholder)
                }
            });
        }
    }
}

/// Re-render notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedUpdate {
    PageLoaded { key: FeedKey, added: usize },
    /// These feeds changed outside of pagination
    Changed { keys: Vec<FeedKey> },
    Confirmed { temp_id: String, id: String },
    Failed { temp_id: String },
}

/// Result of asking for the next page of a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageLoad {
    /// A page arrived; `added` messages were new to the feed
    Loaded { added: usize },
    /// Nothing older exists
    Exhausted,
    /// The store failed or timed out; the cursor did not move
    Unavailable,
    /// The feed was unsubscribed or reset while the page was in flight
    Discarded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOutcome {
    pub temp_id: String,
    /// Network id the placeholder settled on
    pub id: String,
}

pub struct FeedEngine<S, P> {
    pub(crate) config: FeedConfig,
    pub(crate) store: S,
    pub(crate) publisher: P,
    pub(crate) state: Mutex<FeedState>,
    updates: broadcast::Sender<FeedUpdate>,
}

impl<S: MessageStore, P: Publisher> FeedEngine<S, P> {
    pub fn new(config: FeedConfig, store: S, publisher: P) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        Self {
            config,
            store,
            publisher,
            state: Mutex::new(FeedState::default()),
            updates,
        }
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    /// Receiver for re-render notifications.
    pub fn updates(&self) -> broadcast::Receiver<FeedUpdate> {
        self.updates.subscribe()
    }

    pub(crate) fn notify(&self, update: FeedUpdate) {
        // No receivers is fine
        let _ = self.updates.send(update);
    }

    pub(crate) fn notify_changed(&self, keys: Vec<FeedKey>) {
        if !keys.is_empty() {
            self.notify(FeedUpdate::Changed { keys });
        }
    }

    // ========================================================================
    // Views
    // ========================================================================

    /// Start observing a feed. Returns its generation.
    pub async fn subscribe(&self, key: FeedKey) -> u64 {
        let mut state = self.state.lock().await;
        let generation = state.cache.subscribe(key.clone(), now());
        tracing::debug!(feed = %key, generation, "subscribed");
        generation
    }

    /// Stop observing a feed. Returns true when this was the last observer
    /// and the feed was dropped.
    pub async fn unsubscribe(&self, key: &FeedKey) -> bool {
        let discarded = self.state.lock().await.cache.unsubscribe(key);
        if discarded {
            tracing::debug!(feed = %key, "feed discarded");
        }
        discarded
    }

    pub async fn snapshot(&self, key: &FeedKey) -> Option<Arc<Partition>> {
        self.state.lock().await.cache.partition(key)
    }

    /// Threaded view of a feed; empty when the feed is not subscribed.
    pub async fn threads(&self, key: &FeedKey) -> Vec<ThreadNode> {
        // Assemble outside the lock, on the snapshot
        self.snapshot(key).await.map(|part| part.threads()).unwrap_or_default()
    }

    /// Fetch the next page of `key`.
    ///
    /// Only an unparseable key is an error; store failures come back as
    /// [`PageLoad::Unavailable`] with the cursor untouched.
    pub async fn load_next_page(&self, key: &FeedKey) -> Result<PageLoad> {
        let (generation, boundary, scope) = {
            let state = self.state.lock().await;
            let Some(part) = state.cache.partition(key) else {
                return Ok(PageLoad::Discarded);
            };
            let Some(boundary) = part.cursor.next_boundary() else {
                return Ok(PageLoad::Exhausted);
            };
            (part.generation, boundary, part.scope.clone())
        };

        let scope = match (key, scope) {
            (FeedKey::Following(follower), None) => {
                let Some(follows) = self.resolve_follows(follower).await? else {
                    return Ok(PageLoad::Unavailable);
                };
                let follows = Arc::new(follows);
                if !self.state.lock().await.cache.set_scope(key, generation, Arc::clone(&follows)) {
                    return Ok(PageLoad::Discarded);
                }
                Some(follows)
            }
            (_, scope) => scope,
        };

        let messages = match self.page_filters(key, boundary, scope.as_deref())? {
            Some(filters) => match self.store.query(filters, self.config.query_timeout()).await {
                Ok(messages) => messages,
                Err(e) => {
                    tracing::warn!(feed = %key, error = %e, "page fetch failed");
                    return Ok(PageLoad::Unavailable);
                }
            },
            // Following nobody
            None => Vec::new(),
        };
        let fetched = messages.len();
        let page = Page::new(boundary, messages.into_iter().map(Arc::new).collect());

        let (added, exhausted) = {
            let mut state = self.state.lock().await;
            let Some(added) = state.cache.append_page(key, generation, page, self.config.page_size) else {
                tracing::debug!(feed = %key, generation, "dropping page for a feed that moved on");
                return Ok(PageLoad::Discarded);
            };
            state.restore_drafts(key);
            let exhausted = state.cache.partition(key).is_some_and(|p| p.cursor.is_exhausted());
            (added, exhausted)
        };

        tracing::debug!(feed = %key, boundary, fetched, added, exhausted, "page loaded");
        self.notify(FeedUpdate::PageLoaded { key: key.clone(), added });
        if fetched == 0 && exhausted {
            Ok(PageLoad::Exhausted)
        } else {
            Ok(PageLoad::Loaded { added })
        }
    }

    /// Drop every page of `key` and load its newest page again. This is how
    /// new root messages surface.
    pub async fn refresh(&self, key: &FeedKey) -> Result<PageLoad> {
        if self.state.lock().await.cache.reset(key, now()).is_none() {
            return Ok(PageLoad::Discarded);
        }
        self.notify_changed(vec![key.clone()]);
        self.load_next_page(key).await
    }

    /// Authors followed by `follower`, from their newest follow list.
    /// `None` when the store could not be reached.
    async fn resolve_follows(&self, follower: &str) -> Result<Option<Vec<String>>> {
        let filter = Filter::new()
            .kind(Kind::from_u16(kind::CONTACT_LIST))
            .author(parse_pubkey(follower)?)
            .limit(1);
        let lists = match self.store.query(vec![filter], self.config.query_timeout()).await {
            Ok(lists) => lists,
            Err(e) => {
                tracing::warn!(error = %e, "follow list fetch failed");
                return Ok(None);
            }
        };

        let follows: Vec<String> = lists
            .iter()
            .max_by_key(|list| list.created_at)
            .map(|list| list.tag_values("p").map(str::to_string).collect())
            .unwrap_or_default();
        tracing::debug!(follows = follows.len(), "follow list resolved");
        Ok(Some(follows))
    }

    /// Filters for the page of `key` ending at `boundary`. `None` means the
    /// feed is empty by construction.
    fn page_filters(&self, key: &FeedKey, boundary: u64, scope: Option<&Vec<String>>) -> Result<Option<Vec<Filter>>> {
        let kind = Kind::from_u16(self.config.kind);
        let until = Timestamp::from_secs(boundary);
        let page = Filter::new().kind(kind).until(until).limit(self.config.page_size);

        let filters = match key {
            FeedKey::Global => match self.config.global_window_secs {
                Some(window) => vec![page.since(Timestamp::from_secs(now().saturating_sub(window)))],
                None => vec![page],
            },
            FeedKey::Following(_) => {
                let authors: Vec<PublicKey> = scope
                    .into_iter()
                    .flatten()
                    .filter_map(|pk| PublicKey::from_hex(pk).ok())
                    .collect();
                if authors.is_empty() {
                    return Ok(None);
                }
                vec![page.authors(authors)]
            }
            FeedKey::Hashtag(tag) => vec![page.hashtag(tag.trim_start_matches('#').to_lowercase())],
            FeedKey::Author(pk) => vec![page.author(parse_pubkey(pk)?)],
            FeedKey::Thread(id) => {
                // The whole thread in one go; the root is older than its replies
                let id = parse_event_id(id)?;
                vec![Filter::new().id(id), Filter::new().kind(kind).event(id).until(until)]
            }
        };
        Ok(Some(filters))
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Stage `draft` as a placeholder, broadcast it and settle it on its
    /// confirmed copy.
    pub async fn publish(&self, draft: Draft) -> Result<PublishOutcome> {
        let placeholder = self.stage(draft).await?;
        self.reconcile(&placeholder).await
    }

    /// Validate `draft` and show it immediately as a pending placeholder.
    pub async fn stage(&self, draft: Draft) -> Result<Arc<Message>> {
        let Some(author) = self.publisher.identity().await else {
            return Err(FeedError::NotAuthenticated);
        };
        if draft.content.trim().is_empty() {
            return Err(FeedError::EmptyDraft);
        }
        if let Some(parent) = draft.reply_to.as_ref().filter(|p| p.is_placeholder()) {
            return Err(FeedError::UnconfirmedParent(parent.id.clone()));
        }

        let placeholder = Arc::new(Message::placeholder(
            author,
            self.config.kind,
            draft.content.clone(),
            draft.tags(),
        ));
        let changed = {
            let mut state = self.state.lock().await;
            state.drafts.register(Arc::clone(&placeholder));
            state.project(&placeholder)
        };

        tracing::info!(temp_id = %placeholder.id, feeds = changed.len(), "draft staged");
        self.notify_changed(changed);
        Ok(placeholder)
    }

    /// Broadcast a staged placeholder, wait for relays to settle, then swap
    /// the placeholder for its confirmed copy.
    ///
    /// On broadcast failure the placeholder stays visible flagged as failed
    /// and the error is returned.
    pub async fn reconcile(&self, placeholder: &Arc<Message>) -> Result<PublishOutcome> {
        let temp_id = placeholder.id.clone();
        let signed = match self
            .broadcast(placeholder.kind, &placeholder.content, &placeholder.tags)
            .await
        {
            Ok(signed) => Arc::new(signed),
            Err(e) => {
                tracing::warn!(temp_id = %temp_id, error = %e, "broadcast failed");
                self.fail_placeholder(&temp_id).await;
                return Err(e);
            }
        };
        tracing::info!(temp_id = %temp_id, id = %signed.id, "broadcast accepted");

        tokio::time::sleep(self.config.settle_delay()).await;
        let confirmed = self
            .find_confirmation(placeholder, &signed)
            .await
            .unwrap_or(signed);

        let (outcome, changed) = {
            let mut state = self.state.lock().await;
            // None when the live poller settled it first, or it was discarded
            let changed = state.settle(&temp_id, &confirmed);
            let id = match state.drafts.state(&temp_id) {
                Some(DraftState::Confirmed(id)) => id.clone(),
                _ => confirmed.id.clone(),
            };
            state.drafts.forget(&temp_id);
            (PublishOutcome { temp_id, id }, changed)
        };

        if let Some(changed) = changed {
            tracing::info!(temp_id = %outcome.temp_id, id = %outcome.id, "draft confirmed");
            self.notify_changed(changed);
            self.notify(FeedUpdate::Confirmed {
                temp_id: outcome.temp_id.clone(),
                id: outcome.id.clone(),
            });
        }
        Ok(outcome)
    }

    /// Sign and send through the publisher, giving up after the publish
    /// timeout.
    async fn broadcast(&self, kind: u16, content: &str, tags: &[Vec<String>]) -> Result<Message> {
        let deadline = self.config.publish_timeout();
        tokio::time::timeout(deadline, self.publisher.publish(kind, content, tags))
            .await
            .map_err(|_| FeedError::Timeout(deadline))?
    }

    /// Look for the network copy of `placeholder`, preferring the exact event
    /// the publisher signed.
    async fn find_confirmation(&self, placeholder: &Message, signed: &Message) -> Option<Arc<Message>> {
        let author = PublicKey::from_hex(&placeholder.author).ok()?;
        let since = now().saturating_sub(self.config.confirm_window_secs);
        let filter = Filter::new()
            .kind(Kind::from_u16(placeholder.kind))
            .author(author)
            .since(Timestamp::from_secs(since));

        let candidates = match self.store.query(vec![filter], self.config.confirm_timeout()).await {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::debug!(error = %e, "confirmation query failed, using the signed event");
                return None;
            }
        };

        if let Some(exact) = candidates.iter().find(|m| m.id == signed.id) {
            return Some(Arc::new(exact.clone()));
        }
        candidates
            .into_iter()
            .filter(|m| drafts::confirms(placeholder, m))
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| b.id.cmp(&a.id)))
            .map(Arc::new)
    }

    async fn fail_placeholder(&self, temp_id: &str) {
        let changed = {
            let mut state = self.state.lock().await;
            match state.drafts.abandon(temp_id) {
                Some(failed) => state
                    .cache
                    .apply_all(|part| cache::with_replacement(part, temp_id, &failed)),
                None => Vec::new(),
            }
        };
        self.notify_changed(changed);
        self.notify(FeedUpdate::Failed { temp_id: temp_id.to_string() });
    }

    /// Remove a local placeholder (typically a failed one) from every feed.
    pub async fn discard_placeholder(&self, temp_id: &str) -> Result<()> {
        let changed = {
            let mut state = self.state.lock().await;
            if state.drafts.forget(temp_id).is_none() {
                return Err(FeedError::UnknownMessage(temp_id.to_string()));
            }
            state.cache.apply_all(|part| cache::without_message(part, temp_id))
        };
        tracing::debug!(temp_id, feeds = changed.len(), "placeholder discarded");
        self.notify_changed(changed);
        Ok(())
    }

    /// Request deletion of one of the local user's messages and drop it from
    /// every feed. Placeholders are only ever local and are just discarded.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let Some(me) = self.publisher.identity().await else {
            return Err(FeedError::NotAuthenticated);
        };
        if id.starts_with(PENDING_PREFIX) {
            return self.discard_placeholder(id).await;
        }

        let target = self
            .state
            .lock()
            .await
            .cache
            .find(id)
            .ok_or_else(|| FeedError::UnknownMessage(id.to_string()))?;
        if target.author != me {
            return Err(FeedError::NotOwner);
        }

        let tags = vec![
            vec!["e".to_string(), id.to_string()],
            vec!["k".to_string(), target.kind.to_string()],
        ];
        let request = self.broadcast(kind::DELETION, "", &tags).await?;
        tracing::info!(id, request = %request.id, "deletion requested");

        self.apply_deletion(id).await;
        Ok(())
    }

    /// Drop `id` (and its thread, if it is a root) from every feed. Returns
    /// whether anything was removed.
    pub async fn apply_deletion(&self, id: &str) -> bool {
        let changed = self.state.lock().await.cache.remove_everywhere(id);
        let removed = !changed.is_empty();
        self.notify_changed(changed);
        removed
    }
}

pub(crate) fn now() -> u64 {
    Timestamp::now().as_secs()
}

fn parse_pubkey(pk: &str) -> Result<PublicKey> {
    PublicKey::parse(pk).map_err(|e| FeedError::InvalidKey(format!("{}: {}", pk, e)))
}

fn parse_event_id(id: &str) -> Result<EventId> {
    EventId::parse(id).map_err(|e| FeedError::InvalidKey(format!("{}: {}", id, e)))
}
