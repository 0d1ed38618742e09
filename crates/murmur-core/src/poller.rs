//! Live update poller.
//!
//! Every few seconds the poller asks the store for replies to any thread the
//! engine currently shows, plus deletion requests for anything it holds, over
//! a short lookback window. Windows overlap from one poll to the next, so
//! every result is checked against the `seen` set and applied at most once.
//!
//! New root messages are never injected; they surface on the next page load
//! or refresh.

use std::collections::BTreeSet;
use std::sync::Arc;

use nostr_sdk::prelude::{EventId, Filter, Kind, Timestamp};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::cache::FeedKey;
use crate::error::Result;
use crate::feed::{now, FeedEngine, FeedUpdate};
use crate::message::kind;
use crate::store::{MessageStore, Publisher};

/// What a single poll changed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollReport {
    /// Replies inserted next to their root
    pub replies: usize,
    /// Placeholders settled on their confirmed copy
    pub confirmed: usize,
    /// Messages removed by deletion requests
    pub deleted: usize,
}

impl<S: MessageStore, P: Publisher> FeedEngine<S, P> {
    /// Run one poll cycle.
    pub async fn poll_once(&self) -> Result<PollReport> {
        let (roots, held) = {
            let state = self.state.lock().await;
            let mut roots = BTreeSet::new();
            let mut held = BTreeSet::new();
            for key in state.cache.keys() {
                let Some(part) = state.cache.partition(&key) else {
                    continue;
                };
                if let FeedKey::Thread(id) = &key {
                    roots.insert(id.clone());
                }
                roots.extend(part.root_ids().map(str::to_string));
                held.extend(part.messages().map(|m| m.id.clone()));
            }
            (roots, held)
        };

        // Placeholders have no network id and are skipped here
        let root_ids = event_ids(&roots);
        if root_ids.is_empty() {
            return Ok(PollReport::default());
        }
        let since = Timestamp::from_secs(now().saturating_sub(self.config.poll_lookback_secs));
        let mut filters = vec![Filter::new()
            .kind(Kind::from_u16(self.config.kind))
            .events(root_ids)
            .since(since)];
        let held_ids = event_ids(&held);
        if !held_ids.is_empty() {
            filters.push(
                Filter::new()
                    .kind(Kind::from_u16(kind::DELETION))
                    .events(held_ids)
                    .since(since),
            );
        }
        let messages = self.store.query(filters, self.config.query_timeout()).await?;

        let mut report = PollReport::default();
        let mut changed: Vec<FeedKey> = Vec::new();
        let mut confirmations = Vec::new();
        {
            let mut state = self.state.lock().await;
            state.expire_seen(since.as_secs());
            for msg in messages {
                if !state.mark_seen(&msg) || state.cache.is_removed(&msg.id) {
                    continue;
                }

                if msg.kind == kind::DELETION {
                    for target in msg.tag_values("e") {
                        let Some(found) = state.cache.find(target) else {
                            continue;
                        };
                        if found.author != msg.author {
                            tracing::debug!(target, "ignoring deletion by someone other than the author");
                            continue;
                        }
                        let keys = state.cache.remove_everywhere(target);
                        if !keys.is_empty() {
                            report.deleted += 1;
                            merge(&mut changed, keys);
                        }
                    }
                    continue;
                }

                if msg.kind != self.config.kind || msg.linkage().is_root() {
                    continue;
                }
                let msg = Arc::new(msg);
                if let Some(temp_id) = state.drafts.match_confirmation(&msg) {
                    if let Some(keys) = state.settle(&temp_id, &msg) {
                        report.confirmed += 1;
                        merge(&mut changed, keys);
                        confirmations.push((temp_id, msg.id.clone()));
                    }
                    continue;
                }
                let keys = state.project(&msg);
                if !keys.is_empty() {
                    report.replies += 1;
                    merge(&mut changed, keys);
                }
            }
        }

        if report != PollReport::default() {
            tracing::debug!(
                replies = report.replies,
                confirmed = report.confirmed,
                deleted = report.deleted,
                "live poll applied"
            );
        }
        self.notify_changed(changed);
        for (temp_id, id) in confirmations {
            self.notify(FeedUpdate::Confirmed { temp_id, id });
        }
        Ok(report)
    }
}

fn event_ids(ids: &BTreeSet<String>) -> Vec<EventId> {
    ids.iter().filter_map(|id| EventId::from_hex(id).ok()).collect()
}

fn merge(into: &mut Vec<FeedKey>, keys: Vec<FeedKey>) {
    for key in keys {
        if !into.contains(&key) {
            into.push(key);
        }
    }
}

/// Handle to a running poller. Dropping it stops the loop.
pub struct PollerHandle {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl PollerHandle {
    /// Stop the loop and wait for an in-flight poll to finish.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

/// Poll `engine` on its configured interval until the handle is stopped or
/// dropped. A failed poll is logged and the next tick tries again.
pub fn spawn_poller<S, P>(engine: Arc<FeedEngine<S, P>>) -> PollerHandle
where
    S: MessageStore + 'static,
    P: Publisher + 'static,
{
    let (stop, mut stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(engine.config().poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = &mut stopped => break,
                _ = ticker.tick() => {
                    if let Err(e) = engine.poll_once().await {
                        tracing::warn!(error = %e, "live poll failed");
                    }
                }
            }
        }
        tracing::debug!("poller stopped");
    });

    PollerHandle {
        stop: Some(stop),
        task: Some(task),
    }
}
