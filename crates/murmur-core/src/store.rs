//! Collaborators the engine talks to: a message store to read from and a
//! publisher to write through, plus their relay-backed implementations.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use nostr_sdk::prelude::*;

use crate::error::{FeedError, Result, ResultExt};
use crate::message::{to_nostr_tags, Message};

/// Extra time granted on top of the relay-side timeout before the whole
/// query is abandoned.
const TIMEOUT_GRACE: Duration = Duration::from_millis(500);

/// Read side: answers filter queries from one or more relays.
pub trait MessageStore: Send + Sync {
    /// Messages matching any of `filters`, de-duplicated by id, unordered.
    fn query(&self, filters: Vec<Filter>, timeout: Duration) -> impl Future<Output = Result<Vec<Message>>> + Send;
}

/// Write side: signs and broadcasts on behalf of the local user.
pub trait Publisher: Send + Sync {
    /// Hex public key of the signing identity, `None` when logged out.
    fn identity(&self) -> impl Future<Output = Option<String>> + Send;

    /// Sign and broadcast. Returns the signed message once at least one relay
    /// accepted it.
    fn publish(&self, kind: u16, content: &str, tags: &[Vec<String>]) -> impl Future<Output = Result<Message>> + Send;
}

impl<T: MessageStore> MessageStore for Arc<T> {
    fn query(&self, filters: Vec<Filter>, timeout: Duration) -> impl Future<Output = Result<Vec<Message>>> + Send {
        (**self).query(filters, timeout)
    }
}

impl<T: Publisher> Publisher for Arc<T> {
    fn identity(&self) -> impl Future<Output = Option<String>> + Send {
        (**self).identity()
    }

    fn publish(&self, kind: u16, content: &str, tags: &[Vec<String>]) -> impl Future<Output = Result<Message>> + Send {
        (**self).publish(kind, content, tags)
    }
}

// ============================================================================
// Relay-backed implementations
// ============================================================================

/// [`MessageStore`] over the nostr-sdk relay pool.
#[derive(Clone)]
pub struct RelayStore {
    client: Client,
}

impl RelayStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl MessageStore for RelayStore {
    async fn query(&self, filters: Vec<Filter>, timeout: Duration) -> Result<Vec<Message>> {
        let fetches = filters.into_iter().map(|filter| self.client.fetch_events(filter, timeout));
        let results = tokio::time::timeout(timeout + TIMEOUT_GRACE, join_all(fetches))
            .await
            .map_err(|_| FeedError::Timeout(timeout))?;

        let mut seen = HashSet::new();
        let mut messages = Vec::new();
        let mut answered = 0;
        let mut last_error = None;
        for result in results {
            match result {
                Ok(events) => {
                    answered += 1;
                    for event in events.into_iter() {
                        if seen.insert(event.id) {
                            messages.push(Message::from(&event));
                        }
                    }
                }
                Err(e) => last_error = Some(e),
            }
        }

        // Partial answers are still answers; only a total failure is an error
        match last_error {
            Some(e) if answered == 0 => Err(e).transport("fetch events"),
            _ => Ok(messages),
        }
    }
}

/// [`Publisher`] using the client's signer and relay pool.
#[derive(Clone)]
pub struct RelayPublisher {
    client: Client,
}

impl RelayPublisher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl Publisher for RelayPublisher {
    async fn identity(&self) -> Option<String> {
        let signer = self.client.signer().await.ok()?;
        signer.get_public_key().await.ok().map(|pk| pk.to_hex())
    }

    async fn publish(&self, kind: u16, content: &str, tags: &[Vec<String>]) -> Result<Message> {
        let builder = EventBuilder::new(Kind::from_u16(kind), content).tags(to_nostr_tags(tags));
        let event = self.client.sign_event_builder(builder).await.transport("sign event")?;

        let output = self.client.send_event(&event).await.transport("broadcast event")?;
        if output.success.is_empty() {
            return Err(FeedError::Transport(format!(
                "no relay accepted {} ({} failed)",
                event.id,
                output.failed.len()
            )));
        }
        tracing::debug!(id = %event.id, accepted = output.success.len(), "event broadcast");
        Ok(Message::from(&event))
    }
}
