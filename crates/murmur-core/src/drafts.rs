//! Optimistic drafts.
//!
//! A published draft is shown immediately as a placeholder carrying a
//! temporary id. Each placeholder walks a one-way state machine:
//!
//! ```text
//! Pending ──confirmed copy found──▶ Confirmed(id)
//!    │
//!    └──────broadcast failed──────▶ Abandoned
//! ```
//!
//! Both the reconciler and the live poller settle placeholders through
//! [`DraftRegistry::confirm`], keyed by temporary id, so whichever notices the
//! confirmed copy first wins and the other becomes a no-op.

use std::collections::HashMap;
use std::sync::Arc;

use crate::message::{reply_tags, Message};

/// What the local user wants to publish.
#[derive(Debug, Clone, PartialEq)]
pub struct Draft {
    /// Content reference, typically an uploaded media URL
    pub content: String,
    /// Message being replied to, if any
    pub reply_to: Option<Arc<Message>>,
    /// Hashtags for root posts
    pub hashtags: Vec<String>,
}

impl Draft {
    pub fn root(content: impl Into<String>) -> Self {
        Self { content: content.into(), reply_to: None, hashtags: Vec::new() }
    }

    pub fn reply(parent: Arc<Message>, content: impl Into<String>) -> Self {
        Self { content: content.into(), reply_to: Some(parent), hashtags: Vec::new() }
    }

    pub fn with_hashtag(mut self, hashtag: impl Into<String>) -> Self {
        self.hashtags.push(hashtag.into());
        self
    }

    /// Tags the published event will carry.
    pub fn tags(&self) -> Vec<Vec<String>> {
        match &self.reply_to {
            Some(parent) => reply_tags(parent),
            None => self
                .hashtags
                .iter()
                .map(|t| vec!["t".to_string(), t.trim_start_matches('#').to_lowercase()])
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DraftState {
    Pending,
    /// Settled with the network id of the confirmed copy
    Confirmed(String),
    /// Broadcast failed; the placeholder stays visible, flagged failed
    Abandoned,
}

#[derive(Debug, Clone)]
pub struct PendingDraft {
    pub placeholder: Arc<Message>,
    pub state: DraftState,
}

/// Outstanding placeholders keyed by temporary id.
#[derive(Debug, Default)]
pub struct DraftRegistry {
    drafts: HashMap<String, PendingDraft>,
}

impl DraftRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, placeholder: Arc<Message>) {
        self.drafts.insert(
            placeholder.id.clone(),
            PendingDraft { placeholder, state: DraftState::Pending },
        );
    }

    pub fn state(&self, temp_id: &str) -> Option<&DraftState> {
        self.drafts.get(temp_id).map(|d| &d.state)
    }

    /// `Pending → Confirmed`. Returns false if the draft is unknown or was
    /// already settled.
    pub fn confirm(&mut self, temp_id: &str, confirmed_id: &str) -> bool {
        match self.drafts.get_mut(temp_id) {
            Some(draft) if draft.state == DraftState::Pending => {
                draft.state = DraftState::Confirmed(confirmed_id.to_string());
                true
            }
            _ => false,
        }
    }

    /// `Pending → Abandoned`. Returns the placeholder copy flagged failed.
    pub fn abandon(&mut self, temp_id: &str) -> Option<Arc<Message>> {
        match self.drafts.get_mut(temp_id) {
            Some(draft) if draft.state == DraftState::Pending => {
                draft.state = DraftState::Abandoned;
                draft.placeholder = Arc::new(draft.placeholder.as_failed());
                Some(Arc::clone(&draft.placeholder))
            }
            _ => None,
        }
    }

    pub fn forget(&mut self, temp_id: &str) -> Option<PendingDraft> {
        self.drafts.remove(temp_id)
    }

    /// Placeholders that still belong on screen: pending or failed.
    pub fn unsettled(&self) -> impl Iterator<Item = &Arc<Message>> {
        self.drafts
            .values()
            .filter(|d| !matches!(d.state, DraftState::Confirmed(_)))
            .map(|d| &d.placeholder)
    }

    /// Temporary id of the oldest pending placeholder that `msg` confirms.
    pub fn match_confirmation(&self, msg: &Message) -> Option<String> {
        self.drafts
            .values()
            .filter(|d| d.state == DraftState::Pending && confirms(&d.placeholder, msg))
            .min_by(|a, b| {
                a.placeholder
                    .created_at
                    .cmp(&b.placeholder.created_at)
                    .then_with(|| a.placeholder.id.cmp(&b.placeholder.id))
            })
            .map(|d| d.placeholder.id.clone())
    }
}

/// Whether `candidate` is the network copy of `placeholder`: same author,
/// kind, content and thread linkage.
pub fn confirms(placeholder: &Message, candidate: &Message) -> bool {
    !candidate.is_placeholder()
        && candidate.author == placeholder.author
        && candidate.kind == placeholder.kind
        && candidate.content == placeholder.content
        && candidate.linkage() == placeholder.linkage()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::kind::VOICE_MESSAGE;

    fn parent() -> Arc<Message> {
        Arc::new(Message::new("root", "alice", 100, VOICE_MESSAGE, "https://m/a.webm"))
    }

    fn placeholder_for(draft: &Draft) -> Arc<Message> {
        Arc::new(Message::placeholder("me", VOICE_MESSAGE, draft.content.clone(), draft.tags()))
    }

    fn network_copy(of: &Message, id: &str) -> Message {
        let mut msg = Message::new(id, of.author.clone(), of.created_at + 1, of.kind, of.content.clone())
            .with_tags(of.tags.clone());
        msg.sig = "sig".into();
        msg
    }

    #[test]
    fn root_drafts_carry_normalized_hashtags() {
        let draft = Draft::root("https://m/x.webm").with_hashtag("#Music");
        assert_eq!(draft.tags(), vec![vec!["t".to_string(), "music".to_string()]]);
    }

    #[test]
    fn reply_drafts_link_to_parent() {
        let draft = Draft::reply(parent(), "https://m/r.webm").with_hashtag("ignored");
        let tags = draft.tags();
        assert_eq!(tags.len(), 3);
        assert_eq!(tags[0], vec!["e", "root", "", "root"]);
    }

    #[test]
    fn settles_once() {
        let draft = Draft::reply(parent(), "https://m/r.webm");
        let ph = placeholder_for(&draft);
        let mut registry = DraftRegistry::new();
        registry.register(Arc::clone(&ph));
        assert_eq!(registry.state(&ph.id), Some(&DraftState::Pending));

        assert!(registry.confirm(&ph.id, "real"));
        assert!(!registry.confirm(&ph.id, "other"));
        assert!(registry.abandon(&ph.id).is_none());
        assert_eq!(registry.unsettled().count(), 0);
        assert_eq!(registry.state(&ph.id), Some(&DraftState::Confirmed("real".into())));
        assert!(registry.forget(&ph.id).is_some());
        assert_eq!(registry.state(&ph.id), None);
    }

    #[test]
    fn abandoned_drafts_cannot_confirm() {
        let ph = placeholder_for(&Draft::root("https://m/x.webm"));
        let mut registry = DraftRegistry::new();
        registry.register(Arc::clone(&ph));

        let failed = registry.abandon(&ph.id).unwrap();
        assert!(failed.failed && failed.id == ph.id);
        assert!(registry.unsettled().all(|m| m.failed));
        assert!(!registry.confirm(&ph.id, "real"));
        assert!(registry.match_confirmation(&network_copy(&ph, "real")).is_none());
    }

    #[test]
    fn matches_only_identical_content_and_linkage() {
        let draft = Draft::reply(parent(), "https://m/r.webm");
        let ph = placeholder_for(&draft);
        let mut registry = DraftRegistry::new();
        registry.register(Arc::clone(&ph));

        assert_eq!(registry.match_confirmation(&network_copy(&ph, "real")), Some(ph.id.clone()));

        let mut other_content = network_copy(&ph, "real2");
        other_content.content = "https://m/other.webm".into();
        assert!(registry.match_confirmation(&other_content).is_none());

        let mut other_author = network_copy(&ph, "real3");
        other_author.author = "someone".into();
        assert!(registry.match_confirmation(&other_author).is_none());

        let mut other_thread = network_copy(&ph, "real4");
        other_thread.tags = Vec::new();
        assert!(registry.match_confirmation(&other_thread).is_none());
    }

    #[test]
    fn oldest_placeholder_matches_first() {
        let draft = Draft::reply(parent(), "https://m/same.webm");
        let mut registry = DraftRegistry::new();

        let mut first = (*placeholder_for(&draft)).clone();
        first.created_at = 10;
        let mut second = (*placeholder_for(&draft)).clone();
        second.created_at = 20;
        registry.register(Arc::new(second));
        registry.register(Arc::new(first.clone()));

        assert_eq!(registry.match_confirmation(&network_copy(&first, "real")), Some(first.id));
    }
}
