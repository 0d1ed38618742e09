//! Thread reconstruction.
//!
//! Turns an unordered, possibly duplicated batch of messages into a forest of
//! roots with nested replies. Assembly is a pure function of the message set,
//! so it is simply re-run whenever a feed changes: a late reply finds its
//! resident parent and a late parent absorbs the replies that were waiting for
//! it, without any incremental bookkeeping.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use serde::Serialize;

use crate::message::Message;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThreadNode {
    pub message: Arc<Message>,
    /// Direct replies, oldest first
    pub replies: Vec<ThreadNode>,
}

impl ThreadNode {
    /// Number of messages below this node.
    pub fn descendant_count(&self) -> usize {
        self.replies.iter().map(|r| 1 + r.descendant_count()).sum()
    }

    /// Depth-first search for `id` in this subtree.
    pub fn find(&self, id: &str) -> Option<&ThreadNode> {
        if self.message.id == id {
            return Some(self);
        }
        self.replies.iter().find_map(|r| r.find(id))
    }
}

/// Where a message ends up in the forest.
enum Placement<'a> {
    Root,
    Child(&'a str),
    Dropped,
}

/// Assemble `messages` into threads, newest root first.
///
/// Messages whose declared root is missing, replies without a root marker,
/// and anything not reachable from a root are dropped rather than promoted.
pub fn assemble<'a, I>(messages: I) -> Vec<ThreadNode>
where
    I: IntoIterator<Item = &'a Arc<Message>>,
{
    // First pass: index by id, first-seen wins
    let mut by_id: HashMap<&'a str, &'a Arc<Message>> = HashMap::new();
    let mut order: Vec<&'a Arc<Message>> = Vec::new();
    for msg in messages {
        if let Entry::Vacant(slot) = by_id.entry(msg.id.as_str()) {
            slot.insert(msg);
            order.push(msg);
        }
    }

    // Second pass: link every message to its parent
    let mut roots = Vec::new();
    let mut children: HashMap<&'a str, Vec<&'a Arc<Message>>> = HashMap::new();
    for msg in order {
        match placement(msg, &by_id) {
            Placement::Root => roots.push(msg),
            Placement::Child(parent) => children.entry(parent).or_default().push(msg),
            Placement::Dropped => {
                tracing::trace!(id = %msg.id, "dropping message with unreachable thread root");
            }
        }
    }

    let mut forest: Vec<ThreadNode> = roots.into_iter().map(|r| build(r, &mut children)).collect();
    forest.sort_by(newest_first);
    forest
}

/// Every message of a forest, parents before their replies.
pub fn flatten(nodes: &[ThreadNode]) -> Vec<Arc<Message>> {
    let mut out = Vec::new();
    let mut stack: Vec<&ThreadNode> = nodes.iter().rev().collect();
    while let Some(node) = stack.pop() {
        out.push(Arc::clone(&node.message));
        stack.extend(node.replies.iter().rev());
    }
    out
}

fn placement<'a>(msg: &'a Message, by_id: &HashMap<&'a str, &'a Arc<Message>>) -> Placement<'a> {
    let link = msg.linkage();
    match link.root {
        // A message cannot root its own thread
        Some(root) if root == msg.id => Placement::Dropped,
        Some(root) if by_id.contains_key(root) => {
            // Nest under the immediate parent when it lives in the same thread
            let parent = link
                .reply
                .filter(|reply| *reply != msg.id)
                .and_then(|reply| by_id.get(reply).copied())
                .filter(|p| p.id == root || p.linkage().root == Some(root))
                .map(|p| p.id.as_str());
            Placement::Child(parent.unwrap_or(root))
        }
        Some(_) => Placement::Dropped,
        None if link.reply.is_none() => Placement::Root,
        None => Placement::Dropped,
    }
}

fn build<'a>(msg: &'a Arc<Message>, children: &mut HashMap<&'a str, Vec<&'a Arc<Message>>>) -> ThreadNode {
    // Removing the entry means each subtree is visited once
    let kids = children.remove(msg.id.as_str()).unwrap_or_default();
    let mut replies: Vec<ThreadNode> = kids.into_iter().map(|k| build(k, children)).collect();
    replies.sort_by(oldest_first);
    ThreadNode { message: Arc::clone(msg), replies }
}

fn oldest_first(a: &ThreadNode, b: &ThreadNode) -> Ordering {
    a.message
        .created_at
        .cmp(&b.message.created_at)
        .then_with(|| a.message.id.cmp(&b.message.id))
}

fn newest_first(a: &ThreadNode, b: &ThreadNode) -> Ordering {
    b.message
        .created_at
        .cmp(&a.message.created_at)
        .then_with(|| a.message.id.cmp(&b.message.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::kind::VOICE_MESSAGE;

    fn root(id: &str, at: u64) -> Arc<Message> {
        Arc::new(Message::new(id, "author", at, VOICE_MESSAGE, "https://media/x.webm"))
    }

    fn reply(id: &str, root: &str, parent: &str, at: u64) -> Arc<Message> {
        Arc::new(Message::new(id, "author", at, VOICE_MESSAGE, "https://media/y.webm").with_tags(vec![
            vec!["e".into(), root.into(), "".into(), "root".into()],
            vec!["e".into(), parent.into(), "".into(), "reply".into()],
        ]))
    }

    fn ids(nodes: &[ThreadNode]) -> Vec<&str> {
        nodes.iter().map(|n| n.message.id.as_str()).collect()
    }

    #[test]
    fn nested_replies_are_not_flattened() {
        let set = vec![root("A", 100), reply("B", "A", "A", 110), reply("C", "A", "B", 120)];
        let forest = assemble(&set);

        assert_eq!(ids(&forest), vec!["A"]);
        assert_eq!(ids(&forest[0].replies), vec!["B"]);
        assert_eq!(ids(&forest[0].replies[0].replies), vec!["C"]);
        assert_eq!(forest[0].descendant_count(), 2);
    }

    #[test]
    fn orphans_never_surface() {
        let set = vec![root("A", 100), reply("X", "missing", "missing", 130)];
        let forest = assemble(&set);

        assert_eq!(ids(&forest), vec!["A"]);
        assert!(forest[0].replies.is_empty());
        assert!(forest.iter().all(|n| n.find("X").is_none()));
    }

    #[test]
    fn reply_marker_without_root_is_dropped() {
        let lone = Arc::new(Message::new("R", "author", 5, VOICE_MESSAGE, "u").with_tags(vec![vec![
            "e".into(),
            "A".into(),
            "".into(),
            "reply".into(),
        ]]));
        let forest = assemble(&[root("A", 1), lone]);
        assert_eq!(ids(&forest), vec!["A"]);
        assert!(forest[0].replies.is_empty());
    }

    #[test]
    fn self_rooted_message_is_dropped() {
        let forest = assemble(&[reply("S", "S", "S", 10)]);
        assert!(forest.is_empty());
    }

    #[test]
    fn missing_parent_falls_back_to_root() {
        let forest = assemble(&[root("A", 100), reply("C", "A", "B", 120)]);
        assert_eq!(ids(&forest[0].replies), vec!["C"]);
    }

    #[test]
    fn parent_from_another_thread_is_ignored() {
        let set = vec![root("A", 100), root("Z", 90), reply("C", "A", "Z", 120)];
        let forest = assemble(&set);
        assert_eq!(ids(&forest), vec!["A", "Z"]);
        assert_eq!(ids(&forest[0].replies), vec!["C"]);
        assert!(forest[1].replies.is_empty());
    }

    #[test]
    fn reply_cycles_are_dropped() {
        let set = vec![root("A", 100), reply("B", "A", "C", 110), reply("C", "A", "B", 120)];
        let forest = assemble(&set);
        assert_eq!(ids(&forest), vec!["A"]);
        assert!(forest[0].replies.is_empty());
    }

    #[test]
    fn ordering_roots_desc_replies_asc() {
        let set = vec![
            root("old", 10),
            reply("late", "new", "new", 300),
            root("new", 200),
            reply("early", "new", "new", 250),
        ];
        let forest = assemble(&set);
        assert_eq!(ids(&forest), vec!["new", "old"]);
        assert_eq!(ids(&forest[0].replies), vec!["early", "late"]);
    }

    #[test]
    fn duplicates_keep_first_seen() {
        let first = root("A", 100);
        let mut other = (*first).clone();
        other.content = "https://other/relay/copy.webm".into();
        let forest = assemble(&[first.clone(), Arc::new(other)]);

        assert_eq!(forest.len(), 1);
        assert_eq!(forest[0].message.content, first.content);
    }

    #[test]
    fn late_parent_absorbs_waiting_replies() {
        let mut set = vec![reply("B", "A", "A", 110), reply("C", "A", "B", 120)];
        assert!(assemble(&set).is_empty());

        set.push(root("A", 100));
        let forest = assemble(&set);
        assert_eq!(ids(&forest), vec!["A"]);
        assert_eq!(forest[0].descendant_count(), 2);
    }

    #[test]
    fn assembly_is_a_fixed_point() {
        let sets = vec![
            vec![root("A", 100), reply("B", "A", "A", 110), reply("C", "A", "B", 120)],
            vec![
                root("A", 100),
                root("D", 100),
                reply("X", "gone", "gone", 1),
                reply("B", "A", "Q", 110),
                reply("Q", "A", "B", 111),
                reply("E", "D", "D", 140),
                reply("E", "A", "A", 150),
            ],
            vec![],
        ];

        for set in sets {
            let once = assemble(&set);
            let flat = flatten(&once);
            assert_eq!(assemble(&flat), once);
        }
    }

    #[test]
    fn flatten_is_preorder() {
        let set = vec![root("A", 100), reply("B", "A", "A", 110), reply("C", "A", "B", 120), root("D", 50)];
        let flat = flatten(&assemble(&set));
        let flat_ids: Vec<&str> = flat.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(flat_ids, vec!["A", "B", "C", "D"]);
    }
}
