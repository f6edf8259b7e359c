//! Rebuilds reply trees from the parent pointers stored on messages.

use serde::Serialize;
use tracing::debug;

use crate::db::Database;
use crate::error::StorageResult;
use crate::models::Message;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageNode {
    pub message: Message,
    pub replies: Vec<MessageNode>,
}

/// A thread as returned to callers: the tree plus its derived metrics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadView {
    pub tree: MessageNode,
    pub depth: usize,
    pub message_count: usize,
}

pub struct ThreadReconstructor {
    db: Database,
}

impl ThreadReconstructor {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Builds the tree under `root`, depth-first, children in timestamp
    /// order. Reply graphs are assumed acyclic.
    pub fn build_thread_tree(&self, root: Message) -> StorageResult<MessageNode> {
        let replies = self
            .db
            .get_replies(&root.id)?
            .into_iter()
            .map(|reply| self.build_thread_tree(reply))
            .collect::<StorageResult<Vec<_>>>()?;
        Ok(MessageNode {
            message: root,
            replies,
        })
    }

    /// Looks up `message_id` and builds its thread. `None` if no such message
    /// is stored. A message whose parent is missing is just a root.
    pub fn thread_view(&self, message_id: &str) -> StorageResult<Option<ThreadView>> {
        let Some(root) = self.db.find_message(message_id)? else {
            debug!("Thread root {} not found", message_id);
            return Ok(None);
        };
        let tree = self.build_thread_tree(root)?;
        Ok(Some(ThreadView {
            depth: get_thread_depth(&tree),
            message_count: count_thread_messages(&tree),
            tree,
        }))
    }
}

pub fn get_thread_depth(node: &MessageNode) -> usize {
    1 + node.replies.iter().map(get_thread_depth).max().unwrap_or(0)
}

pub fn count_thread_messages(node: &MessageNode) -> usize {
    1 + node.replies.iter().map(count_thread_messages).sum::<usize>()
}

/// Pre-order: the node, then each reply subtree in order.
pub fn flatten_thread(node: &MessageNode) -> Vec<&Message> {
    let mut out = Vec::with_capacity(count_thread_messages(node));
    collect(node, &mut out);
    out
}

fn collect<'a>(node: &'a MessageNode, out: &mut Vec<&'a Message>) {
    out.push(&node.message);
    for reply in &node.replies {
        collect(reply, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{message, seeded_db};

    fn ids(node: &MessageNode) -> Vec<&str> {
        flatten_thread(node).into_iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn test_reply_chain() {
        let db = seeded_db();
        db.insert_message(&message("m1", "c1", "2024-01-01T00:00:00Z", None)).unwrap();
        db.insert_message(&message("m2", "c1", "2024-01-01T00:01:00Z", Some("m1"))).unwrap();
        db.insert_message(&message("m3", "c1", "2024-01-01T00:02:00Z", Some("m2"))).unwrap();
        db.insert_message(&message("m4", "c1", "2024-01-01T00:03:00Z", None)).unwrap();

        let threads = ThreadReconstructor::new(db.clone());
        let root = db.get_message("c1", "m1").unwrap().unwrap();
        let tree = threads.build_thread_tree(root).unwrap();

        assert_eq!(get_thread_depth(&tree), 3);
        assert_eq!(count_thread_messages(&tree), 3);
        assert_eq!(ids(&tree), vec!["m1", "m2", "m3"]);

        let lone = threads.thread_view("m4").unwrap().unwrap();
        assert_eq!(lone.depth, 1);
        assert_eq!(lone.message_count, 1);
        assert!(lone.tree.replies.is_empty());
    }

    #[test]
    fn test_branching_tree() {
        let db = seeded_db();
        db.insert_message(&message("m1", "c1", "2024-01-01T00:00:00Z", None)).unwrap();
        db.insert_message(&message("m2", "c1", "2024-01-01T00:01:00Z", Some("m1"))).unwrap();
        db.insert_message(&message("m3", "c1", "2024-01-01T00:02:00Z", Some("m1"))).unwrap();
        db.insert_message(&message("m4", "c1", "2024-01-01T00:03:00Z", Some("m2"))).unwrap();

        let view = ThreadReconstructor::new(db).thread_view("m1").unwrap().unwrap();
        assert_eq!(view.message_count, 4);
        assert_eq!(view.depth, 3);
        assert_eq!(ids(&view.tree), vec!["m1", "m2", "m4", "m3"]);
        assert_eq!(flatten_thread(&view.tree).len(), view.message_count);
    }

    #[test]
    fn test_broken_parent_is_a_root() {
        let db = seeded_db();
        db.insert_message(&message("m5", "c1", "2024-01-01T00:00:00Z", Some("gone"))).unwrap();
        db.insert_message(&message("m6", "c1", "2024-01-01T00:01:00Z", Some("m5"))).unwrap();

        let view = ThreadReconstructor::new(db).thread_view("m5").unwrap().unwrap();
        assert_eq!(view.depth, 2);
        assert_eq!(ids(&view.tree), vec!["m5", "m6"]);
    }

    #[test]
    fn test_missing_message_has_no_view() {
        let db = seeded_db();
        assert!(ThreadReconstructor::new(db).thread_view("nope").unwrap().is_none());
    }

    #[test]
    fn test_view_serializes_camel_case() {
        let db = seeded_db();
        db.insert_message(&message("m1", "c1", "2024-01-01T00:00:00Z", None)).unwrap();
        let view = ThreadReconstructor::new(db).thread_view("m1").unwrap().unwrap();
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["messageCount"], 1);
        assert_eq!(json["tree"]["message"]["id"], "m1");
        assert!(json["tree"]["replies"].as_array().unwrap().is_empty());
    }
}
