//! Recent-activity continuity resolution.
//!
//! A message that arrives without an explicit reply reference may still be
//! a follow-up: users rarely press "reply" between consecutive voice or
//! text messages. The resolver finds the most recently finished node of the
//! same chat and user inside the configured window so the new message can
//! attach there and inherit the agent session.

use crate::tree::TreeQueue;
use crate::tree::node::MessageNode;
use chrono::{DateTime, Utc};

/// Find the best continuity anchor for a reply-less message.
///
/// Candidates are nodes whose `chat_id`/`user_id` match, whose state is
/// terminal (`Completed` or `Error` both qualify, since a follow-up after a
/// failure should land in the same conversation), and whose `completed_at`
/// lies within `window_minutes` of `now`. The most recent wins; equal
/// stamps break toward the greater node id so the choice is deterministic.
///
/// A zero window disables continuity detection entirely.
pub fn find_continuity_anchor(
    queue: &TreeQueue,
    chat_id: &str,
    user_id: &str,
    window_minutes: u64,
    now: DateTime<Utc>,
) -> Option<String> {
    if window_minutes == 0 {
        return None;
    }
    let window = chrono::Duration::minutes(window_minutes as i64);

    queue.visit_trees(|trees| {
        let mut best: Option<(DateTime<Utc>, String)> = None;
        for tree in trees {
            for node in tree.nodes.values() {
                if node.chat_id != chat_id || node.user_id != user_id {
                    continue;
                }
                if !node.is_recent_terminal(now, window) {
                    continue;
                }
                if beats_current(node, best.as_ref()) {
                    let completed_at = node.completed_at.expect("terminal anchor is stamped");
                    best = Some((completed_at, node.node_id.clone()));
                }
            }
        }
        best.map(|(_, node_id)| node_id)
    })
}

fn beats_current(node: &MessageNode, best: Option<&(DateTime<Utc>, String)>) -> bool {
    let completed_at = match node.completed_at {
        Some(completed_at) => completed_at,
        None => return false,
    };
    match best {
        None => true,
        Some((best_at, best_id)) => {
            completed_at > *best_at || (completed_at == *best_at && node.node_id > *best_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::find_continuity_anchor;
    use crate::IncomingMessage;
    use crate::tree::{MessageNode, MessageState, MessageTree, TreeQueue};
    use chrono::{DateTime, Duration, Utc};

    fn incoming(message_id: &str, chat_id: &str, user_id: &str) -> IncomingMessage {
        IncomingMessage {
            text: "hola".to_string(),
            chat_id: chat_id.to_string(),
            user_id: user_id.to_string(),
            message_id: message_id.to_string(),
            reply_to_message_id: None,
            timestamp: Utc::now(),
        }
    }

    /// Register a single-node tree whose root finished in `state` at `at`.
    /// Building the snapshot directly keeps the completion stamp exact.
    fn seed_terminal_tree(
        queue: &TreeQueue,
        node_id: &str,
        chat_id: &str,
        user_id: &str,
        state: MessageState,
        at: DateTime<Utc>,
    ) {
        let mut root = MessageNode::new_root(&incoming(node_id, chat_id, user_id));
        root.state = state;
        root.completed_at = Some(at);
        if state == MessageState::Error {
            root.error = Some("boom".to_string());
        }
        root.session_id = Some(format!("session-{node_id}"));
        queue.restore_tree(MessageTree::new(root)).expect("seed tree");
    }

    #[test]
    fn anchors_to_recent_activity_inside_the_window() {
        let queue = TreeQueue::new();
        let t0 = Utc::now();
        seed_terminal_tree(&queue, "m1", "1", "9", MessageState::Completed, t0);

        let at_9m = find_continuity_anchor(&queue, "1", "9", 10, t0 + Duration::minutes(9));
        assert_eq!(at_9m.as_deref(), Some("m1"));

        let at_11m = find_continuity_anchor(&queue, "1", "9", 10, t0 + Duration::minutes(11));
        assert_eq!(at_11m, None);
    }

    #[test]
    fn zero_window_disables_continuity() {
        let queue = TreeQueue::new();
        let t0 = Utc::now();
        seed_terminal_tree(&queue, "m1", "1", "9", MessageState::Completed, t0);

        assert_eq!(find_continuity_anchor(&queue, "1", "9", 0, t0), None);
    }

    #[test]
    fn scoping_excludes_other_chats_and_users() {
        let queue = TreeQueue::new();
        let t0 = Utc::now();
        seed_terminal_tree(&queue, "m1", "1", "9", MessageState::Completed, t0);

        assert_eq!(find_continuity_anchor(&queue, "2", "9", 10, t0), None);
        assert_eq!(find_continuity_anchor(&queue, "1", "8", 10, t0), None);
    }

    #[test]
    fn non_terminal_nodes_are_not_anchors() {
        let queue = TreeQueue::new();
        let t0 = Utc::now();
        queue.create_tree(&incoming("m1", "1", "9")).expect("root");
        queue
            .update_state("m1", MessageState::InProgress, None)
            .expect("start");

        assert_eq!(find_continuity_anchor(&queue, "1", "9", 10, t0), None);
    }

    #[test]
    fn error_nodes_are_eligible_anchors() {
        let queue = TreeQueue::new();
        let t0 = Utc::now();
        seed_terminal_tree(&queue, "m1", "1", "9", MessageState::Error, t0);

        let anchor = find_continuity_anchor(&queue, "1", "9", 10, t0 + Duration::minutes(1));
        assert_eq!(anchor.as_deref(), Some("m1"));
    }

    #[test]
    fn most_recent_completion_wins_with_deterministic_tie_break() {
        let queue = TreeQueue::new();
        let t0 = Utc::now();
        seed_terminal_tree(&queue, "m1", "1", "9", MessageState::Completed, t0 - Duration::minutes(5));
        seed_terminal_tree(&queue, "m2", "1", "9", MessageState::Completed, t0);

        let anchor = find_continuity_anchor(&queue, "1", "9", 10, t0 + Duration::minutes(1));
        assert_eq!(anchor.as_deref(), Some("m2"), "most recent activity wins");

        seed_terminal_tree(&queue, "m3", "1", "9", MessageState::Completed, t0);

        let anchor = find_continuity_anchor(&queue, "1", "9", 10, t0 + Duration::minutes(1));
        assert_eq!(anchor.as_deref(), Some("m3"), "equal stamps break toward the greater id");
    }
}
