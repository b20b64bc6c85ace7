//! Message node and tree value types.
//!
//! Pure data: no locks, no I/O. The serde form of [`MessageTree`] is the
//! snapshot format the tree store persists, so changes here are changes to
//! the on-disk format.

use crate::IncomingMessage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle state of a message node.
///
/// `Completed` and `Error` are terminal. Cancellation is `Error` with a
/// cancellation reason in [`MessageNode::error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    Pending,
    InProgress,
    Completed,
    Error,
}

impl MessageState {
    /// Whether the state admits no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageState::Completed | MessageState::Error)
    }
}

impl std::fmt::Display for MessageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            MessageState::Pending => "pending",
            MessageState::InProgress => "in_progress",
            MessageState::Completed => "completed",
            MessageState::Error => "error",
        };
        f.write_str(label)
    }
}

/// One processed or in-flight message within a conversation tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageNode {
    /// Platform message id; unique across the whole forest.
    pub node_id: String,
    /// `None` only for a tree root. Never changes once set.
    pub parent_id: Option<String>,
    /// Child node ids in arrival order. Only grows.
    pub children_ids: Vec<String>,
    pub chat_id: String,
    pub user_id: String,
    /// Agent session this node executed under. A child starts with its
    /// parent's session id so the agent keeps conversational memory; after
    /// acquisition it holds the canonical id the provider returned.
    pub session_id: Option<String>,
    pub state: MessageState,
    /// Platform-side status message this node edits in place.
    pub status_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Set exactly once, at the transition into a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Human-readable failure description; set only in `Error`.
    pub error: Option<String>,
}

impl MessageNode {
    /// Root node for a new conversation tree.
    pub fn new_root(incoming: &IncomingMessage) -> Self {
        Self {
            node_id: incoming.message_id.clone(),
            parent_id: None,
            children_ids: Vec::new(),
            chat_id: incoming.chat_id.clone(),
            user_id: incoming.user_id.clone(),
            session_id: None,
            state: MessageState::Pending,
            status_message_id: None,
            created_at: incoming.timestamp,
            completed_at: None,
            error: None,
        }
    }

    /// Child node continuing `parent`'s conversation.
    ///
    /// Scope (`chat_id`/`user_id`) is copied from the parent so the whole
    /// tree shares one continuity scope even when a different user replies
    /// into it. The session id is left unset; the caller assigns the
    /// parent's session id (or the canonical id from the provider) as part
    /// of placement.
    pub fn new_child(parent: &MessageNode, incoming: &IncomingMessage) -> Self {
        Self {
            node_id: incoming.message_id.clone(),
            parent_id: Some(parent.node_id.clone()),
            children_ids: Vec::new(),
            chat_id: parent.chat_id.clone(),
            user_id: parent.user_id.clone(),
            session_id: None,
            state: MessageState::Pending,
            status_message_id: None,
            created_at: incoming.timestamp,
            completed_at: None,
            error: None,
        }
    }

    /// Whether this node can serve as a continuity anchor at `now` for the
    /// given window: terminal, stamped, and recent enough.
    pub fn is_recent_terminal(&self, now: DateTime<Utc>, window: chrono::Duration) -> bool {
        if !self.state.is_terminal() {
            return false;
        }
        match self.completed_at {
            Some(completed_at) => now.signed_duration_since(completed_at) <= window,
            None => false,
        }
    }
}

/// A single conversation: the root node id plus an arena of nodes keyed by id.
///
/// Parent/child links are plain id references into the arena, never owning
/// pointers, so the structure is cycle-free by construction and serializes
/// directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageTree {
    pub root_id: String,
    pub nodes: HashMap<String, MessageNode>,
}

impl MessageTree {
    /// Tree containing only `root`.
    pub fn new(root: MessageNode) -> Self {
        let root_id = root.node_id.clone();
        let mut nodes = HashMap::new();
        nodes.insert(root_id.clone(), root);
        Self { root_id, nodes }
    }

    pub fn get_node(&self, node_id: &str) -> Option<&MessageNode> {
        self.nodes.get(node_id)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// Descendant node ids of `node_id`, depth-first, children in arrival
    /// order. `node_id` itself is not included.
    pub fn descendants(&self, node_id: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut stack: Vec<&str> = match self.nodes.get(node_id) {
            Some(node) => node.children_ids.iter().rev().map(String::as_str).collect(),
            None => return out,
        };
        while let Some(id) = stack.pop() {
            out.push(id.to_string());
            if let Some(node) = self.nodes.get(id) {
                stack.extend(node.children_ids.iter().rev().map(String::as_str));
            }
        }
        out
    }

    /// Whether every node in the tree is in a terminal state.
    pub fn is_fully_terminal(&self) -> bool {
        self.nodes.values().all(|node| node.state.is_terminal())
    }

    /// Most recent terminal stamp across the tree, if any node is stamped.
    pub fn latest_completion(&self) -> Option<DateTime<Utc>> {
        self.nodes.values().filter_map(|node| node.completed_at).max()
    }

    /// Validate structural invariants: the root exists and has no parent,
    /// every ancestor chain terminates at the root without cycles, and
    /// parent/child links agree. Used when restoring persisted snapshots.
    pub fn validate(&self) -> Result<(), String> {
        let root = self
            .nodes
            .get(&self.root_id)
            .ok_or_else(|| format!("root {} missing from node arena", self.root_id))?;
        if root.parent_id.is_some() {
            return Err(format!("root {} has a parent", self.root_id));
        }

        for (id, node) in &self.nodes {
            if *id != node.node_id {
                return Err(format!("node {} keyed as {id}", node.node_id));
            }
            if node.completed_at.is_some() != node.state.is_terminal() {
                return Err(format!(
                    "node {id} is {} but completed_at is {}",
                    node.state,
                    if node.completed_at.is_some() { "set" } else { "unset" },
                ));
            }
            for child_id in &node.children_ids {
                let child = self
                    .nodes
                    .get(child_id)
                    .ok_or_else(|| format!("node {id} lists unknown child {child_id}"))?;
                if child.parent_id.as_deref() != Some(id.as_str()) {
                    return Err(format!("child {child_id} does not point back to {id}"));
                }
            }

            // Walk to the root; a chain longer than the arena means a cycle.
            let mut current = node;
            let mut steps = 0usize;
            while let Some(parent_id) = &current.parent_id {
                current = self
                    .nodes
                    .get(parent_id)
                    .ok_or_else(|| format!("node {id} has unknown ancestor {parent_id}"))?;
                steps += 1;
                if steps > self.nodes.len() {
                    return Err(format!("cycle detected above node {id}"));
                }
            }
            if current.node_id != self.root_id {
                return Err(format!(
                    "ancestor chain of {id} terminates at {} instead of the root",
                    current.node_id
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{MessageNode, MessageState, MessageTree};
    use crate::IncomingMessage;

    fn incoming(message_id: &str) -> IncomingMessage {
        IncomingMessage {
            text: "hello".to_string(),
            chat_id: "chat-1".to_string(),
            user_id: "user-1".to_string(),
            message_id: message_id.to_string(),
            reply_to_message_id: None,
            timestamp: chrono::Utc::now(),
        }
    }

    fn tree_with_child() -> MessageTree {
        let root = MessageNode::new_root(&incoming("m1"));
        let mut tree = MessageTree::new(root);
        let child = MessageNode::new_child(&tree.nodes["m1"], &incoming("m2"));
        tree.nodes.get_mut("m1").expect("root").children_ids.push("m2".to_string());
        tree.nodes.insert("m2".to_string(), child);
        tree
    }

    #[test]
    fn new_child_inherits_the_parents_scope_and_starts_pending() {
        let root = MessageNode::new_root(&incoming("m1"));
        let mut from_other_user = incoming("m2");
        from_other_user.user_id = "user-2".to_string();
        let child = MessageNode::new_child(&root, &from_other_user);

        assert_eq!(child.parent_id.as_deref(), Some("m1"));
        assert_eq!(child.chat_id, "chat-1");
        assert_eq!(child.user_id, "user-1", "scope comes from the parent, not the sender");
        assert_eq!(child.state, MessageState::Pending);
        assert!(child.session_id.is_none());
        assert!(child.completed_at.is_none());
    }

    #[test]
    fn descendants_are_depth_first_in_arrival_order() {
        let mut tree = tree_with_child();
        let grandchild = MessageNode::new_child(&tree.nodes["m2"], &incoming("m3"));
        tree.nodes.get_mut("m2").expect("child").children_ids.push("m3".to_string());
        tree.nodes.insert("m3".to_string(), grandchild);
        let sibling = MessageNode::new_child(&tree.nodes["m1"], &incoming("m4"));
        tree.nodes.get_mut("m1").expect("root").children_ids.push("m4".to_string());
        tree.nodes.insert("m4".to_string(), sibling);

        assert_eq!(tree.descendants("m1"), vec!["m2", "m3", "m4"]);
        assert_eq!(tree.descendants("m2"), vec!["m3"]);
        assert!(tree.descendants("m3").is_empty());
    }

    #[test]
    fn validate_accepts_well_formed_tree() {
        let tree = tree_with_child();
        tree.validate().expect("tree should validate");
    }

    #[test]
    fn validate_rejects_broken_parent_link() {
        let mut tree = tree_with_child();
        tree.nodes.get_mut("m2").expect("child").parent_id = Some("missing".to_string());

        assert!(tree.validate().is_err());
    }

    #[test]
    fn validate_rejects_terminal_state_without_stamp() {
        let mut tree = tree_with_child();
        tree.nodes.get_mut("m2").expect("child").state = MessageState::Completed;

        assert!(tree.validate().is_err());
    }

    #[test]
    fn snapshot_round_trip_preserves_structure() {
        let mut tree = tree_with_child();
        {
            let root = tree.nodes.get_mut("m1").expect("root");
            root.state = MessageState::Completed;
            root.completed_at = Some(chrono::Utc::now());
            root.session_id = Some("s1".to_string());
            root.status_message_id = Some("status-9".to_string());
        }

        let encoded = serde_json::to_string(&tree).expect("tree should serialize");
        let decoded: MessageTree = serde_json::from_str(&encoded).expect("tree should deserialize");

        decoded.validate().expect("round-tripped tree should validate");
        assert_eq!(decoded.root_id, tree.root_id);
        assert_eq!(decoded.nodes.len(), tree.nodes.len());
        let root = decoded.get_node("m1").expect("root survives");
        assert_eq!(root.state, MessageState::Completed);
        assert_eq!(root.session_id.as_deref(), Some("s1"));
        assert_eq!(root.status_message_id.as_deref(), Some("status-9"));
        assert_eq!(
            decoded.get_node("m2").expect("child survives").parent_id.as_deref(),
            Some("m1")
        );
    }
}
