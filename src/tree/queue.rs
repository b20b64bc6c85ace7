//! Process-wide registry of conversation trees.
//!
//! The queue exclusively owns every [`MessageTree`]; all mutation goes
//! through its operations, which makes it the single source of truth and
//! the lock boundary for the whole forest. Every operation completes
//! without suspending, so the expensive work around it (session turns,
//! persistence, platform calls) never runs under the lock.

use crate::IncomingMessage;
use crate::error::TreeError;
use crate::tree::node::{MessageNode, MessageState, MessageTree};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

/// Result of cascading a failure through a node's descendants.
#[derive(Debug, Default)]
pub struct CascadeOutcome {
    /// Pending descendants that were transitioned to `Error`, in cascade
    /// (depth-first) order.
    pub failed: Vec<MessageNode>,
    /// In-progress descendants. These are not force-transitioned; the
    /// handler asks their running turns to cancel cooperatively.
    pub in_progress: Vec<MessageNode>,
}

#[derive(Default)]
struct Forest {
    /// root_id → tree.
    trees: HashMap<String, MessageTree>,
    /// node_id → root_id of the owning tree.
    node_index: HashMap<String, String>,
}

/// Registry over all active conversation trees.
#[derive(Default)]
pub struct TreeQueue {
    inner: Mutex<Forest>,
}

impl TreeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Forest> {
        // A panic under the lock leaves the forest structurally valid (every
        // operation mutates index and tree together), so poisoning is
        // recoverable.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Allocate a new tree whose root is `incoming`, in state `Pending`.
    pub fn create_tree(&self, incoming: &IncomingMessage) -> Result<MessageNode, TreeError> {
        let mut forest = self.lock();
        if let Some(root_id) = forest.node_index.get(&incoming.message_id) {
            return Err(TreeError::DuplicateNode {
                node_id: incoming.message_id.clone(),
                root_id: root_id.clone(),
            });
        }

        let root = MessageNode::new_root(incoming);
        let tree = MessageTree::new(root.clone());
        forest
            .node_index
            .insert(root.node_id.clone(), tree.root_id.clone());
        forest.trees.insert(tree.root_id.clone(), tree);
        tracing::debug!(node_id = %root.node_id, "created conversation tree");
        Ok(root)
    }

    /// Attach `incoming` as a child of `parent_node_id` in the parent's tree.
    ///
    /// The child starts `Pending` with its session id unset; the caller
    /// assigns the parent's session id as part of placement.
    pub fn add_child(
        &self,
        parent_node_id: &str,
        incoming: &IncomingMessage,
    ) -> Result<MessageNode, TreeError> {
        let mut forest = self.lock();
        if let Some(root_id) = forest.node_index.get(&incoming.message_id) {
            return Err(TreeError::DuplicateNode {
                node_id: incoming.message_id.clone(),
                root_id: root_id.clone(),
            });
        }
        let root_id = forest
            .node_index
            .get(parent_node_id)
            .cloned()
            .ok_or_else(|| TreeError::UnknownNode {
                node_id: parent_node_id.to_string(),
            })?;

        let tree = forest.trees.get_mut(&root_id).ok_or_else(|| TreeError::UnknownNode {
            node_id: parent_node_id.to_string(),
        })?;
        let parent = tree
            .nodes
            .get_mut(parent_node_id)
            .ok_or_else(|| TreeError::UnknownNode {
                node_id: parent_node_id.to_string(),
            })?;

        let child = MessageNode::new_child(parent, incoming);
        parent.children_ids.push(child.node_id.clone());
        tree.nodes.insert(child.node_id.clone(), child.clone());
        forest.node_index.insert(incoming.message_id.clone(), root_id);
        tracing::debug!(
            node_id = %child.node_id,
            parent_id = %parent_node_id,
            "attached child node"
        );
        Ok(child)
    }

    /// Snapshot of the tree containing `node_id`.
    pub fn get_tree_for_node(&self, node_id: &str) -> Option<MessageTree> {
        let forest = self.lock();
        let root_id = forest.node_index.get(node_id)?;
        forest.trees.get(root_id).cloned()
    }

    /// Snapshot of a single node.
    pub fn get_node(&self, node_id: &str) -> Option<MessageNode> {
        let forest = self.lock();
        let root_id = forest.node_index.get(node_id)?;
        forest.trees.get(root_id)?.get_node(node_id).cloned()
    }

    /// Validate `node_id` as a parent candidate for an explicit reply.
    ///
    /// Any registered node qualifies regardless of state; a reply may target
    /// an in-flight node.
    pub fn resolve_parent_node_id(&self, node_id: &str) -> Option<String> {
        let forest = self.lock();
        forest.node_index.contains_key(node_id).then(|| node_id.to_string())
    }

    /// Apply a state transition, enforcing the transition table.
    ///
    /// Entering `Completed` or `Error` stamps `completed_at` exactly once.
    /// Returns the updated node snapshot.
    pub fn update_state(
        &self,
        node_id: &str,
        new_state: MessageState,
        error: Option<String>,
    ) -> Result<MessageNode, TreeError> {
        let mut forest = self.lock();
        transition(&mut forest, node_id, new_state, error, Utc::now())
    }

    /// Record the canonical session id for a node.
    pub fn set_session_id(&self, node_id: &str, session_id: &str) -> Result<(), TreeError> {
        let mut forest = self.lock();
        let node = node_mut(&mut forest, node_id)?;
        node.session_id = Some(session_id.to_string());
        Ok(())
    }

    /// Record the platform status message a node edits in place.
    pub fn set_status_message(&self, node_id: &str, message_id: &str) -> Result<(), TreeError> {
        let mut forest = self.lock();
        let node = node_mut(&mut forest, node_id)?;
        node.status_message_id = Some(message_id.to_string());
        Ok(())
    }

    /// Run `f` over all trees under the lock.
    ///
    /// This is the snapshot-consistent iteration the continuity resolver
    /// relies on: no `add_child`/`update_state` can interleave, so `f` never
    /// observes a half-updated node. `f` must not block.
    pub fn visit_trees<R>(&self, f: impl FnOnce(&mut dyn Iterator<Item = &MessageTree>) -> R) -> R {
        let forest = self.lock();
        let mut iter = forest.trees.values();
        f(&mut iter)
    }

    /// Cascade a failure: transition every `Pending` descendant of `node_id`
    /// to `Error` with `reason`, depth-first, and report `InProgress`
    /// descendants for cooperative cancellation.
    pub fn fail_pending_descendants(
        &self,
        node_id: &str,
        reason: &str,
    ) -> Result<CascadeOutcome, TreeError> {
        let mut forest = self.lock();
        let root_id = forest
            .node_index
            .get(node_id)
            .cloned()
            .ok_or_else(|| TreeError::UnknownNode {
                node_id: node_id.to_string(),
            })?;
        let descendants = forest
            .trees
            .get(&root_id)
            .map(|tree| tree.descendants(node_id))
            .unwrap_or_default();

        let now = Utc::now();
        let mut outcome = CascadeOutcome::default();
        for descendant_id in descendants {
            let state = node_mut(&mut forest, &descendant_id)?.state;
            match state {
                MessageState::Pending => {
                    let failed = transition(
                        &mut forest,
                        &descendant_id,
                        MessageState::Error,
                        Some(reason.to_string()),
                        now,
                    )?;
                    outcome.failed.push(failed);
                }
                MessageState::InProgress => {
                    if let Ok(node) = node_mut(&mut forest, &descendant_id) {
                        outcome.in_progress.push(node.clone());
                    }
                }
                MessageState::Completed | MessageState::Error => {}
            }
        }
        Ok(outcome)
    }

    /// Global stop: transition every `Pending` node in the forest to `Error`
    /// with `reason`. Returns the nodes that were cancelled.
    pub fn cancel_all_pending(&self, reason: &str) -> Vec<MessageNode> {
        let mut forest = self.lock();
        let pending: Vec<String> = forest
            .trees
            .values()
            .flat_map(|tree| tree.nodes.values())
            .filter(|node| node.state == MessageState::Pending)
            .map(|node| node.node_id.clone())
            .collect();

        let now = Utc::now();
        let mut cancelled = Vec::with_capacity(pending.len());
        for node_id in pending {
            match transition(
                &mut forest,
                &node_id,
                MessageState::Error,
                Some(reason.to_string()),
                now,
            ) {
                Ok(node) => cancelled.push(node),
                Err(error) => {
                    // The candidate list was computed under this same lock,
                    // so a failure here is a bug in the transition table.
                    tracing::error!(%error, node_id = %node_id, "failed to cancel pending node");
                }
            }
        }
        cancelled
    }

    /// Snapshot of every `InProgress` node in the forest.
    pub fn in_progress_nodes(&self) -> Vec<MessageNode> {
        let forest = self.lock();
        forest
            .trees
            .values()
            .flat_map(|tree| tree.nodes.values())
            .filter(|node| node.state == MessageState::InProgress)
            .cloned()
            .collect()
    }

    /// Evict trees whose every node is terminal and whose latest completion
    /// is older than `horizon`. Returns the number of trees removed.
    ///
    /// Evicted trees stop serving as continuity anchors and as explicit
    /// reply targets; a reply to an evicted message degrades to the
    /// continuity search exactly like an unresolved id.
    pub fn evict_terminal_trees(&self, horizon: chrono::Duration, now: DateTime<Utc>) -> usize {
        let mut forest = self.lock();
        let expired: Vec<String> = forest
            .trees
            .values()
            .filter(|tree| tree.is_fully_terminal())
            .filter(|tree| match tree.latest_completion() {
                Some(latest) => now.signed_duration_since(latest) > horizon,
                None => false,
            })
            .map(|tree| tree.root_id.clone())
            .collect();

        for root_id in &expired {
            if let Some(tree) = forest.trees.remove(root_id) {
                for node_id in tree.nodes.keys() {
                    forest.node_index.remove(node_id);
                }
            }
        }
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "evicted terminal trees past retention");
        }
        expired.len()
    }

    /// Register a tree loaded from the store.
    ///
    /// The snapshot is validated structurally and rejected wholesale if any
    /// of its node ids is already registered.
    pub fn restore_tree(&self, tree: MessageTree) -> Result<(), TreeError> {
        tree.validate().map_err(|reason| TreeError::CorruptTree {
            root_id: tree.root_id.clone(),
            reason,
        })?;

        let mut forest = self.lock();
        for node_id in tree.nodes.keys() {
            if let Some(root_id) = forest.node_index.get(node_id) {
                return Err(TreeError::DuplicateNode {
                    node_id: node_id.clone(),
                    root_id: root_id.clone(),
                });
            }
        }
        for node_id in tree.nodes.keys() {
            forest.node_index.insert(node_id.clone(), tree.root_id.clone());
        }
        forest.trees.insert(tree.root_id.clone(), tree);
        Ok(())
    }

    /// Number of registered trees.
    pub fn tree_count(&self) -> usize {
        self.lock().trees.len()
    }
}

fn node_mut<'forest>(
    forest: &'forest mut Forest,
    node_id: &str,
) -> Result<&'forest mut MessageNode, TreeError> {
    let root_id = forest
        .node_index
        .get(node_id)
        .cloned()
        .ok_or_else(|| TreeError::UnknownNode {
            node_id: node_id.to_string(),
        })?;
    forest
        .trees
        .get_mut(&root_id)
        .and_then(|tree| tree.nodes.get_mut(node_id))
        .ok_or_else(|| TreeError::UnknownNode {
            node_id: node_id.to_string(),
        })
}

/// The state machine, in one place:
///
/// ```text
/// Pending     -> InProgress   session acquired, agent invoked
/// InProgress  -> Completed    agent turn finished successfully
/// InProgress  -> Error        turn failed, session error, or cancellation
/// Pending     -> Error        ancestor failed before this node started
/// ```
fn transition(
    forest: &mut Forest,
    node_id: &str,
    new_state: MessageState,
    error: Option<String>,
    now: DateTime<Utc>,
) -> Result<MessageNode, TreeError> {
    let node = node_mut(forest, node_id)?;

    if node.state.is_terminal() {
        return Err(TreeError::TerminalTransition {
            node_id: node_id.to_string(),
            state: node.state,
            requested: new_state,
        });
    }
    let allowed = matches!(
        (node.state, new_state),
        (MessageState::Pending, MessageState::InProgress)
            | (MessageState::Pending, MessageState::Error)
            | (MessageState::InProgress, MessageState::Completed)
            | (MessageState::InProgress, MessageState::Error)
    );
    if !allowed {
        return Err(TreeError::InvalidTransition {
            node_id: node_id.to_string(),
            from: node.state,
            to: new_state,
        });
    }

    node.state = new_state;
    if new_state.is_terminal() {
        node.completed_at = Some(now);
    }
    if new_state == MessageState::Error {
        node.error = error;
    }
    Ok(node.clone())
}
