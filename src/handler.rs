//! Message handler: parent resolution, dispatch, and failure propagation.
//!
//! One logical task per in-flight `handle_message` call. The handler holds
//! no conversation state of its own; every tree mutation goes through the
//! [`TreeQueue`], which makes the queue the single source of truth and the
//! only lock shared between concurrent messages.

mod turn;

use crate::IncomingMessage;
use crate::config::Config;
use crate::error::{HandlerError, TreeError};
use crate::platform::{Platform, SendOptions};
use crate::session::{SessionLease, SessionProvider, SessionStats};
use crate::status::is_self_status;
use crate::store::TreeStore;
use crate::tree::{MessageNode, MessageState, TreeQueue, find_continuity_anchor};
use arc_swap::ArcSwap;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

const CASCADE_REASON: &str = "ancestor failed";
const STOP_REASON: &str = "stopped by user";
const INTERRUPTED_REASON: &str = "interrupted by restart";

const STATUS_CONTINUING: &str = "🔄 **Continuing conversation...**";
const STATUS_LAUNCHING: &str = "⏳ **Launching new agent session...**";
const STATUS_NOTHING_TO_PROCESS: &str = "❌ **Nothing to process** - the message was empty.";
const STATUS_SESSION_UNAVAILABLE: &str =
    "⏳ **Session unavailable** - please try again in a moment.";
const STATUS_COMPLETE: &str = "✅ **Complete**";
const STATUS_ERROR: &str = "❌ **Error**";
const STATUS_STOPPED: &str = "⏹ **Stopped.**";
const STATUS_CASCADE_CANCELLED: &str =
    "❌ **Cancelled** - an earlier message in this conversation failed.";

/// Cancellation handle for one in-flight turn. The driving task owns the
/// session lease; everyone else only gets to ask it to stop.
struct ActiveTurn {
    cancel_tx: watch::Sender<bool>,
}

/// Orchestrates the conversation forest: accepts normalized incoming
/// messages, resolves where they belong, and drives each node through its
/// state machine against the session provider.
pub struct MessageHandler {
    platform: Arc<dyn Platform>,
    sessions: Arc<dyn SessionProvider>,
    store: Arc<dyn TreeStore>,
    queue: Arc<TreeQueue>,
    config: ArcSwap<Config>,
    active_turns: Mutex<HashMap<String, ActiveTurn>>,
}

impl MessageHandler {
    pub fn new(
        platform: Arc<dyn Platform>,
        sessions: Arc<dyn SessionProvider>,
        store: Arc<dyn TreeStore>,
        queue: Arc<TreeQueue>,
        config: Config,
    ) -> Self {
        Self {
            platform,
            sessions,
            store,
            queue,
            config: ArcSwap::from_pointee(config),
            active_turns: Mutex::new(HashMap::new()),
        }
    }

    /// Swap the runtime configuration. In-flight turns keep the values they
    /// started with.
    pub fn update_config(&self, config: Config) {
        self.config.store(Arc::new(config));
    }

    fn active_turns(&self) -> MutexGuard<'_, HashMap<String, ActiveTurn>> {
        self.active_turns
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Handle one incoming message end to end.
    ///
    /// Collaborator failures are mapped to a terminal error node plus a
    /// user-visible status edit; they never propagate out of this call.
    #[tracing::instrument(
        skip(self, incoming),
        fields(chat_id = %incoming.chat_id, message_id = %incoming.message_id)
    )]
    pub async fn handle_message(&self, incoming: IncomingMessage) -> crate::error::Result<()> {
        let text = incoming.text.trim().to_string();

        if text == "/stop" {
            self.handle_stop_command(&incoming).await;
            return Ok(());
        }
        if text == "/stats" {
            self.handle_stats_command(&incoming).await;
            return Ok(());
        }
        // Echo protection: our own status messages can come back through
        // some front-ends.
        if is_self_status(&text) {
            tracing::debug!("ignoring own status echo");
            return Ok(());
        }
        if text.is_empty() {
            // Rejected pre-dispatch: user-visible outcome, no node, no tree.
            let error = HandlerError::InvalidMessage;
            tracing::info!(%error, "rejecting message with no processable text");
            let options = SendOptions::markdown_reply_to(&incoming.message_id);
            if let Err(error) = self
                .platform
                .send_status(&incoming.chat_id, STATUS_NOTHING_TO_PROCESS, &options)
                .await
            {
                tracing::warn!(%error, "failed to send rejection status");
            }
            return Ok(());
        }

        if let Some(horizon) = self.config.load().retention_horizon() {
            self.queue.evict_terminal_trees(horizon, Utc::now());
        }

        // Steps 1-2: explicit reply wins, otherwise recent activity.
        let parent_id = self.resolve_parent(&incoming);

        // Step 3: one code path over Option<parent_id>.
        let placement = match &parent_id {
            Some(parent_id) => self.queue.add_child(parent_id, &incoming),
            None => self.queue.create_tree(&incoming),
        };
        let node = match placement {
            Ok(node) => node,
            Err(error) => {
                contract_violation(&error);
                return Ok(());
            }
        };
        let node_id = node.node_id.clone();
        tracing::info!(
            node_id = %node_id,
            parent_id = parent_id.as_deref().unwrap_or("<root>"),
            "placed message"
        );

        // The child inherits the parent's session so the agent keeps its
        // conversational memory.
        let mut requested_session = None;
        if let Some(parent_id) = &parent_id {
            if let Some(session_id) = self.queue.get_node(parent_id).and_then(|p| p.session_id) {
                if let Err(error) = self.queue.set_session_id(&node_id, &session_id) {
                    contract_violation(&error);
                }
                requested_session = Some(session_id);
            }
        }

        let stats = self.sessions.stats().await;
        let initial = initial_status_text(parent_id.is_some(), stats);
        let options = SendOptions::markdown_reply_to(&incoming.message_id);
        match self
            .platform
            .send_status(&incoming.chat_id, &initial, &options)
            .await
        {
            Ok(status_message_id) => {
                if let Err(error) = self.queue.set_status_message(&node_id, &status_message_id) {
                    contract_violation(&error);
                }
            }
            Err(error) => {
                tracing::warn!(%error, "failed to send initial status, continuing without one");
            }
        }
        self.persist_tree(&node_id).await;

        // Step 4: session acquisition.
        let lease = match self.sessions.acquire(requested_session.as_deref()).await {
            Ok(lease) => lease,
            Err(error) => {
                tracing::warn!(node_id = %node_id, %error, "session acquisition failed");
                match self
                    .queue
                    .update_state(&node_id, MessageState::Error, Some(error.to_string()))
                {
                    Ok(node) => {
                        self.edit_node_status(&node, STATUS_SESSION_UNAVAILABLE).await;
                        self.persist_tree(&node_id).await;
                    }
                    Err(error) => contract_violation(&error),
                }
                return Ok(());
            }
        };

        // Step 5: execution. The transition is attempted before recording
        // the canonical session id: the node may have been cancelled (stop
        // or ancestor cascade) while we waited for the session.
        match self.queue.update_state(&node_id, MessageState::InProgress, None) {
            Ok(_) => {}
            Err(TreeError::TerminalTransition { .. }) => {
                tracing::info!(
                    node_id = %node_id,
                    "node reached a terminal state before execution, skipping turn"
                );
                return Ok(());
            }
            Err(error) => {
                contract_violation(&error);
                return Ok(());
            }
        }
        // Record what the provider actually gave us, not what we asked for.
        if let Err(error) = self.queue.set_session_id(&node_id, &lease.session_id) {
            contract_violation(&error);
        }
        self.persist_tree(&node_id).await;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.active_turns()
            .insert(node_id.clone(), ActiveTurn { cancel_tx });

        let status_message_id = self.queue.get_node(&node_id).and_then(|n| n.status_message_id);
        let outcome = self
            .drive_turn(
                &incoming.chat_id,
                status_message_id.as_deref(),
                &lease,
                &text,
                cancel_rx,
            )
            .await;

        self.active_turns().remove(&node_id);

        // Step 6: completion or failure plus cascade.
        match outcome {
            Ok(()) => {
                tracing::info!(node_id = %node_id, session_id = %lease.session_id, "turn completed");
                if let Err(error) = self.queue.update_state(&node_id, MessageState::Completed, None)
                {
                    contract_violation(&error);
                }
            }
            Err(error) => {
                tracing::warn!(node_id = %node_id, %error, "turn failed");
                match self
                    .queue
                    .update_state(&node_id, MessageState::Error, Some(error.to_string()))
                {
                    Ok(_) => self.cascade_failure(&node_id).await,
                    Err(error) => contract_violation(&error),
                }
            }
        }

        // Step 7: best-effort snapshot of the owning tree.
        self.persist_tree(&node_id).await;
        Ok(())
    }

    /// Steps 1-2 of the dispatch algorithm.
    fn resolve_parent(&self, incoming: &IncomingMessage) -> Option<String> {
        if let Some(reply_to) = &incoming.reply_to_message_id {
            if let Some(parent_id) = self.queue.resolve_parent_node_id(reply_to) {
                tracing::debug!(parent_id = %parent_id, "resolved explicit reply target");
                return Some(parent_id);
            }
            // The target may have been evicted by retention; degrade to the
            // recent-activity search instead of silently starting over.
            tracing::info!(
                reply_to = %reply_to,
                "reply target unknown, falling back to continuity search"
            );
        }

        let window = self.config.load().continuity_window_minutes;
        find_continuity_anchor(
            &self.queue,
            &incoming.chat_id,
            &incoming.user_id,
            window,
            Utc::now(),
        )
    }

    /// Cascade a failure through the failed node's descendants: pending ones
    /// become errors immediately, in-progress ones are asked to cancel and
    /// terminate through their own driving task.
    async fn cascade_failure(&self, node_id: &str) {
        let outcome = match self.queue.fail_pending_descendants(node_id, CASCADE_REASON) {
            Ok(outcome) => outcome,
            Err(error) => {
                contract_violation(&error);
                return;
            }
        };

        for node in &outcome.failed {
            tracing::info!(
                node_id = %node.node_id,
                failed_ancestor = %node_id,
                "cascade-cancelled pending descendant"
            );
            self.edit_node_status(node, STATUS_CASCADE_CANCELLED).await;
        }

        if !outcome.in_progress.is_empty() {
            let turns = self.active_turns();
            for node in &outcome.in_progress {
                match turns.get(&node.node_id) {
                    Some(turn) => {
                        turn.cancel_tx.send(true).ok();
                        tracing::info!(node_id = %node.node_id, "asked in-progress descendant to cancel");
                    }
                    None => tracing::warn!(
                        node_id = %node.node_id,
                        "in-progress descendant has no registered turn to cancel"
                    ),
                }
            }
        }

        if !outcome.failed.is_empty() {
            self.persist_tree(node_id).await;
        }
    }

    /// Global stop: cancel every pending node and signal every in-flight
    /// turn. Returns the number of affected requests.
    pub async fn stop_all(&self) -> usize {
        let cancelled = self.queue.cancel_all_pending(STOP_REASON);
        let signalled: usize = {
            let turns = self.active_turns();
            for turn in turns.values() {
                turn.cancel_tx.send(true).ok();
            }
            turns.len()
        };

        for node in &cancelled {
            self.edit_node_status(node, STATUS_STOPPED).await;
            self.persist_tree(&node.node_id).await;
        }

        tracing::info!(
            pending = cancelled.len(),
            in_flight = signalled,
            "stop requested for all tasks"
        );
        cancelled.len() + signalled
    }

    /// Load every persisted tree into the queue. Called once at startup,
    /// before any message is dispatched.
    ///
    /// Nodes a crash left non-terminal have no driving task anymore; they
    /// are reconciled to an error so the conversation is immediately
    /// continuable instead of dangling forever.
    pub async fn restore(&self) -> crate::error::Result<usize> {
        let snapshots = self.store.load_all().await?;
        let mut restored = 0usize;
        for tree in snapshots {
            let root_id = tree.root_id.clone();
            match self.queue.restore_tree(tree) {
                Ok(()) => restored += 1,
                Err(error) => {
                    tracing::warn!(%error, root_id = %root_id, "skipping snapshot that failed to restore");
                }
            }
        }

        let dangling: Vec<String> = self.queue.visit_trees(|trees| {
            trees
                .flat_map(|tree| tree.nodes.values())
                .filter(|node| !node.state.is_terminal())
                .map(|node| node.node_id.clone())
                .collect()
        });
        for node_id in &dangling {
            if let Err(error) = self.queue.update_state(
                node_id,
                MessageState::Error,
                Some(INTERRUPTED_REASON.to_string()),
            ) {
                contract_violation(&error);
            }
            self.persist_tree(node_id).await;
        }
        if !dangling.is_empty() {
            tracing::info!(count = dangling.len(), "reconciled nodes interrupted by restart");
        }

        tracing::info!(restored, "restored conversation trees");
        Ok(restored)
    }

    async fn handle_stop_command(&self, incoming: &IncomingMessage) {
        let count = self.stop_all().await;
        let text = format!("⏹ **Stopped.** Cancelled {count} pending or active requests.");
        if let Err(error) = self
            .platform
            .send_status(&incoming.chat_id, &text, &SendOptions::markdown())
            .await
        {
            tracing::warn!(%error, "failed to confirm stop command");
        }
    }

    async fn handle_stats_command(&self, incoming: &IncomingMessage) {
        let stats = self.sessions.stats().await;
        let text = format!(
            "📊 **Stats**\n• Active: {}\n• Max: {}",
            stats.active_sessions, stats.max_sessions
        );
        if let Err(error) = self
            .platform
            .send_status(&incoming.chat_id, &text, &SendOptions::markdown())
            .await
        {
            tracing::warn!(%error, "failed to answer stats command");
        }
    }

    /// Edit a node's status message, if it has one. Edit failures are
    /// logged, never fatal.
    async fn edit_node_status(&self, node: &MessageNode, text: &str) {
        let Some(status_message_id) = &node.status_message_id else {
            return;
        };
        if let Err(error) = self
            .platform
            .edit_status(&node.chat_id, status_message_id, text, &SendOptions::markdown())
            .await
        {
            tracing::warn!(%error, node_id = %node.node_id, "failed to edit status message");
        }
    }

    /// Snapshot the tree owning `node_id`. Best-effort durability: failures
    /// are logged and the request continues.
    async fn persist_tree(&self, node_id: &str) {
        let Some(tree) = self.queue.get_tree_for_node(node_id) else {
            return;
        };
        if let Err(error) = self.store.save(&tree.root_id, &tree).await {
            tracing::warn!(%error, root_id = %tree.root_id, "failed to persist tree snapshot");
        }
    }
}

fn initial_status_text(continuing: bool, stats: SessionStats) -> String {
    if continuing {
        STATUS_CONTINUING.to_string()
    } else if stats.is_full() {
        format!(
            "⏳ **Waiting for a free slot...** ({}/{})",
            stats.active_sessions, stats.max_sessions
        )
    } else {
        STATUS_LAUNCHING.to_string()
    }
}

/// A queue contract violation is a programming error. It aborts the request
/// that hit it, loudly, and must never corrupt the rest of the forest.
fn contract_violation(error: &TreeError) {
    debug_assert!(false, "tree queue contract violation: {error}");
    tracing::error!(%error, "tree queue contract violation, aborting this request");
}
