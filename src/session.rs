//! Agent session provider contract.
//!
//! The pool that actually runs agent turns (CLI subprocesses, remote
//! workers, ...) lives behind this trait. The handler only cares about
//! three things: acquiring or continuing a session, submitting text and
//! consuming the finite event stream of the resulting turn, and asking a
//! session to cancel.

use crate::error::HandlerError;
use tokio::sync::mpsc;

/// One event of a streamed agent turn.
///
/// Every call to [`SessionProvider::submit`] yields a finite sequence of
/// these, ending with `Completed` or `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEvent {
    /// Reasoning text the agent produced before acting.
    Thinking(String),
    /// A chunk of the agent's answer.
    Content(String),
    /// The agent started a tool invocation.
    ToolStarted { name: String },
    /// The agent delegated to a subagent.
    SubagentStarted { task: String },
    /// Terminal: the turn finished successfully.
    Completed,
    /// Terminal: the turn failed agent-side.
    Failed { message: String },
}

impl TurnEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnEvent::Completed | TurnEvent::Failed { .. })
    }
}

/// Handle to an acquired agent session.
///
/// The lease is owned exclusively by the handler task driving the node's
/// execution; continuation hands ownership to the next turn, it is never
/// shared between concurrent turns.
#[derive(Debug, Clone)]
pub struct SessionLease {
    /// Canonical session id as the provider knows it. This is what gets
    /// recorded on the node: a continuation may return the requested id,
    /// a fresh session returns a new one.
    pub session_id: String,
    pub is_new: bool,
}

/// Pool occupancy counters, surfaced by the `/stats` command and the
/// slot-wait status text.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStats {
    pub active_sessions: usize,
    pub max_sessions: usize,
}

impl SessionStats {
    pub fn is_full(&self) -> bool {
        self.max_sessions > 0 && self.active_sessions >= self.max_sessions
    }
}

/// Collaborator contract for the agent process pool.
#[async_trait::async_trait]
pub trait SessionProvider: Send + Sync {
    /// Acquire a session, continuing `existing_session_id` when given.
    async fn acquire(
        &self,
        existing_session_id: Option<&str>,
    ) -> Result<SessionLease, HandlerError>;

    /// Submit a user turn. The returned channel yields the turn's events
    /// and closes after the terminal event.
    async fn submit(
        &self,
        lease: &SessionLease,
        text: &str,
    ) -> Result<mpsc::Receiver<TurnEvent>, HandlerError>;

    /// Ask a session to cancel its current turn. Best-effort; the producer
    /// side reports the outcome through the event stream.
    async fn cancel(&self, lease: &SessionLease);

    /// Current pool occupancy.
    async fn stats(&self) -> SessionStats;
}
