//! Error types for the tree queue and the message handler.

/// Convenience result alias used throughout the crate.
pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;

/// Contract violations inside the tree queue.
///
/// These indicate a programming error (a reused message id, a transition on
/// a terminal node), not a recoverable runtime condition. The queue rejects
/// the offending operation and leaves the rest of the forest untouched; the
/// handler logs them as fatal for the request that triggered them.
#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    #[error("node {node_id} is already registered in tree {root_id}")]
    DuplicateNode { node_id: String, root_id: String },

    #[error("node {node_id} is not registered in any tree")]
    UnknownNode { node_id: String },

    #[error("node {node_id} is terminal ({state}), refusing transition to {requested}")]
    TerminalTransition {
        node_id: String,
        state: crate::tree::MessageState,
        requested: crate::tree::MessageState,
    },

    #[error("node {node_id}: transition {from} -> {to} is not in the state machine")]
    InvalidTransition {
        node_id: String,
        from: crate::tree::MessageState,
        to: crate::tree::MessageState,
    },

    #[error("tree {root_id} failed validation: {reason}")]
    CorruptTree { root_id: String, reason: String },
}

/// Failures at the handler's collaborator boundaries.
///
/// All of these are caught inside `handle_message`, mapped to a terminal
/// error node plus a user-visible status edit, and never propagate out.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("nothing to process")]
    InvalidMessage,

    #[error("failed to acquire agent session: {0}")]
    SessionAcquisition(String),

    #[error("agent turn failed: {0}")]
    TurnExecution(String),

    #[error("agent turn timed out after {0}s")]
    TurnTimeout(u64),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("messaging platform error: {0}")]
    Platform(String),
}
