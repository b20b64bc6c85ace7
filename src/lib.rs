//! Treebot: conversation tree queue and message dispatch for chat → coding-agent bridges.
//!
//! Incoming chat messages are organized into trees of message nodes so that
//! reply-less follow-ups keep their conversational context. Each node is
//! driven through a small state machine by a streamed agent turn; failures
//! cascade to pending descendants instead of silently orphaning them.

pub mod config;
pub mod db;
pub mod error;
pub mod handler;
pub mod logging;
pub mod platform;
pub mod session;
pub mod status;
pub mod store;
pub mod tree;

pub use config::Config;
pub use handler::MessageHandler;
pub use platform::{Platform, SendOptions};
pub use session::{SessionLease, SessionProvider, SessionStats, TurnEvent};
pub use store::{SqliteTreeStore, TreeStore};
pub use tree::{MessageNode, MessageState, MessageTree, TreeQueue};

use chrono::{DateTime, Utc};

/// Normalized incoming message, produced by a front-end adapter.
///
/// Adapters convert platform-specific events (Telegram updates, Discord
/// gateway events, ...) into this record before calling
/// [`MessageHandler::handle_message`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct IncomingMessage {
    pub text: String,
    pub chat_id: String,
    pub user_id: String,
    /// Platform message id. Doubles as the node id in the conversation tree,
    /// so it must be unique across the whole forest.
    pub message_id: String,
    /// Set when the user explicitly replied to an earlier message.
    pub reply_to_message_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl IncomingMessage {
    /// Whether this message explicitly replies to another message.
    pub fn is_reply(&self) -> bool {
        self.reply_to_message_id.is_some()
    }
}
