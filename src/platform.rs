//! Messaging platform contract.
//!
//! Front-end adapters (Telegram, Discord, ...) implement this trait; the
//! handler uses it for exactly two things: creating a status message once
//! per node, then editing it in place as the turn streams, so the user
//! sees one evolving message rather than a flood.

use crate::error::HandlerError;

/// Options for sending or editing a status message.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Platform message id to thread the status under.
    pub reply_to: Option<String>,
    /// Render the text as markdown.
    pub markdown: bool,
}

impl SendOptions {
    pub fn markdown_reply_to(message_id: &str) -> Self {
        Self {
            reply_to: Some(message_id.to_string()),
            markdown: true,
        }
    }

    pub fn markdown() -> Self {
        Self {
            reply_to: None,
            markdown: true,
        }
    }
}

/// Collaborator contract for the messaging front-end.
#[async_trait::async_trait]
pub trait Platform: Send + Sync {
    /// Send a new status message, returning its platform message id.
    async fn send_status(
        &self,
        chat_id: &str,
        text: &str,
        options: &SendOptions,
    ) -> Result<String, HandlerError>;

    /// Edit a previously sent status message in place.
    async fn edit_status(
        &self,
        chat_id: &str,
        status_message_id: &str,
        text: &str,
        options: &SendOptions,
    ) -> Result<(), HandlerError>;
}
