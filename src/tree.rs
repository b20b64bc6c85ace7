//! Conversation trees: node model, registry, and continuity resolution.

pub mod continuity;
pub mod node;
pub mod queue;

pub use continuity::find_continuity_anchor;
pub use node::{MessageNode, MessageState, MessageTree};
pub use queue::{CascadeOutcome, TreeQueue};
