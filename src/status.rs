//! Turn report accumulation and status message rendering.
//!
//! Each node owns one platform status message that is edited in place as
//! its agent turn streams. The report collects what happened so far and
//! renders it as a single markdown body in a fixed section order, bounded
//! to the platform message size.

use crate::session::TurnEvent;

/// Emoji the bot's own status messages start with. Inbound messages with
/// one of these prefixes are echoes of our output and are ignored.
pub const STATUS_PREFIXES: &[&str] = &[
    "⏳", "💭", "🔧", "✅", "❌", "🚀", "🤖", "📋", "📊", "🔄", "⏹", "🧠", "💥", "🛠",
];

/// Whether `text` looks like one of the bot's own status messages.
pub fn is_self_status(text: &str) -> bool {
    STATUS_PREFIXES.iter().any(|prefix| text.starts_with(prefix))
}

const MAX_THINKING_CHARS: usize = 800;
const MAX_STATUS_CHARS: usize = 3800;

/// Accumulated view of one streamed agent turn.
#[derive(Debug, Default)]
pub struct TurnReport {
    thinking: Vec<String>,
    tools: Vec<String>,
    subagents: Vec<String>,
    content: Vec<String>,
    errors: Vec<String>,
}

impl TurnReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one turn event into the report.
    pub fn record(&mut self, event: &TurnEvent) {
        match event {
            TurnEvent::Thinking(text) => self.thinking.push(text.clone()),
            TurnEvent::Content(text) => {
                if !text.is_empty() {
                    self.content.push(text.clone());
                }
            }
            TurnEvent::ToolStarted { name } => self.tools.push(name.clone()),
            TurnEvent::SubagentStarted { task } => self.subagents.push(task.clone()),
            TurnEvent::Completed => {
                if self.is_empty() {
                    self.content.push("Done.".to_string());
                }
            }
            TurnEvent::Failed { message } => self.record_error(message),
        }
    }

    /// Record a failure that did not arrive as a turn event (timeout,
    /// session acquisition, cancellation).
    pub fn record_error(&mut self, message: &str) {
        self.errors.push(truncate_head(message, 200));
    }

    pub fn is_empty(&self) -> bool {
        self.thinking.is_empty()
            && self.tools.is_empty()
            && self.subagents.is_empty()
            && self.content.is_empty()
            && self.errors.is_empty()
    }

    /// Render the status message body.
    ///
    /// Section order is fixed: thinking, tools, subagents, content, errors,
    /// then the status line at the bottom. The result is truncated from the
    /// front when over the platform limit; the bottom (content and status)
    /// is what the user needs most.
    pub fn render(&self, status_line: Option<&str>) -> String {
        let mut lines: Vec<String> = Vec::new();

        if !self.thinking.is_empty() {
            let full = self.thinking.concat();
            let display = truncate_head(&full, MAX_THINKING_CHARS);
            lines.push(format!("💭 **Thinking:**\n```\n{display}\n```"));
        }

        if !self.tools.is_empty() {
            let mut seen = std::collections::HashSet::new();
            let unique: Vec<&str> = self
                .tools
                .iter()
                .map(String::as_str)
                .filter(|tool| seen.insert(*tool))
                .collect();
            lines.push(format!("🛠 **Tools:** `{}`", unique.join(", ")));
        }

        for task in &self.subagents {
            lines.push(format!("🤖 **Subagent:** `{task}`"));
        }

        if !self.content.is_empty() {
            lines.push(self.content.concat());
        }

        for error in &self.errors {
            lines.push(format!("⚠️ **Error:** `{error}`"));
        }

        if let Some(status_line) = status_line {
            lines.push(String::new());
            lines.push(status_line.to_string());
        }

        truncate_tail_preserving(&lines.join("\n"), MAX_STATUS_CHARS)
    }
}

/// Keep the first `max_chars` characters, appending an ellipsis when cut.
fn truncate_head(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => format!("{}...", &text[..byte_index]),
        None => text.to_string(),
    }
}

/// Keep the last `max_chars` characters, prepending an ellipsis when cut.
fn truncate_tail_preserving(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let byte_index = text
        .char_indices()
        .nth(total - max_chars)
        .map(|(index, _)| index)
        .unwrap_or(0);
    format!("...{}", &text[byte_index..])
}
