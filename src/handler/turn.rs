use super::*;

use crate::session::TurnEvent;
use crate::status::TurnReport;
use tokio::time::{Duration, Instant};

const STATUS_THINKING: &str = "🧠 **Thinking...**";
const STATUS_WORKING: &str = "🧠 **Working...**";
const STATUS_TOOLS: &str = "⏳ **Executing tools...**";
const STATUS_SUBAGENT: &str = "🤖 **Subagent working...**";

// Effective deadline when no turn timeout is configured.
const NO_DEADLINE_SLEEP: Duration = Duration::from_secs(3600);

impl MessageHandler {
    /// Drive one streamed agent turn to its terminal outcome.
    ///
    /// Consumes the finite event stream, folding events into a
    /// [`TurnReport`] and editing the node's status message in place
    /// (throttled, except for terminal updates). Returns `Ok` on a
    /// successful terminal event; every other exit is an error the caller
    /// maps to the node's `Error` state.
    ///
    /// Cancellation is observed within one event-processing interval: the
    /// loop selects on the cancel flag alongside the event stream, and this
    /// task, as the lease owner, is the one that asks the provider to
    /// cancel the session.
    pub(super) async fn drive_turn(
        &self,
        chat_id: &str,
        status_message_id: Option<&str>,
        lease: &SessionLease,
        text: &str,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> Result<(), HandlerError> {
        let (turn_timeout, timeout_secs, edit_interval) = {
            let config = self.config.load();
            (
                config.turn_timeout(),
                config.turn_timeout_secs,
                config.status_edit_interval(),
            )
        };

        let mut events = self.sessions.submit(lease, text).await?;
        let deadline = turn_timeout.map(|timeout| Instant::now() + timeout);
        let mut report = TurnReport::new();
        let mut editor = StatusEditor {
            platform: self.platform.as_ref(),
            chat_id,
            status_message_id,
            interval: edit_interval,
            last_edit: None,
        };

        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = cancel_rx.changed() => {
                    if !*cancel_rx.borrow_and_update() {
                        continue;
                    }
                    self.sessions.cancel(lease).await;
                    report.record_error("task was cancelled");
                    editor.force(&report, STATUS_STOPPED).await;
                    return Err(HandlerError::Cancelled("stop requested".to_string()));
                }
                _ = tokio::time::sleep_until(
                    deadline.unwrap_or_else(|| Instant::now() + NO_DEADLINE_SLEEP)
                ), if deadline.is_some() => {
                    self.sessions.cancel(lease).await;
                    report.record_error(&format!("turn timed out after {timeout_secs}s"));
                    editor.force(&report, STATUS_ERROR).await;
                    return Err(HandlerError::TurnTimeout(timeout_secs));
                }
            };

            match event {
                Some(TurnEvent::Completed) => {
                    report.record(&TurnEvent::Completed);
                    editor.force(&report, STATUS_COMPLETE).await;
                    return Ok(());
                }
                Some(TurnEvent::Failed { message }) => {
                    report.record(&TurnEvent::Failed {
                        message: message.clone(),
                    });
                    editor.force(&report, STATUS_ERROR).await;
                    return Err(HandlerError::TurnExecution(message));
                }
                Some(event) => {
                    let status_line = status_line_for(&event);
                    report.record(&event);
                    editor.maybe(&report, status_line).await;
                }
                None => {
                    // The stream closed without a terminal event; treat it
                    // as an execution failure rather than guessing success.
                    report.record_error("session ended without a result");
                    editor.force(&report, STATUS_ERROR).await;
                    return Err(HandlerError::TurnExecution(
                        "session ended without a result".to_string(),
                    ));
                }
            }
        }
    }
}

fn status_line_for(event: &TurnEvent) -> &'static str {
    match event {
        TurnEvent::Thinking(_) => STATUS_THINKING,
        TurnEvent::ToolStarted { .. } => STATUS_TOOLS,
        TurnEvent::SubagentStarted { .. } => STATUS_SUBAGENT,
        _ => STATUS_WORKING,
    }
}

/// Throttled in-place editor for a node's status message.
///
/// Non-terminal edits are limited to one per interval so a chatty stream
/// does not flood the platform; terminal edits always go through.
struct StatusEditor<'a> {
    platform: &'a dyn Platform,
    chat_id: &'a str,
    status_message_id: Option<&'a str>,
    interval: Duration,
    last_edit: Option<Instant>,
}

impl StatusEditor<'_> {
    async fn maybe(&mut self, report: &TurnReport, status_line: &str) {
        if self
            .last_edit
            .is_some_and(|last_edit| last_edit.elapsed() < self.interval)
        {
            return;
        }
        self.edit(report, status_line).await;
    }

    async fn force(&mut self, report: &TurnReport, status_line: &str) {
        self.edit(report, status_line).await;
    }

    async fn edit(&mut self, report: &TurnReport, status_line: &str) {
        let Some(status_message_id) = self.status_message_id else {
            return;
        };
        let text = report.render(Some(status_line));
        match self
            .platform
            .edit_status(self.chat_id, status_message_id, &text, &SendOptions::markdown())
            .await
        {
            Ok(()) => self.last_edit = Some(Instant::now()),
            Err(error) => tracing::warn!(%error, "status edit failed"),
        }
    }
}
