//! Interactive session driver
//!
//! Owns the cross-turn history for one conversation, turns each user input
//! into a fresh task, and separates progress markers from answer text.

use crate::agent::{Orchestrator, ProgressSink, TraceEntry, PROGRESS_PREFIX};
use crate::memory::{ConversationHistory, Message};
use crate::state::{TaskContext, TaskState};
use crate::Result;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

/// What one user turn produced.
#[derive(Debug, Clone, Serialize)]
pub struct TurnReply {
    pub answer: String,
    /// Progress lines found in the answer stream, prefix removed
    pub progress: Vec<String>,
    pub fatal_error: bool,
    pub error_detail: Option<String>,
    #[serde(skip)]
    pub trace: Vec<TraceEntry>,
}

pub struct Session {
    pub id: Uuid,
    history: ConversationHistory,
    context: TaskContext,
}

impl Session {
    pub fn new(id: Uuid, window: usize, context: TaskContext) -> Self {
        Self {
            id,
            history: ConversationHistory::new(id, window),
            context,
        }
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    /// Run one user turn as a fresh task.
    ///
    /// History only grows when the task completes; an `Err` leaves it as it
    /// was so the next turn starts from the same place.
    pub async fn run_turn(
        &mut self,
        orchestrator: &Orchestrator,
        text: &str,
        progress: &ProgressSink,
    ) -> Result<TurnReply> {
        let user = Message::user(text.trim());
        let mut messages = self.history.snapshot();
        messages.push(user.clone());

        let state = TaskState::new(self.context.clone(), messages);
        let outcome = match orchestrator.run(state, progress).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "Turn failed");
                return Err(e);
            }
        };

        let (progress_lines, answer) = split_progress(outcome.answer());
        self.history.add_message(user);
        self.history.add_message(Message::assistant(answer.clone()));

        info!(
            session_id = %self.id,
            fatal = outcome.is_fatal(),
            history = self.history.message_count(),
            "Turn complete"
        );

        Ok(TurnReply {
            answer,
            progress: progress_lines,
            fatal_error: outcome.is_fatal(),
            error_detail: outcome.error_detail().map(str::to_string),
            trace: outcome.trace,
        })
    }
}

/// The text after the progress prefix, if `line` is a progress marker.
pub fn strip_progress(line: &str) -> Option<&str> {
    line.strip_prefix(PROGRESS_PREFIX)
        .or_else(|| line.strip_prefix(PROGRESS_PREFIX.trim_end()))
        .map(str::trim)
}

/// Split a mixed stream into progress markers and the visible answer.
pub fn split_progress(text: &str) -> (Vec<String>, String) {
    let mut progress = Vec::new();
    let mut visible = Vec::new();
    for line in text.lines() {
        match strip_progress(line) {
            Some(p) => progress.push(p.to_string()),
            None => visible.push(line),
        }
    }
    (progress, visible.join("\n").trim().to_string())
}
