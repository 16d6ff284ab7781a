//! Task state threaded through the supervisor/worker graph
//!
//! One `TaskState` lives for exactly one user request. It carries the
//! ordered transcript, the routing directive, the sticky fatal flag, the
//! caller-supplied task context and the artifact references tools produced.
//! Tools never touch it directly: they return a typed [`StatePatch`] that
//! is merged field by field.

use crate::error::OrchestrationError;
use crate::memory::{Message, MessageRole, RefKey};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{info, warn};
use uuid::Uuid;

//
// ================= Routing =================
//

/// The registered worker agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerName {
    Scribe,
    Sage,
    Fallback,
}

impl WorkerName {
    pub const ALL: [WorkerName; 3] = [WorkerName::Scribe, WorkerName::Sage, WorkerName::Fallback];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerName::Scribe => "Scribe",
            WorkerName::Sage => "Sage",
            WorkerName::Fallback => "Fallback",
        }
    }
}

impl fmt::Display for WorkerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where control goes next: a worker, or the end of the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteDirective {
    Worker(WorkerName),
    Finish,
}

pub const FINISH: &str = "FINISH";

impl fmt::Display for RouteDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteDirective::Worker(name) => write!(f, "{}", name),
            RouteDirective::Finish => f.write_str(FINISH),
        }
    }
}

impl FromStr for RouteDirective {
    type Err = OrchestrationError;

    /// Exact match only: anything outside the closed set is a contract error.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            FINISH => Ok(RouteDirective::Finish),
            "Scribe" => Ok(RouteDirective::Worker(WorkerName::Scribe)),
            "Sage" => Ok(RouteDirective::Worker(WorkerName::Sage)),
            "Fallback" => Ok(RouteDirective::Worker(WorkerName::Fallback)),
            other => Err(OrchestrationError::RoutingContract(format!(
                "'{}' is not a registered worker or {}",
                other, FINISH
            ))),
        }
    }
}

//
// ================= Context & artifacts =================
//

/// Caller-supplied, read-only fields for one task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskContext {
    pub input_folder: Option<PathBuf>,
}

impl TaskContext {
    pub fn with_input_folder(folder: impl Into<PathBuf>) -> Self {
        Self {
            input_folder: Some(folder.into()),
        }
    }
}

/// Artifact references produced by tools during the task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Artifacts {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub text_refs: Vec<RefKey>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub statement_refs: Vec<RefKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transactions_ref: Option<RefKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classifications_ref: Option<RefKey>,
}

/// Typed partial update returned by a tool.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatePatch {
    pub fatal_error: Option<String>,
    pub text_refs: Option<Vec<RefKey>>,
    pub statement_refs: Option<Vec<RefKey>>,
    pub transactions_ref: Option<RefKey>,
    pub classifications_ref: Option<RefKey>,
}

impl StatePatch {
    pub fn fatal(detail: impl Into<String>) -> Self {
        Self {
            fatal_error: Some(detail.into()),
            ..Self::default()
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal_error.is_some()
    }
}

//
// ================= Task state =================
//

#[derive(Debug, Clone)]
pub struct TaskState {
    pub task_id: Uuid,
    messages: Vec<Message>,
    seen: HashSet<Uuid>,
    route: Option<RouteDirective>,
    fatal_error: Option<String>,
    context: TaskContext,
    artifacts: Artifacts,
}

impl TaskState {
    /// Start a task from prior history plus the new user turn.
    pub fn new(context: TaskContext, messages: Vec<Message>) -> Self {
        let mut state = Self {
            task_id: Uuid::new_v4(),
            messages: Vec::with_capacity(messages.len() + 8),
            seen: HashSet::new(),
            route: None,
            fatal_error: None,
            context,
            artifacts: Artifacts::default(),
        };
        state.append(messages);
        state
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Concatenate new entries; an entry whose id is already present is skipped.
    pub fn append<I>(&mut self, messages: I)
    where
        I: IntoIterator<Item = Message>,
    {
        for msg in messages {
            if self.seen.insert(msg.message_id) {
                self.messages.push(msg);
            }
        }
    }

    pub fn push(&mut self, message: Message) {
        self.append(std::iter::once(message));
    }

    /// User and assistant text only; what the router classifies.
    pub fn transcript(&self) -> Vec<Message> {
        self.messages
            .iter()
            .filter(|m| matches!(m.role, MessageRole::User | MessageRole::Assistant))
            .filter(|m| !m.content.trim().is_empty())
            .cloned()
            .collect()
    }

    /// Last assistant text, if any.
    pub fn final_answer(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::Assistant && !m.content.trim().is_empty())
            .map(|m| m.content.as_str())
    }

    pub fn route(&self) -> Option<RouteDirective> {
        self.route
    }

    pub fn set_route(&mut self, route: Option<RouteDirective>) {
        self.route = route;
    }

    /// Read and clear the directive; each directive is consumed once.
    pub fn take_route(&mut self) -> Option<RouteDirective> {
        self.route.take()
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal_error.is_some()
    }

    pub fn error_detail(&self) -> Option<&str> {
        self.fatal_error.as_deref()
    }

    /// Raise the fatal flag. Sticky: the first detail wins and nothing clears it.
    pub fn record_fatal(&mut self, detail: impl Into<String>) {
        let detail = detail.into();
        if let Some(existing) = &self.fatal_error {
            warn!(task_id = %self.task_id, existing = %existing, ignored = %detail, "fatal error already recorded");
            return;
        }
        warn!(task_id = %self.task_id, detail = %detail, "fatal error recorded");
        self.fatal_error = Some(detail);
    }

    pub fn context(&self) -> &TaskContext {
        &self.context
    }

    pub fn artifacts(&self) -> &Artifacts {
        &self.artifacts
    }

    /// Merge a tool's patch, one enumerated field at a time.
    pub fn apply(&mut self, patch: StatePatch) {
        let StatePatch {
            fatal_error,
            text_refs,
            statement_refs,
            transactions_ref,
            classifications_ref,
        } = patch;

        if let Some(detail) = fatal_error {
            self.record_fatal(detail);
        }
        if let Some(refs) = text_refs {
            info!(task_id = %self.task_id, count = refs.len(), "merged text_refs");
            self.artifacts.text_refs = refs;
        }
        if let Some(refs) = statement_refs {
            info!(task_id = %self.task_id, count = refs.len(), "merged statement_refs");
            self.artifacts.statement_refs = refs;
        }
        if let Some(key) = transactions_ref {
            self.artifacts.transactions_ref = Some(key);
        }
        if let Some(key) = classifications_ref {
            self.artifacts.classifications_ref = Some(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> TaskState {
        TaskState::new(TaskContext::default(), vec![Message::user("process statements")])
    }

    #[test]
    fn test_append_skips_known_ids() {
        let mut st = state();
        let reply = Message::assistant("ok");
        st.push(reply.clone());
        st.append(vec![reply, Message::assistant("second")]);
        assert_eq!(st.messages().len(), 3);
        assert_eq!(st.messages()[0].content, "process statements");
        assert_eq!(st.last_message().unwrap().content, "second");
    }

    #[test]
    fn test_fatal_is_sticky() {
        let mut st = state();
        assert!(!st.is_fatal());
        st.apply(StatePatch::fatal("bad filename: x.txt"));
        st.apply(StatePatch {
            text_refs: Some(vec![RefKey::from("k")]),
            ..StatePatch::default()
        });
        st.record_fatal("later failure");
        assert!(st.is_fatal());
        assert_eq!(st.error_detail(), Some("bad filename: x.txt"));
    }

    #[test]
    fn test_patch_overwrites_artifacts() {
        let mut st = state();
        st.apply(StatePatch {
            text_refs: Some(vec![RefKey::from("a"), RefKey::from("b")]),
            ..StatePatch::default()
        });
        st.apply(StatePatch {
            text_refs: Some(vec![RefKey::from("c")]),
            transactions_ref: Some(RefKey::from("t")),
            ..StatePatch::default()
        });
        assert_eq!(st.artifacts().text_refs, vec![RefKey::from("c")]);
        assert_eq!(st.artifacts().transactions_ref, Some(RefKey::from("t")));
        assert!(st.artifacts().statement_refs.is_empty());
    }

    #[test]
    fn test_route_is_consumed_once() {
        let mut st = state();
        st.set_route(Some(RouteDirective::Finish));
        assert_eq!(st.take_route(), Some(RouteDirective::Finish));
        assert_eq!(st.take_route(), None);
    }

    #[test]
    fn test_route_parse_is_closed() {
        assert_eq!("FINISH".parse::<RouteDirective>().unwrap(), RouteDirective::Finish);
        assert_eq!(
            "Sage".parse::<RouteDirective>().unwrap(),
            RouteDirective::Worker(WorkerName::Sage)
        );
        assert!("finish".parse::<RouteDirective>().is_err());
        assert!("Banker".parse::<RouteDirective>().is_err());
    }

    #[test]
    fn test_transcript_excludes_tool_traffic() {
        let mut st = state();
        let call = crate::models::ToolCall {
            id: "c1".into(),
            name: "extract_all_texts".into(),
            arguments: serde_json::json!({}),
        };
        st.push(Message::assistant_with_calls("", vec![call.clone()]));
        st.push(Message::tool_result(&call, "{\"count\":1}"));
        st.push(Message::assistant("All statements processed."));
        let transcript = st.transcript();
        assert_eq!(transcript.len(), 2);
        assert_eq!(st.final_answer(), Some("All statements processed."));
    }
}
