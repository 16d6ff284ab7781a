//! Worker state machine
//!
//! ```text
//! AwaitingDecision ──tool calls──▶ NeedsTool ──dispatch──▶ AwaitingDecision{continuation}
//!        │                                                        │
//!        └──answer──▶ Done                             answer──▶ Done (FINISH)
//!
//! any phase ──fatal observed──▶ Terminal ──closing message──▶ Done (FINISH)
//! ```
//!
//! The fatal check runs before every step, so no path reaches the dispatch
//! shim once the task has failed. `Terminal` still asks the model for the
//! closing explanation, offering it no tools.

use crate::agent::roster::{fatal_closing_message, fatal_note, WorkerProfile};
use crate::agent::{ProgressSink, TraceEntry};
use crate::llm::ChatModel;
use crate::memory::{Message, ReferenceStore};
use crate::models::{ToolCall, ToolSpec};
use crate::state::{RouteDirective, TaskState, WorkerName};
use crate::tools::{dispatch, ToolContext, ToolRegistry};
use crate::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Dispatch rounds one worker visit may use before the task is failed
pub const MAX_TOOL_ROUNDS: usize = 12;

#[derive(Debug)]
enum Phase {
    AwaitingDecision { continuation: bool },
    NeedsTool(Vec<ToolCall>),
    Terminal,
    Done,
}

pub struct Worker {
    profile: WorkerProfile,
    model: Arc<dyn ChatModel>,
    tools: ToolRegistry,
    specs: Vec<ToolSpec>,
}

impl Worker {
    pub fn new(profile: WorkerProfile, model: Arc<dyn ChatModel>, tools: ToolRegistry) -> Self {
        let specs = tools.specs();
        Self {
            profile,
            model,
            tools,
            specs,
        }
    }

    pub fn name(&self) -> WorkerName {
        self.profile.name
    }

    /// Run the worker loop to completion for one dispatch.
    ///
    /// Model errors propagate; tool failures arrive as fatal patches and end
    /// the loop through `Terminal`.
    ///
    /// Progress lines and trace entries are pushed as the loop runs.
    pub async fn run(
        &self,
        state: &mut TaskState,
        refs: &Arc<ReferenceStore>,
        progress: &ProgressSink,
        trace: &mut Vec<TraceEntry>,
    ) -> Result<()> {
        let worker = self.profile.name;
        let mut phase = Phase::AwaitingDecision { continuation: false };
        let mut rounds = 0usize;

        loop {
            if state.is_fatal() && matches!(phase, Phase::AwaitingDecision { .. } | Phase::NeedsTool(_)) {
                phase = Phase::Terminal;
            }
            debug!(task_id = %state.task_id, %worker, ?phase, "Worker step");

            phase = match phase {
                Phase::AwaitingDecision { continuation } => {
                    let turn = self
                        .model
                        .invoke(&self.profile.system_prompt, state.messages(), &self.specs)
                        .await?;

                    if turn.needs_tool() {
                        let names: Vec<String> = turn.tool_calls.iter().map(|c| c.name.clone()).collect();
                        info!(task_id = %state.task_id, %worker, tools = ?names, "Model requested tools");
                        trace.push(TraceEntry::new(worker.as_str(), "dispatch", names));

                        let calls = turn.tool_calls.clone();
                        state.push(Message::assistant_with_calls(turn.content, turn.tool_calls));
                        Phase::NeedsTool(calls)
                    } else {
                        state.push(Message::assistant(turn.content));
                        if continuation || self.profile.finish_on_first_answer {
                            state.set_route(Some(RouteDirective::Finish));
                            trace.push(TraceEntry::new(worker.as_str(), "FINISH", Vec::new()));
                        } else {
                            trace.push(TraceEntry::new(worker.as_str(), "answer", Vec::new()));
                        }
                        Phase::Done
                    }
                }

                Phase::NeedsTool(calls) => {
                    rounds += 1;
                    if rounds > MAX_TOOL_ROUNDS {
                        state.record_fatal(format!(
                            "{} stopped after {} tool rounds without finishing",
                            worker, MAX_TOOL_ROUNDS
                        ));
                        Phase::Terminal
                    } else {
                        for call in &calls {
                            progress.emit(format!("{} is running {}", worker, call.name));
                        }

                        let ctx = ToolContext {
                            refs: Arc::clone(refs),
                            task: state.context().clone(),
                            artifacts: state.artifacts().clone(),
                        };
                        let results = dispatch(&self.tools, &calls, &ctx).await;
                        for result in results {
                            state.push(result.message);
                            state.apply(result.patch);
                        }
                        Phase::AwaitingDecision { continuation: true }
                    }
                }

                Phase::Terminal => {
                    let detail = state.error_detail().unwrap_or("unknown error").to_string();
                    warn!(task_id = %state.task_id, %worker, detail = %detail, "Closing task after fatal error");

                    let mut request = state.messages().to_vec();
                    request.push(Message::system(fatal_note(&detail)));
                    let turn = self.model.invoke(&self.profile.system_prompt, &request, &[]).await?;
                    if turn.needs_tool() {
                        warn!(task_id = %state.task_id, %worker, "Ignoring tool calls requested after fatal error");
                    }

                    let closing = if turn.content.trim().is_empty() {
                        fatal_closing_message(&detail)
                    } else {
                        turn.content
                    };
                    state.push(Message::assistant(closing));
                    state.set_route(Some(RouteDirective::Finish));
                    trace.push(TraceEntry::new(worker.as_str(), "fatal", Vec::new()));
                    Phase::Done
                }

                Phase::Done => break,
            };
        }

        Ok(())
    }
}
