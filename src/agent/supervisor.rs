//! Supervisor router
//!
//! Classifies the running conversation into one registered worker or
//! FINISH. The decision is a single-field structured output, parsed against
//! the closed set; anything else is a `RoutingContract` error.

use crate::agent::roster::supervisor_prompt;
use crate::error::OrchestrationError;
use crate::llm::ChatModel;
use crate::state::{RouteDirective, TaskState, WorkerName, FINISH};
use crate::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

pub struct Supervisor {
    model: Arc<dyn ChatModel>,
    workers: Vec<WorkerName>,
    system_prompt: String,
}

impl Supervisor {
    pub fn new(model: Arc<dyn ChatModel>, workers: Vec<WorkerName>) -> Self {
        let system_prompt = supervisor_prompt(&workers);
        Self {
            model,
            workers,
            system_prompt,
        }
    }

    /// `{"next": <worker or FINISH>}`
    pub fn decision_schema(&self) -> Value {
        let mut options: Vec<&str> = vec![FINISH];
        options.extend(self.workers.iter().map(|w| w.as_str()));
        json!({
            "type": "OBJECT",
            "properties": {
                "next": { "type": "STRING", "enum": options }
            },
            "required": ["next"]
        })
    }

    /// Decide the next hop.
    ///
    /// A FINISH left by the previous worker (or a failed task) ends the task
    /// without a model call. The directive is consumed either way.
    pub async fn decide(&self, state: &mut TaskState) -> Result<RouteDirective> {
        if let Some(RouteDirective::Finish) = state.take_route() {
            debug!(task_id = %state.task_id, "Worker declared FINISH, skipping classification");
            return Ok(RouteDirective::Finish);
        }
        if state.is_fatal() {
            return Ok(RouteDirective::Finish);
        }

        let reply = self
            .model
            .structured(&self.system_prompt, &state.transcript(), &self.decision_schema())
            .await?;

        let directive = self.parse_decision(&reply)?;
        info!(task_id = %state.task_id, next = %directive, "Supervisor decision");
        Ok(directive)
    }

    fn parse_decision(&self, reply: &Value) -> Result<RouteDirective> {
        let raw = reply.get("next").and_then(Value::as_str).ok_or_else(|| {
            OrchestrationError::RoutingContract(format!("decision has no 'next' field: {}", reply))
        })?;

        let directive: RouteDirective = raw.parse()?;
        if let RouteDirective::Worker(name) = directive {
            if !self.workers.contains(&name) {
                return Err(OrchestrationError::RoutingContract(format!(
                    "'{}' is not registered with this supervisor",
                    name
                )));
            }
        }
        Ok(directive)
    }
}
