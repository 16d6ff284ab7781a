//! Tool trait, registry and dispatch shim
//!
//! A tool is a named operation with a declared parameter schema. Workers
//! never call tools directly: the model's requested calls go through
//! [`dispatch`], which validates names against the registry, runs the calls
//! concurrently, converts any tool error into a fatal [`StatePatch`] and
//! hands results back in request order.

use crate::config::Pacing;
use crate::db::StatementStore;
use crate::error::OrchestrationError;
use crate::llm::ChatModel;
use crate::memory::{Message, RefKey, ReferenceStore};
use crate::models::{ToolCall, ToolInput, ToolSpec};
use crate::search::SearchProvider;
use crate::state::{Artifacts, StatePatch, TaskContext};
use crate::Result;
use chrono::NaiveDate;
use futures_util::future::join_all;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

pub mod classify;
pub mod extract;
pub mod insights;
pub mod parse;
pub mod persist;
pub mod search;

/// What a tool hands back on success.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    /// Model-visible result; must stay small (references, counts)
    pub payload: Value,
    /// Typed Task State update
    pub patch: StatePatch,
}

impl ToolOutput {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            patch: StatePatch::default(),
        }
    }

    pub fn with_patch(mut self, patch: StatePatch) -> Self {
        self.patch = patch;
        self
    }
}

/// Read-only view a tool runs against.
#[derive(Clone)]
pub struct ToolContext {
    pub refs: Arc<ReferenceStore>,
    pub task: TaskContext,
    /// Artifact references merged into Task State so far
    pub artifacts: Artifacts,
}

/// Trait for a single tool
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;

    /// Parameter schema (Gemini OpenAPI subset)
    fn parameters(&self) -> Value {
        json!({ "type": "OBJECT", "properties": {} })
    }

    async fn execute(&self, input: &ToolInput, ctx: &ToolContext) -> Result<ToolOutput>;

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}

/// Tool registry for looking up and executing tools
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Specs offered to the model, sorted by name.
    pub fn specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self.tools.values().map(|t| t.spec()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Collaborators the built-in tools are wired to.
#[derive(Clone)]
pub struct ToolDeps {
    pub store: Arc<dyn StatementStore>,
    pub search: Arc<dyn SearchProvider>,
    pub parser: Arc<dyn ChatModel>,
    pub classifier: Arc<dyn ChatModel>,
    pub pacing: Pacing,
}

/// Statement processing tools (Scribe).
pub fn scribe_registry(deps: &ToolDeps) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(extract::ExtractAllTextsTool));
    registry.register(Arc::new(parse::ParseAllStatementsTool::new(
        deps.parser.clone(),
        deps.pacing,
    )));
    registry.register(Arc::new(persist::WriteAllStatementsTool::new(deps.store.clone())));
    registry.register(Arc::new(persist::ReadTransactionsTool::new(deps.store.clone())));
    registry.register(Arc::new(classify::ClassifyTransactionsTool::new(
        deps.classifier.clone(),
        deps.search.clone(),
        deps.pacing,
    )));
    registry.register(Arc::new(persist::UpdateTransactionClassificationTool::new(
        deps.store.clone(),
    )));
    registry
}

/// Insight tools (Sage).
pub fn sage_registry(deps: &ToolDeps) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(insights::SummarizeSpendingTool::new(deps.store.clone())));
    registry.register(Arc::new(search::SearchWebTool::new(deps.search.clone())));
    registry
}

//
// ================= Dispatch shim =================
//

/// Outcome of one requested call, ready to merge into Task State.
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub call: ToolCall,
    pub message: Message,
    pub patch: StatePatch,
}

impl Dispatched {
    fn failed(call: &ToolCall, detail: String) -> Self {
        let content = json!({ "fatal_error": true, "error_detail": detail }).to_string();
        Self {
            call: call.clone(),
            message: Message::tool_result(call, content),
            patch: StatePatch::fatal(detail),
        }
    }
}

/// Run the requested calls and return their results in request order.
///
/// Never fails: unknown names, bad arguments and tool errors all come back
/// as fatal patches. Callers must not dispatch for a task that has already
/// failed; the worker loop checks that before every step.
pub async fn dispatch(registry: &ToolRegistry, calls: &[ToolCall], ctx: &ToolContext) -> Vec<Dispatched> {
    join_all(calls.iter().map(|call| run_one(registry, call, ctx))).await
}

async fn run_one(registry: &ToolRegistry, call: &ToolCall, ctx: &ToolContext) -> Dispatched {
    let Some(tool) = registry.get(&call.name) else {
        warn!(tool = %call.name, "Model requested an unregistered tool");
        return Dispatched::failed(
            call,
            OrchestrationError::ToolNotFound(call.name.clone()).to_string(),
        );
    };

    let input = ToolInput {
        tool_name: call.name.clone(),
        parameters: if call.arguments.is_null() {
            json!({})
        } else {
            call.arguments.clone()
        },
    };

    let start = Instant::now();
    info!(tool = %call.name, call_id = %call.id, "Tool started");

    let result = match ensure_object_parameters(&input) {
        Ok(()) => tool.execute(&input, ctx).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(output) => {
            info!(
                tool = %call.name,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Tool finished"
            );
            Dispatched {
                call: call.clone(),
                message: Message::tool_result(call, output.payload.to_string()),
                patch: output.patch,
            }
        }
        Err(e) => {
            warn!(tool = %call.name, error = %e, "Tool failed");
            Dispatched::failed(call, format!("{} failed: {}", call.name, e))
        }
    }
}

//
// ================= Argument helpers =================
//

fn ensure_object_parameters(input: &ToolInput) -> Result<()> {
    if input.parameters.is_object() {
        Ok(())
    } else {
        Err(OrchestrationError::InvalidToolInput(
            "tool arguments must be a JSON object".to_string(),
        ))
    }
}

pub(crate) fn optional_str<'a>(input: &'a ToolInput, key: &str) -> Option<&'a str> {
    input
        .parameters
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

pub(crate) fn optional_date(input: &ToolInput, key: &str) -> Result<Option<NaiveDate>> {
    optional_str(input, key)
        .map(|raw| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
                OrchestrationError::InvalidToolInput(format!("'{}' must be YYYY-MM-DD, got '{}'", key, raw))
            })
        })
        .transpose()
}

/// A list of reference keys from `key`, or `fallback` when omitted.
pub(crate) fn ref_list(input: &ToolInput, key: &str, fallback: &[RefKey]) -> Result<Vec<RefKey>> {
    match input.parameters.get(key) {
        None | Some(Value::Null) => Ok(fallback.to_vec()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str().map(RefKey::from).ok_or_else(|| {
                    OrchestrationError::InvalidToolInput(format!("'{}' must be a list of strings", key))
                })
            })
            .collect(),
        Some(_) => Err(OrchestrationError::InvalidToolInput(format!(
            "'{}' must be a list of strings",
            key
        ))),
    }
}

/// A single reference key from `key`, or `fallback` when omitted.
pub(crate) fn single_ref(input: &ToolInput, key: &str, fallback: Option<&RefKey>) -> Result<RefKey> {
    optional_str(input, key)
        .map(RefKey::from)
        .or_else(|| fallback.cloned())
        .ok_or_else(|| {
            OrchestrationError::InvalidToolInput(format!(
                "'{}' was not given and no earlier step produced one",
                key
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Echo;

    #[async_trait::async_trait]
    impl Tool for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn description(&self) -> &'static str {
            "Echo the 'text' argument"
        }

        async fn execute(&self, input: &ToolInput, _ctx: &ToolContext) -> Result<ToolOutput> {
            // later calls finish first; results must still come back in order
            let delay = input.parameters.get("delay_ms").and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            let text = optional_str(input, "text")
                .ok_or_else(|| OrchestrationError::InvalidToolInput("text is required".into()))?;
            Ok(ToolOutput::new(json!({ "echo": text })))
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo));
        registry
    }

    fn ctx() -> ToolContext {
        ToolContext {
            refs: Arc::new(ReferenceStore::new(Duration::from_secs(60), 10)),
            task: TaskContext::default(),
            artifacts: Artifacts::default(),
        }
    }

    fn call(id: &str, name: &str, args: Value) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: args,
        }
    }

    #[tokio::test]
    async fn test_results_follow_request_order() {
        let calls = vec![
            call("a", "echo", json!({"text": "first", "delay_ms": 30})),
            call("b", "echo", json!({"text": "second", "delay_ms": 0})),
        ];
        let results = dispatch(&registry(), &calls, &ctx()).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].call.id, "a");
        assert!(results[0].message.content.contains("first"));
        assert_eq!(results[1].message.tool_call_id.as_deref(), Some("b"));
        assert!(results.iter().all(|r| !r.patch.is_fatal()));
    }

    #[tokio::test]
    async fn test_unknown_tool_and_errors_become_fatal_patches() {
        let calls = vec![
            call("a", "drop_tables", json!({})),
            call("b", "echo", json!({})),
            call("c", "echo", json!("not an object")),
        ];
        let results = dispatch(&registry(), &calls, &ctx()).await;
        assert!(results.iter().all(|r| r.patch.is_fatal()));
        assert!(results[0].patch.fatal_error.as_deref().unwrap().contains("drop_tables"));

        let payload: Value = serde_json::from_str(&results[1].message.content).unwrap();
        assert_eq!(payload["fatal_error"], true);
    }

    #[test]
    fn test_ref_arguments_fall_back_to_artifacts() {
        let input = ToolInput {
            tool_name: "t".into(),
            parameters: json!({}),
        };
        let fallback = vec![RefKey::from("k1")];
        assert_eq!(ref_list(&input, "text_refs", &fallback).unwrap(), fallback);
        assert!(single_ref(&input, "transactions_ref", None).is_err());

        let explicit = ToolInput {
            tool_name: "t".into(),
            parameters: json!({"text_refs": ["k2"], "transactions_ref": "t1", "start_date": "2025-13-01"}),
        };
        assert_eq!(ref_list(&explicit, "text_refs", &fallback).unwrap(), vec![RefKey::from("k2")]);
        assert_eq!(single_ref(&explicit, "transactions_ref", None).unwrap(), RefKey::from("t1"));
        assert!(optional_date(&explicit, "start_date").is_err());
    }
}
