//! Language-model boundary
//!
//! Workers, the router and the LLM-backed tools all talk to a model through
//! [`ChatModel`]. Calls are the only place a task suspends on the model, and
//! errors from here are the one category allowed to propagate out of a task.

use crate::error::OrchestrationError;
use crate::memory::Message;
use crate::models::{ToolCall, ToolSpec};
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use tokio::sync::Mutex;

pub mod gemini;
pub use gemini::GeminiChatModel;

/// One model decision: free text, tool calls, or both.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelTurn {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

impl ModelTurn {
    pub fn answer(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn needs_tool(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Trait for chat models (tool calling + structured output)
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Ask the model for its next decision. An empty `tools` slice means the
    /// model may only answer in text.
    async fn invoke(&self, system: &str, messages: &[Message], tools: &[ToolSpec])
        -> Result<ModelTurn>;

    /// Ask for a single JSON object conforming to `schema`.
    async fn structured(&self, system: &str, messages: &[Message], schema: &Value)
        -> Result<Value>;
}

//
// ================= Scripted model =================
//

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Invoke,
    Structured,
}

/// A request the scripted model received.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub kind: CallKind,
    pub system: String,
    pub tools: Vec<String>,
    pub message_count: usize,
}

/// Replays canned turns in order. Used by tests and offline runs.
#[derive(Default)]
pub struct ScriptedModel {
    turns: Mutex<VecDeque<ModelTurn>>,
    structured: Mutex<VecDeque<Value>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a turn that requests a single tool call.
    pub fn then_tool(mut self, name: &str, arguments: Value) -> Self {
        let n = self.queued_turns();
        self.then_turn(ModelTurn {
            content: String::new(),
            tool_calls: vec![ToolCall {
                id: format!("call_{}", n + 1),
                name: name.to_string(),
                arguments,
            }],
        })
    }

    pub fn then_answer(self, content: &str) -> Self {
        self.then_turn(ModelTurn::answer(content))
    }

    pub fn then_turn(mut self, turn: ModelTurn) -> Self {
        self.turns.get_mut().push_back(turn);
        self
    }

    pub fn then_structured(mut self, value: Value) -> Self {
        self.structured.get_mut().push_back(value);
        self
    }

    fn queued_turns(&mut self) -> usize {
        self.turns.get_mut().len()
    }

    pub async fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().await.clone()
    }

    pub async fn call_count(&self, kind: CallKind) -> usize {
        self.calls.lock().await.iter().filter(|c| c.kind == kind).count()
    }

    async fn record(&self, kind: CallKind, system: &str, messages: &[Message], tools: &[ToolSpec]) {
        self.calls.lock().await.push(RecordedCall {
            kind,
            system: system.to_string(),
            tools: tools.iter().map(|t| t.name.clone()).collect(),
            message_count: messages.len(),
        });
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn invoke(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[ToolSpec],
    ) -> Result<ModelTurn> {
        self.record(CallKind::Invoke, system, messages, tools).await;
        self.turns
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| OrchestrationError::LlmError("scripted model has no turns left".into()))
    }

    async fn structured(&self, system: &str, messages: &[Message], _schema: &Value) -> Result<Value> {
        self.record(CallKind::Structured, system, messages, &[]).await;
        self.structured.lock().await.pop_front().ok_or_else(|| {
            OrchestrationError::LlmError("scripted model has no structured replies left".into())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_scripted_model_replays_in_order() {
        let model = ScriptedModel::new()
            .then_tool("extract_all_texts", json!({}))
            .then_answer("done")
            .then_structured(json!({"next": "Scribe"}));

        let msgs = vec![Message::user("go")];
        let first = model.invoke("sys", &msgs, &[]).await.unwrap();
        assert!(first.needs_tool());
        assert_eq!(first.tool_calls[0].id, "call_1");

        let second = model.invoke("sys", &msgs, &[]).await.unwrap();
        assert_eq!(second.content, "done");

        let routed = model.structured("sys", &msgs, &json!({})).await.unwrap();
        assert_eq!(routed["next"], "Scribe");

        assert!(model.invoke("sys", &msgs, &[]).await.is_err());
        assert_eq!(model.call_count(CallKind::Invoke).await, 3);
        assert_eq!(model.call_count(CallKind::Structured).await, 1);
    }
}
