//! Gemini API client
//!
//! Implements [`ChatModel`] over `generateContent`: function calling for the
//! worker loop, JSON-schema response mode for structured decisions.
//! Uses a long-lived reqwest::Client for connection pooling.

use crate::error::OrchestrationError;
use crate::llm::{ChatModel, ModelTurn};
use crate::memory::{Message, MessageRole};
use crate::models::{ToolCall, ToolSpec};
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error, info};
use uuid::Uuid;

const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Reusable Gemini client (connection-pooled)
pub struct GeminiChatModel {
    client: Client,
    api_key: String,
    model: String,
}

impl GeminiChatModel {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(120))
            .build()?;

        Ok(Self {
            client,
            api_key: api_key.into(),
            model: model.into(),
        })
    }

    async fn generate(&self, request: &GeminiRequest) -> Result<GeminiResponse> {
        if self.api_key.is_empty() {
            return Err(OrchestrationError::LlmError(
                "GEMINI_API_KEY not configured".to_string(),
            ));
        }

        let url = format!("{}/{}:generateContent", BASE_URL, self.model);
        debug!(model = %self.model, contents = request.contents.len(), "Calling Gemini API");

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                error!("Gemini API request failed: {}", e);
                OrchestrationError::LlmError(format!("Gemini API error: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!(%status, "Gemini API error response: {}", error_text);
            return Err(OrchestrationError::LlmError(format!(
                "Gemini API returned {}: {}",
                status, error_text
            )));
        }

        let parsed: GeminiResponse = response.json().await.map_err(|e| {
            error!("Failed to parse Gemini response: {}", e);
            OrchestrationError::LlmError(format!("Gemini parse error: {}", e))
        })?;

        if let Some(usage) = &parsed.usage_metadata {
            info!(
                model = %self.model,
                prompt_tokens = usage.prompt_token_count,
                candidate_tokens = usage.candidates_token_count,
                "Gemini response received"
            );
        }

        Ok(parsed)
    }
}

#[async_trait]
impl ChatModel for GeminiChatModel {
    async fn invoke(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[ToolSpec],
    ) -> Result<ModelTurn> {
        let request = GeminiRequest {
            contents: to_contents(messages),
            system_instruction: system_instruction(system),
            tools: tool_declarations(tools),
            generation_config: GenerationConfig::default(),
        };

        let response = self.generate(&request).await?;
        turn_from_response(response)
    }

    async fn structured(&self, system: &str, messages: &[Message], schema: &Value) -> Result<Value> {
        let request = GeminiRequest {
            contents: to_contents(messages),
            system_instruction: system_instruction(system),
            tools: Vec::new(),
            generation_config: GenerationConfig {
                response_mime_type: Some("application/json".to_string()),
                response_schema: Some(schema.clone()),
                ..GenerationConfig::default()
            },
        };

        let response = self.generate(&request).await?;
        let turn = turn_from_response(response)?;
        parse_json_reply(&turn.content)
    }
}

/// Parse a JSON reply, tolerating a markdown fence around it.
fn parse_json_reply(raw: &str) -> Result<Value> {
    let cleaned = raw
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    serde_json::from_str(cleaned).map_err(|e| {
        OrchestrationError::LlmError(format!(
            "Failed to parse structured Gemini reply: {} | raw={}",
            e, raw
        ))
    })
}

fn system_instruction(system: &str) -> Option<Content> {
    if system.trim().is_empty() {
        return None;
    }
    Some(Content {
        role: String::new(),
        parts: vec![Part::text(system)],
    })
}

fn tool_declarations(tools: &[ToolSpec]) -> Vec<ToolDeclarations> {
    if tools.is_empty() {
        return Vec::new();
    }
    vec![ToolDeclarations {
        function_declarations: tools
            .iter()
            .map(|t| FunctionDeclaration {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: has_properties(&t.parameters).then(|| t.parameters.clone()),
            })
            .collect(),
    }]
}

fn has_properties(schema: &Value) -> bool {
    schema
        .get("properties")
        .and_then(Value::as_object)
        .map_or(false, |p| !p.is_empty())
}

/// Map the transcript onto Gemini contents, merging consecutive turns of
/// the same role (parallel tool results become one `user` content).
fn to_contents(messages: &[Message]) -> Vec<Content> {
    let mut contents: Vec<Content> = Vec::with_capacity(messages.len());

    for msg in messages {
        let (role, parts) = match msg.role {
            MessageRole::User | MessageRole::System => ("user", vec![Part::text(&msg.content)]),
            MessageRole::Assistant => {
                let mut parts = Vec::with_capacity(msg.tool_calls.len() + 1);
                if !msg.content.is_empty() {
                    parts.push(Part::text(&msg.content));
                }
                for call in &msg.tool_calls {
                    parts.push(Part {
                        function_call: Some(FunctionCall {
                            name: call.name.clone(),
                            args: call.arguments.clone(),
                        }),
                        ..Part::default()
                    });
                }
                ("model", parts)
            }
            MessageRole::Tool => {
                let response = match serde_json::from_str::<Value>(&msg.content) {
                    Ok(v) if v.is_object() => v,
                    _ => json!({ "content": msg.content }),
                };
                (
                    "user",
                    vec![Part {
                        function_response: Some(FunctionResponse {
                            name: msg.tool_name.clone().unwrap_or_default(),
                            response,
                        }),
                        ..Part::default()
                    }],
                )
            }
        };

        if parts.is_empty() {
            continue;
        }

        match contents.last_mut() {
            Some(last) if last.role == role => last.parts.extend(parts),
            _ => contents.push(Content {
                role: role.to_string(),
                parts,
            }),
        }
    }

    contents
}

fn turn_from_response(response: GeminiResponse) -> Result<ModelTurn> {
    let candidate = response.candidates.into_iter().next().ok_or_else(|| {
        OrchestrationError::LlmError("No candidates in Gemini response".to_string())
    })?;

    let mut turn = ModelTurn::default();
    for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
        if let Some(text) = part.text {
            turn.content.push_str(&text);
        }
        if let Some(call) = part.function_call {
            turn.tool_calls.push(ToolCall {
                id: format!("call_{}", Uuid::new_v4().simple()),
                name: call.name,
                arguments: if call.args.is_null() { json!({}) } else { call.args },
            });
        }
    }

    if turn.content.is_empty() && turn.tool_calls.is_empty() {
        return Err(OrchestrationError::LlmError(format!(
            "Empty response from Gemini (finish_reason={:?})",
            candidate.finish_reason
        )));
    }

    Ok(turn)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolDeclarations>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    role: String,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_response: Option<FunctionResponse>,
}

impl Part {
    fn text(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolDeclarations {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct FunctionDeclaration {
    name: String,
    description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_schema: Option<Value>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            max_output_tokens: 8192,
            response_mime_type: None,
            response_schema: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: i64,
    #[serde(default)]
    candidates_token_count: i64,
}
