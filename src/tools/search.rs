//! `search_web`

use crate::error::OrchestrationError;
use crate::models::ToolInput;
use crate::search::{SearchProvider, DEFAULT_MAX_RESULTS};
use crate::tools::{optional_str, Tool, ToolContext, ToolOutput};
use crate::Result;
use serde_json::{json, Value};
use std::sync::Arc;

/// Free-text web search; results come back inline.
pub struct SearchWebTool {
    search: Arc<dyn SearchProvider>,
}

impl SearchWebTool {
    pub fn new(search: Arc<dyn SearchProvider>) -> Self {
        Self { search }
    }
}

#[async_trait::async_trait]
impl Tool for SearchWebTool {
    fn name(&self) -> &'static str {
        "search_web"
    }

    fn description(&self) -> &'static str {
        "Search the web and return the top results (title, snippet, url)."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "OBJECT",
            "properties": {
                "query": { "type": "STRING", "description": "What to search for" }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, input: &ToolInput, _ctx: &ToolContext) -> Result<ToolOutput> {
        let query = optional_str(input, "query")
            .ok_or_else(|| OrchestrationError::InvalidToolInput("'query' is required".to_string()))?;
        let hits = self.search.search(query, DEFAULT_MAX_RESULTS).await?;
        Ok(ToolOutput::new(json!({ "search_results": hits })))
    }
}
