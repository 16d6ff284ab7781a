//! `parse_all_statements`: extracted text to validated bank statements, one unit at a time

use crate::config::Pacing;
use crate::error::OrchestrationError;
use crate::extraction::ExtractedText;
use crate::llm::ChatModel;
use crate::memory::Message;
use crate::models::{BankStatement, ToolInput};
use crate::state::StatePatch;
use crate::tools::{ref_list, Tool, ToolContext, ToolOutput};
use crate::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

const PARSER_PROMPT: &str = "You convert raw bank statement text into structured data. \
Dates are YYYY-MM-DD. Use 0 for credit_limit and interest_charged when the statement \
does not show them. List every transaction in statement order.";

/// Response schema for one parsed statement.
pub fn statement_schema() -> Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "account_holder": { "type": "STRING" },
            "account_name": { "type": "STRING" },
            "start_date": { "type": "STRING", "description": "YYYY-MM-DD" },
            "end_date": { "type": "STRING", "description": "YYYY-MM-DD" },
            "opening_balance": { "type": "NUMBER" },
            "closing_balance": { "type": "NUMBER" },
            "credit_limit": { "type": "NUMBER" },
            "interest_charged": { "type": "NUMBER" },
            "transactions": {
                "type": "ARRAY",
                "items": {
                    "type": "OBJECT",
                    "properties": {
                        "transaction_date": { "type": "STRING", "description": "YYYY-MM-DD" },
                        "transaction_details": { "type": "STRING" },
                        "amount": { "type": "NUMBER" }
                    },
                    "required": ["transaction_date", "transaction_details", "amount"]
                }
            }
        },
        "required": [
            "account_holder", "account_name", "start_date", "end_date",
            "opening_balance", "closing_balance", "transactions"
        ]
    })
}

/// Parse extracted statement text into [`BankStatement`] records, one
/// unit at a time with a fixed delay between units.
pub struct ParseAllStatementsTool {
    parser: Arc<dyn ChatModel>,
    pacing: Pacing,
}

impl ParseAllStatementsTool {
    pub fn new(parser: Arc<dyn ChatModel>, pacing: Pacing) -> Self {
        Self { parser, pacing }
    }

    async fn parse_one(&self, unit: &ExtractedText) -> Result<BankStatement> {
        let prompt = format!(
            "Parse this bank statement text ({} part {}, period {}):\n{}",
            unit.file_name,
            unit.part,
            unit.period.format("%Y-%m"),
            unit.text
        );
        let reply = self
            .parser
            .structured(PARSER_PROMPT, &[Message::user(prompt)], &statement_schema())
            .await?;

        let statement: BankStatement = serde_json::from_value(reply).map_err(|e| {
            OrchestrationError::ParseError(format!("{}: output does not match schema: {}", unit.file_name, e))
        })?;
        statement
            .validate()
            .map_err(|e| OrchestrationError::ParseError(format!("{}: {}", unit.file_name, e)))?;
        Ok(statement)
    }
}

#[async_trait::async_trait]
impl Tool for ParseAllStatementsTool {
    fn name(&self) -> &'static str {
        "parse_all_statements"
    }

    fn description(&self) -> &'static str {
        "Parse extracted statement texts into structured statements. Defaults to the \
         text_refs from the last extraction. Returns statement_refs."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "OBJECT",
            "properties": {
                "text_refs": {
                    "type": "ARRAY",
                    "items": { "type": "STRING" },
                    "description": "References returned by extract_all_texts"
                }
            }
        })
    }

    async fn execute(&self, input: &ToolInput, ctx: &ToolContext) -> Result<ToolOutput> {
        let text_refs = ref_list(input, "text_refs", &ctx.artifacts.text_refs)?;
        if text_refs.is_empty() {
            return Err(OrchestrationError::InvalidToolInput(
                "no statement texts to parse; run extract_all_texts first".to_string(),
            ));
        }

        let total = text_refs.len();
        let mut statement_refs = Vec::with_capacity(total);
        let mut transactions = 0usize;

        for (i, key) in text_refs.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.pacing.batch_delay).await;
            }
            let unit = ctx.refs.get::<ExtractedText>(key).await?;
            let statement = self.parse_one(&unit).await?;
            info!(index = i + 1, total, file = %unit.file_name, "Parsed statement");

            transactions += statement.transactions.len();
            statement_refs.push(ctx.refs.put(statement).await);
        }

        Ok(ToolOutput::new(json!({
            "statement_refs": statement_refs,
            "count": statement_refs.len(),
            "transactions": transactions,
        }))
        .with_patch(StatePatch {
            statement_refs: Some(statement_refs),
            ..StatePatch::default()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CallKind, ScriptedModel};
    use crate::memory::{RefKey, ReferenceStore};
    use crate::state::{Artifacts, TaskContext};
    use chrono::NaiveDate;
    use std::time::Duration;

    fn unit(text: &str) -> ExtractedText {
        ExtractedText {
            file_name: "acme_2025-04.txt".into(),
            label: "acme".into(),
            period: NaiveDate::from_ymd_opt(2025, 4, 1).unwrap(),
            part: 1,
            text: text.into(),
        }
    }

    fn parsed(name: &str) -> Value {
        json!({
            "account_holder": "A. Holder",
            "account_name": name,
            "start_date": "2025-04-01",
            "end_date": "2025-04-30",
            "opening_balance": 2000,
            "closing_balance": 4000,
            "transactions": [
                {"transaction_date": "2025-04-01", "transaction_details": "Tango Energy", "amount": 45}
            ]
        })
    }

    async fn ctx_with(units: Vec<ExtractedText>) -> ToolContext {
        let refs = Arc::new(ReferenceStore::new(Duration::from_secs(60), 10));
        let mut keys = Vec::new();
        for u in units {
            keys.push(refs.put(u).await);
        }
        ToolContext {
            refs,
            task: TaskContext::default(),
            artifacts: Artifacts {
                text_refs: keys,
                ..Artifacts::default()
            },
        }
    }

    fn no_args() -> ToolInput {
        ToolInput {
            tool_name: "parse_all_statements".into(),
            parameters: json!({}),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_parses_each_unit_in_order() {
        let model = Arc::new(
            ScriptedModel::new()
                .then_structured(parsed("Everyday"))
                .then_structured(parsed("Credit Card")),
        );
        let tool = ParseAllStatementsTool::new(model.clone(), Pacing::default());
        let ctx = ctx_with(vec![unit("one"), unit("two")]).await;

        let output = tool.execute(&no_args(), &ctx).await.unwrap();
        let refs = output.patch.statement_refs.unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(output.payload["transactions"], 2);

        let second = ctx.refs.get::<BankStatement>(&refs[1]).await.unwrap();
        assert_eq!(second.account_name, "Credit Card");
        assert_eq!(model.call_count(CallKind::Structured).await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_record_fails_whole_call() {
        let mut bad = parsed("Everyday");
        bad["end_date"] = json!("2025-03-01");
        let model = Arc::new(ScriptedModel::new().then_structured(parsed("Everyday")).then_structured(bad));
        let tool = ParseAllStatementsTool::new(model, Pacing::default());
        let ctx = ctx_with(vec![unit("one"), unit("two")]).await;

        let err = tool.execute(&no_args(), &ctx).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::ParseError(_)));
    }

    #[tokio::test]
    async fn test_unknown_reference_is_an_error() {
        let tool = ParseAllStatementsTool::new(Arc::new(ScriptedModel::new()), Pacing::default());
        let ctx = ctx_with(vec![]).await;
        let input = ToolInput {
            tool_name: "parse_all_statements".into(),
            parameters: json!({"text_refs": ["missing"]}),
        };
        let err = tool.execute(&input, &ctx).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::ReferenceNotFound(ref k) if k == RefKey::from("missing").as_str()));
        assert!(tool.execute(&no_args(), &ctx).await.is_err());
    }
}
