//! `classify_transactions`
//!
//! Categorises transactions in chunks. Each chunk gathers web context for
//! its items concurrently, then makes one structured model call whose
//! results are matched back by transaction id.

use crate::config::Pacing;
use crate::error::OrchestrationError;
use crate::llm::ChatModel;
use crate::memory::Message;
use crate::models::{ClassificationRequest, StoredTransaction, ToolInput, TransactionClassification};
use crate::search::{SearchProvider, DEFAULT_MAX_RESULTS};
use crate::state::StatePatch;
use crate::tools::{single_ref, Tool, ToolContext, ToolOutput};
use crate::Result;
use futures_util::future::join_all;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

const CLASSIFIER_PROMPT: &str = "You categorise personal bank transactions. Pick one category \
per transaction from: Groceries, Transport, Utilities, Insurance, Entertainment, \
Subscriptions, Healthcare, Dining, Vet, Income, Transfer, Unknown. Use the web context to \
identify merchants. Say whether the expense is likely tax deductible and why. Return exactly \
one result per transaction_id.";

pub fn classification_schema() -> Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "classifications": {
                "type": "ARRAY",
                "items": {
                    "type": "OBJECT",
                    "properties": {
                        "transaction_id": { "type": "INTEGER" },
                        "category": { "type": "STRING" },
                        "tax_deductible": { "type": "BOOLEAN" },
                        "deduction_reason": { "type": "STRING" }
                    },
                    "required": ["transaction_id", "category"]
                }
            }
        },
        "required": ["classifications"]
    })
}

#[derive(Deserialize)]
struct ClassifierReply {
    classifications: Vec<TransactionClassification>,
}

/// Classify stored transactions in chunks: concurrent web lookups per
/// chunk, one structured model call per chunk, a fixed delay between chunks.
pub struct ClassifyTransactionsTool {
    classifier: Arc<dyn ChatModel>,
    search: Arc<dyn SearchProvider>,
    pacing: Pacing,
}

impl ClassifyTransactionsTool {
    pub fn new(classifier: Arc<dyn ChatModel>, search: Arc<dyn SearchProvider>, pacing: Pacing) -> Self {
        Self {
            classifier,
            search,
            pacing,
        }
    }

    /// Web context per item. Lookups are best effort: a failed search only
    /// leaves that item without context.
    async fn web_context(&self, items: &[ClassificationRequest]) -> Vec<String> {
        let lookups = items.iter().map(|item| async move {
            match self.search.search(&item.description, DEFAULT_MAX_RESULTS).await {
                Ok(hits) => hits
                    .iter()
                    .map(|h| format!("- {}: {}", h.title, h.snippet))
                    .collect::<Vec<_>>()
                    .join("\n"),
                Err(e) => {
                    warn!(transaction_id = item.transaction_id, error = %e, "Web lookup failed");
                    String::new()
                }
            }
        });
        join_all(lookups).await
    }

    async fn classify_chunk(&self, items: &[ClassificationRequest]) -> Result<Vec<TransactionClassification>> {
        let context = self.web_context(items).await;

        let mut prompt = String::from("Classify these transactions.\n");
        for (item, ctx) in items.iter().zip(&context) {
            prompt.push_str(&format!(
                "---\ntransaction_id: {}\ndescription: {}\nweb context:\n{}\n",
                item.transaction_id,
                item.description,
                if ctx.is_empty() { "(none)" } else { ctx.as_str() }
            ));
        }

        let reply = self
            .classifier
            .structured(CLASSIFIER_PROMPT, &[Message::user(prompt)], &classification_schema())
            .await?;
        let reply: ClassifierReply = serde_json::from_value(reply).map_err(|e| {
            OrchestrationError::ToolError(format!("classifier output does not match schema: {}", e))
        })?;

        match_by_id(items, reply.classifications)
    }
}

/// Require exactly one classification per requested id; order follows `items`.
fn match_by_id(
    items: &[ClassificationRequest],
    results: Vec<TransactionClassification>,
) -> Result<Vec<TransactionClassification>> {
    let requested: HashSet<i64> = items.iter().map(|i| i.transaction_id).collect();
    let mut by_id: BTreeMap<i64, TransactionClassification> = BTreeMap::new();

    for result in results {
        if !requested.contains(&result.transaction_id) {
            return Err(OrchestrationError::ToolError(format!(
                "classifier returned unknown transaction_id {}",
                result.transaction_id
            )));
        }
        let id = result.transaction_id;
        if by_id.insert(id, result).is_some() {
            return Err(OrchestrationError::ToolError(format!(
                "classifier returned transaction_id {} more than once",
                id
            )));
        }
    }

    items
        .iter()
        .map(|item| {
            by_id.remove(&item.transaction_id).ok_or_else(|| {
                OrchestrationError::ToolError(format!(
                    "classifier returned no result for transaction_id {}",
                    item.transaction_id
                ))
            })
        })
        .collect()
}

#[async_trait::async_trait]
impl Tool for ClassifyTransactionsTool {
    fn name(&self) -> &'static str {
        "classify_transactions"
    }

    fn description(&self) -> &'static str {
        "Categorise transactions (with web lookups for merchant context). Defaults to the \
         transactions_ref from the last read_transactions. Returns classifications_ref."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "OBJECT",
            "properties": {
                "transactions_ref": {
                    "type": "STRING",
                    "description": "Reference returned by read_transactions"
                }
            }
        })
    }

    async fn execute(&self, input: &ToolInput, ctx: &ToolContext) -> Result<ToolOutput> {
        let key = single_ref(input, "transactions_ref", ctx.artifacts.transactions_ref.as_ref())?;
        let transactions = ctx.refs.get::<Vec<StoredTransaction>>(&key).await?;
        let items: Vec<ClassificationRequest> = transactions.iter().map(ClassificationRequest::from).collect();

        let mut classified = Vec::with_capacity(items.len());
        let chunks: Vec<&[ClassificationRequest]> = items.chunks(self.pacing.classify_batch_size.max(1)).collect();

        for (i, chunk) in chunks.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.pacing.batch_delay).await;
            }
            let results = self.classify_chunk(chunk).await?;
            debug!(chunk = i + 1, chunks = chunks.len(), items = chunk.len(), "Classified chunk");
            classified.extend(results);
        }

        let mut categories: BTreeMap<&str, usize> = BTreeMap::new();
        for c in &classified {
            *categories.entry(c.category.as_str()).or_default() += 1;
        }
        let mut payload = json!({ "count": classified.len(), "categories": categories });

        info!(count = classified.len(), "Transactions classified");
        let class_key = ctx.refs.put(classified).await;

        payload["classifications_ref"] = json!(class_key);
        Ok(ToolOutput::new(payload).with_patch(StatePatch {
            classifications_ref: Some(class_key),
            ..StatePatch::default()
        }))
    }
}
