//! Persistence tools
//!
//! `write_all_statements` commits per record: each statement is its own
//! transaction, so a failure at record k leaves records 1..k-1 in place and
//! skips the rest. `update_transaction_classification` commits the whole
//! batch or nothing.

use crate::db::StatementStore;
use crate::error::OrchestrationError;
use crate::models::{BankStatement, StoredTransaction, ToolInput, TransactionClassification, TransactionFilter};
use crate::state::StatePatch;
use crate::tools::{optional_date, ref_list, single_ref, Tool, ToolContext, ToolOutput};
use crate::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

pub struct WriteAllStatementsTool {
    store: Arc<dyn StatementStore>,
}

impl WriteAllStatementsTool {
    pub fn new(store: Arc<dyn StatementStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl Tool for WriteAllStatementsTool {
    fn name(&self) -> &'static str {
        "write_all_statements"
    }

    fn description(&self) -> &'static str {
        "Save parsed statements and their transactions to the database. Defaults to the \
         statement_refs from the last parse."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "OBJECT",
            "properties": {
                "statement_refs": {
                    "type": "ARRAY",
                    "items": { "type": "STRING" },
                    "description": "References returned by parse_all_statements"
                }
            }
        })
    }

    async fn execute(&self, input: &ToolInput, ctx: &ToolContext) -> Result<ToolOutput> {
        let statement_refs = ref_list(input, "statement_refs", &ctx.artifacts.statement_refs)?;
        let total = statement_refs.len();
        let mut transactions = 0usize;

        for (i, key) in statement_refs.iter().enumerate() {
            let written = async {
                let statement = ctx.refs.get::<BankStatement>(key).await?;
                self.store.insert_statement(&statement).await?;
                Ok::<usize, OrchestrationError>(statement.transactions.len())
            }
            .await;

            match written {
                Ok(n) => transactions += n,
                Err(e) => {
                    warn!(index = i + 1, total, committed = i, error = %e, "Statement write failed");
                    return Err(OrchestrationError::DatabaseError(format!(
                        "statement {} of {} failed ({} committed before it): {}",
                        i + 1,
                        total,
                        i,
                        e
                    )));
                }
            }
        }

        info!(statements = total, transactions, "Statements written");
        Ok(ToolOutput::new(json!({
            "statements_written": total,
            "transactions_written": transactions,
        })))
    }
}

pub struct ReadTransactionsTool {
    store: Arc<dyn StatementStore>,
}

impl ReadTransactionsTool {
    pub fn new(store: Arc<dyn StatementStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl Tool for ReadTransactionsTool {
    fn name(&self) -> &'static str {
        "read_transactions"
    }

    fn description(&self) -> &'static str {
        "Load stored transactions (optionally within a date range, or only uncategorized ones). \
         Returns a transactions_ref for classify_transactions."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "OBJECT",
            "properties": {
                "start_date": { "type": "STRING", "description": "YYYY-MM-DD, inclusive" },
                "end_date": { "type": "STRING", "description": "YYYY-MM-DD, inclusive" },
                "uncategorized_only": { "type": "BOOLEAN" }
            }
        })
    }

    async fn execute(&self, input: &ToolInput, ctx: &ToolContext) -> Result<ToolOutput> {
        let filter = TransactionFilter {
            start_date: optional_date(input, "start_date")?,
            end_date: optional_date(input, "end_date")?,
            uncategorized_only: input
                .parameters
                .get("uncategorized_only")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        };

        let rows: Vec<StoredTransaction> = self.store.read_transactions(&filter).await?;
        let count = rows.len();
        let key = ctx.refs.put(rows).await;

        info!(count, "Transactions loaded");
        Ok(ToolOutput::new(json!({
            "transactions_ref": key,
            "count": count,
        }))
        .with_patch(StatePatch {
            transactions_ref: Some(key),
            ..StatePatch::default()
        }))
    }
}

pub struct UpdateTransactionClassificationTool {
    store: Arc<dyn StatementStore>,
}

impl UpdateTransactionClassificationTool {
    pub fn new(store: Arc<dyn StatementStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl Tool for UpdateTransactionClassificationTool {
    fn name(&self) -> &'static str {
        "update_transaction_classification"
    }

    fn description(&self) -> &'static str {
        "Save transaction categories to the database in one batch. Defaults to the \
         classifications_ref from the last classification."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "OBJECT",
            "properties": {
                "classifications_ref": {
                    "type": "STRING",
                    "description": "Reference returned by classify_transactions"
                }
            }
        })
    }

    async fn execute(&self, input: &ToolInput, ctx: &ToolContext) -> Result<ToolOutput> {
        let key = single_ref(
            input,
            "classifications_ref",
            ctx.artifacts.classifications_ref.as_ref(),
        )?;
        let classifications = ctx.refs.get::<Vec<TransactionClassification>>(&key).await?;
        let updated = self.store.update_categories(&classifications).await?;

        info!(updated, "Transaction categories saved");
        Ok(ToolOutput::new(json!({ "updated": updated })))
    }
}
