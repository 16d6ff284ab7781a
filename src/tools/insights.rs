//! `summarize_spending`

use crate::db::StatementStore;
use crate::models::{ToolInput, TransactionFilter};
use crate::tools::{optional_date, Tool, ToolContext, ToolOutput};
use crate::Result;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

const UNCATEGORIZED: &str = "Uncategorized";

#[derive(Debug, Serialize, PartialEq)]
struct CategoryTotal {
    category: String,
    total: f64,
    count: usize,
}

/// Category totals over stored transactions.
pub struct SummarizeSpendingTool {
    store: Arc<dyn StatementStore>,
}

impl SummarizeSpendingTool {
    pub fn new(store: Arc<dyn StatementStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl Tool for SummarizeSpendingTool {
    fn name(&self) -> &'static str {
        "summarize_spending"
    }

    fn description(&self) -> &'static str {
        "Total spending per category for stored transactions, optionally within a date range."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "OBJECT",
            "properties": {
                "start_date": { "type": "STRING", "description": "YYYY-MM-DD, inclusive" },
                "end_date": { "type": "STRING", "description": "YYYY-MM-DD, inclusive" }
            }
        })
    }

    async fn execute(&self, input: &ToolInput, _ctx: &ToolContext) -> Result<ToolOutput> {
        let filter = TransactionFilter {
            start_date: optional_date(input, "start_date")?,
            end_date: optional_date(input, "end_date")?,
            uncategorized_only: false,
        };
        let rows = self.store.read_transactions(&filter).await?;

        let mut totals: BTreeMap<String, (f64, usize)> = BTreeMap::new();
        for row in &rows {
            let key = row.category.clone().unwrap_or_else(|| UNCATEGORIZED.to_string());
            let entry = totals.entry(key).or_insert((0.0, 0));
            entry.0 += row.amount;
            entry.1 += 1;
        }

        let mut categories: Vec<CategoryTotal> = totals
            .into_iter()
            .map(|(category, (total, count))| CategoryTotal {
                category,
                total: (total * 100.0).round() / 100.0,
                count,
            })
            .collect();
        categories.sort_by(|a, b| b.total.total_cmp(&a.total).then_with(|| a.category.cmp(&b.category)));

        let grand_total: f64 = rows.iter().map(|r| r.amount).sum();
        debug!(transactions = rows.len(), categories = categories.len(), "Spending summarised");

        Ok(ToolOutput::new(json!({
            "start_date": filter.start_date,
            "end_date": filter.end_date,
            "transaction_count": rows.len(),
            "total": (grand_total * 100.0).round() / 100.0,
            "categories": categories,
        })))
    }
}
