//! Statement persistence
//!
//! `StatementStore` is the boundary the persistence tools write through.
//! Two backends: an in-process store (default when no database URL is
//! configured, and the one tests use) and Postgres via sqlx.
//!
//! Transaction policy:
//! - `insert_statement` is atomic per statement: the statement row and all
//!   of its transactions commit together or not at all.
//! - `update_categories` is atomic per batch: an unknown id rolls back
//!   every update in the call.

use crate::config::Settings;
use crate::error::OrchestrationError;
use crate::models::{BankStatement, StoredTransaction, TransactionClassification, TransactionFilter};
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub mod postgres;
pub use postgres::PgStatementStore;

#[async_trait]
pub trait StatementStore: Send + Sync {
    /// Insert one statement with its transactions in a single transaction.
    /// Returns the generated statement id.
    async fn insert_statement(&self, statement: &BankStatement) -> Result<i64>;

    /// Read transactions matching `filter`, ordered by date then id.
    async fn read_transactions(&self, filter: &TransactionFilter) -> Result<Vec<StoredTransaction>>;

    /// Apply every classification or none of them. Returns rows updated.
    async fn update_categories(&self, updates: &[TransactionClassification]) -> Result<usize>;

    /// Release pooled connections.
    async fn close(&self);
}

/// Pick the backend from settings: Postgres when a URL is configured.
pub fn connect(settings: &Settings) -> Result<Arc<dyn StatementStore>> {
    match &settings.database_url {
        Some(url) => {
            info!("Using Postgres statement store");
            Ok(Arc::new(PgStatementStore::connect_lazy(url)?))
        }
        None => {
            warn!("DATABASE_URL not set, statements are kept in memory for this process only");
            Ok(Arc::new(InMemoryStatementStore::new()))
        }
    }
}

//
// ================= In-memory backend =================
//

#[derive(Default)]
struct Tables {
    statements: Vec<(i64, BankStatement)>,
    transactions: Vec<StoredTransaction>,
    tax: HashMap<i64, (Option<bool>, Option<String>)>,
    next_statement_id: i64,
    next_transaction_id: i64,
}

/// Process-local store. Ids start at 1 and increase monotonically.
pub struct InMemoryStatementStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryStatementStore {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(RwLock::new(Tables {
                next_statement_id: 1,
                next_transaction_id: 1,
                ..Tables::default()
            })),
        }
    }

    pub async fn statement_count(&self) -> usize {
        self.tables.read().await.statements.len()
    }

    pub async fn transaction_count(&self) -> usize {
        self.tables.read().await.transactions.len()
    }

    /// Tax-deductibility fields recorded for a transaction, if any.
    pub async fn deductibility(&self, transaction_id: i64) -> Option<(Option<bool>, Option<String>)> {
        self.tables.read().await.tax.get(&transaction_id).cloned()
    }
}

impl Default for InMemoryStatementStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StatementStore for InMemoryStatementStore {
    async fn insert_statement(&self, statement: &BankStatement) -> Result<i64> {
        statement
            .validate()
            .map_err(|e| OrchestrationError::DatabaseError(format!("Rejected statement: {}", e)))?;

        let mut tables = self.tables.write().await;
        let statement_id = tables.next_statement_id;
        tables.next_statement_id += 1;

        for tx in &statement.transactions {
            let transaction_id = tables.next_transaction_id;
            tables.next_transaction_id += 1;
            tables.transactions.push(StoredTransaction {
                transaction_id,
                statement_id,
                transaction_date: tx.transaction_date,
                description: tx.transaction_details.clone(),
                amount: tx.amount,
                category: None,
            });
        }
        tables.statements.push((statement_id, statement.clone()));

        debug!(
            statement_id,
            transactions = statement.transactions.len(),
            "Committed statement (in-memory)"
        );
        Ok(statement_id)
    }

    async fn read_transactions(&self, filter: &TransactionFilter) -> Result<Vec<StoredTransaction>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<StoredTransaction> = tables
            .transactions
            .iter()
            .filter(|tx| filter.matches(tx))
            .cloned()
            .collect();
        rows.sort_by_key(|tx| (tx.transaction_date, tx.transaction_id));
        Ok(rows)
    }

    async fn update_categories(&self, updates: &[TransactionClassification]) -> Result<usize> {
        if updates.is_empty() {
            return Ok(0);
        }

        let mut tables = self.tables.write().await;

        // validate the whole batch before touching anything
        let index: HashMap<i64, usize> = tables
            .transactions
            .iter()
            .enumerate()
            .map(|(i, tx)| (tx.transaction_id, i))
            .collect();
        if let Some(missing) = updates.iter().find(|u| !index.contains_key(&u.transaction_id)) {
            warn!(transaction_id = missing.transaction_id, "Rolling back category batch");
            return Err(OrchestrationError::DatabaseError(format!(
                "Unknown transaction id {}; no categories were updated",
                missing.transaction_id
            )));
        }

        for update in updates {
            let i = index[&update.transaction_id];
            tables.transactions[i].category = Some(update.category.clone());
            tables.tax.insert(
                update.transaction_id,
                (update.tax_deductible, update.deduction_reason.clone()),
            );
        }

        debug!(updated = updates.len(), "Committed category batch (in-memory)");
        Ok(updates.len())
    }

    async fn close(&self) {}
}
