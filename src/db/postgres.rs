//! Postgres statement store (sqlx)

use crate::db::StatementStore;
use crate::error::OrchestrationError;
use crate::models::{BankStatement, StoredTransaction, TransactionClassification, TransactionFilter};
use crate::Result;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

pub struct PgStatementStore {
    pool: PgPool,
    schema_ready: OnceCell<()>,
}

impl PgStatementStore {
    /// Build a pool without connecting; the first query connects.
    pub fn connect_lazy(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect_lazy(database_url)
            .map_err(|e| {
                OrchestrationError::DatabaseError(format!("Invalid database URL: {}", e))
            })?;

        Ok(Self {
            pool,
            schema_ready: OnceCell::new(),
        })
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS statements (
                      statement_id BIGSERIAL PRIMARY KEY,
                      account_holder TEXT NOT NULL,
                      account_name TEXT NOT NULL,
                      start_date DATE NOT NULL,
                      end_date DATE NOT NULL,
                      opening_balance DOUBLE PRECISION NOT NULL,
                      closing_balance DOUBLE PRECISION NOT NULL,
                      credit_limit DOUBLE PRECISION NOT NULL DEFAULT 0,
                      interest_charged DOUBLE PRECISION NOT NULL DEFAULT 0,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS transactions (
                      transaction_id BIGSERIAL PRIMARY KEY,
                      statement_id BIGINT NOT NULL REFERENCES statements(statement_id) ON DELETE CASCADE,
                      transaction_date DATE NOT NULL,
                      description TEXT NOT NULL,
                      amount DOUBLE PRECISION NOT NULL,
                      category TEXT,
                      tax_deductible BOOLEAN,
                      deduction_reason TEXT
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE INDEX IF NOT EXISTS idx_transactions_date
                    ON transactions (transaction_date, transaction_id);
                    "#,
                )
                .execute(&self.pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                OrchestrationError::DatabaseError(format!(
                    "Failed to initialize statement schema: {}",
                    e
                ))
            })?;

        Ok(())
    }
}

#[async_trait]
impl StatementStore for PgStatementStore {
    async fn insert_statement(&self, statement: &BankStatement) -> Result<i64> {
        statement
            .validate()
            .map_err(|e| OrchestrationError::DatabaseError(format!("Rejected statement: {}", e)))?;
        self.ensure_schema().await?;

        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            INSERT INTO statements
              (account_holder, account_name, start_date, end_date,
               opening_balance, closing_balance, credit_limit, interest_charged)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING statement_id
            "#,
        )
        .bind(&statement.account_holder)
        .bind(&statement.account_name)
        .bind(statement.start_date)
        .bind(statement.end_date)
        .bind(statement.opening_balance)
        .bind(statement.closing_balance)
        .bind(statement.credit_limit)
        .bind(statement.interest_charged)
        .fetch_one(&mut *tx)
        .await?;
        let statement_id: i64 = row.try_get("statement_id")?;

        for item in &statement.transactions {
            sqlx::query(
                r#"
                INSERT INTO transactions (statement_id, transaction_date, description, amount)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(statement_id)
            .bind(item.transaction_date)
            .bind(&item.transaction_details)
            .bind(item.amount)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        info!(
            statement_id,
            transactions = statement.transactions.len(),
            "Committed statement"
        );
        Ok(statement_id)
    }

    async fn read_transactions(&self, filter: &TransactionFilter) -> Result<Vec<StoredTransaction>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(
            r#"
            SELECT transaction_id, statement_id, transaction_date, description, amount, category
            FROM transactions
            WHERE ($1::date IS NULL OR transaction_date >= $1)
              AND ($2::date IS NULL OR transaction_date <= $2)
              AND (NOT $3 OR category IS NULL)
            ORDER BY transaction_date ASC, transaction_id ASC
            "#,
        )
        .bind(filter.start_date)
        .bind(filter.end_date)
        .bind(filter.uncategorized_only)
        .fetch_all(&self.pool)
        .await?;

        let transactions = rows
            .iter()
            .map(|row| {
                Ok(StoredTransaction {
                    transaction_id: row.try_get("transaction_id")?,
                    statement_id: row.try_get("statement_id")?,
                    transaction_date: row.try_get("transaction_date")?,
                    description: row.try_get("description")?,
                    amount: row.try_get("amount")?,
                    category: row.try_get("category")?,
                })
            })
            .collect::<std::result::Result<Vec<_>, sqlx::Error>>()?;

        debug!(count = transactions.len(), "Read transactions");
        Ok(transactions)
    }

    async fn update_categories(&self, updates: &[TransactionClassification]) -> Result<usize> {
        if updates.is_empty() {
            return Ok(0);
        }
        self.ensure_schema().await?;

        let mut tx = self.pool.begin().await?;

        for update in updates {
            let result = sqlx::query(
                r#"
                UPDATE transactions
                SET category = $2, tax_deductible = $3, deduction_reason = $4
                WHERE transaction_id = $1
                "#,
            )
            .bind(update.transaction_id)
            .bind(&update.category)
            .bind(update.tax_deductible)
            .bind(&update.deduction_reason)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                tx.rollback().await?;
                warn!(transaction_id = update.transaction_id, "Rolled back category batch");
                return Err(OrchestrationError::DatabaseError(format!(
                    "Unknown transaction id {}; no categories were updated",
                    update.transaction_id
                )));
            }
        }

        tx.commit().await?;
        info!(updated = updates.len(), "Committed category batch");
        Ok(updates.len())
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("Closed Postgres pool");
    }
}
