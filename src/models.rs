//! Core data models: statements, transactions, classifications, tool I/O

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

//
// ================= Statements =================
//

/// A single transaction as parsed out of a statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementTransaction {
    pub transaction_date: NaiveDate,
    pub transaction_details: String,
    pub amount: f64,
}

/// Structured bank statement produced by the parsing collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BankStatement {
    pub account_holder: String,
    pub account_name: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub opening_balance: f64,
    pub closing_balance: f64,
    #[serde(default)]
    pub credit_limit: f64,
    #[serde(default)]
    pub interest_charged: f64,
    pub transactions: Vec<StatementTransaction>,
}

impl BankStatement {
    /// Schema-level checks the model output cannot express on its own.
    pub fn validate(&self) -> Result<(), String> {
        if self.account_name.trim().is_empty() {
            return Err("account_name is empty".to_string());
        }
        if self.start_date > self.end_date {
            return Err(format!(
                "statement period is inverted ({} > {})",
                self.start_date, self.end_date
            ));
        }
        for (i, tx) in self.transactions.iter().enumerate() {
            if tx.transaction_details.trim().is_empty() {
                return Err(format!("transaction {} has no description", i + 1));
            }
            if !tx.amount.is_finite() {
                return Err(format!("transaction {} has a non-finite amount", i + 1));
            }
        }
        Ok(())
    }
}

//
// ================= Persisted transactions =================
//

/// A transaction row as read back from persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTransaction {
    pub transaction_id: i64,
    pub statement_id: i64,
    pub transaction_date: NaiveDate,
    pub description: String,
    pub amount: f64,
    pub category: Option<String>,
}

/// Filter for reading transactions back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionFilter {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub uncategorized_only: bool,
}

impl TransactionFilter {
    pub fn matches(&self, tx: &StoredTransaction) -> bool {
        self.start_date.map_or(true, |d| tx.transaction_date >= d)
            && self.end_date.map_or(true, |d| tx.transaction_date <= d)
            && (!self.uncategorized_only || tx.category.is_none())
    }
}

//
// ================= Classification =================
//

/// Input item for the classification collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationRequest {
    pub transaction_id: i64,
    pub description: String,
}

impl From<&StoredTransaction> for ClassificationRequest {
    fn from(tx: &StoredTransaction) -> Self {
        Self {
            transaction_id: tx.transaction_id,
            description: tx.description.clone(),
        }
    }
}

/// One classified transaction. Callers match by id, never by position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionClassification {
    pub transaction_id: i64,
    pub category: String,
    #[serde(default)]
    pub tax_deductible: Option<bool>,
    #[serde(default)]
    pub deduction_reason: Option<String>,
}

//
// ================= Search =================
//

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub snippet: String,
    pub url: String,
}

//
// ================= Tool I/O =================
//

/// A single tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// What a model is told about a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInput {
    pub tool_name: String,
    pub parameters: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn statement() -> BankStatement {
        BankStatement {
            account_holder: "A. Holder".into(),
            account_name: "Everyday".into(),
            start_date: date("2025-04-01"),
            end_date: date("2025-04-30"),
            opening_balance: 2000.0,
            closing_balance: 4000.0,
            credit_limit: 0.0,
            interest_charged: 0.0,
            transactions: vec![StatementTransaction {
                transaction_date: date("2025-04-01"),
                transaction_details: "Tango Energy".into(),
                amount: 45.0,
            }],
        }
    }

    #[test]
    fn test_statement_deserializes_from_model_json() {
        let raw = serde_json::json!({
            "account_holder": "A. Holder",
            "account_name": "Everyday",
            "start_date": "2025-04-01",
            "end_date": "2025-04-30",
            "opening_balance": 2000,
            "closing_balance": 4000,
            "transactions": [
                {"transaction_date": "2025-04-01", "transaction_details": "Tango Energy", "amount": 45}
            ]
        });
        let parsed: BankStatement = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed, statement());
    }

    #[test]
    fn test_validate_rejects_inverted_period() {
        let mut s = statement();
        s.end_date = date("2025-03-01");
        assert!(s.validate().is_err());
        assert!(statement().validate().is_ok());
    }

    #[test]
    fn test_filter_bounds_and_category() {
        let tx = StoredTransaction {
            transaction_id: 1,
            statement_id: 1,
            transaction_date: date("2025-04-10"),
            description: "Uber Eats".into(),
            amount: 34.0,
            category: Some("Dining".into()),
        };
        let mut filter = TransactionFilter {
            start_date: Some(date("2025-04-01")),
            end_date: Some(date("2025-04-30")),
            uncategorized_only: false,
        };
        assert!(filter.matches(&tx));
        filter.uncategorized_only = true;
        assert!(!filter.matches(&tx));
        filter.uncategorized_only = false;
        filter.end_date = Some(date("2025-04-09"));
        assert!(!filter.matches(&tx));
    }
}
