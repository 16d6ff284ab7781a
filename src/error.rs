//! Error types for the statement orchestrator

use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[derive(Error, Debug)]
pub enum OrchestrationError {

    // =============================
    // Tooling
    // =============================

    #[error("Tool error: {0}")]
    ToolError(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid tool input: {0}")]
    InvalidToolInput(String),

    #[error("Extraction error: {0}")]
    ExtractionError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Search error: {0}")]
    SearchError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    // =============================
    // Reference store
    // =============================

    #[error("Reference not found or expired: {0}")]
    ReferenceNotFound(String),

    #[error("Reference {key} does not hold a {expected}")]
    ReferenceTypeMismatch { key: String, expected: &'static str },

    // =============================
    // Control plane
    // =============================

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Routing contract violated: {0}")]
    RoutingContract(String),

    #[error("Max supervisor hops exceeded: {0}")]
    MaxHopsExceeded(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("SQL error: {0}")]
    SqlError(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
