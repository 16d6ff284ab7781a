//! Finnie: a personal-finance agent orchestrator
//!
//! A supervisor routes each user turn to one of a closed set of workers:
//! - Scribe extracts, parses, stores and categorises bank statements
//! - Sage answers questions over the stored transactions
//! - Fallback handles everything else
//!
//! Workers drive an LLM through tool calls. Large artifacts travel between
//! tools as keys into a TTL reference store, and a tool failure becomes a
//! sticky fatal flag on the task rather than an error.
//!
//! GRAPH:
//! SUPERVISOR → WORKER ⇄ TOOLS → SUPERVISOR → ... → FINISH

pub mod agent;
pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod extraction;
pub mod llm;
pub mod memory;
pub mod models;
pub mod search;
pub mod session;
pub mod state;
pub mod tools;

pub use error::Result;

// Re-export common types
pub use agent::{Orchestrator, ProgressSink, TaskOutcome};
pub use models::*;
