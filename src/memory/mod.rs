//! Agent memory
//!
//! Conversation messages and cross-turn history, plus the reference store
//! used to hand large artifacts between tools.

pub mod refs;
pub mod store;

pub use refs::{RefKey, ReferenceStore};
pub use store::{ConversationHistory, Message, MessageRole};
