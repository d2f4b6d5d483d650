//! California Procurement Assistant
//!
//! Answers natural-language questions about state purchase orders by:
//! - Translating each question into a lookup or aggregation query
//! - Validating queries against schema hard rules before they run
//! - Executing them against a shared document store with row caps
//! - Feeding structured results (or errors) back to the reasoning step
//! - Formatting money consistently in the final answer
//!
//! REASONING LOOP:
//! QUESTION → DECIDE → INVOKE → OBSERVE → DECIDE? → ANSWER

pub mod agent;
pub mod api;
pub mod classifier;
pub mod config;
pub mod error;
pub mod execution;
pub mod executor;
pub mod explorer;
pub mod format;
pub mod llm;
pub mod memory;
pub mod models;
pub mod pipelines;
pub mod reasoner;
pub mod schema;
pub mod store;
pub mod tools;
pub mod verification;

pub use error::{AssistantError, Result};

// Re-export common types
pub use agent::{AssistantCore, ProcurementAssistant, ReasoningLoop, QUICK_QUESTIONS};
pub use classifier::QueryClassifier;
pub use config::AppConfig;
pub use models::*;
