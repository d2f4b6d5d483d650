//! Reasoner trait and implementations
//!
//! A reasoner looks at the question, the schema, recent history and the
//! observations gathered so far this turn, and decides the next step:
//! call a tool or answer.

use crate::memory::Turn;
use crate::models::Observation;
use crate::schema::SchemaDescriptor;
use crate::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

pub mod gemini;
pub mod intent;

pub use gemini::{parse_decision, GeminiReasoner};
pub use intent::{Intent, IntentReasoner};

/// Next step chosen by the reasoner
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Invoke { tool: String, payload: String },
    Answer(String),
}

impl Decision {
    pub fn invoke(tool: impl Into<String>, payload: impl Into<String>) -> Self {
        Decision::Invoke {
            tool: tool.into(),
            payload: payload.into(),
        }
    }
}

/// Everything visible to one reasoning step
pub struct ReasoningContext<'a> {
    pub question: &'a str,
    pub schema: &'a SchemaDescriptor,
    /// Prior turns, oldest first, excluding the current question
    pub history: &'a [Turn],
    /// Tool results from this turn, in call order
    pub observations: &'a [Observation],
    /// False once the tool budget is spent
    pub tools_allowed: bool,
    pub tool_catalog: Vec<(&'static str, &'static str)>,
}

impl ReasoningContext<'_> {
    pub fn last_success(&self) -> Option<&Observation> {
        self.observations.iter().rev().find(|o| o.is_success())
    }
}

/// Trait for next-step selection (LLM controlled in production)
#[async_trait]
pub trait Reasoner: Send + Sync {
    async fn decide(&self, ctx: &ReasoningContext<'_>) -> Result<Decision>;
}

/// Replays a fixed script of decisions. Used in tests and demos.
pub struct ScriptedReasoner {
    script: Mutex<VecDeque<Decision>>,
    fallback: Option<Decision>,
}

impl ScriptedReasoner {
    pub fn new(script: Vec<Decision>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: None,
        }
    }

    /// Once the script runs out, keep returning `decision`.
    pub fn repeating(decision: Decision) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Some(decision),
        }
    }
}

#[async_trait]
impl Reasoner for ScriptedReasoner {
    async fn decide(&self, _ctx: &ReasoningContext<'_>) -> Result<Decision> {
        let next = self
            .script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();
        Ok(next
            .or_else(|| self.fallback.clone())
            .unwrap_or_else(|| Decision::Answer("I don't have anything more to add.".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(schema: &SchemaDescriptor) -> ReasoningContext<'_> {
        ReasoningContext {
            question: "q",
            schema,
            history: &[],
            observations: &[],
            tools_allowed: true,
            tool_catalog: vec![],
        }
    }

    #[tokio::test]
    async fn test_script_then_fallback() {
        let schema = SchemaDescriptor::purchase_orders("purchase_orders");
        let reasoner = ScriptedReasoner::new(vec![Decision::invoke("run_lookup", "{}")]);

        let first = reasoner.decide(&context(&schema)).await.unwrap();
        assert_eq!(first, Decision::invoke("run_lookup", "{}"));

        let second = reasoner.decide(&context(&schema)).await.unwrap();
        assert!(matches!(second, Decision::Answer(_)));
    }

    #[tokio::test]
    async fn test_repeating() {
        let schema = SchemaDescriptor::purchase_orders("purchase_orders");
        let reasoner = ScriptedReasoner::repeating(Decision::invoke("run_aggregation", "[]"));
        for _ in 0..5 {
            let decision = reasoner.decide(&context(&schema)).await.unwrap();
            assert_eq!(decision, Decision::invoke("run_aggregation", "[]"));
        }
    }
}
