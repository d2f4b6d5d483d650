//! Execution engine for tool invocations
//!
//! Turns one reasoner decision into one observation. The LLM is never
//! consulted here.

use crate::error::AssistantError;
use crate::models::{ExecutionStatus, Observation, ToolInput};
use crate::tools::{error_output, ToolRegistry};
use chrono::Utc;
use serde_json::json;
use std::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Executes tool calls against the registry
pub struct ExecutionEngine {
    tool_registry: ToolRegistry,
}

impl ExecutionEngine {
    pub fn new(tool_registry: ToolRegistry) -> Self {
        Self { tool_registry }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.tool_registry
    }

    /// Invoke `tool_name` with `payload`. Never fails: problems become
    /// `Failed` (retryable) or `Aborted` (stop the turn) observations.
    pub async fn invoke(&self, tool_name: &str, payload: &str) -> Observation {
        let start = Instant::now();
        debug!(tool_name, payload_len = payload.len(), "Invoking tool");

        let tool_input = ToolInput {
            tool_name: tool_name.to_string(),
            payload: payload.to_string(),
        };

        let (status, output) = match self.tool_registry.get(tool_name) {
            Some(tool) => match tool.execute(&tool_input).await {
                Ok(output) if output.success => (ExecutionStatus::Success, output.data),
                Ok(output) => (ExecutionStatus::Failed, output.data),
                Err(e) => {
                    error!(tool_name, error = %e, "Tool failed irrecoverably");
                    (
                        ExecutionStatus::Aborted,
                        json!({"error": e.to_string(), "kind": e.kind()}),
                    )
                }
            },
            None => {
                warn!(tool_name, "Tool not registered");
                let err = AssistantError::ToolNotFound(format!(
                    "{} (available: {})",
                    tool_name,
                    self.tool_registry.list().join(", ")
                ));
                (ExecutionStatus::Failed, error_output(&err).data)
            }
        };

        Observation {
            observation_id: Uuid::new_v4(),
            tool_name: tool_name.to_string(),
            payload: payload.to_string(),
            output,
            status,
            execution_time_ms: start.elapsed().as_millis() as u64,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::QueryExecutor;
    use crate::store::{DocumentStore, InMemoryStore};
    use crate::tools::{create_default_registry, AGGREGATE_TOOL, LOOKUP_TOOL};
    use std::sync::Arc;
    use std::time::Duration;

    fn engine() -> (ExecutionEngine, Arc<InMemoryStore>) {
        let docs = vec![serde_json::from_value(json!({"Fiscal Year": "2013-2014", "Total Price": 5.0}))
            .unwrap()];
        let store = Arc::new(InMemoryStore::from_documents("purchase_orders", docs));
        let executor = Arc::new(QueryExecutor::new(store.clone(), Duration::from_secs(5)));
        (
            ExecutionEngine::new(create_default_registry(executor, 100, 10)),
            store,
        )
    }

    #[tokio::test]
    async fn test_successful_invocation() {
        let (engine, _) = engine();
        let observation = engine
            .invoke(LOOKUP_TOOL, r#"{"query": {"Fiscal Year": "2013-2014"}}"#)
            .await;
        assert_eq!(observation.status, ExecutionStatus::Success);
        assert_eq!(observation.output["count"], json!(1));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_recoverable() {
        let (engine, _) = engine();
        let observation = engine.invoke("drop_collection", "{}").await;
        assert_eq!(observation.status, ExecutionStatus::Failed);
        assert_eq!(observation.output["kind"], json!("tool_not_found"));
    }

    #[tokio::test]
    async fn test_connection_loss_aborts() {
        let (engine, store) = engine();
        store.close().await.unwrap();
        let observation = engine
            .invoke(AGGREGATE_TOOL, r#"[{"$count": "n"}]"#)
            .await;
        assert_eq!(observation.status, ExecutionStatus::Aborted);
        assert_eq!(observation.output["kind"], json!("connection"));
    }
}
