//! Tool trait and registry
//!
//! The two query tools wrap the executor for the reasoning step. Payload
//! and query problems come back as structured `{"error": ...}` data so the
//! reasoner can correct itself; only connection failures escape as `Err`.

use crate::error::AssistantError;
use crate::executor::QueryExecutor;
use crate::models::{QueryMode, QueryOutcome, QueryRequest, ToolInput, ToolOutput};
use crate::Result;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub const AGGREGATE_TOOL: &str = "run_aggregation";
pub const LOOKUP_TOOL: &str = "run_lookup";

/// Trait for a single tool
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput>;
}

/// Tool registry for looking up and executing tools
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Registered names, sorted for stable prompts.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// `(name, description)` pairs, sorted by name.
    pub fn catalog(&self) -> Vec<(&'static str, &'static str)> {
        let mut entries: Vec<_> = self
            .tools
            .values()
            .map(|tool| (tool.name(), tool.description()))
            .collect();
        entries.sort_unstable_by_key(|(name, _)| *name);
        entries
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

const AGGREGATE_DESCRIPTION: &str = r#"Run an aggregation pipeline over the purchase orders.
Input: a JSON array of stages (or {"pipeline": [...]}).

Total spending by fiscal year (the $match on Total Price is mandatory before summing):
[
  {"$match": {"Total Price": {"$gt": 0, "$type": "number"}}},
  {"$group": {"_id": "$Fiscal Year", "total_spending": {"$sum": "$Total Price"}, "order_count": {"$sum": 1}}},
  {"$sort": {"total_spending": -1}}
]

Highest spending quarter (dates are text: convert with $dateFromString before $month):
[
  {"$match": {"Total Price": {"$gt": 0, "$type": "number"}}},
  {"$addFields": {"date_obj": {"$dateFromString": {"dateString": "$Creation Date"}}}},
  {"$addFields": {"month": {"$month": "$date_obj"}, "year": {"$year": "$date_obj"}}},
  {"$addFields": {"quarter": {"$switch": {"branches": [
    {"case": {"$in": ["$month", [7, 8, 9]]}, "then": "Q1"},
    {"case": {"$in": ["$month", [10, 11, 12]]}, "then": "Q2"},
    {"case": {"$in": ["$month", [1, 2, 3]]}, "then": "Q3"},
    {"case": {"$in": ["$month", [4, 5, 6]]}, "then": "Q4"}
  ], "default": "Unknown"}}}},
  {"$group": {"_id": {"year": "$year", "quarter": "$quarter"}, "total_spending": {"$sum": "$Total Price"}}},
  {"$sort": {"total_spending": -1}},
  {"$limit": 1}
]

Use for totals, averages, counts, grouping, rankings and trends."#;

const LOOKUP_DESCRIPTION: &str = r#"Find individual purchase-order records.
Input: a JSON object with a "query" filter and an optional positive "limit".

Orders from one department in one fiscal year:
{"query": {"Department Name": "Consumer Affairs, Department of", "Fiscal Year": "2013-2014"}}

Orders in a price range:
{"query": {"Total Price": {"$gte": 10000, "$lte": 50000}}, "limit": 20}

Use for specific records and simple filtered listings."#;

/// Either query shape behind one adapter
pub struct QueryTool {
    mode: QueryMode,
    executor: Arc<QueryExecutor>,
    result_limit: usize,
    preview_rows: usize,
}

impl QueryTool {
    pub fn new(
        mode: QueryMode,
        executor: Arc<QueryExecutor>,
        result_limit: usize,
        preview_rows: usize,
    ) -> Self {
        Self {
            mode,
            executor,
            result_limit,
            preview_rows,
        }
    }

    fn parse(&self, payload: &str) -> Result<QueryRequest> {
        match self.mode {
            QueryMode::Lookup => QueryRequest::parse_lookup(payload),
            QueryMode::Pipeline => QueryRequest::parse_pipeline(payload),
        }
    }
}

#[async_trait::async_trait]
impl Tool for QueryTool {
    fn name(&self) -> &'static str {
        match self.mode {
            QueryMode::Lookup => LOOKUP_TOOL,
            QueryMode::Pipeline => AGGREGATE_TOOL,
        }
    }

    fn description(&self) -> &'static str {
        match self.mode {
            QueryMode::Lookup => LOOKUP_DESCRIPTION,
            QueryMode::Pipeline => AGGREGATE_DESCRIPTION,
        }
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput> {
        let outcome = match self.parse(&input.payload) {
            Ok(request) => self.executor.execute(&request, self.result_limit).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(outcome) => {
                debug!(tool = self.name(), rows = outcome.row_count(), "Tool succeeded");
                Ok(ToolOutput {
                    success: true,
                    data: summarize(&outcome, self.preview_rows),
                    error: None,
                })
            }
            Err(e) if e.is_recoverable() => {
                warn!(tool = self.name(), error = %e, "Tool returned a query error");
                Ok(error_output(&e))
            }
            Err(e) => Err(e),
        }
    }
}

/// Bounded summary handed back to the reasoning step.
pub fn summarize(outcome: &QueryOutcome, preview_rows: usize) -> Value {
    match outcome {
        QueryOutcome::Empty => json!({"message": "No results found", "count": 0}),
        QueryOutcome::Rows(set) => {
            let shown = set.rows.len().min(preview_rows);
            let note = if set.total_count > shown {
                format!("Showing first {} of {} results", shown, set.total_count)
            } else {
                String::new()
            };
            json!({
                "count": set.total_count,
                "results": &set.rows[..shown],
                "note": note,
            })
        }
    }
}

pub fn error_output(error: &AssistantError) -> ToolOutput {
    let message = error.to_string();
    ToolOutput {
        success: false,
        data: json!({"error": message, "kind": error.kind()}),
        error: Some(message),
    }
}

pub fn create_default_registry(
    executor: Arc<QueryExecutor>,
    result_limit: usize,
    preview_rows: usize,
) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    for mode in [QueryMode::Pipeline, QueryMode::Lookup] {
        registry.register(Arc::new(QueryTool::new(
            mode,
            Arc::clone(&executor),
            result_limit,
            preview_rows,
        )));
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResultSet;
    use crate::store::{Document, InMemoryStore};
    use std::time::Duration;

    fn registry() -> ToolRegistry {
        let docs: Vec<Document> = (0..30)
            .map(|i| {
                let value = json!({"Fiscal Year": "2013-2014", "Total Price": 100.0 + i as f64});
                serde_json::from_value(value).unwrap()
            })
            .collect();
        let store = Arc::new(InMemoryStore::from_documents("purchase_orders", docs));
        let executor = Arc::new(QueryExecutor::new(store, Duration::from_secs(5)));
        create_default_registry(executor, 100, 10)
    }

    fn input(tool: &str, payload: &str) -> ToolInput {
        ToolInput {
            tool_name: tool.to_string(),
            payload: payload.to_string(),
        }
    }

    #[test]
    fn test_descriptions_carry_worked_examples() {
        let registry = registry();
        assert_eq!(registry.list(), vec![AGGREGATE_TOOL, LOOKUP_TOOL]);
        let aggregate = registry.get(AGGREGATE_TOOL).unwrap();
        assert!(aggregate.description().contains("\"$gt\": 0, \"$type\": \"number\""));
        assert!(aggregate.description().contains("$dateFromString"));
    }

    #[tokio::test]
    async fn test_lookup_summary_is_bounded() {
        let tool = registry().get(LOOKUP_TOOL).unwrap();
        let output = tool
            .execute(&input(LOOKUP_TOOL, r#"{"query": {"Fiscal Year": "2013-2014"}}"#))
            .await
            .unwrap();
        assert!(output.success);
        assert_eq!(output.data["count"], json!(30));
        assert_eq!(output.data["results"].as_array().map(Vec::len), Some(10));
        assert_eq!(output.data["note"], json!("Showing first 10 of 30 results"));
    }

    #[tokio::test]
    async fn test_malformed_payload_is_structured_error() {
        let tool = registry().get(AGGREGATE_TOOL).unwrap();
        let output = tool
            .execute(&input(AGGREGATE_TOOL, "[{\"$match\": "))
            .await
            .unwrap();
        assert!(!output.success);
        let message = output.data["error"].as_str().unwrap_or_default();
        assert!(message.contains("Invalid JSON format"));
        assert_eq!(output.data["kind"], json!("parse"));
    }

    #[tokio::test]
    async fn test_empty_result_marker() {
        let tool = registry().get(LOOKUP_TOOL).unwrap();
        let output = tool
            .execute(&input(LOOKUP_TOOL, r#"{"query": {"Fiscal Year": "2099-2100"}}"#))
            .await
            .unwrap();
        assert_eq!(output.data, json!({"message": "No results found", "count": 0}));
    }

    #[test]
    fn test_summary_without_truncation_has_empty_note() {
        let outcome = QueryOutcome::Rows(ResultSet::new(vec![json!({"a": 1})], 1));
        let summary = summarize(&outcome, 10);
        assert_eq!(summary["note"], json!(""));
        assert_eq!(summary["count"], json!(1));
    }
}
