//! Query executor
//!
//! Runs one of the two query shapes against the shared store handle,
//! enforces the row ceiling, and separates "no matches" from errors.
//! Read-only: there is no mutation path here.

use crate::error::AssistantError;
use crate::models::{QueryOutcome, QueryRequest, ResultSet};
use crate::store::{Document, DocumentStore};
use crate::verification::VerificationEngine;
use crate::Result;
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const COUNT_FIELD: &str = "total";

pub struct QueryExecutor {
    store: Arc<dyn DocumentStore>,
    verifier: VerificationEngine,
    query_timeout: Duration,
}

impl QueryExecutor {
    pub fn new(store: Arc<dyn DocumentStore>, query_timeout: Duration) -> Self {
        Self {
            store,
            verifier: VerificationEngine::with_default_rules(),
            query_timeout,
        }
    }

    pub fn with_verifier(mut self, verifier: VerificationEngine) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Verify, then dispatch on the request shape.
    pub async fn execute(&self, request: &QueryRequest, limit: usize) -> Result<QueryOutcome> {
        self.verifier.enforce(request)?;
        match request {
            QueryRequest::Lookup {
                filter,
                limit: requested,
            } => {
                let limit = requested.map_or(limit, |n| n.min(limit));
                self.execute_lookup(filter, limit).await
            }
            QueryRequest::Pipeline { stages } => self.execute_aggregation(stages, limit).await,
        }
    }

    /// Up to `limit` matching records in store order.
    pub async fn execute_lookup(&self, filter: &Document, limit: usize) -> Result<QueryOutcome> {
        let start = Instant::now();
        let docs = self
            .bounded(self.store.find(filter, Some(limit)))
            .await?;

        if docs.is_empty() {
            debug!("Lookup matched nothing");
            return Ok(QueryOutcome::Empty);
        }

        // A full page may hide more matches.
        let total = if docs.len() >= limit {
            self.bounded(self.store.count_documents(filter)).await? as usize
        } else {
            docs.len()
        };

        let set = ResultSet::new(docs.into_iter().map(Value::Object).collect(), total);
        info!(
            rows = set.rows.len(),
            total = set.total_count,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Lookup executed"
        );
        Ok(QueryOutcome::Rows(set))
    }

    /// Run the stages with a `$limit` guaranteed to be no larger than `limit`.
    pub async fn execute_aggregation(
        &self,
        stages: &[Document],
        limit: usize,
    ) -> Result<QueryOutcome> {
        let start = Instant::now();
        let bounded_stages = cap_stages(stages, limit);

        let rows = self
            .bounded(self.store.aggregate(&bounded_stages))
            .await?;

        if rows.is_empty() {
            debug!("Aggregation produced no rows");
            return Ok(QueryOutcome::Empty);
        }

        let total = if rows.len() >= limit {
            self.count_pipeline(stages).await.unwrap_or_else(|e| {
                warn!(error = %e, "Could not count full pipeline output");
                rows.len()
            })
        } else {
            rows.len()
        };

        let set = ResultSet::new(rows.into_iter().map(Value::Object).collect(), total);
        info!(
            stages = bounded_stages.len(),
            rows = set.rows.len(),
            total = set.total_count,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Aggregation executed"
        );
        Ok(QueryOutcome::Rows(set))
    }

    /// True output size of the author's pipeline, ignoring our ceiling.
    async fn count_pipeline(&self, stages: &[Document]) -> Result<usize> {
        let mut counted: Vec<Document> = stages.to_vec();
        let mut count_stage = Map::new();
        count_stage.insert("$count".to_string(), Value::String(COUNT_FIELD.to_string()));
        counted.push(count_stage);

        let rows = self.bounded(self.store.aggregate(&counted)).await?;
        Ok(rows
            .first()
            .and_then(|row| row.get(COUNT_FIELD))
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize)
    }

    async fn bounded<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.query_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_secs = self.query_timeout.as_secs(), "Store query timed out");
                Err(AssistantError::QueryTimeout(self.query_timeout.as_secs()))
            }
        }
    }
}

/// Append `{"$limit": limit}` when absent; clamp explicit limits above it.
pub fn cap_stages(stages: &[Document], limit: usize) -> Vec<Document> {
    let mut capped: Vec<Document> = stages
        .iter()
        .map(|stage| match stage.get("$limit").and_then(Value::as_u64) {
            Some(n) if n as usize > limit => {
                let mut clamped = stage.clone();
                clamped.insert("$limit".to_string(), Value::from(limit));
                clamped
            }
            _ => stage.clone(),
        })
        .collect();

    if !ends_bounded(&capped, limit) {
        let mut limit_stage = Map::new();
        limit_stage.insert("$limit".to_string(), Value::from(limit));
        capped.push(limit_stage);
    }
    capped
}

/// Last stage-level `$limit` is within bounds and no `$unwind` follows it.
fn ends_bounded(stages: &[Document], limit: usize) -> bool {
    let last_limit = stages.iter().rposition(|s| s.contains_key("$limit"));
    match last_limit {
        Some(i) => stages[i + 1..].iter().all(|s| !s.contains_key("$unwind"))
            && stages[i]
                .get("$limit")
                .and_then(Value::as_u64)
                .map_or(false, |n| n as usize <= limit),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("test value must be an object"),
        }
    }

    fn executor_with(count: usize) -> QueryExecutor {
        let docs = (0..count)
            .map(|i| {
                let year = if i % 2 == 0 { "2013-2014" } else { "2014-2015" };
                doc(json!({
                    "Fiscal Year": year,
                    "Total Price": (i + 1) as f64,
                    "Department Name": format!("Dept {}", i % 7)
                }))
            })
            .collect();
        let store = Arc::new(InMemoryStore::from_documents("purchase_orders", docs));
        QueryExecutor::new(store, Duration::from_secs(5))
    }

    #[test]
    fn test_cap_stages() {
        let stages = vec![doc(json!({"$match": {}}))];
        let capped = cap_stages(&stages, 100);
        assert_eq!(capped.last(), Some(&doc(json!({"$limit": 100}))));

        let explicit = vec![doc(json!({"$match": {}})), doc(json!({"$limit": 500}))];
        let capped = cap_stages(&explicit, 100);
        assert_eq!(capped.len(), 2);
        assert_eq!(capped[1], doc(json!({"$limit": 100})));

        let small = vec![doc(json!({"$limit": 1}))];
        assert_eq!(cap_stages(&small, 100), small);
    }

    #[tokio::test]
    async fn test_lookup_caps_and_reports_true_count() {
        let executor = executor_with(250);
        let filter = doc(json!({"Fiscal Year": "2013-2014"}));
        match executor.execute_lookup(&filter, 100).await.unwrap() {
            QueryOutcome::Rows(set) => {
                assert_eq!(set.rows.len(), 100);
                assert_eq!(set.total_count, 125);
                assert!(set.truncation_note().is_some());
            }
            QueryOutcome::Empty => panic!("expected rows"),
        }
    }

    #[tokio::test]
    async fn test_aggregation_without_limit_is_bounded() {
        let executor = executor_with(250);
        let stages = vec![doc(json!({"$project": {"Total Price": 1}}))];
        match executor.execute_aggregation(&stages, 100).await.unwrap() {
            QueryOutcome::Rows(set) => {
                assert_eq!(set.rows.len(), 100);
                assert_eq!(set.total_count, 250);
            }
            QueryOutcome::Empty => panic!("expected rows"),
        }
    }

    #[tokio::test]
    async fn test_empty_is_not_an_error() {
        let executor = executor_with(10);
        let filter = doc(json!({"Fiscal Year": "1999-2000"}));
        let outcome = executor.execute_lookup(&filter, 100).await.unwrap();
        assert_eq!(outcome, QueryOutcome::Empty);
    }

    #[tokio::test]
    async fn test_unguarded_request_rejected_before_store() {
        let executor = executor_with(10);
        let request = QueryRequest::parse_pipeline(
            r#"[{"$group": {"_id": null, "total": {"$sum": "$Total Price"}}}]"#,
        )
        .unwrap();
        let err = executor.execute(&request, 100).await.unwrap_err();
        assert!(matches!(err, AssistantError::QueryExecution(_)));
    }

    struct StalledStore;

    #[async_trait]
    impl DocumentStore for StalledStore {
        fn collection(&self) -> &str {
            "stalled"
        }
        async fn ping(&self) -> Result<()> {
            Ok(())
        }
        async fn find(&self, _: &Document, _: Option<usize>) -> Result<Vec<Document>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Vec::new())
        }
        async fn aggregate(&self, _: &[Document]) -> Result<Vec<Document>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Vec::new())
        }
        async fn count_documents(&self, _: &Document) -> Result<u64> {
            Ok(0)
        }
        async fn distinct(&self, _: &str) -> Result<Vec<Value>> {
            Ok(Vec::new())
        }
        async fn create_index(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_timeout_is_recoverable() {
        let executor = QueryExecutor::new(Arc::new(StalledStore), Duration::from_millis(20));
        let err = executor
            .execute_lookup(&Document::new(), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, AssistantError::QueryTimeout(_)));
        assert!(err.is_recoverable());
    }
}
