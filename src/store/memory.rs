//! In-memory document store backed by a snapshot file
//!
//! The snapshot is either a JSON array of records or JSON lines (one
//! record per line), as written by the ingestion step.

use super::{filter, pipeline, value, Document, DocumentStore};
use crate::error::AssistantError;
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use tracing::{debug, info};

pub struct InMemoryStore {
    collection: String,
    documents: RwLock<Vec<Document>>,
    indexes: RwLock<Vec<String>>,
    closed: AtomicBool,
}

impl InMemoryStore {
    pub fn from_documents(collection: impl Into<String>, documents: Vec<Document>) -> Self {
        Self {
            collection: collection.into(),
            documents: RwLock::new(documents),
            indexes: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Load a snapshot. A missing or malformed file is a connection failure.
    pub fn open(path: impl AsRef<Path>, collection: impl Into<String>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AssistantError::Connection(format!(
                "cannot open document snapshot {}: {}",
                path.display(),
                e
            ))
        })?;

        let documents = parse_snapshot(&raw).map_err(|e| {
            AssistantError::Connection(format!(
                "malformed document snapshot {}: {}",
                path.display(),
                e
            ))
        })?;

        let store = Self::from_documents(collection, documents);
        info!(
            collection = %store.collection,
            records = store.len(),
            path = %path.display(),
            "Document store loaded"
        );
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.documents.read().map(|docs| docs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn indexes(&self) -> Vec<String> {
        self.indexes
            .read()
            .map(|indexes| indexes.clone())
            .unwrap_or_default()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AssistantError::Connection(format!(
                "connection to collection '{}' is closed",
                self.collection
            )));
        }
        Ok(())
    }

    fn snapshot(&self) -> Result<Vec<Document>> {
        self.ensure_open()?;
        self.documents
            .read()
            .map(|docs| docs.clone())
            .map_err(|_| AssistantError::Connection("document store lock poisoned".to_string()))
    }

    fn with_documents<T>(&self, f: impl FnOnce(&[Document]) -> Result<T>) -> Result<T> {
        self.ensure_open()?;
        let docs = self
            .documents
            .read()
            .map_err(|_| AssistantError::Connection("document store lock poisoned".to_string()))?;
        f(&docs)
    }
}

fn parse_snapshot(raw: &str) -> std::result::Result<Vec<Document>, String> {
    let trimmed = raw.trim_start();
    if trimmed.starts_with('[') {
        let values: Vec<Value> = serde_json::from_str(trimmed).map_err(|e| e.to_string())?;
        return values
            .into_iter()
            .enumerate()
            .map(|(i, value)| match value {
                Value::Object(doc) => Ok(doc),
                _ => Err(format!("record {} is not an object", i)),
            })
            .collect();
    }

    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(doc)) => Ok(doc),
            Ok(_) => Err(format!("line {} is not an object", i + 1)),
            Err(e) => Err(format!("line {}: {}", i + 1, e)),
        })
        .collect()
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    fn collection(&self) -> &str {
        &self.collection
    }

    async fn ping(&self) -> Result<()> {
        self.ensure_open()
    }

    async fn find(&self, filter: &Document, limit: Option<usize>) -> Result<Vec<Document>> {
        self.with_documents(|docs| {
            let cap = limit.unwrap_or(usize::MAX);
            let mut out = Vec::new();
            for doc in docs {
                if out.len() >= cap {
                    break;
                }
                if filter::matches(doc, filter)? {
                    out.push(doc.clone());
                }
            }
            debug!(matched = out.len(), "find complete");
            Ok(out)
        })
    }

    async fn aggregate(&self, stages: &[Document]) -> Result<Vec<Document>> {
        let docs = self.snapshot()?;
        let rows = pipeline::run(docs, stages)?;
        debug!(stages = stages.len(), rows = rows.len(), "aggregate complete");
        Ok(rows)
    }

    async fn count_documents(&self, filter: &Document) -> Result<u64> {
        self.with_documents(|docs| {
            let mut count = 0u64;
            for doc in docs {
                if filter::matches(doc, filter)? {
                    count += 1;
                }
            }
            Ok(count)
        })
    }

    async fn distinct(&self, field: &str) -> Result<Vec<Value>> {
        self.with_documents(|docs| {
            let mut seen: Vec<Value> = Vec::new();
            let mut push = |candidate: &Value| {
                if !seen.iter().any(|v| value::values_equal(v, candidate)) {
                    seen.push(candidate.clone());
                }
            };
            for doc in docs {
                match value::lookup_in(doc, field) {
                    Some(Value::Array(items)) => items.iter().for_each(&mut push),
                    Some(other) => push(other),
                    None => {}
                }
            }
            Ok(seen)
        })
    }

    async fn create_index(&self, field: &str) -> Result<()> {
        self.ensure_open()?;
        let mut indexes = self
            .indexes
            .write()
            .map_err(|_| AssistantError::Connection("index registry lock poisoned".to_string()))?;
        if !indexes.iter().any(|f| f == field) {
            indexes.push(field.to_string());
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        info!(collection = %self.collection, "Document store closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("test value must be an object"),
        }
    }

    fn store() -> InMemoryStore {
        InMemoryStore::from_documents(
            "purchase_orders",
            vec![
                doc(json!({"Fiscal Year": "2012-2013", "CalCard": "YES", "Total Price": 10.0})),
                doc(json!({"Fiscal Year": "2013-2014", "CalCard": "NO", "Total Price": 20.0})),
                doc(json!({"Fiscal Year": "2013-2014", "CalCard": "NO", "Total Price": 30.0})),
            ],
        )
    }

    #[tokio::test]
    async fn test_find_count_distinct() {
        let store = store();
        let filter = doc(json!({"Fiscal Year": "2013-2014"}));
        assert_eq!(store.find(&filter, Some(1)).await.unwrap().len(), 1);
        assert_eq!(store.count_documents(&filter).await.unwrap(), 2);
        assert_eq!(
            store.distinct("Fiscal Year").await.unwrap(),
            vec![json!("2012-2013"), json!("2013-2014")]
        );
    }

    #[tokio::test]
    async fn test_open_json_lines_snapshot() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{\"Fiscal Year\": \"2014-2015\", \"Total Price\": 5}}").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "{{\"Fiscal Year\": \"2013-2014\", \"Total Price\": 7}}").unwrap();

        let store = InMemoryStore::open(file.path(), "purchase_orders").unwrap();
        assert_eq!(store.len(), 2);
        store.create_index("Fiscal Year").await.unwrap();
        store.create_index("Fiscal Year").await.unwrap();
        assert_eq!(store.indexes(), vec!["Fiscal Year".to_string()]);
    }

    #[test]
    fn test_open_failures_are_connection_errors() {
        let missing = InMemoryStore::open("/nonexistent/snapshot.jsonl", "c");
        assert!(matches!(missing, Err(AssistantError::Connection(_))));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[1, 2]").unwrap();
        let malformed = InMemoryStore::open(file.path(), "c");
        assert!(matches!(malformed, Err(AssistantError::Connection(_))));
    }

    #[tokio::test]
    async fn test_closed_store_rejects_calls() {
        let store = store();
        store.close().await.unwrap();
        let err = store.count_documents(&Document::new()).await.unwrap_err();
        assert!(matches!(err, AssistantError::Connection(_)));
        assert!(!err.is_recoverable());
    }
}
