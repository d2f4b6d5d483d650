//! Document store connector
//!
//! The assistant only ever reads from the store. `DocumentStore` is the
//! seam between the executor and whatever backs the collection.
//! `MongoStore` talks to the live database; `InMemoryStore` evaluates the
//! same query dialect over a snapshot of cleaned records for offline use
//! and tests.

use crate::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};

pub mod expr;
pub mod filter;
pub mod memory;
pub mod mongo;
pub mod pipeline;
pub mod value;

pub use memory::InMemoryStore;
pub use mongo::MongoStore;

/// One record (or one aggregation output row)
pub type Document = Map<String, Value>;

/// Read-only access to a single collection
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Collection name, for logs and schema text
    fn collection(&self) -> &str;

    /// Startup reachability check
    async fn ping(&self) -> Result<()>;

    async fn find(&self, filter: &Document, limit: Option<usize>) -> Result<Vec<Document>>;

    async fn aggregate(&self, stages: &[Document]) -> Result<Vec<Document>>;

    async fn count_documents(&self, filter: &Document) -> Result<u64>;

    async fn distinct(&self, field: &str) -> Result<Vec<Value>>;

    async fn create_index(&self, field: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
