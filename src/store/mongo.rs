//! MongoDB-backed document store
//!
//! Talks to the live procurement collection named by `MONGODB_URI`.
//! Filters and stages travel as relaxed extended JSON, so dates come back
//! as `{"$date": ...}` exactly like the in-memory store produces them.

use super::{Document, DocumentStore};
use crate::error::AssistantError;
use crate::Result;
use async_trait::async_trait;
use mongodb::bson::{self, doc, Bson};
use mongodb::error::ErrorKind;
use mongodb::options::ClientOptions;
use mongodb::{Client, Collection, Cursor, IndexModel};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info};

const APP_NAME: &str = "procurement-assistant";

pub struct MongoStore {
    client: Client,
    database: String,
    collection_name: String,
    collection: Collection<bson::Document>,
    closed: AtomicBool,
}

impl MongoStore {
    /// Build a client for `uri`. No I/O happens until the first call;
    /// use [`DocumentStore::ping`] to check reachability.
    pub async fn connect(
        uri: &str,
        database: impl Into<String>,
        collection: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let mut options = ClientOptions::parse(uri)
            .await
            .map_err(|e| AssistantError::Connection(format!("invalid MONGODB_URI: {}", e)))?;
        options.app_name = Some(APP_NAME.to_string());
        options.server_selection_timeout.get_or_insert(timeout);
        options.connect_timeout.get_or_insert(timeout);

        let client = Client::with_options(options).map_err(map_error)?;
        let database = database.into();
        let collection_name = collection.into();
        let collection = client
            .database(&database)
            .collection::<bson::Document>(&collection_name);

        info!(database = %database, collection = %collection_name, "MongoDB client created");

        Ok(Self {
            client,
            database,
            collection_name,
            collection,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AssistantError::Connection(format!(
                "connection to collection '{}' is closed",
                self.collection_name
            )));
        }
        Ok(())
    }
}

/// Network, selection and auth failures mean the store is unreachable;
/// everything else is a problem with the query itself.
fn map_error(error: mongodb::error::Error) -> AssistantError {
    match error.kind.as_ref() {
        ErrorKind::ServerSelection { .. }
        | ErrorKind::Io(_)
        | ErrorKind::ConnectionPoolCleared { .. }
        | ErrorKind::Authentication { .. }
        | ErrorKind::DnsResolve { .. }
        | ErrorKind::Shutdown => AssistantError::Connection(error.to_string()),
        _ => AssistantError::QueryExecution(error.to_string()),
    }
}

pub(crate) fn to_bson_document(document: &Document) -> Result<bson::Document> {
    match Bson::try_from(Value::Object(document.clone())) {
        Ok(Bson::Document(converted)) => Ok(converted),
        Ok(other) => Err(AssistantError::QueryExecution(format!(
            "expected a document, got {:?}",
            other.element_type()
        ))),
        Err(e) => Err(AssistantError::QueryExecution(format!(
            "cannot encode query for MongoDB: {}",
            e
        ))),
    }
}

pub(crate) fn from_bson_document(document: bson::Document) -> Document {
    match Bson::Document(document).into_relaxed_extjson() {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

async fn drain(mut cursor: Cursor<bson::Document>) -> Result<Vec<Document>> {
    let mut rows = Vec::new();
    while cursor.advance().await.map_err(map_error)? {
        let row = cursor.deserialize_current().map_err(map_error)?;
        rows.push(from_bson_document(row));
    }
    Ok(rows)
}

#[async_trait]
impl DocumentStore for MongoStore {
    fn collection(&self) -> &str {
        &self.collection_name
    }

    async fn ping(&self) -> Result<()> {
        self.ensure_open()?;
        self.client
            .database(&self.database)
            .run_command(doc! {"ping": 1})
            .await
            .map_err(|e| match map_error(e) {
                AssistantError::QueryExecution(msg) => AssistantError::Connection(msg),
                other => other,
            })?;
        debug!(database = %self.database, "MongoDB ping ok");
        Ok(())
    }

    async fn find(&self, filter: &Document, limit: Option<usize>) -> Result<Vec<Document>> {
        self.ensure_open()?;
        let filter = to_bson_document(filter)?;
        let cursor = match limit {
            Some(n) => self.collection.find(filter).limit(n as i64).await,
            None => self.collection.find(filter).await,
        }
        .map_err(map_error)?;
        drain(cursor).await
    }

    async fn aggregate(&self, stages: &[Document]) -> Result<Vec<Document>> {
        self.ensure_open()?;
        let pipeline = stages
            .iter()
            .map(to_bson_document)
            .collect::<Result<Vec<_>>>()?;
        let cursor = self.collection.aggregate(pipeline).await.map_err(map_error)?;
        drain(cursor).await
    }

    async fn count_documents(&self, filter: &Document) -> Result<u64> {
        self.ensure_open()?;
        self.collection
            .count_documents(to_bson_document(filter)?)
            .await
            .map_err(map_error)
    }

    async fn distinct(&self, field: &str) -> Result<Vec<Value>> {
        self.ensure_open()?;
        let values = self
            .collection
            .distinct(field, doc! {})
            .await
            .map_err(map_error)?;
        Ok(values.into_iter().map(Bson::into_relaxed_extjson).collect())
    }

    async fn create_index(&self, field: &str) -> Result<()> {
        self.ensure_open()?;
        let mut keys = bson::Document::new();
        keys.insert(field, 1);
        let model = IndexModel::builder().keys(keys).build();
        self.collection.create_index(model).await.map_err(map_error)?;
        debug!(field, "Index ensured");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.client.clone().shutdown().await;
            info!(collection = %self.collection_name, "MongoDB client shut down");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("test document must be an object"),
        }
    }

    #[test]
    fn test_query_operators_survive_encoding() {
        let filter = doc(json!({
            "Fiscal Year": "2013-2014",
            "Total Price": {"$gt": 0, "$type": "number"}
        }));
        let encoded = to_bson_document(&filter).unwrap();
        let price = encoded.get_document("Total Price").unwrap();
        assert_eq!(price.get_i64("$gt").or_else(|_| price.get_i32("$gt").map(i64::from)).unwrap(), 0);
        assert_eq!(price.get_str("$type").unwrap(), "number");
        assert_eq!(encoded.get_str("Fiscal Year").unwrap(), "2013-2014");
    }

    #[test]
    fn test_dates_come_back_as_extended_json() {
        let mut row = bson::Document::new();
        row.insert("Item Name", "Paper");
        row.insert(
            "created",
            bson::DateTime::from_millis(1_377_561_600_000),
        );
        row.insert("Total Price", 12.5);

        let decoded = from_bson_document(row);
        assert_eq!(decoded["Item Name"], json!("Paper"));
        assert_eq!(decoded["Total Price"], json!(12.5));
        assert!(decoded["created"].get("$date").is_some());
    }

    #[tokio::test]
    async fn test_bad_uri_is_a_connection_error() {
        let result = MongoStore::connect(
            "not-a-mongodb-uri",
            "california_procurement",
            "purchase_orders",
            Duration::from_millis(200),
        )
        .await;
        assert!(matches!(result, Err(AssistantError::Connection(_))));
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_ping() {
        let store = MongoStore::connect(
            "mongodb://127.0.0.1:1/?serverSelectionTimeoutMS=200&connectTimeoutMS=200",
            "california_procurement",
            "purchase_orders",
            Duration::from_millis(200),
        )
        .await
        .unwrap();

        let err = store.ping().await.unwrap_err();
        assert!(matches!(err, AssistantError::Connection(_)));

        store.close().await.unwrap();
        let closed = store.count_documents(&Document::new()).await.unwrap_err();
        assert!(matches!(closed, AssistantError::Connection(_)));
    }
}
