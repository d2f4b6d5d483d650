//! Dataset explorer
//!
//! Fixed analytics over the purchase orders for presentation layers. Every
//! pipeline goes through the executor, so validation and row caps apply.

use crate::executor::QueryExecutor;
use crate::models::{QueryOutcome, QueryRequest};
use crate::pipelines;
use crate::schema::{
    self, SchemaInfo, FIELD_ACQUISITION_METHOD, FIELD_ACQUISITION_TYPE, FIELD_DEPARTMENT,
    FIELD_FISCAL_YEAR, FIELD_SUPPLIER,
};
use crate::store::{value, Document};
use crate::Result;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DatasetOverview {
    pub total_records: u64,
    pub fiscal_years: Vec<Value>,
    pub department_count: usize,
    pub supplier_count: usize,
    pub acquisition_types: Vec<Value>,
    pub acquisition_methods: Vec<Value>,
    /// Sum over present, numeric, positive prices
    pub total_spending: f64,
}

pub struct DatasetExplorer {
    executor: Arc<QueryExecutor>,
    limit: usize,
}

impl DatasetExplorer {
    pub fn new(executor: Arc<QueryExecutor>, limit: usize) -> Self {
        Self { executor, limit }
    }

    pub async fn overview(&self) -> Result<DatasetOverview> {
        let store = self.executor.store();

        let total_records = store.count_documents(&Document::new()).await?;
        let mut fiscal_years = non_null(store.distinct(FIELD_FISCAL_YEAR).await?);
        fiscal_years.sort_by(value::compare);
        let department_count = non_null(store.distinct(FIELD_DEPARTMENT).await?).len();
        let supplier_count = non_null(store.distinct(FIELD_SUPPLIER).await?).len();
        let acquisition_types = non_null(store.distinct(FIELD_ACQUISITION_TYPE).await?);
        let acquisition_methods = non_null(store.distinct(FIELD_ACQUISITION_METHOD).await?);

        let total_spending = self
            .rows(pipelines::total_spending(None))
            .await?
            .first()
            .and_then(|row| row.get("total_spending"))
            .and_then(Value::as_f64)
            .unwrap_or(0.0);

        info!(total_records, department_count, supplier_count, "Dataset overview computed");

        Ok(DatasetOverview {
            total_records,
            fiscal_years,
            department_count,
            supplier_count,
            acquisition_types,
            acquisition_methods,
            total_spending,
        })
    }

    pub async fn spending_by_fiscal_year(&self) -> Result<Vec<Value>> {
        self.rows(pipelines::spending_by_fiscal_year()).await
    }

    pub async fn top_departments(&self, top_n: usize) -> Result<Vec<Value>> {
        self.rows(pipelines::top_departments(top_n)).await
    }

    pub async fn top_suppliers(&self, top_n: usize) -> Result<Vec<Value>> {
        self.rows(pipelines::top_suppliers(top_n)).await
    }

    pub async fn acquisition_methods(&self) -> Result<Vec<Value>> {
        self.rows(pipelines::acquisition_methods()).await
    }

    pub async fn top_items(&self, top_n: usize) -> Result<Vec<Value>> {
        self.rows(pipelines::top_items(top_n)).await
    }

    pub async fn quarterly_spending(&self, fiscal_year: Option<&str>) -> Result<Vec<Value>> {
        self.rows(pipelines::quarterly_spending(fiscal_year)).await
    }

    pub async fn schema_info(&self) -> Result<SchemaInfo> {
        schema::inspect(self.executor.store().as_ref()).await
    }

    async fn rows(&self, stages: Vec<Document>) -> Result<Vec<Value>> {
        let request = QueryRequest::Pipeline { stages };
        match self.executor.execute(&request, self.limit).await? {
            QueryOutcome::Empty => Ok(Vec::new()),
            QueryOutcome::Rows(set) => Ok(set.rows),
        }
    }
}

fn non_null(values: Vec<Value>) -> Vec<Value> {
    values
        .into_iter()
        .filter(|v| !v.is_null() && v.as_str() != Some(""))
        .collect()
}
