//! Core data models for the procurement assistant

use crate::error::AssistantError;
use crate::store::Document;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

//
// ================= Query Request =================
//

/// Which of the two query shapes a request uses
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    Lookup,
    Pipeline,
}

/// A validated query, built per turn, executed once, discarded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum QueryRequest {
    Lookup {
        filter: Document,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
    },
    Pipeline {
        stages: Vec<Document>,
    },
}

impl QueryRequest {
    pub fn mode(&self) -> QueryMode {
        match self {
            QueryRequest::Lookup { .. } => QueryMode::Lookup,
            QueryRequest::Pipeline { .. } => QueryMode::Pipeline,
        }
    }

    /// Parse a lookup payload.
    ///
    /// Accepts `{"query": {...}, "limit": n}` or a bare filter object.
    pub fn parse_lookup(payload: &str) -> Result<Self> {
        let value = parse_payload(payload)?;
        let Value::Object(mut object) = value else {
            return Err(AssistantError::QueryParse(
                "lookup input must be a JSON object with a \"query\" field".to_string(),
            ));
        };

        // Bare filter object: every key is a field matcher.
        let Some(query) = object.remove("query") else {
            return Ok(QueryRequest::Lookup {
                filter: object,
                limit: None,
            });
        };

        let filter = match query {
            Value::Object(filter) => filter,
            other => {
                return Err(AssistantError::QueryParse(format!(
                    "\"query\" must be an object, got {}",
                    json_type_name(&other)
                )))
            }
        };

        let limit = match object.get("limit") {
            None | Some(Value::Null) => None,
            Some(value) => Some(value.as_u64().filter(|n| *n > 0).ok_or_else(|| {
                AssistantError::QueryParse("\"limit\" must be a positive integer".to_string())
            })? as usize),
        };

        Ok(QueryRequest::Lookup { filter, limit })
    }

    /// Parse a pipeline payload: a stage array or `{"pipeline": [...]}`.
    pub fn parse_pipeline(payload: &str) -> Result<Self> {
        let value = parse_payload(payload)?;
        let stages = match value {
            Value::Array(stages) => stages,
            Value::Object(mut object) => match object.remove("pipeline") {
                Some(Value::Array(stages)) => stages,
                _ => {
                    return Err(AssistantError::QueryParse(
                        "pipeline input must be an array of stages or {\"pipeline\": [...]}"
                            .to_string(),
                    ))
                }
            },
            other => {
                return Err(AssistantError::QueryParse(format!(
                    "pipeline input must be an array, got {}",
                    json_type_name(&other)
                )))
            }
        };

        let stages = stages
            .into_iter()
            .enumerate()
            .map(|(i, stage)| match stage {
                Value::Object(stage) => Ok(stage),
                other => Err(AssistantError::QueryParse(format!(
                    "stage {} must be an object, got {}",
                    i,
                    json_type_name(&other)
                ))),
            })
            .collect::<Result<Vec<_>>>()?;

        if stages.is_empty() {
            return Err(AssistantError::QueryParse(
                "pipeline must contain at least one stage".to_string(),
            ));
        }

        Ok(QueryRequest::Pipeline { stages })
    }
}

/// Strip markdown fences some models wrap around JSON, then parse.
fn parse_payload(payload: &str) -> Result<Value> {
    let cleaned = payload
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    serde_json::from_str(cleaned)
        .map_err(|e| AssistantError::QueryParse(format!("Invalid JSON format: {}", e)))
}

pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

//
// ================= Result Set =================
//

/// Rows returned by the executor, capped, with the true match count.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultSet {
    pub rows: Vec<Value>,
    pub total_count: usize,
}

impl ResultSet {
    pub fn new(rows: Vec<Value>, total_count: usize) -> Self {
        let total_count = total_count.max(rows.len());
        Self { rows, total_count }
    }

    pub fn is_truncated(&self) -> bool {
        self.total_count > self.rows.len()
    }

    pub fn truncation_note(&self) -> Option<String> {
        self.is_truncated().then(|| {
            format!(
                "Showing first {} of {} results",
                self.rows.len(),
                self.total_count
            )
        })
    }
}

/// Zero matches is a distinct outcome, never an error.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Empty,
    Rows(ResultSet),
}

impl QueryOutcome {
    pub fn row_count(&self) -> usize {
        match self {
            QueryOutcome::Empty => 0,
            QueryOutcome::Rows(set) => set.rows.len(),
        }
    }
}

//
// ================= Tool I/O =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInput {
    pub tool_name: String,
    /// Raw query payload as authored by the reasoning step
    pub payload: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    pub data: Value,
    pub error: Option<String>,
}

//
// ================= Execution =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    /// Recoverable: the reasoning step may retry with a corrected query
    Failed,
    /// Non-recoverable: the turn must stop
    Aborted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub observation_id: Uuid,
    pub tool_name: String,
    pub payload: String,
    pub output: Value,
    pub status: ExecutionStatus,
    pub execution_time_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl Observation {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}

//
// ================= Turn Result =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Answered,
    BudgetExhausted,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnReport {
    pub answer: String,
    pub termination: Termination,
    pub tool_calls: usize,
    pub trace: Vec<String>,
}

impl fmt::Display for QueryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueryMode::Lookup => "lookup",
            QueryMode::Pipeline => "pipeline",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Success => "succeeded",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Aborted => "aborted",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Termination::Answered => "answered",
            Termination::BudgetExhausted => "budget_exhausted",
            Termination::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_lookup_variants() {
        let wrapped = QueryRequest::parse_lookup(
            r#"{"query": {"Fiscal Year": "2013-2014"}, "limit": 5}"#,
        )
        .unwrap();
        match wrapped {
            QueryRequest::Lookup { filter, limit } => {
                assert_eq!(filter.get("Fiscal Year"), Some(&json!("2013-2014")));
                assert_eq!(limit, Some(5));
            }
            _ => panic!("expected lookup"),
        }

        let bare = QueryRequest::parse_lookup(r#"{"CalCard": "YES"}"#).unwrap();
        assert_eq!(bare.mode(), QueryMode::Lookup);
    }

    #[test]
    fn test_parse_pipeline_variants() {
        let fenced = "```json\n[{\"$match\": {}}, {\"$count\": \"n\"}]\n```";
        match QueryRequest::parse_pipeline(fenced).unwrap() {
            QueryRequest::Pipeline { stages } => assert_eq!(stages.len(), 2),
            _ => panic!("expected pipeline"),
        }

        let wrapped = QueryRequest::parse_pipeline(r#"{"pipeline": [{"$limit": 1}]}"#).unwrap();
        assert_eq!(wrapped.mode(), QueryMode::Pipeline);
    }

    #[test]
    fn test_parse_errors_are_query_parse() {
        for bad in ["{not json", "[]", "[1, 2]", "\"text\""] {
            let err = QueryRequest::parse_pipeline(bad).unwrap_err();
            assert!(matches!(err, AssistantError::QueryParse(_)), "{}", bad);
        }
        let err = QueryRequest::parse_lookup(r#"{"query": [1]}"#).unwrap_err();
        assert!(matches!(err, AssistantError::QueryParse(_)));
    }

    #[test]
    fn test_truncation_note() {
        let set = ResultSet::new(vec![json!({}); 3], 7);
        assert!(set.is_truncated());
        assert_eq!(
            set.truncation_note().as_deref(),
            Some("Showing first 3 of 7 results")
        );
        assert!(ResultSet::new(vec![json!({})], 1).truncation_note().is_none());
    }
}
