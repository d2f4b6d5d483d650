//! Error types for the procurement assistant

use thiserror::Error;

/// Result type alias for assistant operations
pub type Result<T> = std::result::Result<T, AssistantError>;

#[derive(Error, Debug)]
pub enum AssistantError {

    // =============================
    // Startup
    // =============================

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection error: {0}")]
    Connection(String),

    // =============================
    // Query Errors (recoverable inside the reasoning loop)
    // =============================

    #[error("Query parse error: {0}")]
    QueryParse(String),

    #[error("Query execution error: {0}")]
    QueryExecution(String),

    #[error("Query timed out after {0} seconds")]
    QueryTimeout(u64),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    // =============================
    // Reasoning
    // =============================

    #[error("LLM error: {0}")]
    Llm(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AssistantError {
    /// Whether the reasoning loop may retry with a corrected query.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AssistantError::QueryParse(_)
                | AssistantError::QueryExecution(_)
                | AssistantError::QueryTimeout(_)
                | AssistantError::ToolNotFound(_)
        )
    }

    /// Short machine-readable tag used in structured tool error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            AssistantError::Configuration(_) => "configuration",
            AssistantError::Connection(_) => "connection",
            AssistantError::QueryParse(_) => "parse",
            AssistantError::QueryExecution(_) => "execution",
            AssistantError::QueryTimeout(_) => "timeout",
            AssistantError::ToolNotFound(_) => "tool_not_found",
            AssistantError::Llm(_) => "llm",
            AssistantError::Serialization(_) => "serialization",
            AssistantError::Http(_) => "http",
            AssistantError::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(AssistantError::QueryParse("bad json".into()).is_recoverable());
        assert!(AssistantError::QueryTimeout(30).is_recoverable());
        assert!(!AssistantError::Connection("refused".into()).is_recoverable());
        assert!(!AssistantError::Llm("quota".into()).is_recoverable());
    }
}
