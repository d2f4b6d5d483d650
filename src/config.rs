//! Runtime configuration
//!
//! Loaded once at startup from the environment (and `.env` when present).

use crate::error::AssistantError;
use crate::Result;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_MAX_ITERATIONS: usize = 3;
pub const DEFAULT_RESULT_LIMIT: usize = 100;
pub const DEFAULT_PREVIEW_ROWS: usize = 10;
pub const DEFAULT_HISTORY_TURNS: usize = 10;
pub const DEFAULT_MAX_SESSIONS: usize = 1000;
pub const DEFAULT_SESSION_IDLE_SECS: u64 = 30 * 60;

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Live MongoDB deployment; when absent the snapshot at `data_path` is used
    pub mongodb_uri: Option<String>,
    /// Snapshot of cleaned purchase-order records for offline use
    pub data_path: PathBuf,
    pub database: String,
    pub collection: String,
    pub gemini_api_key: String,
    pub model: String,
    pub temperature: f32,
    /// Tool invocations allowed per question
    pub max_iterations: usize,
    /// Hard ceiling on rows materialized by the executor
    pub result_limit: usize,
    /// Rows handed back to the reasoning step per tool call
    pub preview_rows: usize,
    pub query_timeout: Duration,
    pub history_turns: usize,
    pub api_port: u16,
    /// API conversations kept in memory at once
    pub max_sessions: usize,
    /// API conversations untouched this long are dropped
    pub session_idle_timeout: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mongodb_uri: None,
            data_path: PathBuf::from("data/purchase_orders.jsonl"),
            database: "california_procurement".to_string(),
            collection: "purchase_orders".to_string(),
            gemini_api_key: String::new(),
            model: "gemini-2.0-flash".to_string(),
            temperature: 0.1,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            result_limit: DEFAULT_RESULT_LIMIT,
            preview_rows: DEFAULT_PREVIEW_ROWS,
            query_timeout: Duration::from_secs(30),
            history_turns: DEFAULT_HISTORY_TURNS,
            api_port: 8080,
            max_sessions: DEFAULT_MAX_SESSIONS,
            session_idle_timeout: Duration::from_secs(DEFAULT_SESSION_IDLE_SECS),
        }
    }
}

impl AppConfig {
    /// Read configuration from the process environment.
    ///
    /// Fails fast when the LLM credential is missing or a numeric
    /// setting does not parse.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let gemini_api_key = lookup("GEMINI_API_KEY")
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                AssistantError::Configuration(
                    "GEMINI_API_KEY not found. Please set it in the environment or .env file"
                        .to_string(),
                )
            })?;

        let timeout_secs: u64 = parse_var(&lookup, "QUERY_TIMEOUT_SECS", 30)?;
        let idle_secs: u64 = parse_var(&lookup, "SESSION_IDLE_SECS", DEFAULT_SESSION_IDLE_SECS)?;
        let api_port = match lookup("PORT") {
            Some(port) => parse_value("PORT", &port)?,
            None => parse_var(&lookup, "API_PORT", defaults.api_port)?,
        };

        let config = Self {
            mongodb_uri: lookup("MONGODB_URI")
                .map(|uri| uri.trim().to_string())
                .filter(|uri| !uri.is_empty()),
            data_path: lookup("PROCUREMENT_DATA_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_path),
            database: lookup("MONGODB_DATABASE")
                .or_else(|| lookup("PROCUREMENT_DATABASE"))
                .unwrap_or(defaults.database),
            collection: lookup("PROCUREMENT_COLLECTION").unwrap_or(defaults.collection),
            gemini_api_key,
            model: lookup("GEMINI_MODEL").unwrap_or(defaults.model),
            temperature: parse_var(&lookup, "LLM_TEMPERATURE", defaults.temperature)?,
            max_iterations: parse_var(&lookup, "MAX_ITERATIONS", defaults.max_iterations)?,
            result_limit: parse_var(&lookup, "RESULT_LIMIT", defaults.result_limit)?,
            preview_rows: parse_var(&lookup, "PREVIEW_ROWS", defaults.preview_rows)?,
            query_timeout: Duration::from_secs(timeout_secs),
            history_turns: parse_var(&lookup, "HISTORY_TURNS", defaults.history_turns)?,
            api_port,
            max_sessions: parse_var(&lookup, "MAX_SESSIONS", defaults.max_sessions)?,
            session_idle_timeout: Duration::from_secs(idle_secs),
        };

        if config.max_iterations == 0
            || config.result_limit == 0
            || config.preview_rows == 0
            || config.max_sessions == 0
        {
            return Err(AssistantError::Configuration(
                "MAX_ITERATIONS, RESULT_LIMIT, PREVIEW_ROWS and MAX_SESSIONS must be greater than zero"
                    .to_string(),
            ));
        }

        Ok(config)
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim().parse::<T>().map_err(|_| {
        AssistantError::Configuration(format!("{} has an invalid value: {:?}", key, raw))
    })
}
