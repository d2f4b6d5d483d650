//! Reasoning loop and assistant sessions
//!
//! INPUT → DECIDE → (INVOKE → OBSERVE →)* → ANSWER
//!
//! One question occupies the loop until it answers. The tool budget bounds
//! how many queries a single question may run against the store.

use crate::config::AppConfig;
use crate::execution::ExecutionEngine;
use crate::executor::QueryExecutor;
use crate::explorer::DatasetExplorer;
use crate::llm::GeminiClient;
use crate::memory::{ConversationState, Turn};
use crate::models::{ExecutionStatus, Observation, Termination, TurnReport};
use crate::reasoner::{Decision, GeminiReasoner, Reasoner, ReasoningContext};
use crate::schema::{
    SchemaDescriptor, FIELD_ACQUISITION_METHOD, FIELD_CREATION_DATE, FIELD_DEPARTMENT,
    FIELD_FISCAL_YEAR, FIELD_SUPPLIER, FIELD_TOTAL_PRICE,
};
use crate::store::{DocumentStore, InMemoryStore, MongoStore};
use crate::tools::create_default_registry;
use crate::Result;
use serde_json::Value;
use std::fmt::Write;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Canned shortcuts for presentation layers: `(label, question)`.
pub const QUICK_QUESTIONS: &[(&str, &str)] = &[
    (
        "Total spending by year",
        "What was the total spending for each fiscal year?",
    ),
    (
        "Highest spending quarter",
        "Which quarter had the highest spending across all years?",
    ),
    (
        "Top 5 items ordered",
        "What are the top 5 most frequently ordered items?",
    ),
    (
        "Top 10 departments",
        "Which are the top 10 departments by total spending?",
    ),
];

const INDEXED_FIELDS: &[&str] = &[
    FIELD_CREATION_DATE,
    FIELD_FISCAL_YEAR,
    FIELD_DEPARTMENT,
    FIELD_SUPPLIER,
    FIELD_ACQUISITION_METHOD,
    FIELD_TOTAL_PRICE,
];

const APOLOGY: &str = "I'm sorry, I ran into a problem answering that question";

/// Bounded decide/observe cycle for a single question
pub struct ReasoningLoop {
    engine: Arc<ExecutionEngine>,
    reasoner: Arc<dyn Reasoner>,
    schema: Arc<SchemaDescriptor>,
    max_iterations: usize,
}

impl ReasoningLoop {
    pub fn new(
        engine: Arc<ExecutionEngine>,
        reasoner: Arc<dyn Reasoner>,
        schema: Arc<SchemaDescriptor>,
        max_iterations: usize,
    ) -> Self {
        Self {
            engine,
            reasoner,
            schema,
            max_iterations,
        }
    }

    /// Answer `question` given prior `history` (oldest first). Never fails:
    /// unrecovered problems become an apology with `Termination::Failed`.
    pub async fn run_turn(&self, question: &str, history: &[Turn]) -> TurnReport {
        let start = Instant::now();
        let catalog = self.engine.registry().catalog();
        let mut observations: Vec<Observation> = Vec::new();
        let mut trace = vec![format!("INPUT: {}", question)];

        info!(history = history.len(), "Reasoning loop: starting turn");

        loop {
            let tools_allowed = observations.len() < self.max_iterations;
            let decided = {
                let ctx = ReasoningContext {
                    question,
                    schema: &self.schema,
                    history,
                    observations: &observations,
                    tools_allowed,
                    tool_catalog: catalog.clone(),
                };
                self.reasoner.decide(&ctx).await
            };

            let decision = match decided {
                Ok(decision) => decision,
                Err(e) => {
                    error!(error = %e, "Reasoner failed");
                    trace.push(format!("FAILED: reasoner error: {}", e));
                    return finish(
                        format!("{}: {}", APOLOGY, e),
                        Termination::Failed,
                        &observations,
                        trace,
                        start,
                    );
                }
            };

            match decision {
                Decision::Answer(text) if !text.trim().is_empty() => {
                    trace.push("COMPLETE: answer emitted".to_string());
                    return finish(text, Termination::Answered, &observations, trace, start);
                }
                Decision::Answer(_) => {
                    warn!("Reasoner returned an empty answer");
                    trace.push("COMPLETE: empty answer replaced".to_string());
                    return finish(
                        fallback_answer(&observations),
                        Termination::Answered,
                        &observations,
                        trace,
                        start,
                    );
                }
                Decision::Invoke { tool, payload } if tools_allowed => {
                    debug!(tool = %tool, step = observations.len() + 1, "Decided to invoke tool");
                    trace.push(format!("DECIDE: {} (step {})", tool, observations.len() + 1));

                    let observation = self.engine.invoke(&tool, &payload).await;
                    trace.push(format!(
                        "OBSERVE: {} {} in {} ms",
                        observation.tool_name,
                        observation.status,
                        observation.execution_time_ms
                    ));

                    if observation.status == ExecutionStatus::Aborted {
                        let reason = observation
                            .output
                            .get("error")
                            .and_then(Value::as_str)
                            .unwrap_or("the data store is unavailable")
                            .to_string();
                        observations.push(observation);
                        trace.push("FAILED: tool aborted".to_string());
                        return finish(
                            format!("{}: {}. Please try again later.", APOLOGY, reason),
                            Termination::Failed,
                            &observations,
                            trace,
                            start,
                        );
                    }
                    observations.push(observation);
                }
                Decision::Invoke { tool, .. } => {
                    warn!(tool = %tool, budget = self.max_iterations, "Tool budget exhausted");
                    trace.push("BUDGET: tool requested after budget exhausted".to_string());
                    let answer = format!(
                        "I reached the limit of {} queries for this question. {}",
                        self.max_iterations,
                        fallback_answer(&observations)
                    );
                    return finish(
                        answer,
                        Termination::BudgetExhausted,
                        &observations,
                        trace,
                        start,
                    );
                }
            }
        }
    }
}

fn finish(
    answer: String,
    termination: Termination,
    observations: &[Observation],
    trace: Vec<String>,
    start: Instant,
) -> TurnReport {
    info!(
        %termination,
        tool_calls = observations.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Reasoning loop: turn complete"
    );
    TurnReport {
        answer,
        termination,
        tool_calls: observations.len(),
        trace,
    }
}

/// Best effort from the last successful observation.
fn fallback_answer(observations: &[Observation]) -> String {
    let Some(last) = observations.iter().rev().find(|o| o.is_success()) else {
        return "Sorry, I couldn't find an answer to that question with the available data."
            .to_string();
    };

    let count = last.output.get("count").and_then(Value::as_u64).unwrap_or(0);
    let rows = last
        .output
        .get("results")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    if count == 0 || rows.is_empty() {
        return "The last query I ran returned no results.".to_string();
    }

    let mut out = format!("The last query I ran returned {} result(s):", count);
    for row in rows {
        let _ = write!(out, "\n- {}", row);
    }
    if let Some(note) = last.output.get("note").and_then(Value::as_str).filter(|n| !n.is_empty()) {
        let _ = write!(out, "\n({})", note);
    }
    out
}

/// The live database when `MONGODB_URI` is set, the snapshot otherwise.
async fn open_store(config: &AppConfig) -> Result<Arc<dyn DocumentStore>> {
    match &config.mongodb_uri {
        Some(uri) => {
            let store = MongoStore::connect(
                uri,
                config.database.clone(),
                config.collection.clone(),
                config.query_timeout,
            )
            .await?;
            info!(database = %config.database, collection = %config.collection, "Using MongoDB store");
            Ok(Arc::new(store))
        }
        None => {
            let store = InMemoryStore::open(&config.data_path, config.collection.clone())?;
            info!(
                path = %config.data_path.display(),
                collection = %config.collection,
                records = store.len(),
                "Using snapshot store"
            );
            Ok(Arc::new(store))
        }
    }
}

/// Shared per-process resources; sessions are cheap handles onto them.
pub struct AssistantCore {
    config: AppConfig,
    store: Arc<dyn DocumentStore>,
    executor: Arc<QueryExecutor>,
    engine: Arc<ExecutionEngine>,
    reasoner: Arc<dyn Reasoner>,
    schema: Arc<SchemaDescriptor>,
}

impl AssistantCore {
    /// Open the store, verify it responds, index the hot fields and build
    /// the Gemini-backed reasoner. Fails fast on a missing credential or an
    /// unreachable store.
    pub async fn from_config(config: AppConfig) -> Result<Self> {
        let client = GeminiClient::new(
            config.gemini_api_key.clone(),
            config.model.clone(),
            config.temperature,
        )?;

        let store = open_store(&config).await?;
        store.ping().await?;

        for field in INDEXED_FIELDS {
            if let Err(e) = store.create_index(field).await {
                warn!(field, error = %e, "Could not create index");
            }
        }

        Ok(Self::with_reasoner(
            config,
            store,
            Arc::new(GeminiReasoner::new(client)),
        ))
    }

    pub fn with_reasoner(
        config: AppConfig,
        store: Arc<dyn DocumentStore>,
        reasoner: Arc<dyn Reasoner>,
    ) -> Self {
        let executor = Arc::new(QueryExecutor::new(Arc::clone(&store), config.query_timeout));
        let registry =
            create_default_registry(Arc::clone(&executor), config.result_limit, config.preview_rows);
        let schema = Arc::new(SchemaDescriptor::purchase_orders(store.collection()));

        Self {
            store,
            executor,
            engine: Arc::new(ExecutionEngine::new(registry)),
            reasoner,
            schema,
            config,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn schema(&self) -> &SchemaDescriptor {
        &self.schema
    }

    pub fn executor(&self) -> &Arc<QueryExecutor> {
        &self.executor
    }

    /// A fresh session with its own conversation state.
    pub fn session(&self) -> ProcurementAssistant {
        let reasoning = ReasoningLoop::new(
            Arc::clone(&self.engine),
            Arc::clone(&self.reasoner),
            Arc::clone(&self.schema),
            self.config.max_iterations,
        );
        ProcurementAssistant::new(reasoning, self.config.history_turns)
    }

    pub fn explorer(&self) -> DatasetExplorer {
        DatasetExplorer::new(Arc::clone(&self.executor), self.config.result_limit)
    }

    /// Close the shared store handle.
    pub async fn shutdown(&self) -> Result<()> {
        self.store.close().await
    }
}

/// One interactive session: a reasoning loop plus its own history
pub struct ProcurementAssistant {
    reasoning: ReasoningLoop,
    conversation: ConversationState,
    history_turns: usize,
    last_report: Option<TurnReport>,
}

impl ProcurementAssistant {
    pub fn new(reasoning: ReasoningLoop, history_turns: usize) -> Self {
        Self {
            reasoning,
            conversation: ConversationState::new(history_turns),
            history_turns,
            last_report: None,
        }
    }

    /// Answer one question. Both the question and the answer are recorded,
    /// including when the turn fails.
    pub async fn answer_question(&mut self, question: &str) -> String {
        self.ask(question).await.answer
    }

    /// Like `answer_question`, returning the full turn report.
    pub async fn ask(&mut self, question: &str) -> TurnReport {
        let history = self.conversation.window(self.history_turns);
        let report = self.reasoning.run_turn(question, &history).await;

        self.conversation.append(Turn::user(question));
        self.conversation.append(Turn::assistant(report.answer.clone()));
        self.last_report = Some(report.clone());
        report
    }

    pub fn reset_conversation(&mut self) {
        self.conversation.reset();
        self.last_report = None;
        info!("Conversation reset");
    }

    pub fn conversation(&self) -> &ConversationState {
        &self.conversation
    }

    pub fn last_report(&self) -> Option<&TurnReport> {
        self.last_report.as_ref()
    }
}
