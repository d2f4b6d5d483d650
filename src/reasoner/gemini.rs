//! Gemini-powered reasoner
//!
//! Routes high-confidence questions deterministically; everything else is
//! one Gemini call per step with the schema, tool catalog, history and this
//! turn's observations in the prompt.

use super::intent::{self, Intent};
use super::{Decision, Reasoner, ReasoningContext};
use crate::classifier::QueryClassifier;
use crate::llm::{ChatMessage, GeminiClient};
use crate::models::{ExecutionStatus, QueryMode};
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt::Write;
use tracing::{debug, info};

pub struct GeminiReasoner {
    client: GeminiClient,
}

impl GeminiReasoner {
    pub fn new(client: GeminiClient) -> Self {
        Self { client }
    }

    /// System instruction: role, schema, tools, formatting and reply shape.
    fn build_system_prompt(ctx: &ReasoningContext<'_>) -> String {
        let mut tools = String::new();
        for (name, description) in &ctx.tool_catalog {
            let _ = writeln!(tools, "### {}\n{}\n", name, description);
        }

        format!(
            r#"You are a data analyst answering questions about California state procurement (purchase orders, fiscal years 2012-2013 to 2014-2015).

You answer by querying the purchase order collection with the tools below, then explaining the result in plain language.

{schema}

AVAILABLE TOOLS:
{tools}
FORMATTING RULES FOR MONEY:
- Billions: $89.59B. Millions: $125.50M. Ten thousand and above: $15.20K.
- Below $10,000: full value with commas and two decimals, e.g. $5,432.50.
- Never print raw unformatted numbers such as 29990000000.0.

RESPONSE FORMAT:
Reply with exactly one JSON object and nothing else.
To run a query:
{{"action": "<tool name>", "input": <tool input as JSON>}}
To answer:
{{"final_answer": "<answer for the user>"}}

Rules:
- Use only the listed tools and the exact field names from the schema.
- If a tool returns an error, fix the query and try again.
- If a query returns no results, say so plainly instead of guessing.
- Base every number in the answer on a tool result from this conversation.
- Mention the fiscal year or other filters the answer covers."#,
            schema = ctx.schema.describe(),
            tools = tools,
        )
    }

    /// Current question plus everything gathered this turn.
    fn build_turn_message(ctx: &ReasoningContext<'_>) -> String {
        let mut out = String::new();
        let hint = match QueryClassifier::classify(ctx.question) {
            QueryMode::Pipeline => "aggregation",
            QueryMode::Lookup => "record lookup",
        };
        let _ = writeln!(out, "QUESTION: {}", ctx.question);
        let _ = writeln!(out, "(This looks like a {} question.)", hint);

        if !ctx.observations.is_empty() {
            let _ = writeln!(out, "\nTOOL CALLS SO FAR:");
            for (i, obs) in ctx.observations.iter().enumerate() {
                let status = match obs.status {
                    ExecutionStatus::Success => "ok",
                    ExecutionStatus::Failed => "error",
                    ExecutionStatus::Aborted => "aborted",
                };
                let _ = writeln!(
                    out,
                    "{}. {} [{}]\n   input: {}\n   result: {}",
                    i + 1,
                    obs.tool_name,
                    status,
                    obs.payload,
                    obs.output
                );
            }
        }

        if !ctx.tools_allowed {
            let _ = writeln!(
                out,
                "\nThe query budget for this question is used up. Do not request another tool. \
Reply with {{\"final_answer\": ...}} using the results above; if they are insufficient, say what is missing."
            );
        }
        out
    }

    fn build_messages(ctx: &ReasoningContext<'_>) -> Vec<ChatMessage> {
        let mut messages: Vec<ChatMessage> = ctx.history.iter().map(ChatMessage::from).collect();
        messages.push(ChatMessage::user(Self::build_turn_message(ctx)));
        messages
    }
}

#[async_trait]
impl Reasoner for GeminiReasoner {
    async fn decide(&self, ctx: &ReasoningContext<'_>) -> Result<Decision> {
        // Deterministic intent routing for high-confidence questions.
        match ctx.observations {
            [] if ctx.tools_allowed => {
                if let Some(intent) = Intent::route_in_context(ctx.question, ctx.history) {
                    info!(?intent, "Routed question to canned pipeline");
                    return Ok(intent.decision());
                }
            }
            [only] if only.is_success() => {
                if let Some(intent) = intent::routed(ctx.question, ctx.history, only) {
                    return Ok(Decision::Answer(intent.answer(&only.output)));
                }
            }
            _ => {}
        }

        let system = Self::build_system_prompt(ctx);
        let messages = Self::build_messages(ctx);

        let (response, confidence) = self.client.generate(&system, &messages).await?;
        debug!(confidence, "Reasoner response received");

        Ok(parse_decision(&response))
    }
}

/// Interpret a model reply. Anything that is not a recognizable action is
/// treated as the final answer text.
pub fn parse_decision(response: &str) -> Decision {
    let cleaned = response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let parsed = serde_json::from_str::<Value>(cleaned).ok().or_else(|| {
        let start = cleaned.find('{')?;
        let end = cleaned.rfind('}')?;
        (start < end)
            .then(|| serde_json::from_str::<Value>(&cleaned[start..=end]).ok())
            .flatten()
    });

    let Some(Value::Object(reply)) = parsed else {
        return Decision::Answer(cleaned.to_string());
    };

    if let Some(answer) = reply.get("final_answer") {
        return Decision::Answer(match answer {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        });
    }

    match reply.get("action").and_then(Value::as_str) {
        Some(tool) => {
            let payload = match reply.get("input") {
                Some(Value::String(raw)) => raw.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            };
            Decision::invoke(tool, payload)
        }
        None => Decision::Answer(cleaned.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Turn;
    use crate::models::Observation;
    use crate::schema::SchemaDescriptor;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn test_parse_fenced_action() {
        let raw = "```json\n{\"action\": \"run_aggregation\", \"input\": [{\"$count\": \"n\"}]}\n```";
        assert_eq!(
            parse_decision(raw),
            Decision::invoke("run_aggregation", r#"[{"$count":"n"}]"#)
        );
    }

    #[test]
    fn test_parse_answer_with_surrounding_text() {
        let raw = "Here you go:\n{\"final_answer\": \"Total spending was $29.99B.\"}\nThanks";
        assert_eq!(
            parse_decision(raw),
            Decision::Answer("Total spending was $29.99B.".to_string())
        );
    }

    #[test]
    fn test_parse_string_input_and_plain_text() {
        let raw = r#"{"action": "run_lookup", "input": "{\"query\": {}}"}"#;
        assert_eq!(parse_decision(raw), Decision::invoke("run_lookup", r#"{"query": {}}"#));
        assert_eq!(
            parse_decision("I could not find that."),
            Decision::Answer("I could not find that.".to_string())
        );
    }

    #[test]
    fn test_prompt_contents() {
        let schema = SchemaDescriptor::purchase_orders("purchase_orders");
        let history = vec![
            Turn::user("What was the total spending for each fiscal year?"),
            Turn::assistant("Total spending by fiscal year: ..."),
        ];
        let observations = vec![Observation {
            observation_id: Uuid::new_v4(),
            tool_name: "run_aggregation".to_string(),
            payload: "[{\"$match\": ".to_string(),
            output: json!({"error": "Invalid JSON format", "kind": "parse"}),
            status: ExecutionStatus::Failed,
            execution_time_ms: 0,
            created_at: Utc::now(),
        }];
        let ctx = ReasoningContext {
            question: "And for 2013-2014 only?",
            schema: &schema,
            history: &history,
            observations: &observations,
            tools_allowed: false,
            tool_catalog: vec![("run_aggregation", "Run an aggregation pipeline")],
        };

        let system = GeminiReasoner::build_system_prompt(&ctx);
        assert!(system.contains("### run_aggregation"));
        assert!(system.contains("$dateFromString"));
        assert!(system.contains("$89.59B"));

        let messages = GeminiReasoner::build_messages(&ctx);
        assert_eq!(messages.len(), 3);
        let last = &messages[2].text;
        assert!(last.contains("QUESTION: And for 2013-2014 only?"));
        assert!(last.contains("[error]"));
        assert!(last.contains("query budget"));
    }
}
