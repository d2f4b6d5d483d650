//! Gemini API client
//!
//! Uses a long-lived reqwest::Client for connection pooling. One call per
//! reasoning step: system instruction plus the running conversation.

use crate::error::AssistantError;
use crate::memory::{MessageRole, Turn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info};

const API_ROOT: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// One message of the multi-turn request
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub text: String,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            text: text.into(),
        }
    }
}

impl From<&Turn> for ChatMessage {
    fn from(turn: &Turn) -> Self {
        Self {
            role: turn.role,
            text: turn.content.clone(),
        }
    }
}

/// Reusable Gemini client (connection-pooled)
pub struct GeminiClient {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    temperature: f32,
}

impl GeminiClient {
    pub fn new(api_key: String, model: String, temperature: f32) -> crate::Result<Self> {
        if api_key.trim().is_empty() {
            return Err(AssistantError::Configuration(
                "GEMINI_API_KEY not configured".to_string(),
            ));
        }

        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            client,
            api_key,
            base_url: format!("{}/{}:generateContent", API_ROOT, model),
            model,
            temperature,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Generate the next model message. Returns the text and a heuristic
    /// confidence in `[0.5, 0.98]`.
    pub async fn generate(
        &self,
        system: &str,
        messages: &[ChatMessage],
    ) -> crate::Result<(String, f32)> {
        let request = build_request(system, messages, self.temperature);
        let url = format!("{}?key={}", self.base_url, self.api_key);

        debug!(model = %self.model, messages = messages.len(), "Calling Gemini API");

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!("Gemini API request failed: {}", e);
                AssistantError::Llm(format!("Gemini API error: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!(%status, "Gemini API error response: {}", error_text);
            return Err(AssistantError::Llm(format!(
                "Gemini API error ({}): {}",
                status, error_text
            )));
        }

        let gemini_response: GeminiResponse = response.json().await.map_err(|e| {
            error!("Failed to parse Gemini response: {}", e);
            AssistantError::Llm(format!("Gemini parse error: {}", e))
        })?;

        let answer = extract_text(&gemini_response)?;
        let confidence = calculate_confidence(&gemini_response);

        info!(confidence, "Gemini response received");

        Ok((answer, confidence))
    }
}

fn build_request(system: &str, messages: &[ChatMessage], temperature: f32) -> GeminiRequest {
    GeminiRequest {
        contents: messages
            .iter()
            .map(|m| Content {
                role: Some(
                    match m.role {
                        MessageRole::User => "user",
                        MessageRole::Assistant => "model",
                    }
                    .to_string(),
                ),
                parts: vec![Part {
                    text: m.text.clone(),
                }],
            })
            .collect(),
        generation_config: GenerationConfig {
            temperature,
            top_p: 0.9,
            top_k: 40,
            max_output_tokens: 2048,
        },
        system_instruction: SystemInstruction {
            parts: vec![Part {
                text: system.to_string(),
            }],
        },
    }
}

fn extract_text(response: &GeminiResponse) -> crate::Result<String> {
    let candidate = response
        .candidates
        .first()
        .ok_or_else(|| AssistantError::Llm("No response from Gemini API".to_string()))?;

    let text: String = candidate
        .content
        .parts
        .iter()
        .map(|p| p.text.as_str())
        .collect();

    if text.trim().is_empty() {
        return Err(AssistantError::Llm("Empty response from Gemini".to_string()));
    }
    Ok(text)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
    system_instruction: SystemInstruction,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    max_output_tokens: i32,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Content,
    finish_reason: Option<String>,
}

/// Calculate response confidence
fn calculate_confidence(response: &GeminiResponse) -> f32 {
    let Some(candidate) = response.candidates.first() else {
        return 0.5;
    };

    let base_confidence: f32 = 0.85;

    let finish_confidence = match candidate.finish_reason.as_deref() {
        Some("STOP") => 1.0,
        Some("MAX_TOKENS") => 0.8,
        Some("SAFETY") => 0.6,
        _ => 0.7,
    };

    let response_length = candidate.content.parts.first().map(|p| p.text.len()).unwrap_or(0);

    let length_confidence = if response_length < 20 {
        0.6
    } else if response_length > 4000 {
        0.8
    } else {
        1.0
    };

    (base_confidence * finish_confidence * length_confidence).clamp(0.5, 0.98)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let messages = vec![
            ChatMessage::user("What was the total spending?"),
            ChatMessage::assistant("$89.59B"),
            ChatMessage::user("And in 2013-2014?"),
        ];
        let request = build_request("You are a procurement analyst", &messages, 0.1);
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["contents"][1]["role"], "model");
        assert_eq!(json["contents"][2]["parts"][0]["text"], "And in 2013-2014?");
        assert_eq!(json["systemInstruction"]["parts"][0]["text"], "You are a procurement analyst");
        assert!(json["generationConfig"]["maxOutputTokens"].is_number());
    }

    #[test]
    fn test_response_parsing_and_confidence() {
        let raw = r#"{
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "{\"final_answer\": \"$5.00K\"}"}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 10}
        }"#;
        let response: GeminiResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(extract_text(&response).unwrap(), "{\"final_answer\": \"$5.00K\"}");
        let confidence = calculate_confidence(&response);
        assert!((0.5..=0.98).contains(&confidence));
    }

    #[test]
    fn test_empty_candidates_is_llm_error() {
        let response: GeminiResponse = serde_json::from_str("{}").unwrap();
        assert!(matches!(extract_text(&response), Err(AssistantError::Llm(_))));
    }

    #[test]
    fn test_missing_key_rejected() {
        let result = GeminiClient::new(String::new(), "gemini-2.0-flash".into(), 0.1);
        assert!(matches!(result, Err(AssistantError::Configuration(_))));
    }
}
