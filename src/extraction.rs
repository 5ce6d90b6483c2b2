//! Structured variable extraction
//!
//! Turns the recent transcript into typed variables using a chat-completions
//! model in JSON mode. The orchestrator treats every failure here as an
//! empty result, so errors carry a kind for logging but never stop a turn.

use crate::catalog::VariableSpec;
use crate::flow::ExtractedVars;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use thiserror::Error;

/// Extraction error with classification
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ExtractionError {
    pub kind: ExtractionErrorKind,
    pub message: String,
}

impl ExtractionError {
    pub fn new(kind: ExtractionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ExtractionErrorKind::Network, message)
    }

    pub fn api(message: impl Into<String>) -> Self {
        Self::new(ExtractionErrorKind::Api, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ExtractionErrorKind::Malformed, message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionErrorKind {
    /// Transport failure or timeout
    Network,
    /// Non-success status from the model endpoint
    Api,
    /// Response was not the JSON object we asked for
    Malformed,
}

/// Collaborator seam: transcript + variable specs -> key/value map.
#[async_trait]
pub trait VariableExtractor: Send + Sync {
    async fn extract(
        &self,
        specs: &[VariableSpec],
        transcript: &str,
        customer_name: &str,
    ) -> Result<ExtractedVars, ExtractionError>;
}

#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
}

impl ExtractorConfig {
    pub fn from_env() -> Self {
        Self {
            endpoint: std::env::var("EXTRACTOR_ENDPOINT")
                .unwrap_or_else(|_| "https://api.openai.com/v1/chat/completions".to_string()),
            api_key: std::env::var("EXTRACTOR_API_KEY").unwrap_or_default(),
            model: std::env::var("EXTRACTOR_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
        }
    }
}

/// Chat-completions extractor (OpenAI-compatible endpoint, JSON mode).
pub struct ChatExtractor {
    client: reqwest::Client,
    config: ExtractorConfig,
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

impl ChatExtractor {
    pub fn new(config: ExtractorConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self { client, config }
    }

    fn build_prompt(specs: &[VariableSpec], transcript: &str, customer_name: &str) -> String {
        let descriptions: Vec<Value> = specs
            .iter()
            .map(|spec| {
                json!({
                    "name": spec.name,
                    "type": spec.kind,
                    "description": spec.description,
                })
            })
            .collect();
        let specs_json =
            serde_json::to_string_pretty(&descriptions).unwrap_or_else(|_| "[]".to_string());

        format!(
            "Extract variables from the USER's messages in this transcript.\n\n\
             <transcript>\n{transcript}\n</transcript>\n\n\
             <variables_to_extract>\n{specs_json}\n</variables_to_extract>\n\n\
             <reference_info>\nCustomer name on file: {customer_name}\n</reference_info>\n\n\
             <critical_instructions>\n\
             - ONLY extract values that the USER explicitly stated in their messages\n\
             - DO NOT extract or guess values from context or reference info\n\
             - DO NOT hallucinate or infer values that weren't clearly spoken by the user\n\
             - If the user did not confirm something, the boolean should be false\n\
             - Return ONLY a valid JSON object with variable names as keys\n\
             - For boolean variables, use true/false (not strings)\n\
             - For dates the user DID provide, use YYYY-MM-DD format\n\
             - For string variables, use null if NOT explicitly stated by the user\n\
             </critical_instructions>\n\n\
             Return the JSON object:"
        )
    }

    /// Drop nulls and sentinel strings so downstream merges never see them.
    fn clean(raw: Map<String, Value>) -> ExtractedVars {
        let mut vars = ExtractedVars::new();
        for (key, value) in raw {
            match &value {
                Value::Null => continue,
                Value::String(s) if s == "N/A" || s == "null" => continue,
                _ => vars.insert(key, value),
            }
        }
        vars
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

#[async_trait]
impl VariableExtractor for ChatExtractor {
    async fn extract(
        &self,
        specs: &[VariableSpec],
        transcript: &str,
        customer_name: &str,
    ) -> Result<ExtractedVars, ExtractionError> {
        if specs.is_empty() {
            return Ok(ExtractedVars::new());
        }

        let body = json!({
            "model": self.config.model,
            "messages": [
                {
                    "role": "system",
                    "content": "You are a variable extraction assistant. Return only valid JSON with no additional text."
                },
                {
                    "role": "user",
                    "content": Self::build_prompt(specs, transcript, customer_name)
                }
            ],
            "temperature": 0,
            "max_tokens": 500,
            "response_format": {"type": "json_object"}
        });

        let start = std::time::Instant::now();
        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ExtractionError::network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ExtractionError::api(format!("status {status}: {text}")));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ExtractionError::malformed(e.to_string()))?;
        let content = parsed
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| ExtractionError::malformed("empty choices"))?;

        let raw: Map<String, Value> = serde_json::from_str(content)
            .map_err(|e| ExtractionError::malformed(format!("not a JSON object: {e}")))?;

        let vars = Self::clean(raw);
        tracing::debug!(
            duration_ms = %start.elapsed().as_millis(),
            extracted = vars.len(),
            "extraction completed"
        );
        Ok(vars)
    }
}
