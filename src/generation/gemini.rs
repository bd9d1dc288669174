//! Google Gemini `streamGenerateContent`, streamed over SSE.
//!
//! Gemini differs from the OpenAI shape in two ways: assistant turns use
//! the role `"model"`, and the system prompt travels in a top-level
//! `system_instruction` instead of a message.

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::GenerationConfig;
use crate::models::{Role, StreamEvent};

use super::{
    error_message, forward_sse, http_client, parse_chunk, read_api_key, send_or_cancel,
    GenerationError, GenerationProvider, GenerationRequest, DEFAULT_SYSTEM_PROMPT,
};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiGenerator {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    system_prompt: String,
    temperature: Option<f32>,
}

impl GeminiGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self, GenerationError> {
        let api_key = read_api_key(config)?;
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(config: &GenerationConfig, api_key: String) -> Result<Self, GenerationError> {
        Ok(Self {
            client: http_client(config)?,
            base_url: config
                .base_url
                .as_deref()
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model: config
                .model
                .clone()
                .unwrap_or_else(|| "gemini-2.0-flash".to_string()),
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            temperature: config.temperature,
        })
    }

    fn request_body(&self, request: &GenerationRequest) -> Value {
        let system = request.system.as_deref().unwrap_or(&self.system_prompt);
        let mut contents: Vec<Value> = request
            .history
            .iter()
            .map(|turn| {
                let role = match turn.role {
                    Role::User => "user",
                    Role::Assistant => "model",
                };
                json!({"role": role, "parts": [{"text": turn.content}]})
            })
            .collect();
        contents.push(json!({"role": "user", "parts": [{"text": request.prompt}]}));

        let mut body = json!({
            "contents": contents,
            "system_instruction": {"parts": [{"text": system}]},
        });
        if let Some(temperature) = self.temperature {
            body["generationConfig"] = json!({"temperature": temperature});
        }
        body
    }
}

/// One streamed candidate: its text and, on the final chunk, why it stopped.
#[derive(Debug, Default, PartialEq)]
struct CandidateChunk {
    text: String,
    finish_reason: Option<String>,
}

/// Concatenates the text parts of the first candidate.
fn candidate_chunk(data: &str) -> Result<Option<CandidateChunk>, GenerationError> {
    let Some(value) = parse_chunk(data) else {
        return Ok(None);
    };
    if let Some(message) = error_message(&value) {
        return Err(GenerationError::Stream(message));
    }
    let candidate = value.get("candidates").and_then(|c| c.get(0));
    let text: String = candidate
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect()
        })
        .unwrap_or_default();
    let finish_reason = candidate
        .and_then(|c| c.get("finishReason"))
        .and_then(|r| r.as_str())
        .filter(|r| !r.is_empty())
        .map(str::to_string);
    Ok(Some(CandidateChunk {
        text,
        finish_reason,
    }))
}

#[async_trait]
impl GenerationProvider for GeminiGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn stream(
        &self,
        request: GenerationRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), GenerationError> {
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.base_url, self.model
        );
        debug!(model = self.model.as_str(), "sending Gemini streaming request");

        let http = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&self.request_body(&request));
        let response = send_or_cancel(http, &tx).await?;

        // No sentinel: the last chunk must carry a finish reason.
        let mut finish_reason: Option<String> = None;
        forward_sse(response, &tx, |data| {
            let Some(chunk) = candidate_chunk(data)? else {
                return Ok(None);
            };
            finish_reason = chunk.finish_reason;
            Ok(Some(chunk.text))
        })
        .await?;

        match finish_reason {
            Some(reason) => {
                debug!(reason = reason.as_str(), "Gemini stream finished");
                Ok(())
            }
            None => Err(GenerationError::Stream(
                "stream ended without a finish reason".to_string(),
            )),
        }
    }
}
