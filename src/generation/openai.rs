//! OpenAI-compatible chat completions, streamed over SSE.

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::GenerationConfig;
use crate::models::{Role, StreamEvent};

use super::{
    error_message, forward_sse, http_client, parse_chunk, read_api_key, send_or_cancel, SseEnd,
    GenerationError, GenerationProvider, GenerationRequest, DEFAULT_SYSTEM_PROMPT,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAIGenerator {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    system_prompt: String,
    temperature: Option<f32>,
}

impl OpenAIGenerator {
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
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            temperature: config.temperature,
        })
    }

    fn request_body(&self, request: &GenerationRequest) -> Value {
        let system = request.system.as_deref().unwrap_or(&self.system_prompt);
        let mut messages = vec![json!({"role": "system", "content": system})];
        for turn in &request.history {
            let role = match turn.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            messages.push(json!({"role": role, "content": turn.content}));
        }
        messages.push(json!({"role": "user", "content": request.prompt}));

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
        });
        if let Some(temperature) = self.temperature {
            body["temperature"] = json!(temperature);
        }
        body
    }
}

/// Pulls `choices[0].delta.content` out of one chunk.
fn delta_content(data: &str) -> Result<Option<String>, GenerationError> {
    let Some(value) = parse_chunk(data) else {
        return Ok(None);
    };
    if let Some(message) = error_message(&value) {
        return Err(GenerationError::Stream(message));
    }
    Ok(value
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_string))
}

#[async_trait]
impl GenerationProvider for OpenAIGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn stream(
        &self,
        request: GenerationRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), GenerationError> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!(model = self.model.as_str(), "sending streaming chat request");

        let http = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(&request));
        let response = send_or_cancel(http, &tx).await?;
        match forward_sse(response, &tx, delta_content).await? {
            SseEnd::Sentinel => Ok(()),
            SseEnd::Eof => Err(GenerationError::Stream(
                "stream ended before [DONE]".to_string(),
            )),
        }
    }
}
