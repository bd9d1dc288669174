//! Streaming answer generation.
//!
//! [`answer`] turns a question, its conversation history and an assembled
//! context into a channel of [`StreamEvent`]s. A producer task drives the
//! [`GenerationProvider`], which pushes `Token`s as fragments arrive; the
//! task then closes the stream with exactly one `Done` or `Failed`.
//!
//! Dropping the receiver cancels generation: providers wait on
//! `Sender::closed()` alongside the network read, so an abandoned stream
//! stops pulling bytes and releases its connection right away.
//!
//! | Provider | Endpoint |
//! |----------|----------|
//! | [`OpenAIGenerator`] | `POST {base}/chat/completions`, SSE, `[DONE]` sentinel |
//! | [`GeminiGenerator`] | `POST {base}/models/{model}:streamGenerateContent?alt=sse` |
//! | [`DisabledGenerator`] | none; every request fails |

mod gemini;
mod openai;

pub use gemini::GeminiGenerator;
pub use openai::OpenAIGenerator;

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::GenerationConfig;
use crate::models::{ChatMessage, StreamEvent};

/// Capacity of the answer channel.
const STREAM_BUFFER: usize = 64;

/// Instructions placed before retrieved sources.
pub const CONTEXT_PREAMBLE: &str = "Answer the question using the course knowledge below. \
Cite sources as [Source N] when you rely on them. If the sources do not cover the question, \
say so instead of guessing.\n\n";

/// Instructions used when retrieval found nothing relevant.
pub const NO_CONTEXT_PREAMBLE: &str = "No course knowledge matched this question. \
Answer from general knowledge if you can, and tell the user that the course materials \
did not cover it.";

/// System prompt used when the configuration does not set one.
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful teaching assistant for an online course. Be accurate and concise.";

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("environment variable {0} is not set")]
    MissingApiKey(String),
    #[error("generation request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("generation provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("generation stream interrupted: {0}")]
    Stream(String),
    #[error("stream cancelled by consumer")]
    Cancelled,
    #[error("generation provider is disabled")]
    Disabled,
}

/// Everything a provider needs for one completion.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    /// Overrides the provider's configured system prompt.
    pub system: Option<String>,
    /// Prior turns, oldest first. Never includes the current question.
    pub history: Vec<ChatMessage>,
    /// The final user turn: instructions, sources and the question.
    pub prompt: String,
}

/// Builds the final user turn from the question and assembled context.
pub fn build_prompt(query: &str, context: &str) -> String {
    if context.is_empty() {
        format!("{}\n\nQuestion: {}", NO_CONTEXT_PREAMBLE, query)
    } else {
        format!("{}{}\n\nQuestion: {}", CONTEXT_PREAMBLE, context, query)
    }
}

#[async_trait]
pub trait GenerationProvider: Send + Sync {
    fn model_name(&self) -> &str;

    /// Streams the completion for `request` into `tx`.
    ///
    /// Returns `Err(Cancelled)` once `tx` is closed. Must not send a
    /// terminal event; [`answer`] does that.
    async fn stream(
        &self,
        request: GenerationRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), GenerationError>;
}

/// Starts generating an answer and returns its event stream.
pub fn answer(
    provider: Arc<dyn GenerationProvider>,
    query: &str,
    history: Vec<ChatMessage>,
    context: &str,
) -> mpsc::Receiver<StreamEvent> {
    let request = GenerationRequest {
        system: None,
        history,
        prompt: build_prompt(query, context),
    };
    answer_request(provider, request)
}

/// Like [`answer`], for a request that is already assembled.
pub fn answer_request(
    provider: Arc<dyn GenerationProvider>,
    request: GenerationRequest,
) -> mpsc::Receiver<StreamEvent> {
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    tokio::spawn(async move {
        match provider.stream(request, tx.clone()).await {
            Ok(()) => {
                let _ = tx.send(StreamEvent::Done).await;
            }
            Err(GenerationError::Cancelled) => {
                debug!(model = provider.model_name(), "answer stream abandoned");
            }
            Err(e) => {
                warn!(model = provider.model_name(), error = %e, "answer generation failed");
                let _ = tx.send(StreamEvent::Failed(e.to_string())).await;
            }
        }
    });
    rx
}

/// Generator used when `generation.provider = "disabled"`.
pub struct DisabledGenerator;

#[async_trait]
impl GenerationProvider for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn stream(
        &self,
        _request: GenerationRequest,
        _tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), GenerationError> {
        Err(GenerationError::Disabled)
    }
}

/// Instantiates the configured generation provider.
pub fn create_generator(
    config: &GenerationConfig,
) -> Result<Arc<dyn GenerationProvider>, GenerationError> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAIGenerator::new(config)?)),
        "gemini" => Ok(Arc::new(GeminiGenerator::new(config)?)),
        _ => Ok(Arc::new(DisabledGenerator)),
    }
}

pub(crate) fn read_api_key(config: &GenerationConfig) -> Result<String, GenerationError> {
    std::env::var(&config.api_key_env)
        .ok()
        .filter(|k| !k.is_empty())
        .ok_or_else(|| GenerationError::MissingApiKey(config.api_key_env.clone()))
}

pub(crate) fn http_client(config: &GenerationConfig) -> Result<reqwest::Client, GenerationError> {
    Ok(reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(config.connect_timeout_secs))
        .build()?)
}

/// Sends `request`, giving up as soon as the consumer goes away.
pub(crate) async fn send_or_cancel(
    request: reqwest::RequestBuilder,
    tx: &mpsc::Sender<StreamEvent>,
) -> Result<reqwest::Response, GenerationError> {
    let response = tokio::select! {
        _ = tx.closed() => return Err(GenerationError::Cancelled),
        response = request.send() => response?,
    };

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(GenerationError::Http {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response)
}

/// Reads an SSE body line by line, passing each `data:` payload to
/// `on_data` and forwarding the text it returns as a token.
///
/// A `[DONE]` payload ends the stream. Comment and `event:` lines are
/// ignored. Lines are split on raw bytes so multi-byte characters cut
/// across network chunks survive.
///
/// Returns how the body ended; the caller decides whether a bare EOF
/// counts as a complete answer.
pub(crate) async fn forward_sse<F>(
    response: reqwest::Response,
    tx: &mpsc::Sender<StreamEvent>,
    mut on_data: F,
) -> Result<SseEnd, GenerationError>
where
    F: FnMut(&str) -> Result<Option<String>, GenerationError> + Send,
{
    let mut byte_stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();

    loop {
        let next = tokio::select! {
            _ = tx.closed() => return Err(GenerationError::Cancelled),
            next = byte_stream.next() => next,
        };
        let Some(chunk) = next else { break };
        let chunk = chunk.map_err(|e| GenerationError::Stream(e.to_string()))?;
        buffer.extend_from_slice(&chunk);

        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            if handle_sse_line(&line, tx, &mut on_data).await? == SseFlow::Finished {
                return Ok(SseEnd::Sentinel);
            }
        }
    }

    if !buffer.is_empty()
        && handle_sse_line(&buffer, tx, &mut on_data).await? == SseFlow::Finished
    {
        return Ok(SseEnd::Sentinel);
    }
    Ok(SseEnd::Eof)
}

/// How an SSE body ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SseEnd {
    /// A `data: [DONE]` line was read.
    Sentinel,
    /// The connection closed without a sentinel.
    Eof,
}

#[derive(Debug, PartialEq, Eq)]
enum SseFlow {
    Continue,
    Finished,
}

async fn handle_sse_line<F>(
    raw: &[u8],
    tx: &mpsc::Sender<StreamEvent>,
    on_data: &mut F,
) -> Result<SseFlow, GenerationError>
where
    F: FnMut(&str) -> Result<Option<String>, GenerationError> + Send,
{
    let line = String::from_utf8_lossy(raw);
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(SseFlow::Continue);
    };
    let data = data.trim_start();
    if data == "[DONE]" {
        return Ok(SseFlow::Finished);
    }

    if let Some(token) = on_data(data)?.filter(|t| !t.is_empty()) {
        tx.send(StreamEvent::Token(token))
            .await
            .map_err(|_| GenerationError::Cancelled)?;
    }
    Ok(SseFlow::Continue)
}

/// Parses one SSE JSON payload, logging and skipping malformed chunks.
pub(crate) fn parse_chunk(data: &str) -> Option<serde_json::Value> {
    match serde_json::from_str(data) {
        Ok(value) => Some(value),
        Err(e) => {
            let preview: String = data.chars().take(200).collect();
            warn!(error = %e, data_preview = preview.as_str(), "skipping malformed stream chunk");
            None
        }
    }
}

/// Extracts `error.message` from a provider error payload.
pub(crate) fn error_message(value: &serde_json::Value) -> Option<String> {
    let error = value.get("error")?;
    Some(
        error
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
    )
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[test]
    fn prompt_with_context() {
        let prompt = build_prompt("When is it due?", "[Source 1: Syllabus]\nFriday");
        assert!(prompt.starts_with(CONTEXT_PREAMBLE));
        assert!(prompt.contains("[Source 1: Syllabus]\nFriday"));
        assert!(prompt.ends_with("\n\nQuestion: When is it due?"));
    }

    #[test]
    fn prompt_without_context() {
        let prompt = build_prompt("Anything?", "");
        assert_eq!(prompt, format!("{NO_CONTEXT_PREAMBLE}\n\nQuestion: Anything?"));
        assert!(!prompt.contains(CONTEXT_PREAMBLE));
    }

    #[tokio::test]
    async fn tokens_then_done() {
        let provider = Arc::new(ScriptedGenerator::new(&["Hel", "lo"], Outcome::Finish));
        let history = vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")];
        let events = collect(answer(provider.clone(), "q", history.clone(), "ctx")).await;
        assert_eq!(
            events,
            vec![
                StreamEvent::Token("Hel".into()),
                StreamEvent::Token("lo".into()),
                StreamEvent::Done
            ]
        );
        let seen = provider.seen.lock().unwrap();
        assert_eq!(seen[0].history, history);
        assert!(seen[0].prompt.ends_with("Question: q"));
    }

    #[tokio::test]
    async fn failure_follows_partial_output() {
        let provider = Arc::new(ScriptedGenerator::new(
            &["partial"],
            Outcome::Fail("connection reset".into()),
        ));
        let events = collect(answer(provider, "q", Vec::new(), "")).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], StreamEvent::Token("partial".into()));
        match &events[1] {
            StreamEvent::Failed(msg) => assert!(msg.contains("connection reset")),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropping_the_receiver_stops_the_producer() {
        let (signal_tx, signal_rx) = oneshot::channel();
        let provider = ScriptedGenerator::new(&["first"], Outcome::Hang);
        *provider.closed.lock().unwrap() = Some(signal_tx);

        let mut rx = answer(Arc::new(provider), "q", Vec::new(), "");
        assert_eq!(rx.recv().await, Some(StreamEvent::Token("first".into())));
        drop(rx);

        tokio::time::timeout(Duration::from_secs(2), signal_rx)
            .await
            .expect("producer did not observe cancellation")
            .unwrap();
    }

    #[tokio::test]
    async fn disabled_generator_fails_the_stream() {
        let events = collect(answer(Arc::new(DisabledGenerator), "q", Vec::new(), "")).await;
        assert!(matches!(events.as_slice(), [StreamEvent::Failed(_)]));
    }

    #[test]
    fn disabled_is_the_fallback_provider() {
        let generator = create_generator(&GenerationConfig::default()).unwrap();
        assert_eq!(generator.model_name(), "disabled");
    }

    #[test]
    fn missing_api_key_is_reported() {
        let config = GenerationConfig {
            provider: "openai".into(),
            model: Some("gpt-4o-mini".into()),
            api_key_env: "CRAG_TEST_KEY_THAT_IS_NEVER_SET".into(),
            ..Default::default()
        };
        assert!(matches!(
            create_generator(&config),
            Err(GenerationError::MissingApiKey(var)) if var == "CRAG_TEST_KEY_THAT_IS_NEVER_SET"
        ));
    }
}
