//! Query-time orchestration: question → embedding → search → context → answer.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::Config;
use crate::context::build_context_bounded;
use crate::db;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::generation::{
    answer_request, build_prompt, create_generator, GenerationProvider, GenerationRequest,
};
use crate::index::{IndexError, RetrievalProfile, SqliteIndex, VectorIndex};
use crate::models::{ChatMessage, SearchResult, StreamEvent};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("question is empty")]
    EmptyQuery,
    #[error("failed to embed question: {0}")]
    Embedding(String),
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Retrieved sources plus the context string built from them.
#[derive(Debug, Clone)]
pub struct Retrieval {
    pub results: Vec<SearchResult>,
    pub context: String,
}

pub struct RagPipeline {
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
    generator: Arc<dyn GenerationProvider>,
    max_context_chars: usize,
    system_prompt: Option<String>,
}

impl RagPipeline {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
        generator: Arc<dyn GenerationProvider>,
    ) -> Self {
        Self {
            embedder,
            index,
            generator,
            max_context_chars: usize::MAX,
            system_prompt: None,
        }
    }

    pub fn with_max_context_chars(mut self, max_chars: usize) -> Self {
        self.max_context_chars = max_chars;
        self
    }

    pub fn with_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.system_prompt = prompt;
        self
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    /// Embeds `query` and returns the matches allowed by `profile`.
    pub async fn search(
        &self,
        query: &str,
        profile: RetrievalProfile,
    ) -> Result<Vec<SearchResult>, PipelineError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(PipelineError::EmptyQuery);
        }
        let vector = self
            .embedder
            .embed(query)
            .await
            .map_err(|e| PipelineError::Embedding(format!("{:#}", e)))?;
        let results = self
            .index
            .search(&vector, profile.threshold, profile.top_k)
            .await?;
        debug!(
            hits = results.len(),
            threshold = profile.threshold,
            top_k = profile.top_k,
            "retrieved sources"
        );
        Ok(results)
    }

    /// Runs [`search`](Self::search) and assembles the context string.
    pub async fn retrieve(
        &self,
        query: &str,
        profile: RetrievalProfile,
    ) -> Result<Retrieval, PipelineError> {
        let results = self.search(query, profile).await?;
        let context = build_context_bounded(&results, self.max_context_chars);
        Ok(Retrieval { results, context })
    }

    /// Answers `message` as a stream.
    ///
    /// Retrieval errors are returned before any event is produced; once the
    /// stream starts, failures arrive as [`StreamEvent::Failed`].
    pub async fn ask(
        &self,
        message: &str,
        history: Vec<ChatMessage>,
        profile: RetrievalProfile,
    ) -> Result<(Retrieval, mpsc::Receiver<StreamEvent>), PipelineError> {
        let retrieval = self.retrieve(message, profile).await?;
        info!(
            sources = retrieval.results.len(),
            model = self.generator.model_name(),
            "answering question"
        );
        let request = GenerationRequest {
            system: self.system_prompt.clone(),
            history,
            prompt: build_prompt(message.trim(), &retrieval.context),
        };
        let rx = answer_request(Arc::clone(&self.generator), request);
        Ok((retrieval, rx))
    }
}

/// Builds the pipeline described by `config` over the SQLite index.
pub async fn open_pipeline(config: &Config) -> anyhow::Result<RagPipeline> {
    let embedder = create_provider(&config.embedding)?;
    let generator = create_generator(&config.generation)?;
    let pool = db::connect(config).await?;
    let index = SqliteIndex::open(pool)
        .await?
        .with_model(embedder.model_name());

    Ok(RagPipeline::new(embedder, Arc::new(index), generator)
        .with_max_context_chars(config.retrieval.max_context_chars)
        .with_system_prompt(config.generation.system_prompt.clone()))
}
