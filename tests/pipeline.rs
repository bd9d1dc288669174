//! End-to-end retrieval and answering through the public library API.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use course_rag::chunk::chunk_markdown;
use course_rag::config::{ChunkingConfig, IngestConfig};
use course_rag::db;
use course_rag::embedding::{EmbeddingProvider, HashedProvider};
use course_rag::generation::{
    GenerationError, GenerationProvider, GenerationRequest, CONTEXT_PREAMBLE, NO_CONTEXT_PREAMBLE,
};
use course_rag::index::{InMemoryIndex, RetrievalProfile, SqliteIndex, VectorIndex};
use course_rag::ingest::ingest_directory;
use course_rag::models::StreamEvent;
use course_rag::rag::RagPipeline;

const SETUP: &str = "Install the toolchain with rustup, then run the bootstrap script once.";

/// Maps every document to `[1, 0]` and every question to a vector at
/// cosine 0.4 from it.
struct FixedEmbedder;

#[async_trait]
impl EmbeddingProvider for FixedEmbedder {
    fn model_name(&self) -> &str {
        "fixed"
    }

    fn dims(&self) -> usize {
        2
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.starts_with('#') {
            Ok(vec![1.0, 0.0])
        } else {
            Ok(vec![0.4, (1.0f32 - 0.16).sqrt()])
        }
    }
}

#[derive(Default)]
struct RecordingGenerator {
    requests: Mutex<Vec<GenerationRequest>>,
}

#[async_trait]
impl GenerationProvider for RecordingGenerator {
    fn model_name(&self) -> &str {
        "recording"
    }

    async fn stream(
        &self,
        request: GenerationRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), GenerationError> {
        self.requests.lock().unwrap().push(request);
        tx.send(StreamEvent::Token("answer".into()))
            .await
            .map_err(|_| GenerationError::Cancelled)
    }
}

async fn drain(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

async fn guide_pipeline(generator: Arc<RecordingGenerator>) -> RagPipeline {
    let md = format!("# Guide\n## Setup\n{SETUP}\n## FAQ\nSee below.\n");
    let chunks = chunk_markdown(&md, "guide.md", 50);
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].metadata.title, "Guide > Setup");

    let embedder = Arc::new(FixedEmbedder);
    let index = Arc::new(InMemoryIndex::new());
    for chunk in &chunks {
        let vector = embedder.embed(&chunk.content).await.unwrap();
        index.upsert(chunk, &vector).await.unwrap();
    }
    RagPipeline::new(embedder, index, generator)
}

#[tokio::test]
async fn strict_threshold_answers_without_context() {
    let generator = Arc::new(RecordingGenerator::default());
    let rag = guide_pipeline(generator.clone()).await;

    let strict = RetrievalProfile {
        threshold: 0.9,
        top_k: 5,
    };
    let (retrieval, rx) = rag.ask("How do I set up?", Vec::new(), strict).await.unwrap();
    assert!(retrieval.results.is_empty());
    assert_eq!(retrieval.context, "");

    let events = drain(rx).await;
    assert_eq!(
        events,
        vec![StreamEvent::Token("answer".into()), StreamEvent::Done]
    );
    let requests = generator.requests.lock().unwrap();
    assert!(requests[0].prompt.starts_with(NO_CONTEXT_PREAMBLE));
    assert!(requests[0].prompt.ends_with("Question: How do I set up?"));
}

#[tokio::test]
async fn loose_threshold_numbers_the_source() {
    let generator = Arc::new(RecordingGenerator::default());
    let rag = guide_pipeline(generator.clone()).await;

    let loose = RetrievalProfile {
        threshold: 0.3,
        top_k: 5,
    };
    let (retrieval, rx) = rag.ask("How do I set up?", Vec::new(), loose).await.unwrap();
    assert_eq!(retrieval.results.len(), 1);
    assert!((retrieval.results[0].similarity - 0.4).abs() < 1e-4);
    assert_eq!(
        retrieval.context,
        format!("[Source 1: Guide > Setup]\n# Guide\n\n## Setup\n\n{SETUP}")
    );

    drain(rx).await;
    let requests = generator.requests.lock().unwrap();
    assert!(requests[0].prompt.starts_with(CONTEXT_PREAMBLE));
    assert!(requests[0].prompt.contains("[Source 1: Guide > Setup]"));
}

#[tokio::test]
async fn ingested_directory_is_searchable_from_sqlite() {
    let tmp = tempfile::TempDir::new().unwrap();
    let knowledge = tmp.path().join("knowledge");
    std::fs::create_dir_all(knowledge.join("policies")).unwrap();
    std::fs::write(
        knowledge.join("policies/late-work.md"),
        "# Policies\n## Late work\nLate homework loses ten percent of its grade for each day past the deadline.\n",
    )
    .unwrap();
    std::fs::write(
        knowledge.join("office-hours.txt"),
        "Office hours run every Monday afternoon in the library study room on the second floor.",
    )
    .unwrap();

    let pool = db::connect_path(&tmp.path().join("data/crag.sqlite"))
        .await
        .unwrap();
    let embedder = Arc::new(HashedProvider::new(256));
    let index = Arc::new(SqliteIndex::open(pool).await.unwrap().with_model("hashed"));

    let report = ingest_directory(
        &knowledge,
        &IngestConfig::default(),
        &ChunkingConfig::default(),
        embedder.as_ref(),
        index.as_ref(),
    )
    .await
    .unwrap();
    assert_eq!(report.files_seen, 2);
    assert_eq!(report.files_ingested, 2);
    assert_eq!(report.chunks_written, 2);
    assert_eq!(index.count().await.unwrap(), 2);

    let rag = RagPipeline::new(
        embedder,
        index,
        Arc::new(RecordingGenerator::default()),
    );
    let hits = rag
        .search(
            "late homework grade deadline",
            RetrievalProfile {
                threshold: 0.3,
                top_k: 1,
            },
        )
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].metadata.file, "policies/late-work.md");
    assert_eq!(hits[0].metadata.title, "Policies > Late work");
}
