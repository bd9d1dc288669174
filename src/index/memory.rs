//! In-memory [`VectorIndex`] for tests and one-shot runs.
//!
//! Entries live in a `Vec` behind a `tokio::sync::RwLock`; searches take a
//! read lock and scan every entry.

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::models::{KnowledgeChunk, SearchResult};

use super::{rank_candidates, IndexError, VectorIndex};

struct StoredEntry {
    chunk: KnowledgeChunk,
    vector: Vec<f32>,
}

#[derive(Default)]
pub struct InMemoryIndex {
    entries: RwLock<Vec<StoredEntry>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn upsert(&self, chunk: &KnowledgeChunk, embedding: &[f32]) -> Result<(), IndexError> {
        let mut entries = self.entries.write().await;
        if let Some(existing) = entries.iter().find(|e| e.chunk.id != chunk.id) {
            if existing.vector.len() != embedding.len() {
                return Err(IndexError::DimensionMismatch {
                    expected: existing.vector.len(),
                    actual: embedding.len(),
                });
            }
        }

        let entry = StoredEntry {
            chunk: chunk.clone(),
            vector: embedding.to_vec(),
        };
        match entries.iter_mut().find(|e| e.chunk.id == chunk.id) {
            Some(slot) => *slot = entry,
            None => entries.push(entry),
        }
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        threshold: f32,
        top_k: usize,
    ) -> Result<Vec<SearchResult>, IndexError> {
        let entries = self.entries.read().await;
        rank_candidates(
            query,
            entries.iter().map(|e| (&e.chunk, e.vector.as_slice())),
            threshold,
            top_k,
        )
    }

    async fn clear_all(&self) -> Result<(), IndexError> {
        self.entries.write().await.clear();
        Ok(())
    }

    async fn count(&self) -> Result<usize, IndexError> {
        Ok(self.entries.read().await.len())
    }
}
