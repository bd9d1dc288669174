//! Vector index abstraction.
//!
//! A [`VectorIndex`] stores [`KnowledgeChunk`]s with their embeddings and
//! answers similarity queries. Two backends ship:
//!
//! | Backend | Storage | Use |
//! |---------|---------|-----|
//! | [`InMemoryIndex`] | `Vec` behind an async `RwLock` | tests, one-shot CLI runs |
//! | [`SqliteIndex`] | `knowledge_chunks` table, f32 BLOBs | the persistent store |
//!
//! Both rank with [`rank_candidates`]: brute-force cosine similarity,
//! inclusive threshold, descending order, truncated to `top_k`. The index
//! holds no retrieval policy; callers pass a [`RetrievalProfile`].

mod memory;
mod sqlite;

pub use memory::InMemoryIndex;
pub use sqlite::SqliteIndex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::embedding::cosine_similarity;
use crate::models::{KnowledgeChunk, SearchResult};

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("index database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("dimension mismatch: index holds {expected}-d vectors, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("query vector is empty")]
    EmptyQuery,
    #[error("corrupt index entry {id}: {message}")]
    Corrupt { id: String, message: String },
}

/// Similarity floor and result cap for one kind of question.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetrievalProfile {
    pub threshold: f32,
    pub top_k: usize,
}

impl RetrievalProfile {
    /// Broad knowledge-base lookups.
    pub const KNOWLEDGE_BASE: Self = Self {
        threshold: 0.5,
        top_k: 5,
    };
    /// Support questions: fewer, closer matches.
    pub const SUPPORT: Self = Self {
        threshold: 0.65,
        top_k: 4,
    };
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Inserts a chunk, replacing any existing entry with the same id.
    async fn upsert(&self, chunk: &KnowledgeChunk, embedding: &[f32]) -> Result<(), IndexError>;

    /// Returns at most `top_k` entries with similarity `>= threshold`, best first.
    async fn search(
        &self,
        query: &[f32],
        threshold: f32,
        top_k: usize,
    ) -> Result<Vec<SearchResult>, IndexError>;

    /// Removes every entry.
    async fn clear_all(&self) -> Result<(), IndexError>;

    async fn count(&self) -> Result<usize, IndexError>;
}

/// Scores `candidates` against `query` and keeps the best `top_k`.
///
/// NaN scores never pass the threshold. Equal scores keep candidate order.
pub fn rank_candidates<'a, I>(
    query: &[f32],
    candidates: I,
    threshold: f32,
    top_k: usize,
) -> Result<Vec<SearchResult>, IndexError>
where
    I: IntoIterator<Item = (&'a KnowledgeChunk, &'a [f32])>,
{
    if query.is_empty() {
        return Err(IndexError::EmptyQuery);
    }

    let mut scored: Vec<(f32, &KnowledgeChunk)> = Vec::new();
    for (chunk, vector) in candidates {
        if vector.len() != query.len() {
            return Err(IndexError::DimensionMismatch {
                expected: vector.len(),
                actual: query.len(),
            });
        }
        let similarity = cosine_similarity(query, vector);
        if similarity.is_nan() || similarity < threshold {
            continue;
        }
        scored.push((similarity, chunk));
    }

    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));
    scored.truncate(top_k);

    Ok(scored
        .into_iter()
        .map(|(similarity, chunk)| SearchResult {
            id: chunk.id.clone(),
            content: chunk.content.clone(),
            metadata: chunk.metadata.clone(),
            similarity,
        })
        .collect())
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    fn rank(threshold: f32, top_k: usize) -> Vec<String> {
        let entries = fan();
        rank_candidates(
            &[1.0, 0.0],
            entries.iter().map(|(c, v)| (c, v.as_slice())),
            threshold,
            top_k,
        )
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect()
    }

    #[test]
    fn results_are_sorted_descending() {
        assert_eq!(rank(-1.0, 10), ["a", "b", "c", "d"]);
    }

    #[test]
    fn threshold_is_inclusive() {
        assert_eq!(rank(0.6, 10), ["a", "b", "c"]);
        assert_eq!(rank(0.61, 10), ["a", "b"]);
    }

    #[test]
    fn raising_threshold_never_adds_results() {
        let mut previous = rank(-1.0, 10);
        for step in 0..=20 {
            let threshold = -1.0 + step as f32 * 0.1;
            let current = rank(threshold, 10);
            assert!(current.iter().all(|id| previous.contains(id)));
            previous = current;
        }
    }

    #[test]
    fn top_k_truncates_prefix() {
        let all = rank(0.0, 10);
        for k in 0..=all.len() {
            assert_eq!(rank(0.0, k), all[..k]);
        }
    }

    #[test]
    fn ties_keep_insertion_order() {
        let a = chunk("first", "");
        let b = chunk("second", "");
        let v = [0.5f32, 0.5];
        let out = rank_candidates(&[1.0, 1.0], [(&a, &v[..]), (&b, &v[..])], 0.0, 2).unwrap();
        assert_eq!(out[0].id, "first");
        assert_eq!(out[1].id, "second");
    }

    #[test]
    fn empty_query_and_dimension_mismatch_are_errors() {
        let entries = fan();
        let iter = || entries.iter().map(|(c, v)| (c, v.as_slice()));
        assert!(matches!(
            rank_candidates(&[], iter(), 0.0, 5),
            Err(IndexError::EmptyQuery)
        ));
        assert!(matches!(
            rank_candidates(&[1.0, 0.0, 0.0], iter(), 0.0, 5),
            Err(IndexError::DimensionMismatch {
                expected: 2,
                actual: 3
            })
        ));
    }

    #[test]
    fn presets() {
        assert_eq!(RetrievalProfile::KNOWLEDGE_BASE.top_k, 5);
        assert_eq!(RetrievalProfile::SUPPORT.threshold, 0.65);
    }
}
