//! SQLite-backed [`VectorIndex`].
//!
//! Chunks live in `knowledge_chunks`, one row per chunk, with the embedding
//! stored as a little-endian f32 BLOB. Similarity is computed in Rust over
//! every row; SQLite only provides durable storage.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::migrate::apply_schema;
use crate::models::{ChunkMetadata, KnowledgeChunk, SearchResult};

use super::{rank_candidates, IndexError, VectorIndex};

pub struct SqliteIndex {
    pool: SqlitePool,
    model: String,
}

impl SqliteIndex {
    /// Wraps `pool`, creating the schema if needed.
    pub async fn open(pool: SqlitePool) -> Result<Self, IndexError> {
        apply_schema(&pool).await?;
        Ok(Self {
            pool,
            model: String::new(),
        })
    }

    /// Records `model` as the producer of vectors written from now on.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn load_all(&self) -> Result<Vec<(KnowledgeChunk, Vec<f32>)>, IndexError> {
        let rows = sqlx::query(
            "SELECT id, file, section, title, content, hash, embedding, dims
             FROM knowledge_chunks ORDER BY rowid",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let id: String = row.get("id");
                let blob: Vec<u8> = row.get("embedding");
                let dims: i64 = row.get("dims");
                if blob.len() != dims as usize * 4 {
                    return Err(IndexError::Corrupt {
                        id,
                        message: format!("{} byte embedding for {} dims", blob.len(), dims),
                    });
                }
                let chunk = KnowledgeChunk {
                    id,
                    content: row.get("content"),
                    hash: row.get("hash"),
                    metadata: ChunkMetadata {
                        file: row.get("file"),
                        section: row.get("section"),
                        title: row.get("title"),
                    },
                };
                Ok((chunk, blob_to_vec(&blob)))
            })
            .collect()
    }
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    async fn upsert(&self, chunk: &KnowledgeChunk, embedding: &[f32]) -> Result<(), IndexError> {
        let existing: Option<i64> =
            sqlx::query_scalar("SELECT dims FROM knowledge_chunks WHERE id != ? LIMIT 1")
                .bind(&chunk.id)
                .fetch_optional(&self.pool)
                .await?;
        if let Some(dims) = existing {
            if dims as usize != embedding.len() {
                return Err(IndexError::DimensionMismatch {
                    expected: dims as usize,
                    actual: embedding.len(),
                });
            }
        }

        sqlx::query(
            r#"
            INSERT INTO knowledge_chunks (id, file, section, title, content, hash,
                                          embedding, dims, model, ingested_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                file = excluded.file,
                section = excluded.section,
                title = excluded.title,
                content = excluded.content,
                hash = excluded.hash,
                embedding = excluded.embedding,
                dims = excluded.dims,
                model = excluded.model,
                ingested_at = excluded.ingested_at
            "#,
        )
        .bind(&chunk.id)
        .bind(&chunk.metadata.file)
        .bind(&chunk.metadata.section)
        .bind(&chunk.metadata.title)
        .bind(&chunk.content)
        .bind(&chunk.hash)
        .bind(vec_to_blob(embedding))
        .bind(embedding.len() as i64)
        .bind(&self.model)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        threshold: f32,
        top_k: usize,
    ) -> Result<Vec<SearchResult>, IndexError> {
        if query.is_empty() {
            return Err(IndexError::EmptyQuery);
        }
        let entries = self.load_all().await?;
        rank_candidates(
            query,
            entries.iter().map(|(c, v)| (c, v.as_slice())),
            threshold,
            top_k,
        )
    }

    async fn clear_all(&self) -> Result<(), IndexError> {
        sqlx::query("DELETE FROM knowledge_chunks")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn count(&self) -> Result<usize, IndexError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM knowledge_chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }
}
