//! Embedding provider abstraction and implementations.
//!
//! Defines the async [`EmbeddingProvider`] trait and concrete implementations:
//! - **[`DisabledProvider`]**: every embed call fails; used when embeddings are not configured.
//! - **[`OpenAIProvider`]**: calls an OpenAI-compatible `/embeddings` endpoint with batching, retry, and backoff.
//! - **[`HashedProvider`]**: deterministic offline feature hashing; no model, no network.
//! - **`LocalProvider`**: runs a sentence-embedding model in-process via fastembed (default)
//!   or tract (pure Rust). The model is loaded at most once per process.
//!
//! Every provider returns unit-length vectors (see [`normalize_l2`]), so a
//! dot product of two embeddings is their cosine similarity. The one
//! exception is text with nothing to embed: [`HashedProvider`] maps input
//! without alphanumeric tokens to the zero vector, whose cosine similarity
//! with anything is `0.0`.
//!
//! Also provides vector utilities:
//! - [`cosine_similarity`]: similarity between two embedding vectors
//! - [`vec_to_blob`] / [`blob_to_vec`]: little-endian f32 BLOB encoding for SQLite
//!
//! # Provider Selection
//!
//! ```rust
//! # use course_rag::config::EmbeddingConfig;
//! # use course_rag::embedding::create_provider;
//! let config = EmbeddingConfig::default(); // provider = "disabled"
//! let provider = create_provider(&config).unwrap();
//! assert_eq!(provider.model_name(), "disabled");
//! ```
//!
//! # Retry Strategy
//!
//! The OpenAI provider uses exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

#[cfg(feature = "local-embeddings-tract")]
mod local_tract;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::EmbeddingConfig;

const DEFAULT_LOCAL_MODEL: &str = "all-minilm-l6-v2";
const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Text → fixed-length, unit-normalized vector.
///
/// Implementations may return the zero vector for input with no tokens;
/// it is never normalized and scores `0.0` against every other vector.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"all-minilm-l6-v2"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `384`).
    fn dims(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embeds several texts; output order matches input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

// ============ Process-wide model slot ============

/// A lazily loaded model shared by the whole process.
///
/// The first caller runs `load` on the blocking pool; concurrent callers
/// wait for that same load; later callers get the cached handle. Asking
/// for a different model name once loaded is an error: the slot never
/// swaps models.
pub(crate) struct ModelSlot<T> {
    cell: OnceCell<(String, Arc<Mutex<T>>)>,
}

impl<T: Send + 'static> ModelSlot<T> {
    pub(crate) const fn new() -> Self {
        Self {
            cell: OnceCell::const_new(),
        }
    }

    pub(crate) async fn get_or_load<F>(&self, name: &str, load: F) -> Result<Arc<Mutex<T>>>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (loaded_name, model) = self
            .cell
            .get_or_try_init(|| async {
                info!(model = name, "loading embedding model");
                let model = tokio::task::spawn_blocking(load)
                    .await
                    .context("embedding model loader panicked")??;
                Ok::<_, anyhow::Error>((name.to_string(), Arc::new(Mutex::new(model))))
            })
            .await?;

        if loaded_name != name {
            bail!(
                "Embedding model '{}' is already loaded in this process; cannot switch to '{}'",
                loaded_name,
                name
            );
        }
        Ok(Arc::clone(model))
    }
}

/// Runs `f` against a slot's model on the blocking pool.
pub(crate) async fn with_model<T, R, F>(model: Arc<Mutex<T>>, f: F) -> Result<R>
where
    T: Send + 'static,
    R: Send + 'static,
    F: FnOnce(&mut T) -> Result<R> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut guard = model
            .lock()
            .map_err(|_| anyhow!("embedding model lock poisoned"))?;
        f(&mut *guard)
    })
    .await
    .context("embedding task panicked")?
}

// ============ Disabled Provider ============

/// A no-op embedding provider that always returns errors.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        bail!("Embedding provider is disabled")
    }
}

// ============ Hashed Provider ============

/// Deterministic feature-hashing embedder.
///
/// Each lowercase alphanumeric token is hashed into one of `dims` buckets;
/// the bucket counts are mean-pooled over the token count and normalized.
/// Texts sharing vocabulary land close together, which is enough for
/// offline use and tests. Text without tokens (`""`, `"?!"`) embeds to
/// the zero vector.
pub struct HashedProvider {
    dims: usize,
}

impl HashedProvider {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];

        let lowered = text.to_lowercase();
        let words: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        if words.is_empty() {
            return vector;
        }

        let mut tf: HashMap<&str, usize> = HashMap::new();
        for word in &words {
            *tf.entry(word).or_insert(0) += 1;
        }
        for (term, count) in &tf {
            vector[djb2(term) % self.dims] += *count as f32;
        }

        let n = words.len() as f32;
        for x in &mut vector {
            *x /= n;
        }
        normalize_l2(vector)
    }
}

fn djb2(s: &str) -> usize {
    let mut hash: usize = 5381;
    for b in s.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(b as usize);
    }
    hash
}

#[async_trait]
impl EmbeddingProvider for HashedProvider {
    fn model_name(&self) -> &str {
        "hashed"
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_sync(t)).collect())
    }
}

// ============ OpenAI Provider ============

/// Embedding provider for OpenAI-compatible `/embeddings` APIs.
///
/// The API key comes from `OPENAI_API_KEY`. `embedding.url` overrides the
/// base URL (default `https://api.openai.com/v1`).
pub struct OpenAIProvider {
    model: String,
    dims: usize,
    base_url: String,
    api_key: String,
    batch_size: usize,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIProvider {
    /// Create a new OpenAI provider from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `model` or `dims` is not set in config,
    /// or if `OPENAI_API_KEY` is not in the environment.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(config: &EmbeddingConfig, api_key: String) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow!("embedding.dims required for OpenAI provider"))?;
        let base_url = config
            .url
            .as_deref()
            .unwrap_or(DEFAULT_OPENAI_BASE_URL)
            .trim_end_matches('/')
            .to_string();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            dims,
            base_url,
            api_key,
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
            client,
        })
    }

    /// One `/embeddings` round trip with retry/backoff.
    async fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                debug!(attempt, delay_secs = delay.as_secs(), "retrying embedding request");
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return parse_openai_response(&json, texts.len());
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        warn!(%status, "transient embedding API error");
                        last_err = Some(anyhow!("OpenAI API error {}: {}", status, body_text));
                        continue;
                    }

                    bail!("OpenAI API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("Embedding failed after retries")))
    }

    fn check_dims(&self, vectors: Vec<Vec<f32>>) -> Result<Vec<Vec<f32>>> {
        vectors
            .into_iter()
            .map(|v| {
                if v.len() != self.dims {
                    bail!(
                        "Embedding API returned {} dimensions, expected {}",
                        v.len(),
                        self.dims
                    );
                }
                Ok(normalize_l2(v))
            })
            .collect()
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("Empty embedding response"))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let vectors = self.request(batch).await?;
            out.extend(self.check_dims(vectors)?);
        }
        Ok(out)
    }
}

/// Extracts `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &serde_json::Value, expected: usize) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow!("Invalid OpenAI response: missing embedding"))?;

        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        indexed.push((index, vec));
    }

    if indexed.len() != expected {
        bail!(
            "Invalid OpenAI response: {} embeddings for {} inputs",
            indexed.len(),
            expected
        );
    }
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Local Provider (fastembed or tract) ============

/// Embedding provider for in-process inference.
///
/// Models are downloaded on first use and cached; after that no network
/// calls are made. The loaded model lives in a process-wide slot.
#[cfg(any(
    feature = "local-embeddings-fastembed",
    feature = "local-embeddings-tract"
))]
pub struct LocalProvider {
    model_name: String,
    dims: usize,
    batch_size: usize,
}

#[cfg(any(
    feature = "local-embeddings-fastembed",
    feature = "local-embeddings-tract"
))]
impl LocalProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let (model_name, dims) = resolve_local_model(config);
        #[cfg(feature = "local-embeddings-fastembed")]
        config_to_fastembed_model(&model_name)?;
        Ok(Self {
            model_name,
            dims,
            batch_size: config.batch_size.max(1),
        })
    }
}

#[cfg(any(
    feature = "local-embeddings-fastembed",
    feature = "local-embeddings-tract"
))]
#[async_trait]
impl EmbeddingProvider for LocalProvider {
    fn model_name(&self) -> &str {
        &self.model_name
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("Empty embedding response"))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        #[cfg(feature = "local-embeddings-fastembed")]
        let vectors = embed_local_fastembed(&self.model_name, self.batch_size, texts).await?;
        #[cfg(all(
            feature = "local-embeddings-tract",
            not(feature = "local-embeddings-fastembed")
        ))]
        let vectors =
            local_tract::embed_local_tract(&self.model_name, self.batch_size, texts).await?;

        Ok(vectors.into_iter().map(normalize_l2).collect())
    }
}

#[cfg(any(
    feature = "local-embeddings-fastembed",
    feature = "local-embeddings-tract"
))]
fn resolve_local_model(config: &EmbeddingConfig) -> (String, usize) {
    let model_name = config
        .model
        .clone()
        .unwrap_or_else(|| DEFAULT_LOCAL_MODEL.to_string());

    let dims = config.dims.unwrap_or(match model_name.as_str() {
        "all-minilm-l6-v2" => 384,
        "bge-small-en-v1.5" => 384,
        "bge-base-en-v1.5" => 768,
        "bge-large-en-v1.5" => 1024,
        "nomic-embed-text-v1" | "nomic-embed-text-v1.5" => 768,
        "multilingual-e5-small" => 384,
        "multilingual-e5-base" => 768,
        "multilingual-e5-large" => 1024,
        _ => 384,
    });

    (model_name, dims)
}

#[cfg(feature = "local-embeddings-fastembed")]
static FASTEMBED_MODEL: ModelSlot<fastembed::TextEmbedding> = ModelSlot::new();

#[cfg(feature = "local-embeddings-fastembed")]
fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV1),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
        "multilingual-e5-large" => Ok(fastembed::EmbeddingModel::MultilingualE5Large),
        other => bail!(
            "Unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
             nomic-embed-text-v1, nomic-embed-text-v1.5, \
             multilingual-e5-small, multilingual-e5-base, multilingual-e5-large",
            other
        ),
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
async fn embed_local_fastembed(
    model_name: &str,
    batch_size: usize,
    texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    let fastembed_model = config_to_fastembed_model(model_name)?;
    let model = FASTEMBED_MODEL
        .get_or_load(model_name, move || {
            fastembed::TextEmbedding::try_new(
                fastembed::InitOptions::new(fastembed_model).with_show_download_progress(false),
            )
            .map_err(|e| anyhow!("Failed to initialize local embedding model: {}", e))
        })
        .await?;

    let texts = texts.to_vec();
    with_model(model, move |model| {
        model
            .embed(texts, Some(batch_size))
            .map_err(|e| anyhow!("Local embedding failed: {}", e))
    })
    .await
}

/// Create the appropriate [`EmbeddingProvider`] based on configuration.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledProvider`] |
/// | `"openai"` | [`OpenAIProvider`] |
/// | `"hashed"` | [`HashedProvider`] |
/// | `"local"` | `LocalProvider` (fastembed or tract, see features) |
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        "hashed" => Ok(Arc::new(HashedProvider::new(config.dims.unwrap_or(256)))),
        #[cfg(any(feature = "local-embeddings-fastembed", feature = "local-embeddings-tract"))]
        "local" => Ok(Arc::new(LocalProvider::new(config)?)),
        #[cfg(not(any(feature = "local-embeddings-fastembed", feature = "local-embeddings-tract")))]
        "local" => bail!(
            "Local embedding provider requires one of: --features local-embeddings-fastembed, --features local-embeddings-tract"
        ),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Euclidean length of `v`.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Scales `v` to unit length. Zero vectors are returned unchanged.
pub fn normalize_l2(mut v: Vec<f32>) -> Vec<f32> {
    let norm = l2_norm(&v);
    if norm > 1e-9 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// ```rust
/// use course_rag::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector. Trailing partial words are ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors, vectors of
/// different lengths, or a zero vector.
///
/// ```text
///            a · b
/// cos(θ) = ─────────
///          ‖a‖ × ‖b‖
/// ```
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn hashed_embeddings_are_deterministic_and_unit_length() {
        let provider = HashedProvider::new(64);
        let a = provider.embed("How do I submit late homework?").await.unwrap();
        let b = provider.embed("How do I submit late homework?").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!((l2_norm(&a) - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn hashed_embeddings_rank_shared_vocabulary_higher() {
        let provider = HashedProvider::new(256);
        let query = provider.embed("late homework policy").await.unwrap();
        let close = provider.embed("The late homework policy allows two days").await.unwrap();
        let far = provider.embed("Laboratory safety goggles required").await.unwrap();
        assert!(cosine_similarity(&query, &close) > cosine_similarity(&query, &far));
    }

    #[tokio::test]
    async fn hashed_tokenless_text_is_zero_vector() {
        let provider = HashedProvider::new(8);
        let other = provider.embed("office hours").await.unwrap();
        for text in ["   ", "?!", "--- ..."] {
            let v = provider.embed(text).await.unwrap();
            assert!(v.iter().all(|x| *x == 0.0), "{text:?} -> {v:?}");
            assert_eq!(cosine_similarity(&v, &other), 0.0);
        }
    }

    #[tokio::test]
    async fn batch_preserves_order() {
        let provider = HashedProvider::new(32);
        let texts = vec!["alpha".to_string(), "beta".to_string(), "gamma".to_string()];
        let batch = provider.embed_batch(&texts).await.unwrap();
        for (text, vector) in texts.iter().zip(&batch) {
            assert_eq!(&provider.embed(text).await.unwrap(), vector);
        }
    }

    #[tokio::test]
    async fn disabled_provider_fails() {
        assert!(DisabledProvider.embed("anything").await.is_err());
    }

    #[tokio::test]
    async fn model_slot_loads_once_and_refuses_switching() {
        static SLOT: ModelSlot<u32> = ModelSlot::new();
        static LOADS: AtomicUsize = AtomicUsize::new(0);

        let load = || {
            LOADS.fetch_add(1, Ordering::SeqCst);
            Ok(7u32)
        };
        let (a, b) = tokio::join!(SLOT.get_or_load("m1", load), SLOT.get_or_load("m1", load));
        let a = a.unwrap();
        let b = b.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(LOADS.load(Ordering::SeqCst), 1);

        let again = SLOT.get_or_load("m1", load).await.unwrap();
        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(LOADS.load(Ordering::SeqCst), 1);

        let err = SLOT.get_or_load("m2", load).await.unwrap_err();
        assert!(err.to_string().contains("cannot switch"));

        let doubled = with_model(a, |n| Ok(*n * 2)).await.unwrap();
        assert_eq!(doubled, 14);
    }

    #[tokio::test]
    async fn model_slot_retries_after_failed_load() {
        static SLOT: ModelSlot<u32> = ModelSlot::new();
        assert!(SLOT
            .get_or_load("m", || Err(anyhow!("download failed")))
            .await
            .is_err());
        assert!(SLOT.get_or_load("m", || Ok(1)).await.is_ok());
    }

    fn openai_config(url: &str) -> EmbeddingConfig {
        EmbeddingConfig {
            provider: "openai".into(),
            model: Some("text-embedding-3-small".into()),
            dims: Some(2),
            url: Some(url.to_string()),
            max_retries: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn openai_embeddings_are_ordered_and_normalized() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [
                    {"index": 1, "embedding": [0.0, 2.0]},
                    {"index": 0, "embedding": [3.0, 4.0]}
                ]
            })))
            .mount(&server)
            .await;

        let provider =
            OpenAIProvider::with_api_key(&openai_config(&server.uri()), "sk-test".into()).unwrap();
        let out = provider
            .embed_batch(&["first".to_string(), "second".to_string()])
            .await
            .unwrap();
        assert_eq!(out, vec![vec![0.6, 0.8], vec![0.0, 1.0]]);
    }

    #[tokio::test]
    async fn openai_client_errors_fail_fast() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = openai_config(&server.uri());
        config.max_retries = 3;
        let provider = OpenAIProvider::with_api_key(&config, "sk-bad".into()).unwrap();
        let err = provider.embed("x").await.unwrap_err();
        assert!(err.to_string().contains("401"));
    }

    #[tokio::test]
    async fn openai_dimension_mismatch_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"index": 0, "embedding": [1.0, 0.0, 0.0]}]
            })))
            .mount(&server)
            .await;

        let provider =
            OpenAIProvider::with_api_key(&openai_config(&server.uri()), "k".into()).unwrap();
        assert!(provider.embed("x").await.is_err());
    }

    #[test]
    fn create_provider_dispatches() {
        let hashed = create_provider(&EmbeddingConfig {
            provider: "hashed".into(),
            dims: Some(16),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(hashed.model_name(), "hashed");
        assert_eq!(hashed.dims(), 16);
        assert!(create_provider(&EmbeddingConfig {
            provider: "nope".into(),
            ..Default::default()
        })
        .is_err());
    }

    #[test]
    fn normalize_keeps_zero_vectors() {
        assert_eq!(normalize_l2(vec![0.0, 0.0]), vec![0.0, 0.0]);
        let v = normalize_l2(vec![3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6 && (v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        assert!(cosine_similarity(&[1.0, 0.0, 0.0], &[0.0, 1.0, 0.0]).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_opposite() {
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }
}
