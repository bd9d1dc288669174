//! Tract-based local embedding pipeline.
//!
//! Pure-Rust path: the ONNX model is loaded with tract-onnx and text is
//! tokenized with the tokenizers crate. Token states are mean-pooled under
//! the attention mask. Model and tokenizer are loaded once per process.
#![cfg_attr(
    all(feature = "local-embeddings-fastembed", feature = "local-embeddings-tract"),
    allow(dead_code)
)]

use anyhow::{anyhow, bail, Result};
use std::path::{Path, PathBuf};
use tract_onnx::prelude::*;

use super::{with_model, ModelSlot};

const ALL_MINILM_REPO: &str = "sentence-transformers/all-MiniLM-L6-v2";
const ALL_MINILM_DIMS: usize = 384;
const DEFAULT_MAX_LEN: usize = 256;

type RunFn = Box<dyn Fn(Tensor, Tensor) -> TractResult<TVec<TValue>> + Send + Sync>;

/// A loaded tokenizer plus a runnable graph taking `(input_ids, attention_mask)`.
pub(crate) struct TractModel {
    tokenizer: tokenizers::Tokenizer,
    run: RunFn,
    dims: usize,
}

static TRACT_MODEL: ModelSlot<TractModel> = ModelSlot::new();

/// Model manifest: name -> (onnx path in repo, tokenizer path in repo, dims).
fn model_manifest(model_name: &str) -> Result<(&'static str, &'static str, usize)> {
    match model_name {
        "all-minilm-l6-v2" => Ok(("onnx/model.onnx", "tokenizer.json", ALL_MINILM_DIMS)),
        _ => bail!(
            "Tract backend supports only all-minilm-l6-v2. Requested: '{}'",
            model_name
        ),
    }
}

fn cache_dir() -> Result<PathBuf> {
    let base = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    let dir = PathBuf::from(base)
        .join(".cache")
        .join("course-rag")
        .join("models");
    std::fs::create_dir_all(&dir).map_err(|e| anyhow!("Create cache dir: {}", e))?;
    Ok(dir)
}

fn download_to_cache(repo: &str, path: &str, cache_path: &Path) -> Result<()> {
    if cache_path.exists() {
        return Ok(());
    }
    let url = format!("https://huggingface.co/{}/resolve/main/{}", repo, path);
    let bytes = reqwest::blocking::get(&url)
        .and_then(|r| r.error_for_status())
        .and_then(|r| r.bytes())
        .map_err(|e| anyhow!("Download {}: {}", url, e))?;
    if let Some(parent) = cache_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| anyhow!("Create cache parent: {}", e))?;
    }
    std::fs::write(cache_path, &bytes).map_err(|e| anyhow!("Write cache: {}", e))?;
    Ok(())
}

fn load_model(model_name: &str) -> Result<TractModel> {
    let (onnx_rel, tokenizer_rel, dims) = model_manifest(model_name)?;
    let model_dir = cache_dir()?.join(model_name);
    let onnx_path = model_dir.join(onnx_rel);
    let tokenizer_path = model_dir.join(tokenizer_rel);
    download_to_cache(ALL_MINILM_REPO, onnx_rel, &onnx_path)?;
    download_to_cache(ALL_MINILM_REPO, tokenizer_rel, &tokenizer_path)?;

    let tokenizer = tokenizers::Tokenizer::from_file(&tokenizer_path)
        .map_err(|e| anyhow!("Load tokenizer: {}", e))?;

    let plan = tract_onnx::onnx()
        .model_for_path(&onnx_path)
        .map_err(|e| anyhow!("Load ONNX: {}", e))?
        .into_optimized()
        .map_err(|e| anyhow!("Optimize: {}", e))?
        .into_runnable()
        .map_err(|e| anyhow!("Build tract runnable: {}", e))?;

    let run: RunFn = Box::new(move |ids, mask| plan.run(tvec!(ids.into(), mask.into())));
    Ok(TractModel {
        tokenizer,
        run,
        dims,
    })
}

/// Embeds `texts` with the process-wide tract model, loading it on first use.
pub async fn embed_local_tract(
    model_name: &str,
    batch_size: usize,
    texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    model_manifest(model_name)?;
    let owned_name = model_name.to_string();
    let model = TRACT_MODEL
        .get_or_load(model_name, move || load_model(&owned_name))
        .await?;

    let texts = texts.to_vec();
    with_model(model, move |model| {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(batch_size.max(1)) {
            out.extend(embed_batch(model, batch)?);
        }
        Ok(out)
    })
    .await
}

fn embed_batch(model: &TractModel, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let encodings = texts
        .iter()
        .map(|s| {
            model
                .tokenizer
                .encode(s.as_str(), true)
                .map_err(|e| anyhow!("Tokenize: {}", e))
        })
        .collect::<Result<Vec<_>>>()?;

    let max_len = encodings
        .iter()
        .map(|e| e.get_ids().len())
        .max()
        .unwrap_or(1)
        .clamp(1, DEFAULT_MAX_LEN);

    let rows = encodings.len();
    let mut input_ids = vec![0i64; rows * max_len];
    let mut attention_mask = vec![0i64; rows * max_len];
    for (i, enc) in encodings.iter().enumerate() {
        let ids = enc.get_ids();
        let mask = enc.get_attention_mask();
        for j in 0..ids.len().min(max_len) {
            input_ids[i * max_len + j] = ids[j] as i64;
            attention_mask[i * max_len + j] = mask.get(j).copied().unwrap_or(1) as i64;
        }
    }

    let ids_tensor: Tensor = ndarray::Array2::from_shape_vec((rows, max_len), input_ids)
        .map_err(|e| anyhow!("Input ids shape: {}", e))?
        .into();
    let mask_tensor: Tensor =
        ndarray::Array2::from_shape_vec((rows, max_len), attention_mask.clone())
            .map_err(|e| anyhow!("Attention mask shape: {}", e))?
            .into();

    let output = (model.run)(ids_tensor, mask_tensor)?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("No output tensor"))?;
    let view = output
        .to_array_view::<f32>()
        .map_err(|e| anyhow!("Output to array: {}", e))?;

    // [batch, dims] is already pooled; [batch, seq, dims] needs pooling.
    let shape = view.shape().to_vec();
    match shape.len() {
        2 => Ok((0..shape[0])
            .map(|i| view.slice(ndarray::s![i, ..]).iter().copied().collect())
            .collect()),
        3 => {
            let seq_len = shape[1].min(max_len);
            let width = shape[2].min(model.dims);
            let mut pooled = Vec::with_capacity(rows);
            for i in 0..rows {
                let mask_row = &attention_mask[i * max_len..i * max_len + seq_len];
                pooled.push(mean_pool(
                    (0..seq_len).map(|j| view.slice(ndarray::s![i, j, ..width]).to_vec()),
                    mask_row,
                    width,
                ));
            }
            Ok(pooled)
        }
        _ => bail!("Unexpected output shape: {:?}", shape),
    }
}

/// Averages the token vectors whose mask entry is non-zero.
fn mean_pool(tokens: impl Iterator<Item = Vec<f32>>, mask: &[i64], width: usize) -> Vec<f32> {
    let mut sum = vec![0f32; width];
    let mut count = 0f32;
    for (token, &m) in tokens.zip(mask) {
        if m == 0 {
            continue;
        }
        for (acc, v) in sum.iter_mut().zip(token) {
            *acc += v;
        }
        count += 1.0;
    }
    if count > 0.0 {
        for x in &mut sum {
            *x /= count;
        }
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_pool_ignores_masked_tokens() {
        let tokens = vec![vec![1.0, 3.0], vec![3.0, 5.0], vec![100.0, 100.0]];
        let pooled = mean_pool(tokens.into_iter(), &[1, 1, 0], 2);
        assert_eq!(pooled, vec![2.0, 4.0]);
    }

    #[test]
    fn unknown_model_is_rejected() {
        assert!(model_manifest("bge-large-en-v1.5").is_err());
    }
}
