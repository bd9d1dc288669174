//! `crag search` and `crag ask`.

use anyhow::{bail, Result};
use std::io::Write;

use crate::config::{Config, RetrievalConfig};
use crate::index::RetrievalProfile;
use crate::models::StreamEvent;
use crate::rag::open_pipeline;

/// Resolves a named profile and applies CLI overrides on top of it.
pub fn resolve_profile(
    retrieval: &RetrievalConfig,
    name: &str,
    threshold: Option<f32>,
    top_k: Option<usize>,
) -> Result<RetrievalProfile> {
    let mut profile = retrieval.profile(name)?;
    if let Some(threshold) = threshold {
        if !(-1.0..=1.0).contains(&threshold) {
            bail!("--threshold must be in [-1.0, 1.0], got {}", threshold);
        }
        profile.threshold = threshold;
    }
    if let Some(top_k) = top_k {
        if top_k == 0 {
            bail!("--top-k must be >= 1");
        }
        profile.top_k = top_k;
    }
    Ok(profile)
}

pub async fn run_search(
    config: &Config,
    query: &str,
    profile: &str,
    threshold: Option<f32>,
    top_k: Option<usize>,
) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }
    if !config.embedding.is_enabled() {
        bail!("Search requires embeddings. Set [embedding] provider in config.");
    }

    let profile = resolve_profile(&config.retrieval, profile, threshold, top_k)?;
    let pipeline = open_pipeline(config).await?;
    let results = pipeline.search(query, profile).await?;

    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, result) in results.iter().enumerate() {
        let title = if result.metadata.title.is_empty() {
            "(untitled)"
        } else {
            result.metadata.title.as_str()
        };
        println!("{}. [{:.3}] {}", i + 1, result.similarity, title);
        println!("    file: {}", result.metadata.file);
        let excerpt: String = result.content.chars().take(160).collect();
        println!("    excerpt: \"{}\"", excerpt.replace('\n', " ").trim());
        println!("    id: {}", result.id);
        println!();
    }

    Ok(())
}

/// Streams an answer to stdout as tokens arrive.
pub async fn run_ask(config: &Config, question: &str, profile: &str) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Ask requires embeddings. Set [embedding] provider in config.");
    }
    let profile = resolve_profile(&config.retrieval, profile, None, None)?;
    let pipeline = open_pipeline(config).await?;
    let (retrieval, mut rx) = pipeline.ask(question, Vec::new(), profile).await?;

    let mut stdout = std::io::stdout();
    while let Some(event) = rx.recv().await {
        let terminal = event.is_terminal();
        match event {
            StreamEvent::Token(text) => {
                write!(stdout, "{}", text)?;
                stdout.flush()?;
            }
            StreamEvent::Done => {}
            StreamEvent::Failed(message) => {
                println!();
                bail!("Answer failed: {}", message);
            }
        }
        if terminal {
            break;
        }
    }
    println!();

    if !retrieval.results.is_empty() {
        println!();
        println!("Sources:");
        for (i, result) in retrieval.results.iter().enumerate() {
            println!("  [{}] {} ({:.3})", i + 1, result.metadata.title, result.similarity);
        }
    }
    Ok(())
}
