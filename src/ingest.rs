//! Knowledge-base ingestion.
//!
//! A full rebuild: the index is cleared, then every matching file under the
//! knowledge root is read, chunked, embedded and written, one file at a
//! time. Per-file problems are counted and logged and the run moves on;
//! only index failures abort it.
//!
//! | File | Chunker |
//! |------|---------|
//! | `.md`, `.markdown` | [`chunk_markdown`] (one chunk per `## ` section) |
//! | `.pdf`, `.docx`, `.txt` | format parser, then [`chunk_text`] |
//! | scanned PDFs, cartridges, unknown types | skipped |

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::chunk::{chunk_markdown, chunk_text};
use crate::config::{ChunkingConfig, Config, IngestConfig};
use crate::db;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::extract::{self, ExtractError, MIME_DOCX, MIME_PDF};
use crate::index::{SqliteIndex, VectorIndex};
use crate::models::{KnowledgeChunk, ParsedContent};

const DEFAULT_EXCLUDES: &[&str] = &["**/.git/**", "**/node_modules/**", "**/__MACOSX/**"];

/// A file selected for ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnowledgeFile {
    pub path: PathBuf,
    /// Path relative to the root, `/`-separated; becomes `ChunkMetadata::file`.
    pub relative: String,
}

/// Counts from one ingestion run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub files_seen: usize,
    pub files_ingested: usize,
    pub files_skipped: usize,
    pub files_failed: usize,
    pub chunks_written: usize,
    /// `(file, reason)` for every failed file.
    pub failures: Vec<(String, String)>,
}

enum FileOutcome {
    Ingested(usize),
    Skipped(String),
    Failed(String),
}

/// Lists files under `root` matching the include globs and none of the
/// excludes, sorted by relative path.
pub fn scan_knowledge_dir(root: &Path, config: &IngestConfig) -> Result<Vec<KnowledgeFile>> {
    if !root.is_dir() {
        bail!("Knowledge root does not exist: {}", root.display());
    }

    let include_set = build_globset(&config.include_globs)?;
    let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
    excludes.extend(config.exclude_globs.iter().cloned());
    let exclude_set = build_globset(&excludes)?;

    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(config.follow_symlinks) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }
        files.push(KnowledgeFile {
            path: path.to_path_buf(),
            relative: rel_str,
        });
    }

    files.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(files)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

/// Rebuilds `index` from the files under `root`.
pub async fn ingest_directory(
    root: &Path,
    ingest: &IngestConfig,
    chunking: &ChunkingConfig,
    embedder: &dyn EmbeddingProvider,
    index: &dyn VectorIndex,
) -> Result<IngestReport> {
    let files = scan_knowledge_dir(root, ingest)?;
    index
        .clear_all()
        .await
        .context("Failed to clear the knowledge index")?;
    info!(files = files.len(), root = %root.display(), "ingesting knowledge base");

    let mut report = IngestReport {
        files_seen: files.len(),
        ..Default::default()
    };

    for file in &files {
        match ingest_file(file, ingest, chunking, embedder, index).await? {
            FileOutcome::Ingested(n) => {
                info!(file = file.relative.as_str(), chunks = n, "ingested");
                report.files_ingested += 1;
                report.chunks_written += n;
            }
            FileOutcome::Skipped(reason) => {
                warn!(file = file.relative.as_str(), reason = reason.as_str(), "skipped");
                report.files_skipped += 1;
            }
            FileOutcome::Failed(reason) => {
                warn!(file = file.relative.as_str(), error = reason.as_str(), "ingestion failed");
                report.files_failed += 1;
                report.failures.push((file.relative.clone(), reason));
            }
        }
    }

    Ok(report)
}

async fn ingest_file(
    file: &KnowledgeFile,
    ingest: &IngestConfig,
    chunking: &ChunkingConfig,
    embedder: &dyn EmbeddingProvider,
    index: &dyn VectorIndex,
) -> Result<FileOutcome> {
    let size = match std::fs::metadata(&file.path) {
        Ok(meta) => meta.len(),
        Err(e) => return Ok(FileOutcome::Failed(e.to_string())),
    };
    if size > ingest.max_file_bytes {
        return Ok(FileOutcome::Skipped(format!(
            "{} bytes exceeds max_file_bytes ({})",
            size, ingest.max_file_bytes
        )));
    }
    let bytes = match std::fs::read(&file.path) {
        Ok(bytes) => bytes,
        Err(e) => return Ok(FileOutcome::Failed(e.to_string())),
    };

    let chunks = match chunk_file(file, &bytes, chunking) {
        Ok(chunks) => chunks,
        Err(outcome) => return Ok(outcome),
    };
    if chunks.is_empty() {
        return Ok(FileOutcome::Ingested(0));
    }

    let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
    let vectors = match embedder.embed_batch(&texts).await {
        Ok(vectors) => vectors,
        Err(e) => return Ok(FileOutcome::Failed(format!("embedding failed: {:#}", e))),
    };

    for (chunk, vector) in chunks.iter().zip(&vectors) {
        index
            .upsert(chunk, vector)
            .await
            .with_context(|| format!("Failed to write chunk {} of {}", chunk.id, file.relative))?;
    }
    Ok(FileOutcome::Ingested(chunks.len()))
}

fn chunk_file(
    file: &KnowledgeFile,
    bytes: &[u8],
    chunking: &ChunkingConfig,
) -> std::result::Result<Vec<KnowledgeChunk>, FileOutcome> {
    let extension = file
        .path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();

    if extension == "md" || extension == "markdown" {
        let text = String::from_utf8_lossy(bytes);
        return Ok(chunk_markdown(
            &text,
            &file.relative,
            chunking.min_section_chars,
        ));
    }

    let parsed = match extract::try_parse(bytes, media_type_for(&extension), &file.relative) {
        Ok(parsed) => parsed,
        Err(ExtractError::Unsupported { .. }) => {
            return Err(FileOutcome::Skipped("unsupported file type".to_string()))
        }
        Err(e) => return Err(FileOutcome::Failed(e.to_string())),
    };
    if parsed.is_scanned() {
        return Err(FileOutcome::Skipped(
            "scanned document without extractable text".to_string(),
        ));
    }

    match &parsed.content {
        ParsedContent::Text(text) => {
            let title = parsed.title.clone().unwrap_or_else(|| file_stem(&file.path));
            Ok(chunk_text(
                text,
                &file.relative,
                &title,
                chunking.max_tokens,
                chunking.min_section_chars,
            ))
        }
        ParsedContent::Manifest(_) => Err(FileOutcome::Skipped(
            "course cartridges are parsed, not indexed".to_string(),
        )),
    }
}

fn media_type_for(extension: &str) -> &'static str {
    match extension {
        "pdf" => MIME_PDF,
        "docx" => MIME_DOCX,
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// `crag ingest`: rebuilds the persistent index and prints a summary.
pub async fn run_ingest(config: &Config, root_override: Option<PathBuf>) -> Result<IngestReport> {
    let root = root_override.unwrap_or_else(|| config.ingest.root.clone());
    let embedder: Arc<dyn EmbeddingProvider> = create_provider(&config.embedding)?;
    if !config.embedding.is_enabled() {
        bail!("Embeddings are disabled; set [embedding] provider to ingest");
    }

    let pool = db::connect(config).await?;
    let index = SqliteIndex::open(pool.clone())
        .await?
        .with_model(embedder.model_name());

    let report = ingest_directory(
        &root,
        &config.ingest,
        &config.chunking,
        embedder.as_ref(),
        &index,
    )
    .await?;

    println!("ingest {}", root.display());
    println!("  files seen: {}", report.files_seen);
    println!("  ingested: {}", report.files_ingested);
    println!("  skipped: {}", report.files_skipped);
    println!("  failed: {}", report.files_failed);
    for (file, reason) in &report.failures {
        println!("    {}: {}", file, reason);
    }
    println!("  chunks written: {}", report.chunks_written);
    println!("ok");

    pool.close().await;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{DisabledProvider, HashedProvider};
    use crate::index::InMemoryIndex;
    use crate::models::{ChunkMetadata, KnowledgeChunk};
    use std::fs;

    const BODY: &str = "Assignments submitted after the deadline lose ten percent per day late.";

    fn write(root: &Path, rel: &str, contents: &[u8]) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn workspace() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "policies.md", format!("# Policies\n## Late work\n{BODY}\n## Tiny\nshort\n").as_bytes());
        write(root, "notes/syllabus.txt", format!("# Syllabus\n\n{BODY}").as_bytes());
        write(root, ".git/HEAD.md", b"# ignored\n## x\nnot knowledge at all, just git internals here");
        write(root, "__MACOSX/._policies.md", b"junk");
        write(root, "image.png", b"\x89PNG");
        write(root, "broken.pdf", b"not really a pdf");
        dir
    }

    #[test]
    fn scan_applies_globs_and_default_excludes() {
        let dir = workspace();
        let files = scan_knowledge_dir(dir.path(), &IngestConfig::default()).unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.relative.as_str()).collect();
        assert_eq!(names, ["broken.pdf", "notes/syllabus.txt", "policies.md"]);
    }

    #[test]
    fn scan_rejects_missing_root() {
        assert!(scan_knowledge_dir(Path::new("/definitely/not/here"), &IngestConfig::default()).is_err());
    }

    #[tokio::test]
    async fn ingest_counts_outcomes_and_replaces_index() {
        let dir = workspace();
        let index = InMemoryIndex::new();
        let stale = KnowledgeChunk {
            id: "stale".into(),
            content: "old".into(),
            hash: "h".into(),
            metadata: ChunkMetadata::default(),
        };
        index.upsert(&stale, &[1.0; 256]).await.unwrap();

        let report = ingest_directory(
            dir.path(),
            &IngestConfig::default(),
            &ChunkingConfig::default(),
            &HashedProvider::new(256),
            &index,
        )
        .await
        .unwrap();

        assert_eq!(report.files_seen, 3);
        assert_eq!(report.files_ingested, 2);
        assert_eq!(report.files_failed, 1);
        assert_eq!(report.failures[0].0, "broken.pdf");
        assert_eq!(report.chunks_written, 2);
        assert_eq!(index.count().await.unwrap(), 2);

        let hits = index
            .search(&HashedProvider::new(256).embed(BODY).await.unwrap(), 0.5, 5)
            .await
            .unwrap();
        let titles: Vec<&str> = hits.iter().map(|h| h.metadata.title.as_str()).collect();
        assert!(titles.contains(&"Policies > Late work"));
        assert!(titles.contains(&"Syllabus > Part 1"));
    }

    #[tokio::test]
    async fn oversized_files_are_skipped() {
        let dir = workspace();
        let config = IngestConfig {
            max_file_bytes: 10,
            ..Default::default()
        };
        let report = ingest_directory(
            dir.path(),
            &config,
            &ChunkingConfig::default(),
            &HashedProvider::new(8),
            &InMemoryIndex::new(),
        )
        .await
        .unwrap();
        assert_eq!(report.files_skipped, 3);
        assert_eq!(report.chunks_written, 0);
    }

    #[tokio::test]
    async fn embedding_failures_fail_the_file_not_the_run() {
        let dir = workspace();
        let report = ingest_directory(
            dir.path(),
            &IngestConfig::default(),
            &ChunkingConfig::default(),
            &DisabledProvider,
            &InMemoryIndex::new(),
        )
        .await
        .unwrap();
        assert_eq!(report.files_failed, 3);
        assert_eq!(report.files_ingested, 0);
    }
}
