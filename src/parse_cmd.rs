//! `crag parse`: run the format parser on a local file.

use anyhow::{Context, Result};
use std::path::Path;

use crate::cartridge::outline;
use crate::extract::{self, DocumentKind};
use crate::models::{ParsedContent, SourceDocument};

/// Parses `path` and prints the outcome.
///
/// Without `media_type` the kind is detected from the file extension.
/// With `json` the full [`ParseResult`](crate::models::ParseResult) is
/// printed instead of the human-readable summary.
pub fn run_parse(path: &Path, media_type: Option<&str>, json: bool) -> Result<()> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let doc = SourceDocument::new(
        bytes,
        media_type.unwrap_or("application/octet-stream"),
        file_name,
    );
    let kind = DocumentKind::detect(&doc.media_type, &doc.file_name);

    let parsed = extract::parse_source(&doc);
    let message = extract::outcome_message(parsed.as_ref());

    if json {
        println!("{}", serde_json::to_string_pretty(&parsed)?);
        return Ok(());
    }

    println!("file:    {}", path.display());
    println!("kind:    {}", kind.as_str());
    let Some(result) = parsed else {
        if let Some(message) = message {
            println!("status:  {}", message);
        }
        return Ok(());
    };

    println!("title:   {}", result.title.as_deref().unwrap_or("(none)"));
    if let Some(meta) = &result.metadata {
        if let Some(pages) = meta.page_count {
            println!("pages:   {}", pages);
        }
        println!("scanned: {}", meta.is_scanned);
    }
    if let Some(message) = message {
        println!("status:  {}", message);
    }
    println!();

    match &result.content {
        ParsedContent::Text(text) => {
            println!("--- Text ({} chars) ---", text.chars().count());
            println!("{}", text);
        }
        ParsedContent::Manifest(manifest) => {
            let items = outline(manifest);
            println!("--- Outline ({} items) ---", items.len());
            for item in items {
                println!("{}- {}", "  ".repeat(item.depth), item.title);
            }
        }
    }

    Ok(())
}
