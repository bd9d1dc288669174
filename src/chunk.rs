//! Chunkers that turn documents into [`KnowledgeChunk`]s.
//!
//! - [`chunk_markdown`] cuts authored knowledge-base articles at `## `
//!   headings, carrying the `# ` document title into every chunk.
//! - [`chunk_text`] cuts extracted document bodies (PDF, DOCX, plain text)
//!   on paragraph boundaries under a token budget.
//!
//! Both drop fragments whose trimmed body is not longer than the minimum
//! significance threshold, and both are deterministic: the same input
//! always yields the same chunks, ids included.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::{ChunkMetadata, KnowledgeChunk};

/// Default minimum body length (in chars) for a chunk to be kept.
pub const DEFAULT_MIN_SECTION_CHARS: usize = 50;

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Splits a markdown article into one chunk per `## ` section.
///
/// A single forward pass over lines: `# ` sets the document title, `## `
/// closes the open section and starts the next, everything else is body.
/// Text before the first `## ` forms an untitled preamble section. A
/// section is emitted only if its trimmed body has more than
/// `min_section_chars` characters.
///
/// Each chunk's content is rebuilt as `"# <H1>\n\n## <H2>\n\n<body>"` so it
/// reads on its own, and its title is the breadcrumb `"H1 > H2"`.
///
/// # Example
///
/// ```rust
/// use course_rag::chunk::chunk_markdown;
///
/// let md = "# Guide\n## Setup\nInstall the toolchain, then run the bootstrap script once.\n## FAQ\nSee below.";
/// let chunks = chunk_markdown(md, "guide.md", 50);
/// assert_eq!(chunks.len(), 1);
/// assert_eq!(chunks[0].metadata.title, "Guide > Setup");
/// ```
pub fn chunk_markdown(text: &str, file: &str, min_section_chars: usize) -> Vec<KnowledgeChunk> {
    let mut chunks = Vec::new();
    let mut doc_title = String::new();
    let mut section = String::new();
    let mut body = String::new();

    for line in text.lines() {
        if let Some(heading) = line.strip_prefix("## ") {
            flush_section(&mut chunks, file, &doc_title, &section, &body, min_section_chars);
            section = heading.trim().to_string();
            body.clear();
        } else if let Some(heading) = line.strip_prefix("# ") {
            doc_title = heading.trim().to_string();
        } else {
            body.push_str(line);
            body.push('\n');
        }
    }
    flush_section(&mut chunks, file, &doc_title, &section, &body, min_section_chars);

    chunks
}

fn flush_section(
    chunks: &mut Vec<KnowledgeChunk>,
    file: &str,
    doc_title: &str,
    section: &str,
    body: &str,
    min_section_chars: usize,
) {
    let body = body.trim();
    if body.chars().count() <= min_section_chars {
        return;
    }

    let mut content = String::new();
    if !doc_title.is_empty() {
        content.push_str("# ");
        content.push_str(doc_title);
        content.push_str("\n\n");
    }
    if !section.is_empty() {
        content.push_str("## ");
        content.push_str(section);
        content.push_str("\n\n");
    }
    content.push_str(body);

    let index = chunks.len();
    chunks.push(make_chunk(
        file,
        index,
        content,
        section.to_string(),
        breadcrumb(&[doc_title, section]),
    ));
}

fn breadcrumb(parts: &[&str]) -> String {
    parts
        .iter()
        .filter(|p| !p.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" > ")
}

/// Splits extracted body text into chunks on paragraph boundaries.
///
/// Paragraphs (`\n\n`-separated) are packed into chunks of at most
/// `max_tokens × 4` chars; an oversized paragraph is hard-split at the
/// nearest newline or space. Chunks are labelled `"<title> > Part N"` and
/// pieces whose trimmed length is not above `min_chars` are dropped.
pub fn chunk_text(
    text: &str,
    file: &str,
    title: &str,
    max_tokens: usize,
    min_chars: usize,
) -> Vec<KnowledgeChunk> {
    let max_chars = (max_tokens * CHARS_PER_TOKEN).max(1);
    let mut pieces: Vec<String> = Vec::new();
    let mut current_buf = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        let would_be = if current_buf.is_empty() {
            trimmed.len()
        } else {
            current_buf.len() + 2 + trimmed.len()
        };

        if would_be > max_chars && !current_buf.is_empty() {
            pieces.push(std::mem::take(&mut current_buf));
        }

        if trimmed.len() > max_chars {
            let mut remaining = trimmed;
            while !remaining.is_empty() {
                let split_at = floor_char_boundary(remaining, max_chars);
                let actual_split = if split_at < remaining.len() {
                    remaining[..split_at]
                        .rfind('\n')
                        .or_else(|| remaining[..split_at].rfind(' '))
                        .map(|pos| pos + 1)
                        .unwrap_or(split_at)
                } else {
                    split_at
                };
                pieces.push(remaining[..actual_split].trim().to_string());
                remaining = &remaining[actual_split..];
            }
        } else {
            if !current_buf.is_empty() {
                current_buf.push_str("\n\n");
            }
            current_buf.push_str(trimmed);
        }
    }
    if !current_buf.is_empty() {
        pieces.push(current_buf);
    }

    let mut chunks = Vec::new();
    for piece in pieces {
        if piece.chars().count() <= min_chars {
            continue;
        }
        let index = chunks.len();
        let section = format!("Part {}", index + 1);
        let label = breadcrumb(&[title, &section]);
        chunks.push(make_chunk(file, index, piece, section, label));
    }
    chunks
}

/// Largest byte index `<= max` that falls on a char boundary (at least one char).
fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut idx = max;
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    if idx == 0 {
        s.chars().next().map(char::len_utf8).unwrap_or(s.len())
    } else {
        idx
    }
}

fn make_chunk(
    file: &str,
    index: usize,
    content: String,
    section: String,
    title: String,
) -> KnowledgeChunk {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let hash = format!("{:x}", hasher.finalize());
    let id = Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("{file}#{index}").as_bytes()).to_string();

    KnowledgeChunk {
        id,
        content,
        hash,
        metadata: ChunkMetadata {
            file: file.to_string(),
            section,
            title,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LONG: &str = "Install the toolchain with rustup, then run the bootstrap script once.";

    #[test]
    fn short_sections_are_dropped() {
        let md = format!("# Guide\n## Setup\n{LONG}\n## FAQ\nSee below.\n");
        let chunks = chunk_markdown(&md, "guide.md", DEFAULT_MIN_SECTION_CHARS);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].metadata.title, "Guide > Setup");
        assert_eq!(chunks[0].metadata.section, "Setup");
        assert_eq!(chunks[0].metadata.file, "guide.md");
        assert_eq!(chunks[0].content, format!("# Guide\n\n## Setup\n\n{LONG}"));
    }

    #[test]
    fn threshold_is_strictly_exceeded() {
        let exactly = "x".repeat(50);
        let md = format!("# T\n## A\n{exactly}\n## B\n{exactly}y\n");
        let chunks = chunk_markdown(&md, "t.md", 50);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].metadata.section, "B");
    }

    #[test]
    fn sections_keep_document_order_and_subheadings() {
        let md = format!(
            "# Handbook\n## One\n{LONG}\n### Detail\nmore\n## Two\n{LONG}\n## Three\n{LONG}"
        );
        let chunks = chunk_markdown(&md, "h.md", 50);
        let sections: Vec<&str> = chunks.iter().map(|c| c.metadata.section.as_str()).collect();
        assert_eq!(sections, ["One", "Two", "Three"]);
        assert!(chunks[0].content.contains("### Detail\nmore"));
    }

    #[test]
    fn preamble_is_kept_when_long_enough() {
        let md = format!("# Policies\n{LONG}\n## Late work\n{LONG}");
        let chunks = chunk_markdown(&md, "p.md", 50);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].metadata.title, "Policies");
        assert_eq!(chunks[0].metadata.section, "");
        assert_eq!(chunks[0].content, format!("# Policies\n\n{LONG}"));
        assert_eq!(chunks[1].metadata.title, "Policies > Late work");
    }

    #[test]
    fn missing_h1_yields_section_only_breadcrumb() {
        let md = format!("## Alone\n{LONG}");
        let chunks = chunk_markdown(&md, "a.md", 50);
        assert_eq!(chunks[0].metadata.title, "Alone");
        assert!(chunks[0].content.starts_with("## Alone\n\n"));
    }

    #[test]
    fn rechunking_is_identical() {
        let md = format!("# G\n## A\n{LONG}\n## B\n{LONG}\n");
        let a = chunk_markdown(&md, "g.md", 50);
        let b = chunk_markdown(&md, "g.md", 50);
        assert_eq!(a, b);
        assert_ne!(a[0].id, a[1].id);
    }

    #[test]
    fn ids_differ_across_files() {
        let md = format!("# G\n## A\n{LONG}\n");
        let a = chunk_markdown(&md, "a.md", 50);
        let b = chunk_markdown(&md, "b.md", 50);
        assert_ne!(a[0].id, b[0].id);
        assert_eq!(a[0].hash, b[0].hash);
    }

    #[test]
    fn empty_document_has_no_chunks() {
        assert!(chunk_markdown("", "e.md", 50).is_empty());
        assert!(chunk_text("", "e.pdf", "E", 700, 50).is_empty());
    }

    #[test]
    fn text_chunks_pack_paragraphs_under_budget() {
        // max_tokens = 20 => 80 chars per chunk
        let text = format!("{LONG}\n\n{LONG}\n\n{LONG}");
        let chunks = chunk_text(&text, "notes.pdf", "Notes", 20, 10);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].metadata.title, "Notes > Part 1");
        assert_eq!(chunks[2].metadata.section, "Part 3");
        assert!(chunks.iter().all(|c| c.content.len() <= 80));
    }

    #[test]
    fn oversized_paragraph_is_hard_split() {
        let text = "word ".repeat(100);
        let chunks = chunk_text(&text, "big.txt", "Big", 10, 0);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.content.len() <= 40));
    }

    #[test]
    fn hard_split_respects_char_boundaries() {
        let text = "é".repeat(30);
        let chunks = chunk_text(&text, "u.txt", "U", 2, 0);
        assert!(!chunks.is_empty());
        let rebuilt: String = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(rebuilt, text);
    }
}
