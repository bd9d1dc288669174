//! Core data models used throughout the pipeline.
//!
//! These types represent the documents, chunks, search results and chat
//! turns that flow through ingestion and retrieval. Parse inputs and outputs
//! are transient; [`KnowledgeChunk`]s live in the vector index until the
//! next full re-ingestion.

use serde::{Deserialize, Serialize};

use crate::xml::XmlNode;

/// An uploaded file as handed to the format parser.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub bytes: Vec<u8>,
    /// Declared media type. Often generic (`application/zip`,
    /// `application/octet-stream`), so the file name is consulted too.
    pub media_type: String,
    pub file_name: String,
}

impl SourceDocument {
    pub fn new(bytes: Vec<u8>, media_type: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            bytes,
            media_type: media_type.into(),
            file_name: file_name.into(),
        }
    }
}

/// Extracted payload of a parsed document.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ParsedContent {
    /// Plain text (PDF, DOCX, text files).
    Text(String),
    /// The normalized `imsmanifest.xml` tree of a course cartridge.
    Manifest(XmlNode),
}

impl ParsedContent {
    /// Returns the text payload, or `None` for structured content.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ParsedContent::Text(text) => Some(text),
            ParsedContent::Manifest(_) => None,
        }
    }
}

/// Extra facts about a parse outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParseMetadata {
    /// A paginated document with pages but no extractable text.
    pub is_scanned: bool,
    pub page_count: Option<usize>,
}

/// Result of a successful parse.
///
/// Empty text from a paginated source with at least one page is reported
/// with `is_scanned = true`, never as a failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParseResult {
    pub content: ParsedContent,
    pub title: Option<String>,
    pub metadata: Option<ParseMetadata>,
}

impl ParseResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: ParsedContent::Text(text.into()),
            title: None,
            metadata: None,
        }
    }

    pub fn is_scanned(&self) -> bool {
        self.metadata.as_ref().is_some_and(|m| m.is_scanned)
    }
}

/// Where a chunk came from and how to label it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Source file path, relative to the ingestion root.
    pub file: String,
    /// The section heading (H2) the chunk was cut from; empty for a preamble.
    pub section: String,
    /// Breadcrumb title, e.g. `"Guide > Setup"`.
    pub title: String,
}

/// A section-level unit of indexed knowledge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeChunk {
    /// Deterministic key derived from the file and section ordinal.
    pub id: String,
    /// Self-describing text, including its heading breadcrumb.
    pub content: String,
    /// SHA-256 of `content`.
    pub hash: String,
    pub metadata: ChunkMetadata,
}

/// A ranked match returned from the vector index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub id: String,
    pub content: String,
    pub metadata: ChunkMetadata,
    /// Cosine similarity in `[-1.0, 1.0]`; higher is more relevant.
    pub similarity: f32,
}

/// Speaker of a chat turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One turn of conversation history supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// One event of an answer stream.
///
/// A stream is a sequence of `Token`s terminated by exactly one of `Done`
/// or `Failed`. Tokens sent before a `Failed` remain valid output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Token(String),
    Done,
    Failed(String),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Token(_))
    }
}
