//! Format detection and text extraction for uploaded documents.
//!
//! [`parse`] is the never-failing entry point: unsupported formats and
//! broken files both come back as `None`, with the reason logged. Use
//! [`try_parse`] to get the typed [`ExtractError`] instead.
//!
//! | Kind | Detected by | Output |
//! |------|-------------|--------|
//! | PDF | `application/pdf`, `.pdf` | trimmed text, or `is_scanned` for text-less pages |
//! | DOCX | OOXML word type, `.docx` | raw paragraph text, title from `docProps/core.xml` |
//! | Cartridge | IMS types, `.imscc`, generic zip | manifest tree (see [`crate::cartridge`]) |
//! | Text | `text/plain`, `text/markdown`, `.md`, `.txt` | trimmed text, title from first `# ` line |

use std::io::{Cursor, Read};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;

use tracing::{debug, warn};

use crate::cartridge;
use crate::models::{ParseMetadata, ParseResult, ParsedContent, SourceDocument};
use crate::xml::XmlError;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_IMSCC: &str = "application/vnd.ims.imsccv1p1";
pub const MIME_ZIP: &str = "application/zip";

const CARTRIDGE_MIME_TYPES: &[&str] = &[
    MIME_IMSCC,
    "application/vnd.ims.imsccv1p2",
    "application/vnd.ims.imsccv1p3",
    "application/imscc",
];
const GENERIC_ZIP_MIME_TYPES: &[&str] = &[MIME_ZIP, "application/x-zip-compressed", "application/x-zip"];
const TEXT_MIME_TYPES: &[&str] = &["text/plain", "text/markdown", "text/x-markdown"];

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
pub(crate) const MAX_ZIP_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Largest upload the HTTP parse endpoint accepts.
pub const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

/// Reasons a document could not be extracted.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("unsupported document: media type '{media_type}', file '{file_name}'")]
    Unsupported { media_type: String, file_name: String },
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("DOCX extraction failed: {0}")]
    Docx(String),
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("I/O error reading archive entry: {0}")]
    Io(#[from] std::io::Error),
    #[error("archive entry {name} exceeds {limit} bytes")]
    EntryTooLarge { name: String, limit: u64 },
    #[error("no imsmanifest.xml found in archive")]
    ManifestNotFound,
    #[error("invalid manifest XML: {0}")]
    Manifest(#[from] XmlError),
}

/// The closed set of formats the parser understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    Docx,
    Cartridge,
    Text,
    Unsupported,
}

impl DocumentKind {
    /// Picks a kind from the declared media type and the file name.
    ///
    /// A specific media type wins; otherwise the extension decides; a
    /// generic zip type with no telling extension is read as a cartridge.
    pub fn detect(media_type: &str, file_name: &str) -> Self {
        let media_type = normalize_media_type(media_type);
        let mt = media_type.as_str();

        if mt == MIME_PDF {
            return DocumentKind::Pdf;
        }
        if mt == MIME_DOCX {
            return DocumentKind::Docx;
        }
        if CARTRIDGE_MIME_TYPES.contains(&mt) {
            return DocumentKind::Cartridge;
        }
        if TEXT_MIME_TYPES.contains(&mt) {
            return DocumentKind::Text;
        }

        let extension = Path::new(file_name)
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase());
        match extension.as_deref() {
            Some("pdf") => return DocumentKind::Pdf,
            Some("docx") => return DocumentKind::Docx,
            Some("imscc") => return DocumentKind::Cartridge,
            Some("md") | Some("markdown") | Some("txt") => return DocumentKind::Text,
            _ => {}
        }

        if GENERIC_ZIP_MIME_TYPES.contains(&mt) {
            return DocumentKind::Cartridge;
        }
        DocumentKind::Unsupported
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Pdf => "pdf",
            DocumentKind::Docx => "docx",
            DocumentKind::Cartridge => "cartridge",
            DocumentKind::Text => "text",
            DocumentKind::Unsupported => "unsupported",
        }
    }
}

fn normalize_media_type(media_type: &str) -> String {
    media_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Parses a document, degrading every failure to `None`.
///
/// `None` means "cannot extract": either the format is unsupported or the
/// file is broken. Neither is an error for the caller; a batch run simply
/// moves on to the next file.
pub fn parse(bytes: &[u8], media_type: &str, file_name: &str) -> Option<ParseResult> {
    match try_parse(bytes, media_type, file_name) {
        Ok(result) => Some(result),
        Err(ExtractError::Unsupported { .. }) => {
            debug!(file_name, media_type, "unsupported document type");
            None
        }
        Err(e) => {
            warn!(file_name, media_type, error = %e, "document parse failed");
            None
        }
    }
}

/// [`parse`] for an owned upload.
pub fn parse_source(doc: &SourceDocument) -> Option<ParseResult> {
    parse(&doc.bytes, &doc.media_type, &doc.file_name)
}

/// Parses a document, returning the typed failure.
pub fn try_parse(bytes: &[u8], media_type: &str, file_name: &str) -> Result<ParseResult, ExtractError> {
    let kind = DocumentKind::detect(media_type, file_name);
    debug!(file_name, media_type, kind = kind.as_str(), "dispatching document parser");
    match kind {
        DocumentKind::Pdf => parse_pdf(bytes),
        DocumentKind::Docx => parse_docx(bytes),
        DocumentKind::Cartridge => cartridge::try_extract_cartridge(bytes),
        DocumentKind::Text => Ok(parse_plain_text(bytes)),
        DocumentKind::Unsupported => Err(ExtractError::Unsupported {
            media_type: media_type.to_string(),
            file_name: file_name.to_string(),
        }),
    }
}

/// User-facing wording for a parse outcome, `None` when the text is usable.
pub fn outcome_message(result: Option<&ParseResult>) -> Option<&'static str> {
    match result {
        None => Some("We could not extract text from this file. Supported formats are PDF, DOCX, IMSCC and plain text."),
        Some(r) if r.is_scanned() => Some(
            "This looks like a scanned document. Its pages contain no selectable text, so it cannot be summarized or searched.",
        ),
        Some(r) => match &r.content {
            ParsedContent::Text(text) if text.is_empty() => {
                Some("We could not extract enough text from this file to work with.")
            }
            _ => None,
        },
    }
}

fn parse_pdf(bytes: &[u8]) -> Result<ParseResult, ExtractError> {
    let page_count = lopdf::Document::load_mem(bytes)
        .map_err(|e| ExtractError::Pdf(e.to_string()))?
        .get_pages()
        .len();

    // pdf-extract panics on some malformed font tables.
    let text = catch_unwind(AssertUnwindSafe(|| pdf_extract::extract_text_from_mem(bytes)))
        .map_err(|_| ExtractError::Pdf("text extractor panicked".to_string()))?
        .map_err(|e| ExtractError::Pdf(e.to_string()))?;
    let text = text.trim();

    let is_scanned = text.is_empty() && page_count > 0;
    if is_scanned {
        debug!(page_count, "PDF has pages but no extractable text");
    }

    Ok(ParseResult {
        content: ParsedContent::Text(text.to_string()),
        title: None,
        metadata: Some(ParseMetadata {
            is_scanned,
            page_count: Some(page_count),
        }),
    })
}

pub(crate) fn read_zip_entry_bounded<R: Read + std::io::Seek>(
    archive: &mut zip::ZipArchive<R>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive.by_name(name)?;
    let mut out = Vec::new();
    entry.take(max_bytes + 1).read_to_end(&mut out)?;
    if out.len() as u64 > max_bytes {
        return Err(ExtractError::EntryTooLarge {
            name: name.to_string(),
            limit: max_bytes,
        });
    }
    Ok(out)
}

fn parse_docx(bytes: &[u8]) -> Result<ParseResult, ExtractError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    if archive.index_for_name("word/document.xml").is_none() {
        return Err(ExtractError::Docx("word/document.xml not found".to_string()));
    }
    let doc_xml = read_zip_entry_bounded(&mut archive, "word/document.xml", MAX_ZIP_ENTRY_BYTES)?;
    let text = extract_docx_text(&doc_xml)?;

    let title = if archive.index_for_name("docProps/core.xml").is_some() {
        read_zip_entry_bounded(&mut archive, "docProps/core.xml", MAX_ZIP_ENTRY_BYTES)
            .ok()
            .and_then(|xml| core_properties_title(&xml))
    } else {
        None
    };

    Ok(ParseResult {
        content: ParsedContent::Text(text.trim().to_string()),
        title,
        metadata: None,
    })
}

/// Collects `w:t` runs, one blank line between paragraphs.
fn extract_docx_text(xml: &[u8]) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_text = false;
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_text = true;
                }
            }
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"tab" => current.push('\t'),
                b"br" | b"cr" => current.push('\n'),
                _ => {}
            },
            Ok(Event::Text(te)) if in_text => {
                let text = te.unescape().map_err(|e| ExtractError::Docx(e.to_string()))?;
                current.push_str(&text);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    let para = current.trim();
                    if !para.is_empty() {
                        paragraphs.push(para.to_string());
                    }
                    current.clear();
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Docx(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    let tail = current.trim();
    if !tail.is_empty() {
        paragraphs.push(tail.to_string());
    }
    Ok(paragraphs.join("\n\n"))
}

fn core_properties_title(xml: &[u8]) -> Option<String> {
    let root = crate::xml::parse_document(xml).ok()?;
    root.child_local("title")
        .and_then(|t| t.text())
        .map(str::to_string)
}

fn parse_plain_text(bytes: &[u8]) -> ParseResult {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    let title = text
        .lines()
        .find_map(|line| line.strip_prefix("# "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());
    ParseResult {
        content: ParsedContent::Text(text.to_string()),
        title,
        metadata: None,
    }
}
