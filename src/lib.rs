//! # Course RAG
//!
//! Retrieval-augmented question answering over course material.
//!
//! Instructors drop knowledge-base articles and course documents into a
//! directory; `crag ingest` parses, chunks and embeds them into a SQLite
//! vector index. At question time the pipeline embeds the question, keeps
//! the chunks above the profile's similarity threshold, assembles them
//! into a numbered context and streams a model's answer back.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌─────────────┐   ┌───────────┐
//! │ Format parser│──▶│ Chunk+Embed │──▶│  SQLite   │
//! │ PDF/DOCX/CC  │   │             │   │  vectors  │
//! └──────────────┘   └─────────────┘   └─────┬─────┘
//!                                            │ threshold + top-k
//!                                            ▼
//!                    ┌─────────────┐   ┌───────────┐
//!                    │  Streaming  │◀──│  Context  │
//!                    │   answer    │   │ assembler │
//!                    └──────┬──────┘   └───────────┘
//!                           ▼
//!                    CLI (crag) / HTTP (SSE)
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Core data types |
//! | [`xml`] | Normalized XML tree |
//! | [`extract`] | Format detection and text extraction |
//! | [`cartridge`] | IMS Common Cartridge manifest extraction |
//! | [`chunk`] | Markdown section and paragraph chunkers |
//! | [`embedding`] | Embedding providers and the shared local model |
//! | [`index`] | Vector index with threshold and top-k search |
//! | [`context`] | Numbered source context assembly |
//! | [`generation`] | Streaming answer providers |
//! | [`rag`] | Query-time orchestration |
//! | [`ingest`] | Knowledge directory ingestion |
//! | [`server`] | HTTP API |
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema setup |

pub mod cartridge;
pub mod chunk;
pub mod config;
pub mod context;
pub mod db;
pub mod embedding;
pub mod extract;
pub mod generation;
pub mod index;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod parse_cmd;
pub mod rag;
pub mod search;
pub mod server;
pub mod xml;
