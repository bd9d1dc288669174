//! TOML configuration.
//!
//! Loaded once by the CLI via [`load_config`], validated, then overlaid
//! with environment overrides. Secrets never live in the file: API keys
//! are read from the environment variable the file names.
//!
//! | Env var | Overrides |
//! |---------|-----------|
//! | `CRAG_DB_PATH` | `db.path` |
//! | `CRAG_EMBEDDING_MODEL` | `embedding.model` |
//! | `CRAG_GENERATION_MODEL` | `generation.model` |

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::chunk::DEFAULT_MIN_SECTION_CHARS;
use crate::index::RetrievalProfile;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Sections whose trimmed body is not longer than this are dropped.
    #[serde(default = "default_min_section_chars")]
    pub min_section_chars: usize,
    /// Token budget for paragraph chunks of extracted documents.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            min_section_chars: default_min_section_chars(),
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_min_section_chars() -> usize {
    DEFAULT_MIN_SECTION_CHARS
}
fn default_max_tokens() -> usize {
    700
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_knowledge_base_profile")]
    pub knowledge_base: RetrievalProfile,
    #[serde(default = "default_support_profile")]
    pub support: RetrievalProfile,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            knowledge_base: default_knowledge_base_profile(),
            support: default_support_profile(),
            max_context_chars: default_max_context_chars(),
        }
    }
}

impl RetrievalConfig {
    /// Looks up a profile by name (`knowledge_base` or `support`).
    pub fn profile(&self, name: &str) -> Result<RetrievalProfile> {
        match name {
            "knowledge_base" | "kb" => Ok(self.knowledge_base),
            "support" => Ok(self.support),
            other => bail!(
                "Unknown retrieval profile: '{}'. Must be knowledge_base or support.",
                other
            ),
        }
    }
}

fn default_knowledge_base_profile() -> RetrievalProfile {
    RetrievalProfile::KNOWLEDGE_BASE
}
fn default_support_profile() -> RetrievalProfile {
    RetrievalProfile::SUPPORT
}
fn default_max_context_chars() -> usize {
    12_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the `openai` provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            api_key_env: default_api_key_env(),
            base_url: None,
            system_prompt: None,
            temperature: None,
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_connect_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7331".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_ingest_root")]
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            root: default_ingest_root(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
            max_file_bytes: default_max_file_bytes(),
        }
    }
}

fn default_ingest_root() -> PathBuf {
    PathBuf::from("./knowledge")
}
fn default_include_globs() -> Vec<String> {
    ["**/*.md", "**/*.markdown", "**/*.pdf", "**/*.docx", "**/*.txt"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_max_file_bytes() -> u64 {
    50 * 1024 * 1024
}

/// Reads, parses, validates and env-overlays the configuration file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    validate(&config)?;
    Ok(config)
}

/// Applies `CRAG_*` overrides using `lookup` to read variables.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(path) = lookup("CRAG_DB_PATH").filter(|v| !v.is_empty()) {
        config.db.path = PathBuf::from(path);
    }
    if let Some(model) = lookup("CRAG_EMBEDDING_MODEL").filter(|v| !v.is_empty()) {
        config.embedding.model = Some(model);
    }
    if let Some(model) = lookup("CRAG_GENERATION_MODEL").filter(|v| !v.is_empty()) {
        config.generation.model = Some(model);
    }
}

pub fn validate(config: &Config) -> Result<()> {
    if config.chunking.min_section_chars == 0 {
        bail!("chunking.min_section_chars must be > 0");
    }
    if config.chunking.max_tokens == 0 {
        bail!("chunking.max_tokens must be > 0");
    }

    for (name, profile) in [
        ("knowledge_base", &config.retrieval.knowledge_base),
        ("support", &config.retrieval.support),
    ] {
        if !(-1.0..=1.0).contains(&profile.threshold) {
            bail!("retrieval.{}.threshold must be in [-1.0, 1.0]", name);
        }
        if profile.top_k == 0 {
            bail!("retrieval.{}.top_k must be >= 1", name);
        }
    }

    if config.embedding.is_enabled() && config.embedding.provider != "local" {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    if config.embedding.provider == "openai" && config.embedding.model.is_none() {
        bail!("embedding.model must be specified when provider is 'openai'");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "local" | "hashed" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, local, or hashed.",
            other
        ),
    }

    match config.generation.provider.as_str() {
        "disabled" | "openai" | "gemini" => {}
        other => bail!(
            "Unknown generation provider: '{}'. Must be disabled, openai, or gemini.",
            other
        ),
    }
    if config.generation.provider != "disabled" && config.generation.model.is_none() {
        bail!(
            "generation.model must be specified when provider is '{}'",
            config.generation.provider
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[db]
path = "./data/crag.sqlite"
"#;

    fn parse(toml_src: &str) -> Config {
        toml::from_str(toml_src).unwrap()
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse(MINIMAL);
        validate(&config).unwrap();
        assert_eq!(config.chunking.min_section_chars, 50);
        assert_eq!(config.retrieval.knowledge_base, RetrievalProfile::KNOWLEDGE_BASE);
        assert_eq!(config.retrieval.support, RetrievalProfile::SUPPORT);
        assert_eq!(config.embedding.provider, "disabled");
        assert_eq!(config.generation.api_key_env, "OPENAI_API_KEY");
        assert!(config.ingest.include_globs.contains(&"**/*.md".to_string()));
    }

    #[test]
    fn profiles_are_overridable() {
        let config = parse(
            r#"
[db]
path = "x.sqlite"
[retrieval.support]
threshold = 0.8
top_k = 2
"#,
        );
        let support = config.retrieval.profile("support").unwrap();
        assert_eq!(support.top_k, 2);
        assert!((support.threshold - 0.8).abs() < 1e-6);
        assert!(config.retrieval.profile("nope").is_err());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = parse(MINIMAL);
        config.retrieval.support.top_k = 0;
        assert!(validate(&config).is_err());

        let mut config = parse(MINIMAL);
        config.embedding.provider = "quantum".into();
        assert!(validate(&config).is_err());

        let mut config = parse(MINIMAL);
        config.generation.provider = "openai".into();
        assert!(validate(&config).is_err());

        let mut config = parse(MINIMAL);
        config.embedding.provider = "hashed".into();
        assert!(validate(&config).is_err());
        config.embedding.dims = Some(64);
        validate(&config).unwrap();
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = parse(MINIMAL);
        apply_env_overrides(&mut config, |key| match key {
            "CRAG_DB_PATH" => Some("/tmp/other.sqlite".to_string()),
            "CRAG_GENERATION_MODEL" => Some("gpt-4o-mini".to_string()),
            "CRAG_EMBEDDING_MODEL" => Some(String::new()),
            _ => None,
        });
        assert_eq!(config.db.path, PathBuf::from("/tmp/other.sqlite"));
        assert_eq!(config.generation.model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(config.embedding.model, None);
    }
}
