//! TOML configuration.
//!
//! ```toml
//! [db]
//! path = "./data/kb.sqlite"
//!
//! [chunking]
//! max_chars = 1800
//! overlap = 300
//!
//! [retrieval]
//! max_candidates = 100
//!
//! [embedding]
//! provider = "ollama"
//! model = "nomic-embed-text"
//! dims = 768
//!
//! [reranker]
//! provider = "http"
//! url = "http://localhost:8082"
//!
//! [writer]
//! max_attempts = 10
//! base_delay_ms = 200
//! ```
//!
//! Every section except `[db]` is optional and falls back to the defaults below.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

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
    pub reranker: RerankerConfig,
    #[serde(default)]
    pub writer: WriterConfig,
}

impl Config {
    /// A config with every section at its default, pointing at `db_path`.
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
                busy_timeout_ms: default_busy_timeout_ms(),
                max_connections: default_max_connections(),
            },
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            embedding: EmbeddingConfig::default(),
            reranker: RerankerConfig::default(),
            writer: WriterConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_busy_timeout_ms() -> u64 {
    5000
}
fn default_max_connections() -> u32 {
    5
}

/// Engine-wide chunk sizing. Knowledge-base settings override these per
/// source kind.
#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            overlap: default_overlap(),
        }
    }
}

fn default_max_chars() -> usize {
    1800
}
fn default_overlap() -> usize {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
    #[serde(default = "default_howto_pool_floor")]
    pub howto_pool_floor: usize,
    #[serde(default = "default_howto_pool_cap")]
    pub howto_pool_cap: usize,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Number of leading content characters used as the dedup key.
    #[serde(default = "default_dedup_prefix_chars")]
    pub dedup_prefix_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_candidates: default_max_candidates(),
            howto_pool_floor: default_howto_pool_floor(),
            howto_pool_cap: default_howto_pool_cap(),
            top_k: default_top_k(),
            dedup_prefix_chars: default_dedup_prefix_chars(),
        }
    }
}

fn default_max_candidates() -> usize {
    100
}
fn default_howto_pool_floor() -> usize {
    300
}
fn default_howto_pool_cap() -> usize {
    500
}
fn default_top_k() -> usize {
    5
}
fn default_dedup_prefix_chars() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the Ollama provider.
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
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
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
pub struct RerankerConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            url: None,
            timeout_secs: 30,
        }
    }
}

impl RerankerConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

/// Write retry and batching knobs.
#[derive(Debug, Deserialize, Clone)]
pub struct WriterConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    /// Relative jitter applied to each backoff delay, e.g. `0.2` for ±20%.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    #[serde(default = "default_insert_batch_size")]
    pub insert_batch_size: usize,
    #[serde(default = "default_embedding_batch_size")]
    pub embedding_batch_size: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            min_delay_ms: default_min_delay_ms(),
            jitter: default_jitter(),
            insert_batch_size: default_insert_batch_size(),
            embedding_batch_size: default_embedding_batch_size(),
        }
    }
}

fn default_max_attempts() -> u32 {
    10
}
fn default_base_delay_ms() -> u64 {
    200
}
fn default_min_delay_ms() -> u64 {
    100
}
fn default_jitter() -> f64 {
    0.2
}
fn default_insert_batch_size() -> usize {
    50
}
fn default_embedding_batch_size() -> usize {
    30
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_chars == 0 {
        anyhow::bail!("chunking.max_chars must be > 0");
    }

    if config.retrieval.max_candidates == 0 {
        anyhow::bail!("retrieval.max_candidates must be >= 1");
    }
    if config.retrieval.howto_pool_cap < config.retrieval.max_candidates {
        anyhow::bail!("retrieval.howto_pool_cap must be >= retrieval.max_candidates");
    }

    if config.writer.max_attempts == 0 {
        anyhow::bail!("writer.max_attempts must be >= 1");
    }
    if config.writer.insert_batch_size == 0 || config.writer.embedding_batch_size == 0 {
        anyhow::bail!("writer batch sizes must be > 0");
    }
    if !(0.0..1.0).contains(&config.writer.jitter) {
        anyhow::bail!("writer.jitter must be in [0.0, 1.0)");
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    match config.reranker.provider.as_str() {
        "disabled" => {}
        "http" => {
            if config.reranker.url.is_none() {
                anyhow::bail!("reranker.url must be specified when provider is 'http'");
            }
        }
        other => anyhow::bail!(
            "Unknown reranker provider: '{}'. Must be disabled or http.",
            other
        ),
    }

    Ok(())
}
