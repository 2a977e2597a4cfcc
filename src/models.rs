//! Core data models shared by the chunker, store, index, and retriever.
//!
//! Chunk metadata is a tagged enum ([`ChunkMetadata`]) rather than a free-form
//! map: every chunk carries a common [`ChunkContext`] plus whatever its kind
//! needs (only code chunks carry a language). It is persisted as JSON with a
//! `chunk_kind` tag:
//!
//! ```json
//! {"chunk_kind":"code","lang":"bash","section_path":"Setup > Install","chunk_no":3,"doc_version":2}
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

use crate::config::ChunkingConfig;
use crate::error::{KbError, Result};

pub type KbId = i64;
pub type DocumentId = i64;
pub type ChunkId = i64;

// ============ Knowledge bases ============

#[derive(Debug, Clone, Serialize)]
pub struct KnowledgeBase {
    pub id: KbId,
    pub name: String,
    pub description: Option<String>,
    pub settings: KbSettings,
    pub created_at: i64,
    pub updated_at: i64,
}

/// How a source is split into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkMode {
    /// Whole document as a single chunk.
    #[serde(alias = "file", alias = "page")]
    Full,
    /// Sliding character window.
    Fixed,
    /// Heading, code-block and list aware splitting.
    #[serde(alias = "structural", alias = "markdown")]
    Section,
}

impl ChunkMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" | "file" | "page" => Some(ChunkMode::Full),
            "fixed" => Some(ChunkMode::Fixed),
            "section" | "structural" | "markdown" => Some(ChunkMode::Section),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkMode::Full => "full",
            ChunkMode::Fixed => "fixed",
            ChunkMode::Section => "section",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkOptions {
    pub mode: ChunkMode,
    pub max_chars: usize,
    pub overlap: usize,
}

/// Partially specified options as they may appear in stored settings JSON.
#[derive(Debug, Default, Deserialize)]
struct PartialChunkOptions {
    mode: Option<String>,
    #[serde(alias = "chunk_size")]
    max_chars: Option<usize>,
    overlap: Option<usize>,
}

impl PartialChunkOptions {
    fn merge_over(self, base: ChunkOptions) -> ChunkOptions {
        ChunkOptions {
            mode: self
                .mode
                .as_deref()
                .and_then(ChunkMode::parse)
                .unwrap_or(base.mode),
            max_chars: self.max_chars.filter(|n| *n > 0).unwrap_or(base.max_chars),
            overlap: self.overlap.unwrap_or(base.overlap),
        }
    }
}

/// Per-knowledge-base retrieval overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_candidates: Option<usize>,
}

/// Knowledge-base settings after merging stored JSON over defaults.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KbSettings {
    /// Options keyed by source kind (`markdown`, `web`, `text`, ...).
    pub chunking: BTreeMap<String, ChunkOptions>,
    /// Options for source kinds with no entry in `chunking`.
    pub default_chunking: ChunkOptions,
    pub retrieval: RetrievalSettings,
}

const SECTION_KINDS: &[&str] = &["markdown", "web", "wiki", "pdf", "code", "chat"];

impl KbSettings {
    /// Built-in defaults: fixed windows for plain text, structural splitting
    /// for everything else.
    pub fn defaults(chunking: &ChunkingConfig) -> Self {
        let section = ChunkOptions {
            mode: ChunkMode::Section,
            max_chars: chunking.max_chars,
            overlap: chunking.overlap,
        };
        let mut by_kind = BTreeMap::new();
        by_kind.insert(
            "text".to_string(),
            ChunkOptions {
                mode: ChunkMode::Fixed,
                ..section
            },
        );
        for kind in SECTION_KINDS {
            by_kind.insert(kind.to_string(), section);
        }
        Self {
            chunking: by_kind,
            default_chunking: section,
            retrieval: RetrievalSettings::default(),
        }
    }

    /// Merge stored settings JSON over the defaults.
    ///
    /// Missing fields keep their default. Malformed JSON yields the defaults
    /// unchanged.
    pub fn from_json(raw: &str, chunking: &ChunkingConfig) -> Self {
        let mut settings = Self::defaults(chunking);
        let value: serde_json::Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Unreadable knowledge base settings, using defaults");
                return settings;
            }
        };
        settings.merge(&value);
        settings
    }

    /// Merge a (possibly partial) settings object into `self`.
    pub fn merge(&mut self, value: &serde_json::Value) {
        if let Some(map) = value.get("chunking").and_then(|v| v.as_object()) {
            for (kind, raw) in map {
                let partial: PartialChunkOptions =
                    serde_json::from_value(raw.clone()).unwrap_or_default();
                let base = self.chunk_options_for(kind);
                self.chunking.insert(kind.clone(), partial.merge_over(base));
            }
        }
        if let Some(raw) = value.get("default_chunking") {
            let partial: PartialChunkOptions =
                serde_json::from_value(raw.clone()).unwrap_or_default();
            self.default_chunking = partial.merge_over(self.default_chunking);
        }
        if let Some(raw) = value.get("retrieval") {
            if let Ok(retrieval) = serde_json::from_value::<RetrievalSettings>(raw.clone()) {
                if retrieval.max_candidates.is_some() {
                    self.retrieval.max_candidates = retrieval.max_candidates;
                }
            }
        }
    }

    pub fn chunk_options_for(&self, source_kind: &str) -> ChunkOptions {
        self.chunking
            .get(&source_kind.to_ascii_lowercase())
            .copied()
            .unwrap_or(self.default_chunking)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============ Documents ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentClass {
    Text,
    Code,
    Table,
    Markdown,
    Config,
    Log,
}

impl DocumentClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentClass::Text => "text",
            DocumentClass::Code => "code",
            DocumentClass::Table => "table",
            DocumentClass::Markdown => "markdown",
            DocumentClass::Config => "config",
            DocumentClass::Log => "log",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "code" => DocumentClass::Code,
            "table" => DocumentClass::Table,
            "markdown" => DocumentClass::Markdown,
            "config" => DocumentClass::Config,
            "log" => DocumentClass::Log,
            _ => DocumentClass::Text,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: DocumentId,
    pub kb_id: KbId,
    pub source_type: String,
    pub source_path: String,
    pub content_hash: String,
    pub document_class: DocumentClass,
    pub language: String,
    pub current_version: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentVersion {
    pub id: i64,
    pub document_id: DocumentId,
    pub version: i64,
    pub content_hash: String,
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

// ============ Chunks ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    Text,
    Code,
    List,
    FullPage,
    FullDoc,
}

impl ChunkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkKind::Text => "text",
            ChunkKind::Code => "code",
            ChunkKind::List => "list",
            ChunkKind::FullPage => "full_page",
            ChunkKind::FullDoc => "full_doc",
        }
    }

    /// Code and list chunks are favoured for instructional queries.
    pub fn is_procedural(&self) -> bool {
        matches!(self, ChunkKind::Code | ChunkKind::List)
    }
}

/// Fields common to every chunk kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_title: Option<String>,
    #[serde(default)]
    pub chunk_no: u32,
    #[serde(default)]
    pub doc_version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_updated_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "chunk_kind", rename_all = "snake_case")]
pub enum ChunkMetadata {
    Text {
        #[serde(flatten)]
        context: ChunkContext,
    },
    Code {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lang: Option<String>,
        #[serde(flatten)]
        context: ChunkContext,
    },
    List {
        #[serde(flatten)]
        context: ChunkContext,
    },
    FullPage {
        #[serde(flatten)]
        context: ChunkContext,
    },
    FullDoc {
        #[serde(flatten)]
        context: ChunkContext,
    },
}

impl ChunkMetadata {
    pub fn new(kind: ChunkKind, lang: Option<String>, context: ChunkContext) -> Self {
        match kind {
            ChunkKind::Text => ChunkMetadata::Text { context },
            ChunkKind::Code => ChunkMetadata::Code { lang, context },
            ChunkKind::List => ChunkMetadata::List { context },
            ChunkKind::FullPage => ChunkMetadata::FullPage { context },
            ChunkKind::FullDoc => ChunkMetadata::FullDoc { context },
        }
    }

    pub fn kind(&self) -> ChunkKind {
        match self {
            ChunkMetadata::Text { .. } => ChunkKind::Text,
            ChunkMetadata::Code { .. } => ChunkKind::Code,
            ChunkMetadata::List { .. } => ChunkKind::List,
            ChunkMetadata::FullPage { .. } => ChunkKind::FullPage,
            ChunkMetadata::FullDoc { .. } => ChunkKind::FullDoc,
        }
    }

    pub fn context(&self) -> &ChunkContext {
        match self {
            ChunkMetadata::Text { context }
            | ChunkMetadata::Code { context, .. }
            | ChunkMetadata::List { context }
            | ChunkMetadata::FullPage { context }
            | ChunkMetadata::FullDoc { context } => context,
        }
    }

    pub fn context_mut(&mut self) -> &mut ChunkContext {
        match self {
            ChunkMetadata::Text { context }
            | ChunkMetadata::Code { context, .. }
            | ChunkMetadata::List { context }
            | ChunkMetadata::FullPage { context }
            | ChunkMetadata::FullDoc { context } => context,
        }
    }

    pub fn code_lang(&self) -> Option<&str> {
        match self {
            ChunkMetadata::Code { lang, .. } => lang.as_deref(),
            _ => None,
        }
    }

    /// Check the metadata against the chunk it describes.
    pub fn validate(&self, content: &str) -> Result<()> {
        if content.trim().is_empty() {
            return Err(KbError::InvalidInput("chunk content is empty".into()));
        }
        let ctx = self.context();
        if ctx.chunk_no == u32::MAX {
            return Err(KbError::InvalidInput("chunk_no out of range".into()));
        }
        if ctx.doc_version < 0 {
            return Err(KbError::InvalidInput(format!(
                "negative doc_version {}",
                ctx.doc_version
            )));
        }
        Ok(())
    }
}

/// A chunk produced by the chunker, not yet persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkDraft {
    pub content: String,
    pub metadata: ChunkMetadata,
}

/// A persisted chunk as loaded back for retrieval.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub id: ChunkId,
    pub kb_id: KbId,
    pub document_id: DocumentId,
    pub source_type: String,
    pub source_path: String,
    pub doc_version: i64,
    pub content: String,
    pub metadata: ChunkMetadata,
}

// ============ Retrieval ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Dense,
    Keyword,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Dense => "dense",
            Origin::Keyword => "keyword",
        }
    }
}

/// A single retrieval hit.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub chunk_id: ChunkId,
    pub content: String,
    pub metadata: ChunkMetadata,
    pub source_type: String,
    pub source_path: String,
    /// Higher is better. Reranker score when reranked, otherwise the
    /// phase-native score.
    pub score: f64,
    /// Lower is better. `-similarity` for dense hits, `1/(score+1)` for
    /// keyword hits.
    pub distance: f64,
    pub origin: Origin,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f32>,
}

// ============ Reports ============

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub document_id: Option<DocumentId>,
    pub document_version: i64,
    pub chunks_added: usize,
    pub chunks_deleted: u64,
    pub embedded: usize,
    pub skipped: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub stale_chunks_removed: u64,
    /// `(source_path, version)` of documents whose current version never
    /// finished writing.
    pub incomplete_documents: Vec<(String, i64)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KbStats {
    pub documents: i64,
    pub chunks: i64,
    pub embedded: i64,
    pub by_source_type: Vec<(String, i64, i64)>,
}
