//! The engine facade.
//!
//! [`Engine`] wires the components together and is the only type most
//! callers need:
//!
//! ```text
//!            ┌──────────── Engine ─────────────┐
//! ingest ──▶ │ VersionTracker ─▶ Chunker ─▶ Embedder
//!            │        │                         │
//!            │        ▼                         ▼
//!            │ WriteCoordinator ──▶ ChunkStore ──▶ IndexManager (invalidate)
//!            │                                  ▲
//! search ──▶ │ HybridRetriever ─────────────────┘
//!            └─────────────────────────────────┘
//! ```
//!
//! # Ingest
//!
//! 1. Hash the raw text and ask [`VersionTracker::peek`] whether anything
//!    changed. Unchanged, fully written sources return a skipped report
//!    without touching the chunker, the embedder or the write lock.
//! 2. Chunk and embed outside the write lock.
//! 3. Under the knowledge base's write lock: record the version, replace the
//!    source's chunks, mark the version complete, invalidate the index.
//!
//! A failure between version bump and completion leaves the version
//! incomplete; re-ingesting the same bytes repairs it and
//! [`Engine::reconcile`] reports it.

use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::chunk::chunk_document;
use crate::config::Config;
use crate::db;
use crate::embedding::{create_embedder, embed_batched, Embedder};
use crate::error::{KbError, Result};
use crate::index::IndexManager;
use crate::loader::LoadedItem;
use crate::migrate;
use crate::models::{
    ChunkDraft, ChunkMode, ChunkOptions, IngestReport, KbId, KbSettings, KbStats, KnowledgeBase,
    ReconcileReport, SearchResult,
};
use crate::rerank::{create_reranker, Reranker};
use crate::retriever::HybridRetriever;
use crate::store::ChunkStore;
use crate::version::{content_hash, DocumentTraits, VersionTracker};
use crate::writer::{Deadline, WriteCoordinator};

pub struct Engine {
    config: Config,
    store: ChunkStore,
    versions: VersionTracker,
    index: Arc<IndexManager>,
    writer: WriteCoordinator,
    retriever: HybridRetriever,
    embedder: Option<Arc<dyn Embedder>>,
}

impl Engine {
    /// Connect to the configured database, run migrations and build the
    /// configured embedder and reranker.
    pub async fn open(config: Config) -> Result<Self> {
        let embedder = create_embedder(&config.embedding).map_err(|e| KbError::Config(e.to_string()))?;
        let reranker = create_reranker(&config.reranker).map_err(|e| KbError::Config(e.to_string()))?;
        Self::with_components(config, embedder, reranker).await
    }

    /// Like [`Engine::open`] but with caller-supplied collaborators.
    pub async fn with_components(
        config: Config,
        embedder: Option<Arc<dyn Embedder>>,
        reranker: Option<Arc<dyn Reranker>>,
    ) -> Result<Self> {
        let pool = db::connect(&config).await?;
        migrate::run_migrations(&pool).await?;

        let store = ChunkStore::new(pool.clone(), config.chunking.clone());
        let versions = VersionTracker::new(pool);
        let index = Arc::new(IndexManager::new(store.clone()));
        let writer = WriteCoordinator::new(store.clone(), Arc::clone(&index), config.writer.clone());
        let retriever = HybridRetriever::new(
            store.clone(),
            Arc::clone(&index),
            embedder.clone(),
            reranker,
            config.retrieval.clone(),
        )?;

        Ok(Self {
            config,
            store,
            versions,
            index,
            writer,
            retriever,
            embedder,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub fn versions(&self) -> &VersionTracker {
        &self.versions
    }

    pub fn index(&self) -> &IndexManager {
        &self.index
    }

    // ============ Knowledge bases ============

    /// Create a knowledge base. `settings` is a partial settings object
    /// merged over the defaults.
    pub async fn create_knowledge_base(
        &self,
        name: &str,
        description: Option<&str>,
        settings: Option<&serde_json::Value>,
    ) -> Result<KnowledgeBase> {
        let mut merged = KbSettings::defaults(&self.config.chunking);
        if let Some(patch) = settings {
            merged.merge(patch);
        }
        let kb = self.store.create_kb(name, description, &merged).await?;
        info!(kb_id = kb.id, name = %kb.name, "Created knowledge base");
        Ok(kb)
    }

    pub async fn get_knowledge_base(&self, kb_id: KbId) -> Result<Option<KnowledgeBase>> {
        self.store.get_kb(kb_id).await
    }

    pub async fn find_knowledge_base(&self, name: &str) -> Result<Option<KnowledgeBase>> {
        self.store.get_kb_by_name(name).await
    }

    pub async fn list_knowledge_bases(&self) -> Result<Vec<KnowledgeBase>> {
        self.store.list_kbs().await
    }

    pub async fn update_settings(&self, kb_id: KbId, settings: &serde_json::Value) -> Result<KnowledgeBase> {
        self.store.update_kb_settings(kb_id, settings).await
    }

    async fn require_kb(&self, kb_id: KbId) -> Result<KnowledgeBase> {
        self.store
            .get_kb(kb_id)
            .await?
            .ok_or_else(|| KbError::NotFound(format!("knowledge base {}", kb_id)))
    }

    // ============ Ingest ============

    /// Ingest one source document.
    ///
    /// `options` overrides the knowledge base's chunking settings for this
    /// call only.
    pub async fn ingest(
        &self,
        kb_id: KbId,
        source_type: &str,
        source_path: &str,
        raw_text: &str,
        options: Option<ChunkOptions>,
        deadline: Deadline,
    ) -> Result<IngestReport> {
        let kb = self.require_kb(kb_id).await?;
        check_source(source_type, source_path)?;

        let hash = content_hash(raw_text.as_bytes());
        if let Some(report) = self.skip_unchanged(kb_id, source_type, source_path, &hash).await? {
            return Ok(report);
        }

        let options = options.unwrap_or_else(|| kb.settings.chunk_options_for(source_type));
        let title = file_stem(source_path);
        let drafts = chunk_document(raw_text, source_type, &options, title.as_deref());
        self.commit(kb_id, source_type, source_path, raw_text, &hash, drafts, deadline)
            .await
    }

    /// Ingest a source delivered by a [`crate::loader::Loader`] as several
    /// items.
    ///
    /// In `full` mode the items are joined into one document. Otherwise each
    /// item is chunked on its own, titled after the item, and the chunk
    /// numbers are made contiguous across items.
    pub async fn ingest_items(
        &self,
        kb_id: KbId,
        source_type: &str,
        source_path: &str,
        items: &[LoadedItem],
        options: Option<ChunkOptions>,
        deadline: Deadline,
    ) -> Result<IngestReport> {
        let kb = self.require_kb(kb_id).await?;
        check_source(source_type, source_path)?;

        let raw_text = items
            .iter()
            .map(|item| item.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let hash = content_hash(raw_text.as_bytes());
        if let Some(report) = self.skip_unchanged(kb_id, source_type, source_path, &hash).await? {
            return Ok(report);
        }

        let options = options.unwrap_or_else(|| kb.settings.chunk_options_for(source_type));
        let stem = file_stem(source_path);
        let drafts = if options.mode == ChunkMode::Full {
            let title = items
                .iter()
                .find_map(|item| item.title.clone())
                .or(stem);
            chunk_document(&raw_text, source_type, &options, title.as_deref())
        } else {
            let mut drafts = Vec::new();
            for item in items {
                let title = item.title.as_deref().or(stem.as_deref());
                drafts.extend(chunk_document(&item.content, source_type, &options, title));
            }
            for (i, draft) in drafts.iter_mut().enumerate() {
                draft.metadata.context_mut().chunk_no = i as u32;
            }
            drafts
        };

        self.commit(kb_id, source_type, source_path, &raw_text, &hash, drafts, deadline)
            .await
    }

    async fn skip_unchanged(
        &self,
        kb_id: KbId,
        source_type: &str,
        source_path: &str,
        hash: &str,
    ) -> Result<Option<IngestReport>> {
        let decision = self.versions.peek(kb_id, source_type, source_path, hash).await?;
        if decision.proceed {
            return Ok(None);
        }
        info!(kb_id, source_path, version = decision.next_version, "Unchanged, skipping");
        Ok(Some(IngestReport {
            document_id: decision.document_id,
            document_version: decision.next_version,
            skipped: true,
            ..Default::default()
        }))
    }

    #[allow(clippy::too_many_arguments)]
    async fn commit(
        &self,
        kb_id: KbId,
        source_type: &str,
        source_path: &str,
        raw_text: &str,
        hash: &str,
        drafts: Vec<ChunkDraft>,
        deadline: Deadline,
    ) -> Result<IngestReport> {
        for draft in &drafts {
            draft.metadata.validate(&draft.content)?;
        }
        let embeddings = self.embed_drafts(&drafts, deadline).await;
        let traits = DocumentTraits::detect(source_type, source_path, raw_text);
        let traits = &traits;

        self.writer
            .run(kb_id, deadline, || async move {
                let decision = self
                    .writer
                    .retry(deadline, "should_reingest", || {
                        self.versions
                            .should_reingest(kb_id, source_type, source_path, hash, traits)
                    })
                    .await?;

                // Another writer committed the same bytes while we were chunking.
                if !decision.proceed {
                    return Ok(IngestReport {
                        document_id: decision.document_id,
                        document_version: decision.next_version,
                        skipped: true,
                        ..Default::default()
                    });
                }
                let document_id = decision.document_id.ok_or_else(|| {
                    KbError::NotFound(format!("document row for {}", source_path))
                })?;
                let version = decision.next_version;

                let now = chrono::Utc::now().timestamp();
                let mut drafts = drafts;
                for draft in &mut drafts {
                    let ctx = draft.metadata.context_mut();
                    ctx.doc_version = version;
                    ctx.source_updated_at = Some(now);
                }

                let (deleted, outcome) = self
                    .writer
                    .replace_source(
                        kb_id,
                        document_id,
                        source_type,
                        source_path,
                        version,
                        &drafts,
                        &embeddings,
                        deadline,
                    )
                    .await?;
                self.writer
                    .retry(deadline, "mark_complete", || {
                        self.versions.mark_complete(document_id, version)
                    })
                    .await?;

                info!(
                    kb_id,
                    source_path,
                    version,
                    repair = decision.repair,
                    chunks = outcome.chunk_ids.len(),
                    deleted,
                    embedded = outcome.embedded,
                    "Ingested"
                );
                Ok(IngestReport {
                    document_id: Some(document_id),
                    document_version: version,
                    chunks_added: outcome.chunk_ids.len(),
                    chunks_deleted: deleted,
                    embedded: outcome.embedded,
                    skipped: false,
                })
            })
            .await
    }

    /// One optional vector per draft. Never fails: missing vectors leave the
    /// chunk keyword-searchable only.
    async fn embed_drafts(&self, drafts: &[ChunkDraft], deadline: Deadline) -> Vec<Option<Vec<f32>>> {
        let Some(embedder) = &self.embedder else {
            return vec![None; drafts.len()];
        };
        if drafts.is_empty() {
            return Vec::new();
        }
        let texts: Vec<String> = drafts.iter().map(|d| d.content.clone()).collect();
        let batch_size = self.config.embedding.batch_size;
        match deadline
            .bound(embed_batched(embedder.as_ref(), &texts, batch_size))
            .await
        {
            Some(vectors) => vectors,
            None => {
                warn!(chunks = drafts.len(), "Embedding hit the deadline, storing without vectors");
                vec![None; drafts.len()]
            }
        }
    }

    // ============ Deletes ============

    /// Remove one source: its chunks, document and versions.
    pub async fn delete_source(
        &self,
        kb_id: KbId,
        source_type: &str,
        source_path: &str,
        deadline: Deadline,
    ) -> Result<u64> {
        self.require_kb(kb_id).await?;
        let removed = self
            .writer
            .delete_source(kb_id, source_type, source_path, deadline)
            .await?;
        info!(kb_id, source_path, removed, "Deleted source");
        Ok(removed)
    }

    /// Remove every source whose path starts with `prefix`.
    pub async fn delete_source_prefix(
        &self,
        kb_id: KbId,
        source_type: &str,
        prefix: &str,
        deadline: Deadline,
    ) -> Result<u64> {
        self.require_kb(kb_id).await?;
        let removed = self
            .writer
            .delete_prefix(kb_id, source_type, prefix, deadline)
            .await?;
        info!(kb_id, prefix, removed, "Deleted sources by prefix");
        Ok(removed)
    }

    /// Empty a knowledge base, keeping it. Returns `(chunks, documents)`.
    pub async fn clear_knowledge_base(&self, kb_id: KbId, deadline: Deadline) -> Result<(u64, u64)> {
        self.require_kb(kb_id).await?;
        let (chunks, documents) = self.writer.clear_kb(kb_id, deadline).await?;
        info!(kb_id, chunks, documents, "Cleared knowledge base");
        Ok((chunks, documents))
    }

    pub async fn delete_knowledge_base(&self, kb_id: KbId, deadline: Deadline) -> Result<bool> {
        let deleted = self.writer.delete_kb(kb_id, deadline).await?;
        if deleted {
            info!(kb_id, "Deleted knowledge base");
        }
        Ok(deleted)
    }

    // ============ Read side ============

    /// Hybrid search. Unknown knowledge bases yield an empty result.
    pub async fn search(
        &self,
        kb_id: KbId,
        query: &str,
        top_k: usize,
        deadline: Deadline,
    ) -> Result<Vec<SearchResult>> {
        let Some(kb) = self.store.get_kb(kb_id).await? else {
            return Ok(Vec::new());
        };
        self.retriever
            .search(kb_id, &kb.settings.retrieval, query, top_k, deadline)
            .await
    }

    /// Drop chunks left behind by superseded versions and list documents
    /// whose current version never finished writing.
    pub async fn reconcile(&self, kb_id: KbId, deadline: Deadline) -> Result<ReconcileReport> {
        self.require_kb(kb_id).await?;
        let stale_chunks_removed = self.writer.sweep_stale(kb_id, deadline).await?;
        let incomplete_documents = self.versions.incomplete(kb_id).await?;
        if !incomplete_documents.is_empty() {
            warn!(
                kb_id,
                count = incomplete_documents.len(),
                "Documents with incomplete versions; re-ingest them to repair"
            );
        }
        Ok(ReconcileReport {
            stale_chunks_removed,
            incomplete_documents,
        })
    }

    pub async fn stats(&self, kb_id: KbId) -> Result<KbStats> {
        self.require_kb(kb_id).await?;
        self.store.stats(kb_id).await
    }
}

fn check_source(source_type: &str, source_path: &str) -> Result<()> {
    if source_type.trim().is_empty() {
        return Err(KbError::InvalidInput("source_type is empty".into()));
    }
    if source_path.trim().is_empty() {
        return Err(KbError::InvalidInput("source_path is empty".into()));
    }
    Ok(())
}

fn file_stem(source_path: &str) -> Option<String> {
    Path::new(source_path)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_stem() {
        assert_eq!(file_stem("a/b.md").as_deref(), Some("b"));
        assert_eq!(file_stem("https://wiki/x/Setup").as_deref(), Some("Setup"));
        assert_eq!(file_stem(""), None);
    }

    #[test]
    fn test_check_source() {
        assert!(check_source("markdown", "a/b.md").is_ok());
        assert!(check_source(" ", "a").is_err());
        assert!(check_source("markdown", "").is_err());
    }
}
