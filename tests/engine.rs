//! End-to-end tests for the engine: ingest, versioning, retrieval, rerank
//! fallback, index invalidation and write retries.
//!
//! Every test runs against its own temporary SQLite database. Embeddings and
//! rerank scores come from small deterministic fakes so results are exact.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use kb_harness::config::Config;
use kb_harness::embedding::Embedder;
use kb_harness::loader::LoadedItem;
use kb_harness::models::{ChunkKind, ChunkMode, ChunkOptions, Origin};
use kb_harness::rerank::Reranker;
use kb_harness::{Deadline, Engine, KbError};

// ─── Fakes ──────────────────────────────────────────────────────────

const VOCAB: &[&str] = &[
    "clone",
    "repo",
    "git",
    "backup",
    "retention",
    "policy",
    "deploy",
    "install",
];

/// Bag-of-words embedder over a fixed vocabulary, plus a small bias
/// component so no vector is zero.
struct VocabEmbedder;

fn vocab_vector(text: &str) -> Vec<f32> {
    let lower = text.to_lowercase();
    let mut v = vec![0.0f32; VOCAB.len() + 1];
    for token in lower.split(|c: char| !c.is_alphanumeric()) {
        if let Some(i) = VOCAB.iter().position(|w| *w == token) {
            v[i] += 1.0;
        }
    }
    v[VOCAB.len()] = 0.05;
    v
}

#[async_trait]
impl Embedder for VocabEmbedder {
    fn model_name(&self) -> &str {
        "vocab"
    }

    fn dims(&self) -> usize {
        VOCAB.len() + 1
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| vocab_vector(t)).collect())
    }
}

struct DownEmbedder;

#[async_trait]
impl Embedder for DownEmbedder {
    fn model_name(&self) -> &str {
        "down"
    }

    fn dims(&self) -> usize {
        4
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("connection refused")
    }
}

/// Longer content scores higher.
struct LengthReranker;

#[async_trait]
impl Reranker for LengthReranker {
    async fn score(&self, _query: &str, texts: &[String]) -> Result<Vec<f32>> {
        Ok(texts.iter().map(|t| t.chars().count() as f32).collect())
    }
}

struct DownReranker;

#[async_trait]
impl Reranker for DownReranker {
    async fn score(&self, _query: &str, _texts: &[String]) -> Result<Vec<f32>> {
        bail!("reranker unavailable")
    }
}

/// Drops the last score.
struct ShortReranker;

#[async_trait]
impl Reranker for ShortReranker {
    async fn score(&self, _query: &str, texts: &[String]) -> Result<Vec<f32>> {
        Ok(vec![1.0; texts.len().saturating_sub(1)])
    }
}

// ─── Helpers ────────────────────────────────────────────────────────

fn test_config(tmp: &TempDir) -> Config {
    Config::with_db_path(tmp.path().join("kb.sqlite"))
}

async fn engine_with(
    tmp: &TempDir,
    embedder: Option<Arc<dyn Embedder>>,
    reranker: Option<Arc<dyn Reranker>>,
) -> Engine {
    Engine::with_components(test_config(tmp), embedder, reranker)
        .await
        .unwrap()
}

const PROJECT_MD: &str = "# Project

Intro paragraph about the project.

## Install

Run the installer and wait.

## Usage

Start the service with the default settings.
";

const GUIDE_MD: &str = "# Guide

## Overview

clone the repo clone the repo.

## Commands

```bash
git clone
```
";

async fn chunk_count(engine: &Engine, kb_id: i64, source_path: &str) -> i64 {
    engine
        .store()
        .count_chunks(kb_id, "markdown", source_path)
        .await
        .unwrap()
}

// ─── Ingest & versioning ────────────────────────────────────────────

#[tokio::test]
async fn test_ingest_version_lifecycle() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(&tmp, None, None).await;
    let kb = engine.create_knowledge_base("docs", None, None).await.unwrap();

    let first = engine
        .ingest(kb.id, "markdown", "a/b.md", PROJECT_MD, None, Deadline::none())
        .await
        .unwrap();
    assert!(!first.skipped);
    assert_eq!(first.document_version, 1);
    assert_eq!(first.chunks_added, 3);
    assert_eq!(chunk_count(&engine, kb.id, "a/b.md").await, 3);

    let again = engine
        .ingest(kb.id, "markdown", "a/b.md", PROJECT_MD, None, Deadline::none())
        .await
        .unwrap();
    assert!(again.skipped);
    assert_eq!(again.document_version, 1);
    assert_eq!(chunk_count(&engine, kb.id, "a/b.md").await, 3);

    let changed = format!("{}\nMore usage notes.\n", PROJECT_MD);
    let second = engine
        .ingest(kb.id, "markdown", "a/b.md", &changed, None, Deadline::none())
        .await
        .unwrap();
    assert!(!second.skipped);
    assert_eq!(second.document_version, 2);
    assert_eq!(second.chunks_deleted, 3);
    assert_eq!(chunk_count(&engine, kb.id, "a/b.md").await, 3);

    let chunks = engine.store().load_for_keyword(kb.id, &[]).await.unwrap();
    assert!(chunks.iter().all(|c| c.doc_version == 2));
    assert!(chunks
        .iter()
        .all(|c| c.metadata.context().doc_version == 2));
    assert!(chunks.iter().any(|c| c.content.contains("More usage notes.")));

    let (cleared_chunks, cleared_docs) = engine
        .clear_knowledge_base(kb.id, Deadline::none())
        .await
        .unwrap();
    assert_eq!((cleared_chunks, cleared_docs), (3, 1));
    let stats = engine.stats(kb.id).await.unwrap();
    assert_eq!((stats.chunks, stats.documents), (0, 0));
}

#[tokio::test]
async fn test_versions_are_monotonic_and_append_only() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(&tmp, None, None).await;
    let kb = engine.create_knowledge_base("docs", None, None).await.unwrap();

    for (i, body) in ["one", "two", "two", "three"].iter().enumerate() {
        engine
            .ingest(kb.id, "text", "notes.txt", body, None, Deadline::none())
            .await
            .unwrap_or_else(|e| panic!("ingest {} failed: {}", i, e));
    }

    let doc = engine
        .versions()
        .find(kb.id, "text", "notes.txt")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc.current_version, 3);

    let versions = engine.versions().versions(doc.id).await.unwrap();
    let numbers: Vec<i64> = versions.iter().map(|v| v.version).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert!(versions.iter().all(|v| v.completed_at.is_some()));
}

#[tokio::test]
async fn test_incomplete_version_is_reported_and_repaired() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(&tmp, None, None).await;
    let kb = engine.create_knowledge_base("docs", None, None).await.unwrap();
    let report = engine
        .ingest(kb.id, "markdown", "a/b.md", PROJECT_MD, None, Deadline::none())
        .await
        .unwrap();
    let doc_id = report.document_id.unwrap();

    // Simulate a crash between version bump and completion.
    sqlx::query("UPDATE document_versions SET completed_at = NULL WHERE document_id = ?")
        .bind(doc_id)
        .execute(engine.store().pool())
        .await
        .unwrap();

    let reconcile = engine.reconcile(kb.id, Deadline::none()).await.unwrap();
    assert_eq!(reconcile.incomplete_documents, vec![("a/b.md".to_string(), 1)]);

    let repaired = engine
        .ingest(kb.id, "markdown", "a/b.md", PROJECT_MD, None, Deadline::none())
        .await
        .unwrap();
    assert!(!repaired.skipped);
    assert_eq!(repaired.document_version, 1);
    assert_eq!(chunk_count(&engine, kb.id, "a/b.md").await, 3);

    let reconcile = engine.reconcile(kb.id, Deadline::none()).await.unwrap();
    assert!(reconcile.incomplete_documents.is_empty());
    assert_eq!(engine.versions().versions(doc_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_reconcile_sweeps_stale_chunks() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(&tmp, None, None).await;
    let kb = engine.create_knowledge_base("docs", None, None).await.unwrap();
    engine
        .ingest(kb.id, "markdown", "a/b.md", PROJECT_MD, None, Deadline::none())
        .await
        .unwrap();

    sqlx::query("UPDATE chunks SET doc_version = 0 WHERE id = (SELECT MIN(id) FROM chunks)")
        .execute(engine.store().pool())
        .await
        .unwrap();

    let report = engine.reconcile(kb.id, Deadline::none()).await.unwrap();
    assert_eq!(report.stale_chunks_removed, 1);
    assert_eq!(chunk_count(&engine, kb.id, "a/b.md").await, 2);
}

#[tokio::test]
async fn test_ingest_items_titles_and_numbering() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(&tmp, None, None).await;
    let kb = engine.create_knowledge_base("wiki", None, None).await.unwrap();

    let items = vec![
        LoadedItem::new("First page body.").with_title("Alpha"),
        LoadedItem::new("Second page body.").with_title("Beta"),
    ];
    let options = ChunkOptions {
        mode: ChunkMode::Section,
        max_chars: 500,
        overlap: 0,
    };
    let report = engine
        .ingest_items(kb.id, "wiki", "space/home", &items, Some(options), Deadline::none())
        .await
        .unwrap();
    assert_eq!(report.chunks_added, 2);

    let chunks = engine.store().load_for_keyword(kb.id, &[]).await.unwrap();
    let titles: Vec<_> = chunks
        .iter()
        .map(|c| c.metadata.context().doc_title.clone().unwrap_or_default())
        .collect();
    assert_eq!(titles, vec!["Alpha", "Beta"]);
    let numbers: Vec<u32> = chunks.iter().map(|c| c.metadata.context().chunk_no).collect();
    assert_eq!(numbers, vec![0, 1]);

    let full = ChunkOptions {
        mode: ChunkMode::Full,
        ..options
    };
    let report = engine
        .ingest_items(kb.id, "wiki", "space/other", &items, Some(full), Deadline::none())
        .await
        .unwrap();
    assert_eq!(report.chunks_added, 1);
}

#[tokio::test]
async fn test_delete_source_and_prefix() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(&tmp, None, None).await;
    let kb = engine.create_knowledge_base("docs", None, None).await.unwrap();
    for path in ["wiki/a/1", "wiki/a/2", "wiki/b/1"] {
        engine
            .ingest(kb.id, "wiki", path, &format!("Page {}", path), None, Deadline::none())
            .await
            .unwrap();
    }

    let removed = engine
        .delete_source_prefix(kb.id, "wiki", "wiki/a/", Deadline::none())
        .await
        .unwrap();
    assert_eq!(removed, 2);
    assert_eq!(engine.stats(kb.id).await.unwrap().documents, 1);

    let removed = engine
        .delete_source(kb.id, "wiki", "wiki/b/1", Deadline::none())
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert_eq!(engine.stats(kb.id).await.unwrap().documents, 0);
}

#[tokio::test]
async fn test_unknown_kb() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(&tmp, None, None).await;

    let results = engine.search(999, "anything", 5, Deadline::none()).await.unwrap();
    assert!(results.is_empty());

    let err = engine
        .ingest(999, "text", "x", "body", None, Deadline::none())
        .await
        .unwrap_err();
    assert!(matches!(err, KbError::NotFound(_)));
}

#[tokio::test]
async fn test_delete_kb_cascades() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(&tmp, Some(Arc::new(VocabEmbedder)), None).await;
    let kb = engine.create_knowledge_base("docs", None, None).await.unwrap();
    engine
        .ingest(kb.id, "markdown", "guide.md", GUIDE_MD, None, Deadline::none())
        .await
        .unwrap();
    engine.search(kb.id, "clone repo", 3, Deadline::none()).await.unwrap();

    assert!(engine.delete_knowledge_base(kb.id, Deadline::none()).await.unwrap());
    assert!(engine.get_knowledge_base(kb.id).await.unwrap().is_none());
    let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
        .fetch_one(engine.store().pool())
        .await
        .unwrap();
    assert_eq!(chunks, 0);
    assert!(!engine.delete_knowledge_base(kb.id, Deadline::none()).await.unwrap());
}

// ─── Retrieval ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_exact_substring_is_recalled_without_embedder() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(&tmp, None, None).await;
    let kb = engine.create_knowledge_base("docs", None, None).await.unwrap();
    engine
        .ingest(kb.id, "markdown", "a/b.md", PROJECT_MD, None, Deadline::none())
        .await
        .unwrap();

    for query in ["Run the installer and wait", "Intro paragraph about the project"] {
        let results = engine.search(kb.id, query, 5, Deadline::none()).await.unwrap();
        let needle = query.to_lowercase();
        assert!(
            results
                .iter()
                .any(|r| r.content.to_lowercase().contains(&needle)),
            "no result contains {:?}",
            query
        );
        assert!(results.iter().all(|r| r.origin == Origin::Keyword));
    }
}

#[tokio::test]
async fn test_failing_embedder_degrades_to_keyword() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(&tmp, Some(Arc::new(DownEmbedder)), None).await;
    let kb = engine.create_knowledge_base("docs", None, None).await.unwrap();
    let report = engine
        .ingest(kb.id, "markdown", "a/b.md", PROJECT_MD, None, Deadline::none())
        .await
        .unwrap();
    assert_eq!(report.embedded, 0);
    assert_eq!(engine.stats(kb.id).await.unwrap().embedded, 0);

    let results = engine
        .search(kb.id, "default settings", 5, Deadline::none())
        .await
        .unwrap();
    assert!(!results.is_empty());
    assert!(results[0].content.contains("default settings"));
}

#[tokio::test]
async fn test_merge_has_no_duplicates() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(&tmp, Some(Arc::new(VocabEmbedder)), None).await;
    let kb = engine.create_knowledge_base("docs", None, None).await.unwrap();
    engine
        .ingest(kb.id, "markdown", "guide.md", GUIDE_MD, None, Deadline::none())
        .await
        .unwrap();

    let results = engine
        .search(kb.id, "clone repo", 10, Deadline::none())
        .await
        .unwrap();
    let mut seen = HashSet::new();
    for r in &results {
        let prefix: String = r.content.chars().take(200).collect();
        assert!(seen.insert((r.source_path.clone(), prefix)), "duplicate result");
    }
    assert_eq!(results[0].origin, Origin::Dense);
}

#[tokio::test]
async fn test_howto_prefers_code_over_more_similar_text() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(&tmp, Some(Arc::new(VocabEmbedder)), None).await;
    let kb = engine.create_knowledge_base("docs", None, None).await.unwrap();
    engine
        .ingest(kb.id, "markdown", "guide.md", GUIDE_MD, None, Deadline::none())
        .await
        .unwrap();

    let general = engine
        .search(kb.id, "clone repo", 3, Deadline::none())
        .await
        .unwrap();
    assert_eq!(general[0].metadata.kind(), ChunkKind::Text);
    assert!(general[0].content.contains("clone the repo"));

    let howto = engine
        .search(kb.id, "how to clone the repo", 3, Deadline::none())
        .await
        .unwrap();
    assert_eq!(howto[0].metadata.kind(), ChunkKind::Code);
    assert!(howto[0].content.contains("git clone"));
}

#[tokio::test]
async fn test_reranker_orders_results() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(
        &tmp,
        Some(Arc::new(VocabEmbedder)),
        Some(Arc::new(LengthReranker)),
    )
    .await;
    let kb = engine.create_knowledge_base("docs", None, None).await.unwrap();
    engine
        .ingest(kb.id, "markdown", "guide.md", GUIDE_MD, None, Deadline::none())
        .await
        .unwrap();

    let results = engine
        .search(kb.id, "clone repo", 10, Deadline::none())
        .await
        .unwrap();
    assert!(results.len() >= 2);
    for pair in results.windows(2) {
        let a = pair[0].rerank_score.unwrap();
        let b = pair[1].rerank_score.unwrap();
        assert!(a >= b);
    }
    assert_eq!(results[0].score, results[0].rerank_score.unwrap() as f64);
}

#[tokio::test]
async fn test_reranker_failure_falls_back_deterministically() {
    let tmp = TempDir::new().unwrap();
    let plain = engine_with(&tmp, Some(Arc::new(VocabEmbedder)), None).await;
    let kb = plain.create_knowledge_base("docs", None, None).await.unwrap();
    plain
        .ingest(kb.id, "markdown", "guide.md", GUIDE_MD, None, Deadline::none())
        .await
        .unwrap();
    let expected: Vec<i64> = plain
        .search(kb.id, "how to clone the repo", 10, Deadline::none())
        .await
        .unwrap()
        .iter()
        .map(|r| r.chunk_id)
        .collect();
    assert!(!expected.is_empty());

    let down = engine_with(&tmp, Some(Arc::new(VocabEmbedder)), Some(Arc::new(DownReranker))).await;
    let short = engine_with(&tmp, Some(Arc::new(VocabEmbedder)), Some(Arc::new(ShortReranker))).await;
    for engine in [&down, &short] {
        let results = engine
            .search(kb.id, "how to clone the repo", 10, Deadline::none())
            .await
            .unwrap();
        let ids: Vec<i64> = results.iter().map(|r| r.chunk_id).collect();
        assert_eq!(ids, expected);
        assert!(results.iter().all(|r| r.rerank_score.is_none()));
    }
}

#[tokio::test]
async fn test_blank_query_and_zero_top_k() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(&tmp, None, None).await;
    let kb = engine.create_knowledge_base("docs", None, None).await.unwrap();
    engine
        .ingest(kb.id, "markdown", "a/b.md", PROJECT_MD, None, Deadline::none())
        .await
        .unwrap();
    assert!(engine.search(kb.id, "   ", 5, Deadline::none()).await.unwrap().is_empty());
    assert!(engine.search(kb.id, "project", 0, Deadline::none()).await.unwrap().is_empty());
}

// ─── Index ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_index_rebuilds_after_write() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(&tmp, Some(Arc::new(VocabEmbedder)), None).await;
    let kb = engine.create_knowledge_base("docs", None, None).await.unwrap();
    engine
        .ingest(kb.id, "markdown", "guide.md", GUIDE_MD, None, Deadline::none())
        .await
        .unwrap();

    let before = engine.index().index(kb.id).await.unwrap();
    let before_len = before.len();
    assert!(before_len > 0);

    engine
        .ingest(
            kb.id,
            "markdown",
            "ops.md",
            "# Ops\n\nThe backup retention policy is thirty days.\n",
            None,
            Deadline::none(),
        )
        .await
        .unwrap();

    let (a, b, c) = tokio::join!(
        engine.index().index(kb.id),
        engine.index().index(kb.id),
        engine.index().index(kb.id)
    );
    for idx in [a.unwrap(), b.unwrap(), c.unwrap()] {
        assert!(idx.len() >= before_len);
    }
    let after = engine.index().index(kb.id).await.unwrap();
    assert_eq!(after.len(), before_len + 1);
    assert!(after.generation() > before.generation());

    let results = engine
        .search(kb.id, "backup retention policy", 3, Deadline::none())
        .await
        .unwrap();
    assert_eq!(results[0].source_path, "ops.md");
    assert_eq!(results[0].origin, Origin::Dense);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_readers_never_see_a_smaller_index_during_writes() {
    let tmp = TempDir::new().unwrap();
    let engine = Arc::new(engine_with(&tmp, Some(Arc::new(VocabEmbedder)), None).await);
    let kb_id = engine.create_knowledge_base("docs", None, None).await.unwrap().id;
    engine
        .ingest(kb_id, "markdown", "guide.md", GUIDE_MD, None, Deadline::none())
        .await
        .unwrap();
    let before_len = engine.index().index(kb_id).await.unwrap().len();
    assert!(before_len > 0);

    let writes = 20;
    let done = Arc::new(AtomicBool::new(false));

    let mut readers = Vec::new();
    for _ in 0..3 {
        let engine = Arc::clone(&engine);
        let done = Arc::clone(&done);
        readers.push(tokio::spawn(async move {
            let mut last_generation = 0u64;
            let mut rounds = 0usize;
            loop {
                let index = engine.index().index(kb_id).await.unwrap();
                assert!(
                    index.len() >= before_len,
                    "index shrank to {} entries",
                    index.len()
                );
                assert!(index.generation() >= last_generation, "generation went backwards");
                last_generation = index.generation();

                let results = engine
                    .search(kb_id, "clone repo", 3, Deadline::none())
                    .await
                    .unwrap();
                assert!(!results.is_empty());

                rounds += 1;
                if done.load(Ordering::Acquire) {
                    break;
                }
                tokio::task::yield_now().await;
            }
            rounds
        }));
    }

    let writer = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            for i in 0..writes {
                let body = format!("# Ops {}\n\nThe backup retention policy number {}.\n", i, i);
                engine
                    .ingest(
                        kb_id,
                        "markdown",
                        &format!("ops/{}.md", i),
                        &body,
                        None,
                        Deadline::none(),
                    )
                    .await
                    .unwrap();
            }
        })
    };

    writer.await.unwrap();
    done.store(true, Ordering::Release);
    for reader in readers {
        assert!(reader.await.unwrap() > 0);
    }

    let last = engine.index().index(kb_id).await.unwrap();
    assert_eq!(last.len(), before_len + writes);
}

// ─── Write coordination ─────────────────────────────────────────────

#[tokio::test]
async fn test_expired_deadline_aborts_ingest() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(&tmp, None, None).await;
    let kb = engine.create_knowledge_base("docs", None, None).await.unwrap();

    let expired = Deadline::at(Instant::now() - Duration::from_millis(5));
    let err = engine
        .ingest(kb.id, "markdown", "a/b.md", PROJECT_MD, None, expired)
        .await
        .unwrap_err();
    assert!(matches!(err, KbError::DeadlineExceeded { .. }));
    assert_eq!(engine.stats(kb.id).await.unwrap().documents, 0);
}

#[tokio::test]
async fn test_held_database_lock_exhausts_retries() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(&tmp);
    config.db.busy_timeout_ms = 10;
    config.writer.max_attempts = 2;
    config.writer.base_delay_ms = 1;
    config.writer.min_delay_ms = 1;
    config.writer.jitter = 0.0;
    let engine = Engine::with_components(config, None, None).await.unwrap();
    let kb = engine.create_knowledge_base("docs", None, None).await.unwrap();

    let mut holder = engine.store().pool().acquire().await.unwrap();
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *holder).await.unwrap();

    let err = engine
        .ingest(kb.id, "markdown", "a/b.md", PROJECT_MD, None, Deadline::none())
        .await
        .unwrap_err();
    assert!(
        matches!(err, KbError::WriteConflict { attempts: 2, .. }),
        "unexpected error: {}",
        err
    );

    sqlx::query("ROLLBACK").execute(&mut *holder).await.unwrap();
    drop(holder);

    let report = engine
        .ingest(kb.id, "markdown", "a/b.md", PROJECT_MD, None, Deadline::none())
        .await
        .unwrap();
    assert_eq!(report.chunks_added, 3);
}
