//! Command handlers behind the `kbh` CLI.
//!
//! Each `run_*` function drives the [`Engine`] and prints a human-readable
//! summary to stdout. Diagnostics go through `tracing` to stderr.

use anyhow::{bail, Result};
use std::path::Path;
use std::time::Duration;

use crate::config::Config;
use crate::engine::Engine;
use crate::loader::{kind_for_path, FileLoader, Loader};
use crate::models::{ChunkMode, ChunkOptions, KnowledgeBase};
use crate::writer::Deadline;

/// Resolve a knowledge base given as a numeric id or a name.
pub async fn resolve_kb(engine: &Engine, kb: &str) -> Result<KnowledgeBase> {
    let found = match kb.parse::<i64>() {
        Ok(id) => engine.get_knowledge_base(id).await?,
        Err(_) => None,
    };
    let found = match found {
        Some(kb) => Some(kb),
        None => engine.find_knowledge_base(kb).await?,
    };
    match found {
        Some(kb) => Ok(kb),
        None => bail!("Knowledge base not found: {}", kb),
    }
}

fn deadline_from(timeout_secs: Option<u64>) -> Deadline {
    match timeout_secs {
        Some(secs) => Deadline::after(Duration::from_secs(secs)),
        None => Deadline::none(),
    }
}

pub async fn run_init(config: &Config) -> Result<()> {
    let engine = Engine::open(config.clone()).await?;
    println!("Database initialized at {}", engine.config().db.path.display());
    Ok(())
}

pub async fn run_kb_create(
    engine: &Engine,
    name: &str,
    description: Option<&str>,
    settings: Option<&str>,
) -> Result<()> {
    let settings = match settings {
        Some(raw) => Some(serde_json::from_str::<serde_json::Value>(raw)?),
        None => None,
    };
    let kb = engine
        .create_knowledge_base(name, description, settings.as_ref())
        .await?;
    println!("Created knowledge base '{}' (id {})", kb.name, kb.id);
    Ok(())
}

pub async fn run_kb_list(engine: &Engine) -> Result<()> {
    let kbs = engine.list_knowledge_bases().await?;
    if kbs.is_empty() {
        println!("No knowledge bases.");
        return Ok(());
    }
    println!("  {:>4}  {:<24} {:<17} {}", "ID", "NAME", "CREATED", "DESCRIPTION");
    println!("  {}", "-".repeat(72));
    for kb in &kbs {
        println!(
            "  {:>4}  {:<24} {:<17} {}",
            kb.id,
            kb.name,
            format_ts_iso(kb.created_at),
            kb.description.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

pub async fn run_kb_show(engine: &Engine, kb: &str) -> Result<()> {
    let kb = resolve_kb(engine, kb).await?;
    println!("{} (id {})", kb.name, kb.id);
    if let Some(desc) = &kb.description {
        println!("  {}", desc);
    }
    println!("  created: {}", format_ts_iso(kb.created_at));
    println!("  updated: {}", format_ts_iso(kb.updated_at));
    println!("  settings:");
    println!("{}", serde_json::to_string_pretty(&kb.settings)?);
    Ok(())
}

pub async fn run_kb_clear(engine: &Engine, kb: &str) -> Result<()> {
    let kb = resolve_kb(engine, kb).await?;
    let (chunks, documents) = engine.clear_knowledge_base(kb.id, Deadline::none()).await?;
    println!(
        "Cleared '{}': {} chunks, {} documents removed",
        kb.name, chunks, documents
    );
    Ok(())
}

pub async fn run_kb_delete(engine: &Engine, kb: &str) -> Result<()> {
    let kb = resolve_kb(engine, kb).await?;
    if engine.delete_knowledge_base(kb.id, Deadline::none()).await? {
        println!("Deleted knowledge base '{}'", kb.name);
    } else {
        println!("Knowledge base '{}' was already gone", kb.name);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn run_ingest(
    engine: &Engine,
    kb: &str,
    file: &Path,
    source_type: Option<&str>,
    source_path: Option<&str>,
    mode: Option<&str>,
    max_chars: Option<usize>,
    overlap: Option<usize>,
    timeout_secs: Option<u64>,
) -> Result<()> {
    let kb = resolve_kb(engine, kb).await?;
    let file_str = file.display().to_string();
    let source_type = source_type.unwrap_or_else(|| kind_for_path(&file_str));
    let source_path = source_path.unwrap_or(&file_str);

    let options = if mode.is_some() || max_chars.is_some() || overlap.is_some() {
        let base = kb.settings.chunk_options_for(source_type);
        let mode = match mode {
            Some(m) => match ChunkMode::parse(m) {
                Some(mode) => mode,
                None => bail!("Unknown chunk mode: {}", m),
            },
            None => base.mode,
        };
        Some(ChunkOptions {
            mode,
            max_chars: max_chars.unwrap_or(base.max_chars),
            overlap: overlap.unwrap_or(base.overlap),
        })
    } else {
        None
    };

    let items = FileLoader
        .load(&file_str, source_type, &serde_json::Value::Null)
        .await?;
    let report = engine
        .ingest_items(
            kb.id,
            source_type,
            source_path,
            &items,
            options,
            deadline_from(timeout_secs),
        )
        .await?;

    if report.skipped {
        println!(
            "{}: unchanged (version {}), skipped",
            source_path, report.document_version
        );
    } else {
        println!(
            "{}: version {}, {} chunks ({} embedded), {} replaced",
            source_path,
            report.document_version,
            report.chunks_added,
            report.embedded,
            report.chunks_deleted
        );
    }
    Ok(())
}

pub async fn run_delete_source(
    engine: &Engine,
    kb: &str,
    source_type: &str,
    source_path: &str,
    prefix: bool,
) -> Result<()> {
    let kb = resolve_kb(engine, kb).await?;
    let removed = if prefix {
        engine
            .delete_source_prefix(kb.id, source_type, source_path, Deadline::none())
            .await?
    } else {
        engine
            .delete_source(kb.id, source_type, source_path, Deadline::none())
            .await?
    };
    println!("Removed {} chunks", removed);
    Ok(())
}

pub async fn run_search(
    engine: &Engine,
    kb: &str,
    query: &str,
    limit: Option<usize>,
    timeout_secs: Option<u64>,
) -> Result<()> {
    let kb = resolve_kb(engine, kb).await?;
    let top_k = limit.unwrap_or(engine.config().retrieval.top_k);
    let results = engine
        .search(kb.id, query, top_k, deadline_from(timeout_secs))
        .await?;

    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, result) in results.iter().enumerate() {
        let ctx = result.metadata.context();
        println!(
            "{}. [{:.3}] {} ({}, {})",
            i + 1,
            result.score,
            result.source_path,
            result.origin.as_str(),
            result.metadata.kind().as_str()
        );
        if let Some(path) = &ctx.section_path {
            println!("    section: {}", path);
        }
        println!("    > {}", snippet(&result.content, 200));
        println!();
    }
    Ok(())
}

pub async fn run_reconcile(engine: &Engine, kb: &str) -> Result<()> {
    let kb = resolve_kb(engine, kb).await?;
    let report = engine.reconcile(kb.id, Deadline::none()).await?;
    println!("Removed {} stale chunks", report.stale_chunks_removed);
    if report.incomplete_documents.is_empty() {
        println!("All document versions complete.");
    } else {
        println!("Incomplete versions (re-ingest to repair):");
        for (path, version) in &report.incomplete_documents {
            println!("  {} (version {})", path, version);
        }
    }
    Ok(())
}

pub async fn run_stats(engine: &Engine, kb: &str) -> Result<()> {
    let kb = resolve_kb(engine, kb).await?;
    let stats = engine.stats(kb.id).await?;
    let db_size = std::fs::metadata(&engine.config().db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("{} (id {})", kb.name, kb.id);
    println!();
    println!("  Database:    {}", engine.config().db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Documents:   {}", stats.documents);
    println!("  Chunks:      {}", stats.chunks);
    println!(
        "  Embedded:    {} / {} ({}%)",
        stats.embedded,
        stats.chunks,
        if stats.chunks > 0 {
            (stats.embedded * 100) / stats.chunks
        } else {
            0
        }
    );

    if !stats.by_source_type.is_empty() {
        println!();
        println!("  {:<24} {:>6} {:>8}", "SOURCE TYPE", "DOCS", "CHUNKS");
        println!("  {}", "-".repeat(40));
        for (source_type, docs, chunks) in &stats.by_source_type {
            println!("  {:<24} {:>6} {:>8}", source_type, docs, chunks);
        }
    }
    println!();
    Ok(())
}

fn snippet(content: &str, max_chars: usize) -> String {
    let flat = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        let cut: String = flat.chars().take(max_chars).collect();
        format!("{}…", cut)
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
