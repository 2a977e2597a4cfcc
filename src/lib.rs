//! # KB Harness
//!
//! Versioned knowledge-base ingestion with hybrid dense and keyword retrieval.
//!
//! Sources are hashed, versioned, split into structure-aware chunks, embedded
//! when an embedding provider is configured, and stored in SQLite. Queries run
//! against an in-memory similarity index per knowledge base plus a
//! field-weighted keyword scorer; the two candidate sets are merged,
//! optionally re-ranked, and ordered with query intent in mind.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌─────────────────┐
//! │  Loader  │──▶│ Version check │──▶│ Chunk + Embed   │
//! └──────────┘   └──────────────┘   └────────┬────────┘
//!                                            ▼
//!                                 ┌─────────────────────┐
//!                                 │  WriteCoordinator   │  per-KB lock, retry
//!                                 └──────────┬──────────┘
//!                                            ▼
//!                ┌─────────────┐     ┌──────────────┐
//!                │ IndexManager│◀────│   SQLite     │
//!                └──────┬──────┘     └──────┬───────┘
//!                       └──────┬────────────┘
//!                              ▼
//!                      ┌───────────────┐
//!                      │HybridRetriever│──▶ results
//!                      └───────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! kbh init
//! kbh kb create docs
//! kbh ingest docs ./handbook/setup.md
//! kbh search docs "how to clone the repo"
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`engine`] | Facade over every operation |
//! | [`chunk`] | Full, fixed-window and structural chunking |
//! | [`version`] | Content hashing and document versions |
//! | [`store`] | Knowledge bases and chunks in SQLite |
//! | [`index`] | Per-KB in-memory similarity index |
//! | [`retriever`] | Hybrid retrieval, merge and rerank |
//! | [`intent`] | How-to query detection |
//! | [`keyword`] | Field-weighted keyword scoring |
//! | [`writer`] | Write locking, retry and batching |
//! | [`embedding`] | Embedding providers and vector utilities |
//! | [`rerank`] | Optional re-ranking provider |
//! | [`loader`] | Source loaders |
//! | [`config`] | TOML configuration |
//! | [`error`] | Error type |

pub mod chunk;
pub mod commands;
pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod index;
pub mod intent;
pub mod keyword;
pub mod loader;
pub mod migrate;
pub mod models;
pub mod rerank;
pub mod retriever;
pub mod store;
pub mod version;
pub mod writer;

pub use engine::Engine;
pub use error::{KbError, Result};
pub use writer::Deadline;
