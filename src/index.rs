//! Per-knowledge-base in-memory similarity index.
//!
//! Each knowledge base owns one [`FlatIndex`]: a brute-force inner-product
//! index over L2-normalised embeddings, rebuilt from the [`ChunkStore`] on
//! demand. Writers never touch the index directly; they bump a generation
//! counter via [`IndexManager::invalidate`] and the next search rebuilds.
//!
//! ```text
//!  Slot (one per KB)
//!  ┌───────────────────────────────────────────────┐
//!  │ generation: AtomicU64      ◄── invalidate()   │
//!  │ current: ArcSwapOption<FlatIndex{generation}> │
//!  │ build_lock: tokio Mutex                       │
//!  └───────────────────────────────────────────────┘
//! ```
//!
//! Search reads `current` without locking. When its generation is behind:
//!
//! - if another task holds `build_lock` and an older index exists, the older
//!   index is served;
//! - otherwise the caller takes `build_lock`, builds a new index off to the
//!   side, and swaps it in atomically.
//!
//! Readers therefore see a complete old index or a complete new one, never a
//! missing or half-built one.

use arc_swap::ArcSwapOption;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::embedding::{dot, l2_normalize};
use crate::error::{KbError, Result};
use crate::models::{ChunkRecord, KbId};
use crate::store::{ChunkStore, IndexRow};

/// A single similarity hit.
#[derive(Debug, Clone)]
pub struct Hit {
    pub record: Arc<ChunkRecord>,
    /// Cosine similarity in `[-1, 1]`.
    pub similarity: f32,
}

/// Counters from one index build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildReport {
    pub indexed: usize,
    pub skipped_dimension: usize,
    pub dims: usize,
}

struct Entry {
    vector: Vec<f32>,
    record: Arc<ChunkRecord>,
}

/// Immutable flat index over unit vectors.
pub struct FlatIndex {
    generation: u64,
    dims: usize,
    entries: Vec<Entry>,
}

impl FlatIndex {
    /// Build from stored rows. The first row fixes the dimension; rows with
    /// any other dimension are skipped.
    pub fn build(rows: Vec<IndexRow>, generation: u64) -> (Self, BuildReport) {
        let mut dims = 0usize;
        let mut skipped = 0usize;
        let mut entries = Vec::with_capacity(rows.len());

        for row in rows {
            let IndexRow { mut vector, record } = row;
            if vector.is_empty() {
                skipped += 1;
                continue;
            }
            if dims == 0 {
                dims = vector.len();
            }
            if vector.len() != dims {
                warn!(
                    chunk_id = record.id,
                    expected = dims,
                    actual = vector.len(),
                    "Skipping chunk with mismatched embedding dimension"
                );
                skipped += 1;
                continue;
            }
            l2_normalize(&mut vector);
            entries.push(Entry { vector, record });
        }

        let report = BuildReport {
            indexed: entries.len(),
            skipped_dimension: skipped,
            dims,
        };
        (
            Self {
                generation,
                dims,
                entries,
            },
            report,
        )
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Top-`k` entries by cosine similarity, ties broken by chunk id.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Hit>> {
        if k == 0 || self.entries.is_empty() {
            return Ok(Vec::new());
        }
        if query.len() != self.dims {
            return Err(KbError::DimensionMismatch {
                expected: self.dims,
                actual: query.len(),
            });
        }

        let mut q = query.to_vec();
        l2_normalize(&mut q);

        let mut scored: Vec<(f32, &Entry)> = self
            .entries
            .iter()
            .map(|e| (dot(&q, &e.vector), e))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.record.id.cmp(&b.1.record.id)));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(similarity, e)| Hit {
                record: Arc::clone(&e.record),
                similarity,
            })
            .collect())
    }
}

struct Slot {
    generation: AtomicU64,
    current: ArcSwapOption<FlatIndex>,
    build_lock: tokio::sync::Mutex<()>,
}

impl Slot {
    fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
            current: ArcSwapOption::const_empty(),
            build_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn fresh(&self) -> Option<Arc<FlatIndex>> {
        let target = self.generation.load(Ordering::Acquire);
        self.current
            .load_full()
            .filter(|idx| idx.generation == target)
    }
}

/// Owns the lazily built index of every knowledge base.
pub struct IndexManager {
    store: ChunkStore,
    slots: Mutex<HashMap<KbId, Arc<Slot>>>,
}

impl IndexManager {
    pub fn new(store: ChunkStore) -> Self {
        Self {
            store,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, kb_id: KbId) -> Arc<Slot> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(kb_id).or_insert_with(|| Arc::new(Slot::new())))
    }

    /// Mark the index of `kb_id` stale. The next search rebuilds it.
    pub fn invalidate(&self, kb_id: KbId) {
        let slot = self.slot(kb_id);
        let generation = slot.generation.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(kb_id, generation, "Index invalidated");
    }

    /// Drop all index state of a deleted knowledge base.
    pub fn forget(&self, kb_id: KbId) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.remove(&kb_id);
    }

    /// Nearest `candidate_k` chunks of `kb_id` to `query`.
    pub async fn search(&self, kb_id: KbId, query: &[f32], candidate_k: usize) -> Result<Vec<Hit>> {
        if candidate_k == 0 {
            return Ok(Vec::new());
        }
        let index = self.index(kb_id).await?;
        index.search(query, candidate_k)
    }

    /// The current index of `kb_id`, building it when missing or stale.
    pub async fn index(&self, kb_id: KbId) -> Result<Arc<FlatIndex>> {
        let slot = self.slot(kb_id);

        if let Some(index) = slot.fresh() {
            return Ok(index);
        }

        if let Some(stale) = slot.current.load_full() {
            match slot.build_lock.try_lock() {
                Ok(_guard) => {
                    if let Some(index) = slot.fresh() {
                        return Ok(index);
                    }
                    return self.rebuild(kb_id, &slot).await;
                }
                Err(_) => {
                    debug!(kb_id, generation = stale.generation, "Rebuild in progress, serving previous index");
                    return Ok(stale);
                }
            }
        }

        let _guard = slot.build_lock.lock().await;
        if let Some(index) = slot.fresh() {
            return Ok(index);
        }
        self.rebuild(kb_id, &slot).await
    }

    /// Build and publish a new index. Caller holds `slot.build_lock`.
    async fn rebuild(&self, kb_id: KbId, slot: &Slot) -> Result<Arc<FlatIndex>> {
        let started = Instant::now();
        // Snapshot before loading: a write that lands mid-build leaves this
        // index stale, so the next search rebuilds again.
        let generation = slot.generation.load(Ordering::Acquire);

        let rows = self.store.load_for_index(kb_id).await?;
        let total = self.store.chunk_total(kb_id).await?;
        let loaded = rows.len();
        let (index, report) = FlatIndex::build(rows, generation);

        if loaded > 0 && report.skipped_dimension * 2 > loaded {
            error!(
                kb_id,
                skipped = report.skipped_dimension,
                loaded,
                "More than half of the stored embeddings have a mismatched dimension; \
                 the index covers only the remaining subset"
            );
        }

        if total > 0 {
            let coverage = loaded as f64 / total as f64;
            if coverage < 0.5 {
                warn!(
                    kb_id,
                    with_vectors = loaded,
                    total,
                    "Less than half of the chunks have embeddings"
                );
            }
        }

        info!(
            kb_id,
            indexed = report.indexed,
            skipped = report.skipped_dimension,
            dims = report.dims,
            total_chunks = total,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Index built"
        );

        let index = Arc::new(index);
        slot.current.store(Some(Arc::clone(&index)));
        Ok(index)
    }
}
