//! Write coordination: per-knowledge-base locking, retries and batching.
//!
//! SQLite allows a single writer. Within one process, mutations of the same
//! knowledge base are serialised by a per-KB async mutex; across processes
//! (or between knowledge bases) SQLite's own locking still applies, and the
//! resulting `SQLITE_BUSY` / `SQLITE_LOCKED` errors are absorbed by
//! [`RetryPolicy`]:
//!
//! ```text
//! attempt 0 ──busy──▶ sleep base·2⁰ ±jitter ──▶ attempt 1 ──busy──▶ sleep base·2¹ ...
//!                                                   │
//!                       deadline would pass ◀───────┤──▶ DeadlineExceeded
//!                       max_attempts reached ◀──────┘──▶ WriteConflict
//! ```
//!
//! Every locked mutation invalidates the knowledge base's index when it
//! finishes, whether it succeeded or not, since a partially applied batch
//! still changes what the index should contain.

use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use crate::config::WriterConfig;
use crate::error::{KbError, Result};
use crate::index::IndexManager;
use crate::models::{ChunkDraft, ChunkId, DocumentId, KbId};
use crate::store::ChunkStore;

// ============ Deadline ============

/// An optional point in time after which an operation gives up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// No deadline.
    pub fn none() -> Self {
        Deadline(None)
    }

    pub fn after(timeout: Duration) -> Self {
        Deadline(Some(Instant::now() + timeout))
    }

    pub fn at(instant: Instant) -> Self {
        Deadline(Some(instant))
    }

    /// Time left, `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.0.map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.remaining(), Some(d) if d.is_zero())
    }

    pub fn check(&self, operation: &str) -> Result<()> {
        if self.is_expired() {
            return Err(KbError::DeadlineExceeded {
                operation: operation.to_string(),
            });
        }
        Ok(())
    }

    /// Run `fut` until it completes or the deadline passes. `None` on timeout.
    pub async fn bound<F: Future>(&self, fut: F) -> Option<F::Output> {
        match self.remaining() {
            None => Some(fut.await),
            Some(left) => tokio::time::timeout(left, fut).await.ok(),
        }
    }
}

// ============ Retry ============

/// Exponential backoff for lock contention.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: WriterConfig,
}

impl RetryPolicy {
    pub fn new(config: WriterConfig) -> Self {
        Self { config }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay_ms as f64 * 2f64.powi(attempt.min(16) as i32);
        let jitter = self.config.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            1.0 + rand::thread_rng().gen_range(-jitter..=jitter)
        } else {
            1.0
        };
        let ms = (base * factor).max(self.config.min_delay_ms as f64);
        Duration::from_millis(ms as u64)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, runs out
    /// of attempts, or would sleep past `deadline`.
    pub async fn run<T, F, Fut>(&self, deadline: Deadline, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            deadline.check(operation)?;
            let err = match op().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(operation, attempts = attempt + 1, "Write succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_retryable() => e,
                Err(e) => return Err(e),
            };

            attempt += 1;
            if attempt >= max_attempts {
                warn!(operation, attempts = attempt, error = %err, "Giving up on locked database");
                return Err(KbError::WriteConflict {
                    operation: operation.to_string(),
                    attempts: attempt,
                });
            }

            let delay = self.delay(attempt - 1);
            if let Some(left) = deadline.remaining() {
                if delay >= left {
                    return Err(KbError::DeadlineExceeded {
                        operation: operation.to_string(),
                    });
                }
            }
            warn!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Database locked, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

// ============ Coordinator ============

/// Counts from one two-phase insert.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    pub chunk_ids: Vec<ChunkId>,
    pub embedded: usize,
}

pub struct WriteCoordinator {
    store: ChunkStore,
    index: Arc<IndexManager>,
    retry: RetryPolicy,
    insert_batch_size: usize,
    embedding_batch_size: usize,
    locks: Mutex<HashMap<KbId, Arc<tokio::sync::Mutex<()>>>>,
}

impl WriteCoordinator {
    pub fn new(store: ChunkStore, index: Arc<IndexManager>, config: WriterConfig) -> Self {
        Self {
            store,
            index,
            insert_batch_size: config.insert_batch_size.max(1),
            embedding_batch_size: config.embedding_batch_size.max(1),
            retry: RetryPolicy::new(config),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the write lock of `kb_id`, waiting no longer than `deadline`.
    pub async fn lock(&self, kb_id: KbId, deadline: Deadline) -> Result<OwnedMutexGuard<()>> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(kb_id).or_default())
        };
        deadline
            .bound(mutex.lock_owned())
            .await
            .ok_or_else(|| KbError::DeadlineExceeded {
                operation: format!("write lock for knowledge base {}", kb_id),
            })
    }

    /// Run `op` while holding the lock of `kb_id`, then invalidate its index.
    pub async fn run<T, F, Fut>(&self, kb_id: KbId, deadline: Deadline, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _guard = self.lock(kb_id, deadline).await?;
        let result = op().await;
        self.index.invalidate(kb_id);
        result
    }

    /// Retry a single store operation. Does not lock.
    pub async fn retry<T, F, Fut>(&self, deadline: Deadline, operation: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.retry.run(deadline, operation, op).await
    }

    /// Two-phase insert of one document version. The caller holds the lock.
    ///
    /// Rows are inserted without vectors in sub-batches, then vectors are
    /// attached in separate sub-batches. Each sub-batch is its own
    /// transaction and its own retry unit.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_batch(
        &self,
        kb_id: KbId,
        document_id: DocumentId,
        source_type: &str,
        source_path: &str,
        doc_version: i64,
        drafts: &[ChunkDraft],
        embeddings: &[Option<Vec<f32>>],
        deadline: Deadline,
    ) -> Result<InsertOutcome> {
        let mut chunk_ids = Vec::with_capacity(drafts.len());
        for batch in drafts.chunks(self.insert_batch_size) {
            let ids = self
                .retry(deadline, "insert_rows", || {
                    self.store
                        .insert_rows(kb_id, document_id, source_type, source_path, doc_version, batch)
                })
                .await?;
            chunk_ids.extend(ids);
        }

        let updates: Vec<(ChunkId, &[f32])> = chunk_ids
            .iter()
            .zip(embeddings)
            .filter_map(|(id, v)| v.as_deref().map(|v| (*id, v)))
            .collect();
        for batch in updates.chunks(self.embedding_batch_size) {
            self.retry(deadline, "fill_embeddings", || self.store.fill_embeddings(batch))
                .await?;
        }

        debug!(
            kb_id,
            source_path,
            doc_version,
            rows = chunk_ids.len(),
            embedded = updates.len(),
            "Inserted chunk set"
        );
        Ok(InsertOutcome {
            embedded: updates.len(),
            chunk_ids,
        })
    }

    /// Delete the chunks of one source and insert a new set. The caller holds
    /// the lock. Returns the number of chunks deleted and the insert outcome.
    #[allow(clippy::too_many_arguments)]
    pub async fn replace_source(
        &self,
        kb_id: KbId,
        document_id: DocumentId,
        source_type: &str,
        source_path: &str,
        doc_version: i64,
        drafts: &[ChunkDraft],
        embeddings: &[Option<Vec<f32>>],
        deadline: Deadline,
    ) -> Result<(u64, InsertOutcome)> {
        let deleted = self
            .retry(deadline, "delete_exact", || {
                self.store.delete_exact(kb_id, source_type, source_path)
            })
            .await?;
        let outcome = self
            .insert_batch(
                kb_id,
                document_id,
                source_type,
                source_path,
                doc_version,
                drafts,
                embeddings,
                deadline,
            )
            .await?;
        Ok((deleted, outcome))
    }

    /// Remove one source with its document row.
    pub async fn delete_source(
        &self,
        kb_id: KbId,
        source_type: &str,
        source_path: &str,
        deadline: Deadline,
    ) -> Result<u64> {
        self.run(kb_id, deadline, || {
            self.retry(deadline, "delete_document", || {
                self.store.delete_document(kb_id, source_type, source_path)
            })
        })
        .await
    }

    pub async fn delete_prefix(
        &self,
        kb_id: KbId,
        source_type: &str,
        prefix: &str,
        deadline: Deadline,
    ) -> Result<u64> {
        self.run(kb_id, deadline, || {
            self.retry(deadline, "delete_prefix", || {
                self.store.delete_prefix(kb_id, source_type, prefix)
            })
        })
        .await
    }

    pub async fn clear_kb(&self, kb_id: KbId, deadline: Deadline) -> Result<(u64, u64)> {
        self.run(kb_id, deadline, || {
            self.retry(deadline, "clear_kb", || self.store.clear_kb(kb_id))
        })
        .await
    }

    /// Delete a knowledge base and release its lock and index state.
    pub async fn delete_kb(&self, kb_id: KbId, deadline: Deadline) -> Result<bool> {
        let deleted = self
            .run(kb_id, deadline, || {
                self.retry(deadline, "delete_kb", || self.store.delete_kb(kb_id))
            })
            .await?;
        if deleted {
            self.index.forget(kb_id);
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.remove(&kb_id);
        }
        Ok(deleted)
    }

    pub async fn sweep_stale(&self, kb_id: KbId, deadline: Deadline) -> Result<u64> {
        self.run(kb_id, deadline, || {
            self.retry(deadline, "sweep_stale", || self.store.sweep_stale(kb_id))
        })
        .await
    }
}
