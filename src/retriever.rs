//! Hybrid retrieval: dense candidates, keyword candidates, merge, rerank.
//!
//! ```text
//! query ─▶ intent ─┬─▶ embed ─▶ IndexManager::search ─▶ boost ─┐
//!                  │                                           ├─▶ merge/dedup ─▶ rerank? ─▶ top_k
//!                  └─▶ ChunkStore::load_for_keyword ─▶ score ──┘                  └─ fallback order
//! ```
//!
//! Both phases are best effort with respect to collaborators: a missing or
//! failing embedder leaves only keyword candidates, and a missing or failing
//! reranker leaves the heuristic ordering. Storage errors propagate.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::RetrievalConfig;
use crate::embedding::{embed_one, Embedder};
use crate::error::{KbError, Result};
use crate::index::{Hit, IndexManager};
use crate::intent::{Intent, IntentDetector};
use crate::keyword::{KeywordHit, KeywordQuery, KeywordScorer};
use crate::models::{KbId, Origin, RetrievalSettings, SearchResult};
use crate::rerank::Reranker;
use crate::store::ChunkStore;
use crate::writer::Deadline;

const PROCEDURAL_BOOST: f32 = 1.5;
const SECTION_MATCH_BOOST: f32 = 1.2;

pub struct HybridRetriever {
    store: ChunkStore,
    index: Arc<IndexManager>,
    embedder: Option<Arc<dyn Embedder>>,
    reranker: Option<Arc<dyn Reranker>>,
    intents: IntentDetector,
    keywords: KeywordScorer,
    config: RetrievalConfig,
}

impl HybridRetriever {
    pub fn new(
        store: ChunkStore,
        index: Arc<IndexManager>,
        embedder: Option<Arc<dyn Embedder>>,
        reranker: Option<Arc<dyn Reranker>>,
        config: RetrievalConfig,
    ) -> Result<Self> {
        Ok(Self {
            store,
            index,
            embedder,
            reranker,
            intents: IntentDetector::new()?,
            keywords: KeywordScorer::new()?,
            config,
        })
    }

    /// Candidate pool size for the dense phase.
    pub fn dense_pool(&self, max_candidates: usize, intent: Intent) -> usize {
        if intent.is_howto() {
            max_candidates
                .saturating_mul(3)
                .max(self.config.howto_pool_floor)
                .min(self.config.howto_pool_cap)
        } else {
            max_candidates
        }
    }

    pub async fn search(
        &self,
        kb_id: KbId,
        settings: &RetrievalSettings,
        query: &str,
        top_k: usize,
        deadline: Deadline,
    ) -> Result<Vec<SearchResult>> {
        if top_k == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }
        deadline.check("search")?;

        let intent = self.intents.detect(query);
        let max_candidates = settings
            .max_candidates
            .unwrap_or(self.config.max_candidates)
            .max(1);
        let prepared = self.keywords.prepare(query, intent);

        let dense = self
            .dense_candidates(kb_id, query, &prepared, max_candidates, deadline)
            .await?;
        let keyword = self.keyword_candidates(kb_id, &prepared, max_candidates).await?;
        debug!(
            kb_id,
            howto = intent.is_howto(),
            dense = dense.len(),
            keyword = keyword.len(),
            "Retrieved candidates"
        );

        let mut merged = merge(dense, keyword, self.config.dedup_prefix_chars);
        if merged.is_empty() {
            return Ok(merged);
        }

        if self.rerank(query, &mut merged, deadline).await {
            merged.truncate(top_k);
            return Ok(merged);
        }

        fallback_order(&mut merged, intent);
        merged.truncate(top_k);
        Ok(merged)
    }

    async fn dense_candidates(
        &self,
        kb_id: KbId,
        query: &str,
        prepared: &KeywordQuery,
        max_candidates: usize,
        deadline: Deadline,
    ) -> Result<Vec<SearchResult>> {
        let Some(embedder) = &self.embedder else {
            return Ok(Vec::new());
        };
        let vector = match deadline.bound(embed_one(embedder.as_ref(), query)).await {
            Some(Some(v)) => v,
            Some(None) => {
                debug!(kb_id, "Query embedding unavailable, keyword-only search");
                return Ok(Vec::new());
            }
            None => {
                warn!(kb_id, "Query embedding hit the deadline, keyword-only search");
                return Ok(Vec::new());
            }
        };

        let pool = self.dense_pool(max_candidates, prepared.intent);
        let hits = match self.index.search(kb_id, &vector, pool).await {
            Ok(hits) => hits,
            Err(KbError::DimensionMismatch { expected, actual }) => {
                warn!(
                    kb_id,
                    expected,
                    actual,
                    "Query embedding dimension differs from the index, keyword-only search"
                );
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        Ok(hits
            .into_iter()
            .map(|hit| dense_result(hit, prepared))
            .collect())
    }

    async fn keyword_candidates(
        &self,
        kb_id: KbId,
        prepared: &KeywordQuery,
        max_candidates: usize,
    ) -> Result<Vec<SearchResult>> {
        let tokens = KeywordScorer::prefilter_tokens(prepared);
        if !tokens.is_empty() {
            debug!(kb_id, tokens = ?tokens, "Keyword pre-filter");
        }
        let records = self.store.load_for_keyword(kb_id, &tokens).await?;
        Ok(self
            .keywords
            .rank(prepared, records, max_candidates)
            .into_iter()
            .map(keyword_result)
            .collect())
    }

    /// Rerank in place. Returns `false` when the heuristic order should be
    /// used instead.
    async fn rerank(&self, query: &str, results: &mut [SearchResult], deadline: Deadline) -> bool {
        let Some(reranker) = &self.reranker else {
            return false;
        };
        let texts: Vec<String> = results.iter().map(|r| r.content.clone()).collect();
        let scores = match deadline.bound(reranker.score(query, &texts)).await {
            Some(Ok(scores)) => scores,
            Some(Err(e)) => {
                let err = KbError::RerankFailure(e.to_string());
                warn!(error = %err, "Falling back to heuristic ordering");
                return false;
            }
            None => {
                warn!("Reranker hit the deadline, falling back to heuristic ordering");
                return false;
            }
        };
        if scores.len() != results.len() {
            warn!(
                expected = results.len(),
                got = scores.len(),
                "Reranker returned a mismatched score count, falling back to heuristic ordering"
            );
            return false;
        }

        for (result, score) in results.iter_mut().zip(scores) {
            result.rerank_score = Some(score);
            result.score = score as f64;
        }
        results.sort_by(|a, b| {
            let a = a.rerank_score.unwrap_or(f32::NEG_INFINITY);
            let b = b.rerank_score.unwrap_or(f32::NEG_INFINITY);
            b.total_cmp(&a)
        });
        true
    }
}

fn dense_result(hit: Hit, query: &KeywordQuery) -> SearchResult {
    let Hit { record, similarity } = hit;
    let mut similarity = similarity;
    if query.intent.is_howto() {
        if record.metadata.kind().is_procedural() {
            similarity *= PROCEDURAL_BOOST;
        }
        let section_path = record
            .metadata
            .context()
            .section_path
            .as_deref()
            .map(str::to_lowercase)
            .unwrap_or_default();
        if !section_path.is_empty()
            && query.words.iter().any(|w| section_path.contains(w.as_str()))
        {
            similarity *= SECTION_MATCH_BOOST;
        }
    }
    let record = Arc::unwrap_or_clone(record);
    SearchResult {
        chunk_id: record.id,
        content: record.content,
        metadata: record.metadata,
        source_type: record.source_type,
        source_path: record.source_path,
        score: similarity as f64,
        distance: -(similarity as f64),
        origin: Origin::Dense,
        rerank_score: None,
    }
}

fn keyword_result(hit: KeywordHit) -> SearchResult {
    let distance = hit.distance();
    let KeywordHit { record, score } = hit;
    SearchResult {
        chunk_id: record.id,
        content: record.content,
        metadata: record.metadata,
        source_type: record.source_type,
        source_path: record.source_path,
        score,
        distance,
        origin: Origin::Keyword,
        rerank_score: None,
    }
}

/// Dense first, then keyword, dropping any result whose
/// `(source_path, leading content)` was already seen.
fn merge(dense: Vec<SearchResult>, keyword: Vec<SearchResult>, prefix_chars: usize) -> Vec<SearchResult> {
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut merged = Vec::with_capacity(dense.len() + keyword.len());
    for result in dense.into_iter().chain(keyword) {
        let key = (
            result.source_path.clone(),
            result.content.chars().take(prefix_chars).collect::<String>(),
        );
        if seen.insert(key) {
            merged.push(result);
        }
    }
    merged
}

/// Stable heuristic order used when no reranker applies.
fn fallback_order(results: &mut [SearchResult], intent: Intent) {
    if intent.is_howto() {
        results.sort_by(|a, b| {
            let a_key = (!a.metadata.kind().is_procedural(), a.origin != Origin::Keyword);
            let b_key = (!b.metadata.kind().is_procedural(), b.origin != Origin::Keyword);
            a_key
                .cmp(&b_key)
                .then(a.distance.partial_cmp(&b.distance).unwrap_or(Ordering::Equal))
        });
    } else {
        results.sort_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap_or(Ordering::Equal));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkContext, ChunkKind, ChunkMetadata};

    fn result(id: i64, path: &str, content: &str, kind: ChunkKind, distance: f64, origin: Origin) -> SearchResult {
        SearchResult {
            chunk_id: id,
            content: content.into(),
            metadata: ChunkMetadata::new(kind, None, ChunkContext::default()),
            source_type: "wiki".into(),
            source_path: path.into(),
            score: -distance,
            distance,
            origin,
            rerank_score: None,
        }
    }

    #[test]
    fn test_merge_dedups_on_path_and_prefix() {
        let dense = vec![result(1, "a", "same text", ChunkKind::Text, -0.9, Origin::Dense)];
        let keyword = vec![
            result(1, "a", "same text", ChunkKind::Text, 0.2, Origin::Keyword),
            result(2, "b", "same text", ChunkKind::Text, 0.3, Origin::Keyword),
        ];
        let merged = merge(dense, keyword, 200);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].origin, Origin::Dense);
        assert_eq!(merged[1].source_path, "b");
    }

    #[test]
    fn test_merge_prefix_length_is_in_chars() {
        let dense = vec![result(1, "a", "ééé-one", ChunkKind::Text, -0.9, Origin::Dense)];
        let keyword = vec![result(2, "a", "ééé-two", ChunkKind::Text, 0.2, Origin::Keyword)];
        assert_eq!(merge(dense.clone(), keyword.clone(), 3).len(), 1);
        assert_eq!(merge(dense, keyword, 5).len(), 2);
    }

    #[test]
    fn test_fallback_general_sorts_by_distance() {
        let mut results = vec![
            result(1, "a", "x", ChunkKind::Text, 0.5, Origin::Keyword),
            result(2, "b", "y", ChunkKind::Text, -0.7, Origin::Dense),
            result(3, "c", "z", ChunkKind::Code, -0.2, Origin::Dense),
        ];
        fallback_order(&mut results, Intent::General);
        let ids: Vec<i64> = results.iter().map(|r| r.chunk_id).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn test_fallback_howto_prefers_procedural_then_keyword() {
        let mut results = vec![
            result(1, "a", "x", ChunkKind::Text, -0.95, Origin::Dense),
            result(2, "b", "y", ChunkKind::Code, -0.30, Origin::Dense),
            result(3, "c", "z", ChunkKind::List, 0.10, Origin::Keyword),
            result(4, "d", "w", ChunkKind::Text, 0.05, Origin::Keyword),
        ];
        fallback_order(&mut results, Intent::HowTo);
        let ids: Vec<i64> = results.iter().map(|r| r.chunk_id).collect();
        assert_eq!(ids, vec![3, 2, 4, 1]);
    }

    #[test]
    fn test_fallback_is_stable_on_ties() {
        let mut results = vec![
            result(7, "a", "x", ChunkKind::Text, 0.5, Origin::Keyword),
            result(3, "b", "y", ChunkKind::Text, 0.5, Origin::Keyword),
        ];
        fallback_order(&mut results, Intent::General);
        let ids: Vec<i64> = results.iter().map(|r| r.chunk_id).collect();
        assert_eq!(ids, vec![7, 3]);
    }
}
