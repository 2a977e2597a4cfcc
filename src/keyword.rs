//! Field-weighted keyword scoring.
//!
//! Every candidate chunk is scored on its own against the lowercased query:
//!
//! | Signal | Points |
//! |--------|--------|
//! | query word found in content | 1 each |
//! | ... in doc title | 3 each |
//! | ... in section title | 2 each |
//! | ... in section path | 2.5 each |
//! | ... in source path | 2 each |
//! | code or list chunk (how-to only) | 3 |
//! | shell command at a line start (how-to only) | 2 |
//! | whole query in doc title / section path / section title / content | 10 / 8 / 5 / 3 |
//!
//! Matching is substring based, so `clone` also hits `cloned`.

use regex::Regex;

use crate::error::{KbError, Result};
use crate::intent::Intent;
use crate::models::ChunkRecord;

/// Tokens that, when present in a how-to query, narrow the SQL candidate set
/// to chunks containing at least one of them.
pub const STRONG_TOKENS: &[&str] = &[
    "repo",
    "--depth",
    "--reference",
    "mkdir",
    "cd",
    "git",
    "init",
    "sync",
    "build",
    "compile",
    "install",
    "docker",
    "npm",
    "yarn",
    "pip",
    "apt",
    "yum",
];

/// A shell command at the very start of a line. Indented lines do not count.
const COMMAND_PATTERN: &str = r"(?i)(^|\n)(repo|git|mkdir|cd|python|docker|npm|yarn|pip|apt|yum)\b";

#[derive(Debug, Clone)]
pub struct KeywordHit {
    pub record: ChunkRecord,
    pub score: f64,
}

impl KeywordHit {
    /// Distance on the same "lower is better" scale as dense hits.
    pub fn distance(&self) -> f64 {
        1.0 / (self.score + 1.0)
    }
}

/// A query prepared for scoring.
#[derive(Debug, Clone)]
pub struct KeywordQuery {
    pub phrase: String,
    pub words: Vec<String>,
    pub intent: Intent,
}

pub struct KeywordScorer {
    word: Regex,
    command: Regex,
}

impl KeywordScorer {
    pub fn new() -> Result<Self> {
        let word = Regex::new(r"\w+").map_err(|e| KbError::Config(e.to_string()))?;
        let command = Regex::new(COMMAND_PATTERN).map_err(|e| KbError::Config(e.to_string()))?;
        Ok(Self { word, command })
    }

    pub fn prepare(&self, query: &str, intent: Intent) -> KeywordQuery {
        let phrase = query.trim().to_lowercase();
        let words = self
            .word
            .find_iter(&phrase)
            .map(|m| m.as_str().to_string())
            .collect();
        KeywordQuery {
            phrase,
            words,
            intent,
        }
    }

    /// Strong tokens occurring in a how-to query.
    ///
    /// Tokens are matched as substrings of the query, so any chunk that
    /// contains the whole query also passes the filter.
    pub fn prefilter_tokens(query: &KeywordQuery) -> Vec<&'static str> {
        if !query.intent.is_howto() {
            return Vec::new();
        }
        STRONG_TOKENS
            .iter()
            .copied()
            .filter(|t| query.phrase.contains(t))
            .collect()
    }

    pub fn score(&self, query: &KeywordQuery, record: &ChunkRecord) -> f64 {
        if query.phrase.is_empty() {
            return 0.0;
        }
        let ctx = record.metadata.context();
        let content = record.content.to_lowercase();
        let doc_title = lower(ctx.doc_title.as_deref());
        let section_title = lower(ctx.section_title.as_deref());
        let section_path = lower(ctx.section_path.as_deref());
        let source_path = record.source_path.to_lowercase();

        let hits = |field: &str| -> f64 {
            if field.is_empty() {
                return 0.0;
            }
            query.words.iter().filter(|w| field.contains(w.as_str())).count() as f64
        };

        let mut score = hits(&content)
            + hits(&doc_title) * 3.0
            + hits(&section_title) * 2.0
            + hits(&section_path) * 2.5
            + hits(&source_path) * 2.0;

        if query.intent.is_howto() {
            if record.metadata.kind().is_procedural() {
                score += 3.0;
            }
            if self.command.is_match(&record.content) {
                score += 2.0;
            }
        }

        let phrase = query.phrase.as_str();
        if doc_title.contains(phrase) {
            score += 10.0;
        }
        if section_path.contains(phrase) {
            score += 8.0;
        }
        if section_title.contains(phrase) {
            score += 5.0;
        }
        if content.contains(phrase) {
            score += 3.0;
        }
        score
    }

    /// Score `records`, keep positive scores, best first, at most `limit`.
    pub fn rank(&self, query: &KeywordQuery, records: Vec<ChunkRecord>, limit: usize) -> Vec<KeywordHit> {
        let mut hits: Vec<KeywordHit> = records
            .into_iter()
            .filter_map(|record| {
                let score = self.score(query, &record);
                (score > 0.0).then_some(KeywordHit { record, score })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(a.record.id.cmp(&b.record.id))
        });
        hits.truncate(limit);
        hits
    }
}

fn lower(s: Option<&str>) -> String {
    s.map(str::to_lowercase).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkContext, ChunkKind, ChunkMetadata};

    fn record(id: i64, kind: ChunkKind, content: &str, ctx: ChunkContext) -> ChunkRecord {
        ChunkRecord {
            id,
            kb_id: 1,
            document_id: 1,
            source_type: "wiki".into(),
            source_path: "wiki/page".into(),
            doc_version: 1,
            content: content.into(),
            metadata: ChunkMetadata::new(kind, None, ctx),
        }
    }

    #[test]
    fn test_content_and_phrase_points() {
        let scorer = KeywordScorer::new().unwrap();
        let q = scorer.prepare("Retention Policy", Intent::General);
        let r = record(1, ChunkKind::Text, "The retention policy is 30 days.", ChunkContext::default());
        // two word hits + phrase in content
        assert_eq!(scorer.score(&q, &r), 5.0);
    }

    #[test]
    fn test_title_fields_are_weighted() {
        let scorer = KeywordScorer::new().unwrap();
        let q = scorer.prepare("backup", Intent::General);
        let ctx = ChunkContext {
            doc_title: Some("Backup guide".into()),
            section_title: Some("Nightly backup".into()),
            section_path: Some("Ops > Nightly backup".into()),
            ..Default::default()
        };
        let r = record(1, ChunkKind::Text, "unrelated body", ctx);
        // 3 + 2 + 2.5 word hits, phrase bonuses 10 + 8 + 5
        assert_eq!(scorer.score(&q, &r), 30.5);
    }

    #[test]
    fn test_howto_boosts_procedural_chunks() {
        let scorer = KeywordScorer::new().unwrap();
        let q = scorer.prepare("how to clone", Intent::HowTo);
        let code = record(1, ChunkKind::Code, "git clone https://x", ChunkContext::default());
        let text = record(2, ChunkKind::Text, "you can clone things", ChunkContext::default());
        let code_score = scorer.score(&q, &code);
        let text_score = scorer.score(&q, &text);
        assert_eq!(code_score, 1.0 + 3.0 + 2.0);
        assert_eq!(text_score, 1.0);
    }

    #[test]
    fn test_command_bonus_needs_line_start() {
        let scorer = KeywordScorer::new().unwrap();
        let q = scorer.prepare("how to deploy", Intent::HowTo);
        let command = record(1, ChunkKind::Text, "Deploy steps:\ndocker compose up", ChunkContext::default());
        let indented = record(2, ChunkKind::Text, "Deploy steps:\n  cd in the folder first", ChunkContext::default());
        assert_eq!(scorer.score(&q, &command), 1.0 + 2.0);
        assert_eq!(scorer.score(&q, &indented), 1.0);
    }

    #[test]
    fn test_rank_drops_zero_and_breaks_ties_by_id() {
        let scorer = KeywordScorer::new().unwrap();
        let q = scorer.prepare("alpha", Intent::General);
        let records = vec![
            record(5, ChunkKind::Text, "alpha one", ChunkContext::default()),
            record(2, ChunkKind::Text, "beta", ChunkContext::default()),
            record(3, ChunkKind::Text, "alpha two", ChunkContext::default()),
        ];
        let hits = scorer.rank(&q, records, 10);
        let ids: Vec<i64> = hits.iter().map(|h| h.record.id).collect();
        assert_eq!(ids, vec![3, 5]);
        assert!((hits[0].distance() - 1.0 / 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_prefilter_only_for_howto() {
        let scorer = KeywordScorer::new().unwrap();
        let howto = scorer.prepare("how to git clone with --depth", Intent::HowTo);
        assert_eq!(KeywordScorer::prefilter_tokens(&howto), vec!["--depth", "git"]);
        let general = scorer.prepare("git history", Intent::General);
        assert!(KeywordScorer::prefilter_tokens(&general).is_empty());
    }
}
