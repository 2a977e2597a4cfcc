//! Optional cross-encoder re-ranking.
//!
//! A [`Reranker`] scores `(query, text)` pairs; higher is more relevant. The
//! retriever treats any failure as a signal to fall back to its heuristic
//! ordering, so implementations only need to report errors, not recover.
//!
//! [`HttpReranker`] talks to a TEI-compatible `/rerank` endpoint:
//!
//! ```text
//! POST {url}/rerank  {"query": "...", "texts": ["...", "..."]}
//! → [{"index": 1, "score": 0.93}, {"index": 0, "score": 0.12}]
//! ```

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RerankerConfig;

#[async_trait]
pub trait Reranker: Send + Sync {
    /// One score per input text, in input order.
    async fn score(&self, query: &str, texts: &[String]) -> Result<Vec<f32>>;
}

pub struct HttpReranker {
    url: String,
    client: reqwest::Client,
}

impl HttpReranker {
    pub fn new(config: &RerankerConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("reranker.url required for http provider"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl Reranker for HttpReranker {
    async fn score(&self, query: &str, texts: &[String]) -> Result<Vec<f32>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "query": query,
            "texts": texts,
        });
        let response = self
            .client
            .post(format!("{}/rerank", self.url))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("Reranker error {}: {}", status, body_text);
        }

        let json: serde_json::Value = response.json().await?;
        parse_rerank_response(&json, texts.len())
    }
}

/// Map `[{index, score}]` back onto input order.
fn parse_rerank_response(json: &serde_json::Value, expected: usize) -> Result<Vec<f32>> {
    let items = json
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("Invalid rerank response: expected an array"))?;

    let mut scores: Vec<Option<f32>> = vec![None; expected];
    for item in items {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .ok_or_else(|| anyhow::anyhow!("Invalid rerank response: missing index"))?
            as usize;
        let score = item
            .get("score")
            .and_then(|s| s.as_f64())
            .ok_or_else(|| anyhow::anyhow!("Invalid rerank response: missing score"))?;
        if index >= expected {
            bail!("Invalid rerank response: index {} out of range", index);
        }
        scores[index] = Some(score as f32);
    }

    scores
        .into_iter()
        .enumerate()
        .map(|(i, s)| s.ok_or_else(|| anyhow::anyhow!("Rerank response missing score for {}", i)))
        .collect()
}

pub fn create_reranker(config: &RerankerConfig) -> Result<Option<Arc<dyn Reranker>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "http" => Ok(Some(Arc::new(HttpReranker::new(config)?))),
        other => bail!("Unknown reranker provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_maps_back_to_input_order() {
        let json = serde_json::json!([
            {"index": 2, "score": 0.9},
            {"index": 0, "score": 0.1},
            {"index": 1, "score": 0.5}
        ]);
        assert_eq!(parse_rerank_response(&json, 3).unwrap(), vec![0.1, 0.5, 0.9]);
    }

    #[test]
    fn test_parse_missing_score_is_error() {
        let json = serde_json::json!([{"index": 0, "score": 0.3}]);
        assert!(parse_rerank_response(&json, 2).is_err());
    }

    #[test]
    fn test_parse_out_of_range_is_error() {
        let json = serde_json::json!([{"index": 5, "score": 0.3}]);
        assert!(parse_rerank_response(&json, 1).is_err());
    }

    #[test]
    fn test_disabled_is_none() {
        assert!(create_reranker(&RerankerConfig::default()).unwrap().is_none());
    }
}
