//! Cross-encoder relevance scoring over an HTTP `/v1/rerank` endpoint.

use anyhow::Result;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;

use reposcope_core::config::RerankerSettings;
use reposcope_core::error::ProviderError;
use reposcope_core::traits::RelevanceScorer;

pub struct HttpRelevanceScorer {
    client: Client,
    url: String,
    model: String,
}

impl HttpRelevanceScorer {
    pub fn new(endpoint: &str, model: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        let url = format!("{}/v1/rerank", endpoint.trim_end_matches('/'));
        Ok(Self { client, url, model: model.to_string() })
    }

    /// `None` when no endpoint is configured.
    pub fn from_settings(settings: &RerankerSettings) -> Result<Option<Self>> {
        let Some(endpoint) = settings.endpoint.as_deref() else { return Ok(None) };
        let model = settings.model.as_deref().unwrap_or("bge-reranker-v2-m3");
        Ok(Some(Self::new(endpoint, model, Duration::from_secs(settings.timeout_secs.max(1)))?))
    }
}

impl RelevanceScorer for HttpRelevanceScorer {
    fn score(&self, question: &str, passage: &str) -> Result<f32> {
        Ok(self.score_batch(question, &[passage.to_string()])?.first().copied().unwrap_or(0.0))
    }

    fn score_batch(&self, question: &str, passages: &[String]) -> Result<Vec<f32>> {
        if passages.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({ "model": self.model, "query": question, "documents": passages });
        let res = self.client.post(&self.url).json(&body).send().map_err(|e| ProviderError::Unavailable(e.to_string()))?;
        let status = res.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::Throttled { retry_after: None }.into());
        }
        if !status.is_success() {
            return Err(ProviderError::Unavailable(format!("HTTP {status}")).into());
        }
        let json: Value = res.json().map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        Ok(parse_rerank_response(&json, passages.len())?.into_iter().map(sigmoid).collect())
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn parse_rerank_response(json: &Value, doc_count: usize) -> Result<Vec<f32>, ProviderError> {
    let results = json
        .get("results")
        .or_else(|| json.get("data"))
        .and_then(|v| v.as_array())
        .ok_or_else(|| ProviderError::InvalidResponse("missing results array".into()))?;

    // Passages the service leaves out score as strongly irrelevant.
    let mut scores = vec![f32::NEG_INFINITY; doc_count];
    for item in results {
        let index = item
            .get("index")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| ProviderError::InvalidResponse("result missing index".into()))? as usize;
        let score = item
            .get("relevance_score")
            .or_else(|| item.get("score"))
            .and_then(|v| v.as_f64())
            .ok_or_else(|| ProviderError::InvalidResponse("result missing score".into()))? as f32;
        if index < scores.len() {
            scores[index] = score;
        }
    }
    Ok(scores)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligns_scores_by_index() {
        let json = serde_json::json!({
            "results": [
                { "index": 1, "relevance_score": 0.0 },
                { "index": 0, "relevance_score": 4.0 }
            ]
        });
        let scores: Vec<f32> = parse_rerank_response(&json, 3).unwrap().into_iter().map(sigmoid).collect();
        assert!(scores[0] > 0.98);
        assert_eq!(scores[1], 0.5);
        assert_eq!(scores[2], 0.0);
    }

    #[test]
    fn missing_results_is_invalid() {
        let err = parse_rerank_response(&serde_json::json!({ "oops": [] }), 1).unwrap_err();
        assert!(matches!(err, ProviderError::InvalidResponse(_)));
    }
}
