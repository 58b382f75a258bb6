//! OpenAI-compatible `/v1/embeddings` client.

use anyhow::{anyhow, Result};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use reposcope_core::error::ProviderError;
use reposcope_core::traits::Embedder;

use crate::pool::l2_normalize;

/// Inputs longer than this are cut before sending.
pub const MAX_INPUT_CHARS: usize = 8000;

pub struct HttpEmbedder {
    client: Client,
    url: String,
    model: String,
    api_key: Option<String>,
    dim: usize,
    id: String,
}

impl HttpEmbedder {
    pub fn new(endpoint: &str, model: &str, api_key: Option<String>, dim: usize, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        let url = format!("{}/v1/embeddings", endpoint.trim_end_matches('/'));
        Ok(Self { client, url, model: model.to_string(), api_key, dim, id: format!("http:{model}:d{dim}") })
    }
}

impl Embedder for HttpEmbedder {
    fn id(&self) -> &str {
        &self.id
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let input: Vec<String> = texts.iter().map(|t| prepare_input(t)).collect();
        let body = serde_json::json!({ "model": self.model, "input": input });
        let mut req = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let res = req.send().map_err(|e| ProviderError::Unavailable(e.to_string()))?;
        let status = res.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = res
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<f64>().ok())
                .map(Duration::from_secs_f64);
            return Err(ProviderError::Throttled { retry_after }.into());
        }
        if !status.is_success() {
            let text = res.text().unwrap_or_default();
            return Err(ProviderError::Unavailable(format!("HTTP {status}: {text}")).into());
        }
        let json: Value = res.json().map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        let vectors = parse_embedding_response(json, texts.len())?;
        debug!(count = vectors.len(), "http embeddings received");
        Ok(vectors)
    }
}

fn prepare_input(text: &str) -> String {
    if text.trim().is_empty() {
        return " ".to_string();
    }
    text.chars().take(MAX_INPUT_CHARS).collect()
}

fn parse_embedding_response(json: Value, expected: usize) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|v| v.as_array())
        .ok_or_else(|| ProviderError::InvalidResponse("missing data array".into()))?;

    let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
    for (fallback_index, item) in data.iter().enumerate() {
        let index = item.get("index").and_then(|v| v.as_u64()).map(|v| v as usize).unwrap_or(fallback_index);
        let embedding = item
            .get("embedding")
            .and_then(|v| v.as_array())
            .ok_or_else(|| ProviderError::InvalidResponse("item missing embedding array".into()))?;
        let mut vec = embedding
            .iter()
            .map(|v| v.as_f64().map(|n| n as f32))
            .collect::<Option<Vec<f32>>>()
            .ok_or_else(|| ProviderError::InvalidResponse("embedding value must be numeric".into()))?;
        l2_normalize(&mut vec);
        indexed.push((index, vec));
    }
    if indexed.len() != expected {
        return Err(anyhow!(ProviderError::InvalidResponse(format!(
            "expected {expected} embeddings, got {}",
            indexed.len()
        ))));
    }
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, vec)| vec).collect())
}
