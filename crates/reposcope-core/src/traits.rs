use std::path::Path;

use crate::error::Result;
use crate::types::SourceDocument;

/// Embedding provider. Best-effort: callers retry and degrade on failure.
pub trait Embedder: Send + Sync {
    /// Stable identifier for the provider/model (e.g. `fake:d384`). Vectors from
    /// different ids are never mixed in one index.
    fn id(&self) -> &str;
    /// Embedding dimensionality.
    fn dim(&self) -> usize;
    /// Compute L2-normalized embeddings for a batch of input texts.
    fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;
}

/// Cross-attention relevance model scoring `(question, passage)` pairs.
pub trait RelevanceScorer: Send + Sync {
    /// Relevance in `[0, 1]`.
    fn score(&self, question: &str, passage: &str) -> anyhow::Result<f32>;

    fn score_batch(&self, question: &str, passages: &[String]) -> anyhow::Result<Vec<f32>> {
        passages.iter().map(|p| self.score(question, p)).collect()
    }
}

/// Source of truth for corpus content and therefore for the fingerprint.
pub trait CorpusProvider: Send + Sync {
    fn documents(&self) -> Result<Vec<SourceDocument>>;

    /// Local directory backing the corpus, when there is one. The literal
    /// engine scans it directly.
    fn root(&self) -> Option<&Path> {
        None
    }

    fn describe(&self) -> String;
}
