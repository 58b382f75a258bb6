//! Embedding providers: a local candle model, an HTTP client and a fake for tests.

pub mod device;
pub mod fake;
pub mod http;
pub mod model;
pub mod pool;
pub mod tokenize;

use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use reposcope_core::config::{EmbeddingProvider, EmbeddingSettings};
use reposcope_core::traits::Embedder;

pub use fake::FakeEmbedder;
pub use http::HttpEmbedder;
pub use model::ModelEmbedder;
pub use pool::masked_mean_l2;

pub fn use_fake_embeddings() -> bool {
    std::env::var("APP_USE_FAKE_EMBEDDINGS")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Dimension of the fake embedder when `embedding.dim` is unset.
pub const FAKE_DIM: usize = 384;

/// Builds the configured embedder. `APP_USE_FAKE_EMBEDDINGS=1` forces the fake one.
pub fn embedder_from_settings(settings: &EmbeddingSettings) -> Result<Arc<dyn Embedder>> {
    if use_fake_embeddings() || settings.provider == EmbeddingProvider::Fake {
        let dim = settings.dim.unwrap_or(FAKE_DIM);
        info!(dim, "using fake embedder");
        return Ok(Arc::new(FakeEmbedder::new(dim)));
    }
    match settings.provider {
        EmbeddingProvider::Local => {
            let dir = model::resolve_model_dir(settings.model_dir.as_deref())?;
            Ok(Arc::new(ModelEmbedder::load(&dir)?))
        }
        EmbeddingProvider::Http => {
            let endpoint = settings.endpoint.as_deref().ok_or_else(|| anyhow!("embedding.endpoint is required"))?;
            let model = settings.model.as_deref().ok_or_else(|| anyhow!("embedding.model is required"))?;
            let dim = settings.dim.ok_or_else(|| anyhow!("embedding.dim is required for the http provider"))?;
            let api_key = settings.api_key_env.as_deref().and_then(|var| std::env::var(var).ok());
            Ok(Arc::new(HttpEmbedder::new(endpoint, model, api_key, dim, Duration::from_secs(60))?))
        }
        EmbeddingProvider::Fake => Ok(Arc::new(FakeEmbedder::new(settings.dim.unwrap_or(FAKE_DIM)))),
    }
}
