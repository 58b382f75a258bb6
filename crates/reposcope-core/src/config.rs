//! Configuration loader, typed settings and path helpers.
//!
//! Uses Figment to merge `config.toml` + `config.<env>.toml` + `APP_*` env vars.
//! Nested keys in the environment use `__` (`APP_SEARCH__RRF_K=30`).

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

use crate::error::{Error, Result};

pub struct Config {
    figment: Figment,
    env_name: String,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let env_name = env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string());

        let mut figment = Figment::from(Serialized::defaults(Settings::default())).merge(Toml::file("config.toml"));
        match env_name.as_str() {
            "dev" | "development" => figment = figment.merge(Toml::file("config.dev.toml")),
            "prod" | "production" => figment = figment.merge(Toml::file("config.prod.toml")),
            "test" | "testing" => figment = figment.merge(Toml::file("config.test.toml")),
            _ => {}
        }
        figment = figment.merge(Env::prefixed("APP_").split("__"));

        let config = Self { figment, env_name };
        config.validate_for_env()?;
        Ok(config)
    }

    pub fn get<T>(&self, key: &str) -> anyhow::Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.figment
            .extract_inner(key)
            .map_err(|e| anyhow::anyhow!("Failed to get '{}': {}", key, e))
    }

    pub fn settings(&self) -> Result<Settings> {
        let settings: Settings =
            self.figment.extract().map_err(|e| Error::InvalidConfig(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn env_name(&self) -> &str {
        &self.env_name
    }

    fn validate_for_env(&self) -> anyhow::Result<()> {
        if let "prod" | "production" = self.env_name.as_str() {
            let provider: String = self.get("embedding.provider").unwrap_or_default();
            if provider == "fake" {
                anyhow::bail!("embedding.provider = \"fake\" is not allowed in production");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub chunking: ChunkingSettings,
    pub search: SearchSettings,
    pub rerank: RerankSettings,
    pub embedding: EmbeddingSettings,
    pub reranker: RerankerSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingSettings {
    pub max_chars: usize,
    pub overlap: f32,
    pub max_file_bytes: u64,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self { max_chars: 2000, overlap: 0.2, max_file_bytes: 1024 * 1024 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    /// Results requested from each engine.
    pub top_k: usize,
    pub engine_timeout_ms: u64,
    /// RRF damping constant.
    pub rrf_k: f64,
    pub max_candidates: usize,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self { top_k: 20, engine_timeout_ms: 10_000, rrf_k: 60.0, max_candidates: 30 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankSettings {
    pub min_relevance: f32,
    pub max_context_chars: usize,
    pub max_file_chars: usize,
    pub max_passage_chars: usize,
}

impl Default for RerankSettings {
    fn default() -> Self {
        Self { min_relevance: 0.2, max_context_chars: 24_000, max_file_chars: 100_000, max_passage_chars: 1000 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    Fake,
    Local,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    pub provider: EmbeddingProvider,
    /// Vector dimension. The fake embedder falls back to 384 and the local
    /// model reads it from its config; the http provider must set it.
    pub dim: Option<usize>,
    pub model_dir: Option<String>,
    pub endpoint: Option<String>,
    pub model: Option<String>,
    /// Name of the environment variable holding the HTTP provider's API key.
    pub api_key_env: Option<String>,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Minimum spacing between embedding calls. 0 turns pacing off and
    /// leaves throttling to the provider's 429 responses.
    pub min_batch_interval_ms: u64,
    pub ann_min_rows: usize,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Fake,
            dim: None,
            model_dir: None,
            endpoint: None,
            model: None,
            api_key_env: None,
            batch_size: 100,
            max_attempts: 4,
            initial_backoff_ms: 250,
            max_backoff_ms: 8000,
            min_batch_interval_ms: 0,
            ann_min_rows: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankerSettings {
    /// Base URL of a `/v1/rerank` service. Without one no relevance model is used.
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub timeout_secs: u64,
}

impl Default for RerankerSettings {
    fn default() -> Self {
        Self { endpoint: None, model: None, timeout_secs: 30 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub root: String,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self { root: "~/.cache/reposcope".to_string() }
    }
}

impl CacheSettings {
    pub fn root_path(&self) -> PathBuf {
        expand_path(&self.root)
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(Error::InvalidConfig(msg.to_string()));
        if !(self.search.rrf_k > 0.0) {
            return invalid("search.rrf_k must be > 0");
        }
        if self.chunking.max_chars == 0 {
            return invalid("chunking.max_chars must be > 0");
        }
        if !(0.0..=0.9).contains(&self.chunking.overlap) {
            return invalid("chunking.overlap must be within [0, 0.9]");
        }
        if self.embedding.batch_size == 0 {
            return invalid("embedding.batch_size must be > 0");
        }
        if self.embedding.max_attempts == 0 {
            return invalid("embedding.max_attempts must be > 0");
        }
        if self.embedding.dim == Some(0) {
            return invalid("embedding.dim must be > 0");
        }
        if self.embedding.provider == EmbeddingProvider::Http && self.embedding.dim.is_none() {
            return invalid("embedding.dim is required for the http provider");
        }
        Ok(())
    }
}

/// Expand a user-provided path string:
/// - Expands leading '~' to the user's home directory
/// - Expands ${VAR} and $VAR environment variables
/// - Returns a PathBuf without attempting to canonicalize
pub fn expand_path<S: AsRef<str>>(input: S) -> PathBuf {
    let s = input.as_ref();
    let expanded_env = shellexpand::env(s).unwrap_or(std::borrow::Cow::Borrowed(s));
    let expanded = shellexpand::tilde(&expanded_env);
    PathBuf::from(expanded.as_ref())
}
