//! The retrieval pipeline: corpus preparation and hybrid query execution.

use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use reposcope_core::chunking::{Chunker, ChunkingConfig};
use reposcope_core::config::Settings;
use reposcope_core::error::{Degradation, Error, Result};
use reposcope_core::traits::{CorpusProvider, Embedder, RelevanceScorer};
use reposcope_core::types::{CorpusFingerprint, EngineSource, FusedCandidate, RankedContext, SearchResult, SourceDocument};
use reposcope_literal::{seeds_from_question, LiteralEngine};
use reposcope_text::TextIndex;
use reposcope_vector::{EmbedOptions, VectorIndex};

use crate::cache::{text_dir, vector_dir, IndexCache, IndexHandles, IndexKey, Manifest, StagedIndex};
use crate::fusion::{fuse, FusionConfig};
use crate::rerank::{RelevanceFilter, RerankConfig, TargetedFile};
use crate::targets::resolve_targets;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub chunking: ChunkingConfig,
    /// Results requested from each engine.
    pub top_k: usize,
    pub engine_timeout: Duration,
    pub fusion: FusionConfig,
    pub rerank: RerankConfig,
    pub embed: EmbedOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for EngineConfig {
    fn from(s: &Settings) -> Self {
        Self {
            chunking: ChunkingConfig::from(&s.chunking),
            top_k: s.search.top_k,
            engine_timeout: Duration::from_millis(s.search.engine_timeout_ms),
            fusion: FusionConfig { k: s.search.rrf_k, max_candidates: s.search.max_candidates },
            rerank: RerankConfig::from(&s.rerank),
            embed: EmbedOptions::from(&s.embedding),
        }
    }
}

/// A corpus version with its indexes open and ready to query.
pub struct PreparedCorpus {
    pub fingerprint: CorpusFingerprint,
    pub documents: Arc<Vec<SourceDocument>>,
    pub root: Option<PathBuf>,
    pub handles: IndexHandles,
    /// Whether the indexes were loaded rather than built by this call.
    pub cache_hit: bool,
    /// Absorbed build problems, repeated on every query against this corpus.
    pub degradations: Vec<Degradation>,
}

impl PreparedCorpus {
    pub fn chunk_count(&self) -> usize {
        self.handles.chunks.len()
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub question: String,
    /// Literal search seeds. Derived from the question when empty.
    pub keywords: Vec<String>,
    /// Paths to include in full, resolved leniently against the corpus.
    pub targeted_files: Vec<String>,
}

impl QueryRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self { question: question.into(), ..Self::default() }
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_targeted_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.targeted_files = files.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryOutcome {
    pub fingerprint: CorpusFingerprint,
    pub context: RankedContext,
    pub fused: Vec<FusedCandidate>,
    pub degradations: Vec<Degradation>,
}

impl QueryOutcome {
    pub fn is_degraded(&self) -> bool {
        !self.degradations.is_empty()
    }
}

pub struct RetrievalEngine {
    config: EngineConfig,
    embedder: Arc<dyn Embedder>,
    filter: RelevanceFilter,
    cache: Arc<IndexCache>,
    literal: LiteralEngine,
    builds: AtomicUsize,
}

impl RetrievalEngine {
    pub fn new(
        config: EngineConfig,
        embedder: Arc<dyn Embedder>,
        scorer: Option<Arc<dyn RelevanceScorer>>,
        cache: Arc<IndexCache>,
    ) -> Self {
        let filter = RelevanceFilter::new(scorer, config.rerank.clone());
        let literal = LiteralEngine::new(config.top_k);
        Self { config, embedder, filter, cache, literal, builds: AtomicUsize::new(0) }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &IndexCache {
        &self.cache
    }

    /// Number of index builds this engine has started.
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    fn index_key(&self) -> IndexKey {
        IndexKey {
            embedder_id: self.embedder.id().to_string(),
            dim: self.embedder.dim(),
            chunking: self.config.chunking,
        }
    }

    /// Reads the corpus and opens its indexes, building them when the cache
    /// has no usable entry. `rebuild` skips the cache read but still
    /// publishes the result. At most one build per fingerprint runs at a time;
    /// late callers wait and load what the first one published.
    pub async fn prepare(&self, corpus: &dyn CorpusProvider, rebuild: bool) -> Result<PreparedCorpus> {
        let documents = corpus.documents()?;
        let fingerprint = CorpusFingerprint::compute(&documents);
        let root = corpus.root().map(|p| p.to_path_buf());
        info!(fingerprint = %fingerprint.short(), corpus = %corpus.describe(), files = documents.len(), "preparing corpus");

        let key = self.index_key();
        let retry = self.config.embed.retry.clone();
        let mut cached = None;
        if !rebuild {
            cached = self.cache.load(&fingerprint, &key, self.embedder.clone(), retry.clone()).await;
        }
        let (handles, cache_hit) = match cached {
            Some(handles) => (handles, true),
            None => {
                let _permit = self.cache.build_lock(&fingerprint).await;
                let waited = if rebuild {
                    None
                } else {
                    self.cache.load(&fingerprint, &key, self.embedder.clone(), retry.clone()).await
                };
                match waited {
                    Some(handles) => (handles, true),
                    None => (self.build(&fingerprint, &key, &documents).await?, false),
                }
            }
        };

        let degradations = build_degradations(&handles.manifest);
        for d in &degradations {
            warn!(fingerprint = %fingerprint.short(), detail = %d.detail, "index degraded");
        }
        Ok(PreparedCorpus { fingerprint, documents: Arc::new(documents), root, handles, cache_hit, degradations })
    }

    async fn build(&self, fingerprint: &CorpusFingerprint, key: &IndexKey, documents: &[SourceDocument]) -> Result<IndexHandles> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        let fail = |reason: String| Error::IndexBuildFailure { fingerprint: fingerprint.to_string(), reason };

        let chunks = Chunker::new(self.config.chunking).chunk(documents);
        info!(fingerprint = %fingerprint.short(), chunks = chunks.len(), "building indexes");
        let staging = self.cache.staging_dir(fingerprint).map_err(|e| fail(format!("{e:#}")))?;

        let embeddings = self.cache.embedding_cache().await.map_err(|e| fail(format!("opening embedding cache: {e:#}")))?;
        let text_chunks = chunks.clone();
        let text_path = text_dir(&staging);
        let text_task = tokio::task::spawn_blocking(move || TextIndex::build(&text_path, &text_chunks));
        let vector_path = vector_dir(&staging);
        let vector_task =
            VectorIndex::build(&vector_path, &chunks, self.embedder.clone(), &embeddings, self.config.embed.clone());
        let (text, vector) = tokio::join!(text_task, vector_task);

        let built = match (text, vector) {
            (Ok(Ok(_)), Ok((_, report))) => Ok(report),
            (Err(e), _) => Err(format!("text index task: {e}")),
            (Ok(Err(e)), _) => Err(format!("text index: {e:#}")),
            (_, Err(e)) => Err(format!("vector index: {e:#}")),
        };
        let report = match built {
            Ok(report) => report,
            Err(reason) => {
                if let Err(e) = std::fs::remove_dir_all(&staging) {
                    debug!(dir = %staging.display(), error = %e, "staging cleanup failed");
                }
                return Err(fail(reason));
            }
        };

        let manifest = Manifest::new(fingerprint.clone(), key, chunks.len(), report);
        self.cache.store(fingerprint, StagedIndex { dir: staging, chunks, manifest }).map_err(|e| fail(format!("{e:#}")))?;
        let handles = self
            .cache
            .load(fingerprint, key, self.embedder.clone(), self.config.embed.retry.clone())
            .await
            .ok_or_else(|| fail("published index could not be opened".to_string()))?;
        info!(
            fingerprint = %fingerprint.short(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            embedded = handles.manifest.vector_report.embedded,
            reused = handles.manifest.vector_report.reused,
            "indexes built"
        );
        Ok(handles)
    }

    /// Runs the three engines concurrently, fuses their rankings and filters
    /// the result into a context. Engine and relevance-model failures degrade
    /// the outcome; only an empty fusion with no targeted file fails it.
    pub async fn query(&self, prepared: &PreparedCorpus, request: &QueryRequest) -> Result<QueryOutcome> {
        let fp = prepared.fingerprint.short().to_string();
        let k = self.config.top_k;
        let timeout = self.config.engine_timeout;

        let vector = prepared.handles.vector.clone();
        let question = request.question.clone();
        let vector_search = async move { vector.query(&question, k).await };

        let text = prepared.handles.text.clone();
        let terms: Vec<String> = std::iter::once(request.question.clone()).chain(request.keywords.iter().cloned()).collect();
        let text_search = blocking(move || text.query(&terms, k));

        let patterns = if request.keywords.is_empty() { seeds_from_question(&request.question) } else { request.keywords.clone() };
        let literal = self.literal.clone();
        let chunks = prepared.handles.chunks.clone();
        let root = prepared.root.clone();
        let documents = prepared.documents.clone();
        let literal_search = blocking(move || {
            Ok(match root {
                Some(root) => literal.search(&patterns, &root, &chunks),
                None => literal.search_documents(&patterns, &documents, &chunks),
            })
        });

        let (v, t, l) = tokio::join!(
            run_engine(EngineSource::Vector, timeout, vector_search),
            run_engine(EngineSource::Statistical, timeout, text_search),
            run_engine(EngineSource::Literal, timeout, literal_search),
        );

        let mut degradations = prepared.degradations.clone();
        let mut lists = Vec::with_capacity(3);
        for outcome in [v, t, l] {
            match outcome {
                Ok(list) => lists.push(list),
                Err(e) => {
                    warn!(fingerprint = %fp, error = %e, "engine contributed no results");
                    degradations.extend(e.degradation());
                    lists.push(Vec::new());
                }
            }
        }

        let fused = fuse(&lists, &self.config.fusion);
        let targeted: Vec<TargetedFile> = resolve_targets(&request.targeted_files, &prepared.documents)
            .into_iter()
            .map(|d| TargetedFile { file_path: d.file_path.clone(), content: d.content.clone() })
            .collect();
        debug!(fingerprint = %fp, fused = fused.len(), targeted = targeted.len(), "fusion done");
        if fused.is_empty() && targeted.is_empty() {
            return Err(Error::NoCandidates);
        }

        let filter = self.filter.clone();
        let question = request.question.clone();
        let candidates = fused.clone();
        let chunks = prepared.handles.chunks.clone();
        let rerank_targets = targeted.clone();
        let reranked =
            tokio::task::spawn_blocking(move || filter.filter(&question, &candidates, &chunks, &rerank_targets)).await;
        let (context, rerank_error) = match reranked {
            Ok(result) => result,
            Err(e) => {
                let fallback = RelevanceFilter::new(None, self.config.rerank.clone());
                let (mut context, _) = fallback.filter(&request.question, &fused, &prepared.handles.chunks, &targeted);
                context.degraded = true;
                (context, Some(Error::RerankUnavailable(format!("relevance task: {e}"))))
            }
        };
        if let Some(e) = rerank_error {
            warn!(fingerprint = %fp, error = %e, "relevance filter degraded");
            degradations.extend(e.degradation());
        }

        info!(
            fingerprint = %fp,
            candidates = fused.len(),
            items = context.len(),
            chars = context.total_chars,
            degraded = !degradations.is_empty(),
            "query answered"
        );
        Ok(QueryOutcome { fingerprint: prepared.fingerprint.clone(), context, fused, degradations })
    }
}

fn build_degradations(manifest: &Manifest) -> Vec<Degradation> {
    let report = &manifest.vector_report;
    if report.skipped == 0 {
        return Vec::new();
    }
    let err = Error::IndexBuildFailure {
        fingerprint: manifest.fingerprint.to_string(),
        reason: format!("{} of {} chunks have no embedding", report.skipped, manifest.chunk_count),
    };
    err.degradation().into_iter().collect()
}

async fn blocking<F>(f: F) -> anyhow::Result<Vec<SearchResult>>
where
    F: FnOnce() -> anyhow::Result<Vec<SearchResult>> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

async fn run_engine<F>(engine: EngineSource, timeout: Duration, search: F) -> Result<Vec<SearchResult>>
where
    F: Future<Output = anyhow::Result<Vec<SearchResult>>>,
{
    let started = Instant::now();
    let outcome = tokio::time::timeout(timeout, search).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;
    match outcome {
        Ok(Ok(results)) => {
            debug!(%engine, hits = results.len(), elapsed_ms, "engine finished");
            Ok(results)
        }
        Ok(Err(e)) => Err(Error::EngineFailure { engine, reason: format!("{e:#}") }),
        Err(_) => Err(Error::EngineTimeout { engine, timeout_ms: timeout.as_millis() as u64 }),
    }
}
