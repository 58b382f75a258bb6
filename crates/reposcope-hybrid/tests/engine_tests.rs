use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reposcope_core::corpus::MemoryCorpus;
use reposcope_core::error::{DegradationKind, Error, ProviderError};
use reposcope_core::traits::{Embedder, RelevanceScorer};
use reposcope_core::types::{ContextOrigin, EngineSource, SourceDocument};
use reposcope_embed::FakeEmbedder;
use reposcope_hybrid::{EngineConfig, IndexCache, QueryRequest, RetrievalEngine};
use reposcope_vector::RetryPolicy;

const AUTH: &str = "import jwt\n\n\ndef validate_jwt(token):\n    return jwt.decode(token, SECRET_KEY, algorithms=[\"HS256\"])\n";
const CONFIG: &str = "SECRET_KEY = \"change-me\"\nDEBUG = False\nDATABASE_URL = \"sqlite:///app.db\"\n";

fn corpus() -> MemoryCorpus {
    MemoryCorpus::new(vec![
        SourceDocument::new("app/auth.py", AUTH),
        SourceDocument::new("app/config.py", CONFIG),
        SourceDocument::new("app/db.py", "def connect(url):\n    return pool.open(url)\n"),
        SourceDocument::new("README.md", "# Demo\n\nA tiny web service.\n"),
    ])
}

fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.embed.retry = RetryPolicy {
        max_attempts: 2,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(2),
    };
    config
}

fn new_engine(cache_root: &std::path::Path, embedder: Arc<dyn Embedder>, scorer: Option<Arc<dyn RelevanceScorer>>) -> RetrievalEngine {
    RetrievalEngine::new(config(), embedder, scorer, Arc::new(IndexCache::new(cache_root)))
}

fn fake(dim: usize) -> Arc<dyn Embedder> {
    Arc::new(FakeEmbedder::new(dim))
}

/// Chunk texts carry a `File:` header; anything else is a query.
fn is_query(texts: &[String]) -> bool {
    texts.iter().all(|t| !t.starts_with("File: "))
}

/// Wraps the fake embedder to count indexed texts and misbehave on queries.
struct Scripted {
    inner: FakeEmbedder,
    indexed: AtomicUsize,
    query_delay: Option<Duration>,
    fail_queries: bool,
}

impl Scripted {
    fn new() -> Self {
        Self { inner: FakeEmbedder::new(64), indexed: AtomicUsize::new(0), query_delay: None, fail_queries: false }
    }
}

impl Embedder for Scripted {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn dim(&self) -> usize {
        self.inner.dim()
    }

    fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        if is_query(texts) {
            if let Some(d) = self.query_delay {
                std::thread::sleep(d);
            }
            if self.fail_queries {
                return Err(ProviderError::Unavailable("embedding service down".into()).into());
            }
        } else {
            self.indexed.fetch_add(texts.len(), Ordering::SeqCst);
        }
        self.inner.embed_batch(texts)
    }
}

/// Scores passages mentioning JWT as relevant and everything else as noise.
struct KeywordScorer;

impl RelevanceScorer for KeywordScorer {
    fn score(&self, _question: &str, passage: &str) -> anyhow::Result<f32> {
        Ok(if passage.to_lowercase().contains("jwt") { 0.9 } else { 0.05 })
    }
}

struct DownScorer;

impl RelevanceScorer for DownScorer {
    fn score(&self, _question: &str, _passage: &str) -> anyhow::Result<f32> {
        Err(ProviderError::Unavailable("connection refused".into()).into())
    }
}

fn files(outcome: &reposcope_hybrid::QueryOutcome) -> Vec<&str> {
    outcome.context.items.iter().map(|i| i.chunk.file_path.as_str()).collect()
}

fn assert_auth_above_config(outcome: &reposcope_hybrid::QueryOutcome) {
    let files = files(outcome);
    let auth = files.iter().position(|f| *f == "app/auth.py").expect("auth chunk in context");
    for (i, f) in files.iter().enumerate() {
        if *f == "app/config.py" {
            assert!(auth < i, "config.py ranked above auth.py: {files:?}");
        }
    }
}

#[tokio::test]
async fn jwt_question_ranks_validator_above_config() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = new_engine(tmp.path(), fake(64), Some(Arc::new(KeywordScorer)));
    let prepared = engine.prepare(&corpus(), false).await.unwrap();
    assert!(!prepared.cache_hit);
    assert_eq!(prepared.chunk_count(), 4);

    let outcome = engine.query(&prepared, &QueryRequest::new("how is JWT validated")).await.unwrap();
    assert_auth_above_config(&outcome);
    assert!(outcome.degradations.is_empty());
    assert!(!outcome.context.degraded);
    assert_eq!(outcome.context.items[0].chunk.file_path, "app/auth.py");
    let top = &outcome.fused[0];
    assert!(top.contributing_engines.contains(&EngineSource::Statistical));
    assert!(top.contributing_engines.contains(&EngineSource::Literal));
}

#[tokio::test]
async fn without_a_scorer_fused_order_is_kept() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = new_engine(tmp.path(), fake(64), None);
    let prepared = engine.prepare(&corpus(), false).await.unwrap();
    let outcome = engine.query(&prepared, &QueryRequest::new("how is JWT validated")).await.unwrap();

    assert_auth_above_config(&outcome);
    assert!(!outcome.context.degraded);
    let ids: Vec<&str> = outcome.context.items.iter().map(|i| i.chunk.chunk_id.as_str()).collect();
    let fused: Vec<&str> = outcome.fused.iter().map(|c| c.chunk_id.as_str()).collect();
    assert_eq!(ids, fused);
    assert_eq!(outcome.context.items[0].relevance, 1.0);
}

#[tokio::test]
async fn failing_scorer_degrades_to_fused_order() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = new_engine(tmp.path(), fake(64), Some(Arc::new(DownScorer)));
    let prepared = engine.prepare(&corpus(), false).await.unwrap();
    let outcome = engine.query(&prepared, &QueryRequest::new("how is JWT validated")).await.unwrap();

    assert!(outcome.context.degraded);
    assert!(outcome.degradations.iter().any(|d| d.kind == DegradationKind::RerankUnavailable));
    let ids: Vec<&str> = outcome.context.items.iter().map(|i| i.chunk.chunk_id.as_str()).collect();
    let fused: Vec<&str> = outcome.fused.iter().map(|c| c.chunk_id.as_str()).collect();
    assert_eq!(ids, fused);
}

#[tokio::test]
async fn fused_ranking_is_deterministic() {
    let tmp_a = tempfile::tempdir().unwrap();
    let tmp_b = tempfile::tempdir().unwrap();
    let request = QueryRequest::new("where is the database connection opened").with_keywords(["connect"]);

    let a = new_engine(tmp_a.path(), fake(64), None);
    let pa = a.prepare(&corpus(), false).await.unwrap();
    let first = a.query(&pa, &request).await.unwrap();
    let again = a.query(&pa, &request).await.unwrap();

    let b = new_engine(tmp_b.path(), fake(64), None);
    let pb = b.prepare(&corpus(), false).await.unwrap();
    let other = b.query(&pb, &request).await.unwrap();

    assert_eq!(pa.fingerprint, pb.fingerprint);
    for o in [&again, &other] {
        assert_eq!(serde_json::to_string(&first.fused).unwrap(), serde_json::to_string(&o.fused).unwrap());
    }
    assert_eq!(first.fused[0].chunk_id, pa.handles.chunks.for_file("app/db.py").next().unwrap().chunk_id);
}

#[tokio::test]
async fn cached_index_answers_like_a_fresh_build() {
    let tmp = tempfile::tempdir().unwrap();
    let request = QueryRequest::new("how is JWT validated");

    let builder = new_engine(tmp.path(), fake(64), None);
    let built = builder.prepare(&corpus(), false).await.unwrap();
    let fresh = builder.query(&built, &request).await.unwrap();
    assert_eq!(builder.builds(), 1);

    let reader = new_engine(tmp.path(), fake(64), None);
    let loaded = reader.prepare(&corpus(), false).await.unwrap();
    assert!(loaded.cache_hit);
    assert_eq!(reader.builds(), 0);
    assert_eq!(loaded.fingerprint, built.fingerprint);

    let cached = reader.query(&loaded, &request).await.unwrap();
    assert_eq!(serde_json::to_string(&fresh.fused).unwrap(), serde_json::to_string(&cached.fused).unwrap());
    assert_eq!(files(&fresh), files(&cached));
}

#[tokio::test]
async fn embedder_change_invalidates_cached_index() {
    let tmp = tempfile::tempdir().unwrap();
    let first = new_engine(tmp.path(), fake(64), None);
    let fp = first.prepare(&corpus(), false).await.unwrap().fingerprint;

    let second = new_engine(tmp.path(), fake(32), None);
    let prepared = second.prepare(&corpus(), false).await.unwrap();
    assert!(!prepared.cache_hit);
    assert_eq!(second.builds(), 1);
    assert_eq!(prepared.fingerprint, fp);
    assert_eq!(prepared.handles.manifest.dim, 32);
}

#[tokio::test]
async fn rebuild_bypasses_cache_and_republishes() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = new_engine(tmp.path(), fake(64), None);
    engine.prepare(&corpus(), false).await.unwrap();
    let rebuilt = engine.prepare(&corpus(), true).await.unwrap();
    assert!(!rebuilt.cache_hit);
    assert_eq!(engine.builds(), 2);
    // unchanged chunks come back from the shared embedding cache
    assert_eq!(rebuilt.handles.manifest.vector_report.embedded, 0);
    assert_eq!(rebuilt.handles.manifest.vector_report.reused, 4);

    let loaded = engine.prepare(&corpus(), false).await.unwrap();
    assert!(loaded.cache_hit);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_prepares_build_once() {
    let tmp = tempfile::tempdir().unwrap();
    let scripted = Arc::new(Scripted::new());
    let engine = Arc::new(new_engine(tmp.path(), scripted.clone(), None));
    let corpus = corpus();

    let (a, b) = tokio::join!(engine.prepare(&corpus, false), engine.prepare(&corpus, false));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(engine.builds(), 1);
    assert_eq!(scripted.indexed.load(Ordering::SeqCst), a.chunk_count());
    assert!(a.cache_hit != b.cache_hit);
    assert_eq!(a.fingerprint, b.fingerprint);
}

#[tokio::test]
async fn slow_engine_times_out_without_failing_the_query() {
    let tmp = tempfile::tempdir().unwrap();
    let mut scripted = Scripted::new();
    scripted.query_delay = Some(Duration::from_millis(800));
    let mut config = config();
    config.engine_timeout = Duration::from_millis(100);
    let engine = RetrievalEngine::new(config, Arc::new(scripted), None, Arc::new(IndexCache::new(tmp.path())));

    let prepared = engine.prepare(&corpus(), false).await.unwrap();
    let outcome = engine.query(&prepared, &QueryRequest::new("how is JWT validated")).await.unwrap();

    assert!(outcome
        .degradations
        .iter()
        .any(|d| d.kind == DegradationKind::EngineTimeout && d.engine == Some(EngineSource::Vector)));
    assert!(!outcome.fused.is_empty());
    assert!(outcome.fused.iter().all(|c| !c.contributing_engines.contains(&EngineSource::Vector)));
    assert_eq!(outcome.context.items[0].chunk.file_path, "app/auth.py");
}

#[tokio::test]
async fn targeted_file_leads_the_context() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = new_engine(tmp.path(), fake(64), None);
    let prepared = engine.prepare(&corpus(), false).await.unwrap();
    let request = QueryRequest::new("how is JWT validated").with_targeted_files(["./config.py"]);
    let outcome = engine.query(&prepared, &request).await.unwrap();

    let first = &outcome.context.items[0];
    assert_eq!(first.origin, ContextOrigin::Targeted);
    assert_eq!(first.chunk.file_path, "app/config.py");
    assert_eq!(first.chunk.text, CONFIG);
    assert_eq!(first.relevance, 1.0);
    assert_eq!(files(&outcome).iter().filter(|f| **f == "app/config.py").count(), 1);
}

#[tokio::test]
async fn oversized_targeted_files_stay_within_the_context_budget() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = config();
    config.rerank.max_context_chars = 300;
    let engine = RetrievalEngine::new(config, fake(64), None, Arc::new(IndexCache::new(tmp.path())));
    let corpus = MemoryCorpus::new(vec![
        SourceDocument::new("gen/models.py", "FIELD = 'value'\n".repeat(200)),
        SourceDocument::new("gen/schema.py", "COLUMN = 'text'\n".repeat(200)),
        SourceDocument::new("app/auth.py", AUTH),
    ]);
    let prepared = engine.prepare(&corpus, false).await.unwrap();
    let request = QueryRequest::new("how is JWT validated").with_targeted_files(["gen/models.py", "gen/schema.py"]);
    let outcome = engine.query(&prepared, &request).await.unwrap();

    let used: usize = outcome.context.items.iter().map(|i| i.chunk.text.chars().count()).sum();
    assert_eq!(used, outcome.context.total_chars);
    assert!(outcome.context.total_chars <= 300, "context holds {} chars", outcome.context.total_chars);
    let first = &outcome.context.items[0];
    assert_eq!(first.chunk.file_path, "gen/models.py");
    assert!(first.chunk.text.ends_with("... [truncated]"));
    assert!(!files(&outcome).contains(&"gen/schema.py"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rebuild_alongside_readers_keeps_handles_usable() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = Arc::new(new_engine(tmp.path(), fake(64), None));
    let corpus = corpus();
    let request = QueryRequest::new("how is JWT validated");
    let before = engine.prepare(&corpus, false).await.unwrap();

    for round in 0..3 {
        let (rebuilt, loaded) = tokio::join!(engine.prepare(&corpus, true), engine.prepare(&corpus, false));
        let (rebuilt, loaded) = (rebuilt.unwrap(), loaded.unwrap());
        assert!(!rebuilt.cache_hit);
        assert!(loaded.cache_hit);
        let mut live = vec![&rebuilt, &loaded];
        if round == 0 {
            live.push(&before);
        }
        for prepared in live {
            let outcome = engine.query(prepared, &request).await.unwrap();
            assert!(outcome.degradations.is_empty(), "{:?}", outcome.degradations);
            assert_auth_above_config(&outcome);
        }
    }
    assert_eq!(engine.builds(), 4);
}

#[tokio::test]
async fn no_candidates_when_every_engine_comes_back_empty() {
    let tmp = tempfile::tempdir().unwrap();
    let mut scripted = Scripted::new();
    scripted.fail_queries = true;
    let engine = new_engine(tmp.path(), Arc::new(scripted), None);
    let prepared = engine.prepare(&corpus(), false).await.unwrap();

    let err = engine.query(&prepared, &QueryRequest::new("zzqx wvvk")).await.unwrap_err();
    assert!(matches!(err, Error::NoCandidates));
    assert!(err.is_fatal());

    // a targeted file alone is enough to answer
    let request = QueryRequest::new("zzqx wvvk").with_targeted_files(["README.md"]);
    let outcome = engine.query(&prepared, &request).await.unwrap();
    assert_eq!(files(&outcome), vec!["README.md"]);
    assert!(outcome.degradations.iter().any(|d| d.kind == DegradationKind::EngineFailure));
}

#[tokio::test]
async fn empty_corpus_is_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = new_engine(tmp.path(), fake(64), None);
    let err = engine.prepare(&MemoryCorpus::new(Vec::new()), false).await.err().unwrap();
    assert!(matches!(err, Error::CorpusUnreadable(_)));
    assert_eq!(engine.builds(), 0);
}
