use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reposcope_core::error::ProviderError;
use reposcope_core::traits::Embedder;
use reposcope_core::types::{Chunk, EngineSource};
use reposcope_embed::FakeEmbedder;
use reposcope_vector::{EmbedOptions, EmbeddingCache, RetryPolicy, VectorIndex};

fn fast_options() -> EmbedOptions {
    EmbedOptions {
        batch_size: 4,
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        },
        ..Default::default()
    }
}

fn corpus() -> Vec<Chunk> {
    vec![
        Chunk::new("auth.py", 1, 2, "def validate_jwt(token):\n    return decode_jwt(token)"),
        Chunk::new("config.py", 1, 2, "SECRET_KEY = 'x'\nDEBUG = False"),
        Chunk::new("db.py", 1, 2, "def connect(url):\n    return pool.open(url)"),
        Chunk::new("cli.py", 1, 1, "import argparse"),
        Chunk::new("README.md", 1, 1, "Project overview"),
    ]
}

/// Counts calls and texts; fails whenever a text contains `poison` or while
/// `fail_first` calls remain.
struct ScriptedEmbedder {
    inner: FakeEmbedder,
    calls: AtomicUsize,
    texts: AtomicUsize,
    fail_first: AtomicUsize,
    short_for: Option<&'static str>,
}

impl ScriptedEmbedder {
    fn new(fail_first: usize) -> Self {
        Self {
            inner: FakeEmbedder::new(64),
            calls: AtomicUsize::new(0),
            texts: AtomicUsize::new(0),
            fail_first: AtomicUsize::new(fail_first),
            short_for: None,
        }
    }
}

impl Embedder for ScriptedEmbedder {
    fn id(&self) -> &str {
        "scripted:d64"
    }

    fn dim(&self) -> usize {
        64
    }

    fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_first.load(Ordering::SeqCst) > 0 {
            self.fail_first.fetch_sub(1, Ordering::SeqCst);
            return Err(ProviderError::Throttled { retry_after: Some(Duration::from_millis(2)) }.into());
        }
        if texts.iter().any(|t| t.contains("poison")) {
            return Err(ProviderError::Unavailable("poisoned input".into()).into());
        }
        self.texts.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts
            .iter()
            .map(|t| match self.short_for {
                Some(marker) if t.contains(marker) => vec![0.5; 3],
                _ => self.inner.embed_text(t),
            })
            .collect())
    }
}

#[tokio::test]
async fn nearest_chunk_ranks_first() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let cache = EmbeddingCache::open(&tmp.path().join("embeddings")).await?;
    let embedder: Arc<dyn Embedder> = Arc::new(FakeEmbedder::new(256));
    let chunks = corpus();
    let (index, report) = VectorIndex::build(&tmp.path().join("vector"), &chunks, embedder, &cache, fast_options()).await?;
    assert_eq!(report.embedded, chunks.len());
    assert_eq!(report.skipped, 0);

    let hits = index.query("validate jwt token", 3).await?;
    assert_eq!(hits.len(), 3);
    assert_eq!(hits[0].chunk_id, chunks[0].chunk_id);
    assert!(hits.iter().all(|h| h.engine_source == EngineSource::Vector));
    assert!(hits.windows(2).all(|w| w[0].raw_score >= w[1].raw_score));
    assert_eq!(hits.iter().map(|h| h.rank).collect::<Vec<_>>(), vec![1, 2, 3]);
    Ok(())
}

#[tokio::test]
async fn throttling_is_retried() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let cache = EmbeddingCache::open(&tmp.path().join("embeddings")).await?;
    let scripted = Arc::new(ScriptedEmbedder::new(2));
    let (_, report) =
        VectorIndex::build(&tmp.path().join("vector"), &corpus(), scripted.clone(), &cache, fast_options()).await?;
    assert_eq!(report.embedded, 5);
    assert_eq!(report.skipped, 0);
    // two throttled attempts, then batches of 4 and 1
    assert_eq!(scripted.calls.load(Ordering::SeqCst), 4);
    Ok(())
}

#[tokio::test]
async fn failing_and_misshapen_items_are_excluded() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let cache = EmbeddingCache::open(&tmp.path().join("embeddings")).await?;
    let mut chunks = corpus();
    chunks.push(Chunk::new("bad.py", 1, 1, "poison pill"));
    chunks.push(Chunk::new("short.py", 1, 1, "tiny vector please"));
    let mut scripted = ScriptedEmbedder::new(0);
    scripted.short_for = Some("tiny vector");
    let scripted = Arc::new(scripted);

    let (index, report) = VectorIndex::build(&tmp.path().join("vector"), &chunks, scripted, &cache, fast_options()).await?;
    assert_eq!(report.embedded, 5);
    assert_eq!(report.skipped, 2);
    assert!(report.skipped_ids.contains(&chunks[5].chunk_id));
    assert!(report.skipped_ids.contains(&chunks[6].chunk_id));
    assert_eq!(index.len().await?, 5);
    Ok(())
}

#[tokio::test]
async fn shared_cache_avoids_reembedding() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let cache = EmbeddingCache::open(&tmp.path().join("embeddings")).await?;
    let scripted = Arc::new(ScriptedEmbedder::new(0));
    let chunks = corpus();

    let (first, r1) = VectorIndex::build(&tmp.path().join("v1"), &chunks, scripted.clone(), &cache, fast_options()).await?;
    assert_eq!(r1.embedded, 5);
    let before = first.query("database connect", 5).await?;
    let texts_after_first = scripted.texts.load(Ordering::SeqCst);

    let (second, r2) = VectorIndex::build(&tmp.path().join("v2"), &chunks, scripted.clone(), &cache, fast_options()).await?;
    assert_eq!((r2.embedded, r2.reused), (0, 5));
    assert_eq!(second.query("database connect", 5).await?, before);
    // only the query embedding was requested
    assert_eq!(scripted.texts.load(Ordering::SeqCst), texts_after_first + 1);
    Ok(())
}

#[tokio::test]
async fn edited_chunk_is_the_only_one_reembedded() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let cache = EmbeddingCache::open(&tmp.path().join("embeddings")).await?;
    let embedder: Arc<dyn Embedder> = Arc::new(FakeEmbedder::new(32));
    let mut chunks = corpus();
    VectorIndex::build(&tmp.path().join("v1"), &chunks, embedder.clone(), &cache, fast_options()).await?;

    chunks[1] = Chunk::new("config.py", 1, 2, "SECRET_KEY = 'rotated'\nDEBUG = True");
    let (_, report) = VectorIndex::build(&tmp.path().join("v2"), &chunks, embedder, &cache, fast_options()).await?;
    assert_eq!(report.reused, 4);
    assert_eq!(report.embedded, 1);
    Ok(())
}

#[tokio::test]
async fn large_tables_get_an_ann_index_and_stay_searchable() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let cache = EmbeddingCache::open(&tmp.path().join("embeddings")).await?;
    let embedder: Arc<dyn Embedder> = Arc::new(FakeEmbedder::new(32));
    let chunks: Vec<Chunk> = (0..300)
        .map(|i| Chunk::new(format!("gen/file_{i}.rs"), 1, 1, format!("fn handler_{i}() {{ route_{} }}", i % 17)))
        .collect();
    let options = EmbedOptions { batch_size: 64, ann_min_rows: 256, ..fast_options() };
    let (index, report) = VectorIndex::build(&tmp.path().join("vector"), &chunks, embedder.clone(), &cache, options).await?;
    assert_eq!(report.embedded, 300);

    let hits = index.query("route_3 handler", 10).await?;
    assert!(!hits.is_empty());
    assert!(hits.len() <= 10);

    let reopened = VectorIndex::open(&tmp.path().join("vector"), embedder, RetryPolicy::default()).await?;
    assert_eq!(reopened.len().await?, 300);
    Ok(())
}

#[tokio::test]
async fn open_rejects_dimension_mismatch() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let cache = EmbeddingCache::open(&tmp.path().join("embeddings")).await?;
    let dir = tmp.path().join("vector");
    VectorIndex::build(&dir, &corpus(), Arc::new(FakeEmbedder::new(16)), &cache, fast_options()).await?;
    assert!(VectorIndex::open(&dir, Arc::new(FakeEmbedder::new(24)), RetryPolicy::default()).await.is_err());
    Ok(())
}
