use anyhow::{anyhow, bail, Context, Result};
use arrow_array::{Float32Array, RecordBatch, StringArray};
use futures::TryStreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{DistanceType, Table};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use reposcope_core::config::EmbeddingSettings;
use reposcope_core::traits::Embedder;
use reposcope_core::types::{Chunk, ChunkId, EngineSource, SearchResult};

use crate::backoff::{embed_with_retry, RateLimiter, RetryPolicy};
use crate::cache::{CacheEntry, EmbeddingCache};
use crate::index_build::maybe_build_ann;
use crate::schema::{build_chunk_schema, vector_dim, vectors_array, CHUNKS_TABLE};
use crate::table::{ensure_table, open_db, string_column, table_exists};

#[derive(Debug, Clone)]
pub struct EmbedOptions {
    pub batch_size: usize,
    pub ann_min_rows: usize,
    pub retry: RetryPolicy,
    pub min_batch_interval: Duration,
    pub show_progress: bool,
}

impl Default for EmbedOptions {
    fn default() -> Self {
        Self {
            batch_size: 64,
            ann_min_rows: 256,
            retry: RetryPolicy::default(),
            min_batch_interval: Duration::ZERO,
            show_progress: false,
        }
    }
}

impl From<&EmbeddingSettings> for EmbedOptions {
    fn from(s: &EmbeddingSettings) -> Self {
        Self {
            batch_size: s.batch_size.max(1),
            ann_min_rows: s.ann_min_rows,
            retry: RetryPolicy::from(s),
            min_batch_interval: Duration::from_millis(s.min_batch_interval_ms),
            show_progress: false,
        }
    }
}

/// Outcome of a vector index build.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BuildReport {
    /// Chunks embedded by the provider during this build.
    pub embedded: usize,
    /// Chunks whose vector came from the shared embedding cache.
    pub reused: usize,
    /// Chunks left out after every retry failed.
    pub skipped: usize,
    pub skipped_ids: Vec<ChunkId>,
    pub ann_index: bool,
}

/// Cosine-similarity index over chunk embeddings of one corpus version.
pub struct VectorIndex {
    table: Table,
    embedder: Arc<dyn Embedder>,
    retry: RetryPolicy,
}

fn content_hash(chunk: &Chunk) -> String {
    blake3::hash(chunk.indexed_text().as_bytes()).to_hex().to_string()
}

impl VectorIndex {
    pub async fn build(
        dir: &Path,
        chunks: &[Chunk],
        embedder: Arc<dyn Embedder>,
        cache: &EmbeddingCache,
        options: EmbedOptions,
    ) -> Result<(Self, BuildReport)> {
        let dim = embedder.dim();
        let embedder_id = embedder.id().to_string();
        let hashes: Vec<String> = chunks.iter().map(content_hash).collect();
        let mut report = BuildReport::default();
        let mut vectors: Vec<Option<Vec<f32>>> = vec![None; chunks.len()];

        let cached = cache.get_many(&embedder_id, dim, &hashes).await.unwrap_or_else(|e| {
            warn!(error = %e, "embedding cache unreadable, embedding everything");
            HashMap::new()
        });
        for (slot, hash) in vectors.iter_mut().zip(&hashes) {
            if let Some(v) = cached.get(hash) {
                *slot = Some(v.clone());
                report.reused += 1;
            }
        }

        let misses: Vec<usize> = (0..chunks.len()).filter(|&i| vectors[i].is_none()).collect();
        let pb = if options.show_progress { ProgressBar::new(misses.len() as u64) } else { ProgressBar::hidden() };
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} chunks ({percent}%) {msg}")
        {
            pb.set_style(style.progress_chars("#>-"));
        }

        let limiter = RateLimiter::new(options.min_batch_interval);
        let mut fresh = Vec::new();
        for batch in misses.chunks(options.batch_size.max(1)) {
            let texts: Vec<String> = batch.iter().map(|&i| chunks[i].indexed_text()).collect();
            let results = embed_batch_or_singles(&embedder, texts, &options.retry, &limiter).await;
            for (&i, result) in batch.iter().zip(results) {
                match result {
                    Ok(v) if v.len() == dim => {
                        fresh.push(CacheEntry { content_hash: hashes[i].clone(), vector: v.clone() });
                        vectors[i] = Some(v);
                        report.embedded += 1;
                    }
                    Ok(v) => {
                        warn!(chunk_id = %chunks[i].chunk_id, got = v.len(), expected = dim, "wrong embedding dimension, chunk skipped");
                        report.skipped_ids.push(chunks[i].chunk_id.clone());
                    }
                    Err(e) => {
                        warn!(chunk_id = %chunks[i].chunk_id, error = %e, "embedding failed, chunk skipped");
                        report.skipped_ids.push(chunks[i].chunk_id.clone());
                    }
                }
                pb.inc(1);
            }
        }
        pb.finish_and_clear();
        report.skipped = report.skipped_ids.len();

        if let Err(e) = cache.put_many(&embedder_id, dim, &fresh).await {
            warn!(error = %e, "could not write embedding cache");
        }

        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        std::fs::create_dir_all(dir)?;
        let conn = open_db(&dir.to_string_lossy()).await?;
        let schema = build_chunk_schema(dim);
        let table = ensure_table(&conn, CHUNKS_TABLE, schema.clone()).await?;

        let rows: Vec<usize> = (0..chunks.len()).filter(|&i| vectors[i].is_some()).collect();
        if !rows.is_empty() {
            let row_vectors: Vec<Vec<f32>> = rows.iter().filter_map(|&i| vectors[i].clone()).collect();
            let batch = RecordBatch::try_new(
                schema,
                vec![
                    Arc::new(StringArray::from(rows.iter().map(|&i| chunks[i].chunk_id.clone()).collect::<Vec<_>>())),
                    Arc::new(StringArray::from(rows.iter().map(|&i| chunks[i].file_path.clone()).collect::<Vec<_>>())),
                    Arc::new(StringArray::from(rows.iter().map(|&i| hashes[i].clone()).collect::<Vec<_>>())),
                    Arc::new(vectors_array(&row_vectors, dim)),
                ],
            )?;
            crate::table::append(&table, batch).await?;
        }
        report.ann_index = maybe_build_ann(&table, rows.len(), dim, options.ann_min_rows).await;

        info!(
            dir = %dir.display(),
            embedder = %embedder_id,
            embedded = report.embedded,
            reused = report.reused,
            skipped = report.skipped,
            "vector index built"
        );
        Ok((Self { table, embedder, retry: options.retry }, report))
    }

    pub async fn open(dir: &Path, embedder: Arc<dyn Embedder>, retry: RetryPolicy) -> Result<Self> {
        let conn = open_db(&dir.to_string_lossy()).await?;
        if !table_exists(&conn, CHUNKS_TABLE).await? {
            bail!("no vector table at {}", dir.display());
        }
        let table = conn.open_table(CHUNKS_TABLE).execute().await?;
        let schema = table.schema().await?;
        match vector_dim(&schema) {
            Some(d) if d == embedder.dim() => {}
            other => bail!("vector table dimension {:?} does not match embedder {}", other, embedder.dim()),
        }
        Ok(Self { table, embedder, retry })
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self.table.count_rows(None).await?)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// The `k` nearest chunks to `text` by cosine distance. `raw_score` is the
    /// cosine similarity; ties are broken by chunk_id.
    pub async fn query(&self, text: &str, k: usize) -> Result<Vec<SearchResult>> {
        if k == 0 || self.is_empty().await? {
            return Ok(Vec::new());
        }
        let texts = Arc::new(vec![text.to_string()]);
        let q = embed_with_retry(&self.embedder, texts, &self.retry, None)
            .await
            .context("embedding query")?
            .pop()
            .ok_or_else(|| anyhow!("empty query embedding"))?;

        let mut stream = self.table.vector_search(q)?.distance_type(DistanceType::Cosine).limit(k).execute().await?;
        let mut hits: Vec<(ChunkId, f32)> = Vec::new();
        while let Some(batch) = stream.try_next().await? {
            let ids = string_column(&batch, "chunk_id")?;
            let distances = batch
                .column_by_name("_distance")
                .and_then(|c| c.as_any().downcast_ref::<Float32Array>())
                .ok_or_else(|| anyhow!("_distance column missing"))?;
            for i in 0..batch.num_rows() {
                hits.push((ids.value(i).to_string(), 1.0 - distances.value(i)));
            }
        }
        hits.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        hits.truncate(k);
        debug!(hits = hits.len(), "vector query");
        Ok(SearchResult::rank_list(EngineSource::Vector, hits))
    }
}

/// Embeds a batch; if the whole call keeps failing, retries each text alone so
/// one bad input only costs itself.
async fn embed_batch_or_singles(
    embedder: &Arc<dyn Embedder>,
    texts: Vec<String>,
    retry: &RetryPolicy,
    limiter: &RateLimiter,
) -> Vec<Result<Vec<f32>>> {
    let n = texts.len();
    let texts = Arc::new(texts);
    match embed_with_retry(embedder, Arc::clone(&texts), retry, Some(limiter)).await {
        Ok(vectors) => vectors.into_iter().map(Ok).collect(),
        Err(e) if n == 1 => vec![Err(e)],
        Err(e) => {
            warn!(batch = n, error = %e, "batch embedding failed, falling back to single items");
            let mut out = Vec::with_capacity(n);
            for t in texts.iter() {
                let single = Arc::new(vec![t.clone()]);
                out.push(embed_with_retry(embedder, single, retry, Some(limiter)).await.and_then(|mut v| {
                    v.pop().ok_or_else(|| anyhow!("provider returned no vector"))
                }));
            }
            out
        }
    }
}
