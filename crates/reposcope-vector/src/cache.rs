//! Lance-backed embedding cache keyed by `(content_hash, embedder_id)`.
//!
//! Consulted before calling a provider and written through on misses, so an
//! unchanged chunk is embedded once per embedder across corpus versions.

use anyhow::Result;
use arrow_array::{RecordBatch, StringArray, TimestampMillisecondArray};
use chrono::Utc;
use lancedb::Connection;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::schema::{build_cache_schema, vectors_array};
use crate::table::{append, ensure_table, open_db, scan_vectors, string_column, table_exists};

#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub content_hash: String,
    pub vector: Vec<f32>,
}

pub struct EmbeddingCache {
    conn: Connection,
}

fn table_name(dim: usize) -> String {
    format!("embeddings_d{dim}")
}

impl EmbeddingCache {
    pub async fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let conn = open_db(&dir.to_string_lossy()).await?;
        Ok(Self { conn })
    }

    pub async fn get_many(&self, embedder_id: &str, dim: usize, hashes: &[String]) -> Result<HashMap<String, Vec<f32>>> {
        let name = table_name(dim);
        let mut out = HashMap::new();
        if hashes.is_empty() || !table_exists(&self.conn, &name).await? {
            return Ok(out);
        }
        let wanted: HashSet<&str> = hashes.iter().map(String::as_str).collect();
        let table = self.conn.open_table(&name).execute().await?;
        scan_vectors(&table, "content_hash", |batch, i, hash, vector| {
            let same_embedder = string_column(batch, "embedder_id").map(|c| c.value(i) == embedder_id).unwrap_or(false);
            if same_embedder && wanted.contains(hash) && vector.len() == dim {
                out.insert(hash.to_string(), vector);
            }
        })
        .await?;
        debug!(embedder = embedder_id, requested = hashes.len(), hits = out.len(), "embedding cache lookup");
        Ok(out)
    }

    pub async fn put_many(&self, embedder_id: &str, dim: usize, entries: &[CacheEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let schema = build_cache_schema(dim);
        let table = ensure_table(&self.conn, &table_name(dim), schema.clone()).await?;
        let now = Utc::now().timestamp_millis();
        let vectors: Vec<Vec<f32>> = entries.iter().map(|e| e.vector.clone()).collect();
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(entries.iter().map(|e| e.content_hash.clone()).collect::<Vec<_>>())),
                Arc::new(StringArray::from(vec![embedder_id.to_string(); entries.len()])),
                Arc::new(TimestampMillisecondArray::from(vec![now; entries.len()])),
                Arc::new(vectors_array(&vectors, dim)),
            ],
        )?;
        append(&table, batch).await
    }
}
