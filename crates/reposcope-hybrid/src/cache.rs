//! On-disk index cache keyed by corpus fingerprint.
//!
//! ```text
//! <root>/indexes/<fingerprint>/CURRENT      name of the live version
//! <root>/indexes/<fingerprint>/<version>/{manifest.json, chunks.json, text/, vector/}
//! <root>/embeddings/                        shared embedding cache
//! <root>/staging/                           builds in progress
//! ```
//!
//! A build is written to a staging directory, renamed into a new version
//! directory and made live by atomically replacing `CURRENT`. Published
//! versions are never modified in place. After each publish only the live
//! version and the one it replaced are kept, so handles opened before a
//! rebuild stay valid until the next rebuild.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use reposcope_core::chunking::ChunkingConfig;
use reposcope_core::traits::Embedder;
use reposcope_core::types::{Chunk, ChunkTable, CorpusFingerprint};
use reposcope_text::TextIndex;
use reposcope_vector::{BuildReport, EmbeddingCache, RetryPolicy, VectorIndex};

/// Bumped whenever the on-disk layout of an entry changes.
pub const INDEX_FORMAT_VERSION: u32 = 2;

const CURRENT_FILE: &str = "CURRENT";
const MANIFEST_FILE: &str = "manifest.json";
const CHUNKS_FILE: &str = "chunks.json";
const TEXT_DIR: &str = "text";
const VECTOR_DIR: &str = "vector";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub fingerprint: CorpusFingerprint,
    pub embedder_id: String,
    pub dim: usize,
    pub chunking: ChunkingConfig,
    pub chunk_count: usize,
    pub created_at: DateTime<Utc>,
    pub vector_report: BuildReport,
}

/// What an entry must have been built with to be usable by the running engine.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexKey {
    pub embedder_id: String,
    pub dim: usize,
    pub chunking: ChunkingConfig,
}

impl Manifest {
    pub fn new(fingerprint: CorpusFingerprint, key: &IndexKey, chunk_count: usize, vector_report: BuildReport) -> Self {
        Self {
            format_version: INDEX_FORMAT_VERSION,
            fingerprint,
            embedder_id: key.embedder_id.clone(),
            dim: key.dim,
            chunking: key.chunking,
            chunk_count,
            created_at: Utc::now(),
            vector_report,
        }
    }

    /// Why this manifest cannot serve `fingerprint` under `key`, if it cannot.
    pub fn mismatch(&self, fingerprint: &CorpusFingerprint, key: &IndexKey) -> Option<String> {
        if self.format_version != INDEX_FORMAT_VERSION {
            return Some(format!("format version {} != {}", self.format_version, INDEX_FORMAT_VERSION));
        }
        if &self.fingerprint != fingerprint {
            return Some(format!("fingerprint {} != {}", self.fingerprint.short(), fingerprint.short()));
        }
        if self.embedder_id != key.embedder_id {
            return Some(format!("embedder {} != {}", self.embedder_id, key.embedder_id));
        }
        if self.dim != key.dim {
            return Some(format!("dimension {} != {}", self.dim, key.dim));
        }
        if self.chunking != key.chunking {
            return Some("chunking parameters changed".to_string());
        }
        None
    }
}

/// Read handles over one published entry.
#[derive(Clone)]
pub struct IndexHandles {
    pub manifest: Manifest,
    pub chunks: Arc<ChunkTable>,
    pub text: Arc<TextIndex>,
    pub vector: Arc<VectorIndex>,
}

/// A finished build waiting to be published.
pub struct StagedIndex {
    pub dir: PathBuf,
    pub chunks: Vec<Chunk>,
    pub manifest: Manifest,
}

/// Where the text index of an entry (or staged build) rooted at `dir` lives.
pub fn text_dir(dir: &Path) -> PathBuf {
    dir.join(TEXT_DIR)
}

pub fn vector_dir(dir: &Path) -> PathBuf {
    dir.join(VECTOR_DIR)
}

pub struct IndexCache {
    root: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Exclusive right to build or remove the entry of one fingerprint. The lock
/// is forgotten on drop once nobody else holds or waits for it.
pub struct BuildPermit<'a> {
    cache: &'a IndexCache,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for BuildPermit<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.cache.locks.remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl IndexCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), locks: DashMap::new() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry_dir(&self, fingerprint: &CorpusFingerprint) -> PathBuf {
        self.root.join("indexes").join(fingerprint.as_str())
    }

    /// The live version directory of `fingerprint`, if one was published.
    pub fn current_dir(&self, fingerprint: &CorpusFingerprint) -> Option<PathBuf> {
        let entry = self.entry_dir(fingerprint);
        read_current(&entry).map(|version| entry.join(version))
    }

    pub fn embeddings_dir(&self) -> PathBuf {
        self.root.join("embeddings")
    }

    /// A fresh, empty staging directory for `fingerprint`.
    pub fn staging_dir(&self, fingerprint: &CorpusFingerprint) -> Result<PathBuf> {
        let dir = self.root.join("staging").join(format!("{}-{}", fingerprint.as_str(), std::process::id()));
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        std::fs::create_dir_all(&dir).with_context(|| format!("creating staging dir {}", dir.display()))?;
        Ok(dir)
    }

    pub async fn embedding_cache(&self) -> Result<EmbeddingCache> {
        EmbeddingCache::open(&self.embeddings_dir()).await
    }

    /// Exclusive build permit for `fingerprint`. Waiters queue behind the
    /// current holder.
    pub async fn build_lock(&self, fingerprint: &CorpusFingerprint) -> BuildPermit<'_> {
        let key = fingerprint.as_str().to_string();
        let lock = self.locks.entry(key.clone()).or_default().clone();
        let guard = lock.lock_owned().await;
        BuildPermit { cache: self, key, guard: Some(guard) }
    }

    /// Opens the live version for `fingerprint` if there is one and it was
    /// built for `key`. Anything else is a miss. Nothing is deleted here: a
    /// stale version is superseded by the next publish.
    pub async fn load(
        &self,
        fingerprint: &CorpusFingerprint,
        key: &IndexKey,
        embedder: Arc<dyn Embedder>,
        retry: RetryPolicy,
    ) -> Option<IndexHandles> {
        let Some(dir) = self.current_dir(fingerprint) else {
            debug!(fingerprint = %fingerprint.short(), "index cache miss");
            return None;
        };
        match open_entry(&dir, fingerprint, key, embedder, retry).await {
            Ok(handles) => {
                info!(fingerprint = %fingerprint.short(), chunks = handles.chunks.len(), "index cache hit");
                Some(handles)
            }
            Err(e) => {
                warn!(fingerprint = %fingerprint.short(), error = %format!("{e:#}"), "cached index unusable");
                None
            }
        }
    }

    /// Publishes a staged build as the live version for `fingerprint`. Callers
    /// hold the fingerprint's build permit.
    pub fn store(&self, fingerprint: &CorpusFingerprint, staged: StagedIndex) -> Result<PathBuf> {
        write_json(&staged.dir.join(CHUNKS_FILE), &staged.chunks)?;
        write_json(&staged.dir.join(MANIFEST_FILE), &staged.manifest)?;

        let entry = self.entry_dir(fingerprint);
        std::fs::create_dir_all(&entry).with_context(|| format!("creating {}", entry.display()))?;
        let version = new_version_name();
        let dest = entry.join(&version);
        std::fs::rename(&staged.dir, &dest)
            .with_context(|| format!("publishing {} to {}", staged.dir.display(), dest.display()))?;

        let replaced = read_current(&entry);
        let pending = entry.join(format!("{CURRENT_FILE}.{}", std::process::id()));
        std::fs::write(&pending, &version).with_context(|| format!("writing {}", pending.display()))?;
        std::fs::rename(&pending, entry.join(CURRENT_FILE)).context("switching live version")?;
        info!(fingerprint = %fingerprint.short(), version = %version, chunks = staged.chunks.len(), "index published");

        remove_old_versions(&entry, &version, replaced.as_deref());
        Ok(dest)
    }

    /// Removes every version of `fingerprint`, waiting for a running build of
    /// it to finish first.
    pub async fn invalidate(&self, fingerprint: &CorpusFingerprint) -> Result<()> {
        let _permit = self.build_lock(fingerprint).await;
        let dir = self.entry_dir(fingerprint);
        if dir.exists() {
            std::fs::remove_dir_all(&dir).with_context(|| format!("removing {}", dir.display()))?;
            info!(fingerprint = %fingerprint.short(), "index invalidated");
        }
        Ok(())
    }

    /// Removes every entry, the staging area and the shared embedding cache.
    pub fn clear(&self) -> Result<()> {
        for sub in ["indexes", "staging", "embeddings"] {
            let dir = self.root.join(sub);
            if dir.exists() {
                std::fs::remove_dir_all(&dir).with_context(|| format!("removing {}", dir.display()))?;
            }
        }
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        info!(root = %self.root.display(), "index cache cleared");
        Ok(())
    }
}

fn new_version_name() -> String {
    format!("v{}-{}", Utc::now().format("%Y%m%dT%H%M%S%9f"), std::process::id())
}

/// The version named by `entry/CURRENT`. Only plain names are accepted.
fn read_current(entry: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(entry.join(CURRENT_FILE)).ok()?;
    let version = raw.trim();
    let plain = !version.is_empty() && version.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
    plain.then(|| version.to_string())
}

fn remove_old_versions(entry: &Path, live: &str, replaced: Option<&str>) {
    let Ok(dirs) = std::fs::read_dir(entry) else { return };
    for dir in dirs.flatten() {
        let name = dir.file_name();
        let name = name.to_string_lossy();
        if name == live || Some(&*name) == replaced || !dir.path().is_dir() {
            continue;
        }
        match std::fs::remove_dir_all(dir.path()) {
            Ok(()) => debug!(version = %name, "old index version removed"),
            Err(e) => debug!(version = %name, error = %e, "old index version left in place"),
        }
    }
}

async fn open_entry(
    dir: &Path,
    fingerprint: &CorpusFingerprint,
    key: &IndexKey,
    embedder: Arc<dyn Embedder>,
    retry: RetryPolicy,
) -> Result<IndexHandles> {
    let manifest: Manifest = read_json(&dir.join(MANIFEST_FILE)).context("reading manifest")?;
    if let Some(reason) = manifest.mismatch(fingerprint, key) {
        anyhow::bail!("manifest mismatch: {reason}");
    }
    let chunks: Vec<Chunk> = read_json(&dir.join(CHUNKS_FILE)).context("reading chunk table")?;
    if chunks.len() != manifest.chunk_count {
        anyhow::bail!("chunk table has {} chunks, manifest says {}", chunks.len(), manifest.chunk_count);
    }
    let text = TextIndex::open(&text_dir(dir))?;
    if text.num_docs() as usize != chunks.len() {
        anyhow::bail!("text index has {} docs for {} chunks", text.num_docs(), chunks.len());
    }
    let vector = VectorIndex::open(&vector_dir(dir), embedder, retry).await?;
    Ok(IndexHandles { manifest, chunks: Arc::new(ChunkTable::new(chunks)), text: Arc::new(text), vector: Arc::new(vector) })
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    std::fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(serde_json::from_slice(&bytes)?)
}
