//! Domain types used by the chunker, the three search engines and fusion.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

use crate::error::{Error, Result};

pub type ChunkId = String;

/// One file of the corpus as yielded by a corpus provider.
///
/// `file_path` is relative to the corpus root and always uses `/` separators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDocument {
    pub file_path: String,
    pub content: String,
}

impl SourceDocument {
    pub fn new(file_path: impl Into<String>, content: impl Into<String>) -> Self {
        Self { file_path: file_path.into(), content: content.into() }
    }

    pub fn content_hash(&self) -> String {
        blake3::hash(self.content.as_bytes()).to_hex().to_string()
    }
}

/// A contiguous, line-aligned span of a single source file.
///
/// - `chunk_id`: hash of `(file_path, start_line, end_line)`, see [`chunk_id_for`]
/// - `start_line`/`end_line`: 1-based, inclusive
/// - `text`: the lines of the span joined with `\n`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: ChunkId,
    pub file_path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub text: String,
}

impl Chunk {
    pub fn new(file_path: impl Into<String>, start_line: usize, end_line: usize, text: impl Into<String>) -> Self {
        let file_path = file_path.into();
        let chunk_id = chunk_id_for(&file_path, start_line, end_line);
        Self { chunk_id, file_path, start_line, end_line, text: text.into() }
    }

    /// Text handed to the vector and statistical engines. The header keeps the
    /// file path searchable.
    pub fn indexed_text(&self) -> String {
        format!("File: {} (lines {}-{})\n\n{}", self.file_path, self.start_line, self.end_line, self.text)
    }

    pub fn contains_line(&self, line: usize) -> bool {
        self.start_line <= line && line <= self.end_line
    }

    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// Deterministic chunk identity: the first 32 hex chars of
/// `blake3(file_path \0 start_line end_line)`.
pub fn chunk_id_for(file_path: &str, start_line: usize, end_line: usize) -> ChunkId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(file_path.as_bytes());
    hasher.update(&[0]);
    hasher.update(&(start_line as u64).to_le_bytes());
    hasher.update(&(end_line as u64).to_le_bytes());
    let hex = hasher.finalize().to_hex();
    hex.as_str()[..32].to_string()
}

/// Indicates which engine produced a result.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EngineSource {
    Vector,
    Statistical,
    Literal,
}

impl EngineSource {
    pub const ALL: [EngineSource; 3] = [EngineSource::Vector, EngineSource::Statistical, EngineSource::Literal];

    pub fn as_str(self) -> &'static str {
        match self {
            EngineSource::Vector => "vector",
            EngineSource::Statistical => "statistical",
            EngineSource::Literal => "literal",
        }
    }
}

impl fmt::Display for EngineSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-engine output unit before fusion.
///
/// `raw_score` is engine-specific (cosine similarity, BM25, match count) and is
/// never compared across engines. Only `rank` (1-based) is used downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub chunk_id: ChunkId,
    pub engine_source: EngineSource,
    pub raw_score: f32,
    pub rank: usize,
}

impl SearchResult {
    /// Turns an already ordered `(chunk_id, raw_score)` list into ranked results.
    pub fn rank_list<I>(engine: EngineSource, ordered: I) -> Vec<SearchResult>
    where
        I: IntoIterator<Item = (ChunkId, f32)>,
    {
        ordered
            .into_iter()
            .enumerate()
            .map(|(i, (chunk_id, raw_score))| SearchResult { chunk_id, engine_source: engine, raw_score, rank: i + 1 })
            .collect()
    }
}

/// A deduplicated candidate produced by rank fusion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedCandidate {
    pub chunk_id: ChunkId,
    pub fused_score: f64,
    pub contributing_engines: BTreeSet<EngineSource>,
}

/// Where a context item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextOrigin {
    /// Full file nominated ahead of search; authoritative over its chunks.
    Targeted,
    /// Chunk found by hybrid search.
    Retrieved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextItem {
    pub chunk: Chunk,
    /// Relevance to the question in `[0, 1]`.
    pub relevance: f32,
    pub origin: ContextOrigin,
}

/// Final ordered context handed to answer synthesis.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RankedContext {
    pub items: Vec<ContextItem>,
    pub total_chars: usize,
    /// Set when the relevance model was unavailable and fused order was used.
    pub degraded: bool,
}

impl RankedContext {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Renders the context the way the synthesis prompt consumes it.
    pub fn render(&self) -> String {
        self.items.iter().map(|item| item.chunk.indexed_text()).collect::<Vec<_>>().join("\n\n---\n\n")
    }
}

/// Content hash over every `(file_path, content_hash)` pair of a corpus.
///
/// Identifies an index version: equal fingerprints imply identical chunk sets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorpusFingerprint(String);

impl CorpusFingerprint {
    pub fn compute(documents: &[SourceDocument]) -> Self {
        let mut pairs: Vec<(&str, String)> =
            documents.iter().map(|d| (d.file_path.as_str(), d.content_hash())).collect();
        pairs.sort();
        let mut hasher = blake3::Hasher::new();
        for (path, hash) in pairs {
            hasher.update(path.as_bytes());
            hasher.update(&[0]);
            hasher.update(hash.as_bytes());
            hasher.update(b"\n");
        }
        Self(hasher.finalize().to_hex().to_string())
    }

    /// Parses a fingerprint given by a caller. Only the 64 lowercase hex chars
    /// `compute` produces are accepted, so the value is always safe to use as a
    /// directory name.
    pub fn parse(hex: &str) -> Result<Self> {
        if hex.len() == 64 && hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            Ok(Self(hex.to_string()))
        } else {
            Err(Error::InvalidConfig(format!("not a corpus fingerprint: {hex:?}")))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for CorpusFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The chunk set of one corpus version with lookups by id and by file.
#[derive(Debug, Clone, Default)]
pub struct ChunkTable {
    chunks: Vec<Chunk>,
    by_id: HashMap<ChunkId, usize>,
    by_file: HashMap<String, Vec<usize>>,
}

impl ChunkTable {
    pub fn new(chunks: Vec<Chunk>) -> Self {
        let mut by_id = HashMap::with_capacity(chunks.len());
        let mut by_file: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, chunk) in chunks.iter().enumerate() {
            by_id.insert(chunk.chunk_id.clone(), i);
            by_file.entry(chunk.file_path.clone()).or_default().push(i);
        }
        for indices in by_file.values_mut() {
            indices.sort_by_key(|&i| (chunks[i].start_line, chunks[i].end_line));
        }
        Self { chunks, by_id, by_file }
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn get(&self, chunk_id: &str) -> Option<&Chunk> {
        self.by_id.get(chunk_id).map(|&i| &self.chunks[i])
    }

    pub fn for_file<'a>(&'a self, file_path: &str) -> impl Iterator<Item = &'a Chunk> + 'a {
        self.by_file.get(file_path).into_iter().flatten().map(move |&i| &self.chunks[i])
    }

    /// The chunk a line belongs to. With overlapping chunks the one whose centre
    /// is nearest the line wins; ties go to the earlier chunk.
    pub fn enclosing(&self, file_path: &str, line: usize) -> Option<&Chunk> {
        self.for_file(file_path)
            .filter(|c| c.contains_line(line))
            .min_by_key(|c| (2 * line).abs_diff(c.start_line + c.end_line))
    }
}
