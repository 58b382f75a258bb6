//! Line-aligned chunking with character budget and trailing-line overlap.

use tracing::{debug, warn};

use crate::config::ChunkingSettings;
use crate::types::{Chunk, SourceDocument};

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ChunkingConfig {
    pub max_chars: usize,
    /// Fraction of a window repeated at the start of the next one, in `[0, 0.9]`.
    pub overlap: f32,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self { max_chars: 2000, overlap: 0.2 }
    }
}

impl From<&ChunkingSettings> for ChunkingConfig {
    fn from(s: &ChunkingSettings) -> Self {
        Self { max_chars: s.max_chars, overlap: s.overlap }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Self {
        let overlap = config.overlap.clamp(0.0, 0.9);
        Self { config: ChunkingConfig { max_chars: config.max_chars.max(1), overlap } }
    }

    pub fn config(&self) -> ChunkingConfig {
        self.config
    }

    pub fn chunk(&self, documents: &[SourceDocument]) -> Vec<Chunk> {
        let mut all = Vec::new();
        for doc in documents {
            let chunks = self.chunk_document(doc);
            debug!(file = %doc.file_path, chunks = chunks.len(), "chunked");
            all.extend(chunks);
        }
        all
    }

    pub fn chunk_document(&self, doc: &SourceDocument) -> Vec<Chunk> {
        if doc.content.contains('\0') {
            warn!(file = %doc.file_path, "skipping binary content");
            return Vec::new();
        }
        if doc.content.trim().is_empty() {
            return Vec::new();
        }

        let lines: Vec<&str> = doc.content.lines().collect();
        if doc.content.chars().count() <= self.config.max_chars {
            return vec![Chunk::new(&doc.file_path, 1, lines.len(), lines.join("\n"))];
        }

        // Per-line cost including the newline that joins it to the next.
        let cost: Vec<usize> = lines.iter().map(|l| l.chars().count() + 1).collect();
        let mut chunks = Vec::new();
        let mut start = 0;
        while start < lines.len() {
            let mut end = start;
            let mut used = cost[start];
            while end + 1 < lines.len() && used + cost[end + 1] <= self.config.max_chars + 1 {
                end += 1;
                used += cost[end];
            }

            let window = &lines[start..=end];
            if window.iter().any(|l| !l.trim().is_empty()) {
                chunks.push(Chunk::new(&doc.file_path, start + 1, end + 1, window.join("\n")));
            }
            if end + 1 >= lines.len() {
                break;
            }

            let overlap_budget = (used as f32 * self.config.overlap) as usize;
            let mut next = end + 1;
            let mut repeated = 0;
            while next > start + 1 && repeated + cost[next - 1] <= overlap_budget {
                next -= 1;
                repeated += cost[next];
            }
            start = next;
        }
        chunks
    }
}
