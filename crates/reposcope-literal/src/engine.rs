use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use tracing::{debug, warn};

use reposcope_core::types::{ChunkId, ChunkTable, EngineSource, SearchResult, SourceDocument};

use crate::patterns::compile_patterns;

#[derive(Default)]
struct ChunkHits {
    lines: BTreeSet<usize>,
    patterns: BTreeSet<usize>,
}

/// Regex scan over raw file content, attributed to enclosing chunks.
#[derive(Debug, Clone)]
pub struct LiteralEngine {
    max_results: usize,
}

impl LiteralEngine {
    pub fn new(max_results: usize) -> Self {
        Self { max_results }
    }

    /// Scans the files of `chunks` as they exist under `corpus_root`.
    pub fn search(&self, patterns: &[String], corpus_root: &Path, chunks: &ChunkTable) -> Vec<SearchResult> {
        let files: BTreeSet<&str> = chunks.chunks().iter().map(|c| c.file_path.as_str()).collect();
        let mut docs = Vec::new();
        for file in files {
            match std::fs::read_to_string(corpus_root.join(file)) {
                Ok(content) => docs.push(SourceDocument::new(file, content)),
                Err(e) => debug!(path = file, error = %e, "literal scan skipped file"),
            }
        }
        self.search_documents(patterns, &docs, chunks)
    }

    /// Same as [`search`](Self::search) for corpora held in memory.
    pub fn search_documents(
        &self,
        patterns: &[String],
        documents: &[SourceDocument],
        chunks: &ChunkTable,
    ) -> Vec<SearchResult> {
        let regexes = compile_patterns(patterns);
        if regexes.is_empty() || self.max_results == 0 {
            return Vec::new();
        }

        let mut hits: HashMap<ChunkId, ChunkHits> = HashMap::new();
        let mut unmapped = 0usize;
        for doc in documents {
            for (idx, line) in doc.content.lines().enumerate() {
                let matched = matching_patterns(&regexes, line);
                if matched.is_empty() {
                    continue;
                }
                let line_no = idx + 1;
                let Some(chunk) = chunks.enclosing(&doc.file_path, line_no) else {
                    unmapped += 1;
                    continue;
                };
                let entry = hits.entry(chunk.chunk_id.clone()).or_default();
                entry.lines.insert(line_no);
                entry.patterns.extend(matched);
            }
        }
        if unmapped > 0 {
            warn!(lines = unmapped, "matched lines outside every chunk, corpus changed since indexing?");
        }

        let mut ranked: Vec<(ChunkId, usize, usize)> =
            hits.into_iter().map(|(id, h)| (id, h.patterns.len(), h.lines.len())).collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(b.2.cmp(&a.2)).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(self.max_results);
        debug!(patterns = regexes.len(), hits = ranked.len(), "literal scan");
        SearchResult::rank_list(EngineSource::Literal, ranked.into_iter().map(|(id, _, lines)| (id, lines as f32)))
    }
}

fn matching_patterns(regexes: &[Regex], line: &str) -> Vec<usize> {
    regexes.iter().enumerate().filter(|(_, re)| re.is_match(line)).map(|(i, _)| i).collect()
}
