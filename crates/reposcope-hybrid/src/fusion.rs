//! Reciprocal rank fusion over per-engine result lists.

use std::collections::{BTreeSet, HashMap};

use reposcope_core::types::{ChunkId, EngineSource, FusedCandidate, SearchResult};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionConfig {
    /// Damping constant, must be > 0.
    pub k: f64,
    pub max_candidates: usize,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self { k: 60.0, max_candidates: 30 }
    }
}

/// `fused = Σ 1 / (k + rank)` over the lists containing a chunk.
///
/// Only ranks are used, never raw scores. A chunk listed twice by one engine
/// counts once at its best rank. Output is sorted by fused score, then number
/// of contributing engines, then chunk_id, and truncated to `max_candidates`.
pub fn fuse(lists: &[Vec<SearchResult>], config: &FusionConfig) -> Vec<FusedCandidate> {
    let k = config.k.max(f64::MIN_POSITIVE);
    let mut acc: HashMap<ChunkId, (f64, BTreeSet<EngineSource>)> = HashMap::new();

    for list in lists {
        let mut best: HashMap<&str, (usize, EngineSource)> = HashMap::new();
        for r in list {
            best.entry(r.chunk_id.as_str())
                .and_modify(|b| {
                    if r.rank < b.0 {
                        *b = (r.rank, r.engine_source);
                    }
                })
                .or_insert((r.rank, r.engine_source));
        }
        let mut ordered: Vec<(&str, (usize, EngineSource))> = best.into_iter().collect();
        ordered.sort_by(|a, b| a.1 .0.cmp(&b.1 .0).then_with(|| a.0.cmp(b.0)));
        for (id, (rank, engine)) in ordered {
            let entry = acc.entry(id.to_string()).or_insert_with(|| (0.0, BTreeSet::new()));
            entry.0 += 1.0 / (k + rank as f64);
            entry.1.insert(engine);
        }
    }

    let mut fused: Vec<FusedCandidate> = acc
        .into_iter()
        .map(|(chunk_id, (fused_score, contributing_engines))| FusedCandidate { chunk_id, fused_score, contributing_engines })
        .collect();
    fused.sort_by(|a, b| {
        b.fused_score
            .total_cmp(&a.fused_score)
            .then(b.contributing_engines.len().cmp(&a.contributing_engines.len()))
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    fused.truncate(config.max_candidates);
    fused
}
