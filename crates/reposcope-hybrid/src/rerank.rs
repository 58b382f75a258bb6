//! Relevance filtering and context assembly.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use reposcope_core::config::RerankSettings;
use reposcope_core::error::Error;
use reposcope_core::traits::RelevanceScorer;
use reposcope_core::types::{Chunk, ChunkTable, ContextItem, ContextOrigin, FusedCandidate, RankedContext};

pub const TRUNCATION_MARKER: &str = "\n... [truncated]";

#[derive(Debug, Clone)]
pub struct RerankConfig {
    pub min_relevance: f32,
    pub max_context_chars: usize,
    pub max_file_chars: usize,
    pub max_passage_chars: usize,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self::from(&RerankSettings::default())
    }
}

impl From<&RerankSettings> for RerankConfig {
    fn from(s: &RerankSettings) -> Self {
        Self {
            min_relevance: s.min_relevance,
            max_context_chars: s.max_context_chars,
            max_file_chars: s.max_file_chars,
            max_passage_chars: s.max_passage_chars,
        }
    }
}

/// Full content of a file nominated ahead of search.
#[derive(Debug, Clone)]
pub struct TargetedFile {
    pub file_path: String,
    pub content: String,
}

#[derive(Clone)]
pub struct RelevanceFilter {
    scorer: Option<Arc<dyn RelevanceScorer>>,
    config: RerankConfig,
}

impl RelevanceFilter {
    /// Without a scorer the fused order is used as is.
    pub fn new(scorer: Option<Arc<dyn RelevanceScorer>>, config: RerankConfig) -> Self {
        Self { scorer, config }
    }

    /// Builds the final context. Targeted files come first and replace their
    /// chunks, cut to whatever budget is left; the rest is scored, thresholded
    /// and packed into the character budget. A scorer failure falls back to fused order and is returned
    /// alongside the (degraded) context.
    pub fn filter(
        &self,
        question: &str,
        candidates: &[FusedCandidate],
        chunks: &ChunkTable,
        targeted: &[TargetedFile],
    ) -> (RankedContext, Option<Error>) {
        let mut ctx = RankedContext::default();

        let targeted_paths: HashSet<&str> = targeted.iter().map(|t| t.file_path.as_str()).collect();
        for t in targeted {
            let remaining = self.config.max_context_chars.saturating_sub(ctx.total_chars);
            let Some(chunk) = self.whole_file(t, remaining) else {
                debug!(file = %t.file_path, remaining, "targeted file does not fit context budget");
                continue;
            };
            ctx.total_chars += chunk.char_len();
            ctx.items.push(ContextItem { chunk, relevance: 1.0, origin: ContextOrigin::Targeted });
        }

        let retrieved: Vec<(&FusedCandidate, &Chunk)> = candidates
            .iter()
            .filter_map(|c| match chunks.get(&c.chunk_id) {
                Some(chunk) => Some((c, chunk)),
                None => {
                    warn!(chunk_id = %c.chunk_id, "fused candidate missing from chunk table");
                    None
                }
            })
            .filter(|(_, chunk)| !targeted_paths.contains(chunk.file_path.as_str()))
            .collect();
        if retrieved.is_empty() {
            return (ctx, None);
        }

        let Some(scorer) = &self.scorer else {
            self.pack(&mut ctx, fused_order(&retrieved));
            return (ctx, None);
        };

        let passages: Vec<String> =
            retrieved.iter().map(|(_, chunk)| chunk.indexed_text().chars().take(self.config.max_passage_chars).collect()).collect();
        match scorer.score_batch(question, &passages) {
            Ok(scores) if scores.len() == retrieved.len() => {
                let mut scored: Vec<(usize, f32, &Chunk)> = retrieved
                    .iter()
                    .zip(scores)
                    .enumerate()
                    .map(|(i, ((_, chunk), s))| (i, if s.is_nan() { 0.0 } else { s.clamp(0.0, 1.0) }, *chunk))
                    .filter(|(_, s, chunk)| {
                        let keep = *s >= self.config.min_relevance;
                        if !keep {
                            debug!(chunk_id = %chunk.chunk_id, relevance = s, "below relevance threshold");
                        }
                        keep
                    })
                    .collect();
                scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
                self.pack(&mut ctx, scored.into_iter().map(|(_, s, c)| (s, c)).collect());
                (ctx, None)
            }
            Ok(scores) => self.degrade(ctx, &retrieved, format!("{} scores for {} passages", scores.len(), retrieved.len())),
            Err(e) => self.degrade(ctx, &retrieved, format!("{e:#}")),
        }
    }

    fn degrade(&self, mut ctx: RankedContext, retrieved: &[(&FusedCandidate, &Chunk)], reason: String) -> (RankedContext, Option<Error>) {
        warn!(error = %reason, "relevance model unavailable, using fused order");
        self.pack(&mut ctx, fused_order(retrieved));
        ctx.degraded = true;
        (ctx, Some(Error::RerankUnavailable(reason)))
    }

    /// Admits items in order while they fit the budget; the rest are skipped.
    fn pack(&self, ctx: &mut RankedContext, ordered: Vec<(f32, &Chunk)>) {
        for (relevance, chunk) in ordered {
            let len = chunk.char_len();
            if ctx.total_chars + len > self.config.max_context_chars {
                debug!(chunk_id = %chunk.chunk_id, chars = len, "does not fit context budget");
                continue;
            }
            ctx.total_chars += len;
            ctx.items.push(ContextItem { chunk: chunk.clone(), relevance, origin: ContextOrigin::Retrieved });
        }
    }

    /// The file as one chunk, cut to `max_file_chars` and to `remaining` with
    /// the truncation marker counted in. `None` when not even the marker fits.
    fn whole_file(&self, t: &TargetedFile, remaining: usize) -> Option<Chunk> {
        let line_count = t.content.lines().count().max(1);
        let len = t.content.chars().count();
        if len <= self.config.max_file_chars.min(remaining) {
            return Some(Chunk::new(&t.file_path, 1, line_count, t.content.clone()));
        }
        let marker = TRUNCATION_MARKER.chars().count();
        let keep = self.config.max_file_chars.min(remaining.saturating_sub(marker));
        if keep == 0 {
            return None;
        }
        let mut cut: String = t.content.chars().take(keep).collect();
        cut.push_str(TRUNCATION_MARKER);
        Some(Chunk::new(&t.file_path, 1, line_count, cut))
    }
}

/// Relevance proxy when no model scores are available: fused score relative to the best.
fn fused_order<'a>(retrieved: &[(&FusedCandidate, &'a Chunk)]) -> Vec<(f32, &'a Chunk)> {
    let top = retrieved.iter().map(|(c, _)| c.fused_score).fold(0.0f64, f64::max);
    retrieved
        .iter()
        .map(|(c, chunk)| (if top > 0.0 { (c.fused_score / top) as f32 } else { 0.0 }, *chunk))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use reposcope_core::types::EngineSource;

    struct Fixed(Vec<f32>);
    impl RelevanceScorer for Fixed {
        fn score(&self, _q: &str, _p: &str) -> anyhow::Result<f32> {
            Ok(0.0)
        }
        fn score_batch(&self, _q: &str, passages: &[String]) -> anyhow::Result<Vec<f32>> {
            Ok(self.0.iter().copied().take(passages.len()).collect())
        }
    }

    struct Down;
    impl RelevanceScorer for Down {
        fn score(&self, _q: &str, _p: &str) -> anyhow::Result<f32> {
            anyhow::bail!("connection refused")
        }
    }

    fn setup() -> (ChunkTable, Vec<FusedCandidate>) {
        let chunks = ChunkTable::new(vec![
            Chunk::new("a.rs", 1, 1, "aaaa"),
            Chunk::new("b.rs", 1, 1, "bbbbbbbb"),
            Chunk::new("c.rs", 1, 1, "cc"),
        ]);
        let candidates = chunks
            .chunks()
            .iter()
            .zip([0.05, 0.04, 0.01])
            .map(|(c, s)| FusedCandidate {
                chunk_id: c.chunk_id.clone(),
                fused_score: s,
                contributing_engines: BTreeSet::from([EngineSource::Vector]),
            })
            .collect();
        (chunks, candidates)
    }

    fn files(ctx: &RankedContext) -> Vec<&str> {
        ctx.items.iter().map(|i| i.chunk.file_path.as_str()).collect()
    }

    #[test]
    fn scores_threshold_and_reorder() {
        let (chunks, cands) = setup();
        let filter = RelevanceFilter::new(Some(Arc::new(Fixed(vec![0.3, 0.1, 1.7]))), RerankConfig::default());
        let (ctx, err) = filter.filter("q", &cands, &chunks, &[]);
        assert!(err.is_none());
        assert_eq!(files(&ctx), vec!["c.rs", "a.rs"]);
        assert_eq!(ctx.items[0].relevance, 1.0);
        assert!(!ctx.degraded);
    }

    #[test]
    fn scorer_failure_keeps_fused_order() {
        let (chunks, cands) = setup();
        let filter = RelevanceFilter::new(Some(Arc::new(Down)), RerankConfig::default());
        let (ctx, err) = filter.filter("q", &cands, &chunks, &[]);
        assert!(matches!(err, Some(Error::RerankUnavailable(_))));
        assert!(ctx.degraded);
        assert_eq!(files(&ctx), vec!["a.rs", "b.rs", "c.rs"]);
        assert_eq!(ctx.items[0].relevance, 1.0);
        assert!((ctx.items[2].relevance - 0.2).abs() < 1e-6);
    }

    #[test]
    fn budget_skips_items_that_do_not_fit() {
        let (chunks, cands) = setup();
        let config = RerankConfig { max_context_chars: 7, ..RerankConfig::default() };
        let (ctx, _) = RelevanceFilter::new(None, config).filter("q", &cands, &chunks, &[]);
        assert_eq!(files(&ctx), vec!["a.rs", "c.rs"]);
        assert_eq!(ctx.total_chars, 6);
    }

    #[test]
    fn targeted_files_replace_their_chunks() {
        let (chunks, cands) = setup();
        let config = RerankConfig { max_file_chars: 5, ..RerankConfig::default() };
        let targeted = vec![TargetedFile { file_path: "b.rs".into(), content: "line one\nline two\n".into() }];
        let (ctx, _) = RelevanceFilter::new(None, config).filter("q", &cands, &chunks, &targeted);
        assert_eq!(files(&ctx), vec!["b.rs", "a.rs", "c.rs"]);
        assert_eq!(ctx.items[0].origin, ContextOrigin::Targeted);
        assert_eq!(ctx.items[0].relevance, 1.0);
        assert_eq!(ctx.items[0].chunk.text, format!("line {TRUNCATION_MARKER}"));
        assert_eq!(ctx.items[0].chunk.end_line, 2);
    }

    #[test]
    fn targeted_files_share_the_context_budget() {
        let (chunks, cands) = setup();
        let config = RerankConfig { max_context_chars: 40, ..RerankConfig::default() };
        let targeted = vec![
            TargetedFile { file_path: "big.rs".into(), content: "x".repeat(500) },
            TargetedFile { file_path: "other.rs".into(), content: "y".repeat(500) },
        ];
        let (ctx, _) = RelevanceFilter::new(None, config).filter("q", &cands, &chunks, &targeted);

        assert_eq!(files(&ctx), vec!["big.rs"]);
        let text = &ctx.items[0].chunk.text;
        assert!(text.ends_with(TRUNCATION_MARKER));
        assert_eq!(text.chars().count(), 40);
        assert_eq!(ctx.total_chars, 40);

        let tiny = RerankConfig { max_context_chars: 10, ..RerankConfig::default() };
        let (ctx, _) = RelevanceFilter::new(None, tiny).filter("q", &cands, &chunks, &targeted);
        assert!(ctx.total_chars <= 10);
        assert!(ctx.items.iter().all(|i| i.origin == ContextOrigin::Retrieved));
    }
}
