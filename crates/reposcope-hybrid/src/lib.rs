//! reposcope-hybrid
//!
//! Ties the vector, statistical and literal engines together: per-fingerprint
//! index caching, concurrent fan-out, reciprocal rank fusion and relevance
//! filtering into a bounded context.

pub mod cache;
pub mod engine;
pub mod fusion;
pub mod rerank;
pub mod scorer;
pub mod targets;

pub use cache::{BuildPermit, IndexCache, IndexHandles, Manifest, INDEX_FORMAT_VERSION};
pub use engine::{EngineConfig, PreparedCorpus, QueryOutcome, QueryRequest, RetrievalEngine};
pub use fusion::{fuse, FusionConfig};
pub use rerank::{RelevanceFilter, RerankConfig, TargetedFile};
pub use scorer::HttpRelevanceScorer;
pub use targets::resolve_targets;
