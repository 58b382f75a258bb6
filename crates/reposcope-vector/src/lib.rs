//! reposcope-vector
//!
//! Embedding-based nearest-neighbour search over chunks, stored in LanceDB with
//! a shared write-through embedding cache.

pub mod backoff;
pub mod cache;
pub mod index;
pub mod index_build;
pub mod schema;
pub mod table;

pub use backoff::RetryPolicy;
pub use cache::EmbeddingCache;
pub use index::{BuildReport, EmbedOptions, VectorIndex};
