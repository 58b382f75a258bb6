//! reposcope-text
//!
//! BM25 search over chunk text backed by a Tantivy index. `index` builds and opens
//! the on-disk index, `search` answers term queries.

pub mod tantivy_utils;
pub mod index;
pub mod search;

pub use index::TextIndex;
