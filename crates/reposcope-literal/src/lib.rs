//! reposcope-literal
//!
//! Case-insensitive pattern scan over raw file content. Matching lines are
//! attributed to the chunk that encloses them; nothing is indexed ahead of time.

pub mod engine;
pub mod patterns;

pub use engine::LiteralEngine;
pub use patterns::{compile_patterns, seeds_from_question};
