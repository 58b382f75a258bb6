//! Shared types, configuration, chunking and corpus access for reposcope.

pub mod chunking;
pub mod config;
pub mod corpus;
pub mod error;
pub mod logging;
pub mod traits;
pub mod types;
