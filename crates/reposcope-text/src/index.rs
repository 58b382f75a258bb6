use anyhow::{Context, Result};
use std::path::Path;
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy};
use tracing::info;

use reposcope_core::types::Chunk;

use crate::tantivy_utils::{build_schema, register_tokenizer, Fields};

/// On-disk BM25 index over the chunk set of one corpus version.
pub struct TextIndex {
	pub(crate) index: Index,
	pub(crate) reader: IndexReader,
	pub(crate) fields: Fields,
}

impl TextIndex {
	/// Indexes `chunks` into a fresh index at `index_dir`, replacing whatever was there.
	pub fn build(index_dir: &Path, chunks: &[Chunk]) -> Result<Self> {
		if index_dir.exists() {
			std::fs::remove_dir_all(index_dir)?;
		}
		std::fs::create_dir_all(index_dir)?;
		let index = Index::create_in_dir(index_dir, build_schema())
			.with_context(|| format!("creating text index at {}", index_dir.display()))?;
		register_tokenizer(&index);
		let fields = Fields::from_schema(&index.schema())?;

		let mut index_writer: IndexWriter = index.writer(50_000_000)?;
		for c in chunks {
			index_writer.add_document(doc!(
				fields.chunk_id => c.chunk_id.clone(),
				fields.file_path => c.file_path.clone(),
				fields.text => c.indexed_text(),
			))?;
		}
		index_writer.commit()?;
		index_writer.wait_merging_threads()?;
		info!(dir = %index_dir.display(), docs = chunks.len(), "text index built");

		Self::from_index(index, fields)
	}

	pub fn open(index_dir: &Path) -> Result<Self> {
		let index = Index::open_in_dir(index_dir)
			.with_context(|| format!("opening text index at {}", index_dir.display()))?;
		register_tokenizer(&index);
		let fields = Fields::from_schema(&index.schema())?;
		Self::from_index(index, fields)
	}

	fn from_index(index: Index, fields: Fields) -> Result<Self> {
		let reader = index.reader_builder().reload_policy(ReloadPolicy::Manual).try_into()?;
		Ok(Self { index, reader, fields })
	}

	pub fn num_docs(&self) -> u64 {
		self.reader.searcher().num_docs()
	}
}
