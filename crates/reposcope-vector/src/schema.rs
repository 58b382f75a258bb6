use arrow_array::types::Float32Type;
use arrow_array::FixedSizeListArray;
use arrow_schema::{DataType, Field, Schema, TimeUnit};
use std::sync::Arc;

pub const CHUNKS_TABLE: &str = "chunks";

fn vector_field(dim: usize) -> Field {
	Field::new("vector", DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), dim as i32), true)
}

/// Serving table: one row per embedded chunk.
pub fn build_chunk_schema(dim: usize) -> Arc<Schema> {
	Arc::new(Schema::new(vec![
		Field::new("chunk_id", DataType::Utf8, false),
		Field::new("file_path", DataType::Utf8, false),
		Field::new("content_hash", DataType::Utf8, false),
		vector_field(dim),
	]))
}

/// Shared embedding cache keyed by `(content_hash, embedder_id)`.
pub fn build_cache_schema(dim: usize) -> Arc<Schema> {
	Arc::new(Schema::new(vec![
		Field::new("content_hash", DataType::Utf8, false),
		Field::new("embedder_id", DataType::Utf8, false),
		Field::new("created_at", DataType::Timestamp(TimeUnit::Millisecond, None), false),
		vector_field(dim),
	]))
}

pub fn vectors_array(vectors: &[Vec<f32>], dim: usize) -> FixedSizeListArray {
	FixedSizeListArray::from_iter_primitive::<Float32Type, _, _>(
		vectors.iter().map(|v| Some(v.iter().copied().map(Some).collect::<Vec<_>>())),
		dim as i32,
	)
}

/// Dimension of the `vector` column, if the schema has one.
pub fn vector_dim(schema: &Schema) -> Option<usize> {
	match schema.field_with_name("vector").ok()?.data_type() {
		DataType::FixedSizeList(_, n) => Some(*n as usize),
		_ => None,
	}
}
