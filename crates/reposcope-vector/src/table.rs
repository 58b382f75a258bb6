//! LanceDB connection and table helpers.

use anyhow::{anyhow, Result};
use arrow_array::cast::AsArray;
use arrow_array::types::Float32Type;
use arrow_array::{Array, FixedSizeListArray, RecordBatch, RecordBatchIterator, StringArray};
use futures::TryStreamExt;
use lancedb::query::ExecutableQuery;
use lancedb::{connect, Connection, Table};
use std::sync::Arc;

pub async fn open_db(uri: &str) -> Result<Connection> {
    Ok(connect(uri).execute().await?)
}

pub async fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    Ok(conn.table_names().execute().await?.iter().any(|n| n == name))
}

/// Opens `name`, creating it empty with `schema` when missing.
pub async fn ensure_table(conn: &Connection, name: &str, schema: Arc<arrow_schema::Schema>) -> Result<Table> {
    if !table_exists(conn, name).await? {
        let iter = RecordBatchIterator::new(vec![].into_iter(), schema.clone());
        conn.create_table(name, Box::new(iter)).execute().await?;
    }
    Ok(conn.open_table(name).execute().await?)
}

pub async fn append(table: &Table, batch: RecordBatch) -> Result<()> {
    let schema = batch.schema();
    let reader = Box::new(RecordBatchIterator::new(vec![Ok(batch)].into_iter(), schema));
    table.add(reader).execute().await?;
    Ok(())
}

pub fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| anyhow!("column '{name}' missing or not utf8"))
}

pub fn vector_at(col: &FixedSizeListArray, i: usize) -> Option<Vec<f32>> {
    if !col.is_valid(i) {
        return None;
    }
    Some(col.value(i).as_primitive::<Float32Type>().values().to_vec())
}

/// Streams every row of `table`, yielding `(key, vector)` for the string column `key_col`.
pub async fn scan_vectors(table: &Table, key_col: &str, mut f: impl FnMut(&RecordBatch, usize, &str, Vec<f32>)) -> Result<()> {
    let mut stream = table.query().execute().await?;
    while let Some(batch) = stream.try_next().await? {
        let keys = string_column(&batch, key_col)?;
        let vectors = batch
            .column_by_name("vector")
            .and_then(|c| c.as_any().downcast_ref::<FixedSizeListArray>())
            .ok_or_else(|| anyhow!("vector column missing"))?;
        for i in 0..batch.num_rows() {
            if let Some(v) = vector_at(vectors, i) {
                f(&batch, i, keys.value(i), v);
            }
        }
    }
    Ok(())
}
