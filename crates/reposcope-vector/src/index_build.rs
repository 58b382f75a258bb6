//! IVF-PQ index build over the serving table.

use anyhow::Result;
use lancedb::index::vector::IvfPqIndexBuilder;
use lancedb::index::Index;
use lancedb::{DistanceType, Table};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IvfPqParams {
    pub nlist: usize,
    pub m: usize,
}

/// Partitions grow with `sqrt(rows)`; sub-vectors always divide `dim`.
pub fn compute_ivfpq_params(rows: usize, dim: usize) -> IvfPqParams {
    let nlist = ((rows as f64).sqrt() as usize).clamp(1, 4096);
    let cap = if dim >= 1024 { 32 } else { 16 };
    let m = (1..=cap.min(dim)).rev().find(|m| dim % m == 0).unwrap_or(1);
    IvfPqParams { nlist, m }
}

pub async fn build_ivfpq_index(table: &Table, params: IvfPqParams) -> Result<()> {
    table
        .create_index(
            &["vector"],
            Index::IvfPq(
                IvfPqIndexBuilder::default()
                    .distance_type(DistanceType::Cosine)
                    .num_partitions(params.nlist as u32)
                    .num_sub_vectors(params.m as u32),
            ),
        )
        .execute()
        .await?;
    Ok(())
}

/// Builds the ANN index when the table is large enough. A failed build only
/// costs speed: search falls back to an exact scan.
pub async fn maybe_build_ann(table: &Table, rows: usize, dim: usize, min_rows: usize) -> bool {
    if rows < min_rows || min_rows == 0 {
        return false;
    }
    let params = compute_ivfpq_params(rows, dim);
    match build_ivfpq_index(table, params).await {
        Ok(()) => {
            info!(rows, nlist = params.nlist, m = params.m, "IVF-PQ index built");
            true
        }
        Err(e) => {
            warn!(rows, error = %e, "IVF-PQ index build failed, using exact search");
            false
        }
    }
}
