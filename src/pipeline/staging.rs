use tracing::{info, instrument};

use crate::error::Result;
use crate::storage::TransactionStore;
use crate::types::{Batch, ColumnType};

/// Stage 4: hands a finished batch to the merger through the staging table.
///
/// Staging is a scratch buffer. Every call erases whatever a previous run
/// left there, so readers must assume it reflects only the latest run.
#[instrument(skip_all, fields(rows = batch.len()))]
pub fn stage_write<S>(store: &mut S, batch: &Batch) -> Result<u64>
where
    S: TransactionStore + ?Sized,
{
    let types: Vec<ColumnType> = (0..batch.columns().len())
        .map(|i| ColumnType::infer(batch.column_values(i)))
        .collect();
    let written = store.replace_staging(batch, &types)?;
    info!(rows = written, "Successfully loaded rows to staging");
    Ok(written)
}
