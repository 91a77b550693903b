use tracing::{info, instrument, warn};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::storage::{MergeOutcome, MergeRequest, TransactionStore};

/// Stage 5: moves staging rows into the warehouse.
///
/// Rows whose natural key is already in the warehouse are skipped, so
/// rerunning the same extract adds nothing. The whole merge commits or
/// rolls back as one transaction.
///
/// `expected_staged` is the row count this run wrote to staging; when set,
/// the staging table must still hold exactly that many rows.
#[instrument(skip_all, fields(run_id = %run_id))]
pub fn merge<S>(
    store: &mut S,
    config: &PipelineConfig,
    run_id: &str,
    expected_staged: Option<u64>,
) -> Result<MergeOutcome>
where
    S: TransactionStore + ?Sized,
{
    info!(
        staging = %config.tables.staging,
        warehouse = %config.tables.warehouse,
        "Starting merge"
    );

    let staged = store.staging_count()?.ok_or_else(|| {
        PipelineError::StageInputMissing(format!(
            "staging table '{}' has not been written",
            config.tables.staging
        ))
    })?;
    if let Some(expected) = expected_staged {
        if staged != expected {
            return Err(PipelineError::StageInputMissing(format!(
                "staging holds {} rows but this run staged {}",
                staged, expected
            )));
        }
    }

    let column_types = config.columns.warehouse_types();
    let request = MergeRequest {
        columns: &config.columns.warehouse,
        column_types: &column_types,
        run_id,
        missing_key_policy: config.merge.missing_key_policy,
    };
    let outcome = store.merge_staging(&request)?;

    if outcome.skipped_unkeyed > 0 {
        warn!(
            rows = outcome.skipped_unkeyed,
            "Skipped staging rows without a natural key"
        );
    }
    info!(
        inserted = outcome.inserted,
        skipped_duplicates = outcome.skipped_duplicates,
        "Merge completed, {} rows inserted into warehouse",
        outcome.inserted
    );
    Ok(outcome)
}
