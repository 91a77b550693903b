use tracing::{info, instrument};

use crate::error::Result;
use crate::storage::TransactionStore;

/// Read-only warehouse row count for operator confirmation.
///
/// The merge has already committed by the time this runs; callers treat an
/// error here as a warning, never as a run failure.
#[instrument(skip_all)]
pub fn verify<S>(store: &S) -> Result<u64>
where
    S: TransactionStore + ?Sized,
{
    let total = store.count_warehouse()?;
    info!(total, "Verification: warehouse row count");
    Ok(total)
}
