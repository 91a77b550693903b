use std::collections::BTreeSet;

use crate::error::{PipelineError, Result};

/// Checks that every expected column is present. Extra columns are fine.
///
/// Pure: runs before any write so a failing batch never touches a store.
pub fn validate<S1, S2>(columns: &BTreeSet<S1>, expected: &[S2]) -> Result<()>
where
    S1: AsRef<str> + Ord,
    S2: AsRef<str>,
{
    let missing: BTreeSet<String> = expected
        .iter()
        .map(AsRef::as_ref)
        .filter(|name| !columns.iter().any(|c| c.as_ref() == *name))
        .map(str::to_string)
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::SchemaValidation { missing })
    }
}
