use crate::config::MissingKeyPolicy;
use crate::error::Result;
use crate::pipeline::encode::EncodingTable;
use crate::types::{Batch, ColumnType};

pub mod sqlite;

pub use sqlite::SqliteStore;

/// What the merger asks the warehouse to do in one transaction.
#[derive(Debug, Clone)]
pub struct MergeRequest<'a> {
    pub columns: &'a [String],
    /// Declared warehouse type per entry of `columns`, used when the table is created.
    pub column_types: &'a [ColumnType],
    pub run_id: &'a str,
    pub missing_key_policy: MissingKeyPolicy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Rows read from staging.
    pub staged: u64,
    pub inserted: u64,
    /// Keyed rows already present in the warehouse (or repeated within the batch).
    pub skipped_duplicates: u64,
    pub skipped_unkeyed: u64,
}

/// Persistence for the three stores the pipeline moves data through.
///
/// Raw and staging are scratch buffers replaced wholesale on every write;
/// the warehouse only ever grows through `merge_staging`.
pub trait TransactionStore {
    /// Drops and recreates the raw table from `batch` in one transaction.
    fn replace_raw(&mut self, batch: &Batch, types: &[ColumnType]) -> Result<u64>;

    /// Reads `columns` from the raw table. Fails if the table does not exist.
    fn fetch_raw(&self, columns: &[String]) -> Result<Batch>;

    fn replace_staging(&mut self, batch: &Batch, types: &[ColumnType]) -> Result<u64>;

    /// Row count of the staging table, `None` when it has never been written.
    fn staging_count(&self) -> Result<Option<u64>>;

    /// Conflict-aware insert of staging rows into the warehouse, all or nothing.
    fn merge_staging(&mut self, request: &MergeRequest<'_>) -> Result<MergeOutcome>;

    fn count_warehouse(&self) -> Result<u64>;

    fn load_encodings(&self) -> Result<EncodingTable>;

    fn save_encodings(&mut self, encodings: &EncodingTable) -> Result<()>;
}
