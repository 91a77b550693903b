use std::fs;
use std::time::Duration;

use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{
    params, params_from_iter, Connection, ErrorCode, OptionalExtension, TransactionBehavior,
};
use tracing::{debug, info};

use crate::config::{MissingKeyPolicy, PipelineConfig, TableNames};
use crate::constants::{COL_MERGED_AT, COL_RECORD_KEY, COL_RUN_ID, ENCODINGS_TABLE};
use crate::error::{PipelineError, Result};
use crate::pipeline::encode::{EncodingTable, LabelMapping};
use crate::storage::{MergeOutcome, MergeRequest, TransactionStore};
use crate::types::{Batch, ColumnType};

/// SQLite's default cap on bound parameters per statement.
const MAX_BIND_PARAMS: usize = 32_766;

pub struct SqliteStore {
    conn: Connection,
    tables: TableNames,
    chunk_size: usize,
}

impl SqliteStore {
    pub fn open(config: &PipelineConfig) -> Result<Self> {
        let path = &config.database.path;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(|e| {
            PipelineError::Connection(format!("failed to open '{}': {}", path.display(), e))
        })?;
        info!(path = %path.display(), "Opened warehouse database");
        Self::init(conn, config)
    }

    pub fn open_in_memory(config: &PipelineConfig) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(connection_error)?;
        Self::init(conn, config)
    }

    fn init(conn: Connection, config: &PipelineConfig) -> Result<Self> {
        let mode = &config.database.journal_mode;
        if mode.is_empty() || !mode.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(PipelineError::Config(format!("invalid journal_mode '{}'", mode)));
        }
        conn.busy_timeout(Duration::from_millis(config.database.busy_timeout_ms))
            .map_err(connection_error)?;
        conn.execute_batch(&format!(
            r#"
            PRAGMA journal_mode={mode};
            CREATE TABLE IF NOT EXISTS {enc} (
                column_name TEXT NOT NULL,
                label       TEXT NOT NULL,
                code        INTEGER NOT NULL,
                version     INTEGER NOT NULL,
                PRIMARY KEY (column_name, label)
            );
            "#,
            mode = mode,
            enc = ENCODINGS_TABLE,
        ))
        .map_err(connection_error)?;

        Ok(Self {
            conn,
            tables: config.tables.clone(),
            chunk_size: config.chunk_size,
        })
    }

    /// Creates the warehouse table if absent.
    pub fn ensure_warehouse(&self, columns: &[String], types: &[ColumnType]) -> Result<()> {
        create_warehouse(&self.conn, &self.tables.warehouse, columns, types)
    }

    fn replace_table(&mut self, table: &str, batch: &Batch, types: &[ColumnType]) -> Result<u64> {
        if types.len() != batch.columns().len() {
            return Err(PipelineError::write(
                table,
                format!("{} column types for {} columns", types.len(), batch.columns().len()),
            ));
        }
        let chunk_size = self.chunk_size;
        let tx = self.conn.transaction().map_err(connection_error)?;
        let written = write_replacement(&tx, table, batch, types, chunk_size)
            .map_err(|e| PipelineError::write(table, e))?;
        tx.commit().map_err(|e| PipelineError::write(table, e))?;
        Ok(written)
    }
}

impl TransactionStore for SqliteStore {
    fn replace_raw(&mut self, batch: &Batch, types: &[ColumnType]) -> Result<u64> {
        let table = self.tables.raw.clone();
        self.replace_table(&table, batch, types)
    }

    fn fetch_raw(&self, columns: &[String]) -> Result<Batch> {
        let table = &self.tables.raw;
        if !table_exists(&self.conn, table)? {
            return Err(PipelineError::StageInputMissing(format!(
                "raw table '{}' does not exist",
                table
            )));
        }
        let sql = format!(
            "SELECT {} FROM {} ORDER BY rowid",
            column_list(columns),
            quote(table)
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|e| PipelineError::read(table, e))?;
        let width = columns.len();
        let rows = stmt
            .query_map([], |row| {
                (0..width)
                    .map(|i| row.get::<_, Value>(i))
                    .collect::<rusqlite::Result<Vec<_>>>()
            })
            .map_err(|e| PipelineError::read(table, e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| PipelineError::read(table, e))?;

        Batch::from_rows(columns.to_vec(), rows)
    }

    fn replace_staging(&mut self, batch: &Batch, types: &[ColumnType]) -> Result<u64> {
        let table = self.tables.staging.clone();
        self.replace_table(&table, batch, types)
    }

    fn staging_count(&self) -> Result<Option<u64>> {
        let table = &self.tables.staging;
        if !table_exists(&self.conn, table)? {
            return Ok(None);
        }
        count_rows(&self.conn, table).map(Some)
    }

    fn merge_staging(&mut self, request: &MergeRequest<'_>) -> Result<MergeOutcome> {
        let staging = self.tables.staging.clone();
        let warehouse = self.tables.warehouse.clone();
        let chunk = self.chunk_size.max(1) as i64;

        // IMMEDIATE takes SQLite's single RESERVED write lock up front, so two
        // runs can never interleave merges; the loser waits out busy_timeout.
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(connection_error)?;

        if !table_exists(&tx, &staging)? {
            return Err(PipelineError::StageInputMissing(format!(
                "staging table '{}' does not exist",
                staging
            )));
        }
        create_warehouse(&tx, &warehouse, request.columns, request.column_types)?;

        let (staged, unkeyed): (u64, u64) = tx
            .query_row(
                &format!(
                    "SELECT COUNT(*), COUNT(*) - COUNT({key}) FROM {t}",
                    key = COL_RECORD_KEY,
                    t = quote(&staging)
                ),
                [],
                |r| Ok((r.get::<_, i64>(0)? as u64, r.get::<_, i64>(1)? as u64)),
            )
            .map_err(|e| PipelineError::read(&staging, e))?;

        if unkeyed > 0 && request.missing_key_policy == MissingKeyPolicy::Abort {
            return Err(PipelineError::MergeKeyUnavailable { rows: unkeyed });
        }

        let bounds: (Option<i64>, Option<i64>) = tx
            .query_row(
                &format!("SELECT MIN(rowid), MAX(rowid) FROM {}", quote(&staging)),
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .map_err(|e| PipelineError::read(&staging, e))?;

        let mut inserted = 0u64;
        if let (Some(first), Some(last)) = bounds {
            let cols = column_list(request.columns);
            let sql = format!(
                "INSERT INTO {w} ({cols}, {key}, {run}, {at}) \
                 SELECT {cols}, {key}, ?1, ?2 FROM {s} \
                 WHERE rowid BETWEEN ?3 AND ?4 AND {key} IS NOT NULL \
                 ON CONFLICT({key}) DO NOTHING",
                w = quote(&warehouse),
                s = quote(&staging),
                cols = cols,
                key = COL_RECORD_KEY,
                run = COL_RUN_ID,
                at = COL_MERGED_AT,
            );
            let merged_at = Utc::now().to_rfc3339();
            let mut stmt = tx
                .prepare(&sql)
                .map_err(|e| PipelineError::write(&warehouse, e))?;

            let mut lo = first;
            while lo <= last {
                let hi = lo.saturating_add(chunk - 1).min(last);
                match stmt.execute(params![request.run_id, merged_at, lo, hi]) {
                    Ok(n) => inserted += n as u64,
                    Err(e) => return Err(merge_failure(&warehouse, inserted, e)),
                }
                debug!(lo, hi, inserted, "Merged staging chunk");
                if hi == last {
                    break;
                }
                lo = hi + 1;
            }
        }

        tx.commit()
            .map_err(|e| merge_failure(&warehouse, inserted, e))?;

        let keyed = staged - unkeyed;
        Ok(MergeOutcome {
            staged,
            inserted,
            skipped_duplicates: keyed.saturating_sub(inserted),
            skipped_unkeyed: unkeyed,
        })
    }

    fn count_warehouse(&self) -> Result<u64> {
        let table = &self.tables.warehouse;
        if !table_exists(&self.conn, table)? {
            return Ok(0);
        }
        count_rows(&self.conn, table)
    }

    fn load_encodings(&self) -> Result<EncodingTable> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT column_name, label, code, version FROM {} ORDER BY column_name, code",
                ENCODINGS_TABLE
            ))
            .map_err(|e| PipelineError::read(ENCODINGS_TABLE, e))?;
        let rows = stmt
            .query_map([], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, i64>(3)?,
                ))
            })
            .map_err(|e| PipelineError::read(ENCODINGS_TABLE, e))?;

        let mut table = EncodingTable::new();
        for row in rows {
            let (column, label, code, version) =
                row.map_err(|e| PipelineError::read(ENCODINGS_TABLE, e))?;
            let mapping: &mut LabelMapping = table.entry(column).or_default();
            mapping.version = mapping.version.max(version as u32);
            mapping.codes.insert(label, code);
        }
        Ok(table)
    }

    fn save_encodings(&mut self, encodings: &EncodingTable) -> Result<()> {
        let tx = self.conn.transaction().map_err(connection_error)?;
        {
            let mut delete = tx
                .prepare(&format!("DELETE FROM {} WHERE column_name = ?1", ENCODINGS_TABLE))
                .map_err(|e| PipelineError::write(ENCODINGS_TABLE, e))?;
            let mut insert = tx
                .prepare(&format!(
                    "INSERT INTO {} (column_name, label, code, version) VALUES (?1, ?2, ?3, ?4)",
                    ENCODINGS_TABLE
                ))
                .map_err(|e| PipelineError::write(ENCODINGS_TABLE, e))?;
            for (column, mapping) in encodings {
                delete
                    .execute(params![column])
                    .map_err(|e| PipelineError::write(ENCODINGS_TABLE, e))?;
                for (label, code) in &mapping.codes {
                    insert
                        .execute(params![column, label, code, mapping.version as i64])
                        .map_err(|e| PipelineError::write(ENCODINGS_TABLE, e))?;
                }
            }
        }
        tx.commit()
            .map_err(|e| PipelineError::write(ENCODINGS_TABLE, e))?;
        Ok(())
    }
}

fn write_replacement(
    conn: &Connection,
    table: &str,
    batch: &Batch,
    types: &[ColumnType],
    chunk_size: usize,
) -> rusqlite::Result<u64> {
    let defs = batch
        .columns()
        .iter()
        .zip(types)
        .map(|(c, ty)| format!("{} {}", quote(c), ty.sql()))
        .collect::<Vec<_>>()
        .join(", ");
    conn.execute_batch(&format!(
        "DROP TABLE IF EXISTS {t}; CREATE TABLE {t} ({defs});",
        t = quote(table),
        defs = defs
    ))?;

    let width = batch.columns().len();
    if width == 0 || batch.is_empty() {
        return Ok(0);
    }
    let per_stmt = chunk_size.min(MAX_BIND_PARAMS / width).max(1);
    let cols = column_list(batch.columns());
    let row_slots = format!("({})", vec!["?"; width].join(", "));

    let mut written = 0u64;
    for chunk in batch.rows().chunks(per_stmt) {
        let sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            quote(table),
            cols,
            vec![row_slots.as_str(); chunk.len()].join(", ")
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        written += stmt.execute(params_from_iter(chunk.iter().flatten()))? as u64;
        debug!(table, written, "Wrote chunk");
    }
    Ok(written)
}

fn create_warehouse(
    conn: &Connection,
    warehouse: &str,
    columns: &[String],
    types: &[ColumnType],
) -> Result<()> {
    if types.len() != columns.len() {
        return Err(PipelineError::write(
            warehouse,
            format!("{} column types for {} columns", types.len(), columns.len()),
        ));
    }
    if table_exists(conn, warehouse)? {
        return Ok(());
    }

    // Types are fixed by column name; staging types vary with each batch.
    let defs = columns
        .iter()
        .zip(types)
        .map(|(c, ty)| format!("{} {}", quote(c), ty.sql()))
        .collect::<Vec<_>>()
        .join(",\n    ");
    let ddl = format!(
        "CREATE TABLE IF NOT EXISTS {w} (\n    id INTEGER PRIMARY KEY AUTOINCREMENT,\n    {defs},\n    \
         {key} TEXT NOT NULL UNIQUE,\n    {run} TEXT NOT NULL,\n    {at} TEXT NOT NULL\n);",
        w = quote(warehouse),
        defs = defs,
        key = COL_RECORD_KEY,
        run = COL_RUN_ID,
        at = COL_MERGED_AT,
    );
    conn.execute_batch(&ddl)
        .map_err(|e| PipelineError::write(warehouse, e))?;
    info!(table = %warehouse, "Created warehouse table");
    Ok(())
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![table],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
    .map_err(connection_error)
}

fn count_rows(conn: &Connection, table: &str) -> Result<u64> {
    conn.query_row(&format!("SELECT COUNT(*) FROM {}", quote(table)), [], |r| {
        r.get::<_, i64>(0)
    })
    .map(|n| n as u64)
    .map_err(|e| PipelineError::read(table, e))
}

fn merge_failure(table: &str, inserted: u64, err: rusqlite::Error) -> PipelineError {
    if is_busy(&err) {
        return connection_error(err);
    }
    if inserted > 0 {
        PipelineError::PartialMerge {
            inserted,
            message: err.to_string(),
        }
    } else {
        PipelineError::write(table, err)
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == ErrorCode::DatabaseBusy || f.code == ErrorCode::DatabaseLocked
    )
}

fn connection_error(err: rusqlite::Error) -> PipelineError {
    if is_busy(&err) {
        PipelineError::Connection(format!("warehouse is locked by another writer: {}", err))
    } else {
        PipelineError::Connection(err.to_string())
    }
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn column_list<S: AsRef<str>>(columns: &[S]) -> String {
    columns
        .iter()
        .map(|c| quote(c.as_ref()))
        .collect::<Vec<_>>()
        .join(", ")
}
