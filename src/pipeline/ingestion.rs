use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use csv::{ReaderBuilder, StringRecord};
use tracing::{info, instrument, warn};

use crate::config::ColumnConfig;
use crate::error::{PipelineError, Result};
use crate::pipeline::transform::check_temporal_columns;
use crate::pipeline::validation::validate;
use crate::storage::TransactionStore;
use crate::types::{Batch, ColumnType};

/// A source file read fully into memory, with the affinity chosen per column.
#[derive(Debug, Clone)]
pub struct RawExtract {
    pub batch: Batch,
    pub types: Vec<ColumnType>,
}

/// Reads the delimited source, validates its header and coerces cells.
///
/// Identifier columns stay text so long card numbers keep every digit.
/// Columns with an empty header (an exported index) are skipped.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn read_source(path: &Path, columns: &ColumnConfig) -> Result<RawExtract> {
    if !path.is_file() {
        return Err(PipelineError::SourceNotFound {
            path: path.to_path_buf(),
        });
    }
    info!("Reading source file");

    let mut reader = ReaderBuilder::new().has_headers(true).from_path(path)?;
    let headers = reader.headers()?.clone();

    let mut keep = Vec::new();
    let mut names = Vec::new();
    let mut seen = HashSet::new();
    for (i, name) in headers.iter().enumerate() {
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        if !seen.insert(name.to_string()) {
            return Err(PipelineError::Parse {
                row: 0,
                column: name.to_string(),
                message: "duplicate column in header".to_string(),
            });
        }
        keep.push(i);
        names.push(name.to_string());
    }

    let header_set: BTreeSet<String> = names.iter().cloned().collect();
    validate(&header_set, &columns.expected)?;
    let extras: Vec<&String> = names
        .iter()
        .filter(|n| !columns.expected.contains(n))
        .collect();
    if !extras.is_empty() {
        warn!(?extras, "Source carries columns outside the expected schema");
    }

    let records = reader
        .records()
        .collect::<std::result::Result<Vec<StringRecord>, csv::Error>>()?;
    info!(rows = records.len(), "Successfully read source rows");

    let types: Vec<ColumnType> = keep
        .iter()
        .zip(&names)
        .map(|(&i, name)| {
            if columns.text.contains(name) || !columns.expected.contains(name) {
                ColumnType::Text
            } else {
                ColumnType::infer_str(records.iter().map(|r| r.get(i).unwrap_or("")))
            }
        })
        .collect();

    let mut batch = Batch::new(names.clone());
    for (row_no, record) in records.iter().enumerate() {
        let row = keep
            .iter()
            .zip(&types)
            .zip(&names)
            .map(|((&i, ty), name)| {
                ty.coerce(record.get(i).unwrap_or("")).map_err(|message| {
                    PipelineError::Parse {
                        row: row_no + 1,
                        column: name.clone(),
                        message,
                    }
                })
            })
            .collect::<Result<Vec<_>>>()?;
        batch.push_row(row)?;
    }

    Ok(RawExtract { batch, types })
}

/// Stage 1: source file into the raw store, replacing the previous snapshot.
///
/// Header validation, cell coercion and the temporal preflight all run
/// before the store is touched.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn ingest<S>(store: &mut S, path: &Path, columns: &ColumnConfig) -> Result<u64>
where
    S: TransactionStore + ?Sized,
{
    let extract = read_source(path, columns)?;
    check_temporal_columns(&extract.batch)?;

    info!(rows = extract.batch.len(), "Writing raw snapshot");
    let written = store.replace_raw(&extract.batch, &extract.types)?;
    info!(rows = written, "Data ingestion complete");
    Ok(written)
}
