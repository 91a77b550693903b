use std::collections::BTreeSet;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("source file not found: {}", path.display())]
    SourceNotFound { path: PathBuf },

    #[error("missing expected columns: {}", join_set(missing))]
    SchemaValidation { missing: BTreeSet<String> },

    #[error("parse error at row {row}, column '{column}': {message}")]
    Parse {
        row: usize,
        column: String,
        message: String,
    },

    #[error("timestamp parse error at row {row}: '{value}' does not match {format}")]
    TimestampParse {
        row: usize,
        value: String,
        format: String,
    },

    #[error("database connection error: {0}")]
    Connection(String),

    #[error("write to '{table}' failed: {message}")]
    Write { table: String, message: String },

    #[error("read from '{table}' failed: {message}")]
    Read { table: String, message: String },

    #[error("{rows} staging rows have no natural key")]
    MergeKeyUnavailable { rows: u64 },

    #[error("merge rolled back after {inserted} rows: {message}")]
    PartialMerge { inserted: u64, message: String },

    #[error("stage input missing: {0}")]
    StageInputMissing(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn write(table: &str, err: impl std::fmt::Display) -> Self {
        PipelineError::Write {
            table: table.to_string(),
            message: err.to_string(),
        }
    }

    pub fn read(table: &str, err: impl std::fmt::Display) -> Self {
        PipelineError::Read {
            table: table.to_string(),
            message: err.to_string(),
        }
    }
}

fn join_set(set: &BTreeSet<String>) -> String {
    set.iter().cloned().collect::<Vec<_>>().join(", ")
}

pub type Result<T> = std::result::Result<T, PipelineError>;
