use std::borrow::Cow;
use std::collections::BTreeSet;

use serde::Serialize;

use crate::error::{PipelineError, Result};

pub use rusqlite::types::Value;

/// Storage affinity for a column written to the raw or staging store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
}

impl ColumnType {
    pub fn sql(self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text => "TEXT",
        }
    }

    /// Narrowest type that represents every value in the column.
    pub fn infer<'a, I>(values: I) -> ColumnType
    where
        I: IntoIterator<Item = &'a Value>,
    {
        let mut ty = ColumnType::Integer;
        for v in values {
            match v {
                Value::Null | Value::Integer(_) => {}
                Value::Real(_) => {
                    if ty == ColumnType::Integer {
                        ty = ColumnType::Real;
                    }
                }
                Value::Text(_) | Value::Blob(_) => return ColumnType::Text,
            }
        }
        ty
    }

    /// Same as `infer`, over raw source strings. Blank cells are ignored.
    pub fn infer_str<'a, I>(cells: I) -> ColumnType
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut ty = ColumnType::Integer;
        for cell in cells.into_iter().map(str::trim).filter(|c| !c.is_empty()) {
            if ty == ColumnType::Integer && cell.parse::<i64>().is_ok() {
                continue;
            }
            match cell.parse::<f64>() {
                Ok(f) if f.is_finite() => ty = ColumnType::Real,
                _ => return ColumnType::Text,
            }
        }
        ty
    }

    /// Converts one source cell to this type; blank is NULL.
    pub fn coerce(self, raw: &str) -> std::result::Result<Value, String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(Value::Null);
        }
        match self {
            ColumnType::Integer => trimmed
                .parse::<i64>()
                .map(Value::Integer)
                .map_err(|_| format!("'{}' is not an integer", trimmed)),
            ColumnType::Real => trimmed
                .parse::<f64>()
                .map(Value::Real)
                .map_err(|_| format!("'{}' is not a number", trimmed)),
            ColumnType::Text => Ok(Value::Text(trimmed.to_string())),
        }
    }
}

/// An in-memory tabular batch handed between stages.
///
/// Rows of a raw batch are `RawRecord`s, rows of a transformed batch are
/// `StagingRecord`s; both share this column-oriented header plus row-major cells.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Batch {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Batch {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn from_rows(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Result<Self> {
        let mut batch = Self::new(columns);
        for row in rows {
            batch.push_row(row)?;
        }
        Ok(batch)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Index of a column the caller cannot proceed without.
    pub fn require_column(&self, name: &str) -> Result<usize> {
        self.column_index(name)
            .ok_or_else(|| PipelineError::SchemaValidation {
                missing: BTreeSet::from([name.to_string()]),
            })
    }

    pub fn push_row(&mut self, row: Vec<Value>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(PipelineError::Parse {
                row: self.rows.len() + 1,
                column: String::new(),
                message: format!(
                    "expected {} fields, found {}",
                    self.columns.len(),
                    row.len()
                ),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn column_values(&self, idx: usize) -> impl Iterator<Item = &Value> + '_ {
        self.rows.iter().map(move |r| &r[idx])
    }

    /// Appends a column; `values` must hold one entry per row.
    pub fn add_column(&mut self, name: &str, values: Vec<Value>) -> Result<()> {
        if values.len() != self.rows.len() {
            return Err(PipelineError::Parse {
                row: 0,
                column: name.to_string(),
                message: format!(
                    "derived column has {} values for {} rows",
                    values.len(),
                    self.rows.len()
                ),
            });
        }
        self.columns.push(name.to_string());
        for (row, v) in self.rows.iter_mut().zip(values) {
            row.push(v);
        }
        Ok(())
    }

    pub fn replace_column(&mut self, idx: usize, values: Vec<Value>) {
        for (row, v) in self.rows.iter_mut().zip(values) {
            row[idx] = v;
        }
    }

    /// Removes the named columns; names not present are ignored.
    pub fn drop_columns<S: AsRef<str>>(&mut self, names: &[S]) {
        let keep: Vec<bool> = self
            .columns
            .iter()
            .map(|c| !names.iter().any(|n| n.as_ref() == c))
            .collect();
        if keep.iter().all(|k| *k) {
            return;
        }
        self.columns = retain_flagged(std::mem::take(&mut self.columns), &keep);
        for row in &mut self.rows {
            *row = retain_flagged(std::mem::take(row), &keep);
        }
    }
}

fn retain_flagged<T>(items: Vec<T>, keep: &[bool]) -> Vec<T> {
    items
        .into_iter()
        .zip(keep)
        .filter_map(|(item, k)| k.then_some(item))
        .collect()
}

/// Text form of a cell, as used for labels and key components.
pub fn value_text(v: &Value) -> Option<Cow<'_, str>> {
    match v {
        Value::Null => None,
        Value::Integer(i) => Some(Cow::Owned(i.to_string())),
        Value::Real(f) => Some(Cow::Owned(f.to_string())),
        Value::Text(s) => Some(Cow::Borrowed(s.as_str())),
        Value::Blob(b) => Some(String::from_utf8_lossy(b)),
    }
}
