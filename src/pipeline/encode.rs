//! Label encoding for categorical columns.
//!
//! Per-batch mode (the default) assigns codes from the labels present in the
//! current batch only: sorted distinct labels get `0..n`. Codes are consistent
//! within a run but the same label can get a different code in another run.
//! Persistent mode loads a versioned mapping, appends unseen labels with the
//! next free codes, and hands the extended mapping back for saving, so codes
//! stay stable across runs.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::error::Result;
use crate::types::{value_text, Batch, Value};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelMapping {
    pub version: u32,
    pub codes: BTreeMap<String, i64>,
}

/// Column name to its label mapping.
pub type EncodingTable = BTreeMap<String, LabelMapping>;

impl LabelMapping {
    /// Dense codes over the sorted distinct labels.
    pub fn fit<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut mapping = Self::default();
        mapping.extend(labels);
        mapping
    }

    /// Adds unseen labels after the current highest code. Returns whether
    /// anything was added; the version is bumped when it was.
    pub fn extend<I, S>(&mut self, labels: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let unseen: BTreeSet<String> = labels
            .into_iter()
            .map(Into::into)
            .filter(|l| !self.codes.contains_key(l))
            .collect();
        if unseen.is_empty() {
            return false;
        }
        let mut next = self.codes.values().max().map_or(0, |m| m + 1);
        for label in unseen {
            self.codes.insert(label, next);
            next += 1;
        }
        self.version += 1;
        true
    }

    pub fn code(&self, label: &str) -> Option<i64> {
        self.codes.get(label).copied()
    }
}

pub struct CategoricalEncoder {
    columns: Vec<String>,
    mappings: EncodingTable,
    persistent: bool,
}

impl CategoricalEncoder {
    pub fn per_batch(columns: &[String]) -> Self {
        Self {
            columns: columns.to_vec(),
            mappings: EncodingTable::new(),
            persistent: false,
        }
    }

    pub fn persistent(columns: &[String], existing: EncodingTable) -> Self {
        Self {
            columns: columns.to_vec(),
            mappings: existing,
            persistent: true,
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn mappings(&self) -> &EncodingTable {
        &self.mappings
    }

    #[instrument(skip(self, batch), fields(rows = batch.len(), persistent = self.persistent))]
    pub fn encode(&mut self, mut batch: Batch) -> Result<Batch> {
        info!("Starting label encoding");
        for column in &self.columns {
            let idx = batch.require_column(column)?;
            let labels: Vec<String> = batch.column_values(idx).map(label_of).collect();

            let mapping = self.mappings.entry(column.clone()).or_default();
            if !self.persistent {
                *mapping = LabelMapping::fit(labels.iter().cloned());
            } else if mapping.extend(labels.iter().cloned()) {
                debug!(column = %column, version = mapping.version, "Extended label mapping");
            }

            // Every label in the batch was fitted above.
            let codes = labels
                .iter()
                .map(|l| Value::Integer(mapping.code(l).unwrap_or_default()))
                .collect();
            batch.replace_column(idx, codes);
            debug!(column = %column, distinct = mapping.codes.len(), "Encoded column");
        }
        info!("Label encoding complete");
        Ok(batch)
    }
}

/// Convenience for the per-batch mode.
pub fn encode(batch: Batch, columns: &[String]) -> Result<Batch> {
    CategoricalEncoder::per_batch(columns).encode(batch)
}

fn label_of(v: &Value) -> String {
    value_text(v).map(|c| c.into_owned()).unwrap_or_default()
}
