use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use tracing::{debug, info, instrument};

use crate::config::PipelineConfig;
use crate::constants::{
    COL_AGE, COL_DOB, COL_RECORD_KEY, COL_TRANS_DAY, COL_TRANS_HOUR, COL_TRANS_MONTH,
    COL_TRANS_TIME, DAYS_PER_YEAR, DOB_FORMATS, TRANS_TIME_FORMAT,
};
use crate::error::{PipelineError, Result};
use crate::idempotency::{compute_record_key, key_component};
use crate::types::{value_text, Batch, Value};

/// Derives time parts, age and the natural key, then drops PII and
/// irrelevant columns. Produces staging-shaped rows; performs no writes.
pub struct Transformer<'a> {
    config: &'a PipelineConfig,
    today: NaiveDate,
}

impl<'a> Transformer<'a> {
    pub fn new(config: &'a PipelineConfig, today: NaiveDate) -> Self {
        Self { config, today }
    }

    #[instrument(skip(self, batch), fields(rows = batch.len()))]
    pub fn wrangle(&self, mut batch: Batch) -> Result<Batch> {
        info!("Starting data wrangling");
        let ts_idx = batch.require_column(COL_TRANS_TIME)?;
        let dob_idx = batch.require_column(COL_DOB)?;
        let key_idx = self
            .config
            .columns
            .key
            .iter()
            .map(|c| batch.require_column(c))
            .collect::<Result<Vec<_>>>()?;

        let n = batch.len();
        let mut months = Vec::with_capacity(n);
        let mut days = Vec::with_capacity(n);
        let mut hours = Vec::with_capacity(n);
        let mut ages = Vec::with_capacity(n);
        let mut keys = Vec::with_capacity(n);
        let mut unkeyed = 0usize;

        // Whole batch parses or the whole batch is rejected.
        for (i, row) in batch.rows().iter().enumerate() {
            let ts = parse_trans_time(i + 1, &row[ts_idx])?;
            let dob = parse_dob(i + 1, &row[dob_idx])?;

            months.push(Value::Integer(ts.month() as i64));
            days.push(Value::Integer(ts.day() as i64));
            hours.push(Value::Integer(ts.hour() as i64));
            ages.push(Value::Integer(calculate_age(dob, self.today)));

            let parts: Vec<Option<String>> =
                key_idx.iter().map(|&k| key_component(&row[k])).collect();
            match compute_record_key(parts.iter().map(|p| p.as_deref())) {
                Some(key) => keys.push(Value::Text(key)),
                None => {
                    unkeyed += 1;
                    keys.push(Value::Null);
                }
            }
        }

        batch.add_column(COL_TRANS_MONTH, months)?;
        batch.add_column(COL_TRANS_DAY, days)?;
        batch.add_column(COL_TRANS_HOUR, hours)?;
        batch.add_column(COL_AGE, ages)?;
        batch.add_column(COL_RECORD_KEY, keys)?;

        batch.drop_columns(&[COL_TRANS_TIME, COL_DOB]);
        batch.drop_columns(&self.config.columns.drop);

        if unkeyed > 0 {
            debug!(unkeyed, "Rows without a complete natural key");
        }
        info!(rows = batch.len(), columns = batch.columns().len(), "Data wrangling complete");
        Ok(batch)
    }
}

/// Parses the transaction timestamp with the single accepted format.
pub fn parse_trans_time(row: usize, value: &Value) -> Result<NaiveDateTime> {
    let text = value_text(value).unwrap_or_default();
    NaiveDateTime::parse_from_str(text.trim(), TRANS_TIME_FORMAT).map_err(|_| {
        PipelineError::TimestampParse {
            row,
            value: text.into_owned(),
            format: TRANS_TIME_FORMAT.to_string(),
        }
    })
}

pub fn parse_dob(row: usize, value: &Value) -> Result<NaiveDate> {
    let text = value_text(value).unwrap_or_default();
    let trimmed = text.trim();
    DOB_FORMATS
        .iter()
        .find_map(|fmt| {
            NaiveDate::parse_from_str(trimmed, fmt)
                .ok()
                .or_else(|| NaiveDateTime::parse_from_str(trimmed, fmt).ok().map(|dt| dt.date()))
        })
        .ok_or_else(|| PipelineError::TimestampParse {
            row,
            value: trimmed.to_string(),
            format: DOB_FORMATS.join(" or "),
        })
}

/// Whole years as `floor(days / 365)`.
///
/// Approximate on purpose: leap days and calendar-month boundaries are ignored,
/// so someone can read a year older shortly before a real birthday.
pub fn calculate_age(birth_date: NaiveDate, today: NaiveDate) -> i64 {
    (today - birth_date).num_days().div_euclid(DAYS_PER_YEAR)
}

/// Runs the timestamp and birth-date parsers over a raw batch without
/// deriving anything, so bad rows are caught before the raw store is written.
pub fn check_temporal_columns(batch: &Batch) -> Result<()> {
    let ts_idx = batch.require_column(COL_TRANS_TIME)?;
    let dob_idx = batch.require_column(COL_DOB)?;
    for (i, row) in batch.rows().iter().enumerate() {
        parse_trans_time(i + 1, &row[ts_idx])?;
        parse_dob(i + 1, &row[dob_idx])?;
    }
    Ok(())
}
