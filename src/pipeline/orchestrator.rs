use std::fmt;
use std::time::Instant;

use chrono::{Local, NaiveDate};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, info_span, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::metrics::PipelineMetrics;
use crate::pipeline::encode::{CategoricalEncoder, EncodingTable};
use crate::pipeline::ingestion::ingest;
use crate::pipeline::merge::merge;
use crate::pipeline::staging::stage_write;
use crate::pipeline::transform::Transformer;
use crate::pipeline::verify::verify;
use crate::storage::TransactionStore;
use crate::types::Batch;

/// Where a run is. Stages only move forward, one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Idle,
    Ingesting,
    Fetching,
    Transforming,
    Staging,
    Merging,
    Verifying,
    Done,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::Ingesting => "ingesting",
            Stage::Fetching => "fetching",
            Stage::Transforming => "transforming",
            Stage::Staging => "staging",
            Stage::Merging => "merging",
            Stage::Verifying => "verifying",
            Stage::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Active(Stage),
    Failed { stage: Stage, reason: String },
}

/// Row counts observed at each completed stage.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub ingested: Option<u64>,
    pub fetched: Option<u64>,
    pub transformed: Option<u64>,
    pub staged: Option<u64>,
    pub merged: Option<u64>,
    pub skipped_duplicates: Option<u64>,
    pub skipped_unkeyed: Option<u64>,
    pub warehouse_total: Option<u64>,
    /// Operator-facing verification line, e.g. "... 5 (0 new rows)".
    pub verification: Option<String>,
    /// False unless label codes come from the persisted mapping.
    pub stable_encodings: bool,
    pub warnings: Vec<String>,
}

#[derive(Debug, Error)]
#[error("stage {stage} failed: {error}")]
pub struct StageFailure {
    pub stage: Stage,
    pub error: PipelineError,
    /// Counts from the stages that completed before the failure.
    pub summary: Box<RunSummary>,
}

pub type StageResult<T> = std::result::Result<T, StageFailure>;

/// Sequences the stages over one store. Any stage error halts the run at
/// that stage; already-committed raw and staging replacements stay as they are.
pub struct Pipeline<'a, S: TransactionStore + ?Sized> {
    config: &'a PipelineConfig,
    store: &'a mut S,
    run_id: String,
    today: NaiveDate,
    state: RunState,
    summary: RunSummary,
}

impl<'a, S: TransactionStore + ?Sized> Pipeline<'a, S> {
    pub fn new(config: &'a PipelineConfig, store: &'a mut S) -> Self {
        let run_id = Uuid::new_v4().to_string();
        Self {
            config,
            store,
            summary: RunSummary {
                run_id: run_id.clone(),
                stable_encodings: config.encoding.persist,
                ..RunSummary::default()
            },
            run_id,
            today: Local::now().date_naive(),
            state: RunState::Active(Stage::Idle),
        }
    }

    /// Pins the date ages are computed against.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Full pipeline: ingest, fetch, transform, stage, merge, verify.
    pub fn run(&mut self) -> StageResult<RunSummary> {
        let span = info_span!("etl_run", run_id = %self.run_id);
        let _enter = span.enter();
        info!("Starting ETL pipeline");
        PipelineMetrics::record_run();

        let ingested = self.ingest_step()?;
        let raw = self.fetch_step(Some(ingested))?;
        let (batch, encodings) = self.transform_step(raw)?;
        let staged = self.staging_step(&batch, encodings.as_ref())?;
        self.merge_step(Some(staged))?;
        self.verify_step_non_fatal();

        self.finish()
    }

    /// Stage 1 only.
    pub fn run_ingest(&mut self) -> StageResult<RunSummary> {
        let span = info_span!("etl_ingest", run_id = %self.run_id);
        let _enter = span.enter();
        self.ingest_step()?;
        self.finish()
    }

    /// Raw store through staging, without touching the warehouse.
    pub fn run_transform(&mut self) -> StageResult<RunSummary> {
        let span = info_span!("etl_transform", run_id = %self.run_id);
        let _enter = span.enter();
        let raw = self.fetch_step(None)?;
        let (batch, encodings) = self.transform_step(raw)?;
        self.staging_step(&batch, encodings.as_ref())?;
        self.finish()
    }

    /// Whatever is in staging into the warehouse, then a count.
    pub fn run_merge(&mut self) -> StageResult<RunSummary> {
        let span = info_span!("etl_merge", run_id = %self.run_id);
        let _enter = span.enter();
        self.merge_step(None)?;
        self.verify_step_non_fatal();
        self.finish()
    }

    /// Standalone count; here a failure is the command's failure.
    pub fn run_verify(&mut self) -> StageResult<RunSummary> {
        let total = self.stage(Stage::Verifying, |store, _| verify(&*store), |n| *n)?;
        self.summary.warehouse_total = Some(total);
        PipelineMetrics::record_warehouse_total(total);
        self.finish()
    }

    fn ingest_step(&mut self) -> StageResult<u64> {
        let rows = self.stage(Stage::Ingesting, |store, config| {
            ingest(store, &config.source_path, &config.columns)
        }, |n| *n)?;
        self.summary.ingested = Some(rows);
        Ok(rows)
    }

    fn fetch_step(&mut self, expected: Option<u64>) -> StageResult<Batch> {
        let raw = self.stage(Stage::Fetching, |store, config| {
            let raw = store.fetch_raw(&config.columns.expected)?;
            if let Some(expected) = expected {
                if raw.len() as u64 != expected {
                    return Err(PipelineError::StageInputMissing(format!(
                        "raw store holds {} rows but ingestion wrote {}",
                        raw.len(),
                        expected
                    )));
                }
            }
            info!(rows = raw.len(), "Retrieved rows from raw store");
            Ok(raw)
        }, |raw| raw.len() as u64)?;
        self.summary.fetched = Some(raw.len() as u64);
        Ok(raw)
    }

    fn transform_step(&mut self, raw: Batch) -> StageResult<(Batch, Option<EncodingTable>)> {
        let today = self.today;
        let (batch, encodings) = self.stage(Stage::Transforming, move |store, config| {
            let wrangled = Transformer::new(config, today).wrangle(raw)?;

            let mut encoder = if config.encoding.persist {
                CategoricalEncoder::persistent(&config.columns.encode, store.load_encodings()?)
            } else {
                info!(
                    "Label codes are assigned per run and are not comparable across runs; \
                     set encoding.persist for stable codes"
                );
                CategoricalEncoder::per_batch(&config.columns.encode)
            };
            let encoded = encoder.encode(wrangled)?;
            let mappings = encoder.is_persistent().then(|| encoder.mappings().clone());
            Ok((encoded, mappings))
        }, |(batch, _)| batch.len() as u64)?;
        self.summary.transformed = Some(batch.len() as u64);
        Ok((batch, encodings))
    }

    fn staging_step(
        &mut self,
        batch: &Batch,
        encodings: Option<&EncodingTable>,
    ) -> StageResult<u64> {
        let rows = self.stage(Stage::Staging, |store, _| {
            let rows = stage_write(store, batch)?;
            if let Some(encodings) = encodings {
                store.save_encodings(encodings)?;
            }
            Ok(rows)
        }, |n| *n)?;
        self.summary.staged = Some(rows);
        Ok(rows)
    }

    fn merge_step(&mut self, expected_staged: Option<u64>) -> StageResult<u64> {
        let run_id = self.run_id.clone();
        let outcome = self.stage(Stage::Merging, |store, config| {
            merge(store, config, &run_id, expected_staged)
        }, |outcome| outcome.inserted)?;
        PipelineMetrics::record_merge(&outcome);
        self.summary.merged = Some(outcome.inserted);
        self.summary.skipped_duplicates = Some(outcome.skipped_duplicates);
        self.summary.skipped_unkeyed = Some(outcome.skipped_unkeyed);
        if outcome.skipped_unkeyed > 0 {
            self.summary.warnings.push(format!(
                "{} staging rows had no natural key and were skipped",
                outcome.skipped_unkeyed
            ));
        }
        Ok(outcome.inserted)
    }

    /// The merge has committed by now, so a failed count only warns.
    fn verify_step_non_fatal(&mut self) {
        self.state = RunState::Active(Stage::Verifying);
        info!(stage = %Stage::Verifying, "[STEP 6] Verifying warehouse");
        match verify(&*self.store) {
            Ok(total) => {
                let new_rows = self.summary.merged.unwrap_or(0);
                let message = format!(
                    "Verification: total rows in {}: {} ({} new rows)",
                    self.config.tables.warehouse, total, new_rows
                );
                info!(total, new_rows, "{}", message);
                PipelineMetrics::record_warehouse_total(total);
                self.summary.warehouse_total = Some(total);
                self.summary.verification = Some(message);
            }
            Err(e) => {
                warn!(error = %e, "Verification failed");
                PipelineMetrics::record_verification_warning();
                self.summary
                    .warnings
                    .push(format!("verification failed: {}", e));
            }
        }
    }

    fn stage<T, F>(&mut self, stage: Stage, f: F, rows_of: fn(&T) -> u64) -> StageResult<T>
    where
        F: FnOnce(&mut S, &PipelineConfig) -> Result<T>,
    {
        self.state = RunState::Active(stage);
        info!(stage = %stage, "[STEP {}] {}", step_number(stage), describe(stage));
        let started = Instant::now();

        match f(&mut *self.store, self.config) {
            Ok(value) => {
                PipelineMetrics::record_stage(
                    stage.as_str(),
                    rows_of(&value),
                    started.elapsed().as_secs_f64(),
                );
                Ok(value)
            }
            Err(error) => {
                error!(stage = %stage, error = %error, "Stage failed, halting run");
                PipelineMetrics::record_failure(stage.as_str());
                self.state = RunState::Failed {
                    stage,
                    reason: error.to_string(),
                };
                Err(StageFailure {
                    stage,
                    error,
                    summary: Box::new(self.summary.clone()),
                })
            }
        }
    }

    fn finish(&mut self) -> StageResult<RunSummary> {
        self.state = RunState::Active(Stage::Done);
        info!(run_id = %self.run_id, "ETL pipeline complete");
        Ok(self.summary.clone())
    }
}

fn step_number(stage: Stage) -> u8 {
    match stage {
        Stage::Idle => 0,
        Stage::Ingesting => 1,
        Stage::Fetching => 2,
        Stage::Transforming => 3,
        Stage::Staging => 4,
        Stage::Merging => 5,
        Stage::Verifying => 6,
        Stage::Done => 7,
    }
}

fn describe(stage: Stage) -> &'static str {
    match stage {
        Stage::Idle => "Idle",
        Stage::Ingesting => "Ingesting source file into raw store",
        Stage::Fetching => "Fetching raw rows for processing",
        Stage::Transforming => "Wrangling and encoding",
        Stage::Staging => "Loading processed rows into staging",
        Stage::Merging => "Merging staging into warehouse",
        Stage::Verifying => "Verifying warehouse",
        Stage::Done => "Done",
    }
}
