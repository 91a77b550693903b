//! Run metrics for the ETL job.
//!
//! A batch job has nobody scraping it, so the Prometheus recorder is installed
//! without an HTTP listener and the rendered snapshot can be written to a
//! textfile-collector path at the end of the run.

use std::fs;
use std::path::Path;
use std::sync::{Once, OnceLock};

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::{info, warn};

use crate::storage::MergeOutcome;

static INIT: Once = Once::new();
static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the global recorder. Idempotent.
pub fn init_metrics() {
    INIT.call_once(|| match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if HANDLE.set(handle).is_err() {
                warn!("Metrics handle already stored");
            }
            info!("Prometheus recorder installed");
        }
        Err(e) => {
            warn!("Failed to install Prometheus recorder: {}", e);
        }
    });
}

/// Current metrics in Prometheus text format, if the recorder is installed.
pub fn render() -> Option<String> {
    HANDLE.get().map(|h| h.render())
}

pub fn write_snapshot(path: &Path) -> std::io::Result<()> {
    let Some(body) = render() else {
        warn!("Metrics recorder not installed; nothing to write");
        return Ok(());
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    // Write then rename so a collector never reads a half-written file.
    let tmp = path.with_extension("prom.tmp");
    fs::write(&tmp, body)?;
    fs::rename(&tmp, path)?;
    info!(path = %path.display(), "Wrote metrics snapshot");
    Ok(())
}

pub struct PipelineMetrics;

impl PipelineMetrics {
    pub fn record_run() {
        ::metrics::counter!("etl_runs_total").increment(1);
    }

    pub fn record_stage(stage: &'static str, rows: u64, duration_secs: f64) {
        ::metrics::counter!("etl_rows_total", "stage" => stage).increment(rows);
        ::metrics::histogram!("etl_stage_duration_seconds", "stage" => stage).record(duration_secs);
    }

    pub fn record_merge(outcome: &MergeOutcome) {
        ::metrics::counter!("etl_merge_inserted_total").increment(outcome.inserted);
        ::metrics::counter!("etl_merge_skipped_total", "reason" => "duplicate")
            .increment(outcome.skipped_duplicates);
        ::metrics::counter!("etl_merge_skipped_total", "reason" => "unkeyed")
            .increment(outcome.skipped_unkeyed);
    }

    pub fn record_failure(stage: &'static str) {
        ::metrics::counter!("etl_run_failures_total", "stage" => stage).increment(1);
    }

    pub fn record_warehouse_total(total: u64) {
        ::metrics::gauge!("etl_warehouse_rows").set(total as f64);
    }

    pub fn record_verification_warning() {
        ::metrics::counter!("etl_verification_warnings_total").increment(1);
    }
}
