// ETL stages: validate, ingest, transform, encode, stage, merge, verify

pub mod encode;
pub mod ingestion;
pub mod merge;
pub mod orchestrator;
pub mod staging;
pub mod transform;
pub mod validation;
pub mod verify;

pub use orchestrator::{Pipeline, RunState, RunSummary, Stage, StageFailure};
