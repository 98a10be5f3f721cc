//! The merge run: pre-flight, base selection, alignment, merge, validation, publish, log.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use finrag_bucket::BucketStore;
use polars::prelude::DataFrame;
use serde::Serialize;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::config::EtlConfig;
use crate::error::{EtlError, Result};
use crate::frames::{self, column_names, round2, schema_of, PARQUET_CONTENT_TYPE};
use crate::merge::{self, MergeSummary};
use crate::preflight::{ArchiveReport, PreflightChecker, PreflightReport};
use crate::reconcile;
use crate::run_log::{LogOutcome, MergeType, RunLogRecord, RunLogger, RunStatus};

pub const LOG_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Counters gathered while the run progresses; unset values stay at their defaults
/// when a step fails.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStats {
    pub merge_type: MergeType,
    pub base_key: Option<String>,
    pub base_rows: usize,
    pub incr_rows: usize,
    pub final_rows: usize,
    pub duplicates_removed: usize,
    pub summary: MergeSummary,
}

/// Operator-facing summary of a single invocation.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub duration_sec: f64,
    pub preflight: PreflightReport,
    pub archive: Option<ArchiveReport>,
    pub stats: RunStats,
    pub actions: Vec<String>,
    pub error: Option<String>,
    pub log: Option<LogOutcome>,
    pub warnings: Vec<String>,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Success
    }
}

pub struct MergePipeline {
    config: Arc<EtlConfig>,
    store: Arc<dyn BucketStore>,
}

impl MergePipeline {
    pub fn new(config: Arc<EtlConfig>, store: Arc<dyn BucketStore>) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &EtlConfig {
        &self.config
    }

    /// Executes one merge. A failed pre-flight ends the run before any write; every
    /// later failure is captured, logged to the run history and reported as failed.
    pub async fn run(&self) -> RunOutcome {
        let run_id = Uuid::new_v4();
        let span = info_span!("merge_run", %run_id);
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> RunOutcome {
        let started_at = Utc::now();
        let clock = Instant::now();
        info!(bucket = %self.config.bucket, "Starting FinRAG merge");

        let checker = PreflightChecker::new(self.config.clone(), self.store.clone());
        let preflight = checker.run_checks().await;

        let mut outcome = RunOutcome {
            run_id,
            status: RunStatus::Failed,
            started_at,
            duration_sec: 0.0,
            preflight,
            archive: None,
            stats: RunStats::default(),
            actions: Vec::new(),
            error: None,
            log: None,
            warnings: Vec::new(),
        };

        if !outcome.preflight.passed() {
            let failed: Vec<&str> = outcome.preflight.failures().map(|check| check.name).collect();
            let err = EtlError::Preflight(failed.join(", "));
            error!(error = %err, "Pre-flight failed; nothing was changed");
            outcome.error = Some(err.to_string());
            outcome.duration_sec = round2(clock.elapsed().as_secs_f64());
            return outcome;
        }

        match self.execute(&checker, &mut outcome).await {
            Ok(()) => outcome.status = RunStatus::Success,
            Err(err) => {
                error!(error = %err, "Merge failed");
                outcome.error = Some(err.to_string());
            }
        }

        outcome.duration_sec = round2(clock.elapsed().as_secs_f64());

        let record = log_record(&outcome, Utc::now());
        let logger = RunLogger::new(self.store.clone(), self.config.log_key());
        let log = logger.append(&record).await;
        if let Some(message) = log.warning() {
            outcome.warnings.push(message.to_string());
        }
        outcome.log = Some(log);

        if outcome.succeeded() {
            info!(
                merge_type = ?outcome.stats.merge_type,
                final_rows = outcome.stats.final_rows,
                duration_sec = outcome.duration_sec,
                "Merge completed"
            );
        }
        outcome
    }

    async fn execute(&self, checker: &PreflightChecker, outcome: &mut RunOutcome) -> Result<()> {
        let final_size = checker.file_exists(&self.config.final_key).await?;

        if final_size.is_some() {
            let archive = checker.archive_existing(Utc::now()).await?;
            outcome.warnings.extend(archive.warnings.iter().cloned());
            outcome.archive = Some(archive);
        }

        let (base_key, merge_type) = match final_size {
            Some(size_mb) => {
                info!(size_mb, "Final table exists; strategy FINAL + INCREMENTAL");
                (self.config.final_key.clone(), MergeType::IncrementalUpdate)
            }
            None => {
                info!("Final table missing; strategy HISTORICAL + INCREMENTAL (bootstrap)");
                (self.config.historical_key.clone(), MergeType::InitialBootstrap)
            }
        };
        outcome.stats.merge_type = merge_type;
        outcome.stats.base_key = Some(base_key.clone());

        let base = self.load(&base_key).await?;
        outcome.stats.base_rows = base.height();
        let incremental = self.load(&self.config.incremental_key).await?;
        outcome.stats.incr_rows = incremental.height();

        let base_schema = schema_of(&base);
        let alignment =
            reconcile::align_incremental(incremental, &base_schema, &self.config.columns)?;
        outcome.actions = alignment.actions;

        let merged = merge::merge_frames(&base, &alignment.frame, &self.config.columns)?;
        drop(base);
        outcome.stats.duplicates_removed = merged.duplicates_removed;
        outcome.stats.final_rows = merged.frame.height();
        info!(
            duplicates_removed = merged.duplicates_removed,
            final_rows = merged.frame.height(),
            "Deduplicated on primary key"
        );

        let base_columns: Vec<String> = base_schema.into_iter().map(|(name, _)| name).collect();
        merge::validate_merged(&merged, &base_columns, &self.config.columns)?;
        outcome.stats.summary = merge::summarize(&merged.frame, &self.config.columns)?;
        info!("Validation passed");

        self.publish(&merged.frame).await
    }

    async fn load(&self, key: &str) -> Result<DataFrame> {
        info!(key, uri = %self.config.s3_uri(key), "Reading parquet");
        let bytes = self.store.get_object(key).await?;
        let df = frames::read_parquet(bytes)?;
        info!(key, rows = df.height(), columns = column_names(&df).len(), "Loaded");
        Ok(df)
    }

    /// Serializes the whole table first so the final key only ever sees one complete put.
    async fn publish(&self, df: &DataFrame) -> Result<()> {
        let body = frames::parquet_bytes(df, self.config.compression)?;
        let size = body.len();
        self.store
            .put_object(&self.config.final_key, Bytes::from(body), PARQUET_CONTENT_TYPE)
            .await?;
        info!(key = %self.config.final_key, bytes = size, "Final table written");
        Ok(())
    }
}

pub fn log_record(outcome: &RunOutcome, finished_at: DateTime<Utc>) -> RunLogRecord {
    let stats = &outcome.stats;
    RunLogRecord {
        timestamp: finished_at.format(LOG_TIMESTAMP_FORMAT).to_string(),
        status: outcome.status,
        merge_type: stats.merge_type,
        base_rows: stats.base_rows as u64,
        incr_rows: stats.incr_rows as u64,
        final_rows: stats.final_rows as u64,
        duplicates_removed: stats.duplicates_removed as u64,
        companies: stats.summary.companies as u64,
        year_min: stats.summary.year_min.unwrap_or_default(),
        year_max: stats.summary.year_max.unwrap_or_default(),
        size_mb: stats.summary.size_mb,
        duration_sec: outcome.duration_sec,
        error: outcome.error.clone().unwrap_or_default(),
    }
}
