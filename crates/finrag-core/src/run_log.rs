//! Append-only CSV history of merge runs, stored next to the final table.

use std::sync::Arc;

use bytes::Bytes;
use finrag_bucket::BucketStore;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{EtlError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeType {
    InitialBootstrap,
    IncrementalUpdate,
    #[default]
    Unknown,
}

/// One row of `merge_history.csv`. Column order is part of the file format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLogRecord {
    pub timestamp: String,
    pub status: RunStatus,
    pub merge_type: MergeType,
    #[serde(default)]
    pub base_rows: u64,
    #[serde(default)]
    pub incr_rows: u64,
    #[serde(default)]
    pub final_rows: u64,
    #[serde(default)]
    pub duplicates_removed: u64,
    #[serde(default)]
    pub companies: u64,
    #[serde(default)]
    pub year_min: i64,
    #[serde(default)]
    pub year_max: i64,
    #[serde(default)]
    pub size_mb: f64,
    #[serde(default)]
    pub duration_sec: f64,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LogOutcome {
    Written { key: String, records: usize },
    Warning { message: String },
}

impl LogOutcome {
    pub fn warning(&self) -> Option<&str> {
        match self {
            LogOutcome::Written { .. } => None,
            LogOutcome::Warning { message } => Some(message),
        }
    }
}

pub struct RunLogger {
    store: Arc<dyn BucketStore>,
    key: String,
}

impl RunLogger {
    pub fn new(store: Arc<dyn BucketStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Reads the whole log, appends `record` and uploads it again. Never fails: any
    /// problem is returned as [`LogOutcome::Warning`]. An existing log that cannot be
    /// read is left untouched.
    pub async fn append(&self, record: &RunLogRecord) -> LogOutcome {
        match self.try_append(record).await {
            Ok(records) => {
                info!(key = %self.key, records, "Run log updated");
                LogOutcome::Written {
                    key: self.key.clone(),
                    records,
                }
            }
            Err(err) => {
                let message = format!("run log {} not updated: {err}", self.key);
                warn!("{message}");
                LogOutcome::Warning { message }
            }
        }
    }

    async fn try_append(&self, record: &RunLogRecord) -> Result<usize> {
        let mut records = match self.store.get_object(&self.key).await {
            Ok(bytes) => parse_log(&bytes)?,
            Err(err) if err.is_not_found() => {
                info!(key = %self.key, "No run log yet; starting a new one");
                Vec::new()
            }
            Err(err) => return Err(err.into()),
        };
        records.push(record.clone());

        let body = render_log(&records)?;
        self.store
            .put_object(&self.key, Bytes::from(body), "text/csv")
            .await?;
        Ok(records.len())
    }
}

pub fn parse_log(bytes: &[u8]) -> Result<Vec<RunLogRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(bytes);
    let mut records = Vec::new();
    for row in reader.deserialize() {
        records.push(row?);
    }
    Ok(records)
}

pub fn render_log(records: &[RunLogRecord]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for record in records {
        writer.serialize(record)?;
    }
    writer
        .into_inner()
        .map_err(|err| EtlError::Io(err.into_error()))
}
