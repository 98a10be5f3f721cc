//! Pre-flight validation of the merge inputs and rotation of final-table backups.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use finrag_bucket::{BucketStore, ObjectMeta};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{EtlConfig, RetentionPolicy};
use crate::error::Result;

#[derive(Debug, Clone, Serialize)]
pub struct CheckOutcome {
    pub name: &'static str,
    pub target: String,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PreflightReport {
    pub checks: Vec<CheckOutcome>,
}

impl PreflightReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|check| check.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckOutcome> {
        self.checks.iter().filter(|check| !check.passed)
    }
}

/// Result of [`PreflightChecker::archive_existing`]. Deletion problems are reported
/// as warnings instead of aborting the run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ArchiveReport {
    pub archived_as: Option<String>,
    pub deleted: Vec<String>,
    pub warnings: Vec<String>,
}

pub struct PreflightChecker {
    config: Arc<EtlConfig>,
    store: Arc<dyn BucketStore>,
}

impl PreflightChecker {
    pub fn new(config: Arc<EtlConfig>, store: Arc<dyn BucketStore>) -> Self {
        Self { config, store }
    }

    /// Size in MB when the key exists, `None` when it does not.
    pub async fn file_exists(&self, key: &str) -> Result<Option<f64>> {
        let meta = self.store.head_object(key).await?;
        Ok(meta.map(|meta| meta.size_mb()))
    }

    /// Runs every check in order and reports all of them; never fails.
    pub async fn run_checks(&self) -> PreflightReport {
        let mut report = PreflightReport::default();

        report
            .checks
            .push(self.check_exists("historical data", &self.config.historical_key).await);
        report
            .checks
            .push(self.check_exists("incremental data", &self.config.incremental_key).await);

        let probe = match self.store.probe_prefix(&self.config.archive_path).await {
            Ok(()) => CheckOutcome {
                name: "archive permissions",
                target: self.config.archive_path.clone(),
                passed: true,
                detail: "listable".to_string(),
            },
            Err(err) => CheckOutcome {
                name: "archive permissions",
                target: self.config.archive_path.clone(),
                passed: false,
                detail: err.to_string(),
            },
        };
        report.checks.push(probe);

        for check in &report.checks {
            if check.passed {
                info!(check = check.name, target = %check.target, detail = %check.detail, "Pre-flight check passed");
            } else {
                warn!(check = check.name, target = %check.target, detail = %check.detail, "Pre-flight check failed");
            }
        }

        report
    }

    async fn check_exists(&self, name: &'static str, key: &str) -> CheckOutcome {
        let (passed, detail) = match self.file_exists(key).await {
            Ok(Some(size_mb)) => (true, format!("found ({size_mb:.2} MB)")),
            Ok(None) => (false, "missing".to_string()),
            Err(err) => (false, err.to_string()),
        };
        CheckOutcome {
            name,
            target: key.to_string(),
            passed,
            detail,
        }
    }

    /// Copies the current final table to a timestamped archive key after rotating old
    /// archives. Returns an empty report when there is no final table yet.
    pub async fn archive_existing(&self, now: DateTime<Utc>) -> Result<ArchiveReport> {
        let mut report = ArchiveReport::default();

        let Some(size_mb) = self.file_exists(&self.config.final_key).await? else {
            info!("No existing final table; no backup needed");
            return Ok(report);
        };
        info!(size_mb, "Existing final table found; creating backup");

        self.rotate_archives(&mut report).await;

        let file_name = self.config.archive_pattern.file_name(now);
        let archive_key = self.config.archive_key(&file_name);
        self.store
            .copy_object(&self.config.final_key, &archive_key)
            .await?;
        info!(archive = %archive_key, "Backed up final table");

        report.archived_as = Some(file_name);
        Ok(report)
    }

    async fn rotate_archives(&self, report: &mut ArchiveReport) {
        let listed = match self.store.list_prefix(&self.config.archive_list_prefix()).await {
            Ok(listed) => listed,
            Err(err) => {
                let message = format!("archive cleanup skipped: {err}");
                warn!("{message}");
                report.warnings.push(message);
                return;
            }
        };

        let mut archives: Vec<ObjectMeta> = listed
            .into_iter()
            .filter(|meta| self.is_archive(&meta.key))
            .collect();
        archives.sort_by(|a, b| a.key.cmp(&b.key));

        let to_delete = archives_to_delete(
            archives.len(),
            self.config.max_backups,
            self.config.retention_policy,
        );
        if to_delete == 0 {
            return;
        }

        info!(count = to_delete, "Deleting old backup(s)");
        for archive in archives.into_iter().take(to_delete) {
            match self.store.delete_object(&archive.key).await {
                Ok(()) => {
                    info!(key = %archive.key, "Deleted backup");
                    report.deleted.push(archive.key);
                }
                Err(err) => {
                    let message = format!("failed to delete backup {}: {err}", archive.key);
                    warn!("{message}");
                    report.warnings.push(message);
                }
            }
        }
    }

    fn is_archive(&self, key: &str) -> bool {
        key.strip_prefix(&self.config.archive_path)
            .and_then(|rest| rest.strip_prefix('/'))
            .is_some_and(|file_name| self.config.archive_pattern.matches(file_name))
    }
}

/// Number of oldest archives to remove before one more is added.
pub fn archives_to_delete(existing: usize, max_backups: usize, policy: RetentionPolicy) -> usize {
    if existing < max_backups {
        return 0;
    }
    match policy {
        RetentionPolicy::ReplaceAll => existing,
        RetentionPolicy::KeepNewest => existing + 1 - max_backups,
    }
}
