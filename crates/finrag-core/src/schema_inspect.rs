//! Side-by-side comparison of the historical and incremental schemas.
//!
//! Diagnostic only: the merge itself never consults this module. The comparison uses
//! the same rename table and derived-column allow-list as the alignment step, so a
//! compatible verdict here means `align_incremental` can produce the base layout.

use std::collections::{BTreeMap, BTreeSet};

use finrag_bucket::BucketStore;
use polars::prelude::DataType;
use serde::Serialize;
use tracing::info;

use crate::config::EtlConfig;
use crate::error::Result;
use crate::frames;
use crate::reconcile::{rename_target, DERIVED_COLUMNS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnStatus {
    Matched,
    HistoricalOnly,
    IncrementalOnly,
    TypeMismatch,
    DatetimePrecisionMismatch,
}

impl ColumnStatus {
    pub fn label(self) -> &'static str {
        match self {
            ColumnStatus::Matched => "match",
            ColumnStatus::HistoricalOnly => "historical only",
            ColumnStatus::IncrementalOnly => "incremental only",
            ColumnStatus::TypeMismatch => "type mismatch",
            ColumnStatus::DatetimePrecisionMismatch => "datetime precision",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ColumnComparison {
    /// Canonical (historical) column name.
    pub name: String,
    /// Incremental name before renaming, when it differs from `name`.
    pub renamed_from: Option<String>,
    pub historical_type: Option<String>,
    pub incremental_type: Option<String>,
    pub status: ColumnStatus,
    /// Computed during the merge, so absence on one side is expected.
    pub derived: bool,
}

impl ColumnComparison {
    /// Missing non-derived columns and non-datetime type differences block a merge.
    pub fn is_critical(&self) -> bool {
        match self.status {
            ColumnStatus::HistoricalOnly | ColumnStatus::IncrementalOnly => !self.derived,
            ColumnStatus::TypeMismatch => true,
            ColumnStatus::Matched | ColumnStatus::DatetimePrecisionMismatch => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchemaSummary {
    pub matched: usize,
    pub historical_only: usize,
    pub incremental_only: usize,
    pub derived: usize,
    pub type_mismatches: usize,
    pub datetime_mismatches: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaReport {
    pub historical_columns: usize,
    pub incremental_columns: usize,
    pub columns: Vec<ColumnComparison>,
}

impl SchemaReport {
    pub fn summary(&self) -> SchemaSummary {
        let mut summary = SchemaSummary::default();
        for column in &self.columns {
            match column.status {
                ColumnStatus::Matched => summary.matched += 1,
                ColumnStatus::HistoricalOnly | ColumnStatus::IncrementalOnly if column.derived => {
                    summary.derived += 1
                }
                ColumnStatus::HistoricalOnly => summary.historical_only += 1,
                ColumnStatus::IncrementalOnly => summary.incremental_only += 1,
                ColumnStatus::TypeMismatch => summary.type_mismatches += 1,
                ColumnStatus::DatetimePrecisionMismatch => summary.datetime_mismatches += 1,
            }
        }
        summary
    }

    pub fn renames(&self) -> impl Iterator<Item = &ColumnComparison> {
        self.columns
            .iter()
            .filter(|column| column.renamed_from.is_some())
    }

    pub fn critical_issues(&self) -> impl Iterator<Item = &ColumnComparison> {
        self.columns.iter().filter(|column| column.is_critical())
    }

    pub fn compatible(&self) -> bool {
        self.critical_issues().next().is_none()
    }
}

/// Compares the two schemas column by column, in name order, after renaming
/// incremental columns onto their canonical names.
pub fn compare_schemas(
    historical: &[(String, DataType)],
    incremental: &[(String, DataType)],
) -> SchemaReport {
    let hist: BTreeMap<&str, &DataType> = historical
        .iter()
        .map(|(name, dtype)| (name.as_str(), dtype))
        .collect();

    // canonical name -> (incremental name, dtype)
    let mut incr: BTreeMap<&str, (&str, &DataType)> = BTreeMap::new();
    for (name, dtype) in incremental {
        let canonical = rename_target(name).unwrap_or(name.as_str());
        incr.insert(canonical, (name.as_str(), dtype));
    }

    let names: BTreeSet<&str> = hist.keys().chain(incr.keys()).copied().collect();

    let columns = names
        .into_iter()
        .map(|name| {
            let hist_type = hist.get(name).copied();
            let incr_entry = incr.get(name).copied();
            let incr_type = incr_entry.map(|(_, dtype)| dtype);

            let status = match (hist_type, incr_type) {
                (Some(h), Some(i)) => classify_types(h, i),
                (Some(_), None) => ColumnStatus::HistoricalOnly,
                (None, _) => ColumnStatus::IncrementalOnly,
            };

            ColumnComparison {
                name: name.to_string(),
                renamed_from: incr_entry
                    .map(|(original, _)| original)
                    .filter(|original| *original != name)
                    .map(str::to_string),
                historical_type: hist_type.map(ToString::to_string),
                incremental_type: incr_type.map(ToString::to_string),
                status,
                derived: DERIVED_COLUMNS.contains(name),
            }
        })
        .collect();

    SchemaReport {
        historical_columns: historical.len(),
        incremental_columns: incremental.len(),
        columns,
    }
}

fn classify_types(historical: &DataType, incremental: &DataType) -> ColumnStatus {
    if historical == incremental {
        return ColumnStatus::Matched;
    }
    match (historical, incremental) {
        (DataType::Datetime(..), DataType::Datetime(..)) => ColumnStatus::DatetimePrecisionMismatch,
        _ => ColumnStatus::TypeMismatch,
    }
}

/// Fetches both inputs from the bucket and compares their schemas.
pub async fn inspect(store: &dyn BucketStore, config: &EtlConfig) -> Result<SchemaReport> {
    info!(key = %config.historical_key, "Reading historical schema");
    let historical = frames::read_parquet_schema(store.get_object(&config.historical_key).await?)?;
    info!(key = %config.incremental_key, "Reading incremental schema");
    let incremental =
        frames::read_parquet_schema(store.get_object(&config.incremental_key).await?)?;

    let report = compare_schemas(&historical, &incremental);
    info!(
        historical_columns = report.historical_columns,
        incremental_columns = report.incremental_columns,
        compatible = report.compatible(),
        "Schema comparison finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use polars::prelude::{TimeUnit, TimeZone};

    fn schema(columns: &[(&str, DataType)]) -> Vec<(String, DataType)> {
        columns
            .iter()
            .map(|(name, dtype)| (name.to_string(), dtype.clone()))
            .collect()
    }

    fn status_of<'a>(report: &'a SchemaReport, name: &str) -> &'a ColumnComparison {
        report
            .columns
            .iter()
            .find(|column| column.name == name)
            .unwrap()
    }

    #[test]
    fn renamed_columns_match_their_canonical_name() {
        let hist = schema(&[("sic", DataType::String), ("section_name", DataType::String)]);
        let incr = schema(&[("SIC", DataType::String), ("section_item", DataType::String)]);

        let report = compare_schemas(&hist, &incr);

        assert_eq!(report.columns.len(), 2);
        let sic = status_of(&report, "sic");
        assert_eq!(sic.status, ColumnStatus::Matched);
        assert_eq!(sic.renamed_from.as_deref(), Some("SIC"));
        assert_eq!(report.renames().count(), 2);
        assert!(report.compatible());
    }

    #[test]
    fn derived_gaps_do_not_block_the_merge() {
        let hist = schema(&[
            ("sentenceID", DataType::String),
            ("cik_int", DataType::Int32),
            ("row_hash", DataType::String),
        ]);
        let incr = schema(&[
            ("sentenceID", DataType::String),
            ("sentence_index", DataType::Int64),
        ]);

        let report = compare_schemas(&hist, &incr);
        let summary = report.summary();

        assert_eq!(summary.matched, 1);
        assert_eq!(summary.derived, 3);
        assert_eq!(summary.historical_only, 0);
        assert_eq!(summary.incremental_only, 0);
        assert_eq!(
            status_of(&report, "sentence_index").status,
            ColumnStatus::IncrementalOnly
        );
        assert!(report.compatible());
    }

    #[test]
    fn datetime_precision_is_reported_but_not_critical() {
        let hist = schema(&[(
            "filing_date",
            DataType::Datetime(TimeUnit::Microseconds, Some(TimeZone::UTC)),
        )]);
        let incr = schema(&[("filing_date", DataType::Datetime(TimeUnit::Nanoseconds, None))]);

        let report = compare_schemas(&hist, &incr);

        assert_eq!(
            status_of(&report, "filing_date").status,
            ColumnStatus::DatetimePrecisionMismatch
        );
        assert_eq!(report.summary().datetime_mismatches, 1);
        assert!(report.compatible());
    }

    #[test]
    fn missing_business_columns_and_type_changes_are_critical() {
        let hist = schema(&[
            ("report_year", DataType::Int64),
            ("name", DataType::String),
        ]);
        let incr = schema(&[
            ("report_year", DataType::String),
            ("ticker_symbol", DataType::String),
        ]);

        let report = compare_schemas(&hist, &incr);
        let summary = report.summary();

        assert_eq!(summary.type_mismatches, 1);
        assert_eq!(summary.historical_only, 1);
        assert_eq!(summary.incremental_only, 1);
        assert_eq!(report.critical_issues().count(), 3);
        assert!(!report.compatible());
    }
}
