//! Concatenate, deduplicate, sort and validate the base and incremental tables.

use std::collections::{HashMap, HashSet};

use polars::prelude::*;
use serde::Serialize;

use crate::config::ColumnNames;
use crate::error::{EtlError, Result};
use crate::frames::{column_names, estimated_size_mb};

#[derive(Debug)]
pub struct MergedFrame {
    pub frame: DataFrame,
    pub base_rows: usize,
    pub incremental_rows: usize,
    pub duplicates_removed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergeSummary {
    pub companies: usize,
    pub year_min: Option<i64>,
    pub year_max: Option<i64>,
    pub size_mb: f64,
}

/// Stacks `incremental` under `base`, keeps the last row per primary key and sorts by
/// (report year, primary key) on their native types, nulls first. Both frames must
/// share the same column order and types.
pub fn merge_frames(
    base: &DataFrame,
    incremental: &DataFrame,
    columns: &ColumnNames,
) -> Result<MergedFrame> {
    let base_rows = base.height();
    let incremental_rows = incremental.height();

    let stacked = base.vstack(incremental)?;

    // text form is only used as the identity for deduplication
    let keys_column = stacked.column(&columns.primary_key)?.cast(&DataType::String)?;
    let keys: Vec<Option<&str>> = keys_column.str()?.into_iter().collect();

    let mut last_seen: HashMap<Option<&str>, usize> = HashMap::with_capacity(keys.len());
    for (idx, key) in keys.iter().enumerate() {
        last_seen.insert(*key, idx);
    }

    let mut kept: Vec<usize> = last_seen.into_values().collect();
    kept.sort_unstable();

    let indices = IdxCa::from_vec(
        "row_idx".into(),
        kept.iter().map(|&idx| idx as IdxSize).collect(),
    );
    let frame = stacked
        .take(&indices)?
        .sort(sort_columns(columns), SortMultipleOptions::default())?;
    let duplicates_removed = base_rows + incremental_rows - frame.height();

    Ok(MergedFrame {
        frame,
        base_rows,
        incremental_rows,
        duplicates_removed,
    })
}

fn sort_columns(columns: &ColumnNames) -> [PlSmallStr; 2] {
    [
        PlSmallStr::from(columns.report_year.as_str()),
        PlSmallStr::from(columns.primary_key.as_str()),
    ]
}

/// True when the (year, key) pairs are already in ascending order, nulls first.
fn is_sorted(frame: &DataFrame, columns: &ColumnNames) -> Result<bool> {
    let order = frame.select(sort_columns(columns))?;
    let sorted = order.sort(sort_columns(columns), SortMultipleOptions::default())?;
    Ok(order.equals_missing(&sorted))
}

/// Checks every invariant the published table must satisfy.
pub fn validate_merged(
    merged: &MergedFrame,
    base_columns: &[String],
    columns: &ColumnNames,
) -> Result<()> {
    let frame = &merged.frame;

    if frame.height() > merged.base_rows + merged.incremental_rows {
        return Err(EtlError::Invariant(format!(
            "row count {} exceeds inputs ({} + {})",
            frame.height(),
            merged.base_rows,
            merged.incremental_rows
        )));
    }

    let keys_column = frame.column(&columns.primary_key)?.cast(&DataType::String)?;
    let keys = keys_column.str()?;
    let null_keys = keys.null_count();
    if null_keys > 0 {
        return Err(EtlError::Invariant(format!(
            "{null_keys} null {} values found",
            columns.primary_key
        )));
    }

    let unique_keys = keys.into_iter().collect::<HashSet<_>>().len();
    if unique_keys != frame.height() {
        return Err(EtlError::Invariant(format!(
            "{} duplicate {} values found",
            frame.height() - unique_keys,
            columns.primary_key
        )));
    }

    let actual_columns = column_names(frame);
    if actual_columns != base_columns {
        return Err(EtlError::Invariant(format!(
            "column order {:?} does not match base {:?}",
            actual_columns, base_columns
        )));
    }

    if !is_sorted(frame, columns)? {
        return Err(EtlError::Invariant(format!(
            "rows are not sorted by ({}, {})",
            columns.report_year, columns.primary_key
        )));
    }

    Ok(())
}

pub fn summarize(frame: &DataFrame, columns: &ColumnNames) -> Result<MergeSummary> {
    let companies = match frame.column(&columns.company_name) {
        Ok(column) => column.as_materialized_series().n_unique()?,
        Err(_) => 0,
    };

    let years_column = frame.column(&columns.report_year)?.cast(&DataType::Int64)?;
    let years = years_column.i64()?;

    Ok(MergeSummary {
        companies,
        year_min: years.into_iter().flatten().min(),
        year_max: years.into_iter().flatten().max(),
        size_mb: estimated_size_mb(frame),
    })
}
