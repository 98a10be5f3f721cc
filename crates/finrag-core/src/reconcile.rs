//! Aligns an incremental batch with the schema of the base table before concatenation.

use std::collections::HashSet;

use md5::{Digest, Md5};
use once_cell::sync::Lazy;
use polars::prelude::*;
use tracing::info;

use crate::config::ColumnNames;
use crate::error::{EtlError, Result};

/// Incremental column renamed onto its canonical base name.
#[derive(Debug, Clone, Copy)]
pub struct ColumnRename {
    pub from: &'static str,
    pub to: &'static str,
    /// Drop a pre-existing `to` column instead of failing on the name clash.
    pub replaces_existing: bool,
}

pub const COLUMN_RENAMES: &[ColumnRename] = &[
    ColumnRename {
        from: "SIC",
        to: "sic",
        replaces_existing: false,
    },
    ColumnRename {
        from: "section_item",
        to: "section_name",
        replaces_existing: true,
    },
];

/// Positional columns the canonical schema does not carry.
pub const DROPPED_COLUMNS: &[&str] = &["sentence_index"];

pub const CIK_INT_COLUMN: &str = "cik_int";
pub const ROW_HASH_COLUMN: &str = "row_hash";
pub const TEXT_FLAG_COLUMNS: &[&str] = &["has_numbers", "has_comparison", "likely_kpi"];
pub const TICKERS_COLUMN: &str = "tickers";

/// Columns that may be missing on either side because they are computed during the merge.
pub static DERIVED_COLUMNS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    let mut columns: HashSet<&'static str> = HashSet::new();
    columns.insert(CIK_INT_COLUMN);
    columns.insert(ROW_HASH_COLUMN);
    columns.insert(TICKERS_COLUMN);
    columns.extend(TEXT_FLAG_COLUMNS.iter().copied());
    columns.extend(DROPPED_COLUMNS.iter().copied());
    columns
});

pub fn rename_target(column: &str) -> Option<&'static str> {
    COLUMN_RENAMES
        .iter()
        .find(|rename| rename.from == column)
        .map(|rename| rename.to)
}

/// Output of [`align_incremental`]: the aligned frame and the steps that changed it.
#[derive(Debug)]
pub struct Alignment {
    pub frame: DataFrame,
    pub actions: Vec<String>,
}

/// Renames, drops, normalizes and derives incremental columns, then selects them in the
/// base column order. Fails when a base column cannot be produced or cast.
pub fn align_incremental(
    incremental: DataFrame,
    base_schema: &[(String, DataType)],
    columns: &ColumnNames,
) -> Result<Alignment> {
    let mut actions = Vec::new();

    let df = apply_renames(incremental, &mut actions)?;
    let df = drop_unsupported(df, &mut actions)?;
    let df = normalize_datetimes(df, &mut actions)?;
    let df = add_derived_columns(df, columns, &mut actions)?;
    let frame = reorder_to_base(df, base_schema, &mut actions)?;

    for action in &actions {
        info!(action = action.as_str(), "Aligned incremental schema");
    }

    Ok(Alignment { frame, actions })
}

fn has_column(df: &DataFrame, name: &str) -> bool {
    df.get_column_index(name).is_some()
}

fn apply_renames(mut df: DataFrame, actions: &mut Vec<String>) -> Result<DataFrame> {
    for rename in COLUMN_RENAMES {
        if !has_column(&df, rename.from) {
            continue;
        }

        if has_column(&df, rename.to) {
            if !rename.replaces_existing {
                return Err(EtlError::Transform(format!(
                    "cannot rename {} to {}: both columns are present",
                    rename.from, rename.to
                )));
            }
            df = df.drop(rename.to)?;
            actions.push(format!("dropped existing {} ({} is canonical)", rename.to, rename.from));
        }

        df.rename(rename.from, rename.to.into())?;
        actions.push(format!("renamed {} -> {}", rename.from, rename.to));
    }
    Ok(df)
}

fn drop_unsupported(mut df: DataFrame, actions: &mut Vec<String>) -> Result<DataFrame> {
    for &name in DROPPED_COLUMNS {
        if has_column(&df, name) {
            df = df.drop(name)?;
            actions.push(format!("dropped {name} (not in base schema)"));
        }
    }
    Ok(df)
}

/// Nanosecond timestamps become microsecond timestamps tagged as UTC.
fn normalize_datetimes(mut df: DataFrame, actions: &mut Vec<String>) -> Result<DataFrame> {
    let targets: Vec<PlSmallStr> = df
        .get_columns()
        .iter()
        .filter(|column| matches!(column.dtype(), DataType::Datetime(TimeUnit::Nanoseconds, _)))
        .map(|column| column.name().clone())
        .collect();

    for name in targets {
        let series = {
            let column = df.column(name.as_str())?;
            let physical = column.as_materialized_series().to_physical_repr();
            let micros: Int64Chunked = physical
                .i64()?
                .into_iter()
                .map(|value| value.map(|nanos| nanos.div_euclid(1_000)))
                .collect();
            micros
                .into_series()
                .with_name(name.clone())
                .cast(&DataType::Datetime(
                    TimeUnit::Microseconds,
                    Some(TimeZone::UTC),
                ))?
        };
        df.with_column(series)?;
        actions.push(format!("normalized {name} to datetime[us, UTC]"));
    }

    Ok(df)
}

fn add_derived_columns(
    mut df: DataFrame,
    columns: &ColumnNames,
    actions: &mut Vec<String>,
) -> Result<DataFrame> {
    let height = df.height();

    let cik_int = required_column(&df, &columns.entity_id)?
        .as_materialized_series()
        .strict_cast(&DataType::Int32)
        .map_err(|err| {
            EtlError::Transform(format!(
                "cannot cast {} to Int32 for {CIK_INT_COLUMN}: {err}",
                columns.entity_id
            ))
        })?
        .with_name(CIK_INT_COLUMN.into());

    let row_hash = {
        let keys = required_column(&df, &columns.primary_key)?.cast(&DataType::String)?;
        let text = required_column(&df, &columns.text)?.cast(&DataType::String)?;
        let hashes: StringChunked = keys
            .str()?
            .into_iter()
            .zip(text.str()?.into_iter())
            .map(|(key, sentence)| match (key, sentence) {
                (Some(key), Some(sentence)) => Some(row_hash(key, sentence)),
                _ => None,
            })
            .collect();
        hashes.into_series().with_name(ROW_HASH_COLUMN.into())
    };

    df.with_column(cik_int)?;
    df.with_column(row_hash)?;
    for &flag in TEXT_FLAG_COLUMNS {
        df.with_column(Series::full_null(flag.into(), height, &DataType::Boolean))?;
    }
    df.with_column(Series::full_null(
        TICKERS_COLUMN.into(),
        height,
        &DataType::List(Box::new(DataType::String)),
    ))?;

    actions.push(format!(
        "derived {CIK_INT_COLUMN}, {ROW_HASH_COLUMN}, {}, {TICKERS_COLUMN}",
        TEXT_FLAG_COLUMNS.join(", ")
    ));
    Ok(df)
}

fn reorder_to_base(
    df: DataFrame,
    base_schema: &[(String, DataType)],
    actions: &mut Vec<String>,
) -> Result<DataFrame> {
    let missing: Vec<&str> = base_schema
        .iter()
        .map(|(name, _)| name.as_str())
        .filter(|name| !has_column(&df, name))
        .collect();
    if !missing.is_empty() {
        return Err(EtlError::Transform(format!(
            "incremental data is missing base columns: {}",
            missing.join(", ")
        )));
    }

    let mut aligned = df.select(base_schema.iter().map(|(name, _)| name.as_str()))?;

    for (name, dtype) in base_schema {
        let cast = {
            let column = aligned.column(name.as_str())?;
            if column.dtype() == dtype {
                None
            } else {
                let from = column.dtype().clone();
                let series = column
                    .as_materialized_series()
                    .strict_cast(dtype)
                    .map_err(|err| {
                        EtlError::Transform(format!(
                            "cannot cast {name} from {from} to base type {dtype}: {err}"
                        ))
                    })?;
                actions.push(format!("cast {name} from {from} to {dtype}"));
                Some(series)
            }
        };
        if let Some(series) = cast {
            aligned.with_column(series)?;
        }
    }

    actions.push(format!("reordered to {} base columns", base_schema.len()));
    Ok(aligned)
}

fn required_column<'a>(df: &'a DataFrame, name: &str) -> Result<&'a Column> {
    df.column(name).map_err(|_| {
        EtlError::Transform(format!("incremental data has no {name} column"))
    })
}

/// Hex MD5 of the primary key followed by the sentence text.
pub fn row_hash(key: &str, sentence: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(key.as_bytes());
    hasher.update(sentence.as_bytes());
    format!("{:x}", hasher.finalize())
}
