//! Parquet encoding helpers and small frame utilities shared by the merge steps.

use std::io::Cursor;

use bytes::Bytes;
use polars::io::parquet::write::{ParquetWriter, StatisticsOptions};
use polars::prelude::*;

use crate::config::Compression;
use crate::error::Result;

pub const PARQUET_CONTENT_TYPE: &str = "application/vnd.apache.parquet";

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

pub fn read_parquet(bytes: Bytes) -> Result<DataFrame> {
    let df = ParquetReader::new(Cursor::new(bytes)).finish()?;
    Ok(df)
}

pub fn parquet_bytes(df: &DataFrame, compression: Compression) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    {
        let mut cursor = Cursor::new(&mut buffer);
        let mut clone = df.clone();
        ParquetWriter::new(&mut cursor)
            .with_compression(compression.to_parquet())
            .with_statistics(StatisticsOptions::default())
            .finish(&mut clone)?;
    }
    Ok(buffer)
}

/// Ordered `(name, dtype)` pairs of a frame.
pub fn schema_of(df: &DataFrame) -> Vec<(String, DataType)> {
    df.get_columns()
        .iter()
        .map(|column| (column.name().to_string(), column.dtype().clone()))
        .collect()
}

pub fn column_names(df: &DataFrame) -> Vec<String> {
    df.get_columns()
        .iter()
        .map(|column| column.name().to_string())
        .collect()
}

pub fn estimated_size_mb(df: &DataFrame) -> f64 {
    round2(df.estimated_size() as f64 / BYTES_PER_MB)
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Reads only the first row group slice needed to recover the schema.
pub fn read_parquet_schema(bytes: Bytes) -> Result<Vec<(String, DataType)>> {
    let df = ParquetReader::new(Cursor::new(bytes))
        .with_slice(Some((0, 1)))
        .finish()?;
    Ok(schema_of(&df))
}
