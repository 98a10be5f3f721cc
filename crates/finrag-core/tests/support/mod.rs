#![allow(dead_code)]

use std::sync::Arc;

use bytes::Bytes;
use finrag_bucket::MemoryBucketStore;
use finrag_core::config::{Compression, EtlConfig};
use finrag_core::frames;
use polars::prelude::*;

pub const CONFIG_YAML: &str = r#"
s3:
  bucket_name: finrag-test
input:
  historical:
    path: data/historical
    filename: finrag_fact_sentences_historical.parquet
  incremental:
    path: data/incremental
    filename: finrag_fact_sentences_incremental.parquet
output:
  final:
    path: data/final
    filename: finrag_fact_sentences.parquet
    compression: zstd
  archive:
    path: data/archive
    filename_pattern: finrag_fact_sentences_{timestamp}.parquet
    retention:
      max_backups: 1
  logging:
    log_path: logs
"#;

pub const HISTORICAL_KEY: &str = "data/historical/finrag_fact_sentences_historical.parquet";
pub const INCREMENTAL_KEY: &str = "data/incremental/finrag_fact_sentences_incremental.parquet";
pub const FINAL_KEY: &str = "data/final/finrag_fact_sentences.parquet";
pub const LOG_KEY: &str = "logs/merge_history.csv";

/// (sentenceID, cik, company name, report year, sentence)
pub type Row<'a> = (&'a str, &'a str, &'a str, i64, &'a str);

pub fn config() -> Arc<EtlConfig> {
    Arc::new(EtlConfig::from_yaml_str(CONFIG_YAML).unwrap())
}

fn filing_dates(len: usize) -> Vec<i64> {
    // 2024-01-02T03:04:05.123456789Z in nanoseconds, one second apart
    (0..len)
        .map(|i| 1_704_164_645_123_456_789 + i as i64 * 1_000_000_000)
        .collect()
}

/// Frame in the canonical historical layout, derived columns included.
pub fn historical_frame(rows: &[Row]) -> DataFrame {
    let ids: Vec<&str> = rows.iter().map(|r| r.0).collect();
    let ciks: Vec<&str> = rows.iter().map(|r| r.1).collect();
    let names: Vec<&str> = rows.iter().map(|r| r.2).collect();
    let years: Vec<i64> = rows.iter().map(|r| r.3).collect();
    let sentences: Vec<&str> = rows.iter().map(|r| r.4).collect();
    let cik_ints: Vec<i32> = ciks.iter().map(|c| c.parse().unwrap()).collect();
    let hashes: Vec<String> = rows
        .iter()
        .map(|r| finrag_core::reconcile::row_hash(r.0, r.4))
        .collect();
    let micros: Vec<i64> = filing_dates(rows.len())
        .into_iter()
        .map(|nanos| nanos / 1_000)
        .collect();
    let height = rows.len();

    let filing_date = Series::new("filing_date".into(), micros)
        .cast(&DataType::Datetime(TimeUnit::Microseconds, Some(TimeZone::UTC)))
        .unwrap();

    DataFrame::new(vec![
        Series::new("sentenceID".into(), ids).into(),
        Series::new("cik".into(), ciks).into(),
        Series::new("name".into(), names).into(),
        Series::new("report_year".into(), years).into(),
        Series::new("sic".into(), vec!["3571"; height]).into(),
        Series::new("section_name".into(), vec!["Item 7"; height]).into(),
        Series::new("sentence".into(), sentences).into(),
        filing_date.into(),
        Series::new("cik_int".into(), cik_ints).into(),
        Series::new("row_hash".into(), hashes).into(),
        Series::full_null("has_numbers".into(), height, &DataType::Boolean).into(),
        Series::full_null("has_comparison".into(), height, &DataType::Boolean).into(),
        Series::full_null("likely_kpi".into(), height, &DataType::Boolean).into(),
        Series::full_null(
            "tickers".into(),
            height,
            &DataType::List(Box::new(DataType::String)),
        )
        .into(),
    ])
    .unwrap()
}

/// Frame in the layout the incremental extractor produces: upper-case `SIC`,
/// `section_item`, a positional index and nanosecond timestamps without a zone.
pub fn incremental_frame(rows: &[Row]) -> DataFrame {
    let ids: Vec<&str> = rows.iter().map(|r| r.0).collect();
    let ciks: Vec<&str> = rows.iter().map(|r| r.1).collect();
    let names: Vec<&str> = rows.iter().map(|r| r.2).collect();
    let years: Vec<i64> = rows.iter().map(|r| r.3).collect();
    let sentences: Vec<&str> = rows.iter().map(|r| r.4).collect();
    let height = rows.len();

    let filing_date = Series::new("filing_date".into(), filing_dates(height))
        .cast(&DataType::Datetime(TimeUnit::Nanoseconds, None))
        .unwrap();

    DataFrame::new(vec![
        Series::new("sentence_index".into(), (0..height as i64).collect::<Vec<_>>()).into(),
        Series::new("sentence".into(), sentences).into(),
        Series::new("sentenceID".into(), ids).into(),
        Series::new("name".into(), names).into(),
        Series::new("cik".into(), ciks).into(),
        Series::new("report_year".into(), years).into(),
        Series::new("SIC".into(), vec!["3571"; height]).into(),
        Series::new("section_item".into(), vec!["Item 7A"; height]).into(),
        filing_date.into(),
    ])
    .unwrap()
}

pub fn parquet(df: &DataFrame) -> Bytes {
    Bytes::from(frames::parquet_bytes(df, Compression::Zstd).unwrap())
}

pub fn store_with(objects: &[(&str, &DataFrame)]) -> Arc<MemoryBucketStore> {
    let store = Arc::new(MemoryBucketStore::new("finrag-test"));
    for (key, df) in objects {
        store.insert(*key, parquet(df));
    }
    store
}

pub fn read(store: &MemoryBucketStore, key: &str) -> DataFrame {
    frames::read_parquet(store.object(key).unwrap()).unwrap()
}

pub fn ids(df: &DataFrame) -> Vec<String> {
    df.column("sentenceID")
        .unwrap()
        .str()
        .unwrap()
        .into_iter()
        .map(|value| value.unwrap().to_string())
        .collect()
}

pub fn sentence_for(df: &DataFrame, id: &str) -> String {
    let position = ids(df).iter().position(|value| value == id).unwrap();
    df.column("sentence")
        .unwrap()
        .str()
        .unwrap()
        .get(position)
        .unwrap()
        .to_string()
}
