// crates/finrag-core/src/error.rs

use thiserror::Error;

use crate::config::ConfigError;

#[derive(Error, Debug)]
pub enum EtlError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("object store error: {0}")]
    Bucket(#[from] finrag_bucket::BucketError),

    #[error("Polars operation failed: {0}")]
    Polars(#[from] polars::error::PolarsError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Pre-flight checks failed: {0}")]
    Preflight(String),

    #[error("Schema alignment failed: {0}")]
    Transform(String),

    #[error("Merge invariant violated: {0}")]
    Invariant(String),
}

pub type Result<T> = std::result::Result<T, EtlError>;
