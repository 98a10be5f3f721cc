//! ETL settings loaded once from the YAML (or TOML) config document.

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use glob::Pattern;
use polars::io::parquet::write::ParquetCompression;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const TIMESTAMP_PLACEHOLDER: &str = "{timestamp}";
pub const ARCHIVE_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const RUN_LOG_FILE_NAME: &str = "merge_history.csv";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("failed to parse TOML config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid config value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.into(),
    }
}

/// Parquet codec used for the final table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[serde(alias = "none")]
    Uncompressed,
    Snappy,
    Gzip,
    Lz4,
    #[default]
    Zstd,
    Brotli,
}

impl Compression {
    pub fn to_parquet(self) -> ParquetCompression {
        match self {
            Compression::Uncompressed => ParquetCompression::Uncompressed,
            Compression::Snappy => ParquetCompression::Snappy,
            Compression::Gzip => ParquetCompression::Gzip(None),
            Compression::Lz4 => ParquetCompression::Lz4Raw,
            Compression::Zstd => ParquetCompression::Zstd(None),
            Compression::Brotli => ParquetCompression::Brotli(None),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Compression::Uncompressed => "uncompressed",
            Compression::Snappy => "snappy",
            Compression::Gzip => "gzip",
            Compression::Lz4 => "lz4",
            Compression::Zstd => "zstd",
            Compression::Brotli => "brotli",
        };
        f.write_str(name)
    }
}

/// How existing archives are rotated once `max_backups` is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Delete every matching archive before the new one is copied.
    #[default]
    ReplaceAll,
    /// Delete only the oldest archives so that `max_backups` remain afterwards.
    KeepNewest,
}

/// Names of the columns the merge relies on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnNames {
    pub primary_key: String,
    pub report_year: String,
    pub entity_id: String,
    pub text: String,
    pub company_name: String,
}

impl Default for ColumnNames {
    fn default() -> Self {
        Self {
            primary_key: "sentenceID".to_string(),
            report_year: "report_year".to_string(),
            entity_id: "cik".to_string(),
            text: "sentence".to_string(),
            company_name: "name".to_string(),
        }
    }
}

/// Archive filename template such as `finrag_fact_sentences_{timestamp}.parquet`.
#[derive(Debug, Clone)]
pub struct ArchivePattern {
    template: String,
    matcher: Pattern,
}

impl ArchivePattern {
    pub fn new(template: &str) -> Result<Self, ConfigError> {
        if !template.contains(TIMESTAMP_PLACEHOLDER) {
            return Err(invalid(
                "output.archive.filename_pattern",
                format!("'{template}' must contain {TIMESTAMP_PLACEHOLDER}"),
            ));
        }
        if template.contains('/') {
            return Err(invalid(
                "output.archive.filename_pattern",
                "must be a file name, not a path",
            ));
        }

        let glob = template
            .split(TIMESTAMP_PLACEHOLDER)
            .map(Pattern::escape)
            .collect::<Vec<_>>()
            .join("*");
        let matcher = Pattern::new(&glob)
            .map_err(|err| invalid("output.archive.filename_pattern", err.to_string()))?;

        Ok(Self {
            template: template.to_string(),
            matcher,
        })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn file_name(&self, at: DateTime<Utc>) -> String {
        let stamp = at.format(ARCHIVE_TIMESTAMP_FORMAT).to_string();
        self.template.replace(TIMESTAMP_PLACEHOLDER, &stamp)
    }

    /// Literal text before the first placeholder; narrows archive listings.
    pub fn literal_prefix(&self) -> &str {
        self.template
            .split(TIMESTAMP_PLACEHOLDER)
            .next()
            .unwrap_or_default()
    }

    pub fn matches(&self, file_name: &str) -> bool {
        self.matcher.matches(file_name)
    }
}

/// Immutable, validated ETL settings.
#[derive(Debug, Clone)]
pub struct EtlConfig {
    pub bucket: String,
    pub historical_key: String,
    pub incremental_key: String,
    pub final_key: String,
    pub archive_path: String,
    pub archive_pattern: ArchivePattern,
    pub max_backups: usize,
    pub retention_policy: RetentionPolicy,
    pub compression: Compression,
    pub log_path: String,
    pub columns: ColumnNames,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    s3: RawS3,
    input: RawInput,
    output: RawOutput,
    #[serde(default)]
    columns: ColumnNames,
}

#[derive(Debug, Deserialize)]
struct RawS3 {
    bucket_name: String,
}

#[derive(Debug, Deserialize)]
struct RawLocation {
    path: String,
    filename: String,
}

#[derive(Debug, Deserialize)]
struct RawInput {
    historical: RawLocation,
    incremental: RawLocation,
}

#[derive(Debug, Deserialize)]
struct RawFinal {
    path: String,
    filename: String,
    #[serde(default)]
    compression: Compression,
}

#[derive(Debug, Deserialize)]
struct RawRetention {
    max_backups: usize,
    #[serde(default)]
    policy: RetentionPolicy,
}

#[derive(Debug, Deserialize)]
struct RawArchive {
    path: String,
    filename_pattern: String,
    retention: RawRetention,
}

#[derive(Debug, Deserialize)]
struct RawLogging {
    log_path: String,
}

#[derive(Debug, Deserialize)]
struct RawOutput {
    #[serde(rename = "final")]
    final_table: RawFinal,
    archive: RawArchive,
    logging: RawLogging,
}

impl EtlConfig {
    /// Loads the config document, picking TOML for `.toml` files and YAML otherwise.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml_str(&text),
            _ => Self::from_yaml_str(&text),
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_yaml::from_str(text)?;
        Self::from_raw(raw)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(text)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let bucket = raw.s3.bucket_name.trim().to_string();
        if bucket.is_empty() {
            return Err(invalid("s3.bucket_name", "must not be empty"));
        }

        let historical_key = location_key("input.historical", &raw.input.historical)?;
        let incremental_key = location_key("input.incremental", &raw.input.incremental)?;
        let final_key = join_key(&raw.output.final_table.path, &raw.output.final_table.filename);
        if raw.output.final_table.filename.trim().is_empty() {
            return Err(invalid("output.final.filename", "must not be empty"));
        }

        if raw.output.archive.retention.max_backups == 0 {
            return Err(invalid(
                "output.archive.retention.max_backups",
                "must be at least 1",
            ));
        }

        let archive_pattern = ArchivePattern::new(&raw.output.archive.filename_pattern)?;
        let archive_path = raw.output.archive.path.trim_end_matches('/').to_string();
        if archive_path.is_empty() {
            return Err(invalid("output.archive.path", "must not be empty"));
        }

        let columns = raw.columns;
        for (key, value) in [
            ("columns.primary_key", &columns.primary_key),
            ("columns.report_year", &columns.report_year),
            ("columns.entity_id", &columns.entity_id),
            ("columns.text", &columns.text),
            ("columns.company_name", &columns.company_name),
        ] {
            if value.trim().is_empty() {
                return Err(invalid(key, "must not be empty"));
            }
        }

        Ok(Self {
            bucket,
            historical_key,
            incremental_key,
            final_key,
            archive_path,
            archive_pattern,
            max_backups: raw.output.archive.retention.max_backups,
            retention_policy: raw.output.archive.retention.policy,
            compression: raw.output.final_table.compression,
            log_path: raw.output.logging.log_path.trim_end_matches('/').to_string(),
            columns,
        })
    }

    pub fn s3_uri(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }

    /// Key prefix shared by every archive produced from the pattern.
    pub fn archive_list_prefix(&self) -> String {
        format!("{}/{}", self.archive_path, self.archive_pattern.literal_prefix())
    }

    pub fn archive_key(&self, file_name: &str) -> String {
        join_key(&self.archive_path, file_name)
    }

    pub fn log_key(&self) -> String {
        join_key(&self.log_path, RUN_LOG_FILE_NAME)
    }
}

fn location_key(key: &'static str, location: &RawLocation) -> Result<String, ConfigError> {
    if location.filename.trim().is_empty() {
        return Err(invalid(key, "filename must not be empty"));
    }
    Ok(join_key(&location.path, &location.filename))
}

pub fn join_key(path: &str, file_name: &str) -> String {
    let path = path.trim_end_matches('/');
    if path.is_empty() {
        file_name.to_string()
    } else {
        format!("{path}/{file_name}")
    }
}
