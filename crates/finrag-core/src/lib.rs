pub mod config;
pub mod error;
pub mod frames;
pub mod merge;
pub mod pipeline;
pub mod preflight;
pub mod reconcile;
pub mod run_log;
pub mod schema_inspect;

pub use config::EtlConfig;
pub use error::{EtlError, Result};
pub use pipeline::{MergePipeline, RunOutcome};
