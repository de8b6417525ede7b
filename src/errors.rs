use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::types::{SourceKey, TypeKey};

/// Error type for ingestion, sampling, and collation failures.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("archive '{path}' could not be read: {reason}")]
    Archive { path: PathBuf, reason: String },
    #[error("persisted state at '{path}' is unreadable: {reason}")]
    State { path: PathBuf, reason: String },
    #[error("data source '{source_key}' is unavailable: {reason}")]
    SourceUnavailable { source_key: SourceKey, reason: String },
    #[error("record {index} of source '{source_key}' could not be loaded: {reason}")]
    Record {
        source_key: SourceKey,
        index: usize,
        reason: String,
    },
    #[error("no collate function registered for example type '{0}'")]
    UnknownExampleType(TypeKey),
    #[error("collation failed for group '{group}': {reason}")]
    Collation { group: TypeKey, reason: String },
    #[error("image preprocessing failed: {0}")]
    Image(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
