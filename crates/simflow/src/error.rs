//! Error types for the ingestion pipeline.

use crate::run_id::{RunId, RunIdError};
use simflow_db::BackendError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Per-file ingestion error.
///
/// None of these abort a batch: the coordinator logs them with the file and
/// run id, leaves the file in its current stage and moves on.
#[derive(Error, Debug)]
pub enum IngestError {
    /// Processed file lacks required columns; not retried until fixed.
    #[error("{}: missing required columns {missing:?}", .path.display())]
    SchemaMismatch { path: PathBuf, missing: Vec<String> },

    /// Required canonical columns absent after renaming; raw file stays in incoming.
    #[error("{}: missing columns after renaming {missing:?}", .path.display())]
    MissingColumns { path: PathBuf, missing: Vec<String> },

    /// Processed file has no parsable header row.
    #[error("{}: unreadable header: {reason}", .path.display())]
    UnreadableHeader { path: PathBuf, reason: String },

    /// Raw file could not be read or the cleaned file could not be written.
    #[error("Cleaning {} failed: {reason}", .path.display())]
    Cleaning { path: PathBuf, reason: String },

    /// Bulk load or insert failed and was rolled back.
    #[error("Load failed for run {run_id}: {source}")]
    Load {
        run_id: RunId,
        #[source]
        source: BackendError,
    },

    /// Run log record could not be opened or closed.
    #[error("Run log write failed for run {run_id}: {source}")]
    Audit {
        run_id: RunId,
        #[source]
        source: BackendError,
    },

    #[error("Invalid metadata in {}: {reason}", .path.display())]
    MetadataValidation { path: PathBuf, reason: String },

    #[error("Cannot promote {}: {reason}", .path.display())]
    Promotion { path: PathBuf, reason: String },

    #[error(transparent)]
    RunId(#[from] RunIdError),

    #[error("IO error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Database error: {0}")]
    Database(#[from] BackendError),
}

impl IngestError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        IngestError::Io {
            path: path.into(),
            source,
        }
    }

    /// Short label used in batch summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::SchemaMismatch { .. } => "schema_mismatch",
            IngestError::UnreadableHeader { .. } => "validation",
            IngestError::MissingColumns { .. } | IngestError::Cleaning { .. } => "cleaning",
            IngestError::Load { .. } => "load",
            IngestError::Audit { .. } => "audit",
            IngestError::MetadataValidation { .. } => "metadata_validation",
            IngestError::Promotion { .. } => "promotion",
            IngestError::RunId(_) => "run_id",
            IngestError::Io { .. } => "io",
            IngestError::Database(_) => "database",
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, IngestError>;
