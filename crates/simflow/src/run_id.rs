//! Run identifiers parsed from staged file names.
//!
//! The simulator names its outputs positionally: fact files carry an
//! 8-character prefix before the run id (`results_R1.csv`), metadata files a
//! 9-character one (`metadata_R1.json`). This module is the only place that
//! knows about that convention.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Characters before the run id in a fact CSV file name.
pub const FACT_PREFIX_LEN: usize = 8;
/// Characters before the run id in a metadata JSON file name.
pub const METADATA_PREFIX_LEN: usize = 9;

/// What a staged file carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    /// Per-timestep simulation output, bulk loaded into the fact table.
    FactCsv,
    /// One run's metadata, inserted into the dimension table.
    MetadataJson,
}

impl FileKind {
    /// Classify a path by extension. Anything else is not pipeline input.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("csv") => Some(FileKind::FactCsv),
            Some("json") => Some(FileKind::MetadataJson),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            FileKind::FactCsv => "csv",
            FileKind::MetadataJson => "json",
        }
    }

    pub fn prefix_len(&self) -> usize {
        match self {
            FileKind::FactCsv => FACT_PREFIX_LEN,
            FileKind::MetadataJson => METADATA_PREFIX_LEN,
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileKind::FactCsv => write!(f, "fact-csv"),
            FileKind::MetadataJson => write!(f, "metadata-json"),
        }
    }
}

/// Errors from [`RunId::parse`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunIdError {
    #[error("{file}: expected a .{expected} file")]
    WrongExtension { file: String, expected: &'static str },

    #[error("{file}: name too short to hold a {prefix_len}-character prefix and a run id")]
    TooShort { file: String, prefix_len: usize },

    #[error("{file}: run id '{run_id}' may only contain ASCII letters, digits, '-' or '_'")]
    InvalidCharacters { file: String, run_id: String },

    #[error("{0}: file name is not valid UTF-8")]
    NotUtf8(String),
}

/// Identifier of one simulation run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Validate a bare run id.
    pub fn new(value: impl Into<String>) -> Result<Self, RunIdError> {
        let value = value.into();
        if value.is_empty() {
            return Err(RunIdError::TooShort {
                file: value,
                prefix_len: 0,
            });
        }
        if !value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
        {
            return Err(RunIdError::InvalidCharacters {
                file: value.clone(),
                run_id: value,
            });
        }
        Ok(Self(value))
    }

    /// Extract the run id from a file name of the given kind.
    pub fn parse(file_name: &str, kind: FileKind) -> Result<Self, RunIdError> {
        let suffix = format!(".{}", kind.extension());
        let stem = file_name
            .strip_suffix(&suffix)
            .ok_or_else(|| RunIdError::WrongExtension {
                file: file_name.to_string(),
                expected: kind.extension(),
            })?;

        let run_id: String = stem.chars().skip(kind.prefix_len()).collect();
        if run_id.is_empty() {
            return Err(RunIdError::TooShort {
                file: file_name.to_string(),
                prefix_len: kind.prefix_len(),
            });
        }

        Self::new(run_id).map_err(|err| match err {
            RunIdError::InvalidCharacters { run_id, .. } => RunIdError::InvalidCharacters {
                file: file_name.to_string(),
                run_id,
            },
            other => other,
        })
    }

    /// Classify a path and extract its run id in one step.
    pub fn from_path(path: &Path) -> Result<(FileKind, Self), RunIdError> {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| RunIdError::NotUtf8(path.display().to_string()))?;
        let kind = FileKind::from_path(path).ok_or_else(|| RunIdError::WrongExtension {
            file: file_name.to_string(),
            expected: "csv or .json",
        })?;
        Ok((kind, Self::parse(file_name, kind)?))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RunId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
