//! Column contracts: the source → canonical mapping and the required set.
//!
//! Both files are JSON objects. `column_map.json` maps simulator column
//! names to warehouse names; `required_cols.json` maps a label to each
//! canonical column a processed file must carry. The canonical side of both
//! must agree exactly, otherwise nothing is loaded.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("Cannot read contract {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Contract {} is not a JSON object of strings: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Contract {} is empty", .path.display())]
    Empty { path: PathBuf },

    #[error(
        "Column mapping and required columns disagree: only mapped {only_in_mapping:?}, only required {only_in_required:?}"
    )]
    Mismatch {
        only_in_mapping: Vec<String>,
        only_in_required: Vec<String>,
    },
}

fn read_string_map(path: &Path) -> Result<BTreeMap<String, String>, ContractError> {
    let content = std::fs::read_to_string(path).map_err(|source| ContractError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let map: BTreeMap<String, String> =
        serde_json::from_str(&content).map_err(|source| ContractError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    if map.is_empty() {
        return Err(ContractError::Empty {
            path: path.to_path_buf(),
        });
    }
    Ok(map)
}

/// Source column name → canonical warehouse column name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    renames: BTreeMap<String, String>,
}

impl ColumnMapping {
    pub fn load(path: &Path) -> Result<Self, ContractError> {
        Ok(Self {
            renames: read_string_map(path)?,
        })
    }

    pub fn from_pairs<I, S, T>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, T)>,
        S: Into<String>,
        T: Into<String>,
    {
        Self {
            renames: pairs
                .into_iter()
                .map(|(source, target)| (source.into(), target.into()))
                .collect(),
        }
    }

    /// Canonical name for a source header, or the header itself when unmapped.
    pub fn rename<'a>(&'a self, header: &'a str) -> &'a str {
        self.renames.get(header).map(String::as_str).unwrap_or(header)
    }

    pub fn canonical_columns(&self) -> BTreeSet<String> {
        self.renames.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.renames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.renames.is_empty()
    }
}

/// Canonical columns every processed fact file must contain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredColumns {
    columns: BTreeSet<String>,
}

impl RequiredColumns {
    pub fn load(path: &Path) -> Result<Self, ContractError> {
        Ok(Self {
            columns: read_string_map(path)?.into_values().collect(),
        })
    }

    pub fn from_columns<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }

    pub fn columns(&self) -> &BTreeSet<String> {
        &self.columns
    }

    /// Required columns absent from `present`, sorted.
    pub fn missing_from<'a, I>(&self, present: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let present: BTreeSet<&str> = present.into_iter().collect();
        self.columns
            .iter()
            .filter(|col| !present.contains(col.as_str()))
            .cloned()
            .collect()
    }
}

/// Both contracts, checked against each other.
#[derive(Debug, Clone)]
pub struct Contracts {
    pub mapping: ColumnMapping,
    pub required: RequiredColumns,
}

impl Contracts {
    pub fn new(mapping: ColumnMapping, required: RequiredColumns) -> Result<Self, ContractError> {
        let canonical = mapping.canonical_columns();
        let only_in_mapping: Vec<String> =
            canonical.difference(required.columns()).cloned().collect();
        let only_in_required: Vec<String> =
            required.columns().difference(&canonical).cloned().collect();
        if !only_in_mapping.is_empty() || !only_in_required.is_empty() {
            return Err(ContractError::Mismatch {
                only_in_mapping,
                only_in_required,
            });
        }
        Ok(Self { mapping, required })
    }

    pub fn load(column_map: &Path, required_columns: &Path) -> Result<Self, ContractError> {
        Self::new(
            ColumnMapping::load(column_map)?,
            RequiredColumns::load(required_columns)?,
        )
    }
}
