//! Header-only schema check run before any load.

use crate::contract::RequiredColumns;
use crate::error::{IngestError, Result};
use std::path::Path;

/// Checks a processed file's header against the required canonical columns.
#[derive(Debug, Clone)]
pub struct SchemaValidator {
    required: RequiredColumns,
}

impl SchemaValidator {
    pub fn new(required: RequiredColumns) -> Self {
        Self { required }
    }

    /// `Ok(true)` iff the header is a superset of the required columns.
    ///
    /// Row values are never read.
    pub fn validate(&self, path: &Path) -> Result<bool> {
        let mut reader = csv::Reader::from_path(path).map_err(|e| header_error(path, e))?;
        let headers = reader.headers().map_err(|e| header_error(path, e))?;

        let missing = self.required.missing_from(headers.iter());
        if !missing.is_empty() {
            return Err(IngestError::SchemaMismatch {
                path: path.to_path_buf(),
                missing,
            });
        }
        Ok(true)
    }
}

fn header_error(path: &Path, err: csv::Error) -> IngestError {
    let reason = err.to_string();
    match err.into_kind() {
        csv::ErrorKind::Io(source) => IngestError::io(path, source),
        _ => IngestError::UnreadableHeader {
            path: path.to_path_buf(),
            reason,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn validator() -> SchemaValidator {
        SchemaValidator::new(RequiredColumns::from_columns(["time_s", "ca", "temp_k"]))
    }

    #[test]
    fn superset_header_is_valid() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("results_R1.csv");
        std::fs::write(&path, "temp_k,time_s,ca,extra\n300,0,1.0,x\n").unwrap();

        assert!(validator().validate(&path).unwrap());
    }

    #[test]
    fn missing_column_is_a_schema_mismatch() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("results_R1.csv");
        std::fs::write(&path, "time_s,ca\n0,1.0\n").unwrap();

        match validator().validate(&path).unwrap_err() {
            IngestError::SchemaMismatch { missing, .. } => assert_eq!(missing, vec!["temp_k"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn row_values_are_not_inspected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("results_R1.csv");
        std::fs::write(&path, "time_s,ca,temp_k\nnot,numbers,here\n").unwrap();

        assert!(validator().validate(&path).unwrap());
    }

    #[test]
    fn unreadable_files_are_not_reported_as_cleaning_errors() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("results_R1.csv");
        let err = validator().validate(&missing).unwrap_err();
        assert_eq!(err.kind(), "io");

        let garbled = tmp.path().join("results_R2.csv");
        std::fs::write(&garbled, b"time_s,\xff\xfe,temp_k\n0,1,300\n").unwrap();
        let err = validator().validate(&garbled).unwrap_err();
        assert!(matches!(err, IngestError::UnreadableHeader { .. }));
        assert_eq!(err.kind(), "validation");
    }
}
