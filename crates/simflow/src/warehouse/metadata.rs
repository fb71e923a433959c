//! Per-run metadata record.

use crate::error::{IngestError, Result};
use crate::run_id::RunId;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One simulation run's parameters, as written by the simulator.
///
/// Field names follow the simulator's JSON keys; the snake-case names are
/// accepted as well. Every field is required.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub simulation_id: String,

    pub reaction_name: String,

    #[serde(rename = "activation_energy (J/mol)", alias = "activation_energy")]
    pub activation_energy: f64,

    #[serde(rename = "CA0_(mol/m^3)", alias = "ca0")]
    pub ca0: f64,

    #[serde(rename = "CB0_(mol/m^3)", alias = "cb0")]
    pub cb0: f64,

    #[serde(rename = "T0_(K)", alias = "t0")]
    pub t0: f64,

    pub date_run: String,

    pub stop_reason: String,

    #[serde(rename = "stop_time_(s)", alias = "stop_time_s")]
    pub stop_time_s: f64,
}

impl MetadataRecord {
    /// Read and validate `metadata_<run id>.json`.
    pub fn load(path: &Path, run_id: &RunId) -> Result<Self> {
        let invalid = |reason: String| IngestError::MetadataValidation {
            path: path.to_path_buf(),
            reason,
        };

        let content = std::fs::read_to_string(path).map_err(|e| IngestError::io(path, e))?;
        let record: MetadataRecord =
            serde_json::from_str(&content).map_err(|e| invalid(e.to_string()))?;
        record.validate().map_err(invalid)?;
        if record.simulation_id != run_id.as_str() {
            return Err(invalid(format!(
                "simulation_id '{}' does not match run id '{}' from the file name",
                record.simulation_id, run_id
            )));
        }
        Ok(record)
    }

    /// Field-level checks that serde cannot express.
    pub fn validate(&self) -> std::result::Result<(), String> {
        RunId::new(self.simulation_id.as_str()).map_err(|e| e.to_string())?;

        for (field, value) in [
            ("reaction_name", &self.reaction_name),
            ("date_run", &self.date_run),
            ("stop_reason", &self.stop_reason),
        ] {
            if value.trim().is_empty() {
                return Err(format!("{} must not be empty", field));
            }
        }

        for (field, value) in [
            ("activation_energy", self.activation_energy),
            ("ca0", self.ca0),
            ("cb0", self.cb0),
            ("t0", self.t0),
            ("stop_time_s", self.stop_time_s),
        ] {
            if !value.is_finite() {
                return Err(format!("{} must be a finite number, got {}", field, value));
            }
        }
        Ok(())
    }
}
