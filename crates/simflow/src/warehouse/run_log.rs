//! Two-phase load audit.
//!
//! A record is opened as `running` right before a load and closed as
//! `success` only after the load committed and the file was promoted.
//! There is no failed state: a record still running after a while marks a
//! load that needs a human to look at it.

use super::schema::RUN_LOG_TABLE;
use super::Warehouse;
use crate::run_id::RunId;
use serde::Serialize;
use simflow_db::{BackendError, DbRow, DbTimestamp, DbValue};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Primary key of a run log record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RunLogId(String);

impl RunLogId {
    pub fn new_v4() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RunLogId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for RunLogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadType {
    Fact,
    Metadata,
}

impl LoadType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadType::Fact => "fact",
            LoadType::Metadata => "metadata",
        }
    }
}

impl fmt::Display for LoadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for LoadType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fact" => Ok(LoadType::Fact),
            "metadata" => Ok(LoadType::Metadata),
            _ => Err(format!("Invalid load type: '{}'. Expected: fact or metadata", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            _ => Err(format!("Invalid run status: '{}'. Expected: running or success", s)),
        }
    }
}

/// One row of the run log.
#[derive(Debug, Clone, Serialize)]
pub struct RunLogEntry {
    pub id: RunLogId,
    pub simulation_id: String,
    pub load_type: LoadType,
    pub status: RunStatus,
    pub started_at: DbTimestamp,
    pub finished_at: Option<DbTimestamp>,
    pub rows_inserted: Option<i64>,
    pub duration_ms: Option<i64>,
}

impl RunLogEntry {
    fn from_row(row: &DbRow) -> Result<Self, BackendError> {
        let load_type: String = row.get_by_name("load_type")?;
        let status: String = row.get_by_name("status")?;
        Ok(Self {
            id: RunLogId(row.get_by_name("id")?),
            simulation_id: row.get_by_name("simulation_id")?,
            load_type: load_type.parse().map_err(BackendError::TypeConversion)?,
            status: status.parse().map_err(BackendError::TypeConversion)?,
            started_at: row.get_by_name("started_at")?,
            finished_at: row.get_by_name("finished_at")?,
            rows_inserted: row.get_by_name("rows_inserted")?,
            duration_ms: row.get_by_name("duration_ms")?,
        })
    }

    /// Time since the record was opened.
    pub fn age(&self, now: &DbTimestamp) -> chrono::Duration {
        *now.as_chrono() - *self.started_at.as_chrono()
    }
}

const SELECT_COLUMNS: &str =
    "id, simulation_id, load_type, status, started_at, finished_at, rows_inserted, duration_ms";

impl Warehouse {
    /// Insert a `running` record for a load about to start.
    pub fn open_run(&self, run_id: &RunId, load_type: LoadType) -> Result<RunLogId, BackendError> {
        let id = RunLogId::new_v4();
        self.connection().execute(
            &format!(
                "INSERT INTO {} (id, simulation_id, load_type, status, started_at) VALUES (?, ?, ?, ?, ?)",
                RUN_LOG_TABLE
            ),
            &[
                DbValue::from(id.as_str()),
                DbValue::from(run_id.as_str()),
                DbValue::from(load_type.as_str()),
                DbValue::from(RunStatus::Running.as_str()),
                DbValue::from(DbTimestamp::now()),
            ],
        )?;
        debug!(run_id = %run_id, run_log_id = %id, load_type = %load_type, "Opened run log record");
        Ok(id)
    }

    /// Mark a running record as `success`.
    ///
    /// Fails with `InvalidState` if the record is missing, already closed, or
    /// was opened for a different load type.
    pub fn close_run(
        &self,
        id: &RunLogId,
        load_type: LoadType,
        rows_inserted: u64,
    ) -> Result<RunLogEntry, BackendError> {
        let entry = self
            .get_run(id)?
            .ok_or_else(|| BackendError::InvalidState(format!("run log record {} not found", id)))?;
        if entry.status != RunStatus::Running {
            return Err(BackendError::InvalidState(format!(
                "run log record {} is {}, not running",
                id, entry.status
            )));
        }
        if entry.load_type != load_type {
            return Err(BackendError::InvalidState(format!(
                "run log record {} was opened for a {} load, not {}",
                id, entry.load_type, load_type
            )));
        }

        let finished_at = DbTimestamp::now();
        let duration_ms = (finished_at.unix_millis() - entry.started_at.unix_millis()).max(0);
        let rows = i64::try_from(rows_inserted)
            .map_err(|_| BackendError::InvalidInput(format!("row count {} too large", rows_inserted)))?;

        let updated = self.connection().execute(
            &format!(
                "UPDATE {} SET status = ?, finished_at = ?, rows_inserted = ?, duration_ms = ? \
                 WHERE id = ? AND status = ?",
                RUN_LOG_TABLE
            ),
            &[
                DbValue::from(RunStatus::Success.as_str()),
                DbValue::from(finished_at.clone()),
                DbValue::from(rows),
                DbValue::from(duration_ms),
                DbValue::from(id.as_str()),
                DbValue::from(RunStatus::Running.as_str()),
            ],
        )?;
        if updated != 1 {
            return Err(BackendError::InvalidState(format!(
                "run log record {} changed while closing",
                id
            )));
        }

        debug!(run_log_id = %id, rows = rows, duration_ms, "Closed run log record");
        Ok(RunLogEntry {
            status: RunStatus::Success,
            finished_at: Some(finished_at),
            rows_inserted: Some(rows),
            duration_ms: Some(duration_ms),
            ..entry
        })
    }

    pub fn get_run(&self, id: &RunLogId) -> Result<Option<RunLogEntry>, BackendError> {
        let row = self.connection().query_optional(
            &format!("SELECT {} FROM {} WHERE id = ?", SELECT_COLUMNS, RUN_LOG_TABLE),
            &[DbValue::from(id.as_str())],
        )?;
        row.as_ref().map(RunLogEntry::from_row).transpose()
    }

    /// All records for one run, oldest first.
    pub fn runs_for(&self, run_id: &RunId) -> Result<Vec<RunLogEntry>, BackendError> {
        let rows = self.connection().query_all(
            &format!(
                "SELECT {} FROM {} WHERE simulation_id = ? ORDER BY started_at",
                SELECT_COLUMNS, RUN_LOG_TABLE
            ),
            &[DbValue::from(run_id.as_str())],
        )?;
        rows.iter().map(RunLogEntry::from_row).collect()
    }

    /// Records still `running`, oldest first.
    pub fn open_runs(&self) -> Result<Vec<RunLogEntry>, BackendError> {
        let rows = self.connection().query_all(
            &format!(
                "SELECT {} FROM {} WHERE status = ? ORDER BY started_at",
                SELECT_COLUMNS, RUN_LOG_TABLE
            ),
            &[DbValue::from(RunStatus::Running.as_str())],
        )?;
        rows.iter().map(RunLogEntry::from_row).collect()
    }

    /// Records still `running` that were opened more than `older_than` ago.
    pub fn stale_runs(&self, older_than: chrono::Duration) -> Result<Vec<RunLogEntry>, BackendError> {
        let cutoff = DbTimestamp::from_chrono(chrono::Utc::now() - older_than);
        let rows = self.connection().query_all(
            &format!(
                "SELECT {} FROM {} WHERE status = ? AND started_at < ? ORDER BY started_at",
                SELECT_COLUMNS, RUN_LOG_TABLE
            ),
            &[
                DbValue::from(RunStatus::Running.as_str()),
                DbValue::from(cutoff),
            ],
        )?;
        rows.iter().map(RunLogEntry::from_row).collect()
    }
}
