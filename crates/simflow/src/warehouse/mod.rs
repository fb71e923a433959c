//! Warehouse gateway: the only code that issues SQL.
//!
//! Tables:
//! - `fact_sim`: one row per simulation timestep, keyed by `simulation_id`,
//!   with `sim_key` back-filled from the dimension table.
//! - `dim_rxn`: one row per run with a sequence-generated `sim_key`.
//! - `run_log`: load audit, see [`run_log`].

pub mod metadata;
pub mod run_log;
pub mod schema;

use crate::contract::RequiredColumns;
use crate::run_id::RunId;
use crate::stage::StagedFile;
use metadata::MetadataRecord;
use schema::{is_reserved_fact_column, DIM_TABLE, FACT_INDEXES, FACT_TABLE, SIMULATION_ID};
use simflow_db::{quote_ident, BackendError, DbConnection, DbValue};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, error, info, warn};

/// Gateway over one warehouse connection.
#[derive(Debug, Clone)]
pub struct Warehouse {
    conn: DbConnection,
    /// Measurement columns of the fact table, sorted.
    fact_columns: Vec<String>,
}

impl Warehouse {
    /// Open the warehouse file for writing, taking the single-writer lock.
    pub fn open(path: &Path, required: &RequiredColumns) -> Result<Self, BackendError> {
        Ok(Self::from_connection(DbConnection::open(path)?, required))
    }

    /// Open the warehouse file for reports only.
    pub fn open_readonly(path: &Path, required: &RequiredColumns) -> Result<Self, BackendError> {
        Ok(Self::from_connection(
            DbConnection::open_readonly(path)?,
            required,
        ))
    }

    pub fn from_connection(conn: DbConnection, required: &RequiredColumns) -> Self {
        let fact_columns = required
            .columns()
            .iter()
            .filter(|c| !is_reserved_fact_column(c))
            .cloned()
            .collect();
        Self { conn, fact_columns }
    }

    pub fn connection(&self) -> &DbConnection {
        &self.conn
    }

    pub fn fact_columns(&self) -> &[String] {
        &self.fact_columns
    }

    /// Create every table, the key sequence and the index set if missing.
    ///
    /// Runs in one transaction. A failure is rolled back and logged; the
    /// return value says whether the schema is in place.
    pub fn provision_schema(&self) -> bool {
        let sql = schema::provision_sql(&self.fact_columns);
        match self.conn.transaction(|tx| tx.execute_batch(&sql)) {
            Ok(()) => {
                info!(
                    fact_columns = self.fact_columns.len(),
                    "Warehouse schema verified"
                );
                true
            }
            Err(err) => {
                error!("Schema provisioning failed and was rolled back: {}", err);
                false
            }
        }
    }

    /// Load every row of a processed fact file in one transaction.
    ///
    /// `simulation_id` is taken from the file name. Columns the fact table
    /// does not have are skipped; reserved columns in the file are ignored.
    /// Empty cells load as NULL. Returns the number of rows inserted, which
    /// always equals the file's data row count.
    pub fn bulk_load_fact(&self, file: &StagedFile) -> Result<u64, BackendError> {
        let (columns, rows) = self.read_fact_rows(&file.path, &file.run_id)?;
        let expected = rows.len() as u64;
        let column_refs: Vec<&str> = columns.iter().map(String::as_str).collect();

        let inserted = self.conn.transaction(|tx| {
            let inserted = tx.bulk_insert_rows(FACT_TABLE, &column_refs, &rows)?;
            if inserted != expected {
                return Err(BackendError::Transaction(format!(
                    "inserted {} rows but the file has {}",
                    inserted, expected
                )));
            }
            Ok(inserted)
        })?;

        debug!(run_id = %file.run_id, rows = inserted, "Fact rows committed");
        Ok(inserted)
    }

    /// Split a file header into fact table columns and columns to skip.
    ///
    /// The first occurrence of a duplicated column wins.
    fn map_fact_header(&self, headers: &csv::StringRecord) -> FactHeader {
        let known: BTreeSet<&str> = self.fact_columns.iter().map(String::as_str).collect();
        let mut header = FactHeader::default();
        for (index, name) in headers.iter().enumerate() {
            if known.contains(name) && !header.columns.iter().any(|c| c == name) {
                header.keep.push(index);
                header.columns.push(name.to_string());
            } else {
                header.skipped.push(name.to_string());
            }
        }
        header
    }

    fn read_fact_rows(
        &self,
        path: &Path,
        run_id: &RunId,
    ) -> Result<(Vec<String>, Vec<Vec<DbValue>>), BackendError> {
        let csv_error =
            |e: csv::Error| BackendError::InvalidInput(format!("{}: {}", path.display(), e));

        let mut reader = csv::Reader::from_path(path).map_err(csv_error)?;
        let headers = reader.headers().map_err(csv_error)?.clone();

        let FactHeader {
            keep,
            mut columns,
            skipped,
        } = self.map_fact_header(&headers);
        if !skipped.is_empty() {
            warn!(
                file = %path.display(),
                run_id = %run_id,
                "Columns not loaded into {}: {:?}",
                FACT_TABLE,
                skipped
            );
        }
        columns.push(SIMULATION_ID.to_string());

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(csv_error)?;
            let mut row: Vec<DbValue> = keep
                .iter()
                .map(|&i| parse_cell(record.get(i).unwrap_or("")))
                .collect();
            row.push(DbValue::from(run_id.as_str()));
            rows.push(row);
        }
        Ok((columns, rows))
    }

    /// Insert one run's dimension row and return its generated `sim_key`.
    ///
    /// The record is validated before any SQL is issued.
    pub fn insert_metadata(&self, record: &MetadataRecord) -> Result<i64, BackendError> {
        record.validate().map_err(BackendError::InvalidInput)?;

        let insert = format!(
            "INSERT INTO {} (simulation_id, reaction_name, activation_energy, ca0, cb0, t0, \
             date_run, stop_reason, stop_time_s) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            DIM_TABLE
        );
        let select = format!("SELECT sim_key FROM {} WHERE simulation_id = ?", DIM_TABLE);
        let params = [
            DbValue::from(record.simulation_id.as_str()),
            DbValue::from(record.reaction_name.as_str()),
            DbValue::from(record.activation_energy),
            DbValue::from(record.ca0),
            DbValue::from(record.cb0),
            DbValue::from(record.t0),
            DbValue::from(record.date_run.as_str()),
            DbValue::from(record.stop_reason.as_str()),
            DbValue::from(record.stop_time_s),
        ];

        let sim_key = self.conn.transaction(|tx| {
            tx.execute(&insert, &params)?;
            tx.query_scalar::<i64>(&select, &[DbValue::from(record.simulation_id.as_str())])
        })?;

        debug!(run_id = %record.simulation_id, sim_key, "Dimension row committed");
        Ok(sim_key)
    }

    pub fn drop_indexes(&self) -> Result<(), BackendError> {
        let sql: String = FACT_INDEXES.iter().map(|idx| idx.drop_sql()).collect();
        self.conn.transaction(|tx| tx.execute_batch(&sql))?;
        info!(count = FACT_INDEXES.len(), "Dropped fact table indexes");
        Ok(())
    }

    pub fn recreate_indexes(&self) -> Result<(), BackendError> {
        let sql: String = FACT_INDEXES.iter().map(|idx| idx.create_sql()).collect();
        self.conn.transaction(|tx| tx.execute_batch(&sql))?;
        info!(count = FACT_INDEXES.len(), "Recreated fact table indexes");
        Ok(())
    }

    /// Names of the secondary indexes currently on the fact table.
    pub fn index_names(&self) -> Result<Vec<String>, BackendError> {
        let rows = self.conn.query_all(
            "SELECT index_name FROM duckdb_indexes() WHERE table_name = ? ORDER BY index_name",
            &[DbValue::from(FACT_TABLE)],
        )?;
        rows.iter().map(|row| row.get::<String>(0)).collect()
    }

    /// Back-fill `fact_sim.sim_key` for one run from its dimension row.
    ///
    /// Only that run's rows with a NULL key are touched. Without a dimension
    /// row nothing matches and 0 is returned.
    pub fn reconcile_surrogate_key(&self, run_id: &RunId) -> Result<u64, BackendError> {
        let sql = format!(
            "UPDATE {fact} SET sim_key = d.sim_key FROM {dim} d \
             WHERE {fact}.simulation_id = d.simulation_id \
             AND {fact}.simulation_id = ? AND {fact}.sim_key IS NULL",
            fact = FACT_TABLE,
            dim = DIM_TABLE
        );
        let updated = self
            .conn
            .transaction(|tx| tx.execute(&sql, &[DbValue::from(run_id.as_str())]))?;
        if updated > 0 {
            info!(run_id = %run_id, rows = updated, "Reconciled surrogate keys");
        }
        Ok(updated)
    }

    /// Fact rows already stored for a run.
    pub fn fact_rows_for_run(&self, run_id: &RunId) -> Result<u64, BackendError> {
        let count: i64 = self.conn.query_scalar(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE {} = ?",
                FACT_TABLE,
                quote_ident(SIMULATION_ID)
            ),
            &[DbValue::from(run_id.as_str())],
        )?;
        Ok(count.max(0) as u64)
    }

    /// Whether the run already has a dimension row.
    pub fn metadata_exists(&self, run_id: &RunId) -> Result<bool, BackendError> {
        let count: i64 = self.conn.query_scalar(
            &format!("SELECT COUNT(*) FROM {} WHERE simulation_id = ?", DIM_TABLE),
            &[DbValue::from(run_id.as_str())],
        )?;
        Ok(count > 0)
    }

    /// `sim_key` for a run, if its dimension row exists.
    pub fn sim_key_for(&self, run_id: &RunId) -> Result<Option<i64>, BackendError> {
        let row = self.conn.query_optional(
            &format!("SELECT sim_key FROM {} WHERE simulation_id = ?", DIM_TABLE),
            &[DbValue::from(run_id.as_str())],
        )?;
        row.map(|r| r.get::<i64>(0)).transpose()
    }
}

/// Column positions of a fact file that map onto `fact_sim`.
#[derive(Debug, Default, PartialEq, Eq)]
struct FactHeader {
    keep: Vec<usize>,
    columns: Vec<String>,
    skipped: Vec<String>,
}

/// Empty cells are NULL, numbers are DOUBLE, anything else is left for the
/// database to reject.
fn parse_cell(raw: &str) -> DbValue {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return DbValue::Null;
    }
    match trimmed.parse::<f64>() {
        Ok(value) => DbValue::Real(value),
        Err(_) => DbValue::Text(raw.to_string()),
    }
}
