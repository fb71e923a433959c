//! DuckDB connection layer.
//!
//! Synchronous, single-connection backend for the warehouse.
//! - Columnar, OLAP-friendly storage for per-timestep fact rows
//! - Single writer per database file, enforced via file lock
//! - Every statement runs inside a `db.*` span with op name, SQL hash and duration

use std::path::Path;
use std::rc::Rc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug_span, info};

use crate::lock::{try_lock_exclusive, DbLockGuard, LockError};

/// Errors from database backend operations.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Database is locked by another process: {0}")]
    Locked(String),

    #[error("Operation requires write access but database is read-only")]
    ReadOnly,

    #[error("Query error: {0}")]
    Query(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Type conversion error: {0}")]
    TypeConversion(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A row exists but is not in the state the operation requires.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("DuckDB error: {0}")]
    DuckDb(#[from] duckdb::Error),
}

impl From<LockError> for BackendError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Locked(path) => BackendError::Locked(path.display().to_string()),
            LockError::CreateFailed(io) => BackendError::Database(format!("Lock file error: {}", io)),
            LockError::AcquireFailed(io) => {
                BackendError::Database(format!("Lock acquire error: {}", io))
            }
        }
    }
}

/// Database access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Read-write access (holds the exclusive file lock)
    ReadWrite,
    /// Read-only access (no lock, used for reports)
    ReadOnly,
}

/// Timestamp wrapper for database values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DbTimestamp {
    inner: chrono::DateTime<chrono::Utc>,
}

impl DbTimestamp {
    /// Current timestamp in UTC.
    pub fn now() -> Self {
        Self {
            inner: chrono::Utc::now(),
        }
    }

    pub fn from_chrono(value: chrono::DateTime<chrono::Utc>) -> Self {
        Self { inner: value }
    }

    /// Construct from Unix microseconds (DuckDB's native TIMESTAMP unit).
    pub fn from_unix_micros(micros: i64) -> Option<Self> {
        let secs = micros.div_euclid(1_000_000);
        let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
        chrono::DateTime::from_timestamp(secs, nanos).map(Self::from_chrono)
    }

    pub fn as_chrono(&self) -> &chrono::DateTime<chrono::Utc> {
        &self.inner
    }

    /// Unix milliseconds since epoch.
    pub fn unix_millis(&self) -> i64 {
        self.inner.timestamp_millis()
    }

    /// RFC3339 string representation.
    pub fn to_rfc3339(&self) -> String {
        self.inner.to_rfc3339()
    }
}

impl serde::Serialize for DbTimestamp {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_rfc3339())
    }
}

/// Value type for query parameters and result cells.
#[derive(Debug, Clone, PartialEq)]
pub enum DbValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Boolean(bool),
    Timestamp(DbTimestamp),
}

impl From<i64> for DbValue {
    fn from(v: i64) -> Self {
        DbValue::Integer(v)
    }
}

impl From<f64> for DbValue {
    fn from(v: f64) -> Self {
        DbValue::Real(v)
    }
}

impl From<String> for DbValue {
    fn from(v: String) -> Self {
        DbValue::Text(v)
    }
}

impl From<&str> for DbValue {
    fn from(v: &str) -> Self {
        DbValue::Text(v.to_string())
    }
}

impl From<bool> for DbValue {
    fn from(v: bool) -> Self {
        DbValue::Boolean(v)
    }
}

impl From<DbTimestamp> for DbValue {
    fn from(v: DbTimestamp) -> Self {
        DbValue::Timestamp(v)
    }
}

impl<T: Into<DbValue>> From<Option<T>> for DbValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => DbValue::Null,
        }
    }
}

/// Row data from a query result.
#[derive(Debug, Clone)]
pub struct DbRow {
    columns: Vec<String>,
    values: Vec<DbValue>,
}

impl DbRow {
    pub fn new(columns: Vec<String>, values: Vec<DbValue>) -> Self {
        Self { columns, values }
    }

    /// Get a value by column index.
    pub fn get<T: FromDbValue>(&self, index: usize) -> Result<T, BackendError> {
        self.values
            .get(index)
            .ok_or_else(|| {
                BackendError::TypeConversion(format!("Column index {} out of bounds", index))
            })
            .and_then(|v| T::from_db_value(v))
    }

    /// Get a value by column name.
    pub fn get_by_name<T: FromDbValue>(&self, name: &str) -> Result<T, BackendError> {
        let index =
            self.columns.iter().position(|c| c == name).ok_or_else(|| {
                BackendError::TypeConversion(format!("Column '{}' not found", name))
            })?;
        self.get(index)
    }
}

/// Trait for converting from DbValue.
pub trait FromDbValue: Sized {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError>;
}

impl FromDbValue for i64 {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        match value {
            DbValue::Integer(v) => Ok(*v),
            DbValue::Null => Err(BackendError::TypeConversion(
                "i64 field is NULL - use Option<i64> for nullable columns".to_string(),
            )),
            _ => Err(BackendError::TypeConversion("Expected integer".to_string())),
        }
    }
}

impl FromDbValue for f64 {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        match value {
            DbValue::Real(v) => Ok(*v),
            DbValue::Integer(v) => Ok(*v as f64),
            DbValue::Null => Err(BackendError::TypeConversion(
                "f64 field is NULL - use Option<f64> for nullable columns".to_string(),
            )),
            _ => Err(BackendError::TypeConversion("Expected real".to_string())),
        }
    }
}

impl FromDbValue for String {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        match value {
            DbValue::Text(v) => Ok(v.clone()),
            DbValue::Null => Err(BackendError::TypeConversion(
                "String field is NULL - use Option<String> for nullable columns".to_string(),
            )),
            _ => Err(BackendError::TypeConversion("Expected text".to_string())),
        }
    }
}

impl FromDbValue for DbTimestamp {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        match value {
            DbValue::Timestamp(v) => Ok(v.clone()),
            DbValue::Text(v) => chrono::DateTime::parse_from_rfc3339(v)
                .map(|dt| DbTimestamp::from_chrono(dt.with_timezone(&chrono::Utc)))
                .map_err(|e| BackendError::TypeConversion(format!("Invalid timestamp: {}", e))),
            DbValue::Null => Err(BackendError::TypeConversion(
                "DbTimestamp field is NULL - use Option<DbTimestamp> for nullable columns"
                    .to_string(),
            )),
            _ => Err(BackendError::TypeConversion(
                "Expected timestamp".to_string(),
            )),
        }
    }
}

impl<T: FromDbValue> FromDbValue for Option<T> {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        match value {
            DbValue::Null => Ok(None),
            _ => T::from_db_value(value).map(Some),
        }
    }
}

/// Warehouse connection.
///
/// Cheap to clone; all clones share one DuckDB connection and, for writable
/// connections, one file lock. Not `Send`: the loader is single-threaded.
#[derive(Clone)]
pub struct DbConnection {
    conn: Rc<duckdb::Connection>,
    access_mode: AccessMode,
    /// Holds the exclusive file lock via RAII - not read, but dropping it releases the lock.
    #[allow(dead_code)]
    lock_guard: Option<Rc<DbLockGuard>>,
}

impl std::fmt::Debug for DbConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbConnection")
            .field("backend", &"DuckDB")
            .field("access_mode", &self.access_mode)
            .finish()
    }
}

impl DbConnection {
    /// Open a DuckDB database file with the exclusive write lock.
    ///
    /// Fails fast with [`BackendError::Locked`] when another process is
    /// already loading into the same file.
    pub fn open(path: &Path) -> Result<Self, BackendError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| BackendError::Database(format!("Cannot create {}: {}", parent.display(), e)))?;
            }
        }

        let lock_guard = try_lock_exclusive(path)?;
        let conn = Rc::new(duckdb::Connection::open(path)?);
        info!(path = %path.display(), "Opened warehouse with exclusive lock");

        Ok(Self {
            conn,
            access_mode: AccessMode::ReadWrite,
            lock_guard: Some(Rc::new(lock_guard)),
        })
    }

    /// Open a DuckDB database file read-only (no lock taken).
    pub fn open_readonly(path: &Path) -> Result<Self, BackendError> {
        use duckdb::{AccessMode as DuckAccessMode, Config};

        let config = Config::default().access_mode(DuckAccessMode::ReadOnly)?;
        let conn = Rc::new(duckdb::Connection::open_with_flags(path, config)?);
        info!(path = %path.display(), "Opened warehouse (read-only)");

        Ok(Self {
            conn,
            access_mode: AccessMode::ReadOnly,
            lock_guard: None,
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, BackendError> {
        let conn = Rc::new(duckdb::Connection::open_in_memory()?);

        Ok(Self {
            conn,
            access_mode: AccessMode::ReadWrite,
            lock_guard: None,
        })
    }

    pub fn access_mode(&self) -> AccessMode {
        self.access_mode
    }

    pub fn is_writable(&self) -> bool {
        self.access_mode == AccessMode::ReadWrite
    }

    /// Execute a SQL statement, returning the number of affected rows.
    pub fn execute(&self, sql: &str, params: &[DbValue]) -> Result<u64, BackendError> {
        self.ensure_writable()?;
        execute_on_conn(&self.conn, sql, params)
    }

    /// Execute a batch of SQL statements.
    pub fn execute_batch(&self, sql: &str) -> Result<(), BackendError> {
        self.ensure_writable()?;
        execute_batch_on_conn(&self.conn, sql)
    }

    /// Bulk insert rows into a table.
    ///
    /// Column order must match the row value order. Columns of the table
    /// that are not listed take their defaults.
    pub fn bulk_insert_rows(
        &self,
        table: &str,
        columns: &[&str],
        rows: &[Vec<DbValue>],
    ) -> Result<u64, BackendError> {
        self.ensure_writable()?;
        let conn = self.conn.as_ref();
        bulk_insert_rows_chunked(
            |sql, params| execute_on_conn(conn, sql, params),
            table,
            columns,
            rows,
            DEFAULT_MAX_PARAMS,
        )
    }

    /// Query and return all rows.
    pub fn query_all(&self, sql: &str, params: &[DbValue]) -> Result<Vec<DbRow>, BackendError> {
        query_on_conn(&self.conn, sql, params)
    }

    /// Query and return the first row, if any.
    pub fn query_optional(
        &self,
        sql: &str,
        params: &[DbValue],
    ) -> Result<Option<DbRow>, BackendError> {
        let rows = self.query_all(sql, params)?;
        Ok(rows.into_iter().next())
    }

    /// Query and return exactly one row.
    pub fn query_one(&self, sql: &str, params: &[DbValue]) -> Result<DbRow, BackendError> {
        self.query_optional(sql, params)?
            .ok_or_else(|| BackendError::Query("Expected one row, got none".to_string()))
    }

    /// Query and return a single scalar value.
    pub fn query_scalar<T: FromDbValue>(
        &self,
        sql: &str,
        params: &[DbValue],
    ) -> Result<T, BackendError> {
        let row = self.query_one(sql, params)?;
        row.get(0)
    }

    /// Run `op` inside BEGIN/COMMIT; any error rolls the transaction back.
    pub fn transaction<T, F>(&self, op: F) -> Result<T, BackendError>
    where
        F: for<'a> FnOnce(&'a mut DbTransaction<'a>) -> Result<T, BackendError>,
    {
        self.ensure_writable()?;
        self.conn.execute_batch("BEGIN")?;
        let mut tx = DbTransaction {
            conn: self.conn.as_ref(),
        };
        let result = op(&mut tx);

        match result {
            Ok(value) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(err) => match self.conn.execute_batch("ROLLBACK") {
                Ok(()) => Err(err),
                Err(rollback_err) => Err(BackendError::Transaction(format!(
                    "Transaction failed: {}; rollback failed: {}",
                    err, rollback_err
                ))),
            },
        }
    }

    fn ensure_writable(&self) -> Result<(), BackendError> {
        if self.access_mode == AccessMode::ReadOnly {
            return Err(BackendError::ReadOnly);
        }
        Ok(())
    }
}

/// Statement handle scoped to an open transaction.
pub struct DbTransaction<'a> {
    conn: &'a duckdb::Connection,
}

impl<'a> DbTransaction<'a> {
    pub fn execute(&mut self, sql: &str, params: &[DbValue]) -> Result<u64, BackendError> {
        execute_on_conn(self.conn, sql, params)
    }

    pub fn execute_batch(&mut self, sql: &str) -> Result<(), BackendError> {
        execute_batch_on_conn(self.conn, sql)
    }

    pub fn query_all(&mut self, sql: &str, params: &[DbValue]) -> Result<Vec<DbRow>, BackendError> {
        query_on_conn(self.conn, sql, params)
    }

    pub fn query_scalar<T: FromDbValue>(
        &mut self,
        sql: &str,
        params: &[DbValue],
    ) -> Result<T, BackendError> {
        let row = self
            .query_all(sql, params)?
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::Query("Expected one row, got none".to_string()))?;
        row.get(0)
    }

    /// Bulk insert rows into a table within this transaction.
    pub fn bulk_insert_rows(
        &mut self,
        table: &str,
        columns: &[&str],
        rows: &[Vec<DbValue>],
    ) -> Result<u64, BackendError> {
        let conn = self.conn;
        bulk_insert_rows_chunked(
            |sql, params| execute_on_conn(conn, sql, params),
            table,
            columns,
            rows,
            DEFAULT_MAX_PARAMS,
        )
    }
}

fn execute_on_conn(
    conn: &duckdb::Connection,
    sql: &str,
    params: &[DbValue],
) -> Result<u64, BackendError> {
    let span = debug_span!(
        "db.exec",
        op = sql_op_name(sql),
        sql_hash = %hash_sql(sql),
        duration_ms = tracing::field::Empty
    );
    let _guard = span.enter();
    let start = Instant::now();

    let mut stmt = conn.prepare(sql)?;
    let values = to_duckdb_params(params);
    let param_refs: Vec<&dyn duckdb::ToSql> =
        values.iter().map(|v| v as &dyn duckdb::ToSql).collect();
    let rows = stmt.execute(param_refs.as_slice())?;

    span.record("duration_ms", start.elapsed().as_millis() as u64);
    Ok(rows as u64)
}

fn execute_batch_on_conn(conn: &duckdb::Connection, sql: &str) -> Result<(), BackendError> {
    let span = debug_span!(
        "db.exec_batch",
        op = "BATCH",
        sql_hash = %hash_sql(sql),
        duration_ms = tracing::field::Empty
    );
    let _guard = span.enter();
    let start = Instant::now();
    conn.execute_batch(sql)?;
    span.record("duration_ms", start.elapsed().as_millis() as u64);
    Ok(())
}

fn query_on_conn(
    conn: &duckdb::Connection,
    sql: &str,
    params: &[DbValue],
) -> Result<Vec<DbRow>, BackendError> {
    let span = debug_span!(
        "db.query",
        op = sql_op_name(sql),
        sql_hash = %hash_sql(sql),
        duration_ms = tracing::field::Empty
    );
    let _guard = span.enter();
    let start = Instant::now();

    let mut stmt = conn.prepare(sql)?;
    let values = to_duckdb_params(params);
    let param_refs: Vec<&dyn duckdb::ToSql> =
        values.iter().map(|v| v as &dyn duckdb::ToSql).collect();
    let mut rows_iter = stmt.query(param_refs.as_slice())?;

    let columns: Vec<String> = match rows_iter.as_ref() {
        Some(stmt_ref) => (0..stmt_ref.column_count())
            .map(|i| {
                stmt_ref
                    .column_name(i)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|_| format!("col{}", i))
            })
            .collect(),
        None => return Ok(Vec::new()),
    };

    let mut result = Vec::new();
    while let Some(row) = rows_iter.next()? {
        let mut values = Vec::with_capacity(columns.len());
        for i in 0..columns.len() {
            values.push(from_duckdb_value(row, i)?);
        }
        result.push(DbRow::new(columns.clone(), values));
    }

    span.record("duration_ms", start.elapsed().as_millis() as u64);
    Ok(result)
}

fn to_duckdb_params(params: &[DbValue]) -> Vec<duckdb::types::Value> {
    params
        .iter()
        .map(|p| match p {
            DbValue::Null => duckdb::types::Value::Null,
            DbValue::Integer(v) => duckdb::types::Value::BigInt(*v),
            DbValue::Real(v) => duckdb::types::Value::Double(*v),
            DbValue::Text(v) => duckdb::types::Value::Text(v.clone()),
            DbValue::Blob(v) => duckdb::types::Value::Blob(v.clone()),
            DbValue::Boolean(v) => duckdb::types::Value::Boolean(*v),
            DbValue::Timestamp(v) => duckdb::types::Value::Timestamp(
                duckdb::types::TimeUnit::Microsecond,
                v.as_chrono().timestamp_micros(),
            ),
        })
        .collect()
}

fn from_duckdb_value(row: &duckdb::Row, index: usize) -> Result<DbValue, duckdb::Error> {
    use duckdb::types::{TimeUnit, ValueRef};

    let value = match row.get_ref(index)? {
        ValueRef::Null => DbValue::Null,
        ValueRef::Boolean(v) => DbValue::Boolean(v),
        ValueRef::TinyInt(v) => DbValue::Integer(v as i64),
        ValueRef::SmallInt(v) => DbValue::Integer(v as i64),
        ValueRef::Int(v) => DbValue::Integer(v as i64),
        ValueRef::BigInt(v) => DbValue::Integer(v),
        ValueRef::HugeInt(v) => DbValue::Integer(v as i64),
        ValueRef::UTinyInt(v) => DbValue::Integer(v as i64),
        ValueRef::USmallInt(v) => DbValue::Integer(v as i64),
        ValueRef::UInt(v) => DbValue::Integer(v as i64),
        ValueRef::UBigInt(v) => DbValue::Integer(v as i64),
        ValueRef::Float(v) => DbValue::Real(v as f64),
        ValueRef::Double(v) => DbValue::Real(v),
        ValueRef::Text(v) => DbValue::Text(String::from_utf8_lossy(v).to_string()),
        ValueRef::Blob(v) => DbValue::Blob(v.to_vec()),
        ValueRef::Timestamp(unit, v) => {
            let micros = match unit {
                TimeUnit::Second => v * 1_000_000,
                TimeUnit::Millisecond => v * 1_000,
                TimeUnit::Microsecond => v,
                TimeUnit::Nanosecond => v / 1_000,
            };
            match DbTimestamp::from_unix_micros(micros) {
                Some(ts) => DbValue::Timestamp(ts),
                None => DbValue::Integer(micros),
            }
        }
        other => {
            tracing::warn!(
                "DuckDB type {:?} at column {} mapped to debug string",
                std::mem::discriminant(&other),
                index
            );
            DbValue::Text(format!("{:?}", other))
        }
    };
    Ok(value)
}

/// DuckDB accepts far more, but keeping statements small keeps prepare cheap.
const DEFAULT_MAX_PARAMS: usize = 999;

fn bulk_insert_rows_chunked<F>(
    mut execute: F,
    table: &str,
    columns: &[&str],
    rows: &[Vec<DbValue>],
    max_params: usize,
) -> Result<u64, BackendError>
where
    F: FnMut(&str, &[DbValue]) -> Result<u64, BackendError>,
{
    if rows.is_empty() {
        return Ok(0);
    }
    if columns.is_empty() {
        return Err(BackendError::InvalidInput(
            "bulk_insert_rows requires at least one column".to_string(),
        ));
    }
    for (index, row) in rows.iter().enumerate() {
        if row.len() != columns.len() {
            return Err(BackendError::InvalidInput(format!(
                "Row {} has {} values, expected {}",
                index,
                row.len(),
                columns.len()
            )));
        }
    }

    let cols_len = columns.len();
    if cols_len > max_params {
        return Err(BackendError::InvalidInput(format!(
            "Too many columns ({}) for max params ({})",
            cols_len, max_params
        )));
    }
    let rows_per_chunk = max_params / cols_len;

    let quoted_table = quote_ident(table);
    let quoted_cols = columns
        .iter()
        .map(|col| quote_ident(col))
        .collect::<Vec<_>>()
        .join(", ");
    let row_clause = format!("({})", vec!["?"; cols_len].join(", "));

    let mut total = 0;
    for chunk in rows.chunks(rows_per_chunk) {
        let values_clause = vec![row_clause.as_str(); chunk.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            quoted_table, quoted_cols, values_clause
        );
        let params: Vec<DbValue> = chunk.iter().flatten().cloned().collect();
        execute(&sql, &params)?;
        total += chunk.len() as u64;
    }

    Ok(total)
}

/// Quote an identifier for use in generated SQL.
pub fn quote_ident(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len() + 2);
    escaped.push('"');
    for ch in name.chars() {
        if ch == '"' {
            escaped.push('"');
        }
        escaped.push(ch);
    }
    escaped.push('"');
    escaped
}

fn sql_op_name(sql: &str) -> &str {
    sql.split_whitespace().next().unwrap_or("unknown")
}

fn hash_sql(sql: &str) -> String {
    // FNV-1a 64-bit hash for low-cardinality, stable identification.
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in sql.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    format!("{:016x}", hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bulk_insert_rows_inserts_expected_rows() {
        let conn = DbConnection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id BIGINT, name TEXT)")
            .unwrap();

        let rows = vec![
            vec![DbValue::from(1_i64), DbValue::from("alpha")],
            vec![DbValue::from(2_i64), DbValue::from("beta")],
        ];
        let inserted = conn.bulk_insert_rows("t", &["id", "name"], &rows).unwrap();

        assert_eq!(inserted, 2);
        let count: i64 = conn.query_scalar("SELECT COUNT(*) FROM t", &[]).unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn bulk_insert_rows_spans_multiple_statements() {
        let conn = DbConnection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (a DOUBLE, b DOUBLE, c DOUBLE)")
            .unwrap();

        // 3 columns -> 333 rows per statement
        let rows: Vec<Vec<DbValue>> = (0..1000)
            .map(|i| vec![DbValue::from(i as f64), DbValue::Null, DbValue::from(1.5)])
            .collect();
        let inserted = conn.bulk_insert_rows("t", &["a", "b", "c"], &rows).unwrap();

        assert_eq!(inserted, 1000);
        let sum: f64 = conn.query_scalar("SELECT SUM(c) FROM t", &[]).unwrap();
        assert_eq!(sum, 1500.0);
    }

    #[test]
    fn bulk_insert_rows_leaves_unlisted_columns_default() {
        let conn = DbConnection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (key BIGINT, v DOUBLE)")
            .unwrap();

        conn.bulk_insert_rows("t", &["v"], &[vec![DbValue::from(2.0)]])
            .unwrap();
        let key: Option<i64> = conn.query_scalar("SELECT key FROM t", &[]).unwrap();
        assert_eq!(key, None);
    }

    #[test]
    fn bulk_insert_rows_rejects_mismatched_row_len() {
        let conn = DbConnection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id BIGINT, name TEXT)")
            .unwrap();

        let rows = vec![
            vec![DbValue::from(1_i64)],
            vec![DbValue::from(2_i64), DbValue::from("beta")],
        ];
        let err = conn
            .bulk_insert_rows("t", &["id", "name"], &rows)
            .unwrap_err();
        assert!(matches!(err, BackendError::InvalidInput(_)));
    }

    #[test]
    fn bulk_insert_rows_empty_is_noop() {
        let conn = DbConnection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id BIGINT)").unwrap();

        let inserted = conn.bulk_insert_rows("t", &["id"], &[]).unwrap();
        assert_eq!(inserted, 0);
    }

    #[test]
    fn transaction_rolls_back_on_error() {
        let conn = DbConnection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (v DOUBLE)").unwrap();

        let result: Result<(), BackendError> = conn.transaction(|tx| {
            tx.execute("INSERT INTO t VALUES (?)", &[DbValue::from(1.0)])?;
            tx.execute("INSERT INTO t VALUES (?)", &[DbValue::from("not a number")])?;
            Ok(())
        });

        assert!(result.is_err());
        let count: i64 = conn.query_scalar("SELECT COUNT(*) FROM t", &[]).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn timestamps_round_trip_through_duckdb() {
        let conn = DbConnection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (at TIMESTAMP)").unwrap();

        let now = DbTimestamp::now();
        conn.execute("INSERT INTO t VALUES (?)", &[DbValue::from(now.clone())])
            .unwrap();
        let stored: DbTimestamp = conn.query_scalar("SELECT at FROM t", &[]).unwrap();

        assert_eq!(stored.as_chrono().timestamp_micros(), now.as_chrono().timestamp_micros());
    }

    #[test]
    fn quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("T0_(K)"), "\"T0_(K)\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }
}
