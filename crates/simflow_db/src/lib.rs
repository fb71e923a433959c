//! Warehouse connection layer for simflow.
//!
//! Everything that touches DuckDB directly lives here. The warehouse gateway
//! in the `simflow` crate builds its SQL on top of [`DbConnection`].
//!
//! ```rust,ignore
//! use simflow_db::{DbConnection, DbValue};
//!
//! let conn = DbConnection::open(Path::new("warehouse.duckdb"))?;
//! let rows: i64 = conn.query_scalar(
//!     "SELECT COUNT(*) FROM fact_sim WHERE simulation_id = ?",
//!     &[DbValue::from("R1")],
//! )?;
//! ```

pub mod backend;
pub mod lock;

pub use backend::{
    quote_ident, AccessMode, BackendError, DbConnection, DbRow, DbTimestamp, DbTransaction,
    DbValue, FromDbValue,
};
pub use lock::{lock_path_for, LockError};
