//! Warehouse DDL.
//!
//! All CREATE statements live here. The fact table is the only one whose
//! shape depends on input: its measurement columns come from the
//! required-column contract.

use simflow_db::quote_ident;

pub const FACT_TABLE: &str = "fact_sim";
pub const DIM_TABLE: &str = "dim_rxn";
pub const RUN_LOG_TABLE: &str = "run_log";
pub const SIM_KEY_SEQUENCE: &str = "dim_rxn_sim_key_seq";

pub const SIM_KEY: &str = "sim_key";
pub const SIMULATION_ID: &str = "simulation_id";

/// Fact columns owned by the loader. A file never supplies them.
pub const RESERVED_FACT_COLUMNS: [&str; 2] = [SIM_KEY, SIMULATION_ID];

/// A named secondary index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexDef {
    pub name: &'static str,
    pub table: &'static str,
    pub columns: &'static [&'static str],
}

impl IndexDef {
    pub fn create_sql(&self) -> String {
        let columns = self
            .columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({});",
            quote_ident(self.name),
            quote_ident(self.table),
            columns
        )
    }

    pub fn drop_sql(&self) -> String {
        format!("DROP INDEX IF EXISTS {};", quote_ident(self.name))
    }
}

/// Secondary indexes on the fact table, toggled together during bulk loads.
/// Must not include `sim_key`, which reconciliation updates in place.
pub const FACT_INDEXES: &[IndexDef] = &[IndexDef {
    name: "idx_fact_sim_simulation_id",
    table: FACT_TABLE,
    columns: &[SIMULATION_ID],
}];

pub fn is_reserved_fact_column(name: &str) -> bool {
    RESERVED_FACT_COLUMNS.contains(&name)
}

pub fn dim_table_ddl() -> String {
    format!(
        r#"CREATE SEQUENCE IF NOT EXISTS {seq};
CREATE TABLE IF NOT EXISTS {table} (
    sim_key BIGINT PRIMARY KEY DEFAULT nextval('{seq}'),
    simulation_id TEXT NOT NULL UNIQUE,
    reaction_name TEXT NOT NULL,
    activation_energy DOUBLE NOT NULL,
    ca0 DOUBLE NOT NULL,
    cb0 DOUBLE NOT NULL,
    t0 DOUBLE NOT NULL,
    date_run TEXT NOT NULL,
    stop_reason TEXT NOT NULL,
    stop_time_s DOUBLE NOT NULL
);"#,
        seq = SIM_KEY_SEQUENCE,
        table = DIM_TABLE
    )
}

pub fn run_log_ddl() -> String {
    format!(
        r#"CREATE TABLE IF NOT EXISTS {table} (
    id TEXT PRIMARY KEY,
    simulation_id TEXT NOT NULL,
    load_type TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TIMESTAMP NOT NULL,
    finished_at TIMESTAMP,
    rows_inserted BIGINT,
    duration_ms BIGINT
);"#,
        table = RUN_LOG_TABLE
    )
}

/// Fact table with one DOUBLE column per measurement plus the loader's keys.
pub fn fact_table_ddl<S: AsRef<str>>(measurements: &[S]) -> String {
    let mut columns: Vec<String> = measurements
        .iter()
        .map(|c| format!("    {} DOUBLE", quote_ident(c.as_ref())))
        .collect();
    columns.push(format!("    {} BIGINT", SIM_KEY));
    columns.push(format!("    {} TEXT NOT NULL", SIMULATION_ID));
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n{}\n);",
        FACT_TABLE,
        columns.join(",\n")
    )
}

/// Every statement needed to bring an empty database up to date.
pub fn provision_sql<S: AsRef<str>>(measurements: &[S]) -> String {
    let mut sql = vec![dim_table_ddl(), run_log_ddl(), fact_table_ddl(measurements)];
    sql.extend(FACT_INDEXES.iter().map(IndexDef::create_sql));
    sql.join("\n")
}
