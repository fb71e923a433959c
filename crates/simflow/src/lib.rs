//! simflow: moves simulation outputs from a drop directory into a DuckDB
//! warehouse.
//!
//! Raw files land in `incoming/<day>/`. Fact CSVs are cleaned into
//! `processed/<day>/` (originals go to `archive/<day>/`), loaded into
//! `fact_sim` and promoted to `ingested/<day>/`. Metadata JSON goes straight
//! from `incoming` into `dim_rxn` and `ingested`. Every load is audited in
//! `run_log`.
//!
//! ```rust,ignore
//! let config = IngestConfig::resolve(None)?;
//! let contracts = Contracts::load(&config.column_map_path(), &config.required_columns_path())?;
//! let warehouse = Warehouse::open(&config.database_path(), &contracts.required)?;
//! let coordinator = Coordinator::new(
//!     StageManager::new(&config.root, contracts.mapping.clone()),
//!     SchemaValidator::new(contracts.required.clone()),
//!     warehouse,
//!     config.settings(),
//! );
//! let report = coordinator.run_batch()?;
//! ```

pub mod clean;
pub mod config;
pub mod contract;
pub mod coordinator;
pub mod error;
pub mod run_id;
pub mod stage;
pub mod validator;
pub mod warehouse;

pub use config::{ConfigError, IngestConfig};
pub use contract::{ColumnMapping, ContractError, Contracts, RequiredColumns};
pub use coordinator::{BatchReport, BulkLoadMode, Coordinator, FileOutcome, IngestSettings};
pub use error::{IngestError, Result};
pub use run_id::{FileKind, RunId, RunIdError};
pub use stage::{CleanSummary, FileFailure, RawGroup, Stage, StageManager, StagedFile};
pub use validator::SchemaValidator;
pub use warehouse::metadata::MetadataRecord;
pub use warehouse::run_log::{LoadType, RunLogEntry, RunLogId, RunStatus};
pub use warehouse::Warehouse;
