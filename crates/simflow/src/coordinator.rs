//! One ingestion pass over the run root.
//!
//! ```text
//! provision ─▶ clean incoming ─▶ [drop indexes] ─▶ load facts ─▶ load metadata
//!                                                                     │
//!          stale report ◀── reconcile keys ◀── recreate indexes ◀────┘
//! ```
//!
//! Each file is handled on its own: an error is logged with the file and
//! run id, counted in the [`BatchReport`] and the file stays where it is
//! for the next batch.

use crate::error::{IngestError, Result};
use crate::run_id::RunId;
use crate::stage::{FileFailure, StageManager, StagedFile};
use crate::validator::SchemaValidator;
use crate::warehouse::metadata::MetadataRecord;
use crate::warehouse::run_log::{LoadType, RunLogEntry, RunLogId, RunStatus};
use crate::warehouse::Warehouse;
use serde::Serialize;
use simflow_db::BackendError;
use std::collections::BTreeSet;
use tracing::{error, info, warn};

/// Batch tuning knobs.
#[derive(Debug, Clone)]
pub struct IngestSettings {
    /// Drop fact indexes for the batch when more files than this are pending.
    pub index_drop_threshold: usize,
    /// A `running` run log record older than this is reported as stale.
    pub stale_run_after: chrono::Duration,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            index_drop_threshold: 50,
            stale_run_after: chrono::Duration::hours(24),
        }
    }
}

/// How a single file left the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FileOutcome {
    /// Loaded in this batch and promoted.
    Loaded { run_id: RunId, rows: u64 },
    /// The warehouse already held this run; the file was promoted without loading.
    ///
    /// `open_run_logs` lists records of an earlier attempt that are still
    /// running, usually left by a crash between commit and promotion.
    AlreadyLoaded {
        run_id: RunId,
        open_run_logs: Vec<RunLogId>,
    },
}

impl FileOutcome {
    pub fn run_id(&self) -> &RunId {
        match self {
            FileOutcome::Loaded { run_id, .. } | FileOutcome::AlreadyLoaded { run_id, .. } => run_id,
        }
    }
}

/// Summary of one [`Coordinator::run_batch`].
#[derive(Debug, Default, Serialize)]
pub struct BatchReport {
    pub provisioned: bool,
    pub cleaned: usize,
    pub fact_outcomes: Vec<FileOutcome>,
    pub metadata_outcomes: Vec<FileOutcome>,
    pub failures: Vec<FileFailure>,
    /// Whether indexes were dropped for this batch.
    pub bulk_load_mode: bool,
    pub indexes_recreated: bool,
    pub reconciled_rows: u64,
    pub stale_runs: Vec<RunLogEntry>,
}

impl BatchReport {
    pub fn rows_loaded(&self) -> u64 {
        self.fact_outcomes
            .iter()
            .map(|o| match o {
                FileOutcome::Loaded { rows, .. } => *rows,
                FileOutcome::AlreadyLoaded { .. } => 0,
            })
            .sum()
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Drops the fact indexes for the duration of a large batch.
///
/// Indexes are recreated by [`BulkLoadMode::finish`], or on drop if the
/// guard is abandoned early. Recreation is idempotent, so `finish` always
/// issues it.
pub struct BulkLoadMode<'a> {
    warehouse: &'a Warehouse,
    active: bool,
}

impl<'a> BulkLoadMode<'a> {
    pub fn enter(warehouse: &'a Warehouse, enabled: bool) -> Self {
        if enabled {
            if let Err(err) = warehouse.drop_indexes() {
                warn!("Could not drop indexes, loading with them in place: {}", err);
            }
        }
        Self {
            warehouse,
            active: enabled,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn finish(mut self) -> std::result::Result<(), BackendError> {
        self.active = false;
        self.warehouse.recreate_indexes()
    }
}

impl Drop for BulkLoadMode<'_> {
    fn drop(&mut self) {
        if self.active {
            if let Err(err) = self.warehouse.recreate_indexes() {
                error!("Could not recreate indexes after bulk load: {}", err);
            }
        }
    }
}

/// Runs batches against one run root and one warehouse.
pub struct Coordinator {
    stages: StageManager,
    validator: SchemaValidator,
    warehouse: Warehouse,
    settings: IngestSettings,
}

impl Coordinator {
    pub fn new(
        stages: StageManager,
        validator: SchemaValidator,
        warehouse: Warehouse,
        settings: IngestSettings,
    ) -> Self {
        Self {
            stages,
            validator,
            warehouse,
            settings,
        }
    }

    pub fn stages(&self) -> &StageManager {
        &self.stages
    }

    pub fn warehouse(&self) -> &Warehouse {
        &self.warehouse
    }

    /// Run one full pass. Only stage discovery errors abort the batch.
    pub fn run_batch(&self) -> Result<BatchReport> {
        let mut report = BatchReport {
            provisioned: self.warehouse.provision_schema(),
            ..Default::default()
        };

        let cleaning = self.stages.clean_incoming()?;
        report.cleaned = cleaning.cleaned.len();
        report.failures.extend(cleaning.failed);

        let facts = self.stages.list_processed_uningested()?;
        let mut touched: BTreeSet<RunId> = BTreeSet::new();

        let bulk = BulkLoadMode::enter(
            &self.warehouse,
            facts.len() > self.settings.index_drop_threshold,
        );
        report.bulk_load_mode = bulk.is_active();
        if report.bulk_load_mode {
            info!(
                files = facts.len(),
                threshold = self.settings.index_drop_threshold,
                "Bulk load mode: indexes dropped for this batch"
            );
        }

        for file in &facts {
            match self.ingest_fact(file) {
                Ok(outcome) => {
                    touched.insert(outcome.run_id().clone());
                    report.fact_outcomes.push(outcome);
                }
                Err(err) => {
                    error!(file = %file.path.display(), run_id = %file.run_id, "Fact load failed: {}", err);
                    report
                        .failures
                        .push(FileFailure::new(&file.path, Some(file.run_id.clone()), &err));
                }
            }
        }

        for file in self.stages.list_incoming_metadata()? {
            match self.ingest_metadata(&file) {
                Ok(outcome) => {
                    touched.insert(outcome.run_id().clone());
                    report.metadata_outcomes.push(outcome);
                }
                Err(err) => {
                    error!(file = %file.path.display(), run_id = %file.run_id, "Metadata load failed: {}", err);
                    report
                        .failures
                        .push(FileFailure::new(&file.path, Some(file.run_id.clone()), &err));
                }
            }
        }

        match bulk.finish() {
            Ok(()) => report.indexes_recreated = true,
            Err(err) => error!("Could not recreate indexes: {}", err),
        }

        for run_id in &touched {
            match self.warehouse.reconcile_surrogate_key(run_id) {
                Ok(rows) => report.reconciled_rows += rows,
                Err(err) => error!(run_id = %run_id, "Surrogate key reconciliation failed: {}", err),
            }
        }

        report.stale_runs = self.report_stale_runs();

        info!(
            cleaned = report.cleaned,
            facts = report.fact_outcomes.len(),
            metadata = report.metadata_outcomes.len(),
            rows = report.rows_loaded(),
            failures = report.failures.len(),
            "Batch finished"
        );
        Ok(report)
    }

    /// Validate, load and promote one processed fact file.
    ///
    /// The run log record is opened before the load and closed only after
    /// promotion. A load failure leaves it running and the file in processed.
    pub fn ingest_fact(&self, file: &StagedFile) -> Result<FileOutcome> {
        let run_id = &file.run_id;
        self.validator.validate(&file.path)?;

        let existing = self
            .warehouse
            .fact_rows_for_run(run_id)
            .map_err(|source| load_error(run_id, source))?;
        if existing > 0 {
            warn!(
                file = %file.file_name(),
                run_id = %run_id,
                rows = existing,
                "Run already in warehouse, promoting without reloading"
            );
            let open_run_logs = self.open_attempts(run_id, LoadType::Fact);
            self.stages.promote_to_ingested(file)?;
            return Ok(FileOutcome::AlreadyLoaded {
                run_id: run_id.clone(),
                open_run_logs,
            });
        }

        let log_id = self
            .warehouse
            .open_run(run_id, LoadType::Fact)
            .map_err(|source| audit_error(run_id, source))?;
        let rows = self
            .warehouse
            .bulk_load_fact(file)
            .map_err(|source| load_error(run_id, source))?;
        self.stages.promote_to_ingested(file)?;

        if let Err(err) = self.warehouse.close_run(&log_id, LoadType::Fact, rows) {
            error!(run_id = %run_id, run_log_id = %log_id, "Audit gap, run log not closed: {}", err);
        }
        info!(file = %file.file_name(), run_id = %run_id, rows, "Loaded fact file");
        Ok(FileOutcome::Loaded {
            run_id: run_id.clone(),
            rows,
        })
    }

    /// Validate, insert and promote one metadata file.
    ///
    /// The run log record is opened before the file is parsed, so a record
    /// that fails validation leaves an open entry behind.
    pub fn ingest_metadata(&self, file: &StagedFile) -> Result<FileOutcome> {
        let run_id = &file.run_id;

        let exists = self
            .warehouse
            .metadata_exists(run_id)
            .map_err(|source| load_error(run_id, source))?;
        if exists {
            warn!(
                file = %file.file_name(),
                run_id = %run_id,
                "Metadata already in warehouse, promoting without reinserting"
            );
            let open_run_logs = self.open_attempts(run_id, LoadType::Metadata);
            self.stages.promote_to_ingested(file)?;
            return Ok(FileOutcome::AlreadyLoaded {
                run_id: run_id.clone(),
                open_run_logs,
            });
        }

        let log_id = self
            .warehouse
            .open_run(run_id, LoadType::Metadata)
            .map_err(|source| audit_error(run_id, source))?;
        let record = MetadataRecord::load(&file.path, run_id)?;
        let sim_key = self
            .warehouse
            .insert_metadata(&record)
            .map_err(|source| load_error(run_id, source))?;
        self.stages.promote_to_ingested(file)?;

        if let Err(err) = self.warehouse.close_run(&log_id, LoadType::Metadata, 1) {
            error!(run_id = %run_id, run_log_id = %log_id, "Audit gap, run log not closed: {}", err);
        }
        info!(file = %file.file_name(), run_id = %run_id, sim_key, "Loaded metadata");
        Ok(FileOutcome::Loaded {
            run_id: run_id.clone(),
            rows: 1,
        })
    }

    /// Run log records of an earlier attempt that never closed.
    ///
    /// They are left running for an operator to resolve; this only names them.
    fn open_attempts(&self, run_id: &RunId, load_type: LoadType) -> Vec<RunLogId> {
        let entries = match self.warehouse.runs_for(run_id) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(run_id = %run_id, "Could not look up earlier run log records: {}", err);
                return Vec::new();
            }
        };
        entries
            .into_iter()
            .filter(|e| e.status == RunStatus::Running && e.load_type == load_type)
            .map(|e| {
                warn!(
                    run_id = %run_id,
                    run_log_id = %e.id,
                    load_type = %load_type,
                    started_at = %e.started_at.to_rfc3339(),
                    "Earlier attempt left its run log record running"
                );
                e.id
            })
            .collect()
    }

    fn report_stale_runs(&self) -> Vec<RunLogEntry> {
        match self.warehouse.stale_runs(self.settings.stale_run_after) {
            Ok(stale) => {
                for entry in &stale {
                    warn!(
                        run_id = %entry.simulation_id,
                        run_log_id = %entry.id,
                        load_type = %entry.load_type,
                        started_at = %entry.started_at.to_rfc3339(),
                        "Run log record still running"
                    );
                }
                stale
            }
            Err(err) => {
                error!("Could not query stale run log records: {}", err);
                Vec::new()
            }
        }
    }
}

fn load_error(run_id: &RunId, source: BackendError) -> IngestError {
    IngestError::Load {
        run_id: run_id.clone(),
        source,
    }
}

fn audit_error(run_id: &RunId, source: BackendError) -> IngestError {
    IngestError::Audit {
        run_id: run_id.clone(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{ColumnMapping, RequiredColumns};
    use simflow_db::DbConnection;

    #[test]
    fn bulk_load_mode_recreates_on_drop() {
        let wh = Warehouse::from_connection(
            DbConnection::open_in_memory().unwrap(),
            &RequiredColumns::from_columns(["time_s"]),
        );
        assert!(wh.provision_schema());

        {
            let guard = BulkLoadMode::enter(&wh, true);
            assert!(guard.is_active());
            assert!(wh.index_names().unwrap().is_empty());
        }
        assert_eq!(wh.index_names().unwrap().len(), 1);

        let guard = BulkLoadMode::enter(&wh, false);
        assert!(!guard.is_active());
        assert_eq!(wh.index_names().unwrap().len(), 1);
        guard.finish().unwrap();
    }

    #[test]
    fn empty_root_runs_clean_batch() {
        let tmp = tempfile::TempDir::new().unwrap();
        let required = RequiredColumns::from_columns(["time_s"]);
        let coordinator = Coordinator::new(
            StageManager::new(tmp.path(), ColumnMapping::from_pairs([("t", "time_s")])),
            SchemaValidator::new(required.clone()),
            Warehouse::from_connection(DbConnection::open_in_memory().unwrap(), &required),
            IngestSettings::default(),
        );

        let report = coordinator.run_batch().unwrap();
        assert!(report.provisioned);
        assert!(!report.bulk_load_mode);
        assert!(report.indexes_recreated);
        assert!(report.fact_outcomes.is_empty());
        assert!(!report.has_failures());
    }
}
