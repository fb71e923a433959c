//! End-to-end batches against a temp run root and a file-backed warehouse.

use simflow::{
    ColumnMapping, Contracts, Coordinator, FileOutcome, IngestError, IngestSettings, LoadType,
    RequiredColumns, RunId, RunStatus, SchemaValidator, Stage, StageManager, StagedFile,
    Warehouse,
};
use simflow_db::{BackendError, DbValue};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const DAY: &str = "2024-01-01";
const RAW_HEADER: &str = "Unnamed: 0,Time (s),CA (mol/m^3),T (K)";

/// Run root with contracts written and a warehouse path, cleaned up on drop.
struct TestEnv {
    _temp: TempDir,
    root: PathBuf,
    db_path: PathBuf,
    contracts: Contracts,
}

impl TestEnv {
    fn new() -> Self {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let root = temp.path().join("run_root");
        fs::create_dir_all(&root).expect("Failed to create run root");
        let db_path = root.join("warehouse.duckdb");

        let map_path = root.join("column_map.json");
        let req_path = root.join("required_cols.json");
        fs::write(
            &map_path,
            r#"{"Time (s)": "time_s", "CA (mol/m^3)": "ca", "T (K)": "temp_k"}"#,
        )
        .unwrap();
        fs::write(
            &req_path,
            r#"{"time": "time_s", "conc_a": "ca", "temperature": "temp_k"}"#,
        )
        .unwrap();
        let contracts = Contracts::load(&map_path, &req_path).expect("contracts agree");

        Self {
            _temp: temp,
            root,
            db_path,
            contracts,
        }
    }

    fn coordinator(&self) -> Coordinator {
        self.coordinator_with(IngestSettings::default())
    }

    fn coordinator_with(&self, settings: IngestSettings) -> Coordinator {
        let warehouse =
            Warehouse::open(&self.db_path, &self.contracts.required).expect("open warehouse");
        Coordinator::new(
            self.stages(),
            SchemaValidator::new(self.contracts.required.clone()),
            warehouse,
            settings,
        )
    }

    fn stages(&self) -> StageManager {
        StageManager::new(&self.root, self.contracts.mapping.clone())
    }

    fn path(&self, stage: Stage, name: &str) -> PathBuf {
        self.root.join(stage.dir_name()).join(DAY).join(name)
    }

    fn write(&self, stage: Stage, name: &str, content: &str) -> PathBuf {
        let path = self.path(stage, name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).expect("Failed to write file");
        path
    }

    fn write_raw_results(&self, run_id: &str, rows: usize) -> PathBuf {
        let mut content = format!("{}\n", RAW_HEADER);
        for i in 0..rows {
            content.push_str(&format!("{},{}.0,{}.5,300\n", i, i, i));
        }
        self.write(Stage::Incoming, &format!("results_{}.csv", run_id), &content)
    }

    fn write_metadata(&self, run_id: &str, with_stop_reason: bool) -> PathBuf {
        let stop_reason = if with_stop_reason {
            r#""stop_reason": "converged","#
        } else {
            ""
        };
        let content = format!(
            r#"{{
    "simulation_id": "{run_id}",
    "reaction_name": "A + B -> C",
    "activation_energy (J/mol)": 45000.0,
    "CA0_(mol/m^3)": 1.0,
    "CB0_(mol/m^3)": 2.0,
    "T0_(K)": 300.0,
    "date_run": "2024-01-01",
    {stop_reason}
    "stop_time_(s)": 120.0
}}"#
        );
        self.write(Stage::Incoming, &format!("metadata_{}.json", run_id), &content)
    }
}

fn run(id: &str) -> RunId {
    RunId::new(id).unwrap()
}

fn count(wh: &Warehouse, sql: &str, params: &[DbValue]) -> i64 {
    wh.connection().query_scalar(sql, params).unwrap()
}

fn exists(path: &Path) -> bool {
    path.exists()
}

// ============================================================================
// Success path
// ============================================================================

#[test]
fn test_fact_and_metadata_reach_ingested() {
    let env = TestEnv::new();
    let raw = env.write_raw_results("R1", 3);
    env.write_metadata("R1", true);

    let coordinator = env.coordinator();
    let report = coordinator.run_batch().unwrap();

    assert!(!report.has_failures(), "failures: {:?}", report.failures);
    assert_eq!(report.cleaned, 1);
    assert_eq!(
        report.fact_outcomes,
        vec![FileOutcome::Loaded {
            run_id: run("R1"),
            rows: 3
        }]
    );
    assert_eq!(report.metadata_outcomes.len(), 1);
    assert_eq!(report.reconciled_rows, 3);

    assert!(!exists(&raw));
    assert!(exists(&env.path(Stage::Archive, "results_R1.csv")));
    assert!(!exists(&env.path(Stage::Processed, "results_R1.csv")));
    assert!(exists(&env.path(Stage::Ingested, "results_R1.csv")));
    assert!(exists(&env.path(Stage::Ingested, "metadata_R1.json")));

    let wh = coordinator.warehouse();
    assert_eq!(wh.fact_rows_for_run(&run("R1")).unwrap(), 3);
    assert_eq!(
        count(wh, "SELECT COUNT(*) FROM fact_sim WHERE sim_key IS NULL", &[]),
        0
    );

    let runs = wh.runs_for(&run("R1")).unwrap();
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.status == RunStatus::Success));
    let fact = runs.iter().find(|r| r.load_type == LoadType::Fact).unwrap();
    assert_eq!(fact.rows_inserted, Some(3));
    assert!(fact.duration_ms.unwrap() >= 0);
    let meta = runs.iter().find(|r| r.load_type == LoadType::Metadata).unwrap();
    assert_eq!(meta.rows_inserted, Some(1));
}

#[test]
fn test_second_batch_is_a_noop() {
    let env = TestEnv::new();
    env.write_raw_results("R1", 2);

    let coordinator = env.coordinator();
    coordinator.run_batch().unwrap();
    let report = coordinator.run_batch().unwrap();

    assert_eq!(report.cleaned, 0);
    assert!(report.fact_outcomes.is_empty());
    assert_eq!(coordinator.warehouse().fact_rows_for_run(&run("R1")).unwrap(), 2);
}

// ============================================================================
// Failures stay where they are
// ============================================================================

#[test]
fn test_cleaning_failure_stays_in_incoming_without_archive_copy() {
    let env = TestEnv::new();
    let raw = env.write(Stage::Incoming, "results_R1.csv", "Time (s),CA (mol/m^3)\n0,1\n");

    let coordinator = env.coordinator();
    let report = coordinator.run_batch().unwrap();

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].kind, "cleaning");
    assert_eq!(report.failures[0].run_id, Some(run("R1")));
    assert!(exists(&raw));
    assert!(!exists(&env.path(Stage::Archive, "results_R1.csv")));
    assert!(!exists(&env.path(Stage::Processed, "results_R1.csv")));
    assert!(coordinator.warehouse().open_runs().unwrap().is_empty());
}

#[test]
fn test_load_failure_stays_in_processed_with_open_run_log() {
    let env = TestEnv::new();
    env.write(
        Stage::Incoming,
        "results_R1.csv",
        &format!("{}\n0,0.0,not-a-number,300\n", RAW_HEADER),
    );

    let coordinator = env.coordinator();
    let report = coordinator.run_batch().unwrap();

    assert_eq!(report.cleaned, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].kind, "load");
    assert!(exists(&env.path(Stage::Processed, "results_R1.csv")));
    assert!(!exists(&env.path(Stage::Ingested, "results_R1.csv")));

    let wh = coordinator.warehouse();
    assert_eq!(wh.fact_rows_for_run(&run("R1")).unwrap(), 0);
    let open = wh.open_runs().unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].simulation_id, "R1");
    assert_eq!(open[0].load_type, LoadType::Fact);
    assert_eq!(open[0].status, RunStatus::Running);
}

#[test]
fn test_existing_archive_copy_blocks_cleaning_and_loading() {
    let env = TestEnv::new();
    let archived = env.write(Stage::Archive, "results_R1.csv", "earlier delivery\n");
    let raw = env.write_raw_results("R1", 2);

    let coordinator = env.coordinator();
    for _ in 0..2 {
        let report = coordinator.run_batch().unwrap();

        assert_eq!(report.cleaned, 0);
        assert!(report.fact_outcomes.is_empty());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].kind, "io");
        assert_eq!(report.failures[0].run_id, Some(run("R1")));
    }

    assert!(exists(&raw));
    assert_eq!(fs::read_to_string(&archived).unwrap(), "earlier delivery\n");
    assert!(!exists(&env.path(Stage::Processed, "results_R1.csv")));
    assert!(!exists(&env.path(Stage::Ingested, "results_R1.csv")));
    let wh = coordinator.warehouse();
    assert_eq!(wh.fact_rows_for_run(&run("R1")).unwrap(), 0);
    assert!(wh.open_runs().unwrap().is_empty());
}

#[test]
fn test_schema_mismatch_is_rejected_before_any_sql() {
    let env = TestEnv::new();
    let processed = env.write(Stage::Processed, "results_R1.csv", "time_s,ca\n0,1\n");

    let coordinator = env.coordinator();
    let file = StagedFile::from_path(&processed, Stage::Processed).unwrap();
    let err = coordinator.ingest_fact(&file).unwrap_err();

    match err {
        IngestError::SchemaMismatch { missing, .. } => assert_eq!(missing, vec!["temp_k"]),
        other => panic!("unexpected error: {other}"),
    }
    assert!(exists(&processed));
    assert!(coordinator.warehouse().open_runs().unwrap().is_empty());
}

#[test]
fn test_metadata_missing_stop_reason_is_not_inserted() {
    let env = TestEnv::new();
    let json = env.write_metadata("R1", false);

    let coordinator = env.coordinator();
    let report = coordinator.run_batch().unwrap();

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].kind, "metadata_validation");
    assert!(report.failures[0].error.contains("stop_reason"));
    assert!(exists(&json));
    assert!(!exists(&env.path(Stage::Ingested, "metadata_R1.json")));

    let wh = coordinator.warehouse();
    assert!(!wh.metadata_exists(&run("R1")).unwrap());
    let open = wh.open_runs().unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].load_type, LoadType::Metadata);
}

// ============================================================================
// Bulk load mode
// ============================================================================

#[test]
fn test_large_batch_drops_and_recreates_indexes_despite_failure() {
    let env = TestEnv::new();
    for i in 0..59 {
        env.write_raw_results(&format!("R{:03}", i), 2);
    }
    env.write(
        Stage::Incoming,
        "results_BAD.csv",
        &format!("{}\n0,0.0,oops,300\n", RAW_HEADER),
    );

    let coordinator = env.coordinator_with(IngestSettings {
        index_drop_threshold: 50,
        ..Default::default()
    });
    let report = coordinator.run_batch().unwrap();

    assert_eq!(report.cleaned, 60);
    assert!(report.bulk_load_mode);
    assert!(report.indexes_recreated);
    assert_eq!(report.fact_outcomes.len(), 59);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].run_id, Some(run("BAD")));
    assert_eq!(report.rows_loaded(), 118);
    assert_eq!(
        coordinator.warehouse().index_names().unwrap(),
        vec!["idx_fact_sim_simulation_id"]
    );
}

#[test]
fn test_small_batch_keeps_indexes() {
    let env = TestEnv::new();
    env.write_raw_results("R1", 1);

    let coordinator = env.coordinator();
    let report = coordinator.run_batch().unwrap();

    assert!(!report.bulk_load_mode);
    assert!(report.indexes_recreated);
    assert_eq!(coordinator.warehouse().index_names().unwrap().len(), 1);
}

// ============================================================================
// Surrogate key reconciliation
// ============================================================================

#[test]
fn test_reconcile_waits_for_dimension_row_and_stays_scoped() {
    let env = TestEnv::new();
    env.write_raw_results("R1", 3);
    env.write_raw_results("R2", 2);

    let coordinator = env.coordinator();
    let first = coordinator.run_batch().unwrap();
    assert_eq!(first.reconciled_rows, 0);

    let wh = coordinator.warehouse();
    assert_eq!(
        count(wh, "SELECT COUNT(*) FROM fact_sim WHERE sim_key IS NULL", &[]),
        5
    );

    env.write_metadata("R1", true);
    let second = coordinator.run_batch().unwrap();
    assert_eq!(second.reconciled_rows, 3);

    let key = wh.sim_key_for(&run("R1")).unwrap().unwrap();
    assert_eq!(
        count(
            wh,
            "SELECT COUNT(*) FROM fact_sim WHERE simulation_id = 'R1' AND sim_key = ?",
            &[DbValue::from(key)]
        ),
        3
    );
    assert_eq!(
        count(
            wh,
            "SELECT COUNT(*) FROM fact_sim WHERE simulation_id = 'R2' AND sim_key IS NULL",
            &[]
        ),
        2
    );
}

// ============================================================================
// Crash recovery and promotion
// ============================================================================

#[test]
fn test_rerun_after_commit_before_promotion_does_not_double_load() {
    let env = TestEnv::new();
    let processed = env.write(
        Stage::Processed,
        "results_R1.csv",
        "time_s,ca,temp_k\n0,1,300\n1,0.5,301\n",
    );

    let coordinator = env.coordinator();
    let file = StagedFile::from_path(&processed, Stage::Processed).unwrap();
    coordinator.warehouse().provision_schema();
    coordinator.warehouse().bulk_load_fact(&file).unwrap();
    assert!(exists(&processed));

    let report = coordinator.run_batch().unwrap();

    assert_eq!(
        report.fact_outcomes,
        vec![FileOutcome::AlreadyLoaded {
            run_id: run("R1"),
            open_run_logs: vec![]
        }]
    );
    assert_eq!(coordinator.warehouse().fact_rows_for_run(&run("R1")).unwrap(), 2);
    assert!(!exists(&processed));
    assert!(exists(&env.path(Stage::Ingested, "results_R1.csv")));
}

#[test]
fn test_rerun_after_crash_names_the_open_run_log_record() {
    let env = TestEnv::new();
    let processed = env.write(Stage::Processed, "results_R1.csv", "time_s,ca,temp_k\n0,1,300\n");

    let coordinator = env.coordinator();
    let wh = coordinator.warehouse();
    let file = StagedFile::from_path(&processed, Stage::Processed).unwrap();
    wh.provision_schema();
    let crashed = wh.open_run(&run("R1"), LoadType::Fact).unwrap();
    wh.bulk_load_fact(&file).unwrap();

    let report = coordinator.run_batch().unwrap();

    assert_eq!(
        report.fact_outcomes,
        vec![FileOutcome::AlreadyLoaded {
            run_id: run("R1"),
            open_run_logs: vec![crashed.clone()]
        }]
    );
    assert!(exists(&env.path(Stage::Ingested, "results_R1.csv")));
    let open = wh.open_runs().unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].id, crashed);
}

#[test]
fn test_metadata_already_in_warehouse_is_promoted_once() {
    let env = TestEnv::new();
    env.write_metadata("R1", true);

    let coordinator = env.coordinator();
    coordinator.run_batch().unwrap();

    env.write_metadata("R1", true);
    fs::remove_file(env.path(Stage::Ingested, "metadata_R1.json")).unwrap();
    let report = coordinator.run_batch().unwrap();

    assert_eq!(
        report.metadata_outcomes,
        vec![FileOutcome::AlreadyLoaded {
            run_id: run("R1"),
            open_run_logs: vec![]
        }]
    );
    assert_eq!(
        count(coordinator.warehouse(), "SELECT COUNT(*) FROM dim_rxn", &[]),
        1
    );
}

#[test]
fn test_promoting_an_already_promoted_file_errors() {
    let env = TestEnv::new();
    let processed = env.write(Stage::Processed, "results_R1.csv", "time_s,ca,temp_k\n0,1,300\n");
    let stages = env.stages();
    let file = StagedFile::from_path(&processed, Stage::Processed).unwrap();

    stages.promote_to_ingested(&file).unwrap();
    let err = stages.promote_to_ingested(&file).unwrap_err();
    assert!(matches!(err, IngestError::Promotion { .. }));
    assert!(exists(&env.path(Stage::Ingested, "results_R1.csv")));
}

// ============================================================================
// Contracts and locking
// ============================================================================

#[test]
fn test_cleaned_columns_match_required_set() {
    let env = TestEnv::new();
    env.write_raw_results("R1", 1);

    let summary = env.stages().clean_incoming().unwrap();
    let cleaned = fs::read_to_string(&summary.cleaned[0].path).unwrap();
    let header: std::collections::BTreeSet<String> = cleaned
        .lines()
        .next()
        .unwrap()
        .split(',')
        .map(str::to_string)
        .collect();

    assert_eq!(&header, env.contracts.required.columns());
}

#[test]
fn test_mismatched_contracts_are_rejected() {
    let err = Contracts::new(
        ColumnMapping::from_pairs([("Time (s)", "time_s")]),
        RequiredColumns::from_columns(["time_s", "ca"]),
    );
    assert!(err.is_err());
}

#[test]
fn test_second_writer_is_locked_out() {
    let env = TestEnv::new();
    let _coordinator = env.coordinator();

    let err = Warehouse::open(&env.db_path, &env.contracts.required).unwrap_err();
    assert!(matches!(err, BackendError::Locked(_)));
}
