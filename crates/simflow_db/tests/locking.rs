use simflow_db::{lock_path_for, BackendError, DbConnection, DbValue};
use tempfile::TempDir;

#[test]
fn second_writer_is_rejected_while_first_is_open() {
    let temp = TempDir::new().unwrap();
    let db_path = temp.path().join("warehouse.duckdb");

    let first = DbConnection::open(&db_path).unwrap();
    assert!(first.is_writable());

    let second = DbConnection::open(&db_path);
    assert!(matches!(second, Err(BackendError::Locked(_))));

    drop(first);
    let reopened = DbConnection::open(&db_path).unwrap();
    assert!(reopened.is_writable());
}

#[test]
fn clones_share_the_lock_and_the_connection() {
    let temp = TempDir::new().unwrap();
    let db_path = temp.path().join("warehouse.duckdb");

    let conn = DbConnection::open(&db_path).unwrap();
    let clone = conn.clone();
    drop(conn);

    // Lock is still held through the clone
    assert!(matches!(
        DbConnection::open(&db_path),
        Err(BackendError::Locked(_))
    ));

    clone.execute_batch("CREATE TABLE t (v BIGINT)").unwrap();
    clone
        .execute("INSERT INTO t VALUES (?)", &[DbValue::from(7_i64)])
        .unwrap();
    let v: i64 = clone.query_scalar("SELECT v FROM t", &[]).unwrap();
    assert_eq!(v, 7);
    assert!(lock_path_for(&db_path).exists());
}

#[test]
fn open_creates_missing_parent_directories() {
    let temp = TempDir::new().unwrap();
    let db_path = temp.path().join("nested").join("dir").join("warehouse.duckdb");

    let conn = DbConnection::open(&db_path).unwrap();
    conn.execute_batch("CREATE TABLE t (v BIGINT)").unwrap();
    assert!(db_path.exists());
}
