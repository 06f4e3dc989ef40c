// ABOUTME: Integration tests for the baseline backfill
// ABOUTME: Seek pagination accounting, resume, completion skip, and handoff pinning

use rusqlite::types::Value;
use tempfile::TempDir;

use cdc_replicator::checkpoint::{CheckpointStatus, CheckpointStore, InitialSyncCheckpoint, PkValue};
use cdc_replicator::config::load_config_from_str;
use cdc_replicator::{CdcConnection, InitialSync, SyncConfig};

fn setup(dir: &TempDir, rows: i64) -> SyncConfig {
    let db_path = dir.path().join("source.db");
    let conn = rusqlite::Connection::open(&db_path).unwrap();
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         CREATE TABLE items (id INTEGER PRIMARY KEY, label TEXT);",
    )
    .unwrap();
    for i in 1..=rows {
        conn.execute(
            "INSERT INTO items (id, label) VALUES (?1, ?2)",
            rusqlite::params![i, format!("item-{}", i)],
        )
        .unwrap();
    }
    drop(conn);

    let yaml = format!(
        r#"
source:
  db_path: "{}"
targets:
  - name: "placeholder"
    type: "mysql"
    connection:
      type: "mysql"
      host: "localhost"
      database: "backup"
      username: "root"
      password: "unused"
mappings:
  - source_table: "items"
batch_size: 100
checkpoint_interval: 1
checkpoint_dir: "{}"
"#,
        db_path.display(),
        dir.path().display()
    );
    load_config_from_str(&yaml).unwrap()
}

// The backfill scan and its checkpoints are independent of any target;
// an empty target slice exercises pagination and bookkeeping alone.
#[tokio::test]
async fn backfill_accounts_for_every_row() {
    let dir = tempfile::tempdir().unwrap();
    let config = setup(&dir, 250);
    let store = CheckpointStore::open(&config.checkpoint_db_path()).unwrap();

    let initial = InitialSync::new(&config, &[], &store);
    let synced = initial.sync_table("items").await.unwrap();
    assert_eq!(synced, 250);

    let checkpoint = store
        .load_initial_checkpoint(&config.source.db_path, "items")
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.status, CheckpointStatus::Completed);
    assert_eq!(checkpoint.total_synced, 250);
    assert_eq!(checkpoint.last_pk, Some(PkValue::Int(250)));
}

#[tokio::test]
async fn completed_tables_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let config = setup(&dir, 10);
    let store = CheckpointStore::open(&config.checkpoint_db_path()).unwrap();

    let initial = InitialSync::new(&config, &[], &store);
    assert_eq!(initial.sync_table("items").await.unwrap(), 10);

    // Second run must not rescan
    assert_eq!(initial.sync_table("items").await.unwrap(), 10);
}

#[tokio::test]
async fn backfill_resumes_from_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let config = setup(&dir, 200);
    let store = CheckpointStore::open(&config.checkpoint_db_path()).unwrap();

    // Simulate an interrupted run that had copied the first 80 rows
    let mut checkpoint = InitialSyncCheckpoint::new("items");
    checkpoint.last_pk = Some(PkValue::Int(80));
    checkpoint.total_synced = 80;
    store
        .save_initial_checkpoint(&config.source.db_path, &checkpoint)
        .unwrap();

    let initial = InitialSync::new(&config, &[], &store);
    let synced = initial.sync_table("items").await.unwrap();
    assert_eq!(synced, 200);

    let checkpoint = store
        .load_initial_checkpoint(&config.source.db_path, "items")
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.last_pk, Some(PkValue::Int(200)));
    assert_eq!(checkpoint.status, CheckpointStatus::Completed);
}

#[tokio::test]
async fn run_pins_the_handoff_id_before_scanning() {
    let dir = tempfile::tempdir().unwrap();
    let config = setup(&dir, 20);

    // Produce some captured changes first so the audit log is non-empty
    let mut cdc = CdcConnection::open(&config.source.db_path, &[]).unwrap();
    for i in 0..3 {
        cdc.execute(
            "INSERT INTO items (label) VALUES (?)",
            &[Value::from(format!("late-{}", i))],
        )
        .unwrap();
    }
    drop(cdc);

    let store = CheckpointStore::open(&config.checkpoint_db_path()).unwrap();
    let initial = InitialSync::new(&config, &[], &store);
    let handoff = initial.run(&["items".to_string()]).await.unwrap();

    assert_eq!(handoff, 3);
    assert_eq!(
        store.load_handoff_id(&config.source.db_path).unwrap(),
        Some(3)
    );

    let checkpoint = store
        .load_initial_checkpoint(&config.source.db_path, "items")
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.status, CheckpointStatus::Completed);
    assert_eq!(checkpoint.total_synced, 23);
}

#[tokio::test]
async fn ranged_backfill_covers_the_table() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = setup(&dir, 500);
    config.mappings[0].parallel_ranges = Some(4);
    let store = CheckpointStore::open(&config.checkpoint_db_path()).unwrap();

    let initial = InitialSync::new(&config, &[], &store);
    let synced = initial.sync_table_ranged("items", 4).await.unwrap();
    assert_eq!(synced, 500);

    let checkpoint = store
        .load_initial_checkpoint(&config.source.db_path, "items")
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.status, CheckpointStatus::Completed);
    assert_eq!(checkpoint.total_synced, 500);
}
