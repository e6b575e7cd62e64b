//! File-backed store behavior across reopen, as after a daemon restart.

use chrono::Utc;

use cadenza_domain::run::Run;
use cadenza_store::{RunStore, SqliteStore, ORPHAN_EXIT_CODE};

#[test]
fn completed_runs_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("cadenza.sqlite3");

    let mut run = Run::scheduled("nightly", Utc::now());
    run.start_time = Some(Utc::now());
    run.stop_time = Some(Utc::now());
    run.exit_code = Some(0);

    {
        let store = SqliteStore::open(&db).unwrap();
        store.finalize(&run).unwrap();
    }

    let store = SqliteStore::open(&db).unwrap();
    let fetched = store.latest_completed("nightly").unwrap().unwrap();
    assert_eq!(fetched.run_id, run.run_id);
}

#[test]
fn crashed_daemon_leaves_orphans_for_cleanout() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("cadenza.sqlite3");

    let mut run = Run::scheduled("nightly", Utc::now());
    run.start_time = Some(Utc::now());

    // First daemon inserts the running row, then "crashes".
    {
        let store = SqliteStore::open(&db).unwrap();
        store.insert_running(&run).unwrap();
    }

    // Second daemon finds and finalizes the orphan before scheduling.
    let store = SqliteStore::open(&db).unwrap();
    assert_eq!(store.list_running().unwrap().len(), 1);
    let orphans = store.finalize_orphans(ORPHAN_EXIT_CODE).unwrap();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].run_id, run.run_id);
    assert!(store.list_running().unwrap().is_empty());
    assert_eq!(
        store.latest_completed("nightly").unwrap().unwrap().exit_code,
        Some(ORPHAN_EXIT_CODE)
    );
}
