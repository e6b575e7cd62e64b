//! Component pipeline: trigger ingestion → supervision → persistence,
//! exercised together the way the reactor drives them.

use std::path::Path;

use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc;

use cadenza_daemon::environment::PreviousRuns;
use cadenza_daemon::supervisor::{self, Spawned};
use cadenza_daemon::triggers;
use cadenza_domain::config::Config;
use cadenza_domain::run::{Run, TriggerType};
use cadenza_store::{RunStore, SqliteStore};

fn load_config(data_dir: &Path, jobs: serde_json::Value) -> Config {
    let mut config: Config = serde_json::from_value(json!({
        "data_dir": data_dir,
        "jobs": jobs
    }))
    .unwrap();
    config.finalize().unwrap();
    config
}

#[tokio::test]
async fn triggered_run_flows_into_the_completed_partition() {
    let dir = tempfile::tempdir().unwrap();
    let config = load_config(
        dir.path(),
        json!({"greet": {"command": ["/bin/sh", "-c", "echo hello"]}}),
    );
    let store = SqliteStore::open_in_memory().unwrap();

    // Drop a trigger file and ingest it.
    let trigger_dir = dir.path().join("trigger").join("greet");
    std::fs::create_dir_all(&trigger_dir).unwrap();
    std::fs::write(
        trigger_dir.join("trigger.json"),
        r#"{"environment": {"GREETING_TARGET": "world"}}"#,
    )
    .unwrap();
    let events = triggers::scan(dir.path(), &config, Utc::now());
    assert_eq!(events.len(), 1);
    let event = events.into_iter().next().unwrap();

    // Spawn it the way the reactor would.
    let mut run = Run::triggered(&event.job_name, event.schedule_time, event.payload, false);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let spawned = supervisor::spawn_run(
        &config,
        &config.jobs["greet"],
        &mut run,
        &PreviousRuns::default(),
        tx,
    )
    .await
    .unwrap();
    assert!(matches!(spawned, Spawned::Started(_)));
    store.insert_running(&run).unwrap();
    assert_eq!(store.list_running().unwrap().len(), 1);

    // Reap and finalize.
    let outcome = rx.recv().await.unwrap();
    run.stop_time = Some(outcome.stop_time);
    run.exit_code = Some(outcome.exit_code);
    store.finalize(&run).unwrap();

    assert!(store.list_running().unwrap().is_empty());
    let committed = store.latest_completed("greet").unwrap().unwrap();
    assert_eq!(committed.exit_code, Some(0));
    assert_eq!(committed.trigger_type, TriggerType::File);
    assert_eq!(
        committed.trigger_data["environment"]["GREETING_TARGET"],
        "world"
    );
    assert!(committed.schedule_time <= committed.start_time.unwrap());
    assert!(committed.start_time.unwrap() <= committed.stop_time.unwrap());

    // The manifest recorded the trigger-level environment overlay.
    let run_dir = supervisor::run_dir(dir.path(), "greet", &run.run_id);
    let manifest: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(run_dir.join("run_execution.json")).unwrap())
            .unwrap();
    assert_eq!(manifest["environment"]["GREETING_TARGET"], "world");
    assert_eq!(manifest["environment"]["TRIGGER_TYPE"], "file");
}

#[tokio::test]
async fn timeout_bounds_the_run_duration() {
    let dir = tempfile::tempdir().unwrap();
    let config = load_config(
        dir.path(),
        json!({"stuck": {
            "command": ["/bin/sh", "-c", "sleep 1000"],
            "max_execution": 1,
            "max_execution_grace": 1
        }}),
    );

    let mut run = Run::scheduled("stuck", Utc::now());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let spawned = supervisor::spawn_run(
        &config,
        &config.jobs["stuck"],
        &mut run,
        &PreviousRuns::default(),
        tx,
    )
    .await
    .unwrap();
    assert!(matches!(spawned, Spawned::Started(_)));

    let outcome = rx.recv().await.unwrap();
    assert!(outcome.exit_code >= 128);
    let duration = outcome.stop_time - run.start_time.unwrap();
    assert!(duration <= chrono::Duration::seconds(10));
}

#[tokio::test]
async fn previous_run_block_reflects_the_committed_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let config = load_config(
        dir.path(),
        json!({"j": {"command": ["/bin/sh", "-c", "printenv PREVIOUS_EXIT_CODE"]}}),
    );
    let store = SqliteStore::open_in_memory().unwrap();

    // Commit an earlier failed run.
    let mut earlier = Run::scheduled("j", Utc::now());
    earlier.start_time = Some(Utc::now());
    earlier.stop_time = Some(Utc::now());
    earlier.exit_code = Some(7);
    store.finalize(&earlier).unwrap();

    let previous = PreviousRuns {
        last: store.latest_completed("j").unwrap(),
        good: store.latest_completed_with_exit("j", true).unwrap(),
        bad: store.latest_completed_with_exit("j", false).unwrap(),
    };
    assert!(previous.good.is_none());
    assert_eq!(previous.bad.as_ref().unwrap().exit_code, Some(7));

    let mut run = Run::scheduled("j", Utc::now());
    let (tx, mut rx) = mpsc::unbounded_channel();
    supervisor::spawn_run(&config, &config.jobs["j"], &mut run, &previous, tx)
        .await
        .unwrap();
    let outcome = rx.recv().await.unwrap();
    assert_eq!(outcome.exit_code, 0);

    let output = std::fs::read_to_string(
        supervisor::run_dir(dir.path(), "j", &run.run_id).join("output.txt"),
    )
    .unwrap();
    assert!(output.contains('7'));
}
