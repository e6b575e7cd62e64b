//! Filesystem trigger ingestion.
//!
//! Each cataloged job owns `<data_dir>/trigger/<job>/`. Dropping a
//! `trigger.json` (or `trigger.yaml`) there requests an ad-hoc run. JSON
//! wins when both formats are present; the YAML file is left for the next
//! scan. Ingested files are deleted. Files that fail to parse are
//! quarantined by renaming, so a broken payload can never cause a
//! re-ingestion loop.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_json::Value;

use cadenza_domain::config::Config;
use cadenza_domain::run::payload_schedule_time;

/// Seconds between directory scans when no signal forces one earlier.
pub const SCAN_INTERVAL_SECS: i64 = 60;

#[derive(Debug)]
pub struct TriggerEvent {
    pub job_name: String,
    /// The payload's requested time, else the trigger file's mtime.
    pub schedule_time: DateTime<Utc>,
    pub payload: Value,
}

/// Scan the trigger directory of every cataloged job. Directories for
/// unknown jobs are never touched.
pub fn scan(data_dir: &Path, config: &Config, now: DateTime<Utc>) -> Vec<TriggerEvent> {
    let mut events = Vec::new();
    for job_name in config.jobs.keys() {
        let dir = data_dir.join("trigger").join(job_name);
        let json_path = dir.join("trigger.json");
        let yaml_path = dir.join("trigger.yaml");
        let (path, yaml) = if json_path.exists() {
            (json_path, false)
        } else if yaml_path.exists() {
            (yaml_path, true)
        } else {
            continue;
        };

        if let Some(event) = ingest(&path, yaml, job_name, now) {
            events.push(event);
        }
    }
    events
}

fn ingest(path: &Path, yaml: bool, job_name: &str, now: DateTime<Utc>) -> Option<TriggerEvent> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "unreadable trigger file");
            return None;
        }
    };
    let mtime = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or(now);

    let parsed: Result<Value, String> = if yaml {
        serde_yaml::from_str(&text).map_err(|e| e.to_string())
    } else {
        serde_json::from_str(&text).map_err(|e| e.to_string())
    };

    match parsed {
        Ok(payload) => {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove ingested trigger");
            }
            let schedule_time = payload_schedule_time(&payload).unwrap_or(mtime);
            Some(TriggerEvent {
                job_name: job_name.to_string(),
                schedule_time,
                payload,
            })
        }
        Err(e) => {
            let quarantined = quarantine(path, now);
            tracing::warn!(
                path = %path.display(),
                quarantined = %quarantined.display(),
                error = %e,
                "malformed trigger quarantined"
            );
            None
        }
    }
}

/// Rename a malformed trigger file out of the way.
fn quarantine(path: &Path, now: DateTime<Utc>) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".quarantine.{}", now.timestamp()));
    let target = path.with_file_name(name);
    if let Err(e) = std::fs::rename(path, &target) {
        tracing::error!(path = %path.display(), error = %e, "quarantine rename failed, removing file");
        let _ = std::fs::remove_file(path);
    }
    target
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_config(jobs: &[&str]) -> Config {
        let mut job_map = serde_json::Map::new();
        for name in jobs {
            job_map.insert(name.to_string(), json!({"command": ["/bin/true"]}));
        }
        let mut config: Config =
            serde_json::from_value(json!({"jobs": job_map})).unwrap();
        config.finalize().unwrap();
        config
    }

    fn write_trigger(data_dir: &Path, job: &str, file: &str, contents: &str) -> PathBuf {
        let dir = data_dir.join("trigger").join(job);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(file);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn ingests_and_deletes_json_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&["deploy"]);
        let path = write_trigger(dir.path(), "deploy", "trigger.json", r#"{"reason": "push"}"#);

        let events = scan(dir.path(), &config, Utc::now());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].job_name, "deploy");
        assert_eq!(events[0].payload["reason"], "push");
        assert!(!path.exists());
    }

    #[test]
    fn ingests_yaml_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&["deploy"]);
        write_trigger(dir.path(), "deploy", "trigger.yaml", "reason: cron\n");

        let events = scan(dir.path(), &config, Utc::now());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["reason"], "cron");
    }

    #[test]
    fn json_wins_over_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&["deploy"]);
        let json_path =
            write_trigger(dir.path(), "deploy", "trigger.json", r#"{"from": "json"}"#);
        let yaml_path = write_trigger(dir.path(), "deploy", "trigger.yaml", "from: yaml\n");

        let events = scan(dir.path(), &config, Utc::now());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["from"], "json");
        assert!(!json_path.exists());
        // The YAML file is picked up by the following scan.
        assert!(yaml_path.exists());
        let events = scan(dir.path(), &config, Utc::now());
        assert_eq!(events[0].payload["from"], "yaml");
    }

    #[test]
    fn schedule_time_from_payload() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&["deploy"]);
        write_trigger(
            dir.path(),
            "deploy",
            "trigger.json",
            r#"{"schedule_time": 1718445600}"#,
        );

        let events = scan(dir.path(), &config, Utc::now());
        assert_eq!(events[0].schedule_time.timestamp(), 1_718_445_600);
    }

    #[test]
    fn schedule_time_defaults_to_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&["deploy"]);
        write_trigger(dir.path(), "deploy", "trigger.json", "{}");

        let before = Utc::now();
        let events = scan(dir.path(), &config, Utc::now());
        // mtime of a file we just wrote is around now.
        let delta = (events[0].schedule_time - before).num_seconds().abs();
        assert!(delta < 60);
    }

    #[test]
    fn malformed_trigger_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&["deploy"]);
        let path = write_trigger(dir.path(), "deploy", "trigger.json", "{not json");

        let events = scan(dir.path(), &config, Utc::now());
        assert!(events.is_empty());
        assert!(!path.exists());
        let quarantined: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .contains(".quarantine.")
            })
            .collect();
        assert_eq!(quarantined.len(), 1);

        // Quarantined files are not re-ingested.
        let events = scan(dir.path(), &config, Utc::now());
        assert!(events.is_empty());
    }

    #[test]
    fn unknown_job_directories_are_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&["deploy"]);
        let path = write_trigger(dir.path(), "stranger", "trigger.json", "{}");

        let events = scan(dir.path(), &config, Utc::now());
        assert!(events.is_empty());
        assert!(path.exists());
    }
}
