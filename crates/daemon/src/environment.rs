//! Child environment construction.
//!
//! The environment is built from scratch, never inherited wholesale.
//! Overlay order, later layers overriding earlier ones:
//! baseline, auto-set run identifiers, previous-run block, conditional
//! entries, the Jenkins-compat block, then config-, job-, and
//! trigger-level environments.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};

use cadenza_domain::config::{Config, Job};
use cadenza_domain::run::{payload_environment, Run};

/// Committed-store snapshot threaded into the `PREVIOUS_*` blocks.
#[derive(Debug, Clone, Default)]
pub struct PreviousRuns {
    pub last: Option<Run>,
    pub good: Option<Run>,
    pub bad: Option<Run>,
}

pub fn build_environment(
    config: &Config,
    job: &Job,
    run: &Run,
    run_dir: &Path,
    start_time: DateTime<Utc>,
    previous: &PreviousRuns,
) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = HashMap::new();
    let run_dir_str = run_dir.display().to_string();

    // 1. Baseline.
    for key in ["LOGNAME", "HOME"] {
        if let Ok(value) = std::env::var(key) {
            env.insert(key.to_string(), value);
        }
    }
    env.insert(
        "PATH".into(),
        std::env::var("PATH").unwrap_or_else(|_| "/usr/bin:/bin".into()),
    );
    env.insert("PWD".into(), run_dir_str.clone());
    env.insert("DATA_DIR".into(), config.data_dir.display().to_string());

    // 2. Auto-set.
    env.insert("JOB_NAME".into(), run.job_name.clone());
    env.insert("RUN_ID".into(), run.run_id.to_string());
    env.insert(
        "SCHEDULE_TIME".into(),
        run.schedule_time.timestamp().to_string(),
    );
    env.insert("START_TIME".into(), start_time.timestamp().to_string());
    env.insert("TRIGGER_TYPE".into(), run.trigger_type.to_string());
    env.insert("RUN_DIR".into(), run_dir_str.clone());
    env.insert("CI".into(), "true".into());
    env.insert("CADENZA".into(), "true".into());

    // 3. Previous-run block.
    apply_previous(&mut env, "PREVIOUS", previous.last.as_ref());
    apply_previous(&mut env, "PREVIOUS_GOOD", previous.good.as_ref());
    apply_previous(&mut env, "PREVIOUS_BAD", previous.bad.as_ref());

    // 4. Conditional.
    if let Some(group) = &run.concurrency_group {
        env.insert("CONCURRENCY_GROUP".into(), group.clone());
    }
    if let Some(group) = &job.job_group {
        env.insert("JOB_GROUP".into(), group.clone());
    }

    // 5. Jenkins-compat block.
    if job.jenkins_environment {
        let run_id = run.run_id.to_string();
        env.insert("BUILD_ID".into(), run_id.clone());
        env.insert("BUILD_NUMBER".into(), run_id);
        env.insert(
            "BUILD_TAG".into(),
            format!("cadenza-{}-{}", run.job_name, run.run_id),
        );
        env.insert("BUILD_URL".into(), format!("file://{run_dir_str}/"));
        env.insert(
            "JENKINS_URL".into(),
            format!("file://{}/", config.data_dir.display()),
        );
        env.insert("EXECUTOR_NUMBER".into(), "0".into());
        env.insert("NODE_NAME".into(), "master".into());
        env.insert("WORKSPACE".into(), run_dir_str);
    }

    // 6-8. Config, job, trigger environments, ascending precedence.
    env.extend(config.environment.clone());
    env.extend(job.environment.clone());
    env.extend(payload_environment(&run.trigger_data));

    env
}

fn apply_previous(env: &mut HashMap<String, String>, prefix: &str, run: Option<&Run>) {
    let Some(run) = run else { return };
    env.insert(format!("{prefix}_RUN_ID"), run.run_id.to_string());
    env.insert(
        format!("{prefix}_SCHEDULE_TIME"),
        run.schedule_time.timestamp().to_string(),
    );
    if let Some(t) = run.start_time {
        env.insert(format!("{prefix}_START_TIME"), t.timestamp().to_string());
    }
    if let Some(t) = run.stop_time {
        env.insert(format!("{prefix}_STOP_TIME"), t.timestamp().to_string());
    }
    if let Some(code) = run.exit_code {
        env.insert(format!("{prefix}_EXIT_CODE"), code.to_string());
    }
}
