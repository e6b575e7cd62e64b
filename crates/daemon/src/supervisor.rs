//! Process supervision: run directories, output capture, timeout
//! escalation, and exit-code normalization.
//!
//! Each admitted run gets `<data_dir>/runs/<job>/<run_id>/` with the
//! captured `output.txt` and a `run_execution.json` manifest recording the
//! exact command and environment. The child runs in its own process group
//! so SIGTERM/SIGKILL reach the whole tree. A per-run monitor task waits
//! for the exit and reports back to the reactor over a channel; it never
//! touches shared state itself.

use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::Command;
use tokio::sync::mpsc;
use uuid::Uuid;

use cadenza_domain::config::{Config, Job};
use cadenza_domain::error::Result;
use cadenza_domain::run::Run;

use crate::environment::{build_environment, PreviousRuns};

/// Exit code synthesized when the command binary is missing.
pub const EXIT_NOT_FOUND: i32 = 127;
/// Exit code synthesized for permission-denied and other spawn errors.
pub const EXIT_NOT_EXECUTABLE: i32 = 126;

/// Terminal report delivered to the reactor when a child is reaped.
#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub job_name: String,
    pub stop_time: DateTime<Utc>,
    /// Normalized: the child status, or `128 + signum` for signal deaths.
    pub exit_code: i32,
}

/// Early-termination order sent at daemon shutdown.
#[derive(Debug, Clone, Copy)]
pub struct KillOrder {
    /// SIGTERM-to-SIGKILL wait.
    pub grace: Duration,
}

/// Handle the reactor keeps for each supervised child.
pub struct RunningChild {
    pub pid: u32,
    pub kill_tx: mpsc::Sender<KillOrder>,
}

pub enum Spawned {
    /// Child is running; the monitor reports through the event channel.
    Started(RunningChild),
    /// Spawn failed; finalize immediately with the synthesized exit code.
    Failed { exit_code: i32 },
}

#[derive(Serialize)]
struct ExecutionManifest<'a> {
    run_id: &'a Uuid,
    job_name: &'a str,
    command: &'a [String],
    environment: &'a std::collections::HashMap<String, String>,
    schedule_time: &'a DateTime<Utc>,
    start_time: &'a DateTime<Utc>,
    trigger_type: &'a str,
    trigger_data: &'a serde_json::Value,
    concurrency_group: Option<&'a str>,
}

pub fn run_dir(data_dir: &Path, job_name: &str, run_id: &Uuid) -> PathBuf {
    data_dir
        .join("runs")
        .join(job_name)
        .join(run_id.to_string())
}

/// Prepare the run directory, write the manifest, and spawn the child in
/// its own process group. Sets `run.start_time`.
pub async fn spawn_run(
    config: &Config,
    job: &Job,
    run: &mut Run,
    previous: &PreviousRuns,
    events: mpsc::UnboundedSender<RunOutcome>,
) -> Result<Spawned> {
    let dir = run_dir(&config.data_dir, &run.job_name, &run.run_id);
    std::fs::create_dir_all(&dir)?;

    let start_time = Utc::now();
    run.start_time = Some(start_time);
    let env = build_environment(config, job, run, &dir, start_time, previous);

    let mut argv = job.command.clone();
    if job.command_append_run {
        argv.push(run.job_name.clone());
        argv.push(run.run_id.to_string());
    }

    let manifest = ExecutionManifest {
        run_id: &run.run_id,
        job_name: &run.job_name,
        command: &argv,
        environment: &env,
        schedule_time: &run.schedule_time,
        start_time: &start_time,
        trigger_type: run.trigger_type.as_str(),
        trigger_data: &run.trigger_data,
        concurrency_group: run.concurrency_group.as_deref(),
    };
    std::fs::write(
        dir.join("run_execution.json"),
        serde_json::to_vec_pretty(&manifest)?,
    )?;

    let output = std::fs::File::create(dir.join("output.txt"))?;
    let stderr = output.try_clone()?;

    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .env_clear()
        .envs(&env)
        .current_dir(&dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(output))
        .stderr(Stdio::from(stderr))
        .process_group(0);

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            let exit_code = match e.kind() {
                std::io::ErrorKind::NotFound => EXIT_NOT_FOUND,
                _ => EXIT_NOT_EXECUTABLE,
            };
            tracing::warn!(
                job = %run.job_name,
                run_id = %run.run_id,
                error = %e,
                exit_code,
                "spawn failed"
            );
            return Ok(Spawned::Failed { exit_code });
        }
    };

    let pid = child.id().unwrap_or_default();
    let (kill_tx, kill_rx) = mpsc::channel(1);
    spawn_monitor(
        child,
        pid,
        job.max_execution.filter(|secs| *secs > 0),
        Duration::from_secs(job.max_execution_grace),
        kill_rx,
        events,
        run.run_id,
        run.job_name.clone(),
    );
    Ok(Spawned::Started(RunningChild { pid, kill_tx }))
}

/// Background task that owns the child: waits for exit, enforces
/// `max_execution`, and honors shutdown kill orders. Reports exactly one
/// outcome to the reactor.
#[allow(clippy::too_many_arguments)]
fn spawn_monitor(
    mut child: tokio::process::Child,
    pid: u32,
    max_execution: Option<u64>,
    grace: Duration,
    mut kill_rx: mpsc::Receiver<KillOrder>,
    events: mpsc::UnboundedSender<RunOutcome>,
    run_id: Uuid,
    job_name: String,
) {
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = sleep_opt(max_execution) => {
                tracing::info!(
                    job = %job_name,
                    run_id = %run_id,
                    grace_secs = grace.as_secs(),
                    "max execution reached, terminating process group"
                );
                escalate(&mut child, pid, grace).await
            }
            Some(order) = kill_rx.recv() => {
                tracing::info!(
                    job = %job_name,
                    run_id = %run_id,
                    grace_secs = order.grace.as_secs(),
                    "terminating run for shutdown"
                );
                escalate(&mut child, pid, order.grace).await
            }
        };

        let stop_time = Utc::now();
        let exit_code = match status {
            Ok(status) => normalized_exit(status),
            Err(e) => {
                tracing::warn!(run_id = %run_id, error = %e, "wait on child failed");
                EXIT_NOT_EXECUTABLE
            }
        };
        let _ = events.send(RunOutcome {
            run_id,
            job_name,
            stop_time,
            exit_code,
        });
    });
}

async fn sleep_opt(secs: Option<u64>) {
    match secs {
        Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
        None => std::future::pending().await,
    }
}

/// SIGTERM the process group, then SIGKILL after the grace period.
async fn escalate(
    child: &mut tokio::process::Child,
    pid: u32,
    grace: Duration,
) -> std::io::Result<std::process::ExitStatus> {
    signal_group(pid, libc::SIGTERM);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            signal_group(pid, libc::SIGKILL);
            child.wait().await
        }
    }
}

fn signal_group(pid: u32, signal: i32) {
    if pid == 0 {
        return;
    }
    unsafe {
        libc::kill(-(pid as i32), signal);
    }
}

fn normalized_exit(status: std::process::ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}
