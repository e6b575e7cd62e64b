//! The scheduler loop: a single cooperative reactor over a time-ordered
//! queue of pending runs plus the set of running children.
//!
//! All catalog, arbiter, and store mutation happens on this task, between
//! suspensions. Monitor tasks only wait on children and message back over
//! the event channel; signal streams join the same `select!`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use uuid::Uuid;

use cadenza_domain::config::{self, Config};
use cadenza_domain::error::Result;
use cadenza_domain::run::{Run, TriggerType};
use cadenza_schedule::parse_tz;
use cadenza_store::{spool, RunStore};

use crate::arbiter::{Admission, Arbiter, Backoff};
use crate::environment::PreviousRuns;
use crate::supervisor::{self, KillOrder, RunOutcome, RunningChild, Spawned};
use crate::triggers::{self, SCAN_INTERVAL_SECS};

/// Pending queue key: due time, then insertion order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct PendingKey {
    due: DateTime<Utc>,
    seq: u64,
}

/// A not-yet-started run with the job definition it was created under.
/// The snapshot makes in-flight runs immune to catalog reloads.
struct PendingRun {
    run: Run,
    job: cadenza_domain::config::Job,
}

struct RunningRun {
    run: Run,
    job: cadenza_domain::config::Job,
    child: RunningChild,
}

pub struct Reactor {
    config: Config,
    config_dir: PathBuf,
    local_tz: Tz,
    store: Arc<dyn RunStore>,
    arbiter: Arbiter,
    backoff: Backoff,
    pending: BTreeMap<PendingKey, PendingRun>,
    /// Triggered runs waiting for a non-concurrent job's running run.
    held: HashMap<String, Vec<PendingRun>>,
    running: HashMap<Uuid, RunningRun>,
    /// Jobs whose schedule has terminated, to log the transition once.
    exhausted: HashSet<String>,
    events_tx: mpsc::UnboundedSender<RunOutcome>,
    shutting_down: bool,
    seq: u64,
}

impl Reactor {
    pub fn new(
        config: Config,
        config_dir: PathBuf,
        store: Arc<dyn RunStore>,
    ) -> (Self, mpsc::UnboundedReceiver<RunOutcome>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let arbiter = Arbiter::new(&config);
        let reactor = Self {
            config,
            config_dir,
            local_tz: cadenza_schedule::local_tz(),
            store,
            arbiter,
            backoff: Backoff::new(),
            pending: BTreeMap::new(),
            held: HashMap::new(),
            running: HashMap::new(),
            exhausted: HashSet::new(),
            events_tx,
            shutting_down: false,
            seq: 0,
        };
        (reactor, events_rx)
    }

    /// Run until shutdown completes: every running run reaped and
    /// committed, pending runs discarded.
    pub async fn run(mut self, mut events_rx: mpsc::UnboundedReceiver<RunOutcome>) -> Result<()> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;
        let mut sigquit = signal(SignalKind::quit())?;
        let mut sigusr1 = signal(SignalKind::user_defined1())?;

        self.ensure_layout()?;
        self.arm_schedules(Utc::now());
        let mut next_scan = Utc::now();

        loop {
            let now = Utc::now();
            if !self.shutting_down && now >= next_scan {
                self.ingest_triggers(now);
                next_scan = now + chrono::Duration::seconds(SCAN_INTERVAL_SECS);
            }
            self.dispatch_due(now).await?;

            if self.shutting_down && self.running.is_empty() {
                break;
            }

            let wakeup = self.next_wakeup(next_scan);
            let sleep_for = (wakeup - Utc::now()).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                Some(outcome) = events_rx.recv() => self.reap(outcome).await?,
                _ = sigint.recv() => self.begin_shutdown("SIGINT"),
                _ = sigterm.recv() => self.begin_shutdown("SIGTERM"),
                _ = sighup.recv() => self.reload(),
                _ = sigquit.recv() => self.dump_status(),
                _ = sigusr1.recv() => next_scan = Utc::now(),
            }
        }

        tracing::info!("all runs reaped and committed, scheduler loop exiting");
        Ok(())
    }

    /// Create the on-disk layout: run, trigger, and spool directories.
    fn ensure_layout(&self) -> Result<()> {
        std::fs::create_dir_all(self.config.data_dir.join("runs"))?;
        std::fs::create_dir_all(self.config.data_dir.join("spool"))?;
        for job_name in self.config.jobs.keys() {
            std::fs::create_dir_all(self.config.data_dir.join("trigger").join(job_name))?;
        }
        Ok(())
    }

    fn next_wakeup(&self, next_scan: DateTime<Utc>) -> DateTime<Utc> {
        if self.shutting_down {
            // Only child exits matter now; wake occasionally regardless.
            return Utc::now() + chrono::Duration::seconds(60);
        }
        let mut wakeup = next_scan;
        if let Some((key, _)) = self.pending.iter().next() {
            wakeup = wakeup.min(key.due);
        }
        wakeup
    }

    fn enqueue_at(&mut self, due: DateTime<Utc>, entry: PendingRun) {
        self.seq += 1;
        self.pending.insert(PendingKey { due, seq: self.seq }, entry);
    }

    fn job_running(&self, job_name: &str) -> bool {
        self.running.values().any(|r| r.run.job_name == job_name)
    }

    fn job_pending(&self, job_name: &str) -> bool {
        self.pending.values().any(|p| p.run.job_name == job_name)
            || self.held.get(job_name).is_some_and(|held| !held.is_empty())
    }

    // ── Scheduling ───────────────────────────────────────────────────

    fn arm_schedules(&mut self, now: DateTime<Utc>) {
        let names: Vec<String> = self.config.jobs.keys().cloned().collect();
        for name in names {
            self.arm_job(&name, now);
        }
    }

    /// Enqueue the next scheduled run of a job, unless one is outstanding.
    fn arm_job(&mut self, job_name: &str, now: DateTime<Utc>) {
        if self.shutting_down {
            return;
        }
        let Some(job) = self.config.jobs.get(job_name).cloned() else {
            return;
        };
        let Some(expr) = job.schedule_expr.clone() else {
            return;
        };
        if self.job_pending(job_name) {
            return;
        }
        if !job.concurrent_runs && self.job_running(job_name) {
            return;
        }

        let tz = job
            .schedule_timezone
            .as_deref()
            .map(parse_tz)
            .unwrap_or(self.local_tz);
        match expr.next_fire(now, tz) {
            Some(fire) => {
                self.exhausted.remove(job_name);
                let run = Run::scheduled(job_name, fire);
                tracing::debug!(job = %job_name, fire = %fire, "armed next scheduled run");
                self.enqueue_at(fire, PendingRun { run, job });
            }
            None => {
                if self.exhausted.insert(job_name.to_string()) {
                    tracing::info!(job = %job_name, "schedule exhausted, job is now idle");
                }
            }
        }
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    async fn dispatch_due(&mut self, now: DateTime<Utc>) -> Result<()> {
        loop {
            let Some(key) = self.pending.keys().next().cloned() else {
                break;
            };
            if key.due > now {
                break;
            }
            let Some(entry) = self.pending.remove(&key) else {
                break;
            };
            if self.shutting_down {
                tracing::info!(job = %entry.run.job_name, run_id = %entry.run.run_id, "discarding pending run at shutdown");
                continue;
            }
            self.try_start(entry, now).await?;
        }
        Ok(())
    }

    async fn try_start(&mut self, entry: PendingRun, now: DateTime<Utc>) -> Result<()> {
        if !entry.job.concurrent_runs && self.job_running(&entry.run.job_name) {
            // Wait for the running run; released on its completion.
            self.held
                .entry(entry.run.job_name.clone())
                .or_default()
                .push(entry);
            return Ok(());
        }
        match self.arbiter.try_admit(&entry.job) {
            Admission::Denied => {
                let delay = self.backoff.next_delay(&entry.run.job_name);
                tracing::debug!(
                    job = %entry.run.job_name,
                    delay_secs = delay.as_secs(),
                    "admission denied, backing off"
                );
                let due = now
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(300));
                self.enqueue_at(due, entry);
            }
            Admission::Granted { group } => {
                self.backoff.reset(&entry.run.job_name);
                self.start_run(entry, group).await?;
            }
        }
        Ok(())
    }

    async fn start_run(&mut self, mut entry: PendingRun, group: Option<String>) -> Result<()> {
        entry.run.concurrency_group = group;
        let previous = self.lookup_previous(&entry.run.job_name);

        let spawned = supervisor::spawn_run(
            &self.config,
            &entry.job,
            &mut entry.run,
            &previous,
            self.events_tx.clone(),
        )
        .await;

        match spawned {
            Ok(Spawned::Started(child)) => {
                tracing::info!(
                    job = %entry.run.job_name,
                    run_id = %entry.run.run_id,
                    pid = child.pid,
                    trigger = %entry.run.trigger_type,
                    "run started"
                );
                if let Err(e) = self.store.insert_running(&entry.run) {
                    // Not fatal: the run is tracked in memory and the
                    // finalize path does not require the running row.
                    tracing::error!(error = %e, run_id = %entry.run.run_id, "failed to record running run");
                }
                self.running.insert(
                    entry.run.run_id,
                    RunningRun {
                        run: entry.run,
                        job: entry.job,
                        child,
                    },
                );
            }
            Ok(Spawned::Failed { exit_code }) => {
                self.finish_synthesized(entry.run, exit_code).await?;
            }
            Err(e) => {
                tracing::error!(
                    job = %entry.run.job_name,
                    run_id = %entry.run.run_id,
                    error = %e,
                    "run setup failed"
                );
                self.finish_synthesized(entry.run, supervisor::EXIT_NOT_EXECUTABLE)
                    .await?;
            }
        }
        Ok(())
    }

    /// Commit a run that never spawned: `start_time == stop_time`.
    async fn finish_synthesized(&mut self, mut run: Run, exit_code: i32) -> Result<()> {
        let now = Utc::now();
        let start = run.start_time.unwrap_or(now);
        run.start_time = Some(start);
        run.stop_time = Some(start);
        run.exit_code = Some(exit_code);
        self.commit_finished(run).await
    }

    // ── Completion ───────────────────────────────────────────────────

    async fn reap(&mut self, outcome: RunOutcome) -> Result<()> {
        let Some(mut finished) = self.running.remove(&outcome.run_id) else {
            tracing::warn!(run_id = %outcome.run_id, "outcome for unknown run");
            return Ok(());
        };
        finished.run.stop_time = Some(outcome.stop_time);
        finished.run.exit_code = Some(outcome.exit_code);
        tracing::info!(
            job = %finished.run.job_name,
            run_id = %finished.run.run_id,
            exit_code = outcome.exit_code,
            "run finished"
        );
        self.commit_finished(finished.run).await
    }

    async fn commit_finished(&mut self, run: Run) -> Result<()> {
        if let Some(group) = run.concurrency_group.clone() {
            self.arbiter.release(&group);
        }
        self.persist_finished(&run).await?;

        let job_name = run.job_name.clone();
        if let Some(held) = self.held.remove(&job_name) {
            let now = Utc::now();
            for entry in held {
                self.enqueue_at(now, entry);
            }
        }
        if run.respawn && !self.shutting_down {
            self.arm_job(&job_name, Utc::now());
        }
        Ok(())
    }

    /// Commit with bounded retries, spooling as a last resort. A run is
    /// never dropped: if even the spool write fails the error is fatal.
    async fn persist_finished(&mut self, run: &Run) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            match self.store.finalize(run) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < 3 => {
                    attempt += 1;
                    tracing::warn!(
                        run_id = %run.run_id,
                        error = %e,
                        attempt,
                        "finalize failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(100 << attempt)).await;
                }
                Err(e) => {
                    tracing::error!(
                        run_id = %run.run_id,
                        error = %e,
                        "finalize failed, writing spool entry"
                    );
                    spool::spool_run(&self.config.data_dir.join("spool"), run)?;
                    return Ok(());
                }
            }
        }
    }

    fn lookup_previous(&self, job_name: &str) -> PreviousRuns {
        let fetch = |result: Result<Option<Run>>| match result {
            Ok(run) => run,
            Err(e) => {
                tracing::warn!(job = %job_name, error = %e, "previous-run lookup failed");
                None
            }
        };
        PreviousRuns {
            last: fetch(self.store.latest_completed(job_name)),
            good: fetch(self.store.latest_completed_with_exit(job_name, true)),
            bad: fetch(self.store.latest_completed_with_exit(job_name, false)),
        }
    }

    // ── Triggers ─────────────────────────────────────────────────────

    fn ingest_triggers(&mut self, now: DateTime<Utc>) {
        let events = triggers::scan(&self.config.data_dir, &self.config, now);
        for event in events {
            let Some(job) = self.config.jobs.get(&event.job_name).cloned() else {
                continue;
            };
            let respawn = job.schedule_expr.is_some();
            let run = Run::triggered(&event.job_name, event.schedule_time, event.payload, respawn);

            if !job.concurrent_runs {
                let cancelled = self.cancel_pending(&event.job_name);
                if cancelled > 0 {
                    tracing::info!(
                        job = %event.job_name,
                        cancelled,
                        "trigger supplants pending run"
                    );
                }
            }
            tracing::info!(
                job = %event.job_name,
                run_id = %run.run_id,
                schedule_time = %event.schedule_time,
                "trigger ingested"
            );
            // A past schedule_time dispatches immediately; a future one
            // waits in the queue (in memory only, not durable).
            self.enqueue_at(event.schedule_time, PendingRun { run, job });
        }
    }

    /// Cancel every not-yet-started run of a job. Running runs are never
    /// affected.
    fn cancel_pending(&mut self, job_name: &str) -> usize {
        let keys: Vec<PendingKey> = self
            .pending
            .iter()
            .filter(|(_, entry)| entry.run.job_name == job_name)
            .map(|(key, _)| key.clone())
            .collect();
        let mut cancelled = keys.len();
        for key in keys {
            self.pending.remove(&key);
        }
        cancelled += self.held.remove(job_name).map_or(0, |held| held.len());
        cancelled
    }

    // ── Signals ──────────────────────────────────────────────────────

    fn begin_shutdown(&mut self, signal_name: &str) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        let discarded =
            self.pending.len() + self.held.values().map(Vec::len).sum::<usize>();
        self.pending.clear();
        self.held.clear();
        tracing::info!(
            signal = signal_name,
            discarded,
            running = self.running.len(),
            kill_runs = self.config.shutdown_kill_runs,
            "shutdown initiated"
        );
        if self.config.shutdown_kill_runs {
            for running in self.running.values() {
                let grace = effective_kill_grace(
                    self.config.shutdown_kill_grace,
                    running.job.max_execution_grace,
                );
                let _ = running.child.kill_tx.try_send(KillOrder { grace });
            }
        }
    }

    /// SIGHUP: swap the catalog between ticks. In-flight runs keep their
    /// job snapshots; pending runs are refreshed against the new catalog.
    fn reload(&mut self) {
        tracing::info!(config_dir = %self.config_dir.display(), "reloading configuration");
        let new = match config::load(&self.config_dir) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(error = %e, "reload failed, keeping previous catalog");
                return;
            }
        };

        enum Decision {
            Keep(cadenza_domain::config::Job),
            Drop,
        }

        let keys: Vec<PendingKey> = self.pending.keys().cloned().collect();
        let mut dropped = 0;
        for key in keys {
            let decision = {
                let Some(entry) = self.pending.get(&key) else {
                    continue;
                };
                match new.jobs.get(&entry.run.job_name) {
                    None => Decision::Drop,
                    Some(new_job) => {
                        let scheduled = entry.run.trigger_type == TriggerType::Schedule;
                        let schedule_changed = new_job.schedule != entry.job.schedule
                            || new_job.schedule_timezone != entry.job.schedule_timezone;
                        if scheduled && schedule_changed {
                            // Re-armed below from the new expression.
                            Decision::Drop
                        } else {
                            Decision::Keep(new_job.clone())
                        }
                    }
                }
            };
            match decision {
                Decision::Drop => {
                    self.pending.remove(&key);
                    dropped += 1;
                }
                Decision::Keep(job) => {
                    if let Some(entry) = self.pending.get_mut(&key) {
                        entry.job = job;
                    }
                }
            }
        }

        // Held triggered runs follow the same rule.
        self.held.retain(|job_name, _| new.jobs.contains_key(job_name));
        for (job_name, entries) in self.held.iter_mut() {
            if let Some(job) = new.jobs.get(job_name) {
                for entry in entries {
                    entry.job = job.clone();
                }
            }
        }

        self.arbiter.set_caps(&new);
        self.config = new;
        self.exhausted.clear();
        if let Err(e) = self.ensure_layout() {
            tracing::warn!(error = %e, "failed to create data layout for new catalog");
        }
        self.arm_schedules(Utc::now());
        tracing::info!(
            jobs = self.config.jobs.len(),
            dropped_pending = dropped,
            "catalog reloaded"
        );
    }

    /// SIGQUIT: human-readable snapshot of current state, to the log.
    fn dump_status(&self) {
        tracing::info!(
            running = self.running.len(),
            pending = self.pending.len(),
            held = self.held.values().map(Vec::len).sum::<usize>(),
            shutting_down = self.shutting_down,
            "status dump"
        );
        for running in self.running.values() {
            tracing::info!(
                job = %running.run.job_name,
                run_id = %running.run.run_id,
                pid = running.child.pid,
                started = ?running.run.start_time,
                "status: running"
            );
        }
        for (key, entry) in &self.pending {
            tracing::info!(
                job = %entry.run.job_name,
                due = %key.due,
                trigger = %entry.run.trigger_type,
                "status: pending"
            );
        }
        for (group, active) in self.arbiter.snapshot() {
            tracing::info!(group = %group, active, "status: concurrency group");
        }
    }
}

fn effective_kill_grace(shutdown_kill_grace: Option<u64>, job_grace: u64) -> Duration {
    Duration::from_secs(match shutdown_kill_grace {
        Some(bound) => bound.min(job_grace),
        None => job_grace,
    })
}
