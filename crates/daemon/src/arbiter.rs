//! Concurrency-group admission and per-job retry backoff.

use std::collections::HashMap;
use std::time::Duration;

use cadenza_domain::config::{Config, Job};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Arbiter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Admitted; `group` is the single group that was charged, if any.
    Granted { group: Option<String> },
    Denied,
}

/// Tracks live slot counts per concurrency group. Caps come from the
/// catalog; an undeclared group referenced by a job caps at 1.
pub struct Arbiter {
    caps: HashMap<String, u32>,
    active: HashMap<String, u32>,
}

impl Arbiter {
    pub fn new(config: &Config) -> Self {
        let mut arbiter = Self {
            caps: HashMap::new(),
            active: HashMap::new(),
        };
        arbiter.set_caps(config);
        arbiter
    }

    /// Refresh caps from a reloaded catalog. Live counts are preserved:
    /// in-flight runs keep their slots under the new caps.
    pub fn set_caps(&mut self, config: &Config) {
        self.caps = config
            .concurrency_groups
            .iter()
            .map(|(name, group)| (name.clone(), group.max))
            .collect();
    }

    fn cap(&self, group: &str) -> u32 {
        self.caps.get(group).copied().unwrap_or(1)
    }

    pub fn active(&self, group: &str) -> u32 {
        self.active.get(group).copied().unwrap_or(0)
    }

    /// Admit iff every group the job lists has headroom. Only the chosen
    /// group (the first in the job's configured order) is charged.
    pub fn try_admit(&mut self, job: &Job) -> Admission {
        if job.concurrency_groups.is_empty() {
            return Admission::Granted { group: None };
        }
        for group in &job.concurrency_groups {
            if self.active(group) >= self.cap(group) {
                return Admission::Denied;
            }
        }
        let chosen = job.concurrency_groups[0].clone();
        *self.active.entry(chosen.clone()).or_insert(0) += 1;
        Admission::Granted {
            group: Some(chosen),
        }
    }

    /// Release the slot charged at admission. One release per admitted run.
    pub fn release(&mut self, group: &str) {
        match self.active.get_mut(group) {
            Some(count) if *count > 0 => *count -= 1,
            _ => tracing::warn!(group = %group, "release without a live slot"),
        }
    }

    /// Live counts, for the status dump.
    pub fn snapshot(&self) -> Vec<(String, u32)> {
        let mut counts: Vec<(String, u32)> = self
            .active
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(name, count)| (name.clone(), *count))
            .collect();
        counts.sort();
        counts
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Backoff
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Per-job exponential retry delay for denied admissions: doubling from
/// 2 s, capped at 5 minutes, reset on successful admission.
#[derive(Default)]
pub struct Backoff {
    delays: HashMap<String, Duration>,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// The delay to apply now; the stored delay doubles for next time.
    pub fn next_delay(&mut self, job_name: &str) -> Duration {
        let entry = self
            .delays
            .entry(job_name.to_string())
            .or_insert(INITIAL_BACKOFF);
        let delay = *entry;
        *entry = (*entry * 2).min(MAX_BACKOFF);
        delay
    }

    pub fn reset(&mut self, job_name: &str) {
        self.delays.remove(job_name);
    }
}
