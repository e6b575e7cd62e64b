//! Job catalog: configuration model, loader, and validation.
//!
//! The loader reads `cadenza.json` (preferred) or `cadenza.yaml` from the
//! config directory and delivers a validated catalog: job groups expanded
//! into plain jobs, schedule expressions parsed, names and timezones
//! checked. A catalog that fails validation is rejected wholesale; on
//! SIGHUP the daemon keeps the previous one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Deserialize;

use cadenza_schedule::ScheduleExpr;

use crate::error::{Error, Result};

/// Legal job and job-group names.
pub const NAME_PATTERN: &str = "^[- A-Za-z0-9_+.:@]+$";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "d_data_dir")]
    pub data_dir: PathBuf,
    /// Overlaid onto every run's environment (below job- and
    /// trigger-level entries).
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Terminate in-flight runs on shutdown instead of waiting for them.
    #[serde(default)]
    pub shutdown_kill_runs: bool,
    /// Upper bound (seconds) on the SIGTERM→SIGKILL wait during shutdown.
    #[serde(default)]
    pub shutdown_kill_grace: Option<u64>,
    /// Carried for the out-of-band report generator.
    #[serde(default)]
    pub template_dir: Option<PathBuf>,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub jobs: HashMap<String, Job>,
    /// Expanded into `jobs` by [`Config::finalize`]; empty afterwards.
    #[serde(default)]
    pub job_groups: HashMap<String, JobGroup>,
    #[serde(default)]
    pub concurrency_groups: HashMap<String, ConcurrencyGroup>,
}

fn d_data_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => Path::new(&home).join(".cadenza"),
        None => PathBuf::from("var"),
    }
}

/// Run-store backend selection. The tag is the plug point; each variant
/// carries its backend-specific settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DatabaseConfig {
    Sqlite {
        /// Database file; defaults to `<data_dir>/cadenza.sqlite3`.
        #[serde(default)]
        file: Option<PathBuf>,
    },
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self::Sqlite { file: None }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Jobs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    /// Filled from the catalog key during finalize.
    #[serde(skip)]
    pub name: String,
    /// Argv tokens; must be non-empty.
    #[serde(default)]
    pub command: Vec<String>,
    /// Append the job name and run id as trailing argv.
    #[serde(default)]
    pub command_append_run: bool,
    #[serde(default)]
    pub schedule: Option<String>,
    /// IANA zone; the daemon's local zone when unset.
    #[serde(default)]
    pub schedule_timezone: Option<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Seconds until SIGTERM; 0 or absent means no bound.
    #[serde(default)]
    pub max_execution: Option<u64>,
    /// Seconds from SIGTERM to SIGKILL.
    #[serde(default = "d_max_execution_grace")]
    pub max_execution_grace: u64,
    /// Order is the admission tie-break order.
    #[serde(default)]
    pub concurrency_groups: Vec<String>,
    /// Permit overlapping runs of this job.
    #[serde(default)]
    pub concurrent_runs: bool,
    #[serde(default = "d_true")]
    pub render_reports: bool,
    /// Emit the Jenkins-compatible environment block.
    #[serde(default)]
    pub jenkins_environment: bool,
    /// Set on members during job-group expansion.
    #[serde(default)]
    pub job_group: Option<String>,
    /// Parsed during finalize; `None` for unscheduled (trigger-only) jobs.
    #[serde(skip)]
    pub schedule_expr: Option<ScheduleExpr>,
}

impl Default for Job {
    fn default() -> Self {
        Self {
            name: String::new(),
            command: Vec::new(),
            command_append_run: false,
            schedule: None,
            schedule_timezone: None,
            environment: HashMap::new(),
            max_execution: None,
            max_execution_grace: d_max_execution_grace(),
            concurrency_groups: Vec::new(),
            concurrent_runs: false,
            render_reports: true,
            jenkins_environment: false,
            job_group: None,
            schedule_expr: None,
        }
    }
}

fn d_max_execution_grace() -> u64 {
    60
}

fn d_true() -> bool {
    true
}

/// A job template applied to every name in `job_names`.
#[derive(Debug, Clone, Deserialize)]
pub struct JobGroup {
    #[serde(flatten)]
    pub template: Job,
    #[serde(default)]
    pub job_names: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConcurrencyGroup {
    #[serde(default = "d_group_max")]
    pub max: u32,
}

fn d_group_max() -> u32 {
    1
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Loading & validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Load and validate the catalog from `<config_dir>/cadenza.json`, falling
/// back to `cadenza.yaml`. When both files exist, JSON wins.
pub fn load(config_dir: &Path) -> Result<Config> {
    let json_path = config_dir.join("cadenza.json");
    let yaml_path = config_dir.join("cadenza.yaml");

    let mut config: Config = if json_path.exists() {
        serde_json::from_str(&std::fs::read_to_string(&json_path)?)
            .map_err(|e| Error::Config(format!("{}: {e}", json_path.display())))?
    } else if yaml_path.exists() {
        serde_yaml::from_str(&std::fs::read_to_string(&yaml_path)?)
            .map_err(|e| Error::Config(format!("{}: {e}", yaml_path.display())))?
    } else {
        return Err(Error::Config(format!(
            "no cadenza.json or cadenza.yaml in {}",
            config_dir.display()
        )));
    };

    config.finalize()?;
    Ok(config)
}

impl Config {
    /// Expand job groups, fill job names, parse schedules, validate.
    pub fn finalize(&mut self) -> Result<()> {
        let name_re = Regex::new(NAME_PATTERN)
            .map_err(|e| Error::Config(format!("name pattern: {e}")))?;

        for (group_name, group) in std::mem::take(&mut self.job_groups) {
            if !name_re.is_match(&group_name) {
                return Err(Error::Config(format!(
                    "invalid job group name `{group_name}`"
                )));
            }
            for member in &group.job_names {
                if self.jobs.contains_key(member) {
                    return Err(Error::Config(format!(
                        "job `{member}` defined both standalone and in group `{group_name}`"
                    )));
                }
                let mut job = group.template.clone();
                job.job_group = Some(group_name.clone());
                self.jobs.insert(member.clone(), job);
            }
        }

        for (name, job) in &mut self.jobs {
            if !name_re.is_match(name) {
                return Err(Error::Config(format!("invalid job name `{name}`")));
            }
            job.name = name.clone();
            if job.command.is_empty() {
                return Err(Error::Config(format!("job `{name}` has no command")));
            }
            if let Some(tz) = &job.schedule_timezone {
                if tz.parse::<chrono_tz::Tz>().is_err() {
                    return Err(Error::Config(format!(
                        "job `{name}`: unknown timezone `{tz}`"
                    )));
                }
            }
            if let Some(expr) = &job.schedule {
                let parsed = ScheduleExpr::parse(expr, name).map_err(|e| {
                    Error::Config(format!("job `{name}`: bad schedule `{expr}`: {e}"))
                })?;
                job.schedule_expr = Some(parsed);
            }
        }

        for (name, group) in &self.concurrency_groups {
            if group.max == 0 {
                return Err(Error::Config(format!(
                    "concurrency group `{name}`: max must be positive"
                )));
            }
        }

        Ok(())
    }

    /// Cap of a concurrency group; undeclared groups behave as `max = 1`.
    pub fn group_cap(&self, name: &str) -> u32 {
        self.concurrency_groups.get(name).map(|g| g.max).unwrap_or(1)
    }

    /// Effective sqlite database file path.
    pub fn database_file(&self) -> PathBuf {
        match &self.database {
            DatabaseConfig::Sqlite { file: Some(f) } => f.clone(),
            DatabaseConfig::Sqlite { file: None } => self.data_dir.join("cadenza.sqlite3"),
        }
    }
}
