//! The dynamic run record and trigger payload accessors.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// How a run came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Schedule,
    File,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Schedule => "schedule",
            Self::File => "file",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn d_trigger_data() -> Value {
    Value::Object(Default::default())
}

/// One execution attempt of a job. Identifiers are never reused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: Uuid,
    pub job_name: String,
    /// The instant this run first became eligible: cron fire time, the
    /// trigger's requested time, or the trigger file's mtime.
    pub schedule_time: DateTime<Utc>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stop_time: Option<DateTime<Utc>>,
    /// `128 + signum` for signal-terminated children.
    #[serde(default)]
    pub exit_code: Option<i32>,
    pub trigger_type: TriggerType,
    #[serde(default = "d_trigger_data")]
    pub trigger_data: Value,
    /// The group charged at admission, if any.
    #[serde(default)]
    pub concurrency_group: Option<String>,
    /// Re-arm the job's schedule immediately when this run completes.
    #[serde(default)]
    pub respawn: bool,
}

impl Run {
    pub fn scheduled(job_name: &str, schedule_time: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            job_name: job_name.to_string(),
            schedule_time,
            start_time: None,
            stop_time: None,
            exit_code: None,
            trigger_type: TriggerType::Schedule,
            trigger_data: d_trigger_data(),
            concurrency_group: None,
            respawn: true,
        }
    }

    pub fn triggered(
        job_name: &str,
        schedule_time: DateTime<Utc>,
        trigger_data: Value,
        respawn: bool,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            job_name: job_name.to_string(),
            schedule_time,
            start_time: None,
            stop_time: None,
            exit_code: None,
            trigger_type: TriggerType::File,
            trigger_data,
            concurrency_group: None,
            respawn,
        }
    }
}

/// `schedule_time` in a trigger payload: epoch seconds (integer or float)
/// or an ISO-8601 string.
pub fn payload_schedule_time(payload: &Value) -> Option<DateTime<Utc>> {
    match payload.get("schedule_time")? {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Utc.timestamp_opt(i, 0).single()
            } else {
                let f = n.as_f64()?;
                let secs = f.floor();
                let nanos = ((f - secs) * 1e9) as u32;
                Utc.timestamp_opt(secs as i64, nanos).single()
            }
        }
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|d| d.with_timezone(&Utc))
            .or_else(|| {
                NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
                    .ok()
                    .map(|n| Utc.from_utc_datetime(&n))
            }),
        _ => None,
    }
}

/// The optional `environment` string map of a trigger payload. Non-string
/// values are ignored.
pub fn payload_environment(payload: &Value) -> HashMap<String, String> {
    payload
        .get("environment")
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}
