//! Schedule expression engine: cron-style lines with `H`/`R` extensions and
//! a subset of iCalendar recurrence rules, both behind a single
//! [`ScheduleExpr::next_fire`] operation.

pub mod cron;
pub mod hash;
pub mod rrule;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

pub use cron::CronExpr;
pub use rrule::{Freq, RruleExpr};

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("cron expression must have 5 or 6 fields, got {0}")]
    FieldCount(usize),

    #[error("invalid {field} field: `{value}`")]
    InvalidField { field: &'static str, value: String },

    #[error("recurrence rule: {0}")]
    InvalidRule(String),

    #[error("unsupported recurrence component: {0}")]
    UnsupportedRule(String),
}

/// A parsed schedule expression, tagged by family.
#[derive(Debug, Clone)]
pub enum ScheduleExpr {
    Cron(CronExpr),
    Rrule(RruleExpr),
}

impl ScheduleExpr {
    /// Parse an expression for the given job. Expressions containing
    /// `FREQ=` parse as recurrence rules; everything else as cron.
    pub fn parse(expr: &str, job_name: &str) -> Result<Self, ScheduleError> {
        if expr.to_ascii_uppercase().contains("FREQ=") {
            Ok(Self::Rrule(rrule::parse_rrule(expr, job_name)?))
        } else {
            Ok(Self::Cron(cron::parse_cron(expr, job_name)?))
        }
    }

    /// Smallest instant strictly greater than `after` at which the schedule
    /// is satisfied in `tz`, or `None` when the schedule has terminated.
    pub fn next_fire(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        match self {
            Self::Cron(c) => c.next_fire(after, tz),
            Self::Rrule(r) => r.next_fire(after, tz),
        }
    }
}

/// Parse a timezone string into a `chrono_tz::Tz`, falling back to UTC.
pub fn parse_tz(tz: &str) -> Tz {
    tz.parse::<Tz>().unwrap_or(chrono_tz::UTC)
}

/// The daemon's local zone: `$TZ` when it names an IANA zone, else UTC.
pub fn local_tz() -> Tz {
    std::env::var("TZ")
        .ok()
        .and_then(|tz| tz.parse::<Tz>().ok())
        .unwrap_or(chrono_tz::UTC)
}
