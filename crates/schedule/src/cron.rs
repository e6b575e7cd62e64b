//! Cron-style schedule expressions, timezone-aware, with `H`/`R` fields.
//!
//! Five required fields (minute, hour, day-of-month, month, day-of-week)
//! plus an optional sixth (second). A missing second field behaves as `H`:
//! a stable hashed second, so jobs do not all fire on `:00`.
//!
//! **DST handling:**
//! - Spring-forward gaps: local times that don't exist are skipped.
//! - Fall-back overlaps: the earliest (pre-transition) mapping is chosen.

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::hash::{hash_in, random_in, stable_hash};
use crate::ScheduleError;

/// Scan bound: one year of minutes (matches the evaluation contract).
const MAX_SCAN_MINUTES: u32 = 366 * 24 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Elem {
    /// `*` or `*/step`.
    All { step: u32 },
    /// A concrete value, range, or stepped range. `H` resolves here at parse.
    Range { lo: u32, hi: u32, step: u32 },
    /// `R[(a-b)][/step]` — redrawn on every evaluation.
    Random { lo: u32, hi: u32, step: Option<u32> },
}

#[derive(Debug, Clone)]
struct Field {
    elems: Vec<Elem>,
    lo: u32,
    hi: u32,
    /// Day-of-week values wrap modulo 7 (`7` is Sunday, same as `0`).
    wrap7: bool,
}

impl Field {
    /// True when the field constrains its domain (anything but a bare `*`).
    /// Drives the vixie day-matching rule.
    fn restricted(&self) -> bool {
        !(self.elems.len() == 1 && self.elems[0] == Elem::All { step: 1 })
    }

    /// Materialize the concrete value set. `Random` elements draw fresh.
    fn values(&self) -> BTreeSet<u32> {
        let mut out = BTreeSet::new();
        for elem in &self.elems {
            match *elem {
                Elem::All { step } => {
                    for v in (self.lo..=self.hi).step_by(step as usize) {
                        out.insert(self.norm(v));
                    }
                }
                Elem::Range { lo, hi, step } => {
                    for v in (lo..=hi).step_by(step as usize) {
                        out.insert(self.norm(v));
                    }
                }
                Elem::Random { lo, hi, step } => match step {
                    None => {
                        out.insert(self.norm(random_in(lo, hi)));
                    }
                    Some(step) => {
                        let phase = lo + random_in(0, step - 1);
                        for v in (phase..=hi).step_by(step as usize) {
                            out.insert(self.norm(v));
                        }
                    }
                },
            }
        }
        out
    }

    fn norm(&self, v: u32) -> u32 {
        if self.wrap7 {
            v % 7
        } else {
            v
        }
    }
}

/// A parsed cron expression. `H` fields are already resolved (they are a
/// pure function of the job name), `R` fields re-roll per evaluation.
#[derive(Debug, Clone)]
pub struct CronExpr {
    minute: Field,
    hour: Field,
    dom: Field,
    month: Field,
    dow: Field,
    second: Field,
}

/// Expand `@`-aliases into their hash-style five-field equivalents.
fn expand_alias(expr: &str) -> Option<&'static str> {
    match expr {
        "@hourly" => Some("H * * * *"),
        "@daily" | "@midnight" => Some("H H * * *"),
        "@weekly" => Some("H H * * H"),
        "@monthly" => Some("H H H * *"),
        "@annually" | "@yearly" => Some("H H H H *"),
        _ => None,
    }
}

/// Parse a 5- or 6-field cron expression for the given job.
pub fn parse_cron(expr: &str, job_name: &str) -> Result<CronExpr, ScheduleError> {
    let expr = expr.trim();
    let expr = expand_alias(expr).unwrap_or(expr);

    let tokens: Vec<&str> = expr.split_whitespace().collect();
    if tokens.len() != 5 && tokens.len() != 6 {
        return Err(ScheduleError::FieldCount(tokens.len()));
    }

    let minute = parse_field(tokens[0], "minute", job_name, 0, 59, false)?;
    let hour = parse_field(tokens[1], "hour", job_name, 0, 23, false)?;
    let dom = parse_field(tokens[2], "dom", job_name, 1, 31, false)?;
    let month = parse_field(tokens[3], "month", job_name, 1, 12, false)?;
    let dow = parse_field(tokens[4], "dow", job_name, 0, 7, true)?;
    // The sixth field defaults to a hashed constant second, not `*`.
    let second = match tokens.get(5) {
        Some(tok) => parse_field(tok, "second", job_name, 0, 59, false)?,
        None => parse_field("H", "second", job_name, 0, 59, false)?,
    };

    Ok(CronExpr {
        minute,
        hour,
        dom,
        month,
        dow,
        second,
    })
}

fn parse_field(
    token: &str,
    name: &'static str,
    job_name: &str,
    lo: u32,
    hi: u32,
    wrap7: bool,
) -> Result<Field, ScheduleError> {
    let invalid = || ScheduleError::InvalidField {
        field: name,
        value: token.to_string(),
    };

    let mut elems = Vec::new();
    for part in token.split(',') {
        elems.push(parse_elem(part, name, job_name, lo, hi).ok_or_else(&invalid)?);
    }
    if elems.is_empty() {
        return Err(invalid());
    }
    Ok(Field {
        elems,
        lo,
        hi,
        wrap7,
    })
}

/// Parse one comma-list element. Returns `None` on any syntax or range error;
/// the caller attaches the field context.
fn parse_elem(part: &str, name: &'static str, job_name: &str, lo: u32, hi: u32) -> Option<Elem> {
    if part == "*" {
        return Some(Elem::All { step: 1 });
    }
    if let Some(step) = part.strip_prefix("*/") {
        let step: u32 = step.parse().ok()?;
        if step == 0 {
            return None;
        }
        return Some(Elem::All { step });
    }

    if let Some(rest) = part.strip_prefix('H').or_else(|| part.strip_prefix('R')) {
        let random = part.starts_with('R');
        let (range_part, step) = match rest.split_once('/') {
            Some((r, s)) => {
                let step: u32 = s.parse().ok()?;
                if step == 0 {
                    return None;
                }
                (r, Some(step))
            }
            None => (rest, None),
        };
        let (a, b) = if range_part.is_empty() {
            (lo, hi)
        } else {
            let inner = range_part.strip_prefix('(')?.strip_suffix(')')?;
            let (a, b) = parse_range(inner, lo, hi)?;
            (a, b)
        };
        if let Some(step) = step {
            if step > b - a + 1 {
                return None;
            }
        }
        if random {
            return Some(Elem::Random {
                lo: a,
                hi: b,
                step,
            });
        }
        return Some(match step {
            // Jenkins semantics: hash a phase into [a, a+step), then step.
            Some(step) => {
                let phase = a + (stable_hash(job_name, name) % u64::from(step)) as u32;
                Elem::Range {
                    lo: phase,
                    hi: b,
                    step,
                }
            }
            None => {
                let v = hash_in(job_name, name, a, b);
                Elem::Range {
                    lo: v,
                    hi: v,
                    step: 1,
                }
            }
        });
    }

    // Numeric: `a`, `a-b`, `a-b/step`.
    let (range_part, step) = match part.split_once('/') {
        Some((r, s)) => {
            let step: u32 = s.parse().ok()?;
            if step == 0 {
                return None;
            }
            (r, step)
        }
        None => (part, 1),
    };
    let (a, b) = parse_range(range_part, lo, hi)?;
    Some(Elem::Range {
        lo: a,
        hi: b,
        step,
    })
}

/// Parse `a` or `a-b` within the inclusive domain `[lo, hi]`.
fn parse_range(s: &str, lo: u32, hi: u32) -> Option<(u32, u32)> {
    let (a, b) = match s.split_once('-') {
        Some((a, b)) => (a.parse().ok()?, b.parse().ok()?),
        None => {
            let v: u32 = s.parse().ok()?;
            (v, v)
        }
    };
    if a < lo || b > hi || a > b {
        return None;
    }
    Some((a, b))
}

impl CronExpr {
    /// Smallest instant strictly greater than `after` matching the
    /// expression, evaluated in `tz`. `None` when no match exists within
    /// the scan horizon.
    pub fn next_fire(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let minutes = self.minute.values();
        let hours = self.hour.values();
        let doms = self.dom.values();
        let months = self.month.values();
        let dows = self.dow.values();
        let seconds = self.second.values();

        let local_after = after.with_timezone(&tz).naive_local();
        let mut candidate = local_after.with_second(0)?.with_nanosecond(0)?;

        for _ in 0..MAX_SCAN_MINUTES {
            if months.contains(&candidate.month())
                && hours.contains(&candidate.hour())
                && minutes.contains(&candidate.minute())
                && self.day_matches(&doms, &dows, candidate.date())
            {
                for &sec in &seconds {
                    let Some(dt) = candidate.with_second(sec) else {
                        continue;
                    };
                    let mapped = match tz.from_local_datetime(&dt) {
                        LocalResult::Single(x) => x,
                        LocalResult::Ambiguous(earliest, _) => earliest,
                        // DST gap — this local minute doesn't exist. Skip.
                        LocalResult::None => break,
                    };
                    let utc = mapped.with_timezone(&Utc);
                    if utc > after {
                        return Some(utc);
                    }
                }
            }
            candidate += Duration::minutes(1);
        }
        None
    }

    /// Vixie rule: when both dom and dow are restricted, a day matches if
    /// either side matches; otherwise both (an unrestricted side always
    /// matches anyway).
    fn day_matches(&self, doms: &BTreeSet<u32>, dows: &BTreeSet<u32>, date: NaiveDate) -> bool {
        let dom_ok = doms.contains(&date.day());
        let dow_ok = dows.contains(&date.weekday().num_days_from_sunday());
        if self.dom.restricted() && self.dow.restricted() {
            dom_ok || dow_ok
        } else {
            dom_ok && dow_ok
        }
    }
}
