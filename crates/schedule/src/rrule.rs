//! Recurrence-rule schedules — a pragmatic subset of the iCalendar RRULE
//! grammar: `FREQ`, `INTERVAL`, `BYMINUTE`, `BYHOUR`, `BYDAY`, `BYMONTH`,
//! `BYMONTHDAY`, `BYSETPOS`, `UNTIL`. `COUNT` is rejected at parse time.
//!
//! Positional components finer than the frequency that the rule leaves
//! unspecified are filled by hashing the job name into the allowed domain,
//! so `FREQ=DAILY` pins a stable time-of-day per job. `INTERVAL` is anchored
//! to the Unix epoch in the job's zone, which keeps `INTERVAL=N` rules
//! stable across daemon restarts.

use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc,
    Weekday,
};
use chrono_tz::Tz;

use crate::hash::hash_in;
use crate::ScheduleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freq {
    Minutely,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Freq {
    /// Coarseness rank, used to decide which components get hash-filled.
    fn rank(self) -> u8 {
        match self {
            Freq::Minutely => 0,
            Freq::Hourly => 1,
            Freq::Daily => 2,
            Freq::Weekly => 3,
            Freq::Monthly => 4,
            Freq::Yearly => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ByDay {
    /// Ordinal within the month (`1MO` = first Monday, `-1FR` = last
    /// Friday). Only meaningful for MONTHLY and YEARLY rules.
    ord: Option<i32>,
    weekday: Weekday,
}

#[derive(Debug, Clone, Copy)]
enum Until {
    Utc(DateTime<Utc>),
    Local(NaiveDateTime),
}

#[derive(Debug, Clone)]
pub struct RruleExpr {
    freq: Freq,
    interval: u32,
    by_minute: Vec<u32>,
    by_hour: Vec<u32>,
    by_day: Vec<ByDay>,
    by_month: Vec<u32>,
    by_monthday: Vec<i32>,
    by_setpos: Vec<i32>,
    until: Option<Until>,
    /// Hash-filled second-of-minute (the grammar has no BYSECOND).
    second: u32,
}

/// Parse an RRULE body (with or without the `RRULE:` prefix) for a job.
pub fn parse_rrule(expr: &str, job_name: &str) -> Result<RruleExpr, ScheduleError> {
    let body = expr.trim();
    let body = body.strip_prefix("RRULE:").unwrap_or(body);

    let mut freq = None;
    let mut interval = 1u32;
    let mut by_minute = Vec::new();
    let mut by_hour = Vec::new();
    let mut by_day: Vec<ByDay> = Vec::new();
    let mut by_month = Vec::new();
    let mut by_monthday: Vec<i32> = Vec::new();
    let mut by_setpos: Vec<i32> = Vec::new();
    let mut until = None;

    for pair in body.split(';') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| ScheduleError::InvalidRule(format!("expected KEY=VALUE, got `{pair}`")))?;
        match key.to_ascii_uppercase().as_str() {
            "FREQ" => freq = Some(parse_freq(value)?),
            "INTERVAL" => {
                interval = value
                    .parse()
                    .ok()
                    .filter(|n| *n >= 1)
                    .ok_or_else(|| ScheduleError::InvalidRule(format!("bad INTERVAL `{value}`")))?;
            }
            "BYMINUTE" => by_minute = parse_u32_list(value, 0, 59, "BYMINUTE")?,
            "BYHOUR" => by_hour = parse_u32_list(value, 0, 23, "BYHOUR")?,
            "BYMONTH" => by_month = parse_u32_list(value, 1, 12, "BYMONTH")?,
            "BYMONTHDAY" => by_monthday = parse_i32_list(value, 31, "BYMONTHDAY")?,
            "BYSETPOS" => by_setpos = parse_i32_list(value, 366, "BYSETPOS")?,
            "BYDAY" => {
                for tok in value.split(',') {
                    by_day.push(parse_byday(tok).ok_or_else(|| {
                        ScheduleError::InvalidRule(format!("bad BYDAY entry `{tok}`"))
                    })?);
                }
            }
            "UNTIL" => until = Some(parse_until(value)?),
            "COUNT" => return Err(ScheduleError::UnsupportedRule("COUNT".into())),
            other => return Err(ScheduleError::UnsupportedRule(other.to_string())),
        }
    }

    let freq = freq.ok_or_else(|| ScheduleError::InvalidRule("FREQ is required".into()))?;
    if by_day.iter().any(|d| d.ord.is_some()) && !matches!(freq, Freq::Monthly | Freq::Yearly) {
        return Err(ScheduleError::InvalidRule(
            "ordinal BYDAY requires FREQ=MONTHLY or FREQ=YEARLY".into(),
        ));
    }

    // Hash-fill unspecified components finer than the frequency so each job
    // gets a stable, spread-out fire time.
    let second = hash_in(job_name, "second", 0, 59);
    if by_minute.is_empty() && freq.rank() >= Freq::Hourly.rank() {
        by_minute = vec![hash_in(job_name, "minute", 0, 59)];
    }
    if by_hour.is_empty() && freq.rank() >= Freq::Daily.rank() {
        by_hour = vec![hash_in(job_name, "hour", 0, 23)];
    }
    match freq {
        Freq::Weekly if by_day.is_empty() => {
            by_day = vec![ByDay {
                ord: None,
                weekday: weekday_from_sunday(hash_in(job_name, "dow", 0, 6)),
            }];
        }
        Freq::Monthly if by_day.is_empty() && by_monthday.is_empty() => {
            // 1-28 so the hashed day exists in every month.
            by_monthday = vec![hash_in(job_name, "dom", 1, 28) as i32];
        }
        Freq::Yearly => {
            if by_month.is_empty() {
                by_month = vec![hash_in(job_name, "month", 1, 12)];
            }
            if by_day.is_empty() && by_monthday.is_empty() {
                by_monthday = vec![hash_in(job_name, "dom", 1, 28) as i32];
            }
        }
        _ => {}
    }

    by_minute.sort_unstable();
    by_minute.dedup();
    by_hour.sort_unstable();
    by_hour.dedup();
    by_month.sort_unstable();
    by_month.dedup();

    Ok(RruleExpr {
        freq,
        interval,
        by_minute,
        by_hour,
        by_day,
        by_month,
        by_monthday,
        by_setpos,
        until,
        second,
    })
}

fn parse_freq(value: &str) -> Result<Freq, ScheduleError> {
    match value.to_ascii_uppercase().as_str() {
        "MINUTELY" => Ok(Freq::Minutely),
        "HOURLY" => Ok(Freq::Hourly),
        "DAILY" => Ok(Freq::Daily),
        "WEEKLY" => Ok(Freq::Weekly),
        "MONTHLY" => Ok(Freq::Monthly),
        "YEARLY" => Ok(Freq::Yearly),
        other => Err(ScheduleError::UnsupportedRule(format!("FREQ={other}"))),
    }
}

fn parse_u32_list(
    value: &str,
    lo: u32,
    hi: u32,
    key: &str,
) -> Result<Vec<u32>, ScheduleError> {
    let mut out = Vec::new();
    for tok in value.split(',') {
        let v: u32 = tok
            .parse()
            .ok()
            .filter(|v| (lo..=hi).contains(v))
            .ok_or_else(|| ScheduleError::InvalidRule(format!("bad {key} entry `{tok}`")))?;
        out.push(v);
    }
    Ok(out)
}

fn parse_i32_list(value: &str, max_abs: i32, key: &str) -> Result<Vec<i32>, ScheduleError> {
    let mut out = Vec::new();
    for tok in value.split(',') {
        let v: i32 = tok
            .parse()
            .ok()
            .filter(|v: &i32| *v != 0 && v.abs() <= max_abs)
            .ok_or_else(|| ScheduleError::InvalidRule(format!("bad {key} entry `{tok}`")))?;
        out.push(v);
    }
    Ok(out)
}

fn parse_byday(tok: &str) -> Option<ByDay> {
    let tok = tok.trim();
    if tok.len() < 2 {
        return None;
    }
    let (ord_str, code) = tok.split_at(tok.len() - 2);
    let weekday = match code.to_ascii_uppercase().as_str() {
        "MO" => Weekday::Mon,
        "TU" => Weekday::Tue,
        "WE" => Weekday::Wed,
        "TH" => Weekday::Thu,
        "FR" => Weekday::Fri,
        "SA" => Weekday::Sat,
        "SU" => Weekday::Sun,
        _ => return None,
    };
    let ord = if ord_str.is_empty() {
        None
    } else {
        let n: i32 = ord_str.parse().ok()?;
        if n == 0 || n.abs() > 5 {
            return None;
        }
        Some(n)
    };
    Some(ByDay { ord, weekday })
}

/// `UNTIL` accepts `YYYYMMDD` (whole day, local), `YYYYMMDDTHHMMSS` (local)
/// and `YYYYMMDDTHHMMSSZ` (UTC).
fn parse_until(value: &str) -> Result<Until, ScheduleError> {
    let bad = || ScheduleError::InvalidRule(format!("bad UNTIL `{value}`"));
    if let Some(stripped) = value.strip_suffix('Z') {
        let naive =
            NaiveDateTime::parse_from_str(stripped, "%Y%m%dT%H%M%S").map_err(|_| bad())?;
        return Ok(Until::Utc(Utc.from_utc_datetime(&naive)));
    }
    if value.len() == 8 {
        let date = NaiveDate::parse_from_str(value, "%Y%m%d").map_err(|_| bad())?;
        let eod = date.and_hms_opt(23, 59, 59).ok_or_else(bad)?;
        return Ok(Until::Local(eod));
    }
    let naive = NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S").map_err(|_| bad())?;
    Ok(Until::Local(naive))
}

fn weekday_from_sunday(idx: u32) -> Weekday {
    match idx {
        0 => Weekday::Sun,
        1 => Weekday::Mon,
        2 => Weekday::Tue,
        3 => Weekday::Wed,
        4 => Weekday::Thu,
        5 => Weekday::Fri,
        _ => Weekday::Sat,
    }
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    };
    next.and_then(|d| d.pred_opt()).map(|d| d.day()).unwrap_or(28)
}

/// Monday of ISO week 0: the Monday on or before the Unix epoch.
fn epoch_monday() -> NaiveDate {
    NaiveDate::default() - Duration::days(3)
}

impl RruleExpr {
    /// Smallest instant strictly greater than `after` in `tz`, or `None`
    /// once the rule has terminated (or nothing matches within the scan
    /// horizon).
    pub fn next_fire(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let local_after = after.with_timezone(&tz).naive_local();
        let interval = i64::from(self.interval);

        let mut period = self.period_index(local_after);
        let rem = period.rem_euclid(interval);
        if rem != 0 {
            period += interval - rem;
        }

        for _ in 0..self.max_scan() {
            let mut occs = self.occurrences_in_period(period);
            if !self.by_setpos.is_empty() {
                occs = apply_setpos(&occs, &self.by_setpos);
            }
            for local in occs {
                if self.beyond_until(local, tz) {
                    return None;
                }
                let mapped = match tz.from_local_datetime(&local) {
                    LocalResult::Single(x) => x,
                    LocalResult::Ambiguous(earliest, _) => earliest,
                    LocalResult::None => continue, // DST gap
                };
                let utc = mapped.with_timezone(&Utc);
                if utc > after {
                    return Some(utc);
                }
            }
            period += interval;
        }
        None
    }

    /// Index of the period containing `naive`, counted from the epoch.
    fn period_index(&self, naive: NaiveDateTime) -> i64 {
        match self.freq {
            Freq::Minutely => (naive - NaiveDateTime::default()).num_minutes(),
            Freq::Hourly => (naive - NaiveDateTime::default()).num_hours(),
            Freq::Daily => (naive.date() - NaiveDate::default()).num_days(),
            Freq::Weekly => (naive.date() - epoch_monday()).num_days().div_euclid(7),
            Freq::Monthly => {
                i64::from(naive.date().year() - 1970) * 12 + i64::from(naive.date().month0())
            }
            Freq::Yearly => i64::from(naive.date().year() - 1970),
        }
    }

    /// Aligned periods examined before giving up (about a year of periods,
    /// ten years for yearly rules).
    fn max_scan(&self) -> u32 {
        match self.freq {
            Freq::Minutely => 527_040,
            Freq::Hourly => 8_784,
            Freq::Daily => 366,
            Freq::Weekly => 54,
            Freq::Monthly => 12,
            Freq::Yearly => 10,
        }
    }

    /// All candidate local datetimes within one period, ascending, before
    /// BYSETPOS selection.
    fn occurrences_in_period(&self, period: i64) -> Vec<NaiveDateTime> {
        match self.freq {
            Freq::Minutely => {
                let start = NaiveDateTime::default() + Duration::minutes(period);
                if !self.date_matches(start.date())
                    || (!self.by_hour.is_empty() && !self.by_hour.contains(&start.hour()))
                    || (!self.by_minute.is_empty() && !self.by_minute.contains(&start.minute()))
                {
                    return Vec::new();
                }
                start.with_second(self.second).into_iter().collect()
            }
            Freq::Hourly => {
                let start = NaiveDateTime::default() + Duration::hours(period);
                if !self.date_matches(start.date())
                    || (!self.by_hour.is_empty() && !self.by_hour.contains(&start.hour()))
                {
                    return Vec::new();
                }
                self.by_minute
                    .iter()
                    .filter_map(|&m| {
                        start.with_minute(m).and_then(|dt| dt.with_second(self.second))
                    })
                    .collect()
            }
            Freq::Daily => {
                let date = NaiveDate::default() + Duration::days(period);
                if !self.date_matches(date) {
                    return Vec::new();
                }
                self.times_on(date)
            }
            Freq::Weekly => {
                let monday = epoch_monday() + Duration::weeks(period);
                let mut out = Vec::new();
                for offset in 0..7 {
                    let date = monday + Duration::days(offset);
                    if self.date_matches(date) {
                        out.extend(self.times_on(date));
                    }
                }
                out
            }
            Freq::Monthly => {
                let year = 1970 + period.div_euclid(12) as i32;
                let month = period.rem_euclid(12) as u32 + 1;
                let mut out = Vec::new();
                for day in 1..=days_in_month(year, month) {
                    if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
                        if self.date_matches(date) {
                            out.extend(self.times_on(date));
                        }
                    }
                }
                out
            }
            Freq::Yearly => {
                let year = 1970 + period as i32;
                let mut out = Vec::new();
                for month in 1..=12 {
                    for day in 1..=days_in_month(year, month) {
                        if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
                            if self.date_matches(date) {
                                out.extend(self.times_on(date));
                            }
                        }
                    }
                }
                out
            }
        }
    }

    fn times_on(&self, date: NaiveDate) -> Vec<NaiveDateTime> {
        let mut out = Vec::new();
        for &h in &self.by_hour {
            for &m in &self.by_minute {
                if let Some(dt) = date.and_hms_opt(h, m, self.second) {
                    out.push(dt);
                }
            }
        }
        out
    }

    fn date_matches(&self, date: NaiveDate) -> bool {
        if !self.by_month.is_empty() && !self.by_month.contains(&date.month()) {
            return false;
        }
        if !self.by_monthday.is_empty() {
            let last = days_in_month(date.year(), date.month()) as i32;
            let day = date.day() as i32;
            if !self
                .by_monthday
                .iter()
                .any(|&d| if d > 0 { day == d } else { day == last + 1 + d })
            {
                return false;
            }
        }
        if !self.by_day.is_empty() {
            let matched = self.by_day.iter().any(|bd| {
                if date.weekday() != bd.weekday {
                    return false;
                }
                match bd.ord {
                    None => true,
                    Some(n) if n > 0 => ((date.day() - 1) / 7 + 1) as i32 == n,
                    Some(n) => {
                        let last = days_in_month(date.year(), date.month());
                        ((last - date.day()) / 7 + 1) as i32 == -n
                    }
                }
            });
            if !matched {
                return false;
            }
        }
        true
    }

    fn beyond_until(&self, local: NaiveDateTime, tz: Tz) -> bool {
        match self.until {
            None => false,
            Some(Until::Local(u)) => local > u,
            Some(Until::Utc(u)) => match tz.from_local_datetime(&local) {
                LocalResult::Single(x) | LocalResult::Ambiguous(x, _) => {
                    x.with_timezone(&Utc) > u
                }
                LocalResult::None => false,
            },
        }
    }
}

/// 1-based positive / negative-from-end selection into the occurrence list.
fn apply_setpos(occs: &[NaiveDateTime], positions: &[i32]) -> Vec<NaiveDateTime> {
    let mut out = Vec::new();
    let len = occs.len() as i32;
    for &p in positions {
        let idx = if p > 0 { p - 1 } else { len + p };
        if (0..len).contains(&idx) {
            out.push(occs[idx as usize]);
        }
    }
    out.sort_unstable();
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::UTC;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn freq_required() {
        assert!(parse_rrule("INTERVAL=2", "j").is_err());
    }

    #[test]
    fn count_is_rejected() {
        assert!(matches!(
            parse_rrule("FREQ=DAILY;COUNT=3", "j"),
            Err(ScheduleError::UnsupportedRule(_))
        ));
    }

    #[test]
    fn unknown_component_rejected() {
        assert!(parse_rrule("FREQ=DAILY;FOO=1", "j").is_err());
    }

    #[test]
    fn ordinal_byday_needs_monthly_or_yearly() {
        assert!(parse_rrule("FREQ=WEEKLY;BYDAY=1MO", "j").is_err());
        assert!(parse_rrule("FREQ=MONTHLY;BYDAY=1MO", "j").is_ok());
    }

    #[test]
    fn daily_at_fixed_time() {
        let rule = parse_rrule("FREQ=DAILY;BYHOUR=9;BYMINUTE=30", "j").unwrap();
        let next = rule.next_fire(utc(2024, 6, 15, 10, 0, 0), UTC).unwrap();
        assert_eq!(next.day(), 16);
        assert_eq!(next.hour(), 9);
        assert_eq!(next.minute(), 30);
        let following = rule.next_fire(next, UTC).unwrap();
        assert_eq!((following - next).num_seconds(), 86_400);
    }

    #[test]
    fn hash_filled_daily_is_stable() {
        let after = utc(2024, 6, 15, 0, 0, 0);
        let a = parse_rrule("FREQ=DAILY", "backup").unwrap();
        let b = parse_rrule("FREQ=DAILY", "backup").unwrap();
        assert_eq!(a.next_fire(after, UTC), b.next_fire(after, UTC));
        let first = a.next_fire(after, UTC).unwrap();
        let second = a.next_fire(first, UTC).unwrap();
        assert_eq!((second - first).num_seconds(), 86_400);
    }

    #[test]
    fn interval_daily_alignment() {
        let rule = parse_rrule("FREQ=DAILY;INTERVAL=3;BYHOUR=0;BYMINUTE=0", "j").unwrap();
        let t0 = rule.next_fire(utc(2024, 6, 15, 0, 0, 0), UTC).unwrap();
        let t1 = rule.next_fire(t0, UTC).unwrap();
        assert_eq!((t1 - t0).num_hours(), 72);
    }

    #[test]
    fn hourly_interval() {
        let rule = parse_rrule("FREQ=HOURLY;INTERVAL=6;BYMINUTE=0", "j").unwrap();
        let t0 = rule.next_fire(utc(2024, 6, 15, 1, 2, 3), UTC).unwrap();
        let t1 = rule.next_fire(t0, UTC).unwrap();
        assert_eq!((t1 - t0).num_hours(), 6);
    }

    #[test]
    fn minutely_fires_every_minute() {
        let rule = parse_rrule("FREQ=MINUTELY", "j").unwrap();
        let t0 = rule.next_fire(utc(2024, 6, 15, 10, 0, 0), UTC).unwrap();
        let t1 = rule.next_fire(t0, UTC).unwrap();
        assert_eq!((t1 - t0).num_seconds(), 60);
    }

    #[test]
    fn weekly_byday() {
        let rule = parse_rrule("FREQ=WEEKLY;BYDAY=MO;BYHOUR=9;BYMINUTE=0", "j").unwrap();
        let next = rule.next_fire(utc(2024, 6, 15, 0, 0, 0), UTC).unwrap();
        // 2024-06-15 is a Saturday; next Monday is the 17th.
        assert_eq!(next.weekday(), Weekday::Mon);
        assert_eq!(next.day(), 17);
        assert_eq!(next.hour(), 9);
    }

    #[test]
    fn monthly_second_tuesday() {
        let rule = parse_rrule("FREQ=MONTHLY;BYDAY=2TU;BYHOUR=8;BYMINUTE=0", "j").unwrap();
        let next = rule.next_fire(utc(2024, 6, 1, 0, 0, 0), UTC).unwrap();
        assert_eq!(next.day(), 11);
        assert_eq!(next.month(), 6);
        assert_eq!(next.hour(), 8);
    }

    #[test]
    fn monthly_last_weekday_via_setpos() {
        let rule = parse_rrule(
            "FREQ=MONTHLY;BYDAY=MO,TU,WE,TH,FR;BYSETPOS=-1;BYHOUR=12;BYMINUTE=0",
            "j",
        )
        .unwrap();
        let next = rule.next_fire(utc(2024, 6, 1, 0, 0, 0), UTC).unwrap();
        // Last weekday of June 2024 is Friday the 28th.
        assert_eq!(next.day(), 28);
        assert_eq!(next.month(), 6);
    }

    #[test]
    fn monthly_negative_monthday() {
        let rule = parse_rrule("FREQ=MONTHLY;BYMONTHDAY=-1;BYHOUR=0;BYMINUTE=0", "j").unwrap();
        let next = rule.next_fire(utc(2024, 6, 1, 0, 0, 0), UTC).unwrap();
        assert_eq!(next.day(), 30); // June has 30 days
        let next = rule.next_fire(utc(2024, 2, 1, 0, 0, 0), UTC).unwrap();
        assert_eq!(next.day(), 29); // leap February
    }

    #[test]
    fn until_terminates_the_rule() {
        let rule =
            parse_rrule("FREQ=DAILY;BYHOUR=0;BYMINUTE=0;UNTIL=20240610T000000Z", "j").unwrap();
        assert!(rule.next_fire(utc(2024, 6, 15, 0, 0, 0), UTC).is_none());
        let next = rule.next_fire(utc(2024, 6, 8, 12, 0, 0), UTC).unwrap();
        assert_eq!(next.day(), 9);
    }

    #[test]
    fn until_date_only_includes_whole_day() {
        let rule = parse_rrule("FREQ=DAILY;BYHOUR=23;BYMINUTE=0;UNTIL=20240610", "j").unwrap();
        let next = rule.next_fire(utc(2024, 6, 10, 0, 0, 0), UTC).unwrap();
        assert_eq!(next.day(), 10);
        assert!(rule.next_fire(next, UTC).is_none());
    }

    #[test]
    fn yearly_hash_fill_is_stable() {
        let rule = parse_rrule("FREQ=YEARLY", "annual-report").unwrap();
        let t0 = rule.next_fire(utc(2024, 1, 1, 0, 0, 0), UTC).unwrap();
        let t1 = rule.next_fire(t0, UTC).unwrap();
        assert_eq!(t1.month(), t0.month());
        assert_eq!(t1.day(), t0.day());
        assert_eq!(t1.year(), t0.year() + 1);
    }
}
