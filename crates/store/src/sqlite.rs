//! SQLite-backed run store.
//!
//! A single [`rusqlite::Connection`] behind a mutex keeps the store
//! `Send + Sync` while honoring sqlite's single-writer requirement. The
//! schema is created on open so tests and fresh data dirs need no
//! migration step. Timestamps are stored as RFC 3339 text in UTC, which
//! sorts chronologically.

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use cadenza_domain::error::{Error, Result};
use cadenza_domain::run::{Run, TriggerType};

use crate::RunStore;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    job_name TEXT NOT NULL,
    run_id TEXT PRIMARY KEY NOT NULL,
    schedule_time TEXT NOT NULL,
    start_time TEXT NOT NULL,
    stop_time TEXT NOT NULL,
    exit_code INTEGER NOT NULL,
    trigger_type TEXT NOT NULL,
    trigger_data TEXT NOT NULL,
    concurrency_group TEXT
);

CREATE INDEX IF NOT EXISTS idx_runs_job_stop ON runs (job_name, stop_time);

CREATE TABLE IF NOT EXISTS runs_running (
    job_name TEXT NOT NULL,
    run_id TEXT PRIMARY KEY NOT NULL,
    schedule_time TEXT NOT NULL,
    start_time TEXT,
    trigger_type TEXT NOT NULL,
    trigger_data TEXT NOT NULL,
    concurrency_group TEXT
);
"#;

const COMPLETED_COLUMNS: &str = "job_name, run_id, schedule_time, start_time, stop_time, \
                                 exit_code, trigger_type, trigger_data, concurrency_group";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(store_err)?;
        conn.execute_batch(SCHEMA_SQL).map_err(store_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Ephemeral store, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(store_err)?;
        conn.execute_batch(SCHEMA_SQL).map_err(store_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn store_err(e: rusqlite::Error) -> Error {
    Error::Store(e.to_string())
}

fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339()
}

fn parse_ts(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(conv_err)
}

fn conv_err<E: std::error::Error + Send + Sync + 'static>(e: E) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
}

fn parse_trigger_type(s: &str) -> rusqlite::Result<TriggerType> {
    match s {
        "schedule" => Ok(TriggerType::Schedule),
        "file" => Ok(TriggerType::File),
        other => Err(conv_err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unknown trigger type `{other}`"),
        ))),
    }
}

fn completed_row(row: &Row<'_>) -> rusqlite::Result<Run> {
    Ok(Run {
        job_name: row.get::<_, String>(0)?,
        run_id: Uuid::parse_str(&row.get::<_, String>(1)?).map_err(conv_err)?,
        schedule_time: parse_ts(&row.get::<_, String>(2)?)?,
        start_time: Some(parse_ts(&row.get::<_, String>(3)?)?),
        stop_time: Some(parse_ts(&row.get::<_, String>(4)?)?),
        exit_code: Some(row.get::<_, i32>(5)?),
        trigger_type: parse_trigger_type(&row.get::<_, String>(6)?)?,
        trigger_data: serde_json::from_str(&row.get::<_, String>(7)?).map_err(conv_err)?,
        concurrency_group: row.get::<_, Option<String>>(8)?,
        respawn: false,
    })
}

fn running_row(row: &Row<'_>) -> rusqlite::Result<Run> {
    Ok(Run {
        job_name: row.get::<_, String>(0)?,
        run_id: Uuid::parse_str(&row.get::<_, String>(1)?).map_err(conv_err)?,
        schedule_time: parse_ts(&row.get::<_, String>(2)?)?,
        start_time: match row.get::<_, Option<String>>(3)? {
            Some(s) => Some(parse_ts(&s)?),
            None => None,
        },
        stop_time: None,
        exit_code: None,
        trigger_type: parse_trigger_type(&row.get::<_, String>(4)?)?,
        trigger_data: serde_json::from_str(&row.get::<_, String>(5)?).map_err(conv_err)?,
        concurrency_group: row.get::<_, Option<String>>(6)?,
        respawn: false,
    })
}

impl RunStore for SqliteStore {
    fn insert_running(&self, run: &Run) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO runs_running (job_name, run_id, schedule_time, start_time, \
             trigger_type, trigger_data, concurrency_group) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run.job_name,
                run.run_id.to_string(),
                ts(&run.schedule_time),
                run.start_time.as_ref().map(ts),
                run.trigger_type.as_str(),
                run.trigger_data.to_string(),
                run.concurrency_group,
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    fn finalize(&self, run: &Run) -> Result<()> {
        let missing =
            |what: &str| Error::Store(format!("run {} finalized without {what}", run.run_id));
        let start = run.start_time.ok_or_else(|| missing("start_time"))?;
        let stop = run.stop_time.ok_or_else(|| missing("stop_time"))?;
        let exit_code = run.exit_code.ok_or_else(|| missing("exit_code"))?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(store_err)?;
        tx.execute(
            "INSERT OR REPLACE INTO runs (job_name, run_id, schedule_time, start_time, \
             stop_time, exit_code, trigger_type, trigger_data, concurrency_group) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                run.job_name,
                run.run_id.to_string(),
                ts(&run.schedule_time),
                ts(&start),
                ts(&stop),
                exit_code,
                run.trigger_type.as_str(),
                run.trigger_data.to_string(),
                run.concurrency_group,
            ],
        )
        .map_err(store_err)?;
        tx.execute(
            "DELETE FROM runs_running WHERE run_id = ?1",
            params![run.run_id.to_string()],
        )
        .map_err(store_err)?;
        tx.commit().map_err(store_err)
    }

    fn latest_completed(&self, job_name: &str) -> Result<Option<Run>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "SELECT {COMPLETED_COLUMNS} FROM runs WHERE job_name = ?1 \
                 ORDER BY stop_time DESC LIMIT 1"
            ),
            params![job_name],
            completed_row,
        )
        .optional()
        .map_err(store_err)
    }

    fn latest_completed_with_exit(&self, job_name: &str, zero: bool) -> Result<Option<Run>> {
        let op = if zero { "=" } else { "!=" };
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "SELECT {COMPLETED_COLUMNS} FROM runs \
                 WHERE job_name = ?1 AND exit_code {op} 0 \
                 ORDER BY stop_time DESC LIMIT 1"
            ),
            params![job_name],
            completed_row,
        )
        .optional()
        .map_err(store_err)
    }

    fn list_running(&self) -> Result<Vec<Run>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT job_name, run_id, schedule_time, start_time, trigger_type, \
                 trigger_data, concurrency_group FROM runs_running",
            )
            .map_err(store_err)?;
        let rows = stmt.query_map([], running_row).map_err(store_err)?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.map_err(store_err)?);
        }
        Ok(runs)
    }

    fn finalize_orphans(&self, exit_code: i32) -> Result<Vec<Run>> {
        let now = Utc::now();
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(store_err)?;

        let mut orphans = Vec::new();
        {
            let mut stmt = tx
                .prepare(
                    "SELECT job_name, run_id, schedule_time, start_time, trigger_type, \
                     trigger_data, concurrency_group FROM runs_running",
                )
                .map_err(store_err)?;
            let rows = stmt.query_map([], running_row).map_err(store_err)?;
            for row in rows {
                let mut run = row.map_err(store_err)?;
                // A crashed daemon may have died between spawn and the
                // running insert; fall back to the schedule time.
                let start = run.start_time.unwrap_or(run.schedule_time);
                run.start_time = Some(start);
                run.stop_time = Some(now);
                run.exit_code = Some(exit_code);
                orphans.push(run);
            }
        }

        for run in &orphans {
            tx.execute(
                "INSERT OR REPLACE INTO runs (job_name, run_id, schedule_time, start_time, \
                 stop_time, exit_code, trigger_type, trigger_data, concurrency_group) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    run.job_name,
                    run.run_id.to_string(),
                    ts(&run.schedule_time),
                    run.start_time.as_ref().map(ts),
                    run.stop_time.as_ref().map(ts),
                    run.exit_code,
                    run.trigger_type.as_str(),
                    run.trigger_data.to_string(),
                    run.concurrency_group,
                ],
            )
            .map_err(store_err)?;
        }
        tx.execute("DELETE FROM runs_running", [])
            .map_err(store_err)?;
        tx.commit().map_err(store_err)?;
        Ok(orphans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn finished_run(job: &str, minute: u32, exit_code: i32) -> Run {
        let base = Utc.with_ymd_and_hms(2024, 6, 15, 10, minute, 0).unwrap();
        let mut run = Run::scheduled(job, base);
        run.start_time = Some(base + chrono::Duration::seconds(1));
        run.stop_time = Some(base + chrono::Duration::seconds(5));
        run.exit_code = Some(exit_code);
        run
    }

    #[test]
    fn finalize_moves_between_partitions() {
        let store = SqliteStore::open_in_memory().unwrap();
        let run = finished_run("j", 0, 0);

        let mut running = run.clone();
        running.stop_time = None;
        running.exit_code = None;
        store.insert_running(&running).unwrap();
        assert_eq!(store.list_running().unwrap().len(), 1);
        assert!(store.latest_completed("j").unwrap().is_none());

        store.finalize(&run).unwrap();
        assert!(store.list_running().unwrap().is_empty());
        let fetched = store.latest_completed("j").unwrap().unwrap();
        assert_eq!(fetched.run_id, run.run_id);
        assert_eq!(fetched.exit_code, Some(0));
    }

    #[test]
    fn finalize_preserves_trigger_data() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut run = Run::triggered(
            "j",
            Utc.with_ymd_and_hms(2024, 6, 15, 10, 0, 0).unwrap(),
            json!({"who": "ops", "nested": {"list": [1, 2]}}),
            false,
        );
        let now = Utc::now();
        run.start_time = Some(now);
        run.stop_time = Some(now);
        run.exit_code = Some(3);
        store.finalize(&run).unwrap();

        let fetched = store.latest_completed("j").unwrap().unwrap();
        assert_eq!(fetched.trigger_data, run.trigger_data);
        assert_eq!(fetched.trigger_type, TriggerType::File);
    }

    #[test]
    fn finalize_is_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        let run = finished_run("j", 0, 0);
        store.finalize(&run).unwrap();
        store.finalize(&run).unwrap();
        assert!(store.latest_completed("j").unwrap().is_some());
    }

    #[test]
    fn latest_completed_orders_by_stop_time() {
        let store = SqliteStore::open_in_memory().unwrap();
        let early = finished_run("j", 0, 0);
        let late = finished_run("j", 30, 1);
        store.finalize(&late).unwrap();
        store.finalize(&early).unwrap();
        let fetched = store.latest_completed("j").unwrap().unwrap();
        assert_eq!(fetched.run_id, late.run_id);
    }

    #[test]
    fn latest_completed_with_exit_filters() {
        let store = SqliteStore::open_in_memory().unwrap();
        let good = finished_run("j", 0, 0);
        let bad = finished_run("j", 30, 2);
        store.finalize(&good).unwrap();
        store.finalize(&bad).unwrap();

        let g = store.latest_completed_with_exit("j", true).unwrap().unwrap();
        assert_eq!(g.run_id, good.run_id);
        let b = store.latest_completed_with_exit("j", false).unwrap().unwrap();
        assert_eq!(b.run_id, bad.run_id);
        assert!(store
            .latest_completed_with_exit("other", true)
            .unwrap()
            .is_none());
    }

    #[test]
    fn orphans_are_finalized_with_sentinel() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut running = Run::scheduled("j", Utc::now());
        running.start_time = Some(Utc::now());
        store.insert_running(&running).unwrap();

        let orphans = store.finalize_orphans(crate::ORPHAN_EXIT_CODE).unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].exit_code, Some(crate::ORPHAN_EXIT_CODE));
        assert!(store.list_running().unwrap().is_empty());
        let fetched = store.latest_completed("j").unwrap().unwrap();
        assert_eq!(fetched.exit_code, Some(crate::ORPHAN_EXIT_CODE));
    }
}
