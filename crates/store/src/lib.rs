//! Run persistence: the [`RunStore`] capability trait, the sqlite backend,
//! and the on-disk spool used when finalization fails.

pub mod spool;
mod sqlite;

pub use sqlite::SqliteStore;

use std::sync::Arc;

use cadenza_domain::config::{Config, DatabaseConfig};
use cadenza_domain::error::Result;
use cadenza_domain::run::Run;

/// Sentinel exit code recorded for runs orphaned by a crashed daemon.
/// Cannot collide with a real exit status or a `128 + signum` encoding.
pub const ORPHAN_EXIT_CODE: i32 = -1;

/// Narrow persistence interface. Implementations must keep every run in
/// exactly one of the running/completed partitions.
pub trait RunStore: Send + Sync {
    /// Materialize a run in the running partition.
    fn insert_running(&self, run: &Run) -> Result<()>;

    /// Move a run from the running to the completed partition in one
    /// transaction. Idempotent, so spool replay can retry it.
    fn finalize(&self, run: &Run) -> Result<()>;

    /// Most recent completed run of a job, by stop time.
    fn latest_completed(&self, job_name: &str) -> Result<Option<Run>>;

    /// Most recent completed run with `exit_code == 0` (`zero = true`)
    /// or `exit_code != 0` (`zero = false`).
    fn latest_completed_with_exit(&self, job_name: &str, zero: bool) -> Result<Option<Run>>;

    /// Rows still in the running partition (orphans, at startup).
    fn list_running(&self) -> Result<Vec<Run>>;

    /// Forcibly finalize every running row with the given sentinel exit
    /// code and clear the partition. Returns the runs cleaned out.
    fn finalize_orphans(&self, exit_code: i32) -> Result<Vec<Run>>;
}

/// Open the backend selected by `database.type`.
pub fn open_store(config: &Config) -> Result<Arc<dyn RunStore>> {
    match &config.database {
        DatabaseConfig::Sqlite { .. } => {
            Ok(Arc::new(SqliteStore::open(&config.database_file())?))
        }
    }
}
