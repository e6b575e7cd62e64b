//! On-disk spool for completed runs that could not be committed.
//!
//! When the store rejects a finalize even after retries, the run is written
//! to `<data_dir>/spool/<run_id>.json`. Entries are replayed into the store
//! on the next startup, before orphan cleanout, and deleted once committed.

use std::path::{Path, PathBuf};

use cadenza_domain::error::Result;
use cadenza_domain::run::Run;

use crate::RunStore;

/// Persist a finished run that the store refused.
pub fn spool_run(spool_dir: &Path, run: &Run) -> Result<PathBuf> {
    std::fs::create_dir_all(spool_dir)?;
    let path = spool_dir.join(format!("{}.json", run.run_id));
    std::fs::write(&path, serde_json::to_vec_pretty(run)?)?;
    Ok(path)
}

/// Replay every spool entry into the store, deleting entries that commit.
/// Unreadable entries are left in place and logged.
pub fn replay(spool_dir: &Path, store: &dyn RunStore) -> Result<usize> {
    if !spool_dir.exists() {
        return Ok(0);
    }
    let mut replayed = 0;
    for entry in std::fs::read_dir(spool_dir)? {
        let path = entry?.path();
        if path.extension().map(|e| e == "json") != Some(true) {
            continue;
        }
        let run: Run = match std::fs::read_to_string(&path)
            .map_err(cadenza_domain::error::Error::Io)
            .and_then(|text| Ok(serde_json::from_str(&text)?))
        {
            Ok(run) => run,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unreadable spool entry, leaving in place");
                continue;
            }
        };
        store.finalize(&run)?;
        std::fs::remove_file(&path)?;
        replayed += 1;
    }
    Ok(replayed)
}
