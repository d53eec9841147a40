//! Job index and log-root management.
//!
//! Resolution order for the log root:
//!   1. `--log-root` CLI flag
//!   2. `SHARDSUP_LOG_DIR` environment variable
//!   3. `$XDG_DATA_HOME/shardsup/logs`
//!   4. `~/.local/share/shardsup/logs`
//!
//! The index is a single `index.json` under the log root, mapping
//! `job_id -> JobIndexEntry`. It is always rewritten as a whole; the
//! JobManager serializes every read-modify-write under one mutex, so the
//! file never sees partial updates.

use anyhow::{Context, Result};
use directories::BaseDirs;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::schema::JobIndexEntry;

/// Error type for "unknown job id", downcast in `main` to emit a
/// `job_not_found` error response.
#[derive(Debug)]
pub struct JobNotFound {
    pub job_id: String,
}

impl std::fmt::Display for JobNotFound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job not found: {}", self.job_id)
    }
}

impl std::error::Error for JobNotFound {}

/// Resolve the log root directory following the priority chain.
pub fn resolve_log_root(cli_root: Option<&str>) -> PathBuf {
    // 1. CLI flag
    if let Some(root) = cli_root {
        return PathBuf::from(root);
    }

    // 2. Environment variable
    if let Ok(root) = std::env::var("SHARDSUP_LOG_DIR")
        && !root.is_empty()
    {
        return PathBuf::from(root);
    }

    // 3. XDG_DATA_HOME
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME")
        && !xdg.is_empty()
    {
        return PathBuf::from(xdg).join("shardsup").join("logs");
    }

    // 4. Default: ~/.local/share/shardsup/logs
    if let Some(base_dirs) = BaseDirs::new() {
        #[cfg(windows)]
        let base = base_dirs.data_local_dir().to_path_buf();
        #[cfg(not(windows))]
        let base = base_dirs.home_dir().join(".local").join("share");
        return base.join("shardsup").join("logs");
    }

    // Fallback if directories crate returns None
    PathBuf::from("~/.local/share/shardsup/logs")
}

/// Path of the index file under a log root.
pub fn index_path(log_root: &Path) -> PathBuf {
    log_root.join("index.json")
}

/// Path of a job's append-only log file under a log root.
pub fn log_path(log_root: &Path, job_id: &str) -> PathBuf {
    log_root.join(format!("{job_id}.log"))
}

/// Load the whole index. A missing file is an empty index.
pub fn load(log_root: &Path) -> Result<BTreeMap<String, JobIndexEntry>> {
    let path = index_path(log_root);
    let raw = match std::fs::read(&path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(e).with_context(|| format!("read index {}", path.display())),
    };
    serde_json::from_slice(&raw).with_context(|| format!("parse index {}", path.display()))
}

/// Rewrite the whole index.
pub fn store(log_root: &Path, jobs: &BTreeMap<String, JobIndexEntry>) -> Result<()> {
    std::fs::create_dir_all(log_root)
        .with_context(|| format!("create log root {}", log_root.display()))?;
    let path = index_path(log_root);
    let contents = serde_json::to_string_pretty(jobs)?;
    std::fs::write(&path, contents).with_context(|| format!("write index {}", path.display()))?;
    Ok(())
}
