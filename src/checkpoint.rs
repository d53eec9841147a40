//! Per-worker checkpoint store with atomic publish.
//!
//! Layout under `<checkpoint_root>/<job_id>/worker_<rank>/`:
//!
//! ```text
//! LATEST                      <- basename of the newest committed directory
//! step_<N>/state.json         <- WorkerState
//! step_<N>/manifest.json      <- Manifest { step, timestamp, .. committed: true }
//! ```
//!
//! Commit builds a uniquely named temp directory beside the target, writes
//! both files, fsyncs the state file, renames the directory into place, and
//! only then overwrites `LATEST`. Previously published step directories are
//! never unlinked, so `LATEST` always names a directory that exists.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Checkpointable progress of one worker.
///
/// `(shard_idx, line_idx)` names the *next* line to consume: everything
/// strictly before that position is committed, so replay after a crash
/// resumes at the first uncommitted sample.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct WorkerState {
    pub step: u64,
    pub rank: u32,
    pub world_size: u32,
    pub shard_idx: u32,
    pub line_idx: u64,
    /// Opaque model snapshot; only the step model interprets it.
    pub model_state: Option<serde_json::Value>,
}

impl Default for WorkerState {
    fn default() -> Self {
        WorkerState {
            step: 0,
            rank: 0,
            world_size: 1,
            shard_idx: 0,
            line_idx: 0,
            model_state: None,
        }
    }
}

impl WorkerState {
    pub fn initial(rank: u32, world_size: u32) -> Self {
        WorkerState {
            rank,
            world_size,
            ..WorkerState::default()
        }
    }
}

/// Sidecar metadata of a committed checkpoint.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Manifest {
    pub step: u64,
    /// Epoch seconds at commit time.
    pub timestamp: u64,
    pub rank: u32,
    pub world_size: u32,
    pub committed: bool,
}

/// Handle to one `(job, rank)` checkpoint directory. Single-writer: only the
/// owning worker commits; only that worker reads, at load time.
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(checkpoint_root: &Path, job_id: &str, rank: u32) -> Self {
        CheckpointStore {
            dir: checkpoint_root.join(job_id).join(format!("worker_{rank}")),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn latest_path(&self) -> PathBuf {
        self.dir.join("LATEST")
    }

    /// Load the latest committed state, or the initial state when no
    /// checkpoint has been published yet.
    ///
    /// A `LATEST` pointing at a missing directory is a hard error: the worker
    /// exits non-zero and the coordinator restarts it.
    pub fn load_latest(&self, rank: u32, world_size: u32) -> Result<WorkerState> {
        let latest = self.latest_path();
        let base = match std::fs::read_to_string(&latest) {
            Ok(s) => s.trim().to_string(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(WorkerState::initial(rank, world_size));
            }
            Err(e) => return Err(e).with_context(|| format!("read {}", latest.display())),
        };

        let state_path = self.dir.join(&base).join("state.json");
        if !state_path.exists() {
            bail!("LATEST points to missing checkpoint: {base}");
        }

        let raw = std::fs::read(&state_path)
            .with_context(|| format!("read {}", state_path.display()))?;
        let mut state: WorkerState = serde_json::from_slice(&raw)
            .with_context(|| format!("parse {}", state_path.display()))?;

        // The directory is per-rank; the running process is authoritative for
        // identity fields regardless of what an older checkpoint recorded.
        state.rank = rank;
        state.world_size = world_size;
        Ok(state)
    }

    /// Atomically publish `state` as `step_<N>` and repoint `LATEST`.
    ///
    /// Re-committing an already published step is idempotent: the temp
    /// directory is discarded and `LATEST` is refreshed.
    pub fn commit(&self, state: &WorkerState) -> Result<()> {
        let step = state.step;
        let final_name = format!("step_{step}");
        let final_dir = self.dir.join(&final_name);
        let tmp_dir = self.dir.join(format!(
            "step_{step}_tmp_{}_{}",
            now_millis(),
            std::process::id()
        ));

        std::fs::create_dir_all(&tmp_dir)
            .with_context(|| format!("create {}", tmp_dir.display()))?;

        let state_path = tmp_dir.join("state.json");
        std::fs::write(&state_path, serde_json::to_vec(state)?)
            .with_context(|| format!("write {}", state_path.display()))?;

        let manifest = Manifest {
            step,
            timestamp: now_secs(),
            rank: state.rank,
            world_size: state.world_size,
            committed: true,
        };
        let manifest_path = tmp_dir.join("manifest.json");
        std::fs::write(&manifest_path, serde_json::to_vec(&manifest)?)
            .with_context(|| format!("write {}", manifest_path.display()))?;

        // Durability is best effort; the rename below is the commit point.
        if let Ok(f) = std::fs::File::open(&state_path) {
            let _ = f.sync_all();
        }

        if let Err(e) = std::fs::rename(&tmp_dir, &final_dir) {
            if final_dir.exists() {
                // Already published (idempotent re-commit); drop the temp.
                let _ = std::fs::remove_dir_all(&tmp_dir);
            } else {
                return Err(e).with_context(|| {
                    format!("rename {} -> {}", tmp_dir.display(), final_dir.display())
                });
            }
        }

        std::fs::write(self.latest_path(), &final_name)
            .with_context(|| format!("write {}", self.latest_path().display()))?;
        Ok(())
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn now_millis() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(tmp: &tempfile::TempDir) -> CheckpointStore {
        CheckpointStore::new(tmp.path(), "job-test0000", 0)
    }

    #[test]
    fn load_without_latest_returns_initial() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(&tmp);
        let state = s.load_latest(2, 4).unwrap();
        assert_eq!(state.step, 0);
        assert_eq!(state.rank, 2);
        assert_eq!(state.world_size, 4);
        assert_eq!(state.shard_idx, 0);
        assert_eq!(state.line_idx, 0);
        assert!(state.model_state.is_none());
    }

    #[test]
    fn commit_then_load_roundtrips() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(&tmp);

        let state = WorkerState {
            step: 5,
            rank: 0,
            world_size: 1,
            shard_idx: 0,
            line_idx: 5,
            model_state: Some(serde_json::json!({"w": [0.25, -0.5]})),
        };
        s.commit(&state).unwrap();

        let back = s.load_latest(0, 1).unwrap();
        assert_eq!(back, state);

        let latest = std::fs::read_to_string(s.dir().join("LATEST")).unwrap();
        assert_eq!(latest.trim(), "step_5");
    }

    #[test]
    fn manifest_is_committed() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(&tmp);
        s.commit(&WorkerState {
            step: 10,
            ..WorkerState::initial(0, 1)
        })
        .unwrap();

        let raw = std::fs::read(s.dir().join("step_10").join("manifest.json")).unwrap();
        let m: Manifest = serde_json::from_slice(&raw).unwrap();
        assert!(m.committed);
        assert_eq!(m.step, 10);
        assert_eq!(m.world_size, 1);
    }

    #[test]
    fn recommit_same_step_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(&tmp);

        let mut state = WorkerState::initial(0, 1);
        state.step = 5;
        state.line_idx = 5;
        s.commit(&state).unwrap();
        s.commit(&state).unwrap();

        // No stray temp directories survive a re-commit.
        let leftovers: Vec<_> = std::fs::read_dir(s.dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("_tmp_"))
            .collect();
        assert!(leftovers.is_empty());
        assert_eq!(s.load_latest(0, 1).unwrap().step, 5);
    }

    #[test]
    fn latest_tracks_newest_commit() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(&tmp);

        let mut state = WorkerState::initial(0, 1);
        state.step = 5;
        s.commit(&state).unwrap();
        state.step = 10;
        state.line_idx = 10;
        s.commit(&state).unwrap();

        assert_eq!(s.load_latest(0, 1).unwrap().step, 10);
        // Older checkpoints are retained.
        assert!(s.dir().join("step_5").join("state.json").exists());
    }

    #[test]
    fn latest_to_missing_dir_is_hard_error() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(&tmp);
        std::fs::create_dir_all(s.dir()).unwrap();
        std::fs::write(s.dir().join("LATEST"), "step_99").unwrap();

        let err = s.load_latest(0, 1).unwrap_err();
        assert!(err.to_string().contains("missing checkpoint"));
    }

    #[test]
    fn missing_fields_fill_with_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(&tmp);
        let dir = s.dir().join("step_3");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("state.json"), br#"{"step": 3}"#).unwrap();
        std::fs::write(s.dir().join("LATEST"), "step_3").unwrap();

        let state = s.load_latest(1, 2).unwrap();
        assert_eq!(state.step, 3);
        assert_eq!(state.rank, 1);
        assert_eq!(state.world_size, 2);
        assert_eq!(state.shard_idx, 0);
        assert_eq!(state.line_idx, 0);
        assert!(state.model_state.is_none());
    }
}
