//! Worker process: walks its assigned shards line by line, one step per
//! line, checkpointing every `checkpoint_every` steps.
//!
//! The worker's stdout is the job log file (inherited from the coordinator),
//! so progress lines are plain `println!` output, not tracing events.

use anyhow::{Context, Result};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::checkpoint::{CheckpointStore, WorkerState};
use crate::model::{FakeModel, FakeOptimizer, train_step};
use crate::shards::{LocalShardStore, ShardStore};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);
const TRAIN_BATCH_SIZE: usize = 32;

/// Worker configuration, taken from the environment the coordinator sets.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub job_id: String,
    pub rank: u32,
    pub world_size: u32,
    pub checkpoint_root: PathBuf,
    pub checkpoint_every: u64,
    pub step_interval_sec: f64,
    pub dataset_root: PathBuf,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        Ok(WorkerConfig {
            job_id: env_or("JOB_ID", "demo-job"),
            rank: env_parsed("RANK", 0)?,
            world_size: env_parsed("WORLD_SIZE", 1)?,
            checkpoint_root: PathBuf::from(env_or("CHECKPOINT_DIR", "./checkpoints")),
            checkpoint_every: env_parsed("CHECKPOINT_EVERY", 5)?,
            step_interval_sec: env_parsed("SLEEP_SEC", 0.5)?,
            dataset_root: PathBuf::from(env_or("DATASET_DIR", "./data/shards")),
        })
    }
}

pub(crate) fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

pub(crate) fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v
            .parse()
            .with_context(|| format!("invalid value for {key}: {v}")),
        _ => Ok(default),
    }
}

/// Clamp a resume position into the bounds of the current assignment.
/// `shard_idx` past the end snaps to the last shard; `line_idx` is already
/// unsigned so only the shard index needs attention.
fn clamp_resume(state: &mut WorkerState, shard_count: usize) {
    if shard_count > 0 && state.shard_idx as usize >= shard_count {
        state.shard_idx = (shard_count - 1) as u32;
    }
}

/// Run the worker to completion of all assigned shards.
///
/// Exit 0 (an `Ok` return) means every assigned shard is exhausted. Any step
/// or I/O error propagates as a non-zero exit; the coordinator restarts us
/// and the resume protocol picks up at the first uncommitted line.
pub fn run(cfg: &WorkerConfig) -> Result<()> {
    let store = CheckpointStore::new(&cfg.checkpoint_root, &cfg.job_id, cfg.rank);
    std::fs::create_dir_all(store.dir())
        .with_context(|| format!("create worker dir {}", store.dir().display()))?;

    spawn_heartbeat(store.dir().join("HEARTBEAT"), cfg.rank);

    let mut state = store.load_latest(cfg.rank, cfg.world_size)?;
    let rank = cfg.rank;
    println!("[worker {rank}] starting from step {}", state.step);

    let shard_store = LocalShardStore::new(&cfg.dataset_root);
    let shards = shard_store.assigned(cfg.rank, cfg.world_size)?;
    let names: Vec<&str> = shards.iter().map(|s| s.name.as_str()).collect();
    println!("[worker {rank}] assigned {} shard(s): {names:?}", shards.len());

    if shards.is_empty() {
        println!("[worker {rank}] no shards assigned. Exiting.");
        return Ok(());
    }

    let mut model = FakeModel::new();
    let mut optimizer = FakeOptimizer::new(0.001);
    if let Some(snap) = &state.model_state {
        println!("[worker {rank}] loading model state from checkpoint");
        model.restore(&mut optimizer, snap)?;
        println!(
            "[worker {rank}] model loaded with {} loss history entries",
            model.loss_history_len()
        );
    }

    clamp_resume(&mut state, shards.len());
    println!(
        "[worker {rank}] resuming at shard_idx={} line_idx={} step={}",
        state.shard_idx, state.line_idx, state.step
    );

    let sleep = Duration::from_secs_f64(cfg.step_interval_sec);
    for si in (state.shard_idx as usize)..shards.len() {
        if si != state.shard_idx as usize {
            state.line_idx = 0;
        }
        let start_line = state.line_idx as usize;

        let reader = shard_store.open(&shards[si])?;
        for line in reader.lines().skip(start_line) {
            let line = line.with_context(|| format!("read shard {}", shards[si].name))?;

            if !sleep.is_zero() {
                std::thread::sleep(sleep);
            }

            state.step += 1;
            state.shard_idx = si as u32;
            state.line_idx += 1;

            let sample = line.trim();
            let loss = train_step(&mut model, &mut optimizer, TRAIN_BATCH_SIZE);
            println!(
                "[worker {rank}] step {} | loss {loss:.4} | {sample} | (si={} li={})",
                state.step, state.shard_idx, state.line_idx
            );

            if state.step % cfg.checkpoint_every == 0 {
                state.model_state = Some(model.snapshot(&optimizer)?);
                println!(
                    "[worker {rank}] checkpointing at step {} (loss: {loss:.4})",
                    state.step
                );
                store.commit(&state)?;
            }
        }
    }

    println!("[worker {rank}] finished all assigned shards. Exiting.");
    Ok(())
}

/// Periodically rewrite the HEARTBEAT file. The first beat is written
/// synchronously so even a short-lived worker leaves one behind; the rest
/// come from a detached thread. Purely informational; nothing in the
/// supervisor reads it.
fn spawn_heartbeat(path: PathBuf, rank: u32) {
    write_heartbeat(&path, rank);
    std::thread::spawn(move || {
        loop {
            std::thread::sleep(HEARTBEAT_INTERVAL);
            write_heartbeat(&path, rank);
        }
    });
}

fn write_heartbeat(path: &Path, rank: u32) {
    let beat = serde_json::json!({
        "timestamp": std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
        "rank": rank,
        "pid": std::process::id(),
    });
    let _ = std::fs::write(path, beat.to_string());
}
