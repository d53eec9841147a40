//! Coordinator process: runs exactly one job to a terminal state.
//!
//! Spawns `world_size` workers (the same binary, hidden `_work` subcommand),
//! polls for exits, applies the bounded restart policy, and propagates
//! SIGINT/SIGTERM as a graceful shutdown. Worker stdout/stderr is inherited,
//! so everything lands in the job log file the supervisor opened for us.
//!
//! The completion line printed here is a stable sentinel: a restarted
//! supervisor infers terminal job status from it.

use anyhow::{Context, Result};
use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::{Duration, Instant};

use crate::worker::{env_or, env_parsed};

const GRACEFUL_SHUTDOWN_WINDOW: Duration = Duration::from_secs(3);

/// Coordinator configuration, taken from the environment the supervisor sets.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub job_id: String,
    pub world_size: u32,
    pub checkpoint_root: String,
    pub checkpoint_every: u64,
    pub step_interval_sec: f64,
    pub dataset_root: String,
    pub max_restarts: u32,
    pub restart_backoff_sec: f64,
    pub poll_interval_sec: f64,
}

impl CoordinatorConfig {
    pub fn from_env() -> Result<Self> {
        Ok(CoordinatorConfig {
            job_id: env_or("JOB_ID", "demo-job"),
            world_size: env_parsed("WORLD_SIZE", 1)?,
            checkpoint_root: env_or("CHECKPOINT_DIR", "./checkpoints"),
            checkpoint_every: env_parsed("CHECKPOINT_EVERY", 5)?,
            step_interval_sec: env_parsed("SLEEP_SEC", 0.5)?,
            dataset_root: env_or("DATASET_DIR", "./data/shards"),
            max_restarts: env_parsed("MAX_RESTARTS_PER_WORKER", 50)?,
            restart_backoff_sec: env_parsed("RESTART_BACKOFF_SEC", 0.5)?,
            poll_interval_sec: env_parsed("POLL_INTERVAL_SEC", 0.2)?,
        })
    }
}

/// One tracked worker process.
struct WorkerSlot {
    rank: u32,
    child: Child,
    restarts: u32,
}

/// What the restart policy does with an exited worker.
#[derive(Debug, PartialEq, Eq)]
enum SlotAction {
    Done,
    Restart,
    Dead,
}

fn next_action(exit_code: i32, restarts: u32, max_restarts: u32) -> SlotAction {
    if exit_code == 0 {
        SlotAction::Done
    } else if restarts < max_restarts {
        SlotAction::Restart
    } else {
        SlotAction::Dead
    }
}

// Written by the signal handler, read by the main loop.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);
static SHUTDOWN_SIGNAL: AtomicI32 = AtomicI32::new(0);

#[cfg(unix)]
extern "C" fn on_signal(signum: libc::c_int) {
    SHUTDOWN_SIGNAL.store(signum, Ordering::SeqCst);
    SHUTDOWN.store(true, Ordering::SeqCst);
}

#[cfg(unix)]
fn install_signal_handlers() {
    // SAFETY: the handler only touches lock-free atomics, which is
    // async-signal-safe.
    unsafe {
        libc::signal(libc::SIGINT, on_signal as usize);
        libc::signal(libc::SIGTERM, on_signal as usize);
    }
}

#[cfg(not(unix))]
fn install_signal_handlers() {}

fn spawn_worker(cfg: &CoordinatorConfig, rank: u32) -> Result<Child> {
    let exe = std::env::current_exe().context("resolve current exe")?;
    println!("[coord] starting worker rank={rank} job={}", cfg.job_id);
    Command::new(&exe)
        .arg("_work")
        .env("JOB_ID", &cfg.job_id)
        .env("RANK", rank.to_string())
        .env("WORLD_SIZE", cfg.world_size.to_string())
        .env("CHECKPOINT_DIR", &cfg.checkpoint_root)
        .env("CHECKPOINT_EVERY", cfg.checkpoint_every.to_string())
        .env("SLEEP_SEC", cfg.step_interval_sec.to_string())
        .env("DATASET_DIR", &cfg.dataset_root)
        .spawn()
        .with_context(|| format!("spawn worker rank {rank}"))
}

/// Forward `signum` to every live worker, wait out the graceful window, then
/// force-kill survivors.
#[cfg(unix)]
fn shutdown_workers(slots: &mut Vec<WorkerSlot>, signum: i32) {
    for slot in slots.iter() {
        // SAFETY: kill(2) is safe to call with any pid and valid signal number.
        unsafe {
            libc::kill(slot.child.id() as libc::pid_t, signum);
        }
    }
    let deadline = Instant::now() + GRACEFUL_SHUTDOWN_WINDOW;
    while Instant::now() < deadline {
        slots.retain_mut(|slot| !matches!(slot.child.try_wait(), Ok(Some(_))));
        if slots.is_empty() {
            return;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    for slot in slots.iter_mut() {
        let _ = slot.child.kill();
        let _ = slot.child.wait();
    }
    slots.clear();
}

#[cfg(not(unix))]
fn shutdown_workers(slots: &mut Vec<WorkerSlot>, _signum: i32) {
    for slot in slots.iter_mut() {
        let _ = slot.child.kill();
        let _ = slot.child.wait();
    }
    slots.clear();
}

/// Supervise the job until every worker finishes. Returns the process exit
/// code: 0 when all workers completed (or a graceful stop was requested),
/// 1 when any worker hit the restart cap.
pub fn run(cfg: &CoordinatorConfig) -> Result<i32> {
    install_signal_handlers();

    println!(
        "[coord] starting job {} with {} worker(s)",
        cfg.job_id, cfg.world_size
    );
    println!("[coord] checkpoints: {}", cfg.checkpoint_root);

    let mut slots: Vec<WorkerSlot> = Vec::with_capacity(cfg.world_size as usize);
    for rank in 0..cfg.world_size {
        slots.push(WorkerSlot {
            rank,
            child: spawn_worker(cfg, rank)?,
            restarts: 0,
        });
    }

    let poll = Duration::from_secs_f64(cfg.poll_interval_sec);
    let mut dead_ranks: Vec<u32> = Vec::new();

    while !slots.is_empty() {
        if SHUTDOWN.swap(false, Ordering::SeqCst) {
            let signum = SHUTDOWN_SIGNAL.load(Ordering::SeqCst);
            println!("[coord] received signal {signum}; shutting down workers...");
            shutdown_workers(&mut slots, signum);
            println!("[coord] graceful stop. Job COMPLETED.");
            return Ok(0);
        }

        let mut idx = 0;
        while idx < slots.len() {
            let slot = &mut slots[idx];
            let status = slot
                .child
                .try_wait()
                .with_context(|| format!("poll worker rank {}", slot.rank))?;
            let Some(status) = status else {
                idx += 1;
                continue;
            };

            let code = status.code().unwrap_or(1);
            println!("[coord] worker rank={} exited with code={code}", slot.rank);

            match next_action(code, slot.restarts, cfg.max_restarts) {
                SlotAction::Done => {
                    slots.remove(idx);
                }
                SlotAction::Restart => {
                    let rank = slot.rank;
                    let attempt = slot.restarts + 1;
                    println!(
                        "[coord] restarting worker rank={rank} (attempt {attempt}/{})",
                        cfg.max_restarts
                    );
                    std::thread::sleep(Duration::from_secs_f64(cfg.restart_backoff_sec));
                    let child = spawn_worker(cfg, rank)?;
                    let slot = &mut slots[idx];
                    slot.child = child;
                    slot.restarts = attempt;
                    idx += 1;
                }
                SlotAction::Dead => {
                    println!("[coord] max restarts hit for rank={}", slot.rank);
                    dead_ranks.push(slot.rank);
                    slots.remove(idx);
                }
            }
        }

        std::thread::sleep(poll);
    }

    if dead_ranks.is_empty() {
        println!("all workers DONE. Job COMPLETED.");
        Ok(0)
    } else {
        println!("[coord] exiting with {} dead worker(s): {dead_ranks:?}", dead_ranks.len());
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_policy_decisions() {
        assert_eq!(next_action(0, 0, 50), SlotAction::Done);
        assert_eq!(next_action(0, 50, 50), SlotAction::Done);
        assert_eq!(next_action(1, 0, 50), SlotAction::Restart);
        assert_eq!(next_action(1, 49, 50), SlotAction::Restart);
        assert_eq!(next_action(1, 50, 50), SlotAction::Dead);
        assert_eq!(next_action(137, 2, 2), SlotAction::Dead);
    }
}
