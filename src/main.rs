//! shardsup — entry point
//!
//! All stdout is JSON only (one envelope per line; `stream` emits NDJSON
//! events). Tracing logs go to stderr. The hidden `_coordinate` and `_work`
//! subcommands are the coordinator/worker process entries; their stdout is
//! the job log file, so they print plain lines instead of JSON.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use shardsup::coordinator::{self, CoordinatorConfig};
use shardsup::index::{JobNotFound, resolve_log_root};
use shardsup::manager::{DeleteOpts, InvalidParameter, JobManager, PurgeOpts};
use shardsup::dataset;
use shardsup::schema::{
    ChunkData, CleanupData, DeleteData, DeleteOutcome, ErrorResponse, JobParams, JobStatus,
    ListData, LogsData, MakeDatasetData, Response, StopData, StreamEndData,
};
use shardsup::worker::{self, WorkerConfig};

#[derive(Debug, Parser)]
#[command(name = "shardsup")]
#[command(about = "Supervisor for sharded long-running jobs", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv); logs go to stderr.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a job: spawn a detached coordinator and return JSON immediately.
    Create {
        /// Override the log root directory.
        #[arg(long)]
        log_root: Option<String>,

        /// Number of worker processes.
        #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u32).range(1..=64))]
        world_size: u32,

        /// Checkpoint every N steps.
        #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u64).range(1..=10_000))]
        checkpoint_every: u64,

        /// Seconds each worker sleeps per step (coarse pacing).
        #[arg(long, default_value_t = 0.5)]
        sleep_sec: f64,

        /// Directory holding shard_<NNNNN>.* files.
        #[arg(long, default_value = "./data/shards")]
        dataset_dir: String,

        /// Root directory for per-worker checkpoints.
        #[arg(long, default_value = "./checkpoints")]
        checkpoint_dir: String,

        /// Explicit job id (default: job-<8 hex>).
        #[arg(long)]
        job_id: Option<String>,
    },

    /// Get status of a job.
    Status {
        #[arg(long)]
        log_root: Option<String>,

        /// Job ID.
        job_id: String,
    },

    /// List the status of every known job.
    List {
        #[arg(long)]
        log_root: Option<String>,
    },

    /// Get the last N lines of a job's log.
    Logs {
        #[arg(long)]
        log_root: Option<String>,

        /// Number of tail lines.
        #[arg(long, default_value_t = 200, value_parser = clap::value_parser!(u64).range(1..=5000))]
        tail: u64,

        /// Job ID.
        job_id: String,
    },

    /// Follow a job's log as NDJSON chunk events until it ends.
    Stream {
        #[arg(long)]
        log_root: Option<String>,

        /// Poll interval in milliseconds.
        #[arg(long, default_value_t = 250)]
        poll_ms: u64,

        /// Job ID.
        job_id: String,
    },

    /// Send the graceful stop signal to a job's coordinator.
    Stop {
        #[arg(long)]
        log_root: Option<String>,

        /// Job ID.
        job_id: String,
    },

    /// Delete a job from the index (refused while running unless flagged).
    Delete {
        #[arg(long)]
        log_root: Option<String>,

        /// Also remove the log file and checkpoint tree.
        #[arg(long)]
        delete_logs: bool,

        /// Stop the job first, then delete after a short grace period.
        #[arg(long)]
        stop_first: bool,

        /// Delete even if running (hard kill).
        #[arg(long)]
        force: bool,

        /// Job ID.
        job_id: String,
    },

    /// Delete every job matching the age/status filters.
    Purge {
        #[arg(long)]
        log_root: Option<String>,

        #[arg(long)]
        older_than_hours: Option<u64>,

        #[arg(long)]
        older_than_days: Option<u64>,

        /// Comma-separated status filter, e.g. COMPLETED,FAILED.
        #[arg(long, value_delimiter = ',')]
        statuses: Vec<String>,

        #[arg(long)]
        delete_logs: bool,

        /// Stop matching running jobs instead of skipping them.
        #[arg(long)]
        stop_running: bool,

        #[arg(long)]
        force: bool,
    },

    /// Keep the N most-recently-created jobs, delete the rest.
    Cleanup {
        #[arg(long)]
        log_root: Option<String>,

        /// How many jobs to keep.
        #[arg(long, default_value_t = 20)]
        keep: usize,

        #[arg(long)]
        delete_logs: bool,

        #[arg(long)]
        force: bool,
    },

    /// Generate line-based shard files for demos and tests.
    MakeDataset {
        /// Output directory.
        #[arg(long, default_value = "./data/shards")]
        dir: String,

        /// Number of shard files.
        #[arg(long, default_value_t = 8)]
        shards: u32,

        /// Lines per shard.
        #[arg(long, default_value_t = 50)]
        lines: u64,
    },

    /// [Internal] Coordinator process entry — not for direct use.
    #[command(name = "_coordinate", hide = true)]
    Coordinate,

    /// [Internal] Worker process entry — not for direct use.
    #[command(name = "_work", hide = true)]
    Work,
}

fn main() {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    // Logs always go to stderr so stdout remains JSON-only (for the internal
    // subcommands, stdout is the job log file).
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    // The internal process entries never speak JSON; handle them before the
    // JSON error path.
    match &cli.command {
        Command::Coordinate => {
            std::process::exit(run_coordinator());
        }
        Command::Work => {
            std::process::exit(run_worker());
        }
        _ => {}
    }

    let result = run(cli);
    if let Err(e) = result {
        if e.downcast_ref::<JobNotFound>().is_some() {
            ErrorResponse::new("job_not_found", format!("{e:#}")).print();
        } else if e.downcast_ref::<InvalidParameter>().is_some() {
            ErrorResponse::new("invalid_parameter", format!("{e:#}")).print();
        } else {
            ErrorResponse::new("internal_error", format!("{e:#}")).print();
        }
        std::process::exit(1);
    }
}

fn run_coordinator() -> i32 {
    let cfg = match CoordinatorConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("[coord] fatal: {e:#}");
            return 1;
        }
    };
    match coordinator::run(&cfg) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("[coord] fatal: {e:#}");
            1
        }
    }
}

fn run_worker() -> i32 {
    let cfg = match WorkerConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("[worker] fatal: {e:#}");
            return 1;
        }
    };
    match worker::run(&cfg) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("[worker {}] fatal: {e:#}", cfg.rank);
            1
        }
    }
}

fn parse_status(s: &str) -> Result<JobStatus> {
    match s.to_uppercase().as_str() {
        "RUNNING" => Ok(JobStatus::Running),
        "COMPLETED" => Ok(JobStatus::Completed),
        "FAILED" => Ok(JobStatus::Failed),
        "LOST" => Ok(JobStatus::Lost),
        other => Err(InvalidParameter(format!("unknown status: {other}")).into()),
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Create {
            log_root,
            world_size,
            checkpoint_every,
            sleep_sec,
            dataset_dir,
            checkpoint_dir,
            job_id,
        } => {
            let mgr = JobManager::new(resolve_log_root(log_root.as_deref()));
            let data = mgr.create(
                JobParams {
                    world_size,
                    checkpoint_every,
                    step_interval_sec: sleep_sec,
                    dataset_root: dataset_dir,
                    checkpoint_root: checkpoint_dir,
                },
                job_id,
            )?;
            Response::new("create", data).print();
        }

        Command::Status { log_root, job_id } => {
            let mgr = JobManager::new(resolve_log_root(log_root.as_deref()));
            let data = mgr.status(&job_id);
            Response::new("status", data).print();
        }

        Command::List { log_root } => {
            let mgr = JobManager::new(resolve_log_root(log_root.as_deref()));
            Response::new("list", ListData { jobs: mgr.list() }).print();
        }

        Command::Logs {
            log_root,
            tail,
            job_id,
        } => {
            let mgr = JobManager::new(resolve_log_root(log_root.as_deref()));
            let logs = mgr.tail_logs(&job_id, tail)?;
            Response::new(
                "logs",
                LogsData {
                    job_id,
                    tail,
                    logs,
                },
            )
            .print();
        }

        Command::Stream {
            log_root,
            poll_ms,
            job_id,
        } => {
            let mgr = JobManager::new(resolve_log_root(log_root.as_deref()));
            let poll = std::time::Duration::from_millis(poll_ms.max(1));
            let (status, offset) = mgr.stream_logs(&job_id, poll, |chunk, offset| {
                Response::new(
                    "chunk",
                    ChunkData {
                        job_id: job_id.clone(),
                        data: chunk.to_string(),
                        offset,
                    },
                )
                .print();
            })?;
            Response::new(
                "stream_end",
                StreamEndData {
                    job_id,
                    status,
                    offset,
                },
            )
            .print();
        }

        Command::Stop { log_root, job_id } => {
            let mgr = JobManager::new(resolve_log_root(log_root.as_deref()));
            if mgr.status(&job_id).status == JobStatus::NotFound {
                return Err(JobNotFound { job_id }.into());
            }
            let result = mgr.stop(&job_id);
            Response::new("stop", StopData { job_id, result }).print();
        }

        Command::Delete {
            log_root,
            delete_logs,
            stop_first,
            force,
            job_id,
        } => {
            let mgr = JobManager::new(resolve_log_root(log_root.as_deref()));
            let result = mgr.delete(
                &job_id,
                DeleteOpts {
                    delete_logs,
                    stop_first,
                    force,
                },
            )?;
            if result == DeleteOutcome::NotFound {
                return Err(JobNotFound { job_id }.into());
            }
            Response::new("delete", DeleteData { job_id, result }).print();
        }

        Command::Purge {
            log_root,
            older_than_hours,
            older_than_days,
            statuses,
            delete_logs,
            stop_running,
            force,
        } => {
            let mgr = JobManager::new(resolve_log_root(log_root.as_deref()));
            let older_than_seconds = match (older_than_hours, older_than_days) {
                (None, None) => None,
                (h, d) => Some(h.unwrap_or(0) * 3600 + d.unwrap_or(0) * 86_400),
            };
            let statuses = if statuses.is_empty() {
                None
            } else {
                Some(
                    statuses
                        .iter()
                        .map(|s| parse_status(s))
                        .collect::<Result<Vec<_>>>()?,
                )
            };
            let data = mgr.purge(&PurgeOpts {
                older_than_seconds,
                statuses,
                delete_logs,
                stop_running,
                force,
            })?;
            Response::new("purge", data).print();
        }

        Command::Cleanup {
            log_root,
            keep,
            delete_logs,
            force,
        } => {
            let mgr = JobManager::new(resolve_log_root(log_root.as_deref()));
            let (deleted, kept) = mgr.cleanup(keep, delete_logs, force)?;
            Response::new("cleanup", CleanupData { deleted, kept }).print();
        }

        Command::MakeDataset { dir, shards, lines } => {
            dataset::make_dataset(std::path::Path::new(&dir), shards, lines)?;
            Response::new(
                "make_dataset",
                MakeDatasetData {
                    dir,
                    shards,
                    lines_per_shard: lines,
                },
            )
            .print();
        }

        Command::Coordinate | Command::Work => unreachable!("handled in main"),
    }
    Ok(())
}
