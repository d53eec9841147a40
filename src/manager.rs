//! The JobManager: spawns detached coordinators, persists the job index,
//! answers status queries, streams log bytes, and stops/deletes/purges jobs.
//!
//! One mutex guards the in-memory handle table and every read-modify-write
//! of the index file, so all public operations are linearizable with respect
//! to each other. The index is the only cross-restart truth: after a manager
//! restart the pid recorded there is the sole bridge to a job's coordinator.

use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::index::{self, JobNotFound};
use crate::logtail;
use crate::schema::{
    CreateData, DeleteOutcome, JobIndexEntry, JobParams, JobStatus, PurgeData, StatusData,
    StopOutcome,
};

/// How long `delete --stop-first` waits between the stop signal and the
/// removal of the job's files.
const STOP_GRACE: Duration = Duration::from_millis(500);

/// How many trailing log lines the sentinel inference scans.
const INFERENCE_TAIL_LINES: u64 = 300;

/// Error type for out-of-range job parameters, downcast in `main` to emit an
/// `invalid_parameter` error response.
#[derive(Debug)]
pub struct InvalidParameter(pub String);

impl std::fmt::Display for InvalidParameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid parameter: {}", self.0)
    }
}

impl std::error::Error for InvalidParameter {}

/// Validate the ranges the create operation accepts.
pub fn validate_params(params: &JobParams) -> Result<()> {
    if !(1..=64).contains(&params.world_size) {
        return Err(InvalidParameter(format!(
            "world_size must be in [1, 64], got {}",
            params.world_size
        ))
        .into());
    }
    if !(1..=10_000).contains(&params.checkpoint_every) {
        return Err(InvalidParameter(format!(
            "checkpoint_every must be in [1, 10000], got {}",
            params.checkpoint_every
        ))
        .into());
    }
    if !(0.0..=10.0).contains(&params.step_interval_sec) {
        return Err(InvalidParameter(format!(
            "sleep_sec must be in [0, 10], got {}",
            params.step_interval_sec
        ))
        .into());
    }
    Ok(())
}

/// Options for `delete`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteOpts {
    pub delete_logs: bool,
    pub stop_first: bool,
    pub force: bool,
}

/// Filters for `purge`.
#[derive(Debug, Clone, Default)]
pub struct PurgeOpts {
    pub older_than_seconds: Option<u64>,
    pub statuses: Option<Vec<JobStatus>>,
    pub delete_logs: bool,
    pub stop_running: bool,
    pub force: bool,
}

pub struct JobManager {
    log_root: PathBuf,
    /// Live coordinator handles for jobs spawned by this process. Never
    /// survives a manager restart; the index pid takes over then.
    live: Mutex<HashMap<String, Child>>,
}

impl JobManager {
    pub fn new(log_root: impl Into<PathBuf>) -> Self {
        JobManager {
            log_root: log_root.into(),
            live: Mutex::new(HashMap::new()),
        }
    }

    pub fn log_root(&self) -> &Path {
        &self.log_root
    }

    fn lock_live(&self) -> std::sync::MutexGuard<'_, HashMap<String, Child>> {
        // A poisoned mutex means another request panicked; the table itself
        // is still structurally sound.
        self.live.lock().unwrap_or_else(|p| p.into_inner())
    }

    // ---------- create ----------

    /// Spawn a detached coordinator for a new job and record it in the index.
    /// Never blocks on worker startup.
    pub fn create(&self, params: JobParams, job_id: Option<String>) -> Result<CreateData> {
        validate_params(&params)?;

        let mut live = self.lock_live();
        let mut jobs = index::load(&self.log_root)?;

        let job_id = job_id
            .unwrap_or_else(|| format!("job-{}", &Uuid::new_v4().simple().to_string()[..8]));
        let log_path = index::log_path(&self.log_root, &job_id);

        std::fs::create_dir_all(&self.log_root)
            .with_context(|| format!("create log root {}", self.log_root.display()))?;
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("open log file {}", log_path.display()))?;

        let exe = std::env::current_exe().context("resolve current exe")?;
        let mut cmd = Command::new(&exe);
        cmd.arg("_coordinate")
            .env("JOB_ID", &job_id)
            .env("WORLD_SIZE", params.world_size.to_string())
            .env("CHECKPOINT_DIR", &params.checkpoint_root)
            .env("CHECKPOINT_EVERY", params.checkpoint_every.to_string())
            .env("SLEEP_SEC", params.step_interval_sec.to_string())
            .env("DATASET_DIR", &params.dataset_root)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file.try_clone().context("clone log fd")?))
            .stderr(Stdio::from(log_file));
        detach(&mut cmd);

        let child = cmd.spawn().context("spawn coordinator")?;
        let pid = child.id();
        info!(job_id = %job_id, pid, "coordinator spawned");

        jobs.insert(
            job_id.clone(),
            JobIndexEntry {
                pid,
                log_path: log_path.display().to_string(),
                created_at: now_secs(),
                params,
                status: JobStatus::Running,
                exit_code: None,
                ended_at: None,
            },
        );
        index::store(&self.log_root, &jobs)?;
        live.insert(job_id.clone(), child);

        Ok(CreateData {
            job_id,
            pid,
            log_path: log_path.display().to_string(),
        })
    }

    // ---------- status / list ----------

    /// Resolve a job's status. Never fails: unknown ids report `NOT_FOUND`.
    pub fn status(&self, job_id: &str) -> StatusData {
        let mut live = self.lock_live();
        let mut jobs = index::load(&self.log_root).unwrap_or_default();
        let (data, dirty) = resolve_status(&mut live, &mut jobs, job_id);
        if dirty {
            let _ = index::store(&self.log_root, &jobs);
        }
        data
    }

    /// Status of every known job, ordered by creation time descending.
    pub fn list(&self) -> Vec<StatusData> {
        let mut live = self.lock_live();
        let mut jobs = index::load(&self.log_root).unwrap_or_default();

        let mut ids: Vec<(u64, String)> = jobs
            .iter()
            .map(|(id, e)| (e.created_at, id.clone()))
            .collect();
        ids.sort_by(|a, b| b.cmp(a));

        let mut dirty = false;
        let mut out = Vec::with_capacity(ids.len());
        for (_, id) in ids {
            let (data, d) = resolve_status(&mut live, &mut jobs, &id);
            dirty |= d;
            out.push(data);
        }
        if dirty {
            let _ = index::store(&self.log_root, &jobs);
        }
        out
    }

    // ---------- logs ----------

    /// Last `n` lines of the job's log; empty when no log exists yet.
    pub fn tail_logs(&self, job_id: &str, n: u64) -> Result<String> {
        let _live = self.lock_live();
        let jobs = index::load(&self.log_root)?;
        let entry = jobs.get(job_id).ok_or_else(|| JobNotFound {
            job_id: job_id.to_string(),
        })?;
        Ok(logtail::tail_lines(Path::new(&entry.log_path), n))
    }

    /// Read `[offset, file_size)` from the job's log.
    pub fn read_new_log_bytes(&self, job_id: &str, offset: u64) -> Result<(String, u64)> {
        let _live = self.lock_live();
        let jobs = index::load(&self.log_root)?;
        let entry = jobs.get(job_id).ok_or_else(|| JobNotFound {
            job_id: job_id.to_string(),
        })?;
        logtail::read_new_bytes(Path::new(&entry.log_path), offset)
    }

    /// Follow the job's log, invoking `on_chunk` for each batch of new bytes,
    /// until the job reaches a terminal (or lost) state and one final drain
    /// read has returned nothing new. Returns the final status and offset.
    pub fn stream_logs(
        &self,
        job_id: &str,
        poll: Duration,
        mut on_chunk: impl FnMut(&str, u64),
    ) -> Result<(JobStatus, u64)> {
        // Existence check up front; afterwards the job may legitimately
        // disappear mid-stream (treated as lost).
        if self.status(job_id).status == JobStatus::NotFound {
            return Err(JobNotFound {
                job_id: job_id.to_string(),
            }
            .into());
        }

        let mut offset = 0u64;
        loop {
            let (chunk, new_offset) = self.read_new_log_bytes(job_id, offset)?;
            if !chunk.is_empty() {
                offset = new_offset;
                on_chunk(&chunk, offset);
            }

            let status = self.status(job_id).status;
            if matches!(
                status,
                JobStatus::Completed | JobStatus::Failed | JobStatus::Lost | JobStatus::NotFound
            ) {
                // One last drain for bytes appended before the writer died.
                let (chunk, new_offset) = self.read_new_log_bytes(job_id, offset)?;
                if !chunk.is_empty() {
                    offset = new_offset;
                    on_chunk(&chunk, offset);
                }
                return Ok((status, offset));
            }

            std::thread::sleep(poll);
        }
    }

    // ---------- stop ----------

    /// Send the interrupt signal to a job's coordinator. Non-blocking: the
    /// status query converges on the terminal state afterwards.
    pub fn stop(&self, job_id: &str) -> StopOutcome {
        let mut live = self.lock_live();
        let mut jobs = index::load(&self.log_root).unwrap_or_default();
        let (outcome, dirty) = stop_locked(&mut live, &mut jobs, job_id);
        if dirty {
            let _ = index::store(&self.log_root, &jobs);
        }
        outcome
    }

    // ---------- delete / purge / cleanup ----------

    /// Remove a job from the index (and optionally its log file and
    /// checkpoint tree). Running jobs are refused unless `stop_first` or
    /// `force` is set.
    pub fn delete(&self, job_id: &str, opts: DeleteOpts) -> Result<DeleteOutcome> {
        let mut live = self.lock_live();
        let mut jobs = index::load(&self.log_root)?;
        let outcome = delete_locked(&mut live, &mut jobs, job_id, opts);
        index::store(&self.log_root, &jobs)?;
        Ok(outcome)
    }

    /// Delete every job matching the age/status filters.
    pub fn purge(&self, opts: &PurgeOpts) -> Result<PurgeData> {
        let mut live = self.lock_live();
        let mut jobs = index::load(&self.log_root)?;

        let ids: Vec<String> = jobs.keys().cloned().collect();
        let now = now_secs();
        let mut matched = 0u64;
        let mut deleted = 0u64;

        for id in ids {
            let (data, _) = resolve_status(&mut live, &mut jobs, &id);
            let Some(entry) = jobs.get(&id) else { continue };

            if let Some(min_age) = opts.older_than_seconds
                && now.saturating_sub(entry.created_at) < min_age
            {
                continue;
            }
            if let Some(statuses) = &opts.statuses
                && !statuses.contains(&data.status)
            {
                continue;
            }
            matched += 1;

            let del = DeleteOpts {
                delete_logs: opts.delete_logs,
                stop_first: opts.stop_running,
                force: opts.force,
            };
            if delete_locked(&mut live, &mut jobs, &id, del) == DeleteOutcome::Deleted {
                deleted += 1;
            }
        }

        index::store(&self.log_root, &jobs)?;
        Ok(PurgeData {
            deleted,
            total_matched: matched,
        })
    }

    /// Keep only the `keep_last` most-recently-created jobs; delete the rest
    /// (running jobs are skipped unless `force`).
    pub fn cleanup(&self, keep_last: usize, delete_logs: bool, force: bool) -> Result<(u64, u64)> {
        let mut live = self.lock_live();
        let mut jobs = index::load(&self.log_root)?;

        let mut ids: Vec<(u64, String)> = jobs
            .iter()
            .map(|(id, e)| (e.created_at, id.clone()))
            .collect();
        ids.sort_by(|a, b| b.cmp(a));

        let mut deleted = 0u64;
        for (_, id) in ids.iter().skip(keep_last) {
            let opts = DeleteOpts {
                delete_logs,
                stop_first: false,
                force,
            };
            if delete_locked(&mut live, &mut jobs, id, opts) == DeleteOutcome::Deleted {
                deleted += 1;
            }
        }

        index::store(&self.log_root, &jobs)?;
        let kept = jobs.len() as u64;
        Ok((deleted, kept))
    }
}

fn not_found(job_id: &str) -> StatusData {
    StatusData {
        job_id: job_id.to_string(),
        status: JobStatus::NotFound,
        pid: None,
        exit_code: None,
        note: None,
    }
}

/// The status resolution algorithm. Returns the status record and whether
/// the index was mutated (a terminal status was persisted).
///
/// Order: live handle, then persisted terminal status, then pid liveness,
/// then log-sentinel inference, else `LOST`. `LOST` is never persisted:
/// a slow writer might still append a sentinel.
fn resolve_status(
    live: &mut HashMap<String, Child>,
    jobs: &mut BTreeMap<String, JobIndexEntry>,
    job_id: &str,
) -> (StatusData, bool) {
    // 1-2. Live handle from this process lifetime.
    if let Some(child) = live.get_mut(job_id) {
        match child.try_wait() {
            Ok(None) => {
                return (
                    StatusData {
                        job_id: job_id.to_string(),
                        status: JobStatus::Running,
                        pid: Some(child.id()),
                        exit_code: None,
                        note: None,
                    },
                    false,
                );
            }
            Ok(Some(exit)) => {
                let code = exit.code().unwrap_or(1);
                let status = if code == 0 {
                    JobStatus::Completed
                } else {
                    JobStatus::Failed
                };
                live.remove(job_id);
                let dirty = persist_terminal(jobs, job_id, status, code);
                debug!(job_id, code, "coordinator exit observed via live handle");
                return (
                    StatusData {
                        job_id: job_id.to_string(),
                        status,
                        pid: None,
                        exit_code: Some(code),
                        note: None,
                    },
                    dirty,
                );
            }
            Err(_) => {
                // Handle unusable; fall through to the index path.
                live.remove(job_id);
            }
        }
    }

    // 3. Index entry (the restarted-manager path).
    let Some(entry) = jobs.get(job_id) else {
        return (not_found(job_id), false);
    };

    if entry.exit_code.is_some() {
        return (
            StatusData {
                job_id: job_id.to_string(),
                status: entry.status,
                pid: None,
                exit_code: entry.exit_code,
                note: None,
            },
            false,
        );
    }

    if pid_alive(entry.pid) {
        return (
            StatusData {
                job_id: job_id.to_string(),
                status: JobStatus::Running,
                pid: Some(entry.pid),
                exit_code: None,
                note: Some("reattached-via-pid".to_string()),
            },
            false,
        );
    }

    if let Some((status, code, note)) = infer_from_log(Path::new(&entry.log_path)) {
        let dirty = persist_terminal(jobs, job_id, status, code);
        return (
            StatusData {
                job_id: job_id.to_string(),
                status,
                pid: None,
                exit_code: Some(code),
                note: Some(note.to_string()),
            },
            dirty,
        );
    }

    (
        StatusData {
            job_id: job_id.to_string(),
            status: JobStatus::Lost,
            pid: None,
            exit_code: None,
            note: Some("pid not alive and no terminal log sentinel".to_string()),
        },
        false,
    )
}

/// Record a terminal status exactly once. Later writes never overwrite an
/// earlier terminal one.
fn persist_terminal(
    jobs: &mut BTreeMap<String, JobIndexEntry>,
    job_id: &str,
    status: JobStatus,
    code: i32,
) -> bool {
    let Some(entry) = jobs.get_mut(job_id) else {
        return false;
    };
    if entry.exit_code.is_some() {
        return false;
    }
    entry.status = status;
    entry.exit_code = Some(code);
    entry.ended_at = Some(now_secs());
    true
}

/// Infer a terminal status from the last few hundred log lines. Best effort:
/// a coordinator observed through its own handle always wins over this.
fn infer_from_log(log_path: &Path) -> Option<(JobStatus, i32, &'static str)> {
    let tail = logtail::tail_lines(log_path, INFERENCE_TAIL_LINES);
    // Covers both "Job COMPLETED." and "all workers DONE. Job COMPLETED."
    if tail.contains("Job COMPLETED.") {
        Some((JobStatus::Completed, 0, "log_sentinel"))
    } else if tail.contains("max restarts hit") {
        Some((JobStatus::Failed, 1, "max_restarts"))
    } else if tail.contains("Traceback (most recent call last)") {
        Some((JobStatus::Failed, 1, "uncaught_exception"))
    } else {
        None
    }
}

fn stop_locked(
    live: &mut HashMap<String, Child>,
    jobs: &mut BTreeMap<String, JobIndexEntry>,
    job_id: &str,
) -> (StopOutcome, bool) {
    if let Some(child) = live.get_mut(job_id) {
        match child.try_wait() {
            Ok(Some(exit)) => {
                let code = exit.code().unwrap_or(1);
                let status = if code == 0 {
                    JobStatus::Completed
                } else {
                    JobStatus::Failed
                };
                live.remove(job_id);
                let dirty = persist_terminal(jobs, job_id, status, code);
                return (StopOutcome::NotRunning, dirty);
            }
            Ok(None) => {
                let pid = child.id();
                if send_interrupt(pid).is_ok() {
                    info!(job_id, pid, "interrupt sent to coordinator");
                    return (StopOutcome::StopSignalSent, false);
                }
                // Fall back to hard termination through the handle.
                return match child.kill() {
                    Ok(()) => (StopOutcome::StopSignalSent, false),
                    Err(_) => (StopOutcome::StopFailed, false),
                };
            }
            Err(_) => {
                live.remove(job_id);
            }
        }
    }

    // Restarted manager: the index pid is all we have.
    let Some(entry) = jobs.get(job_id) else {
        return (StopOutcome::CannotStop, false);
    };
    if entry.exit_code.is_some() || !pid_alive(entry.pid) {
        return (StopOutcome::NotRunning, false);
    }
    match send_interrupt(entry.pid) {
        Ok(()) => {
            info!(job_id, pid = entry.pid, "interrupt sent via index pid");
            (StopOutcome::StopSignalSent, false)
        }
        Err(_) => (StopOutcome::StopFailed, false),
    }
}

fn delete_locked(
    live: &mut HashMap<String, Child>,
    jobs: &mut BTreeMap<String, JobIndexEntry>,
    job_id: &str,
    opts: DeleteOpts,
) -> DeleteOutcome {
    let (data, _) = resolve_status(live, jobs, job_id);
    match data.status {
        JobStatus::NotFound => return DeleteOutcome::NotFound,
        JobStatus::Running => {
            if !opts.stop_first && !opts.force {
                return DeleteOutcome::RefusedRunning;
            }
            if opts.stop_first {
                stop_locked(live, jobs, job_id);
                std::thread::sleep(STOP_GRACE);
            }
            if let Some(pid) = data.pid
                && pid_alive(pid)
            {
                kill_hard(pid);
            }
        }
        _ => {}
    }

    if let Some(mut child) = live.remove(job_id) {
        let _ = child.kill();
        let _ = child.wait();
    }
    let Some(entry) = jobs.remove(job_id) else {
        return DeleteOutcome::NotFound;
    };
    if opts.delete_logs {
        let _ = std::fs::remove_file(&entry.log_path);
        let ckpt = Path::new(&entry.params.checkpoint_root).join(job_id);
        let _ = std::fs::remove_dir_all(ckpt);
    }
    debug!(job_id, "job deleted");
    DeleteOutcome::Deleted
}

// ---------- OS helpers ----------

/// Detach the coordinator from the manager's lifecycle: new session on
/// POSIX, detached process group on Windows.
#[cfg(unix)]
fn detach(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    // SAFETY: setsid is async-signal-safe and has no preconditions in a
    // freshly forked child.
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }
}

#[cfg(windows)]
fn detach(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    const DETACHED_PROCESS: u32 = 0x0000_0008;
    cmd.creation_flags(CREATE_NEW_PROCESS_GROUP | DETACHED_PROCESS);
}

/// True when `pid` names a live, non-zombie process.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    // SAFETY: kill(2) with signal 0 only performs the permission/existence
    // check.
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        // EPERM means the process exists but belongs to someone else.
        return err.raw_os_error() == Some(libc::EPERM);
    }
    // kill(0) succeeds for zombies too; check the proc state where we can.
    #[cfg(target_os = "linux")]
    {
        // The state char follows the last ')' of the comm field.
        if let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat"))
            && let Some(rest) = stat.rsplit(')').next()
        {
            return !rest.trim_start().starts_with('Z');
        }
    }
    true
}

#[cfg(windows)]
pub fn pid_alive(pid: u32) -> bool {
    use windows::Win32::Foundation::{CloseHandle, STILL_ACTIVE};
    use windows::Win32::System::Threading::{
        GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
    };
    unsafe {
        let Ok(handle) = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid) else {
            return false;
        };
        let mut code = 0u32;
        let alive = GetExitCodeProcess(handle, &mut code).is_ok() && code == STILL_ACTIVE.0 as u32;
        let _ = CloseHandle(handle);
        alive
    }
}

/// Deliver the graceful interrupt: SIGINT on POSIX, CTRL_BREAK on Windows.
#[cfg(unix)]
fn send_interrupt(pid: u32) -> std::io::Result<()> {
    // SAFETY: kill(2) is safe to call with any pid and valid signal number.
    let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(windows)]
fn send_interrupt(pid: u32) -> std::io::Result<()> {
    use windows::Win32::System::Console::{CTRL_BREAK_EVENT, GenerateConsoleCtrlEvent};
    unsafe {
        GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid)
            .map_err(|e| std::io::Error::other(e.to_string()))
    }
}

/// Force-kill, best effort.
#[cfg(unix)]
fn kill_hard(pid: u32) {
    // SAFETY: kill(2) is safe to call with any pid and valid signal number.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(windows)]
fn kill_hard(pid: u32) {
    use windows::Win32::Foundation::CloseHandle;
    use windows::Win32::System::Threading::{OpenProcess, PROCESS_TERMINATE, TerminateProcess};
    unsafe {
        if let Ok(handle) = OpenProcess(PROCESS_TERMINATE, false, pid) {
            let _ = TerminateProcess(handle, 1);
            let _ = CloseHandle(handle);
        }
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (tempfile::TempDir, JobManager) {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = JobManager::new(tmp.path());
        (tmp, mgr)
    }

    /// Spawn and reap a short-lived process to obtain a pid that is
    /// certainly dead.
    fn dead_pid() -> u32 {
        let mut child = Command::new("true").spawn().expect("spawn true");
        let pid = child.id();
        child.wait().expect("wait true");
        pid
    }

    fn seed_entry(mgr: &JobManager, job_id: &str, pid: u32, log_body: Option<&str>) {
        let log = index::log_path(mgr.log_root(), job_id);
        if let Some(body) = log_body {
            std::fs::create_dir_all(mgr.log_root()).unwrap();
            std::fs::write(&log, body).unwrap();
        }
        let mut jobs = index::load(mgr.log_root()).unwrap();
        jobs.insert(
            job_id.to_string(),
            JobIndexEntry {
                pid,
                log_path: log.display().to_string(),
                created_at: now_secs(),
                params: JobParams::default(),
                status: JobStatus::Running,
                exit_code: None,
                ended_at: None,
            },
        );
        index::store(mgr.log_root(), &jobs).unwrap();
    }

    #[test]
    fn unknown_job_is_not_found() {
        let (_tmp, mgr) = manager();
        let s = mgr.status("job-nope");
        assert_eq!(s.status, JobStatus::NotFound);
    }

    #[test]
    fn persisted_terminal_status_is_sticky() {
        let (_tmp, mgr) = manager();
        seed_entry(&mgr, "job-done0001", dead_pid(), None);
        {
            let mut jobs = index::load(mgr.log_root()).unwrap();
            persist_terminal(&mut jobs, "job-done0001", JobStatus::Completed, 0);
            // A second terminal write must not take.
            assert!(!persist_terminal(
                &mut jobs,
                "job-done0001",
                JobStatus::Failed,
                1
            ));
            index::store(mgr.log_root(), &jobs).unwrap();
        }
        let s = mgr.status("job-done0001");
        assert_eq!(s.status, JobStatus::Completed);
        assert_eq!(s.exit_code, Some(0));
    }

    #[test]
    fn dead_pid_with_completed_sentinel_infers_and_persists() {
        let (_tmp, mgr) = manager();
        seed_entry(
            &mgr,
            "job-sent0001",
            dead_pid(),
            Some("[coord] starting\nall workers DONE. Job COMPLETED.\n"),
        );

        let s = mgr.status("job-sent0001");
        assert_eq!(s.status, JobStatus::Completed);
        assert_eq!(s.exit_code, Some(0));

        // Persisted: the entry now carries the terminal exit code.
        let jobs = index::load(mgr.log_root()).unwrap();
        assert_eq!(jobs["job-sent0001"].exit_code, Some(0));
        assert_eq!(jobs["job-sent0001"].status, JobStatus::Completed);
    }

    #[test]
    fn dead_pid_with_max_restarts_sentinel_is_failed() {
        let (_tmp, mgr) = manager();
        seed_entry(
            &mgr,
            "job-sent0002",
            dead_pid(),
            Some("[coord] max restarts hit for rank=0\n"),
        );
        let s = mgr.status("job-sent0002");
        assert_eq!(s.status, JobStatus::Failed);
        assert_eq!(s.exit_code, Some(1));
        assert_eq!(s.note.as_deref(), Some("max_restarts"));
    }

    #[test]
    fn dead_pid_without_sentinel_is_lost_and_not_persisted() {
        let (_tmp, mgr) = manager();
        seed_entry(&mgr, "job-lost0001", dead_pid(), Some("[coord] starting\n"));
        let s = mgr.status("job-lost0001");
        assert_eq!(s.status, JobStatus::Lost);

        // LOST must not be sticky.
        let jobs = index::load(mgr.log_root()).unwrap();
        assert!(jobs["job-lost0001"].exit_code.is_none());
        assert_eq!(jobs["job-lost0001"].status, JobStatus::Running);
    }

    #[test]
    fn live_pid_reattaches_as_running() {
        let (_tmp, mgr) = manager();
        let mut child = Command::new("sleep").arg("30").spawn().expect("spawn sleep");
        seed_entry(&mgr, "job-live0001", child.id(), None);

        let s = mgr.status("job-live0001");
        assert_eq!(s.status, JobStatus::Running);
        assert_eq!(s.pid, Some(child.id()));
        assert_eq!(s.note.as_deref(), Some("reattached-via-pid"));

        let _ = child.kill();
        let _ = child.wait();
    }

    #[test]
    fn stop_running_job_via_index_pid() {
        let (_tmp, mgr) = manager();
        let mut child = Command::new("sleep").arg("30").spawn().expect("spawn sleep");
        seed_entry(&mgr, "job-stop0001", child.id(), None);

        assert_eq!(mgr.stop("job-stop0001"), StopOutcome::StopSignalSent);
        // SIGINT terminates sleep.
        let status = child.wait().expect("wait sleep");
        assert!(!status.success());
    }

    #[test]
    fn stop_finished_job_is_not_running() {
        let (_tmp, mgr) = manager();
        seed_entry(&mgr, "job-stop0002", dead_pid(), None);
        assert_eq!(mgr.stop("job-stop0002"), StopOutcome::NotRunning);
    }

    #[test]
    fn stop_unknown_job_cannot_stop() {
        let (_tmp, mgr) = manager();
        assert_eq!(mgr.stop("job-nope"), StopOutcome::CannotStop);
    }

    #[test]
    fn delete_refuses_running_without_flags() {
        let (_tmp, mgr) = manager();
        let mut child = Command::new("sleep").arg("30").spawn().expect("spawn sleep");
        seed_entry(&mgr, "job-del0001", child.id(), None);

        let outcome = mgr.delete("job-del0001", DeleteOpts::default()).unwrap();
        assert_eq!(outcome, DeleteOutcome::RefusedRunning);
        assert_eq!(mgr.status("job-del0001").status, JobStatus::Running);

        // Force delete kills the coordinator and removes the entry.
        let outcome = mgr
            .delete(
                "job-del0001",
                DeleteOpts {
                    force: true,
                    ..DeleteOpts::default()
                },
            )
            .unwrap();
        assert_eq!(outcome, DeleteOutcome::Deleted);
        assert_eq!(mgr.status("job-del0001").status, JobStatus::NotFound);

        let _ = child.wait();
    }

    #[test]
    fn delete_removes_logs_when_asked() {
        let (_tmp, mgr) = manager();
        seed_entry(
            &mgr,
            "job-del0002",
            dead_pid(),
            Some("all workers DONE. Job COMPLETED.\n"),
        );
        let log = index::log_path(mgr.log_root(), "job-del0002");
        assert!(log.exists());

        let outcome = mgr
            .delete(
                "job-del0002",
                DeleteOpts {
                    delete_logs: true,
                    ..DeleteOpts::default()
                },
            )
            .unwrap();
        assert_eq!(outcome, DeleteOutcome::Deleted);
        assert!(!log.exists());
    }

    #[test]
    fn purge_filters_by_age_and_status() {
        let (_tmp, mgr) = manager();
        seed_entry(
            &mgr,
            "job-old00001",
            dead_pid(),
            Some("all workers DONE. Job COMPLETED.\n"),
        );
        seed_entry(&mgr, "job-new00001", dead_pid(), Some("nothing yet\n"));
        {
            // Age the first entry by an hour.
            let mut jobs = index::load(mgr.log_root()).unwrap();
            jobs.get_mut("job-old00001").unwrap().created_at -= 3600;
            index::store(mgr.log_root(), &jobs).unwrap();
        }

        let res = mgr
            .purge(&PurgeOpts {
                older_than_seconds: Some(1800),
                statuses: Some(vec![JobStatus::Completed]),
                ..PurgeOpts::default()
            })
            .unwrap();
        assert_eq!(res.total_matched, 1);
        assert_eq!(res.deleted, 1);
        assert_eq!(mgr.status("job-old00001").status, JobStatus::NotFound);
        assert_ne!(mgr.status("job-new00001").status, JobStatus::NotFound);
    }

    #[test]
    fn cleanup_keeps_most_recent() {
        let (_tmp, mgr) = manager();
        for (i, id) in ["job-c0000001", "job-c0000002", "job-c0000003"].iter().enumerate() {
            seed_entry(&mgr, id, dead_pid(), Some("all workers DONE. Job COMPLETED.\n"));
            let mut jobs = index::load(mgr.log_root()).unwrap();
            jobs.get_mut(*id).unwrap().created_at = 1_700_000_000 + i as u64;
            index::store(mgr.log_root(), &jobs).unwrap();
        }

        let (deleted, kept) = mgr.cleanup(1, false, false).unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(kept, 1);
        // The newest survives.
        assert_ne!(mgr.status("job-c0000003").status, JobStatus::NotFound);
    }

    #[test]
    fn validate_rejects_out_of_range() {
        let mut p = JobParams::default();
        p.world_size = 0;
        assert!(validate_params(&p).is_err());
        p.world_size = 65;
        assert!(validate_params(&p).is_err());
        p.world_size = 64;
        assert!(validate_params(&p).is_ok());

        p.checkpoint_every = 0;
        assert!(validate_params(&p).is_err());
        p.checkpoint_every = 10_001;
        assert!(validate_params(&p).is_err());
        p.checkpoint_every = 1;
        assert!(validate_params(&p).is_ok());

        p.step_interval_sec = -0.1;
        assert!(validate_params(&p).is_err());
        p.step_interval_sec = 10.5;
        assert!(validate_params(&p).is_err());
        p.step_interval_sec = 0.0;
        assert!(validate_params(&p).is_ok());
    }
}
