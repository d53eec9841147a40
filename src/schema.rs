//! Shared JSON output schema types for shardsup.
//!
//! All stdout output is JSON only. Tracing logs go to stderr.
//! Schema version is fixed at "0.1".

use serde::{Deserialize, Serialize};

pub const SCHEMA_VERSION: &str = "0.1";

/// Serialize `value` to a JSON string and print it as a single line to stdout.
///
/// This is the single place where stdout JSON output is written, ensuring the
/// stdout-is-JSON-only contract is enforced uniformly across all response types.
fn print_json_to_stdout(value: &impl Serialize) {
    println!(
        "{}",
        serde_json::to_string(value).expect("JSON serialization failed")
    );
}

/// Top-level envelope used for every successful response.
#[derive(Debug, Serialize)]
pub struct Response<T: Serialize> {
    pub schema_version: &'static str,
    pub ok: bool,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(flatten)]
    pub data: T,
}

impl<T: Serialize> Response<T> {
    pub fn new(kind: &'static str, data: T) -> Self {
        Response {
            schema_version: SCHEMA_VERSION,
            ok: true,
            kind,
            data,
        }
    }

    /// Serialize to a JSON string and print to stdout.
    pub fn print(&self) {
        print_json_to_stdout(self);
    }
}

/// Top-level envelope for error responses.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub schema_version: &'static str,
    pub ok: bool,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        ErrorResponse {
            schema_version: SCHEMA_VERSION,
            ok: false,
            kind: "error",
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
            },
        }
    }

    pub fn print(&self) {
        print_json_to_stdout(self);
    }
}

// ---------- Job lifecycle ----------

/// Externally observable state of a job.
///
/// Terminal states (`COMPLETED`, `FAILED`) are sticky once persisted in the
/// index; `LOST` and `NOT_FOUND` are only ever computed, never written.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    Lost,
    NotFound,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Lost => "LOST",
            JobStatus::NotFound => "NOT_FOUND",
        }
    }

    /// True for states that can never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Parameters a job is created with; persisted in the index so a restarted
/// supervisor still knows where the job's checkpoints and dataset live.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct JobParams {
    pub world_size: u32,
    pub checkpoint_every: u64,
    pub step_interval_sec: f64,
    pub dataset_root: String,
    pub checkpoint_root: String,
}

impl Default for JobParams {
    fn default() -> Self {
        JobParams {
            world_size: 4,
            checkpoint_every: 5,
            step_interval_sec: 0.5,
            dataset_root: "./data/shards".to_string(),
            checkpoint_root: "./checkpoints".to_string(),
        }
    }
}

/// One entry of `index.json`: everything the supervisor needs to answer
/// queries about a job it did not spawn in this process lifetime.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct JobIndexEntry {
    pub pid: u32,
    pub log_path: String,
    /// Epoch seconds at creation.
    pub created_at: u64,
    pub params: JobParams,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub exit_code: Option<i32>,
    /// Epoch seconds when a terminal status was recorded.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ended_at: Option<u64>,
}

// ---------- Command-specific response payloads ----------

/// Response for `create`.
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateData {
    pub job_id: String,
    /// PID of the detached coordinator process.
    pub pid: u32,
    pub log_path: String,
}

/// Response for `status`, and the per-job record inside `list`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StatusData {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// How the status was resolved when it was not observed directly
    /// (e.g. "reattached-via-pid", "max_restarts").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Response for `list`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ListData {
    pub jobs: Vec<StatusData>,
}

/// Response for `logs`.
#[derive(Debug, Serialize, Deserialize)]
pub struct LogsData {
    pub job_id: String,
    pub tail: u64,
    pub logs: String,
}

/// One streamed chunk of new log bytes, emitted as an NDJSON event.
#[derive(Debug, Serialize, Deserialize)]
pub struct ChunkData {
    pub job_id: String,
    pub data: String,
    /// Byte offset after this chunk; pass back to resume.
    pub offset: u64,
}

/// Final event of a `stream`, after the terminal drain.
#[derive(Debug, Serialize, Deserialize)]
pub struct StreamEndData {
    pub job_id: String,
    pub status: JobStatus,
    pub offset: u64,
}

/// Outcome of `stop`.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopOutcome {
    StopSignalSent,
    NotRunning,
    CannotStop,
    StopFailed,
}

/// Response for `stop`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StopData {
    pub job_id: String,
    pub result: StopOutcome,
}

/// Outcome of `delete`.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeleteOutcome {
    Deleted,
    RefusedRunning,
    NotFound,
}

/// Response for `delete`.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteData {
    pub job_id: String,
    pub result: DeleteOutcome,
}

/// Response for `purge`.
#[derive(Debug, Serialize, Deserialize)]
pub struct PurgeData {
    pub deleted: u64,
    pub total_matched: u64,
}

/// Response for `cleanup`.
#[derive(Debug, Serialize, Deserialize)]
pub struct CleanupData {
    pub deleted: u64,
    pub kept: u64,
}

/// Response for `make-dataset`.
#[derive(Debug, Serialize, Deserialize)]
pub struct MakeDatasetData {
    pub dir: String,
    pub shards: u32,
    pub lines_per_shard: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_screaming_snake() {
        let s = serde_json::to_string(&JobStatus::NotFound).unwrap();
        assert_eq!(s, "\"NOT_FOUND\"");
        let s = serde_json::to_string(&JobStatus::Running).unwrap();
        assert_eq!(s, "\"RUNNING\"");
    }

    #[test]
    fn terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Lost.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn index_entry_roundtrip() {
        let entry = JobIndexEntry {
            pid: 4242,
            log_path: "/tmp/logs/job-abc.log".to_string(),
            created_at: 1_700_000_000,
            params: JobParams::default(),
            status: JobStatus::Running,
            exit_code: None,
            ended_at: None,
        };
        let raw = serde_json::to_string(&entry).unwrap();
        let back: JobIndexEntry = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.pid, 4242);
        assert_eq!(back.status, JobStatus::Running);
        assert!(back.exit_code.is_none());
    }

    #[test]
    fn stop_outcome_wire_format() {
        let s = serde_json::to_string(&StopOutcome::StopSignalSent).unwrap();
        assert_eq!(s, "\"STOP_SIGNAL_SENT\"");
    }
}
