//! The adapter interface (§4.4): a closed, tagged-variant capability set
//! instead of the source's ad-hoc per-downloader classes (§9 redesign
//! guidance "dynamic per-kind dispatch").

use std::path::{Path, PathBuf};

use crate::domain::{Job, ProgressDelta};
use crate::error::ErrorCode;

#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Artifact {
    pub filename: String,
    pub path: PathBuf,
    pub size: Option<u64>,
}

/// Mutable scratch state an adapter's `parse_line` may need across calls
/// (e.g. a probed input duration for the transcode adapter's
/// `out_time_ms` → percent conversion).
#[derive(Debug, Default)]
pub struct AdapterContext {
    pub probed_duration_secs: Option<f64>,
    pub total_file_count: Option<u64>,
    pub files_seen: u64,
}

/// Adapter interface for child-process-driven downloaders/transcoders
/// (youtube, hls, twitter, pinterest, and the transcode post-process).
pub trait DownloaderAdapter: Send + Sync {
    fn build(&self, job: &Job, work_dir: &Path) -> anyhow::Result<ProcessSpec>;

    /// Pure function mapping one line of stdout or stderr to either nothing
    /// or a delta. Must not perform I/O.
    fn parse_line(&self, line: &str, ctx: &mut AdapterContext) -> Option<ProgressDelta>;

    fn classify_error(&self, exit_code: Option<i32>, stderr_tail: &str) -> ErrorCode;

    fn collect_artifact(&self, work_dir: &Path) -> anyhow::Result<Artifact>;
}

/// A snapshot returned by a [`PollingAdapter`] (§4.4.1).
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub state: PollState,
    pub completed_bytes: u64,
    pub total_bytes: u64,
    pub speed_bytes_per_sec: f64,
    pub error_message: Option<String>,
    pub files: Vec<Artifact>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Active,
    Complete,
    Error,
    Removed,
}

#[derive(Debug, Clone)]
pub struct PollHandle(pub String);

/// Adapter interface for control-plane downloaders that run as an external
/// daemon controlled via RPC instead of a line-oriented child process
/// (§4.4.1; `file` kind uses aria2's JSON-RPC this way).
pub trait PollingAdapter: Send + Sync {
    fn start(&self, job: &Job, work_dir: &Path) -> anyhow::Result<PollHandle>;
    fn poll(&self, handle: &PollHandle) -> anyhow::Result<Snapshot>;
    fn cancel(&self, handle: &PollHandle) -> anyhow::Result<()>;
}

/// Convert a polling snapshot into the same `ProgressDelta` shape a
/// line-oriented adapter would produce, per the §4.4.1 formulas.
pub fn snapshot_to_delta(snapshot: &Snapshot) -> ProgressDelta {
    let progress = if snapshot.total_bytes > 0 {
        Some(100.0 * snapshot.completed_bytes as f64 / snapshot.total_bytes as f64)
    } else {
        None
    };
    let eta = if snapshot.speed_bytes_per_sec > 0.0 && snapshot.total_bytes >= snapshot.completed_bytes {
        let remaining = snapshot.total_bytes - snapshot.completed_bytes;
        Some((remaining as f64 / snapshot.speed_bytes_per_sec).round() as u64)
    } else {
        None
    };
    let speed = if snapshot.speed_bytes_per_sec > 0.0 {
        Some(format_speed(snapshot.speed_bytes_per_sec))
    } else {
        None
    };
    ProgressDelta {
        progress,
        stage: None,
        speed,
        eta,
        total_bytes: if snapshot.total_bytes > 0 {
            Some(snapshot.total_bytes)
        } else {
            None
        },
        phase_message: None,
    }
}

fn format_speed(bytes_per_sec: f64) -> String {
    let mb = bytes_per_sec / (1024.0 * 1024.0);
    format!("{mb:.2} MB/s")
}
