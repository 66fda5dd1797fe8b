//! Immutable process configuration, resolved once from the environment.
//!
//! Per the re-architecture guidance against global state: no component reads
//! `std::env` after construction. `Config` is built once and threaded through
//! explicitly.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Global worker-slot count `C`. Default 3.
    pub max_concurrent_jobs: usize,
    /// Progress → JobStore throttle interval. Default 300ms, clamped to
    /// [100, 1000] per §4.5.
    pub progress_throttle: Duration,
    /// Hard per-job deadline. Default 2h.
    pub job_timeout: Duration,
    /// Silence threshold before the watchdog force-kills a stalled child.
    /// Default 60s.
    pub watchdog_stall: Duration,
    /// Graceful-termination grace period before escalating to a forceful
    /// kill. Default 5s.
    pub grace_timeout: Duration,
    /// RPC poll interval for control-plane adapters. Default 2s.
    pub poll_interval: Duration,
    /// Reservation staleness window before a Broker releases an unacked
    /// reservation back to the queue. Default 30s.
    pub reservation_staleness: Duration,
    /// Retry policy: base delay, multiplicative factor, jitter fraction,
    /// and max attempts.
    pub retry_base_delay: Duration,
    pub retry_factor: f64,
    pub retry_jitter: f64,
    pub max_attempts: u32,
    pub data_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub worker_token: Option<String>,
    pub ytdlp_path: PathBuf,
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    pub aria2_rpc_url: String,
    pub aria2_secret: Option<String>,
    pub twmd_path: PathBuf,
    pub pinterest_dl_path: PathBuf,
    /// Recommended per-subscriber EventBus buffer bound before drop-oldest
    /// kicks in.
    pub event_buffer_capacity: usize,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            max_concurrent_jobs: env_usize("MAX_CONCURRENT_JOBS", 3),
            progress_throttle: Duration::from_millis(
                env_u64("PROGRESS_THROTTLE_MS", 300).clamp(100, 1000),
            ),
            job_timeout: Duration::from_millis(env_u64("JOB_TIMEOUT_MS", 7_200_000)),
            watchdog_stall: Duration::from_millis(env_u64("WATCHDOG_STALL_MS", 60_000)),
            grace_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(2),
            reservation_staleness: Duration::from_secs(30),
            retry_base_delay: Duration::from_secs(5),
            retry_factor: 2.0,
            retry_jitter: 0.2,
            max_attempts: 2,
            data_dir: env_abs_path("DATA_DIR", "./data"),
            temp_dir: env_abs_path("TEMP_DIR", "./tmp"),
            worker_token: std::env::var("WORKER_TOKEN").ok(),
            ytdlp_path: env_path("YTDLP_PATH", "yt-dlp"),
            ffmpeg_path: env_path("FFMPEG_PATH", "ffmpeg"),
            ffprobe_path: env_path("FFPROBE_PATH", "ffprobe"),
            aria2_rpc_url: std::env::var("ARIA2_RPC_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:6800/jsonrpc".to_string()),
            aria2_secret: std::env::var("ARIA2_SECRET").ok(),
            twmd_path: env_path("TWMD_PATH", "twmd"),
            pinterest_dl_path: env_path("PINTEREST_DL_PATH", "pinterest-dl"),
            event_buffer_capacity: 256,
        }
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        let mut config = Self::from_env();
        config.max_concurrent_jobs = 3;
        config.progress_throttle = Duration::from_millis(50);
        config.grace_timeout = Duration::from_millis(50);
        config.watchdog_stall = Duration::from_millis(500);
        config.poll_interval = Duration::from_millis(20);
        config.reservation_staleness = Duration::from_millis(300);
        config
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_path(name: &str, default: &str) -> PathBuf {
    std::env::var(name)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

/// Like `env_path`, but guarantees an absolute result (§4.4, §6: `DATA_DIR`
/// and `TEMP_DIR` are "absolute roots for outputs and scratch"). The default
/// is relative to the current directory, so it's resolved lexically against
/// `std::env::current_dir()` rather than requiring the path to already
/// exist (it usually doesn't yet on first run).
fn env_abs_path(name: &str, default: &str) -> PathBuf {
    let raw = env_path(name, default);
    if raw.is_absolute() {
        return raw;
    }
    std::path::absolute(&raw).unwrap_or(raw)
}
