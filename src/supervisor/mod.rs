//! Launches one external pipeline per job; streams its stdout/stderr into
//! structured progress events; handles cancellation, timeouts, and the
//! watchdog (§4.4). Owns exactly one child (or one polled daemon handle)
//! per worker slot; nothing here is shared across slots.

pub mod adapter;
pub mod adapters;
mod line_reader;
mod watchdog;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::domain::{Job, LogLevel, ProgressDelta};
use crate::error::ErrorCode;

use adapter::{AdapterContext, DownloaderAdapter, PollState, snapshot_to_delta};
use adapters::{AdapterRegistry, Driver};
use line_reader::{LineMessage, StreamSource, spawn_line_pump};
use watchdog::Watchdog;

#[derive(Debug)]
pub enum SupervisorEvent {
    Progress(ProgressDelta),
    Log { level: LogLevel, message: String },
}

#[derive(Debug)]
pub enum SupervisorOutcome {
    Success {
        filename: String,
        output_path: PathBuf,
        size: Option<u64>,
    },
    Failure {
        code: ErrorCode,
        message: String,
    },
    Cancelled,
}

/// Cooperative control flags a worker slot flips to ask a running
/// supervisor to stop. Checked on every iteration of the poll loop rather
/// than delivered as a signal, mirroring the `cancelled_jobs`/
/// `wait_requests` flag-set pattern used for job control elsewhere in this
/// codebase's lineage.
#[derive(Clone)]
pub struct JobControl {
    pub cancel: Arc<AtomicBool>,
    pub pause: Arc<AtomicBool>,
}

impl JobControl {
    pub fn new() -> Self {
        Self {
            cancel: Arc::new(AtomicBool::new(false)),
            pause: Arc::new(AtomicBool::new(false)),
        }
    }

    fn stop_requested(&self) -> bool {
        self.cancel.load(Ordering::Acquire) || self.pause.load(Ordering::Acquire)
    }
}

impl Default for JobControl {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ProcessSupervisor<'a> {
    config: &'a Config,
    registry: &'a AdapterRegistry,
}

const STDERR_TAIL_LINES: usize = 40;
const POLL_TICK: Duration = Duration::from_millis(100);

impl<'a> ProcessSupervisor<'a> {
    pub fn new(config: &'a Config, registry: &'a AdapterRegistry) -> Self {
        Self { config, registry }
    }

    /// Run one job to completion (§4.4 steps 2-7). `on_event` is called for
    /// every progress/log event produced; the caller (the worker slot) is
    /// responsible for forwarding these to ProgressPipeline.
    pub fn run(
        &self,
        job: &Job,
        control: &JobControl,
        mut on_event: impl FnMut(SupervisorEvent),
    ) -> SupervisorOutcome {
        let temp_dir = self.config.temp_dir.join(job.id.to_string());
        let data_dir = self.config.data_dir.join(job.id.to_string());
        if let Err(err) = std::fs::create_dir_all(&temp_dir) {
            return SupervisorOutcome::Failure {
                code: ErrorCode::DiskFull,
                message: format!("failed to create work directory: {err}"),
            };
        }

        let outcome = match self.registry.driver_for(job.kind) {
            Driver::Process(adapter) => {
                self.run_process(job, &temp_dir, adapter, AdapterContext::default(), control, &mut on_event)
            }
            Driver::Polling(adapter) => self.run_polling(job, &temp_dir, adapter, control, &mut on_event),
        };

        // Second phase (§4.4): if the job asked for a transcode and the
        // primary adapter produced a video-shaped kind, re-run the line
        // loop against ffmpeg before finalizing. Twitter/Pinterest bundles
        // are not necessarily a single video, so transcode is skipped for
        // them (documented open-question resolution in DESIGN.md).
        let outcome = match outcome {
            SupervisorOutcome::Success { filename: _, output_path, size: _ }
                if job.options.transcode.is_some() && kind_produces_video(job.kind) =>
            {
                self.run_transcode_stage(job, &temp_dir, &output_path, control, &mut on_event)
            }
            other => other,
        };

        let outcome = match outcome {
            SupervisorOutcome::Success { filename, output_path, size } => {
                match finalize_artifact(&output_path, &data_dir, &filename) {
                    Ok(final_path) => SupervisorOutcome::Success {
                        filename,
                        output_path: final_path,
                        size,
                    },
                    Err(err) => SupervisorOutcome::Failure {
                        code: ErrorCode::DiskFull,
                        message: format!("failed to finalize output: {err}"),
                    },
                }
            }
            other => other,
        };

        let _ = std::fs::remove_dir_all(&temp_dir);
        outcome
    }

    fn run_process(
        &self,
        job: &Job,
        temp_dir: &Path,
        adapter: Arc<dyn DownloaderAdapter>,
        initial_ctx: AdapterContext,
        control: &JobControl,
        on_event: &mut impl FnMut(SupervisorEvent),
    ) -> SupervisorOutcome {
        let spec = match adapter.build(job, temp_dir) {
            Ok(spec) => spec,
            Err(err) => {
                return SupervisorOutcome::Failure {
                    code: ErrorCode::InvalidInput,
                    message: format!("failed to build process spec: {err:#}"),
                };
            }
        };

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                return SupervisorOutcome::Failure {
                    code: ErrorCode::InternalError,
                    message: format!("failed to spawn {}: {err}", spec.program.display()),
                };
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (tx, rx) = line_reader::new_channel();
        if let Some(stdout) = stdout {
            spawn_line_pump(StreamSource::Stdout, stdout, tx.clone());
        }
        if let Some(stderr) = stderr {
            spawn_line_pump(StreamSource::Stderr, stderr, tx.clone());
        }
        drop(tx);

        let mut ctx = initial_ctx;
        let mut stderr_tail: std::collections::VecDeque<String> =
            std::collections::VecDeque::with_capacity(STDERR_TAIL_LINES);
        let mut watchdog = Watchdog::new(self.config.watchdog_stall);
        let deadline = Instant::now() + self.config.job_timeout;
        let mut stdout_closed = false;
        let mut stderr_closed = false;
        let mut last_stage = None;

        loop {
            if control.cancel.load(Ordering::Acquire) || control.pause.load(Ordering::Acquire) {
                terminate_gracefully(&mut child, self.config.grace_timeout);
                return SupervisorOutcome::Cancelled;
            }
            if Instant::now() >= deadline {
                terminate_gracefully(&mut child, self.config.grace_timeout);
                return SupervisorOutcome::Failure {
                    code: ErrorCode::Timeout,
                    message: "job exceeded its hard deadline".to_string(),
                };
            }
            if watchdog.is_stalled(last_stage) {
                terminate_gracefully(&mut child, self.config.grace_timeout);
                return SupervisorOutcome::Failure {
                    code: ErrorCode::WatchdogStall,
                    message: "adapter stopped producing progress".to_string(),
                };
            }

            match rx.recv_timeout(POLL_TICK) {
                Ok(LineMessage::Line(source, line)) => {
                    if source == StreamSource::Stderr {
                        if stderr_tail.len() == STDERR_TAIL_LINES {
                            stderr_tail.pop_front();
                        }
                        stderr_tail.push_back(line.clone());
                    }
                    if let Some(delta) = adapter.parse_line(&line, &mut ctx) {
                        last_stage = delta.stage.or(last_stage);
                        if let Some(progress) = delta.progress {
                            watchdog.observe(progress);
                        }
                        on_event(SupervisorEvent::Progress(clamp_interim(delta)));
                    } else {
                        on_event(SupervisorEvent::Log {
                            level: LogLevel::Debug,
                            message: line,
                        });
                    }
                }
                Ok(LineMessage::Closed(StreamSource::Stdout)) => stdout_closed = true,
                Ok(LineMessage::Closed(StreamSource::Stderr)) => stderr_closed = true,
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    stdout_closed = true;
                    stderr_closed = true;
                }
            }

            if stdout_closed && stderr_closed {
                match child.try_wait() {
                    Ok(Some(_)) => break,
                    Ok(None) => continue,
                    Err(_) => break,
                }
            }
        }

        let status = match child.wait() {
            Ok(status) => status,
            Err(err) => {
                return SupervisorOutcome::Failure {
                    code: ErrorCode::InternalError,
                    message: format!("failed to wait for child: {err}"),
                };
            }
        };

        if status.success() {
            match adapter.collect_artifact(temp_dir) {
                Ok(artifact) => SupervisorOutcome::Success {
                    filename: artifact.filename,
                    output_path: artifact.path,
                    size: artifact.size,
                },
                Err(err) => SupervisorOutcome::Failure {
                    code: ErrorCode::InternalError,
                    message: format!("failed to collect output: {err:#}"),
                },
            }
        } else {
            let tail: String = stderr_tail.into_iter().collect::<Vec<_>>().join("\n");
            let code = adapter.classify_error(status.code(), &tail);
            SupervisorOutcome::Failure {
                code,
                message: if tail.is_empty() {
                    format!("process exited with {status}")
                } else {
                    tail
                },
            }
        }
    }

    fn run_polling(
        &self,
        job: &Job,
        temp_dir: &Path,
        adapter: Arc<dyn adapter::PollingAdapter>,
        control: &JobControl,
        on_event: &mut impl FnMut(SupervisorEvent),
    ) -> SupervisorOutcome {
        let handle = match adapter.start(job, temp_dir) {
            Ok(handle) => handle,
            Err(err) => {
                return SupervisorOutcome::Failure {
                    code: ErrorCode::NetworkError,
                    message: format!("failed to start download: {err:#}"),
                };
            }
        };

        let mut watchdog = Watchdog::new(self.config.watchdog_stall);
        let deadline = Instant::now() + self.config.job_timeout;

        loop {
            if control.cancel.load(Ordering::Acquire) || control.pause.load(Ordering::Acquire) {
                let _ = adapter.cancel(&handle);
                return SupervisorOutcome::Cancelled;
            }
            if Instant::now() >= deadline {
                let _ = adapter.cancel(&handle);
                return SupervisorOutcome::Failure {
                    code: ErrorCode::Timeout,
                    message: "job exceeded its hard deadline".to_string(),
                };
            }

            std::thread::sleep(self.config.poll_interval);

            let snapshot = match adapter.poll(&handle) {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    return SupervisorOutcome::Failure {
                        code: ErrorCode::NetworkError,
                        message: format!("poll failed: {err:#}"),
                    };
                }
            };

            match snapshot.state {
                PollState::Active => {
                    let delta = snapshot_to_delta(&snapshot);
                    if let Some(progress) = delta.progress {
                        watchdog.observe(progress);
                    }
                    if watchdog.is_stalled(Some(crate::domain::Stage::Download)) {
                        let _ = adapter.cancel(&handle);
                        return SupervisorOutcome::Failure {
                            code: ErrorCode::WatchdogStall,
                            message: "adapter stopped producing progress".to_string(),
                        };
                    }
                    on_event(SupervisorEvent::Progress(clamp_interim(delta)));
                }
                PollState::Complete => {
                    let artifact = snapshot.files.into_iter().next();
                    return match artifact {
                        Some(artifact) => SupervisorOutcome::Success {
                            filename: artifact.filename,
                            output_path: artifact.path,
                            size: artifact.size,
                        },
                        None => SupervisorOutcome::Failure {
                            code: ErrorCode::InternalError,
                            message: "daemon reported completion with no files".to_string(),
                        },
                    };
                }
                PollState::Error | PollState::Removed => {
                    return SupervisorOutcome::Failure {
                        code: ErrorCode::NetworkError,
                        message: snapshot
                            .error_message
                            .unwrap_or_else(|| "download failed".to_string()),
                    };
                }
            }
        }
    }

    /// Second phase (§4.4): probe the just-downloaded file's duration and
    /// re-run the process loop against ffmpeg, reporting `Stage=transcode`.
    /// The probe seeds the adapter's context so `out_time_ms` lines can be
    /// turned into a percent from the first line onward.
    fn run_transcode_stage(
        &self,
        job: &Job,
        temp_dir: &Path,
        downloaded_path: &Path,
        control: &JobControl,
        on_event: &mut impl FnMut(SupervisorEvent),
    ) -> SupervisorOutcome {
        let transcode_adapter = self.registry.transcode_adapter(downloaded_path.to_path_buf());
        let duration = match transcode_adapter.probe_duration() {
            Ok(duration) if duration > 0.0 => duration,
            Ok(_) => {
                return SupervisorOutcome::Failure {
                    code: ErrorCode::InternalError,
                    message: "ffprobe reported a non-positive duration".to_string(),
                };
            }
            Err(err) => {
                return SupervisorOutcome::Failure {
                    code: ErrorCode::InternalError,
                    message: format!("failed to probe input duration: {err:#}"),
                };
            }
        };
        let ctx = AdapterContext {
            probed_duration_secs: Some(duration),
            ..AdapterContext::default()
        };
        self.run_process(job, temp_dir, Arc::new(transcode_adapter), ctx, control, on_event)
    }
}

/// Whether a successful run of this kind's primary adapter can be assumed
/// to have produced a single video file worth feeding to ffmpeg. Twitter
/// and Pinterest bundles may mix images and videos, so transcode is only
/// auto-chained for the kinds that always resolve to one media file.
fn kind_produces_video(kind: crate::domain::Kind) -> bool {
    matches!(kind, crate::domain::Kind::Youtube | crate::domain::Kind::Hls | crate::domain::Kind::File)
}

/// Clamp progress to `[0, 95]` until the finalize phase (§4.4 step 4):
/// the remaining headroom is reserved for the atomic move and terminal
/// event so `completed` always reads as a jump to exactly 100.
fn clamp_interim(mut delta: ProgressDelta) -> ProgressDelta {
    if let Some(progress) = delta.progress.as_mut() {
        *progress = progress.clamp(0.0, 95.0);
    }
    delta
}

fn terminate_gracefully(child: &mut std::process::Child, grace_timeout: Duration) {
    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(b"\n");
        let _ = stdin.flush();
    }
    let deadline = Instant::now() + grace_timeout;
    while Instant::now() < deadline {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => std::thread::sleep(Duration::from_millis(50)),
            Err(_) => return,
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

/// Atomically move the artifact from `tempDir` to `dataDir` (§4.4 step 7).
/// Rename on the same volume is required; cross-volume moves fall back to
/// copy+fsync+rename.
fn finalize_artifact(from: &Path, data_dir: &Path, filename: &str) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(data_dir)?;
    let destination = data_dir.join(filename);
    match std::fs::rename(from, &destination) {
        Ok(()) => Ok(destination),
        // Same-volume renames should always succeed; a failure here is
        // almost always a cross-device move (EXDEV), which `ErrorKind`
        // does not expose a stable variant for. Fall back to copy+rename
        // whenever the source is still there to move.
        Err(_err) if from.exists() => {
            copy_fsync_rename(from, &destination)?;
            Ok(destination)
        }
        Err(err) => Err(err),
    }
}

fn copy_fsync_rename(from: &Path, destination: &Path) -> std::io::Result<()> {
    let staging = destination.with_extension("partial");
    {
        let mut src = std::fs::File::open(from)?;
        let mut dst = std::fs::File::create(&staging)?;
        std::io::copy(&mut src, &mut dst)?;
        dst.sync_all()?;
    }
    std::fs::rename(&staging, destination)?;
    std::fs::remove_file(from).ok();
    Ok(())
}
