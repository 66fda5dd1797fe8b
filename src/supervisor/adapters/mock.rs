//! A scripted [`DownloaderAdapter`] that drives `ProcessSupervisor` through
//! a real, trivial child process instead of a real downloader, so
//! orchestrator-level tests can exercise progress streaming, cancellation,
//! watchdog stalls and retries end to end.
//!
//! Not behind `cfg(test)`: integration tests under `tests/` run in a
//! separate compilation unit and need this available as ordinary crate
//! surface, the way this codebase's mock-`ffmpeg` test harness substitutes
//! for a real transcoder without being a `#[cfg(test)]`-only item.

use std::path::Path;

use crate::domain::{Job, ProgressDelta, Stage};
use crate::error::ErrorCode;
use crate::supervisor::adapter::{AdapterContext, Artifact, DownloaderAdapter, ProcessSpec};

#[derive(Debug, Clone)]
pub enum MockOutcome {
    Success { filename: String, size: u64 },
    Failure { code: ErrorCode },
}

/// Emits `PROGRESS:<pct>` lines on stdout at a fixed cadence, then exits
/// with a code matching the scripted outcome. `parse_line` only ever needs
/// to understand that one line shape.
pub struct MockAdapter {
    ticks: u32,
    tick_delay: std::time::Duration,
    outcome: MockOutcome,
    /// When set, the child never exits on its own (sleeps far longer than
    /// any test timeout), so the only way the run ends is cancellation, the
    /// watchdog, or the hard deadline.
    hang_after_ticks: bool,
}

impl MockAdapter {
    pub fn happy_path(ticks: u32, filename: impl Into<String>, size: u64) -> Self {
        Self {
            ticks,
            tick_delay: std::time::Duration::from_millis(15),
            outcome: MockOutcome::Success {
                filename: filename.into(),
                size,
            },
            hang_after_ticks: false,
        }
    }

    pub fn failing_after(ticks: u32, code: ErrorCode) -> Self {
        Self {
            ticks,
            tick_delay: std::time::Duration::from_millis(15),
            outcome: MockOutcome::Failure { code },
            hang_after_ticks: false,
        }
    }

    /// Emits `ticks` progress events and then goes silent forever without
    /// exiting, to exercise the watchdog stall path.
    pub fn stalling_after(ticks: u32) -> Self {
        Self {
            ticks,
            tick_delay: std::time::Duration::from_millis(15),
            outcome: MockOutcome::Failure {
                code: ErrorCode::WatchdogStall,
            },
            hang_after_ticks: true,
        }
    }

    /// Never emits progress and never exits; exercises `Cancel`/`Pause`
    /// against a job stuck at `Stage=queue`→`running` with no signal yet.
    pub fn silent() -> Self {
        Self {
            ticks: 0,
            tick_delay: std::time::Duration::from_millis(15),
            outcome: MockOutcome::Failure {
                code: ErrorCode::InternalError,
            },
            hang_after_ticks: true,
        }
    }
}

impl DownloaderAdapter for MockAdapter {
    fn build(&self, _job: &Job, work_dir: &Path) -> anyhow::Result<ProcessSpec> {
        let mut script = String::new();
        for i in 1..=self.ticks {
            let pct = 100.0 * i as f64 / self.ticks as f64;
            script.push_str(&format!("echo PROGRESS:{pct}\n"));
            script.push_str(&format!("sleep {}\n", self.tick_delay.as_secs_f64()));
        }
        if self.hang_after_ticks {
            script.push_str("sleep 600\n");
        } else {
            let exit_code = match self.outcome {
                MockOutcome::Success { .. } => 0,
                MockOutcome::Failure { .. } => 1,
            };
            script.push_str(&format!("exit {exit_code}\n"));
        }
        Ok(ProcessSpec {
            program: "/bin/sh".into(),
            args: vec!["-c".to_string(), script],
            env: Vec::new(),
            working_dir: work_dir.to_path_buf(),
        })
    }

    fn parse_line(&self, line: &str, _ctx: &mut AdapterContext) -> Option<ProgressDelta> {
        let pct: f64 = line.strip_prefix("PROGRESS:")?.parse().ok()?;
        Some(ProgressDelta {
            progress: Some(pct),
            stage: Some(Stage::Download),
            ..Default::default()
        })
    }

    fn classify_error(&self, _exit_code: Option<i32>, _stderr_tail: &str) -> ErrorCode {
        match &self.outcome {
            MockOutcome::Failure { code } => *code,
            MockOutcome::Success { .. } => ErrorCode::InternalError,
        }
    }

    fn collect_artifact(&self, work_dir: &Path) -> anyhow::Result<Artifact> {
        match &self.outcome {
            MockOutcome::Success { filename, size } => {
                let path = work_dir.join(filename);
                std::fs::write(&path, vec![0u8; *size as usize])?;
                Ok(Artifact {
                    filename: filename.clone(),
                    path,
                    size: Some(*size),
                })
            }
            MockOutcome::Failure { .. } => anyhow::bail!("mock adapter scripted a failure"),
        }
    }
}
