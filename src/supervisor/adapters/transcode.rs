//! Transcode post-processing adapter. Runs when `Options.transcode` is
//! present and the download adapter produced a video (§4.4). Maps ffmpeg's
//! `out_time_ms=<µs>` progress-pipe lines to a percent against a probed
//! input duration; reported with `Stage=transcode`.

use std::path::Path;
use std::process::Command;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::Config;
use crate::domain::{Container, Job, ProgressDelta, Stage};
use crate::error::ErrorCode;
use crate::supervisor::adapter::{AdapterContext, Artifact, DownloaderAdapter, ProcessSpec};

static OUT_TIME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^out_time_ms=(?P<us>\d+)$").expect("valid regex"));
static PROGRESS_DONE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^progress=(?P<state>\w+)$").expect("valid regex"));

pub struct TranscodeAdapter {
    pub input_path: std::path::PathBuf,
    ffmpeg_path: std::path::PathBuf,
    ffprobe_path: std::path::PathBuf,
}

impl TranscodeAdapter {
    pub fn new(input_path: std::path::PathBuf, config: &Config) -> Self {
        Self {
            input_path,
            ffmpeg_path: config.ffmpeg_path.clone(),
            ffprobe_path: config.ffprobe_path.clone(),
        }
    }

    /// Probe the input's duration in seconds via ffprobe, used as the
    /// denominator for `out_time_ms` → percent.
    pub fn probe_duration(&self) -> anyhow::Result<f64> {
        let output = Command::new(&self.ffprobe_path)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(&self.input_path)
            .output()?;
        if !output.status.success() {
            anyhow::bail!("ffprobe exited with {:?}", output.status.code());
        }
        let text = String::from_utf8_lossy(&output.stdout);
        text.trim()
            .parse::<f64>()
            .map_err(|_| anyhow::anyhow!("ffprobe did not return a numeric duration"))
    }
}

impl DownloaderAdapter for TranscodeAdapter {
    fn build(&self, job: &Job, work_dir: &Path) -> anyhow::Result<ProcessSpec> {
        let transcode = job
            .options
            .transcode
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("transcode phase invoked without transcode options"))?;
        let codec_arg = match transcode.codec {
            crate::domain::Codec::H264 => "libx264",
            crate::domain::Codec::H265 => "libx265",
        };
        let ext = match transcode.to {
            Container::Mp4 => "mp4",
            Container::Webm => "webm",
            Container::Avi => "avi",
        };
        let output_path = work_dir.join(format!("transcoded.{ext}"));
        Ok(ProcessSpec {
            program: self.ffmpeg_path.clone(),
            args: vec![
                "-y".to_string(),
                "-i".to_string(),
                self.input_path.display().to_string(),
                "-c:v".to_string(),
                codec_arg.to_string(),
                "-crf".to_string(),
                transcode.crf.to_string(),
                "-progress".to_string(),
                "pipe:1".to_string(),
                "-nostats".to_string(),
                output_path.display().to_string(),
            ],
            env: Vec::new(),
            working_dir: work_dir.to_path_buf(),
        })
    }

    fn parse_line(&self, line: &str, ctx: &mut AdapterContext) -> Option<ProgressDelta> {
        if let Some(caps) = OUT_TIME.captures(line) {
            let micros: f64 = caps.name("us")?.as_str().parse().ok()?;
            let duration = ctx.probed_duration_secs?;
            if duration <= 0.0 {
                return None;
            }
            let progress = (100.0 * (micros / 1_000_000.0) / duration).clamp(0.0, 95.0);
            return Some(ProgressDelta {
                progress: Some(progress),
                stage: Some(Stage::Transcode),
                ..Default::default()
            });
        }
        if let Some(caps) = PROGRESS_DONE.captures(line)
            && caps.name("state").map(|m| m.as_str()) == Some("end")
        {
            return Some(ProgressDelta {
                stage: Some(Stage::Finalize),
                ..Default::default()
            });
        }
        None
    }

    fn classify_error(&self, _exit_code: Option<i32>, stderr_tail: &str) -> ErrorCode {
        let lower = stderr_tail.to_lowercase();
        if lower.contains("no space left") {
            ErrorCode::DiskFull
        } else if lower.contains("invalid data") || lower.contains("unsupported codec") {
            ErrorCode::FormatError
        } else {
            ErrorCode::InternalError
        }
    }

    fn collect_artifact(&self, work_dir: &Path) -> anyhow::Result<Artifact> {
        super::ytdlp::collect_single_file(work_dir)
    }
}
