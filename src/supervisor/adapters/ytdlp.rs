//! yt-dlp-style adapter, used for `youtube` and `hls` (with a
//! `best[ext=mp4]` format selector for the latter) per the §4.4 kind table.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::Config;
use crate::domain::{Job, ProgressDelta, Stage};
use crate::error::ErrorCode;
use crate::supervisor::adapter::{AdapterContext, Artifact, DownloaderAdapter, ProcessSpec};

static PROGRESS_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)
        \[download\]\s+
        (?P<pct>\d+(?:\.\d+)?)%
        \s+of\s+~?\s*(?P<size>[\d.]+)(?P<unit>[KMGT]i?B)
        (?:.*?at\s+(?P<speed>[\d.]+(?:[KMGT]i?B/s|B/s)|Unknown\sspeed))?
        (?:.*?ETA\s+(?P<eta>[\d:]+))?
        ",
    )
    .expect("static yt-dlp progress regex is valid")
});

static DESTINATION_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[download\] Destination:\s*(?P<path>.+)$").expect("valid regex"));

static ALREADY_DOWNLOADED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[download\]\s+(?P<path>.+) has already been downloaded$").expect("valid regex"));

pub struct YtdlpAdapter {
    pub hls_format_selector: bool,
    ytdlp_path: PathBuf,
}

impl YtdlpAdapter {
    pub fn youtube(config: &Config) -> Self {
        Self {
            hls_format_selector: false,
            ytdlp_path: config.ytdlp_path.clone(),
        }
    }

    pub fn hls(config: &Config) -> Self {
        Self {
            hls_format_selector: true,
            ytdlp_path: config.ytdlp_path.clone(),
        }
    }
}

impl DownloaderAdapter for YtdlpAdapter {
    fn build(&self, job: &Job, work_dir: &Path) -> anyhow::Result<ProcessSpec> {
        let mut args = vec![
            "--newline".to_string(),
            "--no-colors".to_string(),
            "-o".to_string(),
            "%(title)s.%(ext)s".to_string(),
        ];
        if self.hls_format_selector {
            args.push("-f".to_string());
            args.push("best[ext=mp4]".to_string());
        }
        if let Some(ua) = &job.options.headers.ua {
            args.push("--user-agent".to_string());
            args.push(ua.clone());
        }
        if let Some(referer) = &job.options.headers.referer {
            args.push("--referer".to_string());
            args.push(referer.clone());
        }
        args.push(job.url.clone());
        Ok(ProcessSpec {
            program: self.ytdlp_path.clone(),
            args,
            env: Vec::new(),
            working_dir: work_dir.to_path_buf(),
        })
    }

    fn parse_line(&self, line: &str, _ctx: &mut AdapterContext) -> Option<ProgressDelta> {
        if let Some(caps) = PROGRESS_LINE.captures(line) {
            let progress: f64 = caps.name("pct")?.as_str().parse().ok()?;
            let size: f64 = caps.name("size")?.as_str().parse().ok()?;
            let unit = caps.name("unit")?.as_str();
            let total_bytes = Some((size * unit_multiplier(unit)) as u64);
            let speed = caps
                .name("speed")
                .map(|m| m.as_str().to_string())
                .filter(|s| s != "Unknown speed");
            let eta = caps.name("eta").and_then(|m| parse_eta(m.as_str()));
            return Some(ProgressDelta {
                progress: Some(progress),
                stage: Some(Stage::Download),
                speed,
                eta,
                total_bytes,
                phase_message: None,
            });
        }
        if DESTINATION_LINE.is_match(line) || ALREADY_DOWNLOADED.is_match(line) {
            return Some(ProgressDelta {
                stage: Some(Stage::Download),
                ..Default::default()
            });
        }
        None
    }

    fn classify_error(&self, exit_code: Option<i32>, stderr_tail: &str) -> ErrorCode {
        let lower = stderr_tail.to_lowercase();
        if lower.contains("video unavailable") || lower.contains("this video is private") {
            ErrorCode::VideoUnavailable
        } else if lower.contains("requested format not available") {
            ErrorCode::FormatError
        } else if lower.contains("sign in") || lower.contains("login required") {
            ErrorCode::AuthRequired
        } else if lower.contains("unable to download webpage")
            || lower.contains("connection")
            || lower.contains("timed out")
        {
            ErrorCode::NetworkError
        } else if exit_code == Some(0) {
            ErrorCode::InternalError
        } else {
            ErrorCode::InternalError
        }
    }

    fn collect_artifact(&self, work_dir: &Path) -> anyhow::Result<Artifact> {
        collect_single_file(work_dir)
    }
}

fn unit_multiplier(unit: &str) -> f64 {
    let base: f64 = if unit.ends_with("iB") { 1024.0 } else { 1000.0 };
    match unit.chars().next().unwrap_or('B') {
        'K' => base,
        'M' => base * base,
        'G' => base * base * base,
        'T' => base * base * base * base,
        _ => 1.0,
    }
}

fn parse_eta(text: &str) -> Option<u64> {
    let parts: Vec<&str> = text.split(':').collect();
    let mut seconds: u64 = 0;
    for part in parts {
        seconds = seconds * 60 + part.parse::<u64>().ok()?;
    }
    Some(seconds)
}

/// Shared by the adapters that produce exactly one output file into
/// `work_dir`: return it, preferring the most recently modified entry. Also
/// used by [`super::bundle::collect_bundle`] for its single-file case.
pub fn collect_single_file(work_dir: &Path) -> anyhow::Result<Artifact> {
    let mut best: Option<(PathBuf, std::time::SystemTime, u64)> = None;
    for entry in std::fs::read_dir(work_dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH);
        if best.as_ref().is_none_or(|(_, m, _)| modified > *m) {
            best = Some((entry.path(), modified, meta.len()));
        }
    }
    let (path, _, size) = best.ok_or_else(|| anyhow::anyhow!("no output file produced in {work_dir:?}"))?;
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("output")
        .to_string();
    Ok(Artifact {
        filename,
        path,
        size: Some(size),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_progress_with_size_and_eta() {
        let adapter = YtdlpAdapter::youtube(&Config::from_env());
        let mut ctx = AdapterContext::default();
        let delta = adapter
            .parse_line(
                "[download]  42.5% of   10.00MiB at    1.20MiB/s ETA 00:05",
                &mut ctx,
            )
            .expect("should parse");
        assert_eq!(delta.progress, Some(42.5));
        assert_eq!(delta.eta, Some(5));
        assert!(delta.total_bytes.unwrap() > 10_000_000);
    }

    #[test]
    fn ignores_unrelated_lines() {
        let adapter = YtdlpAdapter::youtube(&Config::from_env());
        let mut ctx = AdapterContext::default();
        assert!(adapter.parse_line("[info] Writing metadata", &mut ctx).is_none());
    }
}
