//! pinterest-dl-style adapter (`pinterest` kind): percent from explicit
//! `NN%` markers, falling back to a saved/total counter ratio.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::Config;
use crate::domain::{Job, ProgressDelta, Stage};
use crate::error::ErrorCode;
use crate::supervisor::adapter::{AdapterContext, Artifact, DownloaderAdapter, ProcessSpec};

static PERCENT_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?P<pct>\d+(?:\.\d+)?)%").expect("valid regex"));
static COUNTER_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)downloaded\s+(?P<n>\d+)\s*/\s*(?P<total>\d+)").expect("valid regex"));

pub struct PinterestAdapter {
    pinterest_dl_path: PathBuf,
}

impl PinterestAdapter {
    pub fn new(config: &Config) -> Self {
        Self {
            pinterest_dl_path: config.pinterest_dl_path.clone(),
        }
    }
}

impl DownloaderAdapter for PinterestAdapter {
    fn build(&self, job: &Job, work_dir: &Path) -> anyhow::Result<ProcessSpec> {
        let pinterest = job
            .options
            .pinterest
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("pinterest job submitted without pinterest options"))?;
        let mut args = vec![
            job.url.clone(),
            "-o".to_string(),
            work_dir.display().to_string(),
            "--max-images".to_string(),
            pinterest.max_images.to_string(),
        ];
        if pinterest.include_videos {
            args.push("--include-videos".to_string());
        }
        if let Some(resolution) = &pinterest.resolution {
            args.push("--resolution".to_string());
            args.push(resolution.clone());
        }
        Ok(ProcessSpec {
            program: self.pinterest_dl_path.clone(),
            args,
            env: Vec::new(),
            working_dir: work_dir.to_path_buf(),
        })
    }

    fn parse_line(&self, line: &str, ctx: &mut AdapterContext) -> Option<ProgressDelta> {
        if let Some(caps) = COUNTER_LINE.captures(line) {
            let n: u64 = caps.name("n")?.as_str().parse().ok()?;
            let total: u64 = caps.name("total")?.as_str().parse().ok()?;
            ctx.files_seen = n;
            ctx.total_file_count = Some(total);
            let raw = if total > 0 { 100.0 * n as f64 / total as f64 } else { 0.0 };
            return Some(ProgressDelta {
                stage: Some(Stage::Download),
                progress: Some(raw.min(95.0)),
                ..Default::default()
            });
        }
        if let Some(caps) = PERCENT_MARKER.captures(line) {
            let pct: f64 = caps.name("pct")?.as_str().parse().ok()?;
            return Some(ProgressDelta {
                stage: Some(Stage::Download),
                progress: Some(pct.min(95.0)),
                ..Default::default()
            });
        }
        None
    }

    fn classify_error(&self, _exit_code: Option<i32>, stderr_tail: &str) -> ErrorCode {
        let lower = stderr_tail.to_lowercase();
        if lower.contains("no images found") || lower.contains("board is empty") {
            ErrorCode::NoImagesFound
        } else if lower.contains("invalid url") || lower.contains("not a pinterest") {
            ErrorCode::InvalidUrl
        } else if lower.contains("network") || lower.contains("timed out") {
            ErrorCode::NetworkError
        } else {
            ErrorCode::InternalError
        }
    }

    fn collect_artifact(&self, work_dir: &Path) -> anyhow::Result<Artifact> {
        super::bundle::collect_bundle(work_dir, "pinterest-media")
    }
}
