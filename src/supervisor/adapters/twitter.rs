//! twmd-style adapter (`twitter` kind): file-count-based progress estimate,
//! since the underlying tool does not report byte-level progress.
//!
//! Progress estimation here is non-monotonic under some tool outputs (§9
//! open question); mid-run progress is capped at 95 and the jump to 100 is
//! reserved for the terminal event, which both bounds the error and
//! preserves "completed implies 100".

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::Config;
use crate::domain::{Job, ProgressDelta, Stage};
use crate::error::ErrorCode;
use crate::supervisor::adapter::{AdapterContext, Artifact, DownloaderAdapter, ProcessSpec};

static TOTAL_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)found\s+(?P<total>\d+)\s+media\s+item").expect("valid regex"));
static SAVED_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)saved\s+.*?(?P<n>\d+)\s*/\s*(?P<total>\d+)").expect("valid regex"));

pub struct TwitterAdapter {
    twmd_path: PathBuf,
}

impl TwitterAdapter {
    pub fn new(config: &Config) -> Self {
        Self {
            twmd_path: config.twmd_path.clone(),
        }
    }
}

impl DownloaderAdapter for TwitterAdapter {
    fn build(&self, job: &Job, work_dir: &Path) -> anyhow::Result<ProcessSpec> {
        let twitter = job
            .options
            .twitter
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("twitter job submitted without twitter options"))?;
        let mut args = vec!["-o".to_string(), work_dir.display().to_string()];
        if let Some(tweet_id) = &twitter.tweet_id {
            args.push("--tweet".to_string());
            args.push(tweet_id.clone());
        } else if let Some(username) = &twitter.username {
            args.push("--user".to_string());
            args.push(username.clone());
        }
        args.push("--max".to_string());
        args.push(twitter.max_tweets.to_string());
        if twitter.include_retweets {
            args.push("--include-retweets".to_string());
        }
        let media_flag = match twitter.media_type {
            crate::domain::MediaType::All => "all",
            crate::domain::MediaType::Images => "images",
            crate::domain::MediaType::Videos => "videos",
        };
        args.push("--media".to_string());
        args.push(media_flag.to_string());
        Ok(ProcessSpec {
            program: self.twmd_path.clone(),
            args,
            env: Vec::new(),
            working_dir: work_dir.to_path_buf(),
        })
    }

    fn parse_line(&self, line: &str, ctx: &mut AdapterContext) -> Option<ProgressDelta> {
        if let Some(caps) = TOTAL_LINE.captures(line) {
            let total: u64 = caps.name("total")?.as_str().parse().ok()?;
            ctx.total_file_count = Some(total);
            return Some(ProgressDelta {
                stage: Some(Stage::Download),
                progress: Some(0.0),
                ..Default::default()
            });
        }
        if let Some(caps) = SAVED_LINE.captures(line) {
            let n: u64 = caps.name("n")?.as_str().parse().ok()?;
            let total: u64 = caps.name("total")?.as_str().parse().ok()?;
            ctx.files_seen = n;
            ctx.total_file_count = Some(total);
            let raw = if total > 0 {
                100.0 * n as f64 / total as f64
            } else {
                0.0
            };
            return Some(ProgressDelta {
                stage: Some(Stage::Download),
                progress: Some(raw.min(95.0)),
                ..Default::default()
            });
        }
        None
    }

    fn classify_error(&self, _exit_code: Option<i32>, stderr_tail: &str) -> ErrorCode {
        let lower = stderr_tail.to_lowercase();
        if lower.contains("tweet not found") || lower.contains("no longer exists") {
            ErrorCode::TweetUnavailable
        } else if lower.contains("user not found") || lower.contains("does not exist") {
            ErrorCode::UserNotFound
        } else if lower.contains("no media") || lower.contains("0 media items") {
            ErrorCode::NoImagesFound
        } else if lower.contains("login") || lower.contains("authentication") {
            ErrorCode::AuthRequired
        } else if lower.contains("network") || lower.contains("timed out") {
            ErrorCode::NetworkError
        } else {
            ErrorCode::InternalError
        }
    }

    fn collect_artifact(&self, work_dir: &Path) -> anyhow::Result<Artifact> {
        super::bundle::collect_bundle(work_dir, "twitter-media")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_mid_run_progress_at_95() {
        let adapter = TwitterAdapter::new(&Config::from_env());
        let mut ctx = AdapterContext::default();
        let delta = adapter
            .parse_line("saved media 198/200", &mut ctx)
            .expect("should parse");
        assert!(delta.progress.unwrap() <= 95.0);
    }
}
