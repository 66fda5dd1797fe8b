use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorCode;

/// Globally unique opaque job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// One of the concrete downloader families, or `auto` (resolved to a
/// concrete kind by [`crate::orchestrator::validation::sniff_kind`] at
/// submission time).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Auto,
    File,
    Hls,
    Youtube,
    Twitter,
    Pinterest,
}

impl Kind {
    /// The priority class a fresh submission of this kind gets by default
    /// (§4.3). `Auto` never reaches the Broker directly: it is resolved
    /// during validation.
    pub fn default_priority(self) -> Priority {
        match self {
            Kind::Youtube | Kind::Hls => Priority::High,
            Kind::File | Kind::Twitter | Kind::Pinterest | Kind::Auto => Priority::Normal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Normal = 3,
    High = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Queue,
    Download,
    Merge,
    Transcode,
    Finalize,
    Completed,
}

/// Transcode post-processing options embedded in [`Options`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscodeOptions {
    pub to: Container,
    pub codec: Codec,
    pub crf: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    Mp4,
    Webm,
    Avi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    H264,
    H265,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    All,
    Images,
    Videos,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TwitterOptions {
    pub tweet_id: Option<String>,
    pub username: Option<String>,
    pub media_type: MediaType,
    #[serde(default)]
    pub include_retweets: bool,
    pub max_tweets: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinterestOptions {
    pub max_images: u32,
    #[serde(default)]
    pub include_videos: bool,
    pub resolution: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Headers {
    pub ua: Option<String>,
    pub referer: Option<String>,
    #[serde(default)]
    pub extra: std::collections::BTreeMap<String, String>,
}

/// The opaque submission payload. Immutable after submission (§3 invariant 5).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Options {
    #[serde(default)]
    pub headers: Headers,
    pub transcode: Option<TranscodeOptions>,
    #[serde(default)]
    pub filename_hint: String,
    pub twitter: Option<TwitterOptions>,
    pub pinterest: Option<PinterestOptions>,
}

/// The request shape accepted by `Orchestrator::submit` (§6).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateReq {
    pub url: String,
    #[serde(default = "default_kind")]
    pub kind: Kind,
    #[serde(flatten)]
    pub options: Options,
}

fn default_kind() -> Kind {
    Kind::Auto
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// The central entity: one row per submission (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub url: String,
    pub kind: Kind,
    pub status: Status,
    pub stage: Option<Stage>,
    pub progress: f64,
    pub speed: Option<String>,
    pub eta: Option<u64>,
    pub total_bytes: Option<u64>,
    pub filename: Option<String>,
    pub output_path: Option<String>,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
    pub options: Options,
    pub created_at: i64,
    pub updated_at: i64,
    /// Number of attempts made so far, including the current one. Not part
    /// of the public contract in §3 but required for Broker retry
    /// accounting and S4's "attempt counter = 2" assertion.
    #[serde(default = "default_attempt")]
    pub attempt: u32,
}

fn default_attempt() -> u32 {
    1
}

impl Job {
    pub fn new(id: JobId, url: String, kind: Kind, options: Options) -> Self {
        let now = now_millis();
        Self {
            id,
            url,
            kind,
            status: Status::Queued,
            stage: Some(Stage::Queue),
            progress: 0.0,
            speed: None,
            eta: None,
            total_bytes: None,
            filename: None,
            output_path: None,
            error_code: None,
            error_message: None,
            options,
            created_at: now,
            updated_at: now,
            attempt: 1,
        }
    }
}
