use serde::{Deserialize, Serialize};

use super::job::{JobId, Stage, Status};
use crate::error::ErrorCode;

/// A room is a subscription key of the form `job:<JobID>`.
pub fn room_for(job_id: JobId) -> String {
    format!("job:{job_id}")
}

/// A typed event carrying its room alongside the payload, for EventBus
/// internals and for `Broadcast` (which has no single room).
#[derive(Debug, Clone)]
pub struct RoomEvent {
    pub room: String,
    pub payload: EventPayload,
}

/// Wire shapes fixed by §6. Tagged by `type` so a single JSON stream can
/// carry any of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EventPayload {
    Progress(ProgressEvent),
    Log(LogEvent),
    Completed(CompletedEvent),
    Failed(FailedEvent),
    JobUpdate(JobUpdateEvent),
}

impl EventPayload {
    pub fn job_id(&self) -> JobId {
        match self {
            EventPayload::Progress(e) => e.job_id,
            EventPayload::Log(e) => e.job_id,
            EventPayload::Completed(e) => e.job_id,
            EventPayload::Failed(e) => e.job_id,
            EventPayload::JobUpdate(e) => e.job_id,
        }
    }

    /// Terminal events (`completed`/`failed`) are guaranteed to be the last
    /// events emitted for a run (§5 ordering guarantee 2).
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventPayload::Completed(_) | EventPayload::Failed(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub stage: Stage,
    pub progress: f64,
    pub speed: Option<String>,
    pub eta: Option<u64>,
    pub total_bytes: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    pub job_id: JobId,
    pub timestamp: i64,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedEvent {
    pub job_id: JobId,
    pub filename: String,
    pub size: Option<u64>,
    pub output_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedEvent {
    pub job_id: JobId,
    pub error_code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobUpdateEvent {
    pub job_id: JobId,
    pub status: Option<Status>,
    pub stage: Option<Stage>,
    pub progress: Option<f64>,
}

/// What one parsed line of adapter output turns into. `None` fields mean
/// "unchanged" when folded into ProgressPipeline's per-job latest record.
#[derive(Debug, Clone, Default)]
pub struct ProgressDelta {
    pub progress: Option<f64>,
    pub stage: Option<Stage>,
    pub speed: Option<String>,
    pub eta: Option<u64>,
    pub total_bytes: Option<u64>,
    pub phase_message: Option<String>,
}
