//! The Job entity, its submission payload, and the event payloads published
//! through the EventBus. Kept free of any component's internal state so it
//! can be shared by JobStore, Broker, ProcessSupervisor and Orchestrator
//! without a dependency cycle.

mod events;
mod job;

pub use events::{
    CompletedEvent, EventPayload, FailedEvent, JobUpdateEvent, LogEvent, LogLevel, ProgressDelta,
    ProgressEvent, RoomEvent, room_for,
};
pub use job::{
    Codec, Container, CreateReq, Headers, Job, JobId, Kind, MediaType, Options, PinterestOptions,
    Priority, Stage, Status, TranscodeOptions, TwitterOptions, now_millis,
};
