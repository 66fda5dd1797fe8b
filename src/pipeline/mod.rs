//! The single-writer throttled fan-in/fan-out (§4.5). This is the heart of
//! the live-update guarantee: EventBus fanout is never throttled, but
//! JobStore writes are bounded to at most one per `throttleInterval` per
//! job, and a terminal event always flushes (or discards) buffered state
//! before persisting.
//!
//! Per the re-architecture guidance against "shared mutable maps for
//! progress throttling": this keeps one small record per job, owned behind
//! its own lock, rather than a single mutex guarding every job's state. The
//! outer map only ever holds that lock long enough to look up or insert a
//! job's `Arc<Mutex<JobRecord>>`; the throttling fields themselves are
//! mutated under the per-job lock, so unrelated jobs never block on one
//! another. A lightweight background ticker plays the role of the one-shot
//! timer the source keeps per job; it does not block `on_progress`, so three
//! worker slots stay independent of one another.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use crate::bus::EventBus;
use crate::domain::{
    CompletedEvent, EventPayload, FailedEvent, JobId, JobUpdateEvent, ProgressDelta, ProgressEvent,
    Stage, Status,
};
use crate::store::JobStore;
use crate::sync_ext::MutexExt;

#[derive(Debug, Clone, Default)]
struct ProgressFields {
    stage: Option<Stage>,
    progress: f64,
    speed: Option<String>,
    eta: Option<u64>,
    total_bytes: Option<u64>,
}

impl ProgressFields {
    fn merge(&mut self, delta: &ProgressDelta) {
        if let Some(stage) = delta.stage {
            self.stage = Some(stage);
        }
        if let Some(progress) = delta.progress {
            self.progress = progress.clamp(0.0, 100.0);
        }
        if delta.speed.is_some() {
            self.speed = delta.speed.clone();
        }
        if delta.eta.is_some() {
            self.eta = delta.eta;
        }
        if delta.total_bytes.is_some() {
            self.total_bytes = delta.total_bytes;
        }
    }
}

struct JobRecord {
    current: ProgressFields,
    dirty: bool,
    flush_at: Option<Instant>,
    /// Set once a terminal event has removed this record from the map, so a
    /// ticker tick that grabbed a clone of the `Arc` just before the removal
    /// can't resurrect or flush stale progress for a job that's already done.
    terminal: bool,
}

impl Default for JobRecord {
    fn default() -> Self {
        Self {
            current: ProgressFields::default(),
            dirty: false,
            flush_at: None,
            terminal: false,
        }
    }
}

struct Inner {
    records: Mutex<HashMap<JobId, Arc<Mutex<JobRecord>>>>,
    bus: EventBus,
    store: Arc<dyn JobStore>,
    throttle_interval: Duration,
    shutdown: std::sync::atomic::AtomicBool,
}

impl Inner {
    /// Look up (or create) the per-job record, holding the map lock only
    /// long enough to do so. Callers then lock the returned `Arc` on its
    /// own, so unrelated jobs never contend for the same mutex.
    fn record_for(&self, job_id: JobId) -> Arc<Mutex<JobRecord>> {
        self.records
            .lock_unpoisoned()
            .entry(job_id)
            .or_insert_with(|| Arc::new(Mutex::new(JobRecord::default())))
            .clone()
    }
}

#[derive(Clone)]
pub struct ProgressPipeline {
    inner: Arc<Inner>,
}

impl ProgressPipeline {
    pub fn new(bus: EventBus, store: Arc<dyn JobStore>, throttle_interval: Duration) -> Self {
        let inner = Arc::new(Inner {
            records: Mutex::new(HashMap::new()),
            bus,
            store,
            throttle_interval,
            shutdown: std::sync::atomic::AtomicBool::new(false),
        });
        spawn_ticker(&inner);
        Self { inner }
    }

    /// Publish to EventBus unconditionally and immediately; buffer for the
    /// next throttled JobStore write.
    pub fn on_progress(&self, job_id: JobId, delta: ProgressDelta) {
        let record = self.inner.record_for(job_id);
        let snapshot = {
            let mut record = record.lock_unpoisoned();
            if record.terminal {
                record.current.clone()
            } else {
                record.current.merge(&delta);
                record.dirty = true;
                if record.flush_at.is_none() {
                    record.flush_at = Some(Instant::now() + self.inner.throttle_interval);
                }
                record.current.clone()
            }
        };

        self.inner.bus.publish(
            job_id,
            EventPayload::Progress(ProgressEvent {
                job_id,
                stage: snapshot.stage.unwrap_or(Stage::Download),
                progress: snapshot.progress,
                speed: snapshot.speed,
                eta: snapshot.eta,
                total_bytes: snapshot.total_bytes,
            }),
        );
    }

    /// Cancel the timer, drop any buffered progress (the terminal state
    /// supersedes it), persist, and publish.
    pub fn on_completed(&self, job_id: JobId, evt: CompletedEvent) {
        self.retire_record(job_id);
        if let Err(err) = self.inner.store.set_completed(
            job_id,
            evt.filename.clone(),
            evt.output_path.clone(),
            evt.size,
        ) {
            crate::debug_eprintln!("failed to persist terminal completion for {job_id}: {err}");
        }
        self.inner.bus.publish(job_id, EventPayload::Completed(evt));
    }

    pub fn on_failed(&self, job_id: JobId, evt: FailedEvent) {
        self.retire_record(job_id);
        if let Err(err) =
            self.inner
                .store
                .update_status(job_id, Status::Failed, Some(evt.error_code), Some(evt.message.clone()))
        {
            crate::debug_eprintln!("failed to persist terminal failure for {job_id}: {err}");
        }
        self.inner.bus.publish(job_id, EventPayload::Failed(evt));
    }

    pub fn on_job_update(&self, job_id: JobId, evt: JobUpdateEvent) {
        if let Some(status) = evt.status
            && let Err(err) = self.inner.store.update_status(job_id, status, None, None)
        {
            crate::debug_eprintln!("failed to persist status update for {job_id}: {err}");
        }
        if evt.stage.is_some() || evt.progress.is_some() {
            if let Err(err) = self.inner.store.update_progress(
                job_id,
                evt.progress.unwrap_or(0.0),
                evt.stage,
                None,
                None,
                None,
            ) {
                crate::debug_eprintln!("failed to persist progress update for {job_id}: {err}");
            }
        }
        self.inner.bus.publish(job_id, EventPayload::JobUpdate(evt));
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, std::sync::atomic::Ordering::Release);
    }

    /// Remove the job's record from the map and mark it terminal so a
    /// ticker tick racing this call (already holding its own clone of the
    /// `Arc`) discards rather than flushes stale progress.
    fn retire_record(&self, job_id: JobId) {
        let record = self.inner.records.lock_unpoisoned().remove(&job_id);
        if let Some(record) = record {
            let mut record = record.lock_unpoisoned();
            record.dirty = false;
            record.flush_at = None;
            record.terminal = true;
        }
    }
}

fn spawn_ticker(inner: &Arc<Inner>) {
    let inner = inner.clone();
    let tick = (inner.throttle_interval / 4).clamp(Duration::from_millis(5), Duration::from_millis(100));
    let result = thread::Builder::new()
        .name("fetchd-progress-pipeline".to_string())
        .spawn(move || {
            while !inner.shutdown.load(std::sync::atomic::Ordering::Acquire) {
                flush_due_records(&inner);
                thread::sleep(tick);
            }
        });
    if let Err(err) = result {
        crate::debug_eprintln!("failed to spawn progress pipeline ticker: {err}");
    }
}

fn flush_due_records(inner: &Arc<Inner>) {
    let now = Instant::now();
    // Snapshot the per-job `Arc`s under the map lock, then inspect/mutate
    // each one under its own lock — the map lock is never held while we
    // touch a job's throttling state, so a busy job never stalls the ticker
    // from checking its siblings.
    let snapshots: Vec<(JobId, Arc<Mutex<JobRecord>>)> = inner
        .records
        .lock_unpoisoned()
        .iter()
        .map(|(job_id, record)| (*job_id, record.clone()))
        .collect();

    let mut due = Vec::new();
    for (job_id, record) in snapshots {
        let mut record = record.lock_unpoisoned();
        if !record.terminal && record.dirty && record.flush_at.is_some_and(|deadline| deadline <= now) {
            due.push((job_id, record.current.clone()));
            record.dirty = false;
            record.flush_at = None;
        }
    }
    for (job_id, fields) in due {
        if let Err(err) = inner.store.update_progress(
            job_id,
            fields.progress,
            fields.stage,
            fields.speed,
            fields.eta,
            fields.total_bytes,
        ) {
            crate::debug_eprintln!("failed to persist throttled progress for {job_id}: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Job, Kind, Options};
    use crate::store::InMemoryJobStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingStore {
        inner: InMemoryJobStore,
        update_progress_calls: AtomicUsize,
    }

    impl JobStore for CountingStore {
        fn insert(&self, job: crate::domain::Job) -> Result<(), crate::store::StoreError> {
            self.inner.insert(job)
        }
        fn get(&self, id: JobId) -> Result<crate::domain::Job, crate::store::StoreError> {
            self.inner.get(id)
        }
        fn list(&self, filter: &crate::store::Filter, offset: usize, limit: usize) -> crate::store::Page {
            self.inner.list(filter, offset, limit)
        }
        fn update_progress(
            &self,
            id: JobId,
            progress: f64,
            stage: Option<Stage>,
            speed: Option<String>,
            eta: Option<u64>,
            total_bytes: Option<u64>,
        ) -> Result<(), crate::store::StoreError> {
            self.update_progress_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.update_progress(id, progress, stage, speed, eta, total_bytes)
        }
        fn update_status(
            &self,
            id: JobId,
            status: Status,
            error_code: Option<crate::error::ErrorCode>,
            error_message: Option<String>,
        ) -> Result<(), crate::store::StoreError> {
            self.inner.update_status(id, status, error_code, error_message)
        }
        fn set_completed(
            &self,
            id: JobId,
            filename: String,
            output_path: String,
            size: Option<u64>,
        ) -> Result<(), crate::store::StoreError> {
            self.inner.set_completed(id, filename, output_path, size)
        }
        fn record_attempt(&self, id: JobId, attempt: u32) -> Result<(), crate::store::StoreError> {
            self.inner.record_attempt(id, attempt)
        }
    }

    fn setup() -> (ProgressPipeline, Arc<CountingStore>, JobId) {
        let store = Arc::new(CountingStore {
            inner: InMemoryJobStore::new(),
            update_progress_calls: AtomicUsize::new(0),
        });
        let mut job = Job::new(JobId::new(), "https://example.test/a.bin".into(), Kind::File, Options::default());
        job.status = Status::Running;
        let job_id = job.id;
        store.insert(job).unwrap();
        let bus = EventBus::new(256);
        let pipeline = ProgressPipeline::new(bus, store.clone(), Duration::from_millis(200));
        (pipeline, store, job_id)
    }

    #[test]
    fn eventbus_receives_every_delta_even_when_store_is_throttled() {
        let (pipeline, store, job_id) = setup();
        let bus_sub = pipeline.inner.bus.subscribe_room(job_id);

        for i in 0..100 {
            pipeline.on_progress(
                job_id,
                ProgressDelta {
                    progress: Some(i as f64),
                    stage: Some(Stage::Download),
                    ..Default::default()
                },
            );
        }

        let mut received = 0;
        while bus_sub.try_recv().is_some() {
            received += 1;
        }
        assert_eq!(received, 100);
        assert!(store.update_progress_calls.load(Ordering::SeqCst) <= 6);
    }

    #[test]
    fn terminal_event_discards_buffered_progress_and_flushes_once() {
        let (pipeline, store, job_id) = setup();

        for i in 0..50 {
            pipeline.on_progress(
                job_id,
                ProgressDelta {
                    progress: Some(i as f64),
                    stage: Some(Stage::Download),
                    ..Default::default()
                },
            );
        }
        let calls_before_terminal = store.update_progress_calls.load(Ordering::SeqCst);

        pipeline.on_completed(
            job_id,
            CompletedEvent {
                job_id,
                filename: "a.bin".into(),
                size: Some(10),
                output_path: "/data/a.bin".into(),
            },
        );

        std::thread::sleep(Duration::from_millis(250));
        assert_eq!(
            store.update_progress_calls.load(Ordering::SeqCst),
            calls_before_terminal
        );
        let job = store.get(job_id).unwrap();
        assert_eq!(job.status, Status::Completed);
        assert_eq!(job.progress, 100.0);
    }
}
