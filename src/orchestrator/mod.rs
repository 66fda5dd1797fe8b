//! Public façade (§4.6): `Submit`, `Get`, `List`, `Cancel`, `Pause`,
//! `Resume`, `Retry`. Drives the job lifecycle and is the only component
//! that flips `Status` (§3 "Ownership"); it coordinates the Broker,
//! ProcessSupervisor, ProgressPipeline and JobStore without any of them
//! calling one another directly.

mod validation;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use crate::broker::{Broker, NackOutcome, ReservationToken};
use crate::bus::{EventBus, Subscription};
use crate::config::Config;
use crate::domain::{
    CompletedEvent, CreateReq, EventPayload, FailedEvent, Job, JobId, JobUpdateEvent, LogEvent,
    Stage, Status, now_millis,
};
use crate::error::{OrchestratorError, Result};
use crate::pipeline::ProgressPipeline;
use crate::store::{Filter, JobStore, Page, StoreError};
use crate::supervisor::adapters::AdapterRegistry;
use crate::supervisor::{JobControl, ProcessSupervisor, SupervisorEvent, SupervisorOutcome};
use crate::sync_ext::MutexExt;

struct Inner {
    config: Config,
    store: Arc<dyn JobStore>,
    broker: Arc<Broker>,
    bus: EventBus,
    pipeline: ProgressPipeline,
    registry: Arc<AdapterRegistry>,
    controls: Mutex<HashMap<JobId, JobControl>>,
    shutdown: AtomicBool,
}

/// The orchestration façade. Cheap to clone (an `Arc` handle over shared
/// state), the same shallow-clone shape as [`EventBus`] and
/// [`ProgressPipeline`].
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

fn map_store_err(err: StoreError) -> OrchestratorError {
    match err {
        StoreError::Conflict => OrchestratorError::Conflict,
        StoreError::NotFound => OrchestratorError::NotFound,
        StoreError::IllegalTransition => OrchestratorError::IllegalTransition,
    }
}

impl Orchestrator {
    /// Construct with a freshly built [`AdapterRegistry`] (the real
    /// yt-dlp/aria2/twmd/pinterest-dl/ffmpeg adapters per §4.4's table).
    pub fn new(config: Config, store: Arc<dyn JobStore>) -> Self {
        let registry = Arc::new(AdapterRegistry::new(config.clone()));
        Self::with_registry(config, store, registry)
    }

    /// Construct with a caller-supplied registry, so tests can
    /// [`AdapterRegistry::override_driver`] before any job reaches the
    /// supervisor (the way this codebase's mock-`ffmpeg` harness replaces a
    /// real transcoder).
    pub fn with_registry(config: Config, store: Arc<dyn JobStore>, registry: Arc<AdapterRegistry>) -> Self {
        let bus = EventBus::new(config.event_buffer_capacity);
        let pipeline = ProgressPipeline::new(bus.clone(), store.clone(), config.progress_throttle);
        let broker = Broker::new(&config);
        let inner = Arc::new(Inner {
            config,
            store,
            broker,
            bus,
            pipeline,
            registry,
            controls: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
        });
        let orchestrator = Self { inner };
        orchestrator.reconcile();
        orchestrator.spawn_workers();
        orchestrator
    }

    pub fn subscribe(&self) -> Subscription {
        self.inner.bus.subscribe()
    }

    pub fn subscribe_room(&self, id: JobId) -> Subscription {
        self.inner.bus.subscribe_room(id)
    }

    pub fn subscribe_broadcast(&self) -> Subscription {
        self.inner.bus.subscribe_broadcast()
    }

    pub fn registry(&self) -> &Arc<AdapterRegistry> {
        &self.inner.registry
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.inner.store
    }

    /// §4.6 `Submit`.
    pub fn submit(&self, req: CreateReq) -> Result<JobId> {
        let (kind, options) = validation::validate(&req)?;
        let id = JobId::new();
        let job = Job::new(id, req.url, kind, options);
        self.inner.store.insert(job).map_err(map_store_err)?;
        self.inner.broker.enqueue(id, kind.default_priority(), Vec::new());
        Ok(id)
    }

    /// §4.6 `Get`.
    pub fn get(&self, id: JobId) -> Result<Job> {
        self.inner.store.get(id).map_err(map_store_err)
    }

    /// §4.6 `List`.
    pub fn list(&self, filter: Filter, offset: usize, limit: usize) -> Page {
        self.inner.store.list(&filter, offset, limit)
    }

    /// §4.6 `Cancel`. Removes the queue entry if not yet reserved,
    /// terminates the child if reserved, flips `Status=cancelled` exactly
    /// once (§9 "Cancel vs Remove" resolution). Idempotent on an
    /// already-cancelled job (§8 property 5).
    pub fn cancel(&self, id: JobId) -> Result<()> {
        let job = self.get(id)?;
        match job.status {
            Status::Cancelled => Ok(()),
            Status::Completed | Status::Failed => Err(OrchestratorError::IllegalTransition),
            Status::Queued => {
                self.inner.broker.remove(id);
                self.publish_job_update(id, Some(Status::Cancelled), None, None);
                Ok(())
            }
            Status::Paused => {
                self.publish_job_update(id, Some(Status::Cancelled), None, None);
                Ok(())
            }
            Status::Running => {
                let controls = self.inner.controls.lock_unpoisoned();
                if let Some(control) = controls.get(&id) {
                    control.cancel.store(true, Ordering::Release);
                }
                // The actual Status=cancelled write and `job-update`
                // publish happen in `finish_run` once the supervisor
                // observes the cancel flag and the child exits, bounded by
                // `graceTimeout` (§5 "Cancellation semantics").
                Ok(())
            }
        }
    }

    /// §4.6 `Pause`. Pre: `Status=running`.
    pub fn pause(&self, id: JobId) -> Result<()> {
        let job = self.get(id)?;
        if job.status != Status::Running {
            return Err(OrchestratorError::IllegalTransition);
        }
        let controls = self.inner.controls.lock_unpoisoned();
        match controls.get(&id) {
            Some(control) => {
                control.pause.store(true, Ordering::Release);
                Ok(())
            }
            // Running in JobStore but no control handle yet registered is
            // a narrow startup race; reject rather than silently no-op.
            None => Err(OrchestratorError::IllegalTransition),
        }
    }

    /// §4.6 `Resume`. Pre: `Status=paused`. Per §9's open-question
    /// resolution, work is lost and progress resets; the job re-enters the
    /// queue at its original kind-derived priority.
    pub fn resume(&self, id: JobId) -> Result<()> {
        let job = self.get(id)?;
        if job.status != Status::Paused {
            return Err(OrchestratorError::IllegalTransition);
        }
        self.publish_job_update(id, Some(Status::Queued), Some(Stage::Queue), Some(0.0));
        self.inner.broker.enqueue(id, job.kind.default_priority(), Vec::new());
        Ok(())
    }

    /// §4.6 `Retry`. Pre: `Status ∈ {failed, cancelled}`. Resets progress,
    /// clears error fields, re-enters `queued` (§3 invariant 4).
    pub fn retry(&self, id: JobId) -> Result<()> {
        let job = self.get(id)?;
        if !matches!(job.status, Status::Failed | Status::Cancelled) {
            return Err(OrchestratorError::IllegalTransition);
        }
        self.inner.store.record_attempt(id, 1).map_err(map_store_err)?;
        self.publish_job_update(id, Some(Status::Queued), Some(Stage::Queue), Some(0.0));
        self.inner.broker.enqueue(id, job.kind.default_priority(), Vec::new());
        Ok(())
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.broker.shutdown();
        self.inner.pipeline.shutdown();
    }

    fn publish_job_update(&self, id: JobId, status: Option<Status>, stage: Option<Stage>, progress: Option<f64>) {
        self.inner.pipeline.on_job_update(
            id,
            JobUpdateEvent {
                job_id: id,
                status,
                stage,
                progress,
            },
        );
    }

    /// §4.3 "Reconciliation on startup": rows left `running` by a prior
    /// process (no live reservation survives a restart in this in-process
    /// Broker) are transitioned back to `queued` and re-enqueued (§8
    /// property 7, crash recovery).
    fn reconcile(&self) {
        let stale_running = self.inner.store.list(&Filter {
            status: Some(Status::Running),
            ..Default::default()
        }, 0, usize::MAX);
        for job in stale_running.items {
            if self.inner.broker.is_reserved(job.id).is_some() {
                continue;
            }
            self.publish_job_update(job.id, Some(Status::Queued), Some(Stage::Queue), Some(0.0));
            self.inner.broker.enqueue(job.id, job.kind.default_priority(), Vec::new());
        }
    }

    fn spawn_workers(&self) {
        for index in 0..self.inner.config.max_concurrent_jobs.max(1) {
            let orchestrator = self.clone();
            let result = thread::Builder::new()
                .name(format!("fetchd-worker-{index}"))
                .spawn(move || orchestrator.worker_loop());
            if let Err(err) = result {
                crate::debug_eprintln!("failed to spawn worker thread {index}: {err}");
            }
        }
    }

    fn worker_loop(&self) {
        loop {
            if self.inner.shutdown.load(Ordering::Acquire) {
                return;
            }
            let (token, job_id, _payload) = self.inner.broker.reserve();
            self.run_one(token, job_id);
        }
    }

    fn run_one(&self, token: ReservationToken, job_id: JobId) {
        let job = match self.inner.store.get(job_id) {
            Ok(job) => job,
            Err(_) => {
                self.inner.broker.ack(token);
                return;
            }
        };
        // A Cancel issued between Enqueue and Reserve already removed the
        // queue entry in the common case, but a race can still hand us a
        // job that moved to a terminal status in the meantime.
        if job.status != Status::Queued {
            self.inner.broker.ack(token);
            return;
        }

        let control = JobControl::new();
        self.inner.controls.lock_unpoisoned().insert(job_id, control.clone());

        if let Err(err) = self.inner.store.update_status(job_id, Status::Running, None, None) {
            crate::debug_eprintln!("failed to mark {job_id} running: {err}");
        }
        self.publish_job_update(job_id, Some(Status::Running), Some(Stage::Download), None);

        let heartbeat_stop = Arc::new(AtomicBool::new(false));
        spawn_heartbeat(
            self.inner.broker.clone(),
            token,
            heartbeat_stop.clone(),
            (self.inner.config.reservation_staleness / 2).max(Duration::from_millis(10)),
        );

        let supervisor = ProcessSupervisor::new(&self.inner.config, &self.inner.registry);
        let bus = self.inner.bus.clone();
        let pipeline = self.inner.pipeline.clone();
        let outcome = supervisor.run(&job, &control, |event| match event {
            SupervisorEvent::Progress(delta) => pipeline.on_progress(job_id, delta),
            SupervisorEvent::Log { level, message } => bus.publish(
                job_id,
                EventPayload::Log(LogEvent {
                    job_id,
                    timestamp: now_millis(),
                    level,
                    message,
                }),
            ),
        });

        heartbeat_stop.store(true, Ordering::Release);
        self.inner.controls.lock_unpoisoned().remove(&job_id);

        self.finish_run(job_id, token, &control, outcome);
    }

    fn finish_run(&self, job_id: JobId, token: ReservationToken, control: &JobControl, outcome: SupervisorOutcome) {
        match outcome {
            SupervisorOutcome::Success { filename, output_path, size } => {
                self.inner.pipeline.on_completed(
                    job_id,
                    CompletedEvent {
                        job_id,
                        filename,
                        size,
                        output_path: output_path.display().to_string(),
                    },
                );
                self.inner.broker.ack(token);
            }
            SupervisorOutcome::Failure { code, message } => {
                if code.retry_eligible() {
                    match self.inner.broker.nack(token) {
                        NackOutcome::Rescheduled { attempt } => {
                            crate::debug_eprintln!(
                                "job {job_id} failed ({code}: {message}), scheduling retry attempt {attempt}"
                            );
                            let _ = self.inner.store.record_attempt(job_id, attempt);
                            self.publish_job_update(job_id, Some(Status::Queued), Some(Stage::Queue), Some(0.0));
                        }
                        NackOutcome::PermanentlyFailed { .. } => {
                            self.inner.pipeline.on_failed(
                                job_id,
                                FailedEvent {
                                    job_id,
                                    error_code: code,
                                    message,
                                },
                            );
                        }
                    }
                } else {
                    self.inner.broker.ack(token);
                    self.inner.pipeline.on_failed(
                        job_id,
                        FailedEvent {
                            job_id,
                            error_code: code,
                            message,
                        },
                    );
                }
            }
            SupervisorOutcome::Cancelled => {
                self.inner.broker.ack(token);
                if control.cancel.load(Ordering::Acquire) {
                    self.publish_job_update(job_id, Some(Status::Cancelled), None, None);
                } else {
                    // Pause: the reservation is released and the job
                    // becomes invisible to the Broker until `Resume`
                    // re-enqueues it (§9 "Pause/Resume" resolution).
                    self.publish_job_update(job_id, Some(Status::Paused), None, None);
                }
            }
        }
    }
}

/// Refresh the Broker's staleness clock for a long-running reservation so
/// the sweeper does not release it back to the queue while its
/// ProcessSupervisor is still actively driving the child (§4.3 "a
/// reservation is visible as in-flight... if unacked past a staleness
/// window").
fn spawn_heartbeat(broker: Arc<Broker>, token: ReservationToken, stop: Arc<AtomicBool>, interval: Duration) {
    let result = thread::Builder::new()
        .name("fetchd-reservation-heartbeat".to_string())
        .spawn(move || {
            while !stop.load(Ordering::Acquire) {
                broker.heartbeat(token);
                thread::sleep(interval);
            }
        });
    if let Err(err) = result {
        crate::debug_eprintln!("failed to spawn reservation heartbeat thread: {err}");
    }
}
