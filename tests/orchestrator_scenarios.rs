//! End-to-end scenarios driving `Orchestrator` through real (if scripted)
//! child processes via `MockAdapter`/`AdapterRegistry::override_driver`,
//! the same harness shape this codebase's mock-`ffmpeg` integration tests
//! use to avoid depending on a real downloader binary being on `PATH`.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use fetchd_core::config::Config;
use fetchd_core::domain::{CreateReq, Job, Kind, Options, ProgressDelta, Stage, Status};
use fetchd_core::error::ErrorCode;
use fetchd_core::store::InMemoryJobStore;
use fetchd_core::supervisor::adapter::{AdapterContext, Artifact, DownloaderAdapter, ProcessSpec};
use fetchd_core::supervisor::adapters::mock::MockAdapter;
use fetchd_core::supervisor::adapters::{AdapterRegistry, Driver};
use fetchd_core::Orchestrator;

fn test_config(base: &Path) -> Config {
    let mut config = Config::from_env();
    config.data_dir = base.join("data");
    config.temp_dir = base.join("tmp");
    config.max_concurrent_jobs = 2;
    config.progress_throttle = Duration::from_millis(20);
    config.grace_timeout = Duration::from_millis(100);
    config.watchdog_stall = Duration::from_millis(1_000);
    config.job_timeout = Duration::from_secs(30);
    config.poll_interval = Duration::from_millis(20);
    config.reservation_staleness = Duration::from_millis(500);
    config.retry_base_delay = Duration::from_millis(20);
    config.retry_factor = 1.5;
    config.retry_jitter = 0.0;
    config.max_attempts = 2;
    config
}

fn spawn_orchestrator(config: Config, driver_overrides: Vec<(Kind, Driver)>) -> Orchestrator {
    let registry = Arc::new(AdapterRegistry::new(config.clone()));
    for (kind, driver) in driver_overrides {
        registry.override_driver(kind, driver);
    }
    let store = Arc::new(InMemoryJobStore::new());
    Orchestrator::with_registry(config, store, registry)
}

fn file_req() -> CreateReq {
    CreateReq {
        url: "https://example.test/a.bin".to_string(),
        kind: Kind::File,
        options: Options::default(),
    }
}

fn wait_for<F: Fn(&Job) -> bool>(orchestrator: &Orchestrator, id: fetchd_core::domain::JobId, timeout: Duration, pred: F) -> Job {
    let deadline = Instant::now() + timeout;
    loop {
        let job = orchestrator.get(id).expect("job must exist");
        if pred(&job) {
            return job;
        }
        if Instant::now() >= deadline {
            panic!("timed out waiting for job {id} to satisfy predicate, last status={:?}", job.status);
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// S1: a freshly submitted `file` job runs through to completion with a
/// filename and output path, progress pinned at 100.
#[test]
fn happy_path_file_download_completes() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let data_dir = config.data_dir.clone();
    let orchestrator = spawn_orchestrator(
        config,
        vec![(
            Kind::File,
            Driver::Process(Arc::new(MockAdapter::happy_path(4, "video.bin", 2048))),
        )],
    );

    let id = orchestrator.submit(file_req()).unwrap();
    let job = wait_for(&orchestrator, id, Duration::from_secs(5), |j| j.status == Status::Completed);

    assert_eq!(job.progress, 100.0);
    assert_eq!(job.filename.as_deref(), Some("video.bin"));
    let output_path = job.output_path.expect("completed job has an output path");
    assert!(output_path.starts_with(data_dir.display().to_string()));
    assert!(Path::new(&output_path).exists());
}

/// S2: the global concurrency cap is never exceeded even when more jobs are
/// submitted than there are worker slots.
#[test]
fn concurrency_never_exceeds_configured_cap() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.max_concurrent_jobs = 2;
    let cap = config.max_concurrent_jobs;

    let current = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let probe = ConcurrencyProbeAdapter {
        current: current.clone(),
        max_seen: max_seen.clone(),
        ticks: 5,
    };
    let orchestrator = spawn_orchestrator(config, vec![(Kind::File, Driver::Process(Arc::new(probe)))]);

    let ids: Vec<_> = (0..6).map(|_| orchestrator.submit(file_req()).unwrap()).collect();
    for id in ids {
        wait_for(&orchestrator, id, Duration::from_secs(10), |j| j.status == Status::Completed);
    }

    assert!(max_seen.load(Ordering::SeqCst) <= cap, "observed more concurrent runs than the configured cap");
    assert_eq!(current.load(Ordering::SeqCst), 0);
}

/// S3: cancelling a running job transitions it to `cancelled` within
/// `graceTimeout` plus a small bound, without leaving the child running.
#[test]
fn cancel_running_job_transitions_within_grace_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let grace = config.grace_timeout;
    let orchestrator = spawn_orchestrator(
        config,
        vec![(Kind::File, Driver::Process(Arc::new(MockAdapter::silent())))],
    );

    let id = orchestrator.submit(file_req()).unwrap();
    wait_for(&orchestrator, id, Duration::from_secs(5), |j| j.status == Status::Running);

    let started = Instant::now();
    orchestrator.cancel(id).unwrap();
    let job = wait_for(&orchestrator, id, grace + Duration::from_secs(2), |j| j.status == Status::Cancelled);
    assert_eq!(job.status, Status::Cancelled);

    // A second cancel on an already-cancelled job is a no-op, not an error.
    orchestrator.cancel(id).unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
}

/// S4: a job that fails with a retry-eligible error is automatically
/// rescheduled and completes on its second attempt, without ever visiting
/// `failed`.
#[test]
fn retry_eligible_failure_is_rescheduled_and_then_completes() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.max_attempts = 3;
    let attempts = Arc::new(AtomicUsize::new(0));
    let adapter = FlakyAdapter {
        attempts: attempts.clone(),
        fail_first: 1,
    };
    let orchestrator = spawn_orchestrator(config, vec![(Kind::File, Driver::Process(Arc::new(adapter)))]);

    let id = orchestrator.submit(file_req()).unwrap();
    let job = wait_for(&orchestrator, id, Duration::from_secs(5), |j| j.status == Status::Completed);

    assert_eq!(job.attempt, 2);
    assert!(job.error_code.is_none());
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

/// S5 (ordering): every progress event for a job is delivered to a room
/// subscriber, and the terminal event is always the last one observed.
#[test]
fn terminal_event_is_last_on_the_job_room() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let orchestrator = spawn_orchestrator(
        config,
        vec![(
            Kind::File,
            Driver::Process(Arc::new(MockAdapter::happy_path(6, "a.bin", 16))),
        )],
    );

    let id = orchestrator.submit(file_req()).unwrap();
    let mut sub = orchestrator.subscribe();
    sub.join(id);

    wait_for(&orchestrator, id, Duration::from_secs(5), |j| j.status == Status::Completed);

    let mut saw_terminal_last = false;
    let mut events = 0;
    while let Some(event) = sub.try_recv() {
        events += 1;
        saw_terminal_last = event.payload.is_terminal();
    }
    assert!(events > 0);
    assert!(saw_terminal_last);
}

/// S7: a job left `running` by a process that crashed before clean shutdown
/// is requeued and driven to completion by the next process that loads the
/// same persisted state (§4.3, §8 property 7).
#[test]
fn crash_recovery_requeues_orphaned_running_job() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let snapshot_path = dir.path().join("jobs.json");

    let orphan = Job::new(
        fetchd_core::domain::JobId::new(),
        "https://example.test/orphan.bin".to_string(),
        Kind::File,
        Options::default(),
    );
    let orphan_id = orphan.id;
    let mut orphan = orphan;
    orphan.status = Status::Running;
    orphan.progress = 40.0;

    let crashed_store = InMemoryJobStore::new();
    crashed_store.insert(orphan).unwrap();
    crashed_store.persist_snapshot(&snapshot_path).unwrap();
    drop(crashed_store);

    let restored_store = InMemoryJobStore::restore_snapshot(&snapshot_path).unwrap();
    assert_eq!(restored_store.get(orphan_id).unwrap().status, Status::Running);

    let registry = Arc::new(AdapterRegistry::new(config.clone()));
    registry.override_driver(
        Kind::File,
        Driver::Process(Arc::new(MockAdapter::happy_path(3, "orphan.bin", 64))),
    );
    let orchestrator = Orchestrator::with_registry(config, Arc::new(restored_store), registry);

    let job = wait_for(&orchestrator, orphan_id, Duration::from_secs(5), |j| {
        j.status == Status::Completed
    });
    assert_eq!(job.progress, 100.0);
    assert_eq!(job.filename.as_deref(), Some("orphan.bin"));
}

/// Counts concurrent `build()`→finish windows to verify the Broker's
/// concurrency cap is actually enforced, the way a shared gauge would in a
/// metrics-backed harness.
struct ConcurrencyProbeAdapter {
    current: Arc<AtomicUsize>,
    max_seen: Arc<AtomicUsize>,
    ticks: u32,
}

impl DownloaderAdapter for ConcurrencyProbeAdapter {
    fn build(&self, _job: &Job, work_dir: &Path) -> anyhow::Result<ProcessSpec> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        let mut script = String::new();
        for i in 1..=self.ticks {
            let pct = 100.0 * i as f64 / self.ticks as f64;
            script.push_str(&format!("echo PROGRESS:{pct}\nsleep 0.03\n"));
        }
        script.push_str("exit 0\n");
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
        self.current.fetch_sub(1, Ordering::SeqCst);
        ErrorCode::InternalError
    }

    fn collect_artifact(&self, work_dir: &Path) -> anyhow::Result<Artifact> {
        self.current.fetch_sub(1, Ordering::SeqCst);
        let path = work_dir.join("probe.bin");
        std::fs::write(&path, b"ok")?;
        Ok(Artifact {
            filename: "probe.bin".to_string(),
            path,
            size: Some(2),
        })
    }
}

/// Fails with a retry-eligible `NetworkError` on its first `fail_first`
/// attempts, then succeeds.
struct FlakyAdapter {
    attempts: Arc<AtomicUsize>,
    fail_first: usize,
}

impl DownloaderAdapter for FlakyAdapter {
    fn build(&self, _job: &Job, work_dir: &Path) -> anyhow::Result<ProcessSpec> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        let script = if attempt < self.fail_first {
            "echo PROGRESS:50\nexit 7\n".to_string()
        } else {
            "echo PROGRESS:100\nexit 0\n".to_string()
        };
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
        ErrorCode::NetworkError
    }

    fn collect_artifact(&self, work_dir: &Path) -> anyhow::Result<Artifact> {
        let path = work_dir.join("flaky.bin");
        std::fs::write(&path, b"done")?;
        Ok(Artifact {
            filename: "flaky.bin".to_string(),
            path,
            size: Some(4),
        })
    }
}
