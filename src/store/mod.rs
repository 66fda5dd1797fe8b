//! Durable projection of every job (§4.2). The Orchestrator process is the
//! sole writer; workers never call this directly, they emit events that
//! ProgressPipeline consumes and folds into these calls (single-writer
//! discipline).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use crate::domain::{Job, JobId, Kind, Stage, Status};
use crate::error::ErrorCode;
use crate::sync_ext::MutexExt;

#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub status: Option<Status>,
    pub kind: Option<Kind>,
    /// Case-insensitive substring over `URL` and `Filename`.
    pub query: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Page {
    pub items: Vec<Job>,
    pub total: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job id already exists")]
    Conflict,
    #[error("job not found")]
    NotFound,
    #[error("illegal status transition")]
    IllegalTransition,
}

/// The full contract in §4.2. Kept as a trait so the in-memory default can
/// be swapped for a SQL-backed implementation without touching any caller
/// (the persisted layout in §6 is a direct template for such a `jobs` table).
pub trait JobStore: Send + Sync {
    fn insert(&self, job: Job) -> Result<(), StoreError>;
    fn get(&self, id: JobId) -> Result<Job, StoreError>;
    fn list(&self, filter: &Filter, offset: usize, limit: usize) -> Page;
    fn update_progress(
        &self,
        id: JobId,
        progress: f64,
        stage: Option<Stage>,
        speed: Option<String>,
        eta: Option<u64>,
        total_bytes: Option<u64>,
    ) -> Result<(), StoreError>;
    fn update_status(
        &self,
        id: JobId,
        status: Status,
        error_code: Option<ErrorCode>,
        error_message: Option<String>,
    ) -> Result<(), StoreError>;
    fn set_completed(
        &self,
        id: JobId,
        filename: String,
        output_path: String,
        size: Option<u64>,
    ) -> Result<(), StoreError>;

    /// Record the attempt number reached so far. Not part of the public
    /// §4.2 contract; needed so the Broker's retry accounting (§4.3) is
    /// observable on the Job row it is retrying (see S4's "attempt counter
    /// = 2" assertion).
    fn record_attempt(&self, id: JobId, attempt: u32) -> Result<(), StoreError>;
}

/// Enforces the same legality rule used by `update_status`: once terminal,
/// only `Retry` (a status write back to `Queued` performed by the
/// Orchestrator, not a JobStore-level transition) can move a job again.
fn is_legal_transition(from: Status, to: Status) -> bool {
    if from == to {
        return true;
    }
    if from.is_terminal() {
        // The only path out of a terminal status is Retry, which the
        // Orchestrator implements as a fresh `Queued` write; JobStore
        // cannot distinguish that from any other write, so it allows it
        // and relies on the Orchestrator to be the only caller that does.
        return to == Status::Queued;
    }
    match (from, to) {
        (Status::Queued, Status::Running) => true,
        (Status::Queued, Status::Cancelled) => true,
        (Status::Running, Status::Paused) => true,
        (Status::Running, Status::Cancelled) => true,
        (Status::Running, Status::Completed) => true,
        (Status::Running, Status::Failed) => true,
        // An automatic Broker retry (Nack -> Rescheduled) sends a job that
        // never reached a terminal status back to the queue directly,
        // without passing through Failed (S4: "queued -> running -> queued
        // -> running -> completed"). Distinct from the terminal-only Retry
        // path above.
        (Status::Running, Status::Queued) => true,
        (Status::Paused, Status::Queued) => true,
        (Status::Paused, Status::Cancelled) => true,
        _ => false,
    }
}

pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Test/reconciliation helper: a consistent snapshot of every row.
    pub fn snapshot(&self) -> Vec<Job> {
        self.jobs.lock_unpoisoned().values().cloned().collect()
    }

    /// Write every row to `path` as a JSON array, mirroring the §6
    /// "Persisted state layout" shape field-for-field. Not a replacement for
    /// a real `jobs` table; exists so the reconciliation path (§4.3, §8
    /// property 7) can be exercised against a store that was loaded from
    /// disk rather than built up in-process.
    pub fn persist_snapshot(&self, path: &Path) -> anyhow::Result<()> {
        let jobs = self.snapshot();
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(file, &jobs)?;
        Ok(())
    }

    /// Rebuild a store from a file written by [`Self::persist_snapshot`].
    pub fn restore_snapshot(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)?;
        let jobs: Vec<Job> = serde_json::from_reader(file)?;
        let store = Self::new();
        for job in jobs {
            store.jobs.lock_unpoisoned().insert(job.id, job);
        }
        Ok(store)
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl JobStore for InMemoryJobStore {
    fn insert(&self, job: Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock_unpoisoned();
        if jobs.contains_key(&job.id) {
            return Err(StoreError::Conflict);
        }
        jobs.insert(job.id, job);
        Ok(())
    }

    fn get(&self, id: JobId) -> Result<Job, StoreError> {
        self.jobs
            .lock_unpoisoned()
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn list(&self, filter: &Filter, offset: usize, limit: usize) -> Page {
        let jobs = self.jobs.lock_unpoisoned();
        let mut matched: Vec<Job> = jobs
            .values()
            .filter(|job| filter.status.is_none_or(|s| job.status == s))
            .filter(|job| filter.kind.is_none_or(|k| job.kind == k))
            .filter(|job| match &filter.query {
                None => true,
                Some(q) => {
                    let q = q.to_lowercase();
                    job.url.to_lowercase().contains(&q)
                        || job
                            .filename
                            .as_deref()
                            .is_some_and(|f| f.to_lowercase().contains(&q))
                }
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = matched.len();
        let items = matched.into_iter().skip(offset).take(limit).collect();
        Page { items, total }
    }

    fn update_progress(
        &self,
        id: JobId,
        progress: f64,
        stage: Option<Stage>,
        speed: Option<String>,
        eta: Option<u64>,
        total_bytes: Option<u64>,
    ) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock_unpoisoned();
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound)?;
        job.progress = progress.clamp(0.0, 100.0);
        if let Some(stage) = stage {
            job.stage = Some(stage);
        }
        if speed.is_some() {
            job.speed = speed;
        }
        if eta.is_some() {
            job.eta = eta;
        }
        if total_bytes.is_some() {
            job.total_bytes = total_bytes;
        }
        job.updated_at = crate::domain::now_millis();
        Ok(())
    }

    fn update_status(
        &self,
        id: JobId,
        status: Status,
        error_code: Option<ErrorCode>,
        error_message: Option<String>,
    ) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock_unpoisoned();
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound)?;
        if !is_legal_transition(job.status, status) {
            return Err(StoreError::IllegalTransition);
        }
        job.status = status;
        if status == Status::Queued {
            // Covers both a fresh Reserve and a Retry; Retry additionally
            // resets progress/stage/error via the Orchestrator before this
            // call, but clearing here too keeps JobStore self-consistent
            // even if called directly.
            job.error_code = None;
            job.error_message = None;
        }
        if status == Status::Failed {
            job.error_code = error_code;
            job.error_message = error_message;
        }
        if status == Status::Cancelled {
            job.error_code = None;
            job.error_message = None;
        }
        job.updated_at = crate::domain::now_millis();
        Ok(())
    }

    fn set_completed(
        &self,
        id: JobId,
        filename: String,
        output_path: String,
        size: Option<u64>,
    ) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock_unpoisoned();
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound)?;
        if !is_legal_transition(job.status, Status::Completed) {
            return Err(StoreError::IllegalTransition);
        }
        job.status = Status::Completed;
        job.progress = 100.0;
        job.stage = Some(Stage::Completed);
        job.error_code = None;
        job.error_message = None;
        job.filename = Some(filename);
        job.output_path = Some(output_path);
        if size.is_some() {
            job.total_bytes = size;
        }
        job.updated_at = crate::domain::now_millis();
        Ok(())
    }

    fn record_attempt(&self, id: JobId, attempt: u32) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock_unpoisoned();
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound)?;
        job.attempt = attempt;
        job.updated_at = crate::domain::now_millis();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Options;

    fn sample_job() -> Job {
        Job::new(JobId::new(), "https://example.test/a.bin".into(), Kind::File, Options::default())
    }

    #[test]
    fn insert_rejects_duplicate_id() {
        let store = InMemoryJobStore::new();
        let job = sample_job();
        store.insert(job.clone()).unwrap();
        assert!(matches!(store.insert(job), Err(StoreError::Conflict)));
    }

    #[test]
    fn update_progress_clamps_and_leaves_status_alone() {
        let store = InMemoryJobStore::new();
        let job = sample_job();
        let id = job.id;
        store.insert(job).unwrap();
        store
            .update_progress(id, 150.0, Some(Stage::Download), None, None, None)
            .unwrap();
        let updated = store.get(id).unwrap();
        assert_eq!(updated.progress, 100.0);
        assert_eq!(updated.status, Status::Queued);
    }

    #[test]
    fn set_completed_enforces_invariants() {
        let store = InMemoryJobStore::new();
        let mut job = sample_job();
        job.status = Status::Running;
        let id = job.id;
        store.insert(job).unwrap();
        store
            .set_completed(id, "a.bin".into(), "/data/a.bin".into(), Some(10))
            .unwrap();
        let updated = store.get(id).unwrap();
        assert_eq!(updated.status, Status::Completed);
        assert_eq!(updated.progress, 100.0);
        assert_eq!(updated.stage, Some(Stage::Completed));
        assert!(updated.error_code.is_none());
    }

    #[test]
    fn snapshot_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");

        let store = InMemoryJobStore::new();
        let mut job = sample_job();
        job.status = Status::Running;
        let id = job.id;
        store.insert(job).unwrap();
        store.persist_snapshot(&path).unwrap();

        let restored = InMemoryJobStore::restore_snapshot(&path).unwrap();
        let reloaded = restored.get(id).unwrap();
        assert_eq!(reloaded.status, Status::Running);
        assert_eq!(reloaded.url, "https://example.test/a.bin");
    }

    #[test]
    fn status_cannot_leave_terminal_except_via_queued() {
        let store = InMemoryJobStore::new();
        let mut job = sample_job();
        job.status = Status::Cancelled;
        let id = job.id;
        store.insert(job).unwrap();
        assert!(matches!(
            store.update_status(id, Status::Running, None, None),
            Err(StoreError::IllegalTransition)
        ));
        assert!(store.update_status(id, Status::Queued, None, None).is_ok());
    }
}
