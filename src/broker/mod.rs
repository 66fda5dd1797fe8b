//! Work queue with priority, FIFO-within-priority, a global concurrency
//! cap, retry with exponential backoff, and durable hand-off independent of
//! the Orchestrator process (§4.3).
//!
//! Modeled as a per-job record driven by a single `Mutex<State>` + `Condvar`
//! pair, the same shape the in-process worker pool in `engine::state` uses
//! for its queue — a single global lock is acceptable here because
//! `Reserve`/`Ack`/`Nack` are cheap bookkeeping operations, not the I/O-bound
//! work itself (which happens in ProcessSupervisor, outside this lock).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::Config;
use crate::domain::{JobId, Priority};
use crate::sync_ext::{CondvarExt, MutexExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReservationToken(u64);

#[derive(Debug, Clone)]
struct QueueEntry {
    job_id: JobId,
    priority: Priority,
    payload: Vec<u8>,
    enqueued_at: Instant,
    attempt: u32,
}

#[derive(Debug, Clone)]
struct Reservation {
    job_id: JobId,
    payload: Vec<u8>,
    priority: Priority,
    attempt: u32,
    reserved_at: Instant,
    last_heartbeat: Instant,
}

#[derive(Debug, Clone)]
struct PendingRetry {
    entry: QueueEntry,
    ready_at: Instant,
}

struct State {
    queue: VecDeque<QueueEntry>,
    reservations: std::collections::HashMap<ReservationToken, Reservation>,
    pending_retries: Vec<PendingRetry>,
    /// `JobID`s currently queued or reserved, for `Remove`/idempotence
    /// checks without scanning.
    known: std::collections::HashSet<JobId>,
}

/// What `Nack` decided to do with an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// Rescheduled; will reappear via `Reserve` after the backoff delay.
    Rescheduled { attempt: u32 },
    /// `maxAttempts` exhausted; permanently failed, slot freed.
    PermanentlyFailed { attempt: u32 },
}

pub struct Broker {
    state: Mutex<State>,
    cv: Condvar,
    capacity: usize,
    next_token: AtomicU64,
    next_enqueue_seq: AtomicU64,
    staleness_window: Duration,
    retry_base_delay: Duration,
    retry_factor: f64,
    retry_jitter: f64,
    max_attempts: u32,
    shutdown: std::sync::atomic::AtomicBool,
}

impl Broker {
    pub fn new(config: &Config) -> Arc<Self> {
        let broker = Arc::new(Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                reservations: std::collections::HashMap::new(),
                pending_retries: Vec::new(),
                known: std::collections::HashSet::new(),
            }),
            cv: Condvar::new(),
            capacity: config.max_concurrent_jobs.max(1),
            next_token: AtomicU64::new(1),
            next_enqueue_seq: AtomicU64::new(0),
            staleness_window: config.reservation_staleness,
            retry_base_delay: config.retry_base_delay,
            retry_factor: config.retry_factor,
            retry_jitter: config.retry_jitter,
            max_attempts: config.max_attempts,
            shutdown: std::sync::atomic::AtomicBool::new(false),
        });
        spawn_sweeper(&broker);
        broker
    }

    /// Enqueue a fresh or re-enqueued item. `Payload` is opaque to the
    /// Broker; the Orchestrator round-trips whatever it needs to resume
    /// work through it.
    pub fn enqueue(&self, job_id: JobId, priority: Priority, payload: Vec<u8>) {
        let mut state = self.state.lock_unpoisoned();
        state.known.insert(job_id);
        push_sorted(
            &mut state.queue,
            QueueEntry {
                job_id,
                priority,
                payload,
                enqueued_at: Instant::now(),
                attempt: 1,
            },
        );
        drop(state);
        self.cv.notify_all();
    }

    /// Block until a slot is available under the global concurrency cap and
    /// an item can be delivered.
    pub fn reserve(&self) -> (ReservationToken, JobId, Vec<u8>) {
        let mut state = self.state.lock_unpoisoned();
        loop {
            if state.reservations.len() < self.capacity
                && let Some(entry) = state.queue.pop_front()
            {
                let token = ReservationToken(self.next_token.fetch_add(1, Ordering::Relaxed));
                let now = Instant::now();
                state.reservations.insert(
                    token,
                    Reservation {
                        job_id: entry.job_id,
                        payload: entry.payload.clone(),
                        priority: entry.priority,
                        attempt: entry.attempt,
                        reserved_at: now,
                        last_heartbeat: now,
                    },
                );
                return (token, entry.job_id, entry.payload);
            }
            state = self.cv.wait_unpoisoned(state);
        }
    }

    /// Refresh the staleness clock for a long-running reservation so the
    /// sweeper does not release it back to the queue out from under an
    /// active ProcessSupervisor.
    pub fn heartbeat(&self, token: ReservationToken) {
        let mut state = self.state.lock_unpoisoned();
        if let Some(reservation) = state.reservations.get_mut(&token) {
            reservation.last_heartbeat = Instant::now();
        }
    }

    /// Marks the item done, frees the slot.
    pub fn ack(&self, token: ReservationToken) {
        let mut state = self.state.lock_unpoisoned();
        if let Some(reservation) = state.reservations.remove(&token) {
            state.known.remove(&reservation.job_id);
        }
        drop(state);
        self.cv.notify_all();
    }

    /// Reschedule with exponential backoff up to `maxAttempts`, or mark
    /// permanently failed and free the slot.
    pub fn nack(&self, token: ReservationToken) -> NackOutcome {
        let mut state = self.state.lock_unpoisoned();
        let Some(reservation) = state.reservations.remove(&token) else {
            return NackOutcome::PermanentlyFailed { attempt: 0 };
        };
        let next_attempt = reservation.attempt + 1;
        if next_attempt > self.max_attempts {
            state.known.remove(&reservation.job_id);
            drop(state);
            self.cv.notify_all();
            return NackOutcome::PermanentlyFailed {
                attempt: reservation.attempt,
            };
        }
        let delay = backoff_delay(
            self.retry_base_delay,
            self.retry_factor,
            self.retry_jitter,
            reservation.attempt,
        );
        state.pending_retries.push(PendingRetry {
            entry: QueueEntry {
                job_id: reservation.job_id,
                priority: reservation.priority,
                payload: reservation.payload,
                enqueued_at: Instant::now(),
                attempt: next_attempt,
            },
            ready_at: Instant::now() + delay,
        });
        NackOutcome::Rescheduled {
            attempt: next_attempt,
        }
    }

    /// Idempotent dequeue for cancellation of not-yet-started work. Returns
    /// `true` if an item was actually removed from the pending queue or
    /// retry backlog (the caller still needs to check reservations
    /// separately if the job may already be running).
    pub fn remove(&self, job_id: JobId) -> bool {
        let mut state = self.state.lock_unpoisoned();
        let before = state.queue.len() + state.pending_retries.len();
        state.queue.retain(|e| e.job_id != job_id);
        state.pending_retries.retain(|p| p.entry.job_id != job_id);
        state.known.remove(&job_id);
        let removed = before != state.queue.len() + state.pending_retries.len();
        removed
    }

    pub fn is_reserved(&self, job_id: JobId) -> Option<ReservationToken> {
        self.state
            .lock_unpoisoned()
            .reservations
            .iter()
            .find(|(_, r)| r.job_id == job_id)
            .map(|(token, _)| *token)
    }

    pub fn active_reservation_count(&self) -> usize {
        self.state.lock_unpoisoned().reservations.len()
    }

    pub fn queue_len(&self) -> usize {
        let state = self.state.lock_unpoisoned();
        state.queue.len() + state.pending_retries.len()
    }

    fn promote_ready_retries(&self) {
        let mut state = self.state.lock_unpoisoned();
        let now = Instant::now();
        let mut ready = Vec::new();
        state.pending_retries.retain(|p| {
            if p.ready_at <= now {
                ready.push(p.entry.clone());
                false
            } else {
                true
            }
        });
        for entry in ready {
            push_sorted(&mut state.queue, entry);
        }
        if !state.queue.is_empty() {
            drop(state);
            self.cv.notify_all();
        }
    }

    fn release_stale_reservations(&self) {
        let mut state = self.state.lock_unpoisoned();
        let now = Instant::now();
        let staleness_window = self.staleness_window;
        let stale_tokens: Vec<ReservationToken> = state
            .reservations
            .iter()
            .filter(|(_, r)| now.duration_since(r.last_heartbeat) > staleness_window)
            .map(|(token, _)| *token)
            .collect();
        for token in stale_tokens {
            if let Some(reservation) = state.reservations.remove(&token) {
                push_sorted(
                    &mut state.queue,
                    QueueEntry {
                        job_id: reservation.job_id,
                        priority: reservation.priority,
                        payload: reservation.payload,
                        enqueued_at: Instant::now(),
                        attempt: reservation.attempt,
                    },
                );
            }
        }
        drop(state);
        self.cv.notify_all();
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.cv.notify_all();
    }
}

fn push_sorted(queue: &mut VecDeque<QueueEntry>, entry: QueueEntry) {
    // Higher priority runs first; ties broken FIFO by enqueue timestamp.
    // Scanning from the back keeps this close to O(1) for the common case
    // of appending to a mostly-sorted queue of a handful of pending jobs.
    let pos = queue
        .iter()
        .position(|e| entry.priority > e.priority)
        .unwrap_or(queue.len());
    queue.insert(pos, entry);
}

fn backoff_delay(base: Duration, factor: f64, jitter: f64, attempt: u32) -> Duration {
    let exp = factor.powi((attempt - 1) as i32);
    let nominal = base.mul_f64(exp);
    let jitter_fraction = rand::thread_rng().gen_range(-jitter..=jitter);
    nominal.mul_f64(1.0 + jitter_fraction)
}

fn spawn_sweeper(broker: &Arc<Broker>) {
    let broker = broker.clone();
    let tick = (broker.staleness_window / 4).max(Duration::from_millis(10));
    let result = thread::Builder::new()
        .name("fetchd-broker-sweeper".to_string())
        .spawn(move || {
            while !broker.shutdown.load(Ordering::Acquire) {
                broker.promote_ready_retries();
                broker.release_stale_reservations();
                thread::sleep(tick);
            }
        });
    if let Err(err) = result {
        crate::debug_eprintln!("failed to spawn broker staleness sweeper: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config::for_tests()
    }

    #[test]
    fn reserve_respects_global_concurrency_cap() {
        let mut config = test_config();
        config.max_concurrent_jobs = 2;
        let broker = Broker::new(&config);
        for _ in 0..3 {
            broker.enqueue(JobId::new(), Priority::Normal, Vec::new());
        }
        let r1 = broker.reserve();
        let r2 = broker.reserve();
        assert_eq!(broker.active_reservation_count(), 2);
        broker.ack(r1.0);
        let r3 = broker.reserve();
        assert_eq!(broker.active_reservation_count(), 2);
        broker.ack(r2.0);
        broker.ack(r3.0);
    }

    #[test]
    fn high_priority_reserved_before_normal() {
        let broker = Broker::new(&test_config());
        let normal_job = JobId::new();
        let high_job = JobId::new();
        broker.enqueue(normal_job, Priority::Normal, Vec::new());
        broker.enqueue(high_job, Priority::High, Vec::new());

        let (_, first, _) = broker.reserve();
        assert_eq!(first, high_job);
    }

    #[test]
    fn nack_exhausts_attempts_into_permanent_failure() {
        let mut config = test_config();
        config.max_attempts = 2;
        config.retry_base_delay = Duration::from_millis(1);
        let broker = Broker::new(&config);
        let job = JobId::new();
        broker.enqueue(job, Priority::Normal, Vec::new());

        let (token, _, _) = broker.reserve();
        assert_eq!(broker.nack(token), NackOutcome::Rescheduled { attempt: 2 });

        std::thread::sleep(Duration::from_millis(50));
        let (token, reserved_job, _) = broker.reserve();
        assert_eq!(reserved_job, job);
        assert_eq!(
            broker.nack(token),
            NackOutcome::PermanentlyFailed { attempt: 2 }
        );
    }

    #[test]
    fn remove_is_idempotent() {
        let broker = Broker::new(&test_config());
        let job = JobId::new();
        broker.enqueue(job, Priority::Normal, Vec::new());
        assert!(broker.remove(job));
        assert!(!broker.remove(job));
    }
}
