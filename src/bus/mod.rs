//! Room-scoped pub/sub (§4.1). Transport-agnostic: this in-process
//! implementation is the default, but the contract (per-room ordering,
//! bounded drop-oldest buffers, never back-pressuring the publisher) is
//! exactly what a broker-backed adapter (e.g. Redis pub/sub) would need to
//! honor to be a drop-in replacement.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::domain::{EventPayload, JobId, RoomEvent, room_for};
use crate::sync_ext::{CondvarExt, MutexExt};

/// Handle returned by [`EventBus::subscribe`]. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rooms: Vec<String>,
    buffer: Arc<SubscriberBuffer>,
    bus: Arc<BusInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Block until an event is available, or return `None` if the bus was
    /// closed while waiting.
    pub fn recv(&self) -> Option<RoomEvent> {
        let mut guard = self.buffer.queue.lock_unpoisoned();
        loop {
            if let Some(event) = guard.pop_front() {
                return Some(event);
            }
            if self.buffer.closed.load(Ordering::Acquire) {
                return None;
            }
            guard = self.buffer.not_empty.wait_unpoisoned(guard);
        }
    }

    /// Non-blocking drain of whatever is currently buffered.
    pub fn try_recv(&self) -> Option<RoomEvent> {
        self.buffer.queue.lock_unpoisoned().pop_front()
    }

    pub fn join(&mut self, job_id: JobId) {
        let room = room_for(job_id);
        if !self.rooms.contains(&room) {
            self.bus.add_to_room(&room, self.id, self.buffer.clone());
            self.rooms.push(room);
        }
    }

    pub fn leave(&mut self, job_id: JobId) {
        let room = room_for(job_id);
        if let Some(pos) = self.rooms.iter().position(|r| r == &room) {
            self.bus.remove_from_room(&room, self.id);
            self.rooms.remove(pos);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        for room in &self.rooms {
            self.bus.remove_from_room(room, self.id);
        }
        self.bus.remove_from_broadcast(self.id);
        self.buffer.closed.store(true, Ordering::Release);
        self.buffer.not_empty.notify_all();
    }
}

struct SubscriberBuffer {
    queue: Mutex<VecDeque<RoomEvent>>,
    not_empty: Condvar,
    closed: std::sync::atomic::AtomicBool,
    capacity: usize,
}

impl SubscriberBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            closed: std::sync::atomic::AtomicBool::new(false),
            capacity,
        }
    }

    /// Non-blocking enqueue with drop-oldest-on-overflow. Never stalls the
    /// publisher (§4.1, §5 suspension points).
    fn push(&self, event: RoomEvent) {
        let mut guard = self.queue.lock_unpoisoned();
        if guard.len() >= self.capacity {
            guard.pop_front();
        }
        guard.push_back(event);
        drop(guard);
        self.not_empty.notify_one();
    }
}

struct BusInner {
    rooms: Mutex<HashMap<String, Vec<(u64, Arc<SubscriberBuffer>)>>>,
    broadcast: Mutex<Vec<(u64, Arc<SubscriberBuffer>)>>,
}

impl BusInner {
    fn add_to_room(&self, room: &str, id: u64, buffer: Arc<SubscriberBuffer>) {
        self.rooms
            .lock_unpoisoned()
            .entry(room.to_string())
            .or_default()
            .push((id, buffer));
    }

    fn remove_from_room(&self, room: &str, id: u64) {
        let mut rooms = self.rooms.lock_unpoisoned();
        if let Some(subs) = rooms.get_mut(room) {
            subs.retain(|(sub_id, _)| *sub_id != id);
            if subs.is_empty() {
                rooms.remove(room);
            }
        }
    }

    fn remove_from_broadcast(&self, id: u64) {
        self.broadcast
            .lock_unpoisoned()
            .retain(|(sub_id, _)| *sub_id != id);
    }
}

/// In-process room-based pub/sub. `Clone` is shallow (shares the same
/// subscriber registry), matching the facade-over-`Arc` pattern used
/// throughout this crate.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
    next_sub_id: Arc<AtomicU64>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                rooms: Mutex::new(HashMap::new()),
                broadcast: Mutex::new(Vec::new()),
            }),
            next_sub_id: Arc::new(AtomicU64::new(1)),
            capacity,
        }
    }

    /// Publish one event to `room:<job_id>`. Non-blocking; at-least-once to
    /// currently-subscribed consumers only.
    pub fn publish(&self, job_id: JobId, payload: EventPayload) {
        let room = room_for(job_id);
        let event = RoomEvent {
            room: room.clone(),
            payload,
        };
        let subs = self.inner.rooms.lock_unpoisoned().get(&room).cloned();
        if let Some(subs) = subs {
            for (_, buffer) in subs {
                buffer.push(event.clone());
            }
        }
        let broadcast_subs = self.inner.broadcast.lock_unpoisoned().clone();
        for (_, buffer) in broadcast_subs {
            buffer.push(event.clone());
        }
    }

    /// Subscribe to zero rooms initially; `join`/`leave` control membership
    /// (mirrors the `join-job`/`leave-job` control messages in §6).
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        Subscription {
            id,
            rooms: Vec::new(),
            buffer: Arc::new(SubscriberBuffer::new(self.capacity)),
            bus: self.inner.clone(),
        }
    }

    /// Subscribe directly to one job's room.
    pub fn subscribe_room(&self, job_id: JobId) -> Subscription {
        let mut sub = self.subscribe();
        sub.join(job_id);
        sub
    }

    /// Subscribe to every room (used by dashboards / tests observing
    /// cross-job ordering properties).
    pub fn subscribe_broadcast(&self) -> Subscription {
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let buffer = Arc::new(SubscriberBuffer::new(self.capacity));
        self.inner
            .broadcast
            .lock_unpoisoned()
            .push((id, buffer.clone()));
        Subscription {
            id,
            rooms: Vec::new(),
            buffer,
            bus: self.inner.clone(),
        }
    }

    pub fn room_subscriber_count(&self, job_id: JobId) -> usize {
        self.inner
            .rooms
            .lock_unpoisoned()
            .get(&room_for(job_id))
            .map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobUpdateEvent, Status};

    fn update(job_id: JobId, status: Status) -> EventPayload {
        EventPayload::JobUpdate(JobUpdateEvent {
            job_id,
            status: Some(status),
            stage: None,
            progress: None,
        })
    }

    #[test]
    fn delivers_only_to_subscribed_room() {
        let bus = EventBus::new(16);
        let job_a = JobId::new();
        let job_b = JobId::new();
        let sub_a = bus.subscribe_room(job_a);
        let sub_b = bus.subscribe_room(job_b);

        bus.publish(job_a, update(job_a, Status::Running));

        assert!(sub_a.try_recv().is_some());
        assert!(sub_b.try_recv().is_none());
    }

    #[test]
    fn drops_oldest_on_overflow_without_blocking() {
        let bus = EventBus::new(2);
        let job = JobId::new();
        let sub = bus.subscribe_room(job);

        for _ in 0..5 {
            bus.publish(job, update(job, Status::Running));
        }

        let mut count = 0;
        while sub.try_recv().is_some() {
            count += 1;
        }
        assert_eq!(count, 2);
    }

    #[test]
    fn preserves_publish_order_per_room() {
        let bus = EventBus::new(64);
        let job = JobId::new();
        let sub = bus.subscribe_room(job);

        bus.publish(job, update(job, Status::Queued));
        bus.publish(job, update(job, Status::Running));
        bus.publish(job, update(job, Status::Completed));

        let statuses: Vec<_> = std::iter::from_fn(|| sub.try_recv())
            .map(|e| match e.payload {
                EventPayload::JobUpdate(u) => u.status,
                _ => None,
            })
            .collect();
        assert_eq!(
            statuses,
            vec![Some(Status::Queued), Some(Status::Running), Some(Status::Completed)]
        );
    }
}
