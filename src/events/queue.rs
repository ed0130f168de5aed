//! Two-lane event completion queue
//!
//! Records reach the consumer either through the queued lane (FIFO, at most
//! one record per consumer, later events merged into it) or through the
//! single fast-path slot, used only while the consumer is draining and
//! nothing is queued. [`EventQueue::deliver`] picks the lane, so every
//! event lands in exactly one of them.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use super::completion::{ConsumerId, EventCompletion, EventFlags, PacketRef};

/// Per-consumer delivery state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsumerState {
    #[default]
    Idle,
    /// A record is waiting in the queued lane
    Queued,
    /// The last record was handed to the consumer during the current drain
    Delivered,
}

/// Lane an event was delivered through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Queued,
    FastPath,
}

#[derive(Debug, Default)]
struct ConsumerEntry {
    state: ConsumerState,
    user_data: Option<u64>,
    pending: Option<EventCompletion>,
}

#[derive(Debug, Default)]
struct Lanes {
    order: VecDeque<ConsumerId>,
    consumers: HashMap<ConsumerId, ConsumerEntry>,
    fast_path: Option<EventCompletion>,
    draining: bool,
}

/// Counters for the event queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventQueueStats {
    pub queued: u64,
    pub fast_path: u64,
    pub merged: u64,
    pub delivered: u64,
}

/// Event completion queue under a spin lock
#[derive(Debug, Default)]
pub struct EventQueue {
    lanes: spin::Mutex<Lanes>,
    queued: AtomicU64,
    fast_path: AtomicU64,
    merged: AtomicU64,
    delivered: AtomicU64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event for `consumer`
    pub fn deliver(
        &self,
        consumer: ConsumerId,
        events: EventFlags,
        packet: Option<PacketRef>,
    ) -> Lane {
        let mut lanes = self.lanes.lock();
        if let Some(record) = lanes.fast_path.as_mut().filter(|r| r.consumer == consumer) {
            record.merge(events, packet);
            self.merged.fetch_add(1, Ordering::Relaxed);
            return Lane::FastPath;
        }

        let use_fast_path = lanes.draining && lanes.order.is_empty() && lanes.fast_path.is_none();
        let entry = lanes.consumers.entry(consumer).or_default();

        if let (ConsumerState::Queued, Some(record)) = (entry.state, entry.pending.as_mut()) {
            record.merge(events, packet);
            self.merged.fetch_add(1, Ordering::Relaxed);
            return Lane::Queued;
        }

        let user_data = entry.user_data.unwrap_or(u64::from(consumer));
        let mut record = EventCompletion::new(consumer, events, user_data);
        record.packet = packet;

        if use_fast_path {
            entry.state = ConsumerState::Delivered;
            lanes.fast_path = Some(record);
            self.fast_path.fetch_add(1, Ordering::Relaxed);
            Lane::FastPath
        } else {
            entry.state = ConsumerState::Queued;
            entry.pending = Some(record);
            lanes.order.push_back(consumer);
            self.queued.fetch_add(1, Ordering::Relaxed);
            Lane::Queued
        }
    }

    /// Take the record parked in the fast-path slot
    pub fn take_fast(&self) -> Option<EventCompletion> {
        let record = self.lanes.lock().fast_path.take();
        if record.is_some() {
            self.delivered.fetch_add(1, Ordering::Relaxed);
        }
        record
    }

    /// Take the oldest queued record
    pub fn pop(&self) -> Option<EventCompletion> {
        let mut lanes = self.lanes.lock();
        while let Some(consumer) = lanes.order.pop_front() {
            let Some(entry) = lanes.consumers.get_mut(&consumer) else {
                continue;
            };
            if let Some(record) = entry.pending.take() {
                entry.state = ConsumerState::Delivered;
                self.delivered.fetch_add(1, Ordering::Relaxed);
                return Some(record);
            }
        }
        None
    }

    /// Mark the consumer as draining; enables the fast-path slot
    pub fn begin_drain(&self) {
        self.lanes.lock().draining = true;
    }

    /// End a drain; consumers served during it return to idle
    pub fn end_drain(&self) {
        let mut lanes = self.lanes.lock();
        lanes.draining = false;
        for entry in lanes.consumers.values_mut() {
            if entry.state == ConsumerState::Delivered {
                entry.state = ConsumerState::Idle;
            }
        }
    }

    /// Drop a consumer, returning any record still waiting for it
    pub fn remove(&self, consumer: ConsumerId) -> Option<EventCompletion> {
        let mut lanes = self.lanes.lock();
        let removed = lanes
            .consumers
            .remove(&consumer)
            .and_then(|mut entry| entry.pending.take());
        lanes.order.retain(|id| *id != consumer);
        // A consumer holds at most one record across both lanes
        if lanes.fast_path.as_ref().map(|r| r.consumer) == Some(consumer) {
            return lanes.fast_path.take();
        }
        removed
    }

    /// Value copied into every record for `consumer`
    pub fn set_user_data(&self, consumer: ConsumerId, user_data: u64) {
        let mut lanes = self.lanes.lock();
        let entry = lanes.consumers.entry(consumer).or_default();
        entry.user_data = Some(user_data);
        if let Some(record) = entry.pending.as_mut() {
            record.user_data = user_data;
        }
        if let Some(record) = lanes.fast_path.as_mut().filter(|r| r.consumer == consumer) {
            record.user_data = user_data;
        }
    }

    pub fn state(&self, consumer: ConsumerId) -> ConsumerState {
        self.lanes
            .lock()
            .consumers
            .get(&consumer)
            .map_or(ConsumerState::Idle, |entry| entry.state)
    }

    /// Records waiting in either lane
    pub fn len(&self) -> usize {
        let lanes = self.lanes.lock();
        lanes.order.len() + usize::from(lanes.fast_path.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> EventQueueStats {
        EventQueueStats {
            queued: self.queued.load(Ordering::Relaxed),
            fast_path: self.fast_path.load(Ordering::Relaxed),
            merged: self.merged.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::{BufferKind, BufferPool, BufferPoolConfig, GlobalBufferPool};
    use std::sync::Arc;

    fn packet(pool: &BufferPool, payload: &[u8]) -> PacketRef {
        let mut buffer = pool.acquire(1, false).unwrap().pop().unwrap();
        buffer.fill(payload).unwrap();
        PacketRef::new(buffer)
    }

    fn rx_pool() -> BufferPool {
        let config = BufferPoolConfig::new("rx").with_buffer_size(128).with_capacity(16);
        BufferPool::with_global(config, BufferKind::Rx, 1, Arc::new(GlobalBufferPool::new())).unwrap()
    }

    #[test]
    fn test_fifo_per_consumer() {
        let pool = rx_pool();
        let queue = EventQueue::new();

        queue.deliver(1, EventFlags::PACKET, Some(packet(&pool, b"A")));
        queue.deliver(2, EventFlags::PACKET, Some(packet(&pool, b"X")));
        queue.deliver(1, EventFlags::PACKET, Some(packet(&pool, b"B")));

        let first = queue.pop().unwrap();
        assert_eq!(first.consumer, 1);
        let packet = first.packet.as_ref().unwrap();
        assert_eq!(packet.num_bufs(), 2);
        assert_eq!(packet.to_vec(), b"AB");
        assert_eq!(packet.total_len, 2);

        let second = queue.pop().unwrap();
        assert_eq!(second.consumer, 2);
        assert!(queue.pop().is_none());
        assert_eq!(queue.stats().merged, 1);
    }

    #[test]
    fn test_fast_path_only_while_draining_with_empty_queue() {
        let queue = EventQueue::new();
        assert_eq!(queue.deliver(1, EventFlags::IN, None), Lane::Queued);

        queue.begin_drain();
        // Backlog exists: stay on the queued lane
        assert_eq!(queue.deliver(2, EventFlags::IN, None), Lane::Queued);
        assert_eq!(queue.pop().unwrap().consumer, 1);
        assert_eq!(queue.pop().unwrap().consumer, 2);

        assert_eq!(queue.deliver(3, EventFlags::IN, None), Lane::FastPath);
        // Slot occupied: next event is queued
        assert_eq!(queue.deliver(4, EventFlags::IN, None), Lane::Queued);
        assert_eq!(queue.len(), 2);

        let fast = queue.take_fast().unwrap();
        assert_eq!(fast.consumer, 3);
        assert!(queue.take_fast().is_none());
        assert_eq!(queue.pop().unwrap().consumer, 4);
        assert!(queue.is_empty());
        queue.end_drain();

        let stats = queue.stats();
        assert_eq!(stats.fast_path, 1);
        assert_eq!(stats.delivered, stats.queued + stats.fast_path);
    }

    #[test]
    fn test_state_machine() {
        let queue = EventQueue::new();
        assert_eq!(queue.state(9), ConsumerState::Idle);
        queue.deliver(9, EventFlags::OUT, None);
        assert_eq!(queue.state(9), ConsumerState::Queued);

        queue.begin_drain();
        queue.pop().unwrap();
        assert_eq!(queue.state(9), ConsumerState::Delivered);
        queue.end_drain();
        assert_eq!(queue.state(9), ConsumerState::Idle);
    }

    #[test]
    fn test_remove_clears_record() {
        let queue = EventQueue::new();
        queue.set_user_data(5, 0xfeed);
        queue.deliver(5, EventFlags::HUP, None);
        queue.deliver(6, EventFlags::IN, None);

        let removed = queue.remove(5).unwrap();
        assert_eq!(removed.user_data, 0xfeed);
        assert_eq!(queue.state(5), ConsumerState::Idle);

        // Reinsertion starts from a clean record with default user data
        queue.deliver(5, EventFlags::IN, None);
        assert_eq!(queue.pop().unwrap().consumer, 6);
        let again = queue.pop().unwrap();
        assert_eq!(again.events, EventFlags::IN);
        assert_eq!(again.user_data, 5);
    }
}
