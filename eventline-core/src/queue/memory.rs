//! In-process queue backend (process lifetime only).

use super::{drain_acked, drain_head, push_bounded, EventQueue, QueueBackend};
use crate::types::Event;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Ephemeral FIFO queue.
pub struct MemoryQueue {
    items: Mutex<VecDeque<Event>>,
    capacity: usize,
}

impl MemoryQueue {
    /// Create an empty queue holding at most `capacity` events
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<Event>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EventQueue for MemoryQueue {
    fn store(&self, event: Event) {
        let evicted = push_bounded(&mut self.items(), event, self.capacity);
        if evicted > 0 {
            tracing::debug!(evicted, capacity = self.capacity, "Queue full, evicted oldest events");
        }
    }

    fn fetch(&self, limit: usize) -> Vec<Event> {
        self.items().iter().take(limit).cloned().collect()
    }

    fn remove(&self, count: usize) {
        drain_head(&mut self.items(), count);
    }

    fn acknowledge(&self, batch: &[Event]) -> usize {
        drain_acked(&mut self.items(), batch)
    }

    fn count(&self) -> usize {
        self.items().len()
    }

    fn clear(&self) {
        self.items().clear();
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn backend(&self) -> QueueBackend {
        QueueBackend::Ephemeral
    }
}
