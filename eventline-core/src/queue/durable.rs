//! SQLite-backed queue backend.
//!
//! The persisted `eventline:queue` record is the source of truth. Every
//! mutation re-reads it, applies the change and writes the full remaining list
//! back inside one write transaction, so several handles on the same file
//! (a host process and the `eventline` CLI) never overwrite each other.
//!
//! An in-memory mirror holds the last state seen. When the database cannot be
//! read or written the mirror takes over, so producers keep working.

use super::{drain_acked, drain_head, push_bounded, EventQueue, QueueBackend};
use crate::db::{keys, Database};
use crate::error::Result;
use crate::types::Event;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Durable FIFO queue.
pub struct DurableQueue {
    db: Arc<Database>,
    items: Mutex<VecDeque<Event>>,
    capacity: usize,
}

impl DurableQueue {
    /// Open the queue, loading whatever the previous process left behind.
    ///
    /// The database must already be migrated. A persisted record that cannot
    /// be decoded is logged and treated as empty.
    pub fn open(db: Arc<Database>, capacity: usize) -> Result<Self> {
        let items = decode(db.get_value(keys::QUEUE)?.as_deref());
        let over = items.len().saturating_sub(capacity);

        tracing::debug!(
            path = ?db.path(),
            pending = items.len(),
            "Opened durable queue"
        );

        let queue = Self {
            db,
            items: Mutex::new(items),
            capacity,
        };
        if over > 0 {
            let evicted = queue.mutate(|items| {
                let over = items.len().saturating_sub(capacity);
                drain_head(items, over)
            });
            tracing::info!(evicted, capacity, "Persisted queue exceeds capacity, evicted oldest");
        }
        Ok(queue)
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<Event>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current list, re-read from the record when the database is readable
    fn refreshed(&self) -> MutexGuard<'_, VecDeque<Event>> {
        let mut items = self.items();
        match self.db.get_value(keys::QUEUE) {
            Ok(raw) => *items = decode(raw.as_deref()),
            Err(e) => {
                tracing::debug!(error = %e, "Persisted queue unreadable, using in-memory view");
            }
        }
        items
    }

    /// Apply `change` to the persisted list in one transaction.
    ///
    /// Storage failures are logged and `change` is applied to the mirror
    /// alone. Returns whatever `change` returned.
    fn mutate(&self, change: impl FnOnce(&mut VecDeque<Event>) -> usize) -> usize {
        let mut items = self.items();
        let mut change = Some(change);
        let mut changed = 0;

        let written = self.db.update_value(keys::QUEUE, |raw| {
            *items = decode(raw.as_deref());
            if let Some(change) = change.take() {
                changed = change(&mut *items);
            }
            encode(&items)
        });

        if let Err(e) = written {
            tracing::warn!(error = %e, pending = items.len(), "Failed to persist event queue");
            if let Some(change) = change.take() {
                changed = change(&mut *items);
            }
        }
        changed
    }
}

fn decode(raw: Option<&str>) -> VecDeque<Event> {
    let Some(raw) = raw else {
        return VecDeque::new();
    };
    match serde_json::from_str::<Vec<Event>>(raw) {
        Ok(events) => events.into(),
        Err(e) => {
            tracing::warn!(error = %e, "Discarding unreadable persisted queue");
            VecDeque::new()
        }
    }
}

/// `None` for an empty list, which deletes the record
fn encode(items: &VecDeque<Event>) -> Result<Option<String>> {
    if items.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::to_string(items)?))
}

impl EventQueue for DurableQueue {
    fn store(&self, event: Event) {
        let capacity = self.capacity;
        let evicted = self.mutate(|items| push_bounded(items, event, capacity));
        if evicted > 0 {
            tracing::debug!(evicted, capacity, "Queue full, evicted oldest events");
        }
    }

    fn fetch(&self, limit: usize) -> Vec<Event> {
        self.refreshed().iter().take(limit).cloned().collect()
    }

    fn remove(&self, count: usize) {
        self.mutate(|items| drain_head(items, count));
    }

    fn acknowledge(&self, batch: &[Event]) -> usize {
        self.mutate(|items| drain_acked(items, batch))
    }

    fn count(&self) -> usize {
        self.refreshed().len()
    }

    fn clear(&self) {
        self.mutate(|items| {
            let cleared = items.len();
            items.clear();
            cleared
        });
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn backend(&self) -> QueueBackend {
        QueueBackend::Durable
    }
}
