//! Pending event queue
//!
//! A bounded FIFO of events waiting for delivery. Insertion order is delivery
//! priority; when the queue is full the *oldest* events are evicted.
//!
//! ## Backends
//!
//! | Backend | Lifetime | Type |
//! |---------|----------|------|
//! | Durable | survives restart (SQLite record) | [`DurableQueue`] |
//! | Ephemeral | process lifetime | [`MemoryQueue`] |
//!
//! The backend is chosen once, at construction, by [`probe_backend`] and then
//! injected as an `Arc<dyn EventQueue>`.
//!
//! ## Failure semantics
//!
//! Queue operations never fail the caller. A failed write to the backing
//! medium is logged and the in-memory view stays authoritative, so producers
//! are never blocked or broken by storage errors.

mod durable;
mod memory;

pub use durable::DurableQueue;
pub use memory::MemoryQueue;

use crate::config::{BackendPreference, QueueConfig};
use crate::db::{keys, Database};
use crate::error::{Error, Result};
use crate::types::Event;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// FIFO store of pending events with bounded capacity.
pub trait EventQueue: Send + Sync {
    /// Append to the tail, evicting from the head while over capacity.
    fn store(&self, event: Event);

    /// Up to `limit` events from the head. Never mutates the queue.
    fn fetch(&self, limit: usize) -> Vec<Event>;

    /// Delete the first `count` events; clamps when `count` exceeds the length.
    fn remove(&self, count: usize);

    /// Remove the events of a sent batch that are still at the head.
    ///
    /// Events are matched by `client_event_id`. Batch events evicted or
    /// cleared while the batch was in flight are skipped, and events stored
    /// after the batch was fetched are never touched. Returns how many were
    /// removed.
    fn acknowledge(&self, batch: &[Event]) -> usize;

    /// Number of pending events
    fn count(&self) -> usize;

    /// Delete every pending event
    fn clear(&self);

    /// Maximum number of retained events
    fn capacity(&self) -> usize;

    /// Which backend this queue persists to
    fn backend(&self) -> QueueBackend;

    /// Check if there are no pending events
    fn is_empty(&self) -> bool {
        self.count() == 0
    }
}

/// Result of the storage capability probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBackend {
    /// SQLite-backed, survives restart
    Durable,
    /// In-process only
    Ephemeral,
}

impl fmt::Display for QueueBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueBackend::Durable => write!(f, "durable"),
            QueueBackend::Ephemeral => write!(f, "ephemeral"),
        }
    }
}

/// Decide which backend to use for this configuration.
///
/// `auto` and `durable` preferences probe the database file with a
/// write/read/delete round trip; any failure yields [`QueueBackend::Ephemeral`].
pub fn probe_backend(config: &QueueConfig) -> QueueBackend {
    if config.backend == BackendPreference::Ephemeral {
        return QueueBackend::Ephemeral;
    }

    let path = config.database_path();
    match probe_storage(&path) {
        Ok(()) => QueueBackend::Durable,
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Durable storage unavailable, falling back to in-memory queue"
            );
            QueueBackend::Ephemeral
        }
    }
}

fn probe_storage(path: &Path) -> Result<()> {
    let db = Database::open(path)?;
    db.migrate()?;
    db.put_value(keys::PROBE, "ok")?;
    let read_back = db.get_value(keys::PROBE)?;
    db.delete_value(keys::PROBE)?;

    match read_back.as_deref() {
        Some("ok") => Ok(()),
        _ => Err(Error::Storage("probe record did not round-trip".to_string())),
    }
}

/// A queue plus the database behind it, if durable.
pub struct QueueStorage {
    pub queue: Arc<dyn EventQueue>,
    /// Shared with the identity records when the backend is durable
    pub database: Option<Arc<Database>>,
}

/// Build the queue for a configuration: probe once, then construct the backend.
pub fn open_storage(config: &QueueConfig) -> Result<QueueStorage> {
    let capacity = config.effective_capacity();
    if capacity != config.capacity {
        tracing::warn!(
            configured = config.capacity,
            effective = capacity,
            "Queue capacity below minimum, clamping"
        );
    }

    match probe_backend(config) {
        QueueBackend::Durable => {
            let db = Arc::new(Database::open(&config.database_path())?);
            db.migrate()?;
            let queue = DurableQueue::open(Arc::clone(&db), capacity)?;
            Ok(QueueStorage {
                queue: Arc::new(queue),
                database: Some(db),
            })
        }
        QueueBackend::Ephemeral if config.backend == BackendPreference::Durable => {
            Err(Error::Config(format!(
                "queue.backend = \"durable\" but storage at {} is unavailable",
                config.database_path().display()
            )))
        }
        QueueBackend::Ephemeral => Ok(QueueStorage {
            queue: Arc::new(MemoryQueue::new(capacity)),
            database: None,
        }),
    }
}

/// Build just the queue for a configuration
pub fn open_queue(config: &QueueConfig) -> Result<Arc<dyn EventQueue>> {
    open_storage(config).map(|storage| storage.queue)
}

/// Push onto the tail and evict from the head until within capacity.
///
/// Returns the number of evicted events.
pub(crate) fn push_bounded(items: &mut VecDeque<Event>, event: Event, capacity: usize) -> usize {
    items.push_back(event);
    let mut evicted = 0;
    while items.len() > capacity {
        items.pop_front();
        evicted += 1;
    }
    evicted
}

/// Drop the first `count` events, clamping to the current length.
pub(crate) fn drain_head(items: &mut VecDeque<Event>, count: usize) -> usize {
    let count = count.min(items.len());
    items.drain(..count);
    count
}

/// Pop the leading run of events whose id belongs to `batch`.
pub(crate) fn drain_acked(items: &mut VecDeque<Event>, batch: &[Event]) -> usize {
    let sent: HashSet<&str> = batch.iter().map(|e| e.client_event_id.as_str()).collect();
    let mut removed = 0;
    while items
        .front()
        .is_some_and(|e| sent.contains(e.client_event_id.as_str()))
    {
        items.pop_front();
        removed += 1;
    }
    removed
}
