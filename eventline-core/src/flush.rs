//! Flush controller
//!
//! Drains the queue in batches through a [`BatchSender`]. One pass runs at a
//! time; a request that arrives while a pass is running returns immediately
//! with a skipped report.
//!
//! Within a pass each batch is peeked, sent, and then acknowledged:
//! - success removes the batch and moves on to the next one
//! - a non-retryable failure removes (drops) the batch and moves on
//! - a retryable failure or rate limit leaves the batch at the head and ends
//!   the pass
//!
//! Removal happens strictly after the sender returns, so an interrupted pass
//! re-sends rather than loses events. Removal is by event id: events stored
//! while a batch is in flight are never taken for part of it.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::FlushConfig;
use crate::context::ContextSource;
use crate::delivery::{BatchSender, DeliveryFailure, DeliveryOutcome, FailureKind};
use crate::queue::EventQueue;
use crate::types::Event;

/// Callback invoked once per failed batch
pub type ErrorObserver = Arc<dyn Fn(&DeliveryFailure) + Send + Sync>;

/// Whether a pass is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushState {
    Idle,
    Flushing,
}

/// Why a pass ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The queue is empty
    Drained,
    /// A cooldown is running; nothing was sent
    RateLimited,
    /// The head batch failed and was kept for a later pass
    Retryable(FailureKind),
}

/// Result of one flush request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Another pass was already running, or delivery is disabled
    pub skipped: bool,
    /// Requests made during this pass
    pub batches: usize,
    /// Events acknowledged by the server
    pub delivered: usize,
    /// Events dropped after a non-retryable rejection
    pub dropped: usize,
    /// `None` when skipped
    pub stop_reason: Option<StopReason>,
}

impl FlushReport {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }
}

/// Cumulative flush statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushStats {
    /// Passes that ran
    pub passes: usize,
    /// Requests that found a pass already running
    pub skipped: usize,
    /// Number of send calls made
    pub batches_sent: usize,
    /// Total events acknowledged
    pub events_delivered: usize,
    /// Total events dropped
    pub events_dropped: usize,
    /// Number of failed batches
    pub failures: usize,
}

/// Resets the state to idle when the pass ends, however it ends
struct PassGuard<'a> {
    flushing: &'a AtomicBool,
    idle: &'a Notify,
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.flushing.store(false, Ordering::Release);
        self.idle.notify_waiters();
    }
}

/// Orchestrates queue -> batch -> sender -> acknowledge cycles
pub struct FlushController {
    queue: Arc<dyn EventQueue>,
    sender: Arc<dyn BatchSender>,
    context: Arc<dyn ContextSource>,
    batch_size: usize,
    inter_batch_delay: Duration,
    observer: Option<ErrorObserver>,
    flushing: AtomicBool,
    idle: Notify,
    stats: Mutex<FlushStats>,
}

impl FlushController {
    pub fn new(
        queue: Arc<dyn EventQueue>,
        sender: Arc<dyn BatchSender>,
        context: Arc<dyn ContextSource>,
        config: &FlushConfig,
    ) -> Self {
        Self {
            queue,
            sender,
            context,
            batch_size: config.batch_size.max(1),
            inter_batch_delay: config.inter_batch_delay(),
            observer: None,
            flushing: AtomicBool::new(false),
            idle: Notify::new(),
            stats: Mutex::new(FlushStats::default()),
        }
    }

    /// Register the error observer
    pub fn with_observer(mut self, observer: ErrorObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn state(&self) -> FlushState {
        if self.flushing.load(Ordering::Acquire) {
            FlushState::Flushing
        } else {
            FlushState::Idle
        }
    }

    /// Snapshot of the cumulative statistics
    pub fn stats(&self) -> FlushStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Run one pass, or return at once if a pass is already running
    pub async fn flush(&self) -> FlushReport {
        if self
            .flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Flush already in progress, skipping");
            self.record(|stats| stats.skipped += 1);
            return FlushReport::skipped();
        }
        let _guard = PassGuard {
            flushing: &self.flushing,
            idle: &self.idle,
        };

        let report = self.run_pass().await;

        self.record(|stats| {
            stats.passes += 1;
            stats.batches_sent += report.batches;
            stats.events_delivered += report.delivered;
            stats.events_dropped += report.dropped;
        });
        if report.batches > 0 {
            tracing::info!(
                batches = report.batches,
                delivered = report.delivered,
                dropped = report.dropped,
                pending = self.queue.count(),
                stop_reason = ?report.stop_reason,
                "Flush pass finished"
            );
        }
        report
    }

    /// Wait for any running pass to finish, then run one of our own.
    ///
    /// Never returns a skipped report.
    pub async fn flush_when_idle(&self) -> FlushReport {
        loop {
            // Registered before trying, so a pass ending in between still wakes us
            let idle = self.idle.notified();
            let report = self.flush().await;
            if !report.skipped {
                return report;
            }
            idle.await;
        }
    }

    async fn run_pass(&self) -> FlushReport {
        let mut report = FlushReport::default();

        loop {
            if self.queue.is_empty() {
                report.stop_reason = Some(StopReason::Drained);
                break;
            }
            if self.sender.is_rate_limited() {
                report.stop_reason = Some(StopReason::RateLimited);
                break;
            }

            let batch = self.queue.fetch(self.batch_size);
            if batch.is_empty() {
                report.stop_reason = Some(StopReason::Drained);
                break;
            }

            let context = self.context.current();
            let outcome = self.sender.send(&batch, &context).await;
            report.batches += 1;

            match outcome {
                DeliveryOutcome::Success => {
                    self.acknowledge(&batch);
                    report.delivered += batch.len();

                    if !self.queue.is_empty() && !self.inter_batch_delay.is_zero() {
                        tokio::time::sleep(self.inter_batch_delay).await;
                    }
                }
                DeliveryOutcome::NonRetryable { kind } => {
                    self.acknowledge(&batch);
                    report.dropped += batch.len();
                    tracing::warn!(
                        dropped = batch.len(),
                        kind = %kind,
                        "Batch rejected by server, dropping it"
                    );
                    self.notify(DeliveryFailure {
                        outcome,
                        event_count: batch.len(),
                        dropped: true,
                    });
                }
                DeliveryOutcome::RateLimited { .. } => {
                    self.notify(DeliveryFailure {
                        outcome,
                        event_count: batch.len(),
                        dropped: false,
                    });
                    report.stop_reason = Some(StopReason::RateLimited);
                    break;
                }
                DeliveryOutcome::Retryable { kind } => {
                    self.notify(DeliveryFailure {
                        outcome,
                        event_count: batch.len(),
                        dropped: false,
                    });
                    report.stop_reason = Some(StopReason::Retryable(kind));
                    break;
                }
            }
        }

        report
    }

    /// Remove the sent batch from the queue head
    fn acknowledge(&self, batch: &[Event]) {
        let removed = self.queue.acknowledge(batch);
        if removed < batch.len() {
            tracing::debug!(
                sent = batch.len(),
                removed,
                "Part of the batch left the queue while in flight"
            );
        }
    }

    /// Invoke the observer, containing any panic it raises
    fn notify(&self, failure: DeliveryFailure) {
        self.record(|stats| stats.failures += 1);

        let Some(observer) = &self.observer else {
            return;
        };
        if catch_unwind(AssertUnwindSafe(|| observer(&failure))).is_err() {
            tracing::error!(outcome = %failure.outcome, "Error observer panicked");
        }
    }

    fn record(&self, update: impl FnOnce(&mut FlushStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        update(&mut stats);
    }

    /// Spawn a task that flushes every `period`. Abort the handle to stop it.
    pub fn spawn_timer(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let report = controller.flush().await;
                tracing::trace!(?report, "Timer flush");
            }
        })
    }
}
