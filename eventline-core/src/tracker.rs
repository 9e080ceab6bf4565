//! Public tracking facade
//!
//! [`Tracker`] is a cheap, cloneable handle over the whole pipeline:
//!
//! ```text
//! track() ──► writer task ──► EventQueue ──► FlushController ──► BatchSender
//!   (sync)     (single consumer)     ▲              │
//!                                    └── ack/drop ◄─┘
//! ```
//!
//! `track` never blocks and never fails the caller: it validates, builds the
//! event, and hands it to a single writer task, which is the only caller of
//! [`EventQueue::store`]. Operations that read the queue (`flush`,
//! `pending_count`, `clear`) first pass a barrier through the same channel,
//! so everything tracked before them has been stored.
//!
//! There is no global instance. A host that wants one shared tracker keeps a
//! [`TrackerSlot`] and calls [`configure`], which builds the tracker on first
//! use and returns the same handle afterwards.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::context::{ContextSource, DeviceContext, DeviceInfo};
use crate::delivery::{BatchSender, DeliveryClient};
use crate::error::{Error, Result};
use crate::flush::{ErrorObserver, FlushController, FlushReport, FlushStats};
use crate::identity::IdentityStore;
use crate::queue::{open_storage, EventQueue, QueueBackend};
use crate::types::{Event, EventOrigin, Properties};
use crate::validation::validate_event;

/// Work for the writer task
enum Command {
    Store(Event),
    Barrier(oneshot::Sender<()>),
}

/// Handle to a running pipeline
#[derive(Clone)]
pub struct Tracker {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    queue: Arc<dyn EventQueue>,
    identity: Arc<IdentityStore>,
    /// `None` when delivery is disabled; events are still queued
    controller: Option<Arc<FlushController>>,
    commands: mpsc::UnboundedSender<Command>,
    session_id: String,
    platform: String,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(timer) = self
            .timer
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            timer.abort();
        }
    }
}

impl Tracker {
    /// Start building a tracker from configuration
    pub fn builder(config: Config) -> TrackerBuilder {
        TrackerBuilder {
            config,
            queue: None,
            identity: None,
            sender: None,
            context: None,
            observer: None,
            autostart: true,
        }
    }

    // ============================================
    // Producer surface
    // ============================================

    /// Record an event. Invalid events are logged and dropped.
    pub fn track(&self, name: &str, properties: Properties) {
        let mut merged = self.inner.identity.super_properties();
        merged.extend(properties);

        if let Err(e) = validate_event(name, &merged) {
            tracing::warn!(event = name, error = %e, "Dropping invalid event");
            return;
        }

        let origin = EventOrigin {
            user_id: Some(self.inner.identity.distinct_id()),
            session_id: self.inner.session_id.clone(),
            platform: self.inner.platform.clone(),
            environment: self.inner.config.tracker.environment.clone(),
        };
        let event = Event::new(name, merged, &origin);

        if self.inner.commands.send(Command::Store(event)).is_err() {
            tracing::warn!(event = name, "Writer task stopped, event lost");
        }
    }

    /// Associate subsequent events with `user_id`
    pub fn identify(&self, user_id: &str) {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            tracing::warn!("Ignoring identify with an empty user id");
            return;
        }
        self.inner.identity.set_user_id(user_id);
        tracing::debug!(user_id, "Identified user");
    }

    /// Forget the identified user and super-properties, start a new anonymous id
    pub fn reset(&self) {
        let anonymous_id = self.inner.identity.reset();
        tracing::debug!(%anonymous_id, "Identity reset");
    }

    /// Merge properties into every subsequent event
    pub fn register(&self, properties: Properties) {
        self.inner.identity.register(properties);
    }

    pub fn unregister(&self, key: &str) {
        self.inner.identity.unregister(key);
    }

    pub fn anonymous_id(&self) -> String {
        self.inner.identity.anonymous_id()
    }

    pub fn user_id(&self) -> Option<String> {
        self.inner.identity.user_id()
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    // ============================================
    // Queue and delivery
    // ============================================

    /// Deliver everything queued so far
    pub async fn flush(&self) -> FlushReport {
        self.barrier().await;
        match &self.inner.controller {
            Some(controller) => controller.flush().await,
            None => {
                tracing::debug!("Delivery disabled, flush skipped");
                FlushReport::skipped()
            }
        }
    }

    /// Number of events waiting for delivery
    pub async fn pending_count(&self) -> usize {
        self.barrier().await;
        self.inner.queue.count()
    }

    /// Discard every pending event
    pub async fn clear(&self) {
        self.barrier().await;
        self.inner.queue.clear();
        tracing::info!("Pending events cleared");
    }

    /// Which backend the queue persists to
    pub fn backend(&self) -> QueueBackend {
        self.inner.queue.backend()
    }

    /// Whether batches are sent at all
    pub fn delivery_enabled(&self) -> bool {
        self.inner.controller.is_some()
    }

    /// Cumulative flush statistics
    pub fn stats(&self) -> FlushStats {
        self.inner
            .controller
            .as_ref()
            .map(|controller| controller.stats())
            .unwrap_or_default()
    }

    // ============================================
    // Lifecycle
    // ============================================

    /// Start the flush timer. No-op if running or delivery is disabled.
    pub fn start(&self) {
        let Some(controller) = &self.inner.controller else {
            return;
        };
        let mut timer = self.timer();
        if timer.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let period = self.inner.config.flush.interval();
        *timer = Some(controller.spawn_timer(period));
        tracing::debug!(period_secs = period.as_secs(), "Flush timer started");
    }

    /// Stop the flush timer
    pub fn stop(&self) {
        if let Some(handle) = self.timer().take() {
            handle.abort();
            tracing::debug!("Flush timer stopped");
        }
    }

    /// Start a final flush without waiting for it
    pub fn teardown(&self) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let tracker = self.clone();
                handle.spawn(async move {
                    tracker.flush().await;
                });
            }
            Err(_) => {
                tracing::warn!("No async runtime available, teardown flush skipped");
            }
        }
    }

    /// Stop the timer, store everything tracked so far, and run a final flush.
    ///
    /// A pass already in flight is awaited first, so the final flush always
    /// runs. The report is skipped only when delivery is disabled.
    pub async fn shutdown(&self) -> FlushReport {
        self.stop();
        self.barrier().await;
        let report = match &self.inner.controller {
            Some(controller) => controller.flush_when_idle().await,
            None => FlushReport::skipped(),
        };
        tracing::info!(
            delivered = report.delivered,
            pending = self.inner.queue.count(),
            "Tracker shut down"
        );
        report
    }

    fn timer(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait until the writer has processed every command sent before this call
    async fn barrier(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inner.commands.send(Command::Barrier(tx)).is_err() {
            return;
        }
        let _ = rx.await;
    }
}

/// The writer task: sole caller of `EventQueue::store`
async fn run_writer(
    mut commands: mpsc::UnboundedReceiver<Command>,
    queue: Arc<dyn EventQueue>,
    controller: Option<Arc<FlushController>>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Store(event) => {
                queue.store(event);

                if let Some(controller) = &controller {
                    if queue.count() >= controller.batch_size() {
                        let controller = Arc::clone(controller);
                        tokio::spawn(async move {
                            controller.flush().await;
                        });
                    }
                }
            }
            Command::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::debug!("Writer task finished");
}

/// Assembles a [`Tracker`], with optional replacements for each component
pub struct TrackerBuilder {
    config: Config,
    queue: Option<Arc<dyn EventQueue>>,
    identity: Option<Arc<IdentityStore>>,
    sender: Option<Arc<dyn BatchSender>>,
    context: Option<Arc<dyn ContextSource>>,
    observer: Option<ErrorObserver>,
    autostart: bool,
}

impl TrackerBuilder {
    /// Use this queue instead of probing storage
    pub fn queue(mut self, queue: Arc<dyn EventQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn identity(mut self, identity: Arc<IdentityStore>) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Use this sender instead of the HTTP client
    pub fn sender(mut self, sender: Arc<dyn BatchSender>) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn context_source(mut self, context: Arc<dyn ContextSource>) -> Self {
        self.context = Some(context);
        self
    }

    /// Called once per failed batch
    pub fn on_error(mut self, observer: ErrorObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Whether `build` starts the flush timer (default true)
    pub fn autostart(mut self, autostart: bool) -> Self {
        self.autostart = autostart;
        self
    }

    /// Build the tracker. Must be called inside a tokio runtime.
    pub fn build(self) -> Result<Tracker> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::Delivery("tracker requires a tokio runtime".to_string()))?;
        let config = self.config;
        config.flush.validate()?;

        let (queue, identity) = match (self.queue, self.identity) {
            (Some(queue), identity) => (
                queue,
                identity.unwrap_or_else(|| Arc::new(IdentityStore::in_memory())),
            ),
            (None, identity) => {
                let storage = open_storage(&config.queue)?;
                let identity = identity.unwrap_or_else(|| match storage.database {
                    Some(db) => Arc::new(IdentityStore::with_database(db)),
                    None => Arc::new(IdentityStore::in_memory()),
                });
                (storage.queue, identity)
            }
        };

        if let Some(version) = &config.tracker.app_version {
            identity.set_app_version(version);
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let device = DeviceInfo::detect();
        let platform = device.platform.clone();
        let context = self.context.unwrap_or_else(|| {
            Arc::new(DeviceContext::with_device(
                device,
                Arc::clone(&identity),
                session_id.clone(),
            ))
        });

        let controller = if config.tracker.enabled {
            let sender: Arc<dyn BatchSender> = match self.sender {
                Some(sender) => sender,
                None => Arc::new(DeliveryClient::new(&config.tracker, &config.delivery)?),
            };
            let mut controller =
                FlushController::new(Arc::clone(&queue), sender, context, &config.flush);
            if let Some(observer) = self.observer {
                controller = controller.with_observer(observer);
            }
            Some(Arc::new(controller))
        } else {
            tracing::info!("Delivery disabled, events will only be queued");
            None
        };

        let (commands, receiver) = mpsc::unbounded_channel();
        runtime.spawn(run_writer(
            receiver,
            Arc::clone(&queue),
            controller.clone(),
        ));

        tracing::info!(
            backend = %queue.backend(),
            pending = queue.count(),
            capacity = queue.capacity(),
            delivery = controller.is_some(),
            "Tracker started"
        );

        let tracker = Tracker {
            inner: Arc::new(Inner {
                config,
                queue,
                identity,
                controller,
                commands,
                session_id,
                platform,
                timer: Mutex::new(None),
            }),
        };
        if self.autostart {
            tracker.start();
        }
        Ok(tracker)
    }
}

/// Holds at most one tracker. See [`configure`].
#[derive(Default)]
pub struct TrackerSlot {
    tracker: Mutex<Option<Tracker>>,
}

impl TrackerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// The configured tracker, if any
    pub fn get(&self) -> Option<Tracker> {
        self.tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Build a tracker into `slot`, or return the one already there.
///
/// Only the first successful call uses `config`; later calls log and return
/// the existing handle.
pub fn configure(slot: &TrackerSlot, config: Config) -> Result<Tracker> {
    let mut current = slot
        .tracker
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if let Some(tracker) = current.as_ref() {
        tracing::debug!("Tracker already configured, returning existing handle");
        return Ok(tracker.clone());
    }

    let tracker = Tracker::builder(config).build()?;
    *current = Some(tracker.clone());
    Ok(tracker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendPreference, QueueConfig};
    use crate::delivery::{DeliveryFailure, DeliveryOutcome, FailureKind};
    use crate::flush::test_support::{FixedContext, ScriptedSender};
    use crate::queue::MemoryQueue;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_config() -> Config {
        let mut config = Config::default();
        config.queue = QueueConfig {
            backend: BackendPreference::Ephemeral,
            ..Default::default()
        };
        config.flush.inter_batch_delay_ms = 0;
        config.tracker.environment = "test".to_string();
        config
    }

    fn tracker_with(sender: Arc<ScriptedSender>, config: Config) -> (Tracker, Arc<MemoryQueue>) {
        let queue = Arc::new(MemoryQueue::new(100));
        let tracker = Tracker::builder(config)
            .queue(queue.clone())
            .sender(sender)
            .context_source(Arc::new(FixedContext))
            .autostart(false)
            .build()
            .unwrap();
        (tracker, queue)
    }

    fn props(value: serde_json::Value) -> Properties {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_track_then_flush() {
        let sender = Arc::new(ScriptedSender::default());
        let (tracker, queue) = tracker_with(sender.clone(), test_config());

        tracker.track("a", Properties::new());
        tracker.track("b", Properties::new());
        assert_eq!(tracker.pending_count().await, 2);

        let report = tracker.flush().await;
        assert_eq!(report.delivered, 2);
        assert_eq!(queue.count(), 0);
        assert_eq!(sender.batches(), vec![vec!["a", "b"]]);
    }

    #[tokio::test]
    async fn test_batch_size_one_sends_each_event() {
        let sender = Arc::new(ScriptedSender::default());
        let mut config = test_config();
        config.flush.batch_size = 1;
        config.flush.flush_interval_secs = 3600;
        let (tracker, _queue) = tracker_with(sender.clone(), config);

        tracker.track("a", Properties::new());
        tracker.track("b", Properties::new());
        tracker.flush().await;

        // Each store crosses the threshold, so a background pass may have
        // sent the batches before the explicit flush ran
        assert_eq!(sender.batches(), vec![vec!["a"], vec!["b"]]);
        assert_eq!(tracker.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_invalid_events_are_dropped() {
        let sender = Arc::new(ScriptedSender::default());
        let (tracker, _queue) = tracker_with(sender, test_config());

        tracker.track("1-invalid", Properties::new());
        tracker.track("", Properties::new());
        tracker.track("valid", Properties::new());
        assert_eq!(tracker.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_event_carries_identity_and_super_properties() {
        let sender = Arc::new(ScriptedSender::default());
        let (tracker, queue) = tracker_with(sender, test_config());

        let anonymous = tracker.anonymous_id();
        tracker.register(props(json!({"plan": "free", "source": "ad"})));
        tracker.track("before", props(json!({"plan": "trial"})));
        tracker.identify("user-9");
        tracker.track("after", Properties::new());
        tracker.pending_count().await;

        let events = queue.fetch(10);
        assert_eq!(events[0].user_id.as_deref(), Some(anonymous.as_str()));
        assert_eq!(events[0].properties["plan"], json!("trial"));
        assert_eq!(events[0].properties["source"], json!("ad"));
        assert_eq!(events[0].environment, "test");
        assert_eq!(events[0].session_id, tracker.session_id());
        assert_eq!(events[1].user_id.as_deref(), Some("user-9"));

        tracker.unregister("source");
        tracker.reset();
        assert_eq!(tracker.user_id(), None);
        assert_ne!(tracker.anonymous_id(), anonymous);
    }

    #[tokio::test]
    async fn test_super_properties_count_toward_key_limit() {
        use crate::validation::MAX_PROPERTY_KEYS;

        let sender = Arc::new(ScriptedSender::default());
        let (tracker, _queue) = tracker_with(sender, test_config());

        let mut supers = Properties::new();
        for i in 0..MAX_PROPERTY_KEYS {
            supers.insert(format!("super_{}", i), json!(i));
        }
        tracker.register(supers);

        tracker.track("fits", Properties::new());
        tracker.track("overflows", props(json!({"extra": true})));
        assert_eq!(tracker.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_running_pass() {
        let sender =
            Arc::new(ScriptedSender::default().with_delay(std::time::Duration::from_millis(100)));
        let mut config = test_config();
        config.flush.batch_size = 1;
        let (tracker, queue) = tracker_with(sender.clone(), config);

        // Crossing the threshold starts a background pass
        tracker.track("a", Properties::new());
        tracker.pending_count().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        tracker.track("b", Properties::new());

        let report = tracker.shutdown().await;
        assert!(!report.skipped);
        assert_eq!(queue.count(), 0);
        assert_eq!(sender.batches().concat(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_clear() {
        let sender = Arc::new(ScriptedSender::default());
        let (tracker, _queue) = tracker_with(sender.clone(), test_config());

        tracker.track("a", Properties::new());
        tracker.clear().await;
        assert_eq!(tracker.pending_count().await, 0);
        tracker.flush().await;
        assert!(sender.batches().is_empty());
    }

    #[tokio::test]
    async fn test_delivery_disabled_only_queues() {
        let mut config = test_config();
        config.tracker.enabled = false;
        let tracker = Tracker::builder(config).autostart(false).build().unwrap();

        tracker.track("a", Properties::new());
        let report = tracker.flush().await;
        assert!(report.skipped);
        assert!(!tracker.delivery_enabled());
        assert_eq!(tracker.pending_count().await, 1);
        assert_eq!(tracker.backend(), QueueBackend::Ephemeral);
    }

    #[tokio::test]
    async fn test_observer_receives_failures() {
        let sender = Arc::new(ScriptedSender::new(vec![DeliveryOutcome::NonRetryable {
            kind: FailureKind::Unauthorized,
        }]));
        let failures = Arc::new(AtomicUsize::new(0));
        let counter = failures.clone();
        let tracker = Tracker::builder(test_config())
            .queue(Arc::new(MemoryQueue::new(100)))
            .sender(sender)
            .context_source(Arc::new(FixedContext))
            .on_error(Arc::new(move |_failure: &DeliveryFailure| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .autostart(false)
            .build()
            .unwrap();

        tracker.track("a", Properties::new());
        let report = tracker.flush().await;
        assert_eq!(report.dropped, 1);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_start_stop_timer() {
        let sender = Arc::new(ScriptedSender::default());
        let mut config = test_config();
        config.flush.flush_interval_secs = 1;
        let (tracker, queue) = tracker_with(sender, config);

        tracker.start();
        tracker.start();
        tracker.track("a", Properties::new());
        tokio::time::sleep(std::time::Duration::from_millis(1300)).await;
        assert_eq!(queue.count(), 0);

        tracker.stop();
        tracker.track("b", Properties::new());
        tokio::time::sleep(std::time::Duration::from_millis(1300)).await;
        assert_eq!(queue.count(), 1);
    }

    #[tokio::test]
    async fn test_teardown_flushes_in_background() {
        let sender = Arc::new(ScriptedSender::default());
        let (tracker, queue) = tracker_with(sender, test_config());

        tracker.track("a", Properties::new());
        tracker.teardown();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(queue.count(), 0);
    }

    #[tokio::test]
    async fn test_configure_is_idempotent() {
        let slot = TrackerSlot::new();
        let mut config = test_config();
        config.tracker.enabled = false;

        let first = configure(&slot, config.clone()).unwrap();
        let mut other = config;
        other.tracker.environment = "staging".to_string();
        let second = configure(&slot, other).unwrap();

        assert_eq!(first.session_id(), second.session_id());
        assert!(Arc::ptr_eq(&first.inner, &second.inner));
        assert!(slot.get().is_some());
    }

    #[test]
    fn test_build_requires_runtime() {
        let result = Tracker::builder(test_config()).build();
        assert!(matches!(result, Err(Error::Delivery(_))));
    }
}
