//! # eventline-core
//!
//! Core library for eventline - a client-side event delivery pipeline.
//!
//! This library provides:
//! - A bounded, durable FIFO queue of pending events (SQLite or in-memory)
//! - Batch delivery over HTTP with retry classification and rate-limit cooldown
//! - A flush controller that drains the queue one batch at a time
//! - The [`Tracker`] facade applications call
//! - Configuration management and logging infrastructure
//!
//! ## Architecture
//!
//! Events flow through three stages:
//! - **Capture:** `Tracker::track` validates and builds the event, then hands it
//!   to a single writer task
//! - **Queue:** the writer stores it; the queue survives restarts when durable
//! - **Delivery:** the flush controller sends batches and removes them only
//!   once the server has answered
//!
//! ## Example
//!
//! ```rust,no_run
//! use eventline_core::{configure, Config, Properties, TrackerSlot};
//!
//! # async fn run() -> eventline_core::Result<()> {
//! let slot = TrackerSlot::new();
//! let tracker = configure(&slot, Config::load()?)?;
//!
//! tracker.track("app_opened", Properties::new());
//! tracker.shutdown().await;
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use db::Database;
pub use delivery::{BatchSender, DeliveryClient, DeliveryFailure, DeliveryOutcome, FailureKind};
pub use error::{Error, Result};
pub use flush::{FlushController, FlushReport, FlushState, FlushStats, StopReason};
pub use queue::{EventQueue, QueueBackend};
pub use tracker::{configure, Tracker, TrackerBuilder, TrackerSlot};
pub use types::*;

// Public modules
pub mod config;
pub mod context;
pub mod db;
pub mod delivery;
pub mod error;
pub mod flush;
pub mod identity;
pub mod logging;
pub mod queue;
pub mod tracker;
pub mod types;
pub mod validation;
