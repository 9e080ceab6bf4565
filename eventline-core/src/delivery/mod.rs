//! Network delivery of event batches
//!
//! One [`BatchSender::send`] call is one network exchange. The HTTP result is
//! classified into a [`DeliveryOutcome`] that tells the flush loop whether to
//! acknowledge, keep, or drop the batch:
//!
//! | Outcome | Condition | Batch |
//! |---------|-----------|-------|
//! | `Success` | HTTP 2xx | removed |
//! | `RateLimited` | HTTP 429, or a local cooldown still running | kept |
//! | `NonRetryable` | HTTP 4xx except 429 | dropped |
//! | `Retryable` | HTTP 5xx, other statuses, transport error, timeout | kept |
//!
//! Failures are values, not errors: nothing in this module returns
//! [`crate::Error`] once the client is built.

mod client;
mod clock;
mod transport;

pub use client::{classify_status, parse_retry_after, DeliveryClient, API_KEY_HEADER, EVENTS_PATH};
pub use clock::{Clock, ManualClock, SystemClock};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, Transport, TransportError};

use async_trait::async_trait;
use std::fmt;

use crate::types::{Event, EventContext};

/// Why a batch was not delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Connection-level failure, no HTTP status
    Network,
    /// The request did not complete within the timeout
    Timeout,
    /// HTTP 5xx
    ServerError(u16),
    /// HTTP 400
    BadRequest,
    /// HTTP 401
    Unauthorized,
    /// HTTP 403
    Forbidden,
    /// Any other 4xx except 429
    ClientError(u16),
    /// 1xx/3xx or anything outside the known ranges
    UnexpectedStatus(u16),
    /// The payload could not be encoded
    Serialization,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Network => write!(f, "network error"),
            FailureKind::Timeout => write!(f, "request timed out"),
            FailureKind::ServerError(status) => write!(f, "server error ({})", status),
            FailureKind::BadRequest => write!(f, "bad request (400)"),
            FailureKind::Unauthorized => write!(f, "unauthorized (401)"),
            FailureKind::Forbidden => write!(f, "forbidden (403)"),
            FailureKind::ClientError(status) => write!(f, "client error ({})", status),
            FailureKind::UnexpectedStatus(status) => write!(f, "unexpected status ({})", status),
            FailureKind::Serialization => write!(f, "payload serialization failed"),
        }
    }
}

/// Classified result of one send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Server acknowledged the batch
    Success,
    /// Server asked us to back off, or a previous cooldown has not elapsed
    RateLimited { cooldown_secs: u64 },
    /// Keep the batch and try again on a later flush
    Retryable { kind: FailureKind },
    /// The server will never accept this batch
    NonRetryable { kind: FailureKind },
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryOutcome::Success => write!(f, "delivered"),
            DeliveryOutcome::RateLimited { cooldown_secs } => {
                write!(f, "rate limited for {}s", cooldown_secs)
            }
            DeliveryOutcome::Retryable { kind } => write!(f, "retryable: {}", kind),
            DeliveryOutcome::NonRetryable { kind } => write!(f, "rejected: {}", kind),
        }
    }
}

/// A failed batch as reported to the error observer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub outcome: DeliveryOutcome,
    /// Number of events in the batch
    pub event_count: usize,
    /// Whether the batch was removed from the queue
    pub dropped: bool,
}

/// Sends one batch. The flush loop only sees this trait.
#[async_trait]
pub trait BatchSender: Send + Sync {
    /// Send `events` with the shared `context` and classify the result
    async fn send(&self, events: &[Event], context: &EventContext) -> DeliveryOutcome;

    /// Whether a rate-limit cooldown is currently running
    fn is_rate_limited(&self) -> bool;
}
