//! HTTP client for the events ingestion API
//!
//! Posts one batch per call to `{base_url}/v1/events` and owns the
//! rate-limit cooldown: after a 429 every send is refused locally until the
//! cooldown has elapsed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::clock::{Clock, SystemClock};
use super::transport::{HttpRequest, HttpResponse, HttpTransport, Transport, TransportError};
use super::{BatchSender, DeliveryOutcome, FailureKind};
use crate::config::{DeliveryConfig, TrackerConfig};
use crate::error::{Error, Result};
use crate::types::{Event, EventContext, Payload};

/// Path appended to the configured base URL
pub const EVENTS_PATH: &str = "/v1/events";

/// Header carrying the API key
pub const API_KEY_HEADER: &str = "X-Api-Key";

/// Longest cooldown honoured from a `Retry-After` header
const MAX_COOLDOWN_SECS: u64 = 24 * 60 * 60;

/// HTTP client for the events API
pub struct DeliveryClient {
    endpoint: String,
    api_key: String,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    default_retry_after_secs: u64,
    /// Instant before which no request is attempted
    cooldown_until: Mutex<Option<DateTime<Utc>>>,
}

impl DeliveryClient {
    /// Create a client from configuration, using the reqwest transport
    ///
    /// Returns an error if the tracker section is missing the base URL or API key.
    pub fn new(tracker: &TrackerConfig, delivery: &DeliveryConfig) -> Result<Self> {
        tracker.validate()?;

        let base_url = tracker
            .normalized_base_url()
            .ok_or_else(|| Error::Config("tracker.base_url is required".to_string()))?;
        let api_key = tracker
            .resolved_api_key()
            .ok_or_else(|| Error::Config("tracker.api_key is required".to_string()))?;

        let transport = Arc::new(HttpTransport::new(delivery.timeout())?);
        Ok(Self::with_transport(&base_url, &api_key, transport, delivery))
    }

    /// Create a client over an arbitrary transport
    pub fn with_transport(
        base_url: &str,
        api_key: &str,
        transport: Arc<dyn Transport>,
        delivery: &DeliveryConfig,
    ) -> Self {
        Self {
            endpoint: format!("{}{}", base_url.trim_end_matches('/'), EVENTS_PATH),
            api_key: api_key.to_string(),
            transport,
            clock: Arc::new(SystemClock),
            timeout: delivery.timeout(),
            default_retry_after_secs: delivery.default_retry_after_secs,
            cooldown_until: Mutex::new(None),
        }
    }

    /// Replace the clock used for cooldowns
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Override the per-request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Full URL batches are posted to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Send one batch and classify the result.
    ///
    /// While a cooldown is running this returns `RateLimited` with the
    /// remaining seconds and performs no network I/O.
    pub async fn deliver(&self, events: &[Event], context: &EventContext) -> DeliveryOutcome {
        if let Some(remaining) = self.cooldown_remaining() {
            tracing::debug!(
                remaining_secs = remaining,
                events = events.len(),
                "Cooldown active, not sending"
            );
            return DeliveryOutcome::RateLimited {
                cooldown_secs: remaining,
            };
        }

        let body = match serde_json::to_vec(&Payload { events, context }) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(error = %e, events = events.len(), "Failed to encode batch");
                return DeliveryOutcome::NonRetryable {
                    kind: FailureKind::Serialization,
                };
            }
        };

        let request = HttpRequest {
            url: self.endpoint.clone(),
            headers: vec![
                ("Content-Type".to_string(), "application/json".to_string()),
                (API_KEY_HEADER.to_string(), self.api_key.clone()),
            ],
            body,
        };

        let response = match tokio::time::timeout(self.timeout, self.transport.post(request)).await
        {
            Ok(Ok(response)) => response,
            Ok(Err(TransportError::Timeout)) | Err(_) => {
                tracing::warn!(
                    timeout_ms = self.timeout.as_millis() as u64,
                    events = events.len(),
                    "Batch request timed out"
                );
                return DeliveryOutcome::Retryable {
                    kind: FailureKind::Timeout,
                };
            }
            Ok(Err(TransportError::Network(message))) => {
                tracing::warn!(error = %message, events = events.len(), "Batch request failed");
                return DeliveryOutcome::Retryable {
                    kind: FailureKind::Network,
                };
            }
        };

        let outcome = self.classify(&response);
        match outcome {
            DeliveryOutcome::Success => {
                tracing::debug!(status = response.status, events = events.len(), "Batch delivered");
            }
            DeliveryOutcome::RateLimited { cooldown_secs } => {
                self.start_cooldown(cooldown_secs);
                tracing::warn!(cooldown_secs, events = events.len(), "Rate limited by server");
            }
            DeliveryOutcome::Retryable { kind } | DeliveryOutcome::NonRetryable { kind } => {
                tracing::warn!(
                    status = response.status,
                    kind = %kind,
                    events = events.len(),
                    "Batch not accepted"
                );
            }
        }
        outcome
    }

    /// Whether a cooldown is running. An expired cooldown is cleared here.
    pub fn is_rate_limited(&self) -> bool {
        self.cooldown_remaining().is_some()
    }

    fn classify(&self, response: &HttpResponse) -> DeliveryOutcome {
        let retry_after = response
            .header("retry-after")
            .and_then(|value| parse_retry_after(value, self.clock.now()));
        classify_status(response.status, retry_after, self.default_retry_after_secs)
    }

    fn cooldown(&self) -> MutexGuard<'_, Option<DateTime<Utc>>> {
        self.cooldown_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn start_cooldown(&self, secs: u64) {
        let secs = secs.min(MAX_COOLDOWN_SECS) as i64;
        let until = self.clock.now() + chrono::Duration::seconds(secs);
        *self.cooldown() = Some(until);
    }

    /// Whole seconds left on the cooldown (rounded up), clearing it once expired
    fn cooldown_remaining(&self) -> Option<u64> {
        let mut cooldown = self.cooldown();
        let until = (*cooldown)?;
        let now = self.clock.now();
        if now >= until {
            *cooldown = None;
            tracing::debug!("Rate-limit cooldown elapsed");
            return None;
        }
        let millis = (until - now).num_milliseconds().max(1) as u64;
        Some((millis + 999) / 1000)
    }
}

#[async_trait]
impl BatchSender for DeliveryClient {
    async fn send(&self, events: &[Event], context: &EventContext) -> DeliveryOutcome {
        self.deliver(events, context).await
    }

    fn is_rate_limited(&self) -> bool {
        DeliveryClient::is_rate_limited(self)
    }
}

/// Map an HTTP status to an outcome.
///
/// `retry_after` is the parsed `Retry-After` value, if any; a 429 without one
/// uses `default_retry_after_secs`.
pub fn classify_status(
    status: u16,
    retry_after: Option<u64>,
    default_retry_after_secs: u64,
) -> DeliveryOutcome {
    match status {
        200..=299 => DeliveryOutcome::Success,
        429 => DeliveryOutcome::RateLimited {
            cooldown_secs: retry_after.unwrap_or(default_retry_after_secs),
        },
        400 => DeliveryOutcome::NonRetryable {
            kind: FailureKind::BadRequest,
        },
        401 => DeliveryOutcome::NonRetryable {
            kind: FailureKind::Unauthorized,
        },
        403 => DeliveryOutcome::NonRetryable {
            kind: FailureKind::Forbidden,
        },
        400..=499 => DeliveryOutcome::NonRetryable {
            kind: FailureKind::ClientError(status),
        },
        500..=599 => DeliveryOutcome::Retryable {
            kind: FailureKind::ServerError(status),
        },
        _ => DeliveryOutcome::Retryable {
            kind: FailureKind::UnexpectedStatus(status),
        },
    }
}

/// Parse a `Retry-After` value: delay in seconds, or an HTTP-date.
///
/// Dates in the past yield zero. Returns `None` for anything unparseable.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<u64> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(secs);
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?;
    let secs = (at.with_timezone(&Utc) - now).num_seconds();
    Some(secs.max(0) as u64)
}
