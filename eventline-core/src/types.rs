//! Core domain types for eventline
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Event** | One tracked occurrence, immutable once stored |
//! | **Batch** | Up to `batch_size` events sent in one request |
//! | **Context** | Platform/session/identity data computed at send time, shared by a batch |
//! | **Payload** | The JSON request body: `{ "events": [...], "context": {...} }` |
//!
//! The context is deliberately *not* stored with the event: if identity changes
//! between enqueue and flush, the batch carries the identity current at send time.
//! Each event still carries the `userId` it was captured with.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Library name reported in the batch context
pub const LIBRARY_NAME: &str = "eventline";

/// Library version reported in the batch context
pub const LIBRARY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Event properties: a JSON object
pub type Properties = Map<String, Value>;

// ============================================
// Event
// ============================================

/// One tracked occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Event name (validated before construction)
    pub name: String,
    /// Client-generated unique id the server dedups on
    pub client_event_id: String,
    /// Capture time, not send time
    pub timestamp: DateTime<Utc>,
    /// Identified user id, or the anonymous id before identification
    pub user_id: Option<String>,
    /// Session the event was captured in
    pub session_id: String,
    /// Platform the event was captured on
    pub platform: String,
    /// Deployment environment (production, staging, ...)
    pub environment: String,
    /// Free-form properties, merged with super-properties at capture time
    #[serde(default)]
    pub properties: Properties,
}

/// Where an event was captured: the fields every event copies at `track` time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventOrigin {
    pub user_id: Option<String>,
    pub session_id: String,
    pub platform: String,
    pub environment: String,
}

impl Event {
    /// Capture a new event now, with a fresh client event id
    pub fn new(name: impl Into<String>, properties: Properties, origin: &EventOrigin) -> Self {
        Self::captured_at(name, properties, origin, Utc::now())
    }

    /// Capture a new event with an explicit timestamp
    pub fn captured_at(
        name: impl Into<String>,
        properties: Properties,
        origin: &EventOrigin,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Event {
            name: name.into(),
            client_event_id: uuid::Uuid::new_v4().to_string(),
            timestamp,
            user_id: origin.user_id.clone(),
            session_id: origin.session_id.clone(),
            platform: origin.platform.clone(),
            environment: origin.environment.clone(),
            properties,
        }
    }
}

// ============================================
// Batch context and payload
// ============================================

/// Name and version of the sending library
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryInfo {
    pub name: String,
    pub version: String,
}

impl Default for LibraryInfo {
    fn default() -> Self {
        Self {
            name: LIBRARY_NAME.to_string(),
            version: LIBRARY_VERSION.to_string(),
        }
    }
}

/// Context shared by every event in a batch, computed at send time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventContext {
    pub platform: String,
    pub session_id: String,
    pub user_id: Option<String>,
    pub anonymous_id: Option<String>,
    pub locale: Option<String>,
    /// UTC offset, e.g. `+02:00`
    pub timezone: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    pub library: LibraryInfo,
}

/// Request body for `POST /v1/events`
#[derive(Debug, Serialize)]
pub struct Payload<'a> {
    pub events: &'a [Event],
    pub context: &'a EventContext,
}
