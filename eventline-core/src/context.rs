//! Batch context detection
//!
//! The context attached to a batch is computed at send time from the device
//! and the identity records current at that moment.

use chrono::Local;
use std::sync::Arc;

use crate::identity::IdentityStore;
use crate::types::{EventContext, LibraryInfo};

/// Produces the context for the next batch
pub trait ContextSource: Send + Sync {
    fn current(&self) -> EventContext;
}

/// Host facts that do not change while the process runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub platform: String,
    pub locale: Option<String>,
}

impl DeviceInfo {
    /// Read the platform from the OS and the locale from the environment
    pub fn detect() -> Self {
        let locale = ["LC_ALL", "LC_MESSAGES", "LANG"]
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .find_map(|value| normalize_locale(&value));

        Self {
            platform: std::env::consts::OS.to_string(),
            locale,
        }
    }
}

/// `en_US.UTF-8` -> `en-US`. `C` and `POSIX` carry no locale.
fn normalize_locale(raw: &str) -> Option<String> {
    let tag = raw.split(['.', '@']).next().unwrap_or("").trim();
    if tag.is_empty() || tag == "C" || tag == "POSIX" {
        return None;
    }
    Some(tag.replace('_', "-"))
}

/// Local UTC offset, e.g. `+02:00`
pub fn local_timezone() -> String {
    Local::now().offset().to_string()
}

/// Context source for a running tracker
pub struct DeviceContext {
    device: DeviceInfo,
    identity: Arc<IdentityStore>,
    session_id: String,
}

impl DeviceContext {
    pub fn new(identity: Arc<IdentityStore>, session_id: impl Into<String>) -> Self {
        Self::with_device(DeviceInfo::detect(), identity, session_id)
    }

    pub fn with_device(
        device: DeviceInfo,
        identity: Arc<IdentityStore>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            device,
            identity,
            session_id: session_id.into(),
        }
    }
}

impl ContextSource for DeviceContext {
    fn current(&self) -> EventContext {
        EventContext {
            platform: self.device.platform.clone(),
            session_id: self.session_id.clone(),
            user_id: self.identity.user_id(),
            anonymous_id: Some(self.identity.anonymous_id()),
            locale: self.device.locale.clone(),
            timezone: local_timezone(),
            app_version: self.identity.app_version(),
            library: LibraryInfo::default(),
        }
    }
}
