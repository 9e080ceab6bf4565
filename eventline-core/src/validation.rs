//! Event name and property validation
//!
//! Checked by [`crate::Tracker::track`] before an event is built. Invalid
//! events are logged and dropped, never queued.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

use crate::error::{Error, Result};
use crate::types::Properties;

/// Deepest allowed object/array nesting, counting the properties object itself
pub const MAX_PROPERTY_DEPTH: usize = 5;

/// Most top-level property keys allowed on one event
pub const MAX_PROPERTY_KEYS: usize = 255;

const EVENT_NAME_PATTERN: &str = r"^[A-Za-z][A-Za-z0-9_.:\- ]{0,127}$";

fn event_name_regex() -> &'static Regex {
    static EVENT_NAME: OnceLock<Regex> = OnceLock::new();
    EVENT_NAME.get_or_init(|| Regex::new(EVENT_NAME_PATTERN).expect("event name pattern is valid"))
}

/// Starts with a letter, then up to 127 letters, digits, spaces or `_ . : -`.
pub fn validate_event_name(name: &str) -> Result<()> {
    if event_name_regex().is_match(name) {
        Ok(())
    } else {
        Err(Error::Validation(format!("invalid event name {:?}", name)))
    }
}

pub fn validate_properties(properties: &Properties) -> Result<()> {
    if properties.len() > MAX_PROPERTY_KEYS {
        return Err(Error::Validation(format!(
            "{} properties exceeds the limit of {}",
            properties.len(),
            MAX_PROPERTY_KEYS
        )));
    }

    let depth = 1 + properties.values().map(nesting_depth).max().unwrap_or(0);
    if depth > MAX_PROPERTY_DEPTH {
        return Err(Error::Validation(format!(
            "properties nested {} levels deep, limit is {}",
            depth, MAX_PROPERTY_DEPTH
        )));
    }
    Ok(())
}

/// Validate both parts of an event
pub fn validate_event(name: &str, properties: &Properties) -> Result<()> {
    validate_event_name(name)?;
    validate_properties(properties)
}

fn nesting_depth(value: &Value) -> usize {
    match value {
        Value::Object(map) => 1 + map.values().map(nesting_depth).max().unwrap_or(0),
        Value::Array(items) => 1 + items.iter().map(nesting_depth).max().unwrap_or(0),
        _ => 0,
    }
}
