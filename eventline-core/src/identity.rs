//! User identity and super-properties
//!
//! Identity records live in an ordered list of key/value tiers, fastest
//! first. Reads return the first tier that has a value (and copy it into the
//! tiers above); writes and removals go to every tier. A tracker with durable
//! storage uses `[MemoryStore, Database]`, otherwise just `[MemoryStore]`.
//!
//! Like the queue, identity operations never fail the caller. Tier errors are
//! logged and the next tier is tried.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::db::{keys, Database};
use crate::error::Result;
use crate::types::Properties;

/// One storage tier for identity records
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn put(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

/// Process-lifetime tier
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.remove(key);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

impl KeyValueStore for Database {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.get_value(key)
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        self.put_value(key, value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.delete_value(key).map(|_| ())
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

/// Identity records over a priority list of tiers
pub struct IdentityStore {
    tiers: Vec<Arc<dyn KeyValueStore>>,
    /// Serializes anonymous id generation
    anonymous_lock: Mutex<()>,
}

impl IdentityStore {
    /// Tiers in priority order, fastest first
    pub fn new(tiers: Vec<Arc<dyn KeyValueStore>>) -> Self {
        Self {
            tiers,
            anonymous_lock: Mutex::new(()),
        }
    }

    /// Memory-only store
    pub fn in_memory() -> Self {
        Self::new(vec![Arc::new(MemoryStore::new()) as Arc<dyn KeyValueStore>])
    }

    /// Memory cache in front of the database
    pub fn with_database(db: Arc<Database>) -> Self {
        let cache: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let durable: Arc<dyn KeyValueStore> = db;
        Self::new(vec![cache, durable])
    }

    fn read(&self, key: &str) -> Option<String> {
        for (index, tier) in self.tiers.iter().enumerate() {
            match tier.get(key) {
                Ok(Some(value)) => {
                    for upper in &self.tiers[..index] {
                        if let Err(e) = upper.put(key, &value) {
                            tracing::debug!(tier = upper.name(), key, error = %e, "Failed to backfill identity tier");
                        }
                    }
                    return Some(value);
                }
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(tier = tier.name(), key, error = %e, "Identity tier read failed");
                }
            }
        }
        None
    }

    fn write(&self, key: &str, value: &str) {
        for tier in &self.tiers {
            if let Err(e) = tier.put(key, value) {
                tracing::warn!(tier = tier.name(), key, error = %e, "Identity tier write failed");
            }
        }
    }

    fn erase(&self, key: &str) {
        for tier in &self.tiers {
            if let Err(e) = tier.remove(key) {
                tracing::warn!(tier = tier.name(), key, error = %e, "Identity tier remove failed");
            }
        }
    }

    // ============================================
    // User and anonymous ids
    // ============================================

    pub fn user_id(&self) -> Option<String> {
        self.read(keys::USER_ID)
    }

    pub fn set_user_id(&self, user_id: &str) {
        self.write(keys::USER_ID, user_id);
    }

    pub fn clear_user_id(&self) {
        self.erase(keys::USER_ID);
    }

    /// The anonymous id, generated and persisted on first use
    pub fn anonymous_id(&self) -> String {
        let _guard = self
            .anonymous_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = self.read(keys::ANONYMOUS_ID) {
            return id;
        }
        let id = uuid::Uuid::new_v4().to_string();
        self.write(keys::ANONYMOUS_ID, &id);
        tracing::debug!(anonymous_id = %id, "Generated anonymous id");
        id
    }

    /// Replace the anonymous id with a fresh one
    pub fn regenerate_anonymous_id(&self) -> String {
        let _guard = self
            .anonymous_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let id = uuid::Uuid::new_v4().to_string();
        self.write(keys::ANONYMOUS_ID, &id);
        id
    }

    /// Identified user id, else the anonymous id
    pub fn distinct_id(&self) -> String {
        self.user_id().unwrap_or_else(|| self.anonymous_id())
    }

    // ============================================
    // App version
    // ============================================

    pub fn app_version(&self) -> Option<String> {
        self.read(keys::APP_VERSION)
    }

    pub fn set_app_version(&self, version: &str) {
        self.write(keys::APP_VERSION, version);
    }

    // ============================================
    // Super-properties
    // ============================================

    /// Properties merged into every tracked event
    pub fn super_properties(&self) -> Properties {
        let Some(raw) = self.read(keys::SUPER_PROPERTIES) else {
            return Properties::new();
        };
        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                tracing::warn!("Discarding unreadable super-properties record");
                Properties::new()
            }
        }
    }

    /// Merge `properties` into the super-properties; later values win
    pub fn register(&self, properties: Properties) {
        let mut current = self.super_properties();
        current.extend(properties);
        self.store_super_properties(&current);
    }

    /// Remove one super-property
    pub fn unregister(&self, key: &str) {
        let mut current = self.super_properties();
        if current.remove(key).is_some() {
            self.store_super_properties(&current);
        }
    }

    pub fn clear_super_properties(&self) {
        self.erase(keys::SUPER_PROPERTIES);
    }

    fn store_super_properties(&self, properties: &Properties) {
        if properties.is_empty() {
            self.erase(keys::SUPER_PROPERTIES);
            return;
        }
        match serde_json::to_string(properties) {
            Ok(raw) => self.write(keys::SUPER_PROPERTIES, &raw),
            Err(e) => tracing::warn!(error = %e, "Failed to encode super-properties"),
        }
    }

    /// Forget the user: clears the user id and super-properties and starts a
    /// new anonymous id
    pub fn reset(&self) -> String {
        self.clear_user_id();
        self.clear_super_properties();
        self.regenerate_anonymous_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use serde_json::json;

    /// Tier whose every operation fails
    struct BrokenStore;

    impl KeyValueStore for BrokenStore {
        fn get(&self, _key: &str) -> Result<Option<String>> {
            Err(Error::Storage("broken".to_string()))
        }
        fn put(&self, _key: &str, _value: &str) -> Result<()> {
            Err(Error::Storage("broken".to_string()))
        }
        fn remove(&self, _key: &str) -> Result<()> {
            Err(Error::Storage("broken".to_string()))
        }
        fn name(&self) -> &'static str {
            "broken"
        }
    }

    fn database() -> Arc<Database> {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.migrate().unwrap();
        db
    }

    #[test]
    fn test_first_tier_wins() {
        let cache = Arc::new(MemoryStore::new());
        let durable = Arc::new(MemoryStore::new());
        cache.put(keys::USER_ID, "from-cache").unwrap();
        durable.put(keys::USER_ID, "from-durable").unwrap();

        let store = IdentityStore::new(vec![cache as Arc<dyn KeyValueStore>, durable]);
        assert_eq!(store.user_id().as_deref(), Some("from-cache"));
    }

    #[test]
    fn test_lower_tier_backfills_cache() {
        let cache = Arc::new(MemoryStore::new());
        let durable = Arc::new(MemoryStore::new());
        durable.put(keys::USER_ID, "u-1").unwrap();

        let store = IdentityStore::new(vec![cache.clone() as Arc<dyn KeyValueStore>, durable]);
        assert_eq!(store.user_id().as_deref(), Some("u-1"));
        assert_eq!(cache.get(keys::USER_ID).unwrap().as_deref(), Some("u-1"));
    }

    #[test]
    fn test_writes_reach_every_tier() {
        let db = database();
        let cache = Arc::new(MemoryStore::new());
        let store = IdentityStore::new(vec![cache.clone() as Arc<dyn KeyValueStore>, db.clone()]);

        store.set_user_id("u-42");
        assert_eq!(cache.get(keys::USER_ID).unwrap().as_deref(), Some("u-42"));
        assert_eq!(db.get_value(keys::USER_ID).unwrap().as_deref(), Some("u-42"));

        store.clear_user_id();
        assert_eq!(store.user_id(), None);
        assert_eq!(db.get_value(keys::USER_ID).unwrap(), None);
    }

    #[test]
    fn test_broken_tier_is_skipped() {
        let fallback = Arc::new(MemoryStore::new());
        let store = IdentityStore::new(vec![Arc::new(BrokenStore) as Arc<dyn KeyValueStore>, fallback]);

        store.set_user_id("u-1");
        assert_eq!(store.user_id().as_deref(), Some("u-1"));
    }

    #[test]
    fn test_anonymous_id_is_stable_and_persisted() {
        let db = database();
        let first = IdentityStore::with_database(db.clone()).anonymous_id();

        // A new process sees the same id through the database tier
        let second = IdentityStore::with_database(db).anonymous_id();
        assert_eq!(first, second);
        assert!(uuid::Uuid::parse_str(&first).is_ok());
    }

    #[test]
    fn test_distinct_id_prefers_user() {
        let store = IdentityStore::in_memory();
        let anonymous = store.anonymous_id();
        assert_eq!(store.distinct_id(), anonymous);

        store.set_user_id("u-7");
        assert_eq!(store.distinct_id(), "u-7");
    }

    #[test]
    fn test_super_properties() {
        let store = IdentityStore::in_memory();
        let mut props = Properties::new();
        props.insert("plan".to_string(), json!("free"));
        props.insert("beta".to_string(), json!(true));
        store.register(props);

        let mut upgrade = Properties::new();
        upgrade.insert("plan".to_string(), json!("pro"));
        store.register(upgrade);

        let current = store.super_properties();
        assert_eq!(current["plan"], json!("pro"));
        assert_eq!(current["beta"], json!(true));

        store.unregister("beta");
        assert!(!store.super_properties().contains_key("beta"));
    }

    #[test]
    fn test_reset() {
        let store = IdentityStore::in_memory();
        let before = store.anonymous_id();
        store.set_user_id("u-1");
        let mut props = Properties::new();
        props.insert("plan".to_string(), json!("pro"));
        store.register(props);

        let after = store.reset();
        assert_ne!(before, after);
        assert_eq!(store.anonymous_id(), after);
        assert_eq!(store.user_id(), None);
        assert!(store.super_properties().is_empty());
    }
}
