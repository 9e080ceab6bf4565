//! Database layer for eventline
//!
//! SQLite is the durable backing medium shared by the event queue and the
//! identity records. Everything lives in one key/value table:
//! - Schema migrations
//! - Repository for key/value access
//! - Namespaced key constants so collaborators never collide

pub mod repo;
pub mod schema;

pub use repo::Database;

/// Fixed record keys in the `kv_store` table.
pub mod keys {
    /// Serialized ordered list of pending events
    pub const QUEUE: &str = "eventline:queue";
    /// Identified user id
    pub const USER_ID: &str = "eventline:user_id";
    /// Locally generated anonymous id
    pub const ANONYMOUS_ID: &str = "eventline:anonymous_id";
    /// Host application version
    pub const APP_VERSION: &str = "eventline:app_version";
    /// Super-properties map merged into every event
    pub const SUPER_PROPERTIES: &str = "eventline:super_properties";
    /// Scratch key used by the storage capability probe
    pub const PROBE: &str = "eventline:probe";
}
