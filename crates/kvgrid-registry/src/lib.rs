//! KVGrid Registry - Storage metadata and its fast local view
//!
//! Home of the storage record model, the bounded single-flight metadata
//! cache with its background invalidation updater, the access-check seam
//! to the host platform, and the storage manager façade the management API
//! layer calls into.

pub mod access;
pub mod cache;
pub mod manager;
pub mod record;
pub mod updater;

// Re-exports
pub use access::{AccessResolver, Caller, StaticResolver};
pub use cache::StorageCache;
pub use manager::StorageManager;
pub use record::{HistoryEntry, RegistryDoc, StorageKind, StorageRecord};
pub use updater::CacheUpdater;
