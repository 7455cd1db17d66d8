//! Local content cache
//!
//! Blobs keyed by resource id and content hash, tracked through a pin/dirty/mount lifecycle
//! and moved between sub-directories of a versioned cache tree as that state changes.

pub mod engine;
pub mod eviction;
pub mod file_ops;
pub mod handle;
pub mod layout;
pub mod metadata;
pub mod observer;
pub mod types;

pub use engine::CacheEngine;
pub use eviction::{EvictionPolicy, FreeDiskSpace, StatvfsDiskSpace};
pub use handle::ContentCache;
pub use layout::DirectoryLayout;
pub use metadata::{CacheMetadataIndex, ScanSummary};
pub use observer::{CacheEvent, CacheObserver};
pub use types::{CacheEntry, CachedFileOrigin, FileOperation, StateFlags, SubDirKind};
