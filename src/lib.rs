//! CloudMount content cache
//!
//! Manages the on-disk cache of file blobs behind a CloudMount volume: storing fetched
//! content, pinning it for offline use, tracking local edits until they are uploaded, and
//! evicting unprotected blobs when the disk runs low.

pub mod cache;
pub mod config;
pub mod error;

pub use cache::{
    CacheEntry, CacheEvent, CacheObserver, ContentCache, FileOperation, StateFlags, SubDirKind,
};
pub use config::CacheConfig;
pub use error::{CacheError, CacheResult};
