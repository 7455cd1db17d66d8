//! Cache entry types
//!
//! Closed enum for sub-directories, bitflags for lifecycle state, and the entry record kept
//! in the metadata index.

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Logical sub-directory of the cache tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SubDirKind {
    /// Reserved for metadata files
    Meta,
    /// Symlinks marking pinned resources
    Pinned,
    /// Symlinks marking dirty files queued for upload
    Outgoing,
    /// Blobs protected from eviction (pinned, dirty or mounted)
    Persistent,
    /// Evictable blobs
    Tmp,
    /// User-initiated downloads, owned outside the cache
    TmpDownloads,
    /// Temporary hosted-document stubs
    TmpDocuments,
}

impl SubDirKind {
    /// All sub-directories in creation order (parents before children)
    pub const ALL: [SubDirKind; 7] = [
        SubDirKind::Meta,
        SubDirKind::Pinned,
        SubDirKind::Outgoing,
        SubDirKind::Persistent,
        SubDirKind::Tmp,
        SubDirKind::TmpDownloads,
        SubDirKind::TmpDocuments,
    ];

    /// Path of this sub-directory relative to the versioned cache root
    pub fn relative_path(&self) -> &'static str {
        match self {
            SubDirKind::Meta => "meta",
            SubDirKind::Pinned => "pinned",
            SubDirKind::Outgoing => "outgoing",
            SubDirKind::Persistent => "persistent",
            SubDirKind::Tmp => "tmp",
            SubDirKind::TmpDownloads => "tmp/downloads",
            SubDirKind::TmpDocuments => "tmp/documents",
        }
    }
}

impl fmt::Display for SubDirKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.relative_path())
    }
}

bitflags! {
    /// Lifecycle state of a cache entry
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct StateFlags: u8 {
        /// A blob exists on disk
        const PRESENT = 1 << 0;
        /// Must stay available without a fetch
        const PINNED = 1 << 1;
        /// Locally modified, not yet synced
        const DIRTY = 1 << 2;
        /// Exposed through a secondary mount point
        const MOUNTED = 1 << 3;
    }
}

/// How `store` brings the source file into the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOperation {
    /// Rename the source into place (source disappears)
    Move,
    /// Copy the source, leaving it untouched
    Copy,
}

/// Which on-disk filename form a blob path should use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachedFileOrigin {
    /// `id.hash` as fetched from the remote store
    FromServer,
    /// `id.local`, locally modified
    LocallyModified,
    /// `id.hash.mounted`, exposed through a mount point
    Mounted,
}

/// One resource in the cache index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub resource_id: String,
    /// Empty when unknown (pinned-not-fetched, or dirty blob recovered at startup)
    pub content_hash: String,
    pub sub_dir: SubDirKind,
    pub state: StateFlags,
}

impl CacheEntry {
    pub fn new(
        resource_id: impl Into<String>,
        content_hash: impl Into<String>,
        sub_dir: SubDirKind,
        state: StateFlags,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            content_hash: content_hash.into(),
            sub_dir,
            state,
        }
    }

    pub fn is_present(&self) -> bool {
        self.state.contains(StateFlags::PRESENT)
    }

    pub fn is_pinned(&self) -> bool {
        self.state.contains(StateFlags::PINNED)
    }

    pub fn is_dirty(&self) -> bool {
        self.state.contains(StateFlags::DIRTY)
    }

    pub fn is_mounted(&self) -> bool {
        self.state.contains(StateFlags::MOUNTED)
    }

    /// Blob location must not change for an ordinary transition
    pub fn is_locked_in_place(&self) -> bool {
        self.state.intersects(StateFlags::DIRTY | StateFlags::MOUNTED)
    }

    /// Whether the entry has an actual blob on disk (not just a pinned placeholder)
    pub fn has_blob(&self) -> bool {
        self.is_present() && self.sub_dir != SubDirKind::Pinned
    }

    /// Filename form the blob currently uses
    pub fn origin(&self) -> CachedFileOrigin {
        if self.is_dirty() {
            CachedFileOrigin::LocallyModified
        } else if self.is_mounted() {
            CachedFileOrigin::Mounted
        } else {
            CachedFileOrigin::FromServer
        }
    }

    /// Hash-matching rule for lookups
    ///
    /// An empty request hash matches anything. Dirty entries lost their hash to the `.local`
    /// rename, and pinned placeholders never had one, so both match any hash.
    pub fn matches_hash(&self, content_hash: &str) -> bool {
        content_hash.is_empty()
            || self.is_dirty()
            || (self.is_pinned() && self.content_hash.is_empty())
            || self.content_hash == content_hash
    }
}
