//! Disk space checks and Tmp eviction
//!
//! Eviction is whole-category: when an operation needs more bytes than are free beyond the
//! reserve, every evictable blob directly under `tmp/` is dropped. `tmp/downloads` and
//! `tmp/documents` are never touched.

use std::io;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::file_ops::delete_files_in;
use super::layout::DirectoryLayout;
use super::metadata::CacheMetadataIndex;
use super::types::SubDirKind;

/// Free disk space query for the volume holding a path
pub trait FreeDiskSpace: Send + Sync {
    /// Bytes available to unprivileged users
    fn free_disk_space(&self, path: &Path) -> io::Result<u64>;
}

/// `statvfs(2)`-backed free space query
#[derive(Debug, Clone, Copy, Default)]
pub struct StatvfsDiskSpace;

impl FreeDiskSpace for StatvfsDiskSpace {
    fn free_disk_space(&self, path: &Path) -> io::Result<u64> {
        let stat = nix::sys::statvfs::statvfs(path).map_err(io::Error::from)?;
        Ok((stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64))
    }
}

/// Frees Tmp space before operations that need it
#[derive(Clone)]
pub struct EvictionPolicy {
    disk: Arc<dyn FreeDiskSpace>,
    /// Bytes that must stay free after the operation
    reserved: u64,
}

impl EvictionPolicy {
    pub fn new(disk: Arc<dyn FreeDiskSpace>, reserved: u64) -> Self {
        Self { disk, reserved }
    }

    /// Whether `bytes` more can be written while keeping the reserve free
    ///
    /// A failed space query counts as not enough space.
    pub fn has_enough_space_for(&self, layout: &DirectoryLayout, bytes: u64) -> bool {
        match self.disk.free_disk_space(layout.base()) {
            Ok(free) => free >= self.reserved.saturating_add(bytes),
            Err(e) => {
                warn!(path = %layout.base().display(), error = %e, "Free space query failed");
                false
            }
        }
    }

    /// Make room for `bytes`, evicting all of Tmp if needed
    ///
    /// Returns whether enough space is available afterwards.
    pub fn free_disk_space_if_needed_for(
        &self,
        layout: &DirectoryLayout,
        index: &mut CacheMetadataIndex,
        bytes: u64,
    ) -> bool {
        if self.has_enough_space_for(layout, bytes) {
            return true;
        }

        info!(
            needed = bytes,
            reserved_mb = self.reserved / (1024 * 1024),
            "Low on disk space, evicting tmp cache files"
        );

        let dropped = index.remove_in_sub_dir(SubDirKind::Tmp);
        match delete_files_in(&layout.dir(SubDirKind::Tmp)) {
            Ok(deleted) => debug!(entries = dropped, files = deleted, "Evicted tmp cache files"),
            Err(e) => warn!(error = %e, "Failed to evict tmp cache files"),
        }

        self.has_enough_space_for(layout, bytes)
    }
}
