//! State Transition Engine
//!
//! Implements the cache operations as move/symlink/index transactions. Each one computes the
//! source, destination and symlink paths from the entry's current state, performs the
//! filesystem step, and only then updates the index. A failed step leaves the index untouched.
//!
//! Runs on the cache worker only; nothing here is shared across threads.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::eviction::EvictionPolicy;
use super::file_ops::{self, move_file, remove_if_exists, Transition};
use super::layout::DirectoryLayout;
use super::metadata::{CacheMetadataIndex, ScanSummary};
use super::types::{CacheEntry, CachedFileOrigin, FileOperation, StateFlags, SubDirKind};
use crate::error::{CacheError, CacheResult};

/// Owns the cache tree and its index
pub struct CacheEngine {
    layout: DirectoryLayout,
    index: CacheMetadataIndex,
    eviction: EvictionPolicy,
}

impl CacheEngine {
    pub fn new(layout: DirectoryLayout, eviction: EvictionPolicy) -> Self {
        Self {
            layout,
            index: CacheMetadataIndex::new(),
            eviction,
        }
    }

    pub fn layout(&self) -> &DirectoryLayout {
        &self.layout
    }

    pub fn index(&self) -> &CacheMetadataIndex {
        &self.index
    }

    /// Create the sub-directories and rebuild the index from disk
    pub fn initialize(&mut self) -> CacheResult<ScanSummary> {
        for kind in SubDirKind::ALL {
            let dir = self.layout.dir(kind);
            fs::create_dir_all(&dir).map_err(|e| {
                warn!(dir = %dir.display(), error = %e, "Failed to create cache directory");
                CacheError::from(e)
            })?;
        }
        Ok(self.index.initialize(&self.layout)?)
    }

    pub fn get_cache_entry(&self, resource_id: &str, content_hash: &str) -> Option<CacheEntry> {
        self.index.get(resource_id, content_hash)
    }

    /// Path of the entry's blob; `NotFound` if absent or not fetched yet
    pub fn get_file(&self, resource_id: &str, content_hash: &str) -> CacheResult<PathBuf> {
        match self.index.get(resource_id, content_hash) {
            Some(entry) if entry.has_blob() => Ok(self.layout.entry_path(&entry)),
            _ => Err(CacheError::NotFound),
        }
    }

    /// Bring a local file into the cache
    ///
    /// Lands in Tmp, or Persistent when the resource is already pinned. Other blobs of the
    /// same resource are deleted once the new one is in place.
    pub fn store(
        &mut self,
        resource_id: &str,
        content_hash: &str,
        source: &Path,
        operation: FileOperation,
    ) -> CacheResult<()> {
        check_resource_id(resource_id)?;
        if content_hash.is_empty() {
            return Err(CacheError::InvalidOperation);
        }

        let needed = match operation {
            FileOperation::Copy => fs::metadata(source)?.len(),
            // Same-volume rename
            FileOperation::Move => 0,
        };
        if !self
            .eviction
            .free_disk_space_if_needed_for(&self.layout, &mut self.index, needed)
        {
            warn!(resource_id = resource_id, needed = needed, "Not enough space to store");
            return Err(CacheError::NoSpace);
        }

        let mut state = StateFlags::PRESENT;
        let mut sub_dir = SubDirKind::Tmp;
        let mut pinned_link = None;

        if let Some(entry) = self.index.get(resource_id, "") {
            if entry.is_locked_in_place() {
                warn!(
                    resource_id = resource_id,
                    content_hash = content_hash,
                    dirty = entry.is_dirty(),
                    mounted = entry.is_mounted(),
                    "Can't replace a dirty or mounted file"
                );
                return Err(CacheError::InUse);
            }
            state |= entry.state;
            if entry.is_pinned() {
                sub_dir = SubDirKind::Persistent;
                pinned_link = Some(self.layout.pinned_link_path(resource_id));
            }
        }

        let dest = self.layout.cache_file_path(
            resource_id,
            content_hash,
            sub_dir,
            CachedFileOrigin::FromServer,
        );
        let mut transition = Transition {
            source: source.to_path_buf(),
            dest: dest.clone(),
            operation,
            symlink: None,
            create_symlink: false,
        };
        if let Some(link) = pinned_link {
            transition = transition.with_symlink(link, true);
        }
        self.apply(&transition, resource_id)?;

        if let Err(e) = self.delete_cache_files(resource_id, Some(&dest)) {
            warn!(resource_id = resource_id, error = %e, "Failed to delete stale cache files");
        }
        self.index.update(resource_id, content_hash, sub_dir, state);
        debug!(resource_id = resource_id, dest = %dest.display(), "Stored file in cache");
        Ok(())
    }

    /// Mark a resource as required to stay available
    ///
    /// An unknown resource gets a placeholder whose pinned symlink targets the sentinel.
    pub fn pin(&mut self, resource_id: &str, content_hash: &str) -> CacheResult<()> {
        check_resource_id(resource_id)?;
        let sentinel = self.layout.sentinel_path();

        let (transition, stored_hash, sub_dir, state) = match self.index.get(resource_id, content_hash) {
            None => {
                // A blob with another hash is stale now
                if let Some(stale) = self.index.get(resource_id, "") {
                    if stale.is_locked_in_place() {
                        return Err(CacheError::InUse);
                    }
                    self.delete_cache_files(resource_id, None)?;
                    self.index.remove(resource_id);
                }
                (
                    Transition::in_place(sentinel),
                    content_hash.to_string(),
                    SubDirKind::Pinned,
                    StateFlags::PINNED,
                )
            }
            Some(entry) => {
                let state = entry.state | StateFlags::PINNED;
                if entry.is_locked_in_place() {
                    let path = self.layout.entry_path(&entry);
                    (Transition::in_place(path), entry.content_hash, entry.sub_dir, state)
                } else if !entry.has_blob() {
                    let hash = if entry.content_hash.is_empty() {
                        content_hash.to_string()
                    } else {
                        entry.content_hash
                    };
                    (Transition::in_place(sentinel), hash, SubDirKind::Pinned, state)
                } else {
                    let dest = self.layout.cache_file_path(
                        resource_id,
                        &entry.content_hash,
                        SubDirKind::Persistent,
                        CachedFileOrigin::FromServer,
                    );
                    let source = self.layout.entry_path(&entry);
                    (
                        Transition::relocate(source, dest),
                        entry.content_hash,
                        SubDirKind::Persistent,
                        state,
                    )
                }
            }
        };

        let transition = transition.with_symlink(self.layout.pinned_link_path(resource_id), true);
        self.apply(&transition, resource_id)?;
        self.index.update(resource_id, &stored_hash, sub_dir, state);
        debug!(resource_id = resource_id, sub_dir = %sub_dir, "Pinned");
        Ok(())
    }

    /// Undo [`pin`](Self::pin): the blob becomes evictable again unless dirty or mounted
    pub fn unpin(&mut self, resource_id: &str, content_hash: &str) -> CacheResult<()> {
        check_resource_id(resource_id)?;
        let entry = self
            .index
            .get(resource_id, content_hash)
            .ok_or(CacheError::NotFound)?;
        if !entry.is_pinned() {
            return Err(CacheError::InvalidOperation);
        }

        let (transition, sub_dir) = if entry.is_locked_in_place() {
            (Transition::in_place(self.layout.entry_path(&entry)), entry.sub_dir)
        } else if !entry.has_blob() {
            (Transition::in_place(self.layout.sentinel_path()), SubDirKind::Pinned)
        } else {
            let dest = self.layout.cache_file_path(
                resource_id,
                &entry.content_hash,
                SubDirKind::Tmp,
                CachedFileOrigin::FromServer,
            );
            (
                Transition::relocate(self.layout.entry_path(&entry), dest),
                SubDirKind::Tmp,
            )
        };

        let transition = transition.with_symlink(self.layout.pinned_link_path(resource_id), false);
        self.apply(&transition, resource_id)?;
        // Placeholders end up with no state at all and leave the index
        self.index.update(
            resource_id,
            &entry.content_hash,
            sub_dir,
            entry.state - StateFlags::PINNED,
        );
        debug!(resource_id = resource_id, sub_dir = %sub_dir, "Unpinned");
        Ok(())
    }

    /// Move the blob to `persistent/<id>.local`; returns the dirty file's path
    ///
    /// Marking an already dirty entry again only withdraws it from the outgoing queue.
    pub fn mark_dirty(&mut self, resource_id: &str, content_hash: &str) -> CacheResult<PathBuf> {
        check_resource_id(resource_id)?;
        let entry = self
            .index
            .get(resource_id, content_hash)
            .filter(CacheEntry::has_blob)
            .ok_or(CacheError::NotFound)?;
        if entry.is_mounted() {
            return Err(CacheError::InUse);
        }

        let outgoing = self.layout.outgoing_link_path(resource_id);
        if entry.is_dirty() {
            let path = self.layout.entry_path(&entry);
            self.apply(&Transition::in_place(path.clone()).with_symlink(outgoing, false), resource_id)?;
            return Ok(path);
        }

        let dest = self.layout.cache_file_path(
            resource_id,
            &entry.content_hash,
            SubDirKind::Persistent,
            CachedFileOrigin::LocallyModified,
        );
        let mut transition = Transition::relocate(self.layout.entry_path(&entry), dest.clone());
        if entry.is_pinned() {
            transition = transition.with_symlink(self.layout.pinned_link_path(resource_id), true);
        }
        self.apply(&transition, resource_id)?;
        self.index.update(
            resource_id,
            &entry.content_hash,
            SubDirKind::Persistent,
            entry.state | StateFlags::DIRTY,
        );
        debug!(resource_id = resource_id, path = %dest.display(), "Marked dirty");
        Ok(dest)
    }

    /// Queue a dirty file for upload by linking it from `outgoing/`
    pub fn commit_dirty(&mut self, resource_id: &str) -> CacheResult<()> {
        check_resource_id(resource_id)?;
        // Hash is unknown for dirty files recovered at startup
        let entry = self
            .index
            .get(resource_id, "")
            .filter(CacheEntry::has_blob)
            .ok_or(CacheError::NotFound)?;
        if !entry.is_dirty() {
            return Err(CacheError::InvalidOperation);
        }

        let transition = Transition::in_place(self.layout.entry_path(&entry))
            .with_symlink(self.layout.outgoing_link_path(resource_id), true);
        self.apply(&transition, resource_id)?;
        debug!(resource_id = resource_id, "Committed dirty file");
        Ok(())
    }

    /// Turn a dirty blob back into an ordinary one named by its new hash
    pub fn clear_dirty(&mut self, resource_id: &str, content_hash: &str) -> CacheResult<()> {
        check_resource_id(resource_id)?;
        if content_hash.is_empty() {
            return Err(CacheError::InvalidOperation);
        }
        let entry = self
            .index
            .get(resource_id, "")
            .filter(CacheEntry::has_blob)
            .ok_or(CacheError::NotFound)?;
        if !entry.is_dirty() {
            return Err(CacheError::InvalidOperation);
        }

        let source = self.layout.entry_path(&entry);
        let sub_dir = if entry.is_pinned() {
            SubDirKind::Persistent
        } else {
            SubDirKind::Tmp
        };
        let dest = self.layout.cache_file_path(
            resource_id,
            content_hash,
            sub_dir,
            CachedFileOrigin::FromServer,
        );

        let pinned_link = self.layout.pinned_link_path(resource_id);
        let mut transition = Transition::relocate(source.clone(), dest.clone());
        if entry.is_pinned() {
            transition = transition.with_symlink(pinned_link.clone(), true);
        }
        self.apply(&transition, resource_id)?;

        // Leaves the upload queue only once the blob and pin are settled
        let outgoing = self.layout.outgoing_link_path(resource_id);
        if let Err(e) = remove_if_exists(&outgoing) {
            warn!(resource_id = resource_id, error = %e, "Failed to withdraw from outgoing");
            let undo = move_file(&dest, &source).and_then(|_| {
                if entry.is_pinned() {
                    file_ops::replace_symlink(&source, &pinned_link)
                } else {
                    Ok(())
                }
            });
            if let Err(undo) = undo {
                warn!(resource_id = resource_id, error = %undo, "Failed to restore dirty file");
            }
            return Err(e.into());
        }

        self.index.update(
            resource_id,
            content_hash,
            sub_dir,
            entry.state - StateFlags::DIRTY,
        );
        debug!(resource_id = resource_id, path = %dest.display(), "Cleared dirty state");
        Ok(())
    }

    /// Move the blob to or from its `.mounted` name; returns the resulting path
    pub fn set_mounted_state(
        &mut self,
        resource_id: &str,
        content_hash: &str,
        to_mount: bool,
    ) -> CacheResult<PathBuf> {
        check_resource_id(resource_id)?;
        let entry = self
            .index
            .get(resource_id, content_hash)
            .filter(CacheEntry::has_blob)
            .ok_or(CacheError::NotFound)?;
        if entry.is_mounted() == to_mount {
            return Err(CacheError::InvalidOperation);
        }
        if entry.is_dirty() {
            return Err(CacheError::InUse);
        }

        let unmounted_dir = if entry.is_pinned() {
            SubDirKind::Persistent
        } else {
            SubDirKind::Tmp
        };
        let unmounted = self.layout.cache_file_path(
            resource_id,
            &entry.content_hash,
            unmounted_dir,
            CachedFileOrigin::FromServer,
        );
        let mounted = self.layout.cache_file_path(
            resource_id,
            &entry.content_hash,
            SubDirKind::Persistent,
            CachedFileOrigin::Mounted,
        );

        let (source, dest, sub_dir, state) = if to_mount {
            (unmounted, mounted, SubDirKind::Persistent, entry.state | StateFlags::MOUNTED)
        } else {
            (mounted, unmounted, unmounted_dir, entry.state - StateFlags::MOUNTED)
        };

        let mut transition = Transition::relocate(source, dest.clone());
        if entry.is_pinned() {
            transition = transition.with_symlink(self.layout.pinned_link_path(resource_id), true);
        }
        self.apply(&transition, resource_id)?;
        self.index.update(resource_id, &entry.content_hash, sub_dir, state);
        debug!(resource_id = resource_id, mounted = to_mount, path = %dest.display(), "Changed mount state");
        Ok(dest)
    }

    /// Delete every cached version of a resource
    ///
    /// Dirty and mounted entries are left alone, and so is an unknown resource; both count as
    /// success.
    pub fn remove(&mut self, resource_id: &str) -> CacheResult<()> {
        check_resource_id(resource_id)?;
        let Some(entry) = self.index.get(resource_id, "") else {
            debug!(resource_id = resource_id, "Entry doesn't exist in cache, not removing");
            return Ok(());
        };
        if entry.is_locked_in_place() {
            debug!(resource_id = resource_id, "Entry is dirty or mounted, not removing");
            return Ok(());
        }

        let pinned_link = self.layout.pinned_link_path(resource_id);
        remove_if_exists(&pinned_link).map_err(|e| {
            warn!(resource_id = resource_id, error = %e, "Failed to remove pinned link");
            CacheError::from(e)
        })?;

        if let Err(e) = self.delete_cache_files(resource_id, None) {
            warn!(resource_id = resource_id, error = %e, "Failed to remove cache files");
            let blob = self.layout.entry_path(&entry);
            if entry.has_blob() && blob.exists() {
                if entry.is_pinned() {
                    if let Err(undo) = file_ops::replace_symlink(&blob, &pinned_link) {
                        warn!(resource_id = resource_id, error = %undo, "Failed to restore pinned link");
                    }
                }
            } else {
                self.index.remove(resource_id);
            }
            return Err(e.into());
        }
        self.index.remove(resource_id);
        debug!(resource_id = resource_id, "Removed from cache");
        Ok(())
    }

    /// Resource ids that are pinned but not fetched, and ids that are dirty
    pub fn backlog(&self) -> (Vec<String>, Vec<String>) {
        let mut to_fetch = Vec::new();
        let mut to_upload = Vec::new();
        self.index.iterate(|entry| {
            if entry.is_pinned() && !entry.is_present() {
                to_fetch.push(entry.resource_id.clone());
            }
            if entry.is_dirty() {
                to_upload.push(entry.resource_id.clone());
            }
        });
        to_fetch.sort();
        to_upload.sort();
        (to_fetch, to_upload)
    }

    /// Resource ids that are pinned and present
    pub fn existing_pinned_files(&self) -> Vec<String> {
        let mut ids = Vec::new();
        self.index.iterate(|entry| {
            if entry.is_pinned() && entry.is_present() {
                ids.push(entry.resource_id.clone());
            }
        });
        ids.sort();
        ids
    }

    /// Snapshot of every entry, sorted by resource id
    pub fn entries(&self) -> Vec<CacheEntry> {
        let mut entries = Vec::with_capacity(self.index.len());
        self.index.iterate(|entry| entries.push(entry.clone()));
        entries.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
        entries
    }

    pub fn free_disk_space_if_needed_for(&mut self, bytes: u64) -> bool {
        self.eviction
            .free_disk_space_if_needed_for(&self.layout, &mut self.index, bytes)
    }

    /// Delete every cached file and empty the index
    ///
    /// Contents of `tmp/downloads` are not the cache's and survive.
    pub fn clear_all(&mut self) -> CacheResult<()> {
        self.index.clear();
        for kind in SubDirKind::ALL {
            if kind == SubDirKind::TmpDownloads {
                continue;
            }
            match file_ops::delete_files_in(&self.layout.dir(kind)) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!(base = %self.layout.base().display(), "Cleared all cache files");
        Ok(())
    }

    fn apply(&self, transition: &Transition, resource_id: &str) -> CacheResult<()> {
        transition.apply().map_err(|e| {
            warn!(
                resource_id = resource_id,
                source = %transition.source.display(),
                dest = %transition.dest.display(),
                error = %e,
                "Cache transition failed"
            );
            CacheError::from(e)
        })
    }

    /// Delete `<id>` and `<id>.*` in Persistent and Tmp, sparing `keep` and the `.local` blob
    fn delete_cache_files(&self, resource_id: &str, keep: Option<&Path>) -> io::Result<()> {
        let local = self.layout.cache_file_path(
            resource_id,
            "",
            SubDirKind::Persistent,
            CachedFileOrigin::LocallyModified,
        );
        for kind in [SubDirKind::Persistent, SubDirKind::Tmp] {
            for path in self.layout.matching_files(kind, resource_id)? {
                if path == local || keep == Some(path.as_path()) {
                    continue;
                }
                if remove_if_exists(&path)? {
                    debug!(path = %path.display(), "Deleted cache file");
                }
            }
        }
        Ok(())
    }
}

/// Every blob and symlink name starts with the resource id
fn check_resource_id(resource_id: &str) -> CacheResult<()> {
    if resource_id.is_empty() {
        return Err(CacheError::InvalidOperation);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cache::eviction::testing::ScriptedDiskSpace;
    use crate::cache::eviction::FreeDiskSpace;

    struct Fixture {
        _root: tempfile::TempDir,
        source_dir: tempfile::TempDir,
        engine: CacheEngine,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_disk(ScriptedDiskSpace::plenty(), 0)
        }

        fn with_disk(disk: Arc<dyn FreeDiskSpace>, reserved: u64) -> Self {
            let root = tempfile::tempdir().unwrap();
            let layout = DirectoryLayout::new(root.path());
            let mut engine = CacheEngine::new(layout, EvictionPolicy::new(disk, reserved));
            engine.initialize().unwrap();
            Self {
                _root: root,
                source_dir: tempfile::tempdir().unwrap(),
                engine,
            }
        }

        fn source(&self, name: &str, content: &[u8]) -> PathBuf {
            let path = self.source_dir.path().join(name);
            fs::write(&path, content).unwrap();
            path
        }

        fn path(&self, kind: SubDirKind, name: &str) -> PathBuf {
            self.engine.layout().dir(kind).join(name)
        }

        fn entry(&self, id: &str) -> CacheEntry {
            self.engine.get_cache_entry(id, "").unwrap()
        }

        fn store(&mut self, id: &str, hash: &str) {
            let src = self.source(id, b"blob");
            self.engine.store(id, hash, &src, FileOperation::Move).unwrap();
        }
    }

    fn assert_exclusive(entry: &CacheEntry) {
        assert!(!(entry.is_dirty() && entry.is_mounted()));
    }

    #[test]
    fn test_full_lifecycle_scenario() {
        let mut f = Fixture::new();

        f.store("doc1", "hashA");
        assert!(f.path(SubDirKind::Tmp, "doc1.hashA").exists());
        let entry = f.entry("doc1");
        assert_eq!((entry.sub_dir, entry.state), (SubDirKind::Tmp, StateFlags::PRESENT));

        f.engine.pin("doc1", "hashA").unwrap();
        let persistent = f.path(SubDirKind::Persistent, "doc1.hashA");
        assert!(persistent.exists());
        assert!(!f.path(SubDirKind::Tmp, "doc1.hashA").exists());
        assert_eq!(fs::read_link(f.path(SubDirKind::Pinned, "doc1")).unwrap(), persistent);
        let entry = f.entry("doc1");
        assert_eq!(entry.sub_dir, SubDirKind::Persistent);
        assert_eq!(entry.state, StateFlags::PRESENT | StateFlags::PINNED);

        let dirty_path = f.engine.mark_dirty("doc1", "hashA").unwrap();
        assert_eq!(dirty_path, f.path(SubDirKind::Persistent, "doc1.local"));
        assert!(dirty_path.exists());
        assert!(!persistent.exists());
        assert_eq!(fs::read_link(f.path(SubDirKind::Pinned, "doc1")).unwrap(), dirty_path);
        assert!(f.entry("doc1").is_dirty());

        f.engine.commit_dirty("doc1").unwrap();
        assert_eq!(fs::read_link(f.path(SubDirKind::Outgoing, "doc1")).unwrap(), dirty_path);

        f.engine.clear_dirty("doc1", "hashB").unwrap();
        let final_path = f.path(SubDirKind::Persistent, "doc1.hashB");
        assert!(final_path.exists());
        assert!(!dirty_path.exists());
        assert!(!file_ops::is_symlink(&f.path(SubDirKind::Outgoing, "doc1")));
        assert_eq!(fs::read_link(f.path(SubDirKind::Pinned, "doc1")).unwrap(), final_path);
        let entry = f.entry("doc1");
        assert_eq!(entry.content_hash, "hashB");
        assert_eq!(entry.state, StateFlags::PRESENT | StateFlags::PINNED);
        assert_exclusive(&entry);
    }

    #[test]
    fn test_pin_unpin_round_trip() {
        let mut f = Fixture::new();
        f.store("doc1", "h");
        let before = f.entry("doc1");

        f.engine.pin("doc1", "h").unwrap();
        f.engine.unpin("doc1", "h").unwrap();

        assert_eq!(f.entry("doc1"), before);
        assert!(f.path(SubDirKind::Tmp, "doc1.h").exists());
        assert!(!file_ops::is_symlink(&f.path(SubDirKind::Pinned, "doc1")));
    }

    #[test]
    fn test_pin_unpin_dirty_keeps_blob() {
        let mut f = Fixture::new();
        f.store("doc1", "h");
        let local = f.engine.mark_dirty("doc1", "h").unwrap();
        let link = f.path(SubDirKind::Pinned, "doc1");

        f.engine.pin("doc1", "h").unwrap();
        assert_eq!(fs::read_link(&link).unwrap(), local);
        let entry = f.entry("doc1");
        assert_eq!(entry.sub_dir, SubDirKind::Persistent);
        assert_eq!(entry.state, StateFlags::PRESENT | StateFlags::PINNED | StateFlags::DIRTY);

        f.engine.unpin("doc1", "h").unwrap();
        assert!(!file_ops::is_symlink(&link));
        assert!(local.exists());
        let entry = f.entry("doc1");
        assert_eq!(entry.sub_dir, SubDirKind::Persistent);
        assert_eq!(entry.state, StateFlags::PRESENT | StateFlags::DIRTY);
    }

    #[test]
    fn test_pin_unpin_mounted_keeps_blob() {
        let mut f = Fixture::new();
        f.store("arc", "h");
        let mounted = f.engine.set_mounted_state("arc", "h", true).unwrap();
        let link = f.path(SubDirKind::Pinned, "arc");

        f.engine.pin("arc", "h").unwrap();
        assert_eq!(fs::read_link(&link).unwrap(), mounted);
        let entry = f.entry("arc");
        assert_eq!(entry.sub_dir, SubDirKind::Persistent);
        assert_eq!(entry.state, StateFlags::PRESENT | StateFlags::PINNED | StateFlags::MOUNTED);

        f.engine.unpin("arc", "h").unwrap();
        assert!(!file_ops::is_symlink(&link));
        assert!(mounted.exists());
        let entry = f.entry("arc");
        assert_eq!(entry.sub_dir, SubDirKind::Persistent);
        assert_eq!(entry.state, StateFlags::PRESENT | StateFlags::MOUNTED);
    }

    #[test]
    fn test_pin_absent_creates_placeholder() {
        let mut f = Fixture::new();
        f.engine.pin("doc9", "h9").unwrap();

        let entry = f.entry("doc9");
        assert_eq!((entry.sub_dir, entry.state), (SubDirKind::Pinned, StateFlags::PINNED));
        assert_eq!(
            fs::read_link(f.path(SubDirKind::Pinned, "doc9")).unwrap(),
            PathBuf::from("/dev/null")
        );
        assert_eq!(f.engine.get_file("doc9", "h9"), Err(CacheError::NotFound));
        assert_eq!(f.engine.backlog().0, vec!["doc9".to_string()]);

        // Fetch arrives: lands in persistent, symlink follows
        f.store("doc9", "h9");
        let blob = f.path(SubDirKind::Persistent, "doc9.h9");
        assert!(blob.exists());
        assert_eq!(fs::read_link(f.path(SubDirKind::Pinned, "doc9")).unwrap(), blob);
        assert_eq!(f.entry("doc9").state, StateFlags::PRESENT | StateFlags::PINNED);
        assert!(f.engine.backlog().0.is_empty());
        assert_eq!(f.engine.existing_pinned_files(), vec!["doc9".to_string()]);
    }

    #[test]
    fn test_unpin_placeholder_drops_entry() {
        let mut f = Fixture::new();
        f.engine.pin("doc9", "h9").unwrap();
        f.engine.unpin("doc9", "h9").unwrap();

        assert!(f.engine.get_cache_entry("doc9", "").is_none());
        assert!(!file_ops::is_symlink(&f.path(SubDirKind::Pinned, "doc9")));
    }

    #[test]
    fn test_unpin_errors() {
        let mut f = Fixture::new();
        assert_eq!(f.engine.unpin("nope", ""), Err(CacheError::NotFound));
        f.store("doc1", "h");
        assert_eq!(f.engine.unpin("doc1", "h"), Err(CacheError::InvalidOperation));
    }

    #[test]
    fn test_dirty_round_trip_unpinned() {
        let mut f = Fixture::new();
        f.store("doc1", "h1");
        let before = f.entry("doc1");

        f.engine.mark_dirty("doc1", "h1").unwrap();
        assert_eq!(f.entry("doc1").sub_dir, SubDirKind::Persistent);
        f.engine.clear_dirty("doc1", "h1").unwrap();

        assert_eq!(f.entry("doc1"), before);
        assert!(f.path(SubDirKind::Tmp, "doc1.h1").exists());
    }

    #[test]
    fn test_mark_dirty_twice_withdraws_outgoing() {
        let mut f = Fixture::new();
        f.store("doc1", "h1");
        let path = f.engine.mark_dirty("doc1", "h1").unwrap();
        f.engine.commit_dirty("doc1").unwrap();

        let again = f.engine.mark_dirty("doc1", "whatever").unwrap();
        assert_eq!(again, path);
        assert!(path.exists());
        assert!(!file_ops::is_symlink(&f.path(SubDirKind::Outgoing, "doc1")));
        assert_eq!(f.engine.backlog().1, vec!["doc1".to_string()]);
    }

    #[test]
    fn test_dirty_preconditions() {
        let mut f = Fixture::new();
        assert_eq!(f.engine.mark_dirty("nope", "h"), Err(CacheError::NotFound));
        assert_eq!(f.engine.commit_dirty("nope"), Err(CacheError::NotFound));
        assert_eq!(f.engine.clear_dirty("nope", "h"), Err(CacheError::NotFound));

        f.engine.pin("placeholder", "h").unwrap();
        assert_eq!(f.engine.mark_dirty("placeholder", "h"), Err(CacheError::NotFound));

        f.store("doc1", "h1");
        assert_eq!(f.engine.commit_dirty("doc1"), Err(CacheError::InvalidOperation));
        assert_eq!(f.engine.clear_dirty("doc1", "h2"), Err(CacheError::InvalidOperation));
    }

    #[test]
    fn test_store_refuses_dirty_and_mounted() {
        let mut f = Fixture::new();
        f.store("doc1", "h1");
        f.engine.mark_dirty("doc1", "h1").unwrap();
        let src = f.source("new", b"new");
        assert_eq!(
            f.engine.store("doc1", "h2", &src, FileOperation::Copy),
            Err(CacheError::InUse)
        );

        f.store("doc2", "h1");
        f.engine.set_mounted_state("doc2", "h1", true).unwrap();
        assert_eq!(
            f.engine.store("doc2", "h2", &src, FileOperation::Copy),
            Err(CacheError::InUse)
        );
        assert!(src.exists());
    }

    #[test]
    fn test_store_replaces_stale_versions() {
        let mut f = Fixture::new();
        f.store("doc1", "old");
        let src = f.source("copy", b"fresh");
        f.engine.store("doc1", "new", &src, FileOperation::Copy).unwrap();

        assert!(src.exists());
        assert!(!f.path(SubDirKind::Tmp, "doc1.old").exists());
        assert_eq!(fs::read(f.path(SubDirKind::Tmp, "doc1.new")).unwrap(), b"fresh");
        assert_eq!(f.entry("doc1").content_hash, "new");
    }

    #[test]
    fn test_store_missing_source() {
        let mut f = Fixture::new();
        let missing = f.source_dir.path().join("missing");
        assert_eq!(
            f.engine.store("doc1", "h", &missing, FileOperation::Move),
            Err(CacheError::NotFound)
        );
        assert!(f.engine.get_cache_entry("doc1", "").is_none());
    }

    #[test]
    fn test_mount_unmount() {
        let mut f = Fixture::new();
        f.store("arc", "h");
        f.engine.pin("arc", "h").unwrap();

        let mounted = f.engine.set_mounted_state("arc", "h", true).unwrap();
        assert_eq!(mounted, f.path(SubDirKind::Persistent, "arc.h.mounted"));
        assert!(mounted.exists());
        assert_eq!(f.engine.get_file("arc", "h").unwrap(), mounted);
        assert_eq!(
            f.engine.set_mounted_state("arc", "h", true),
            Err(CacheError::InvalidOperation)
        );
        assert_eq!(f.engine.mark_dirty("arc", "h"), Err(CacheError::InUse));

        let unmounted = f.engine.set_mounted_state("arc", "h", false).unwrap();
        assert_eq!(unmounted, f.path(SubDirKind::Persistent, "arc.h"));
        assert_eq!(fs::read_link(f.path(SubDirKind::Pinned, "arc")).unwrap(), unmounted);
        assert_eq!(f.entry("arc").state, StateFlags::PRESENT | StateFlags::PINNED);
    }

    #[test]
    fn test_mount_refuses_dirty() {
        let mut f = Fixture::new();
        f.store("doc1", "h");
        f.engine.mark_dirty("doc1", "h").unwrap();
        assert_eq!(f.engine.set_mounted_state("doc1", "h", true), Err(CacheError::InUse));
        assert_exclusive(&f.entry("doc1"));
    }

    #[test]
    fn test_unmounted_tmp_entry_returns_to_tmp() {
        let mut f = Fixture::new();
        f.store("arc", "h");
        f.engine.set_mounted_state("arc", "h", true).unwrap();
        assert_eq!(f.entry("arc").sub_dir, SubDirKind::Persistent);
        f.engine.set_mounted_state("arc", "h", false).unwrap();
        assert_eq!(f.entry("arc").sub_dir, SubDirKind::Tmp);
        assert!(f.path(SubDirKind::Tmp, "arc.h").exists());
    }

    #[test]
    fn test_remove_deletes_everything() {
        let mut f = Fixture::new();
        f.store("doc1", "h");
        f.engine.pin("doc1", "h").unwrap();
        // A leftover older version
        fs::write(f.path(SubDirKind::Tmp, "doc1.older"), b"x").unwrap();

        f.engine.remove("doc1").unwrap();
        assert!(f.engine.get_cache_entry("doc1", "").is_none());
        assert!(!f.path(SubDirKind::Persistent, "doc1.h").exists());
        assert!(!f.path(SubDirKind::Tmp, "doc1.older").exists());
        assert!(!file_ops::is_symlink(&f.path(SubDirKind::Pinned, "doc1")));
    }

    #[test]
    fn test_remove_spares_dirty_and_mounted() {
        let mut f = Fixture::new();
        f.store("dirty", "h");
        let dirty = f.engine.mark_dirty("dirty", "h").unwrap();
        f.store("mounted", "h");
        let mounted = f.engine.set_mounted_state("mounted", "h", true).unwrap();

        assert_eq!(f.engine.remove("dirty"), Ok(()));
        assert_eq!(f.engine.remove("mounted"), Ok(()));
        assert_eq!(f.engine.remove("unknown"), Ok(()));

        assert!(dirty.exists());
        assert!(mounted.exists());
        assert!(f.entry("dirty").is_dirty());
        assert!(f.entry("mounted").is_mounted());
    }

    #[test]
    fn test_store_evicts_tmp_when_low_on_space() {
        const MB: u64 = 1024 * 1024;
        // First check fails, the re-check after eviction passes
        let mut f = Fixture::with_disk(ScriptedDiskSpace::new(&[0, 10 * MB]), MB);
        fs::write(f.path(SubDirKind::Tmp, "old.h"), b"x").unwrap();
        fs::write(f.path(SubDirKind::TmpDownloads, "user.bin"), b"x").unwrap();

        let src = f.source("doc1", b"blob");
        f.engine.store("doc1", "h", &src, FileOperation::Copy).unwrap();

        assert!(!f.path(SubDirKind::Tmp, "old.h").exists());
        assert!(f.path(SubDirKind::TmpDownloads, "user.bin").exists());
        assert!(f.path(SubDirKind::Tmp, "doc1.h").exists());
    }

    #[test]
    fn test_store_reports_no_space() {
        let mut f = Fixture::with_disk(ScriptedDiskSpace::new(&[0]), 1024);
        let src = f.source("doc1", b"blob");
        assert_eq!(
            f.engine.store("doc1", "h", &src, FileOperation::Copy),
            Err(CacheError::NoSpace)
        );
        assert!(f.engine.get_cache_entry("doc1", "").is_none());
    }

    #[test]
    fn test_failed_transition_leaves_index() {
        let mut f = Fixture::new();
        f.store("doc1", "h");
        // Blob vanishes behind the cache's back
        fs::remove_file(f.path(SubDirKind::Tmp, "doc1.h")).unwrap();

        assert_eq!(f.engine.pin("doc1", "h"), Err(CacheError::NotFound));
        let entry = f.entry("doc1");
        assert_eq!((entry.sub_dir, entry.state), (SubDirKind::Tmp, StateFlags::PRESENT));
    }

    #[test]
    fn test_empty_resource_id_rejected() {
        let mut f = Fixture::new();
        let src = f.source("nameless", b"blob");
        let invalid = Err(CacheError::InvalidOperation);

        assert_eq!(f.engine.store("", "h", &src, FileOperation::Move), invalid);
        assert_eq!(f.engine.pin("", "h"), invalid);
        assert_eq!(f.engine.unpin("", "h"), invalid);
        assert_eq!(f.engine.mark_dirty("", "h"), Err(CacheError::InvalidOperation));
        assert_eq!(f.engine.commit_dirty(""), invalid);
        assert_eq!(f.engine.clear_dirty("", "h"), invalid);
        assert_eq!(f.engine.set_mounted_state("", "h", true), Err(CacheError::InvalidOperation));
        assert_eq!(f.engine.remove(""), invalid);

        assert!(src.exists());
        assert!(f.engine.entries().is_empty());
        assert!(!f.path(SubDirKind::Tmp, ".h").exists());
    }

    /// Swap a sub-directory for a plain file so any path below it fails with ENOTDIR
    fn break_dir(f: &Fixture, kind: SubDirKind) {
        let dir = f.engine.layout().dir(kind);
        fs::remove_dir_all(&dir).unwrap();
        fs::write(&dir, b"not a directory").unwrap();
    }

    #[test]
    fn test_failed_remove_keeps_entry_and_blob() {
        let mut f = Fixture::new();
        f.store("doc1", "h");
        f.engine.pin("doc1", "h").unwrap();
        break_dir(&f, SubDirKind::Pinned);

        assert_eq!(f.engine.remove("doc1"), Err(CacheError::NotADirectory));
        let entry = f.entry("doc1");
        assert_eq!(entry.state, StateFlags::PRESENT | StateFlags::PINNED);
        assert!(f.path(SubDirKind::Persistent, "doc1.h").exists());
        assert_eq!(f.engine.get_file("doc1", "h").unwrap(), f.path(SubDirKind::Persistent, "doc1.h"));
    }

    #[test]
    fn test_failed_clear_dirty_stays_committed() {
        let mut f = Fixture::new();
        f.store("doc1", "hA");
        f.engine.pin("doc1", "hA").unwrap();
        let local = f.engine.mark_dirty("doc1", "hA").unwrap();
        f.engine.commit_dirty("doc1").unwrap();
        break_dir(&f, SubDirKind::Pinned);

        assert_eq!(f.engine.clear_dirty("doc1", "hB"), Err(CacheError::NotADirectory));
        assert!(f.entry("doc1").is_dirty());
        assert!(local.exists());
        assert!(!f.path(SubDirKind::Persistent, "doc1.hB").exists());
        let outgoing = f.path(SubDirKind::Outgoing, "doc1");
        assert_eq!(fs::read_link(outgoing).unwrap(), local);
        assert_eq!(f.engine.backlog().1, vec!["doc1".to_string()]);
    }

    #[test]
    fn test_clear_dirty_withdraws_from_outgoing() {
        let mut f = Fixture::new();
        f.store("doc1", "hA");
        f.engine.pin("doc1", "hA").unwrap();
        f.engine.mark_dirty("doc1", "hA").unwrap();
        f.engine.commit_dirty("doc1").unwrap();

        f.engine.clear_dirty("doc1", "hB").unwrap();
        let clean = f.path(SubDirKind::Persistent, "doc1.hB");
        assert!(!file_ops::is_symlink(&f.path(SubDirKind::Outgoing, "doc1")));
        assert_eq!(fs::read_link(f.path(SubDirKind::Pinned, "doc1")).unwrap(), clean);
        assert_eq!(f.entry("doc1").state, StateFlags::PRESENT | StateFlags::PINNED);
    }

    #[test]
    fn test_clear_all_keeps_downloads() {
        let mut f = Fixture::new();
        f.store("doc1", "h");
        f.engine.pin("doc2", "h").unwrap();
        fs::write(f.path(SubDirKind::TmpDownloads, "user.bin"), b"x").unwrap();

        f.engine.clear_all().unwrap();
        assert!(f.engine.entries().is_empty());
        assert!(!f.path(SubDirKind::Tmp, "doc1.h").exists());
        assert!(!file_ops::is_symlink(&f.path(SubDirKind::Pinned, "doc2")));
        assert!(f.path(SubDirKind::TmpDownloads, "user.bin").exists());
    }

    #[test]
    fn test_restart_recovers_state() {
        let mut f = Fixture::new();
        f.store("doc1", "h");
        f.engine.pin("doc1", "h").unwrap();
        f.engine.mark_dirty("doc1", "h").unwrap();
        f.engine.commit_dirty("doc1").unwrap();
        f.engine.pin("doc2", "h2").unwrap();

        let summary = f.engine.initialize().unwrap();
        assert_eq!(summary.entries, 2);
        let entry = f.entry("doc1");
        assert_eq!(entry.state, StateFlags::PRESENT | StateFlags::PINNED | StateFlags::DIRTY);
        assert!(entry.content_hash.is_empty());
        assert_eq!(f.engine.backlog(), (vec!["doc2".to_string()], vec!["doc1".to_string()]));

        // Recovered dirty entry can still be cleared with the uploaded hash
        f.engine.clear_dirty("doc1", "h3").unwrap();
        assert!(f.path(SubDirKind::Persistent, "doc1.h3").exists());
    }
}
