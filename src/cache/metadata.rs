//! Cache Metadata Index
//!
//! In-memory map from resource id to its cache entry. Rebuilt from the directory tree at
//! startup; there is no persisted index file.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info, trace, warn};

use super::file_ops::{self, move_file, remove_if_exists};
use super::layout::{parse_file_name, DirectoryLayout};
use super::types::{CacheEntry, CachedFileOrigin, StateFlags, SubDirKind};

/// Counts from a startup scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Entries in the rebuilt index
    pub entries: usize,
    /// Stale or malformed files deleted
    pub removed: usize,
    /// Blobs renamed or relocated to restore invariants
    pub repaired: usize,
}

/// Index of cache entries keyed by resource id
pub struct CacheMetadataIndex {
    entries: HashMap<String, CacheEntry>,
    /// Lookup hit counter
    hits: AtomicU64,
    /// Lookup miss counter
    misses: AtomicU64,
}

impl CacheMetadataIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up an entry
    ///
    /// An empty `content_hash` matches by resource id alone; see [`CacheEntry::matches_hash`].
    pub fn get(&self, resource_id: &str, content_hash: &str) -> Option<CacheEntry> {
        match self.entries.get(resource_id) {
            Some(entry) if entry.matches_hash(content_hash) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!(resource_id = resource_id, "Index HIT");
                Some(entry.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                trace!(resource_id = resource_id, content_hash = content_hash, "Index MISS");
                None
            }
        }
    }

    /// Upsert an entry; an empty state drops it instead
    pub fn update(
        &mut self,
        resource_id: &str,
        content_hash: &str,
        sub_dir: SubDirKind,
        state: StateFlags,
    ) {
        if state.is_empty() {
            self.remove(resource_id);
            return;
        }
        debug!(
            resource_id = resource_id,
            content_hash = content_hash,
            sub_dir = %sub_dir,
            state = ?state,
            "Updated index entry"
        );
        self.entries.insert(
            resource_id.to_string(),
            CacheEntry::new(resource_id, content_hash, sub_dir, state),
        );
    }

    /// Remove an entry by resource id
    pub fn remove(&mut self, resource_id: &str) -> Option<CacheEntry> {
        let removed = self.entries.remove(resource_id);
        if removed.is_some() {
            debug!(resource_id = resource_id, "Removed index entry");
        }
        removed
    }

    /// Visit every entry
    pub fn iterate<F>(&self, mut visitor: F)
    where
        F: FnMut(&CacheEntry),
    {
        for entry in self.entries.values() {
            visitor(entry);
        }
    }

    /// Drop every entry whose blob lives in `sub_dir`; returns how many were dropped
    pub fn remove_in_sub_dir(&mut self, sub_dir: SubDirKind) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.sub_dir != sub_dir);
        before - self.entries.len()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry and reset counters
    pub fn clear(&mut self) {
        self.entries.clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    /// Get lookup statistics
    ///
    /// Returns (hits, misses, hit_rate)
    pub fn stats(&self) -> (u64, u64, f64) {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            (hits as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        (hits, misses, hit_rate)
    }

    /// Log current index metrics
    pub fn log_metrics(&self) {
        let (hits, misses, hit_rate) = self.stats();
        debug!(
            hits = hits,
            misses = misses,
            hit_rate = format!("{:.1}%", hit_rate),
            entries = self.entries.len(),
            "Index metrics"
        );
    }

    /// Rebuild the index by scanning the cache tree once
    ///
    /// Persistent is scanned before Tmp so a protected copy wins over an evictable duplicate.
    /// Stale artifacts are deleted and invariants repaired along the way.
    pub fn initialize(&mut self, layout: &DirectoryLayout) -> io::Result<ScanSummary> {
        self.clear();
        let mut summary = ScanSummary::default();

        self.scan_persistent(layout, &mut summary)?;
        self.scan_tmp(layout, &mut summary)?;
        self.scan_pinned(layout, &mut summary)?;
        self.scan_outgoing(layout, &mut summary)?;
        self.repair(layout, &mut summary);

        summary.entries = self.entries.len();
        info!(
            entries = summary.entries,
            removed = summary.removed,
            repaired = summary.repaired,
            "Cache index initialized"
        );
        Ok(summary)
    }

    fn scan_persistent(&mut self, layout: &DirectoryLayout, summary: &mut ScanSummary) -> io::Result<()> {
        for path in list_dir(&layout.dir(SubDirKind::Persistent))? {
            if file_ops::is_symlink(&path) {
                discard(&path, summary);
                continue;
            }
            let Some(parsed) = path.file_name().and_then(|n| n.to_str()).and_then(parse_file_name) else {
                discard(&path, summary);
                continue;
            };
            if !parsed.locally_modified && parsed.content_hash.is_empty() {
                discard(&path, summary);
                continue;
            }

            let origin = if parsed.locally_modified {
                CachedFileOrigin::LocallyModified
            } else {
                CachedFileOrigin::FromServer
            };
            let unmounted_path = layout.cache_file_path(
                &parsed.resource_id,
                &parsed.content_hash,
                SubDirKind::Persistent,
                origin,
            );

            // Mounts don't survive restarts
            if parsed.mounted {
                if let Err(e) = move_file(&path, &unmounted_path) {
                    warn!(path = %path.display(), error = %e, "Failed to unmount stale blob");
                    discard(&path, summary);
                    continue;
                }
                summary.repaired += 1;
            }

            let state = if parsed.locally_modified {
                StateFlags::PRESENT | StateFlags::DIRTY
            } else {
                StateFlags::PRESENT
            };

            if let Some(existing) = self.entries.get(&parsed.resource_id) {
                // Only one blob per id survives; a dirty blob always wins
                if existing.is_dirty() || !parsed.locally_modified {
                    discard(&unmounted_path, summary);
                    continue;
                }
                discard(&layout.entry_path(existing), summary);
            }

            self.entries.insert(
                parsed.resource_id.clone(),
                CacheEntry::new(parsed.resource_id, parsed.content_hash, SubDirKind::Persistent, state),
            );
        }
        Ok(())
    }

    fn scan_tmp(&mut self, layout: &DirectoryLayout, summary: &mut ScanSummary) -> io::Result<()> {
        for path in list_dir(&layout.dir(SubDirKind::Tmp))? {
            // tmp/downloads and tmp/documents aren't ours to index
            if fs::symlink_metadata(&path).map(|m| m.is_dir()).unwrap_or(false) {
                continue;
            }
            if file_ops::is_symlink(&path) {
                discard(&path, summary);
                continue;
            }
            let parsed = path.file_name().and_then(|n| n.to_str()).and_then(parse_file_name);
            let Some(parsed) = parsed.filter(|p| {
                !p.locally_modified && !p.mounted && !p.content_hash.is_empty()
            }) else {
                discard(&path, summary);
                continue;
            };
            if self.entries.contains_key(&parsed.resource_id) {
                discard(&path, summary);
                continue;
            }

            self.entries.insert(
                parsed.resource_id.clone(),
                CacheEntry::new(parsed.resource_id, parsed.content_hash, SubDirKind::Tmp, StateFlags::PRESENT),
            );
        }
        Ok(())
    }

    fn scan_pinned(&mut self, layout: &DirectoryLayout, summary: &mut ScanSummary) -> io::Result<()> {
        let persistent_dir = layout.dir(SubDirKind::Persistent);
        let sentinel = layout.sentinel_path();

        for path in list_dir(&layout.dir(SubDirKind::Pinned))? {
            let target = match fs::read_link(&path) {
                Ok(target) => target,
                Err(_) => {
                    discard(&path, summary);
                    continue;
                }
            };
            if target != sentinel && !target.starts_with(&persistent_dir) {
                discard(&path, summary);
                continue;
            }
            let parsed = path.file_name().and_then(|n| n.to_str()).and_then(parse_file_name);
            let Some(parsed) = parsed.filter(|p| {
                !p.locally_modified && !p.mounted && p.content_hash.is_empty()
            }) else {
                discard(&path, summary);
                continue;
            };

            match self.entries.get_mut(&parsed.resource_id) {
                Some(entry) => entry.state |= StateFlags::PINNED,
                None => {
                    self.entries.insert(
                        parsed.resource_id.clone(),
                        CacheEntry::new(parsed.resource_id, "", SubDirKind::Pinned, StateFlags::PINNED),
                    );
                }
            }
        }
        Ok(())
    }

    fn scan_outgoing(&mut self, layout: &DirectoryLayout, summary: &mut ScanSummary) -> io::Result<()> {
        for path in list_dir(&layout.dir(SubDirKind::Outgoing))? {
            let keep = file_ops::is_symlink(&path)
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(parse_file_name)
                    .and_then(|p| self.entries.get(&p.resource_id))
                    .is_some_and(|entry| entry.is_dirty());
            if !keep {
                discard(&path, summary);
            }
        }
        Ok(())
    }

    /// Put every entry back where its state says it belongs and recreate pinned symlinks
    fn repair(&mut self, layout: &DirectoryLayout, summary: &mut ScanSummary) {
        for entry in self.entries.values_mut() {
            if entry.has_blob() && !entry.is_dirty() {
                let wanted = if entry.is_pinned() {
                    SubDirKind::Persistent
                } else {
                    SubDirKind::Tmp
                };
                if entry.sub_dir != wanted {
                    let source = layout.entry_path(entry);
                    let mut moved = entry.clone();
                    moved.sub_dir = wanted;
                    match move_file(&source, &layout.entry_path(&moved)) {
                        Ok(()) => {
                            *entry = moved;
                            summary.repaired += 1;
                        }
                        Err(e) => warn!(path = %source.display(), error = %e, "Failed to relocate blob"),
                    }
                }
            }

            if entry.is_pinned() {
                let target = if entry.has_blob() {
                    layout.entry_path(entry)
                } else {
                    layout.sentinel_path()
                };
                let link = layout.pinned_link_path(&entry.resource_id);
                if fs::read_link(&link).ok().as_deref() != Some(target.as_path()) {
                    match file_ops::replace_symlink(&target, &link) {
                        Ok(()) => summary.repaired += 1,
                        Err(e) => warn!(link = %link.display(), error = %e, "Failed to repair pinned symlink"),
                    }
                }
            }
        }
    }
}

impl Default for CacheMetadataIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Paths directly under `dir`; a missing directory is empty
fn list_dir(dir: &Path) -> io::Result<Vec<std::path::PathBuf>> {
    match fs::read_dir(dir) {
        Ok(read_dir) => read_dir.map(|e| e.map(|e| e.path())).collect(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

fn discard(path: &Path, summary: &mut ScanSummary) {
    match remove_if_exists(path) {
        Ok(true) => {
            debug!(path = %path.display(), "Removed stale cache file");
            summary.removed += 1;
        }
        Ok(false) => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove stale cache file"),
    }
}
