//! Directory layout and filename grammar
//!
//! Maps a sub-directory kind and an entry's identity onto a concrete path:
//! `<escape(resource_id)>[.<escape(content_hash)>|.local][.mounted]`

use std::borrow::Cow;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::types::{CacheEntry, CachedFileOrigin, SubDirKind};

/// Version directory under `<root>/cache`
pub const CACHE_VERSION_DIR: &str = "v1";

/// Extension marking a locally modified blob
pub const LOCALLY_MODIFIED_EXTENSION: &str = "local";

/// Extension marking a mounted blob
pub const MOUNTED_EXTENSION: &str = "mounted";

/// Target of a pinned symlink whose blob has not been fetched yet
pub const SENTINEL_PATH: &str = "/dev/null";

/// Escape an identifier so it can't introduce separators or extensions
///
/// Percent-encodes everything outside `[A-Za-z0-9_~-]`, including `.`, so the first `.` in a
/// filename always ends the resource id.
pub fn escape_file_name(name: &str) -> String {
    urlencoding::encode(name).replace('.', "%2E")
}

/// Reverse of [`escape_file_name`]; `None` when the result isn't valid UTF-8
pub fn unescape_file_name(name: &str) -> Option<String> {
    urlencoding::decode(name).ok().map(Cow::into_owned)
}

/// Components recovered from a cache filename
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFileName {
    pub resource_id: String,
    /// Empty for bare (`id`) and locally modified (`id.local`) names
    pub content_hash: String,
    pub locally_modified: bool,
    pub mounted: bool,
}

/// Parse a filename produced by [`DirectoryLayout::file_name`]
pub fn parse_file_name(file_name: &str) -> Option<ParsedFileName> {
    let parts: Vec<&str> = file_name.split('.').collect();
    let (id, rest) = parts.split_first()?;
    if id.is_empty() {
        return None;
    }
    let resource_id = unescape_file_name(id)?;

    let (middle, mounted) = match rest {
        [] => (None, false),
        [m] if *m == MOUNTED_EXTENSION => return None,
        [m] => (Some(*m), false),
        [m, ext] if *ext == MOUNTED_EXTENSION => (Some(*m), true),
        _ => return None,
    };

    let mut parsed = ParsedFileName {
        resource_id,
        content_hash: String::new(),
        locally_modified: false,
        mounted,
    };
    match middle {
        None => {}
        Some(LOCALLY_MODIFIED_EXTENSION) => parsed.locally_modified = true,
        Some("") => return None,
        Some(hash) => parsed.content_hash = unescape_file_name(hash)?,
    }
    Some(parsed)
}

/// Concrete directory tree of one cache instance
#[derive(Debug, Clone)]
pub struct DirectoryLayout {
    /// `<root>/cache/v1`
    base: PathBuf,
}

impl DirectoryLayout {
    /// Create the layout for a cache rooted at `root`
    pub fn new(root: &Path) -> Self {
        Self {
            base: root.join("cache").join(CACHE_VERSION_DIR),
        }
    }

    /// Versioned cache root
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Absolute path of a sub-directory
    pub fn dir(&self, kind: SubDirKind) -> PathBuf {
        self.base.join(kind.relative_path())
    }

    /// Sentinel target for pinned-but-absent symlinks
    pub fn sentinel_path(&self) -> PathBuf {
        PathBuf::from(SENTINEL_PATH)
    }

    /// Build a cache filename
    ///
    /// An empty `content_hash` with [`CachedFileOrigin::FromServer`] yields the bare id used
    /// by pinned and outgoing symlinks.
    pub fn file_name(
        &self,
        resource_id: &str,
        content_hash: &str,
        origin: CachedFileOrigin,
    ) -> String {
        let id = escape_file_name(resource_id);
        match origin {
            CachedFileOrigin::FromServer if content_hash.is_empty() => id,
            CachedFileOrigin::FromServer => format!("{}.{}", id, escape_file_name(content_hash)),
            CachedFileOrigin::LocallyModified => format!("{}.{}", id, LOCALLY_MODIFIED_EXTENSION),
            CachedFileOrigin::Mounted => format!(
                "{}.{}.{}",
                id,
                escape_file_name(content_hash),
                MOUNTED_EXTENSION
            ),
        }
    }

    /// Absolute path of a cache file
    pub fn cache_file_path(
        &self,
        resource_id: &str,
        content_hash: &str,
        sub_dir: SubDirKind,
        origin: CachedFileOrigin,
    ) -> PathBuf {
        self.dir(sub_dir)
            .join(self.file_name(resource_id, content_hash, origin))
    }

    /// Current blob path of an entry (meaningless for pinned placeholders)
    pub fn entry_path(&self, entry: &CacheEntry) -> PathBuf {
        self.cache_file_path(
            &entry.resource_id,
            &entry.content_hash,
            entry.sub_dir,
            entry.origin(),
        )
    }

    /// `pinned/<id>`
    pub fn pinned_link_path(&self, resource_id: &str) -> PathBuf {
        self.cache_file_path(resource_id, "", SubDirKind::Pinned, CachedFileOrigin::FromServer)
    }

    /// `outgoing/<id>`
    pub fn outgoing_link_path(&self, resource_id: &str) -> PathBuf {
        self.cache_file_path(
            resource_id,
            "",
            SubDirKind::Outgoing,
            CachedFileOrigin::FromServer,
        )
    }

    /// Whether `path` lies inside this cache tree
    pub fn is_under_cache_directory(&self, path: &Path) -> bool {
        path.starts_with(&self.base)
    }

    /// Files in `sub_dir` named `<id>` or `<id>.*`
    pub fn matching_files(&self, sub_dir: SubDirKind, resource_id: &str) -> io::Result<Vec<PathBuf>> {
        let id = escape_file_name(resource_id);
        let prefix = format!("{}.", id);
        let read_dir = match fs::read_dir(self.dir(sub_dir)) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut matches = Vec::new();
        for entry in read_dir {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name == id || name.starts_with(&prefix) {
                matches.push(entry.path());
            }
        }
        Ok(matches)
    }
}
