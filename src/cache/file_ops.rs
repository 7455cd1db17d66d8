//! Filesystem primitives for cache transitions
//!
//! Every transition is a move/copy of one blob plus optional symlink maintenance. A failed
//! symlink step rolls the blob back so disk keeps matching the untouched index.

use std::fs::{self, File};
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use tracing::{debug, trace, warn};

use super::types::FileOperation;

/// Move a file, falling back to copy + delete across filesystems
pub fn move_file(source: &Path, dest: &Path) -> io::Result<()> {
    match fs::rename(source, dest) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            debug!(
                source = %source.display(),
                dest = %dest.display(),
                "Cross-device move, copying instead"
            );
            copy_file(source, dest)?;
            fs::remove_file(source)
        }
        Err(e) => Err(e),
    }
}

/// Copy a file through a temp file in the destination directory
///
/// The destination appears under its final name only once fully written.
pub fn copy_file(source: &Path, dest: &Path) -> io::Result<()> {
    let parent = dest.parent().unwrap_or(Path::new("/tmp"));
    let mut src = File::open(source)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    io::copy(&mut src, tmp.as_file_mut())?;
    tmp.persist(dest).map_err(|e| e.error)?;
    Ok(())
}

/// Move or copy according to `operation`
pub fn transfer(source: &Path, dest: &Path, operation: FileOperation) -> io::Result<()> {
    match operation {
        FileOperation::Move => move_file(source, dest),
        FileOperation::Copy => copy_file(source, dest),
    }
}

/// Delete a file or symlink; a missing path is not an error
///
/// Returns whether something was deleted.
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Whether `path` itself is a symlink (not followed)
pub fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

/// Replace whatever sits at `link` with a symlink to `target`
pub fn replace_symlink(target: &Path, link: &Path) -> io::Result<()> {
    remove_if_exists(link)?;
    symlink(target, link)
}

/// Delete regular files and symlinks directly under `dir`; sub-directories are left alone
///
/// Returns the number of files deleted.
pub fn delete_files_in(dir: &Path) -> io::Result<usize> {
    let mut deleted = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => deleted += 1,
            Err(e) => warn!(path = %entry.path().display(), error = %e, "Failed to delete cache file"),
        }
    }
    Ok(deleted)
}

/// One filesystem step of a cache state transition
#[derive(Debug, Clone)]
pub struct Transition {
    /// Current blob location (equal to `dest` when nothing moves)
    pub source: PathBuf,
    /// Blob location after the transition; also the symlink target
    pub dest: PathBuf,
    pub operation: FileOperation,
    /// Symlink to delete, and optionally recreate
    pub symlink: Option<PathBuf>,
    pub create_symlink: bool,
}

impl Transition {
    /// Transition that moves a blob and touches no symlink
    pub fn relocate(source: PathBuf, dest: PathBuf) -> Self {
        Self {
            source,
            dest,
            operation: FileOperation::Move,
            symlink: None,
            create_symlink: false,
        }
    }

    /// Transition that leaves the blob where it is
    pub fn in_place(path: PathBuf) -> Self {
        Self::relocate(path.clone(), path)
    }

    /// Delete `link`, then recreate it pointing at `dest` when `create` is set
    pub fn with_symlink(mut self, link: PathBuf, create: bool) -> Self {
        self.symlink = Some(link);
        self.create_symlink = create;
        self
    }

    /// Execute the step
    ///
    /// Absence of the old symlink is not an error. If recreating the symlink fails, the blob is
    /// moved (or the copy deleted) back before the error is returned.
    pub fn apply(&self) -> io::Result<()> {
        let relocated = self.source != self.dest;
        if relocated {
            transfer(&self.source, &self.dest, self.operation)?;
            trace!(
                source = %self.source.display(),
                dest = %self.dest.display(),
                operation = ?self.operation,
                "Relocated cache blob"
            );
        }

        let Some(link) = &self.symlink else {
            return Ok(());
        };

        let result = remove_if_exists(link).and_then(|_| {
            if self.create_symlink {
                symlink(&self.dest, link)
            } else {
                Ok(())
            }
        });

        if let Err(e) = result {
            warn!(link = %link.display(), error = %e, "Symlink update failed");
            if relocated {
                self.roll_back();
            }
            return Err(e);
        }
        Ok(())
    }

    fn roll_back(&self) {
        let undo = match self.operation {
            FileOperation::Move => move_file(&self.dest, &self.source),
            FileOperation::Copy => fs::remove_file(&self.dest),
        };
        if let Err(e) = undo {
            warn!(
                source = %self.source.display(),
                dest = %self.dest.display(),
                error = %e,
                "Failed to roll back cache blob"
            );
        }
    }
}
