//! Directory walker implementation using walkdir.
//!
//! # Features
//!
//! - Sequential, deterministic (name-sorted) traversal
//! - Hidden file skipping
//! - Excluded subtrees (the run directory, so staged copies are not rescanned)
//! - Graceful shutdown via atomic flag
//!
//! Unreadable entries are yielded as [`ScanError`]s so the caller can count
//! and report them; they never stop the walk.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use walkdir::{DirEntry, WalkDir};

use super::{FileEntry, ScanError, WalkerConfig};

/// Directory walker.
pub struct Walker {
    root: PathBuf,
    config: WalkerConfig,
    shutdown_flag: Option<Arc<AtomicBool>>,
}

impl Walker {
    /// Create a walker rooted at `path`.
    #[must_use]
    pub fn new(path: &Path, config: WalkerConfig) -> Self {
        Self {
            root: path.to_path_buf(),
            config,
            shutdown_flag: None,
        }
    }

    /// Set the shutdown flag for graceful termination.
    #[must_use]
    pub fn with_shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown_flag = Some(flag);
        self
    }

    fn is_shutdown_requested(&self) -> bool {
        self.shutdown_flag
            .as_ref()
            .is_some_and(|f| f.load(Ordering::SeqCst))
    }

    /// Check that the root exists and is a directory.
    ///
    /// # Errors
    ///
    /// [`ScanError::NotFound`] or [`ScanError::NotADirectory`].
    pub fn check_root(&self) -> Result<(), ScanError> {
        match std::fs::metadata(&self.root) {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(ScanError::NotADirectory(self.root.clone())),
            Err(e) => Err(ScanError::from_io(&self.root, e)),
        }
    }

    fn is_excluded(&self, entry: &DirEntry) -> bool {
        if entry.depth() > 0 && self.config.skip_hidden && is_hidden(entry) {
            return true;
        }
        self.config
            .exclude
            .iter()
            .any(|excluded| entry.path().starts_with(excluded))
    }

    /// Walk the tree, yielding regular files in name order.
    pub fn walk(&self) -> impl Iterator<Item = Result<FileEntry, ScanError>> + '_ {
        WalkDir::new(&self.root)
            .follow_links(self.config.follow_symlinks)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |entry| !self.is_excluded(entry))
            .take_while(move |_| {
                if self.is_shutdown_requested() {
                    log::debug!("Walker: Shutdown requested, stopping iteration");
                    return false;
                }
                true
            })
            .filter_map(move |entry| match entry {
                Ok(entry) if entry.file_type().is_file() => Some(self.file_entry(&entry)),
                Ok(_) => None,
                Err(error) => {
                    let path = error
                        .path()
                        .map_or_else(|| self.root.clone(), Path::to_path_buf);
                    log::warn!("Walker error for {}: {}", path.display(), error);
                    let source = error
                        .into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("filesystem loop"));
                    Some(Err(ScanError::from_io(&path, source)))
                }
            })
    }

    fn file_entry(&self, entry: &DirEntry) -> Result<FileEntry, ScanError> {
        let path = entry.path();
        let metadata = entry
            .metadata()
            .map_err(|e| {
                let source = e
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("metadata unavailable"));
                ScanError::from_io(path, source)
            })?;
        Ok(FileEntry::new(
            path.to_path_buf(),
            metadata.len(),
            metadata.modified().ok(),
        ))
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .is_some_and(|name| name.starts_with('.'))
}
