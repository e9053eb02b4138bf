//! Run manifest: `original path → staged copy path`.
//!
//! Written by staging (merged with whatever is already in the run
//! directory), consumed and pruned by finalization.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::RelocateError;

/// File name of the manifest inside the run directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Mapping of originals to their staged copies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    entries: BTreeMap<PathBuf, PathBuf>,
}

impl Manifest {
    /// Manifest path for a run directory.
    #[must_use]
    pub fn path_in(run_dir: &Path) -> PathBuf {
        run_dir.join(MANIFEST_FILE)
    }

    /// Load the manifest from `run_dir`. A missing file is an empty manifest.
    ///
    /// # Errors
    ///
    /// [`RelocateError::Io`] if the file cannot be read,
    /// [`RelocateError::CorruptManifest`] if it is not a JSON object of paths.
    pub fn load(run_dir: &Path) -> Result<Self, RelocateError> {
        let path = Self::path_in(run_dir);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path).map_err(|source| RelocateError::Io {
            path: path.clone(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|e| RelocateError::CorruptManifest {
            path,
            message: e.to_string(),
        })
    }

    /// Write the manifest into `run_dir` (temp file, then rename).
    ///
    /// # Errors
    ///
    /// [`RelocateError::Io`] if the directory or file cannot be written.
    pub fn save(&self, run_dir: &Path) -> Result<(), RelocateError> {
        let path = Self::path_in(run_dir);
        let io_err = |source| RelocateError::Io {
            path: path.clone(),
            source,
        };
        fs::create_dir_all(run_dir).map_err(io_err)?;

        let json = serde_json::to_string_pretty(self).map_err(|e| RelocateError::CorruptManifest {
            path: path.clone(),
            message: e.to_string(),
        })?;
        let tmp = run_dir.join(format!("{MANIFEST_FILE}.tmp"));
        let mut file = fs::File::create(&tmp).map_err(io_err)?;
        file.write_all(json.as_bytes()).map_err(io_err)?;
        drop(file);
        fs::rename(&tmp, &path).map_err(io_err)
    }

    /// Record a staged copy, replacing any previous copy of `original`.
    pub fn insert(&mut self, original: PathBuf, staged: PathBuf) -> Option<PathBuf> {
        self.entries.insert(original, staged)
    }

    /// Forget `original`.
    pub fn remove(&mut self, original: &Path) -> Option<PathBuf> {
        self.entries.remove(original)
    }

    /// Forget every original whose copy is `staged`. Returns the originals.
    pub fn remove_by_staged(&mut self, staged: &Path) -> Vec<PathBuf> {
        let originals: Vec<PathBuf> = self
            .entries
            .iter()
            .filter(|(_, s)| s.as_path() == staged)
            .map(|(o, _)| o.clone())
            .collect();
        for original in &originals {
            self.entries.remove(original);
        }
        originals
    }

    /// Staged copy of `original`, if recorded.
    #[must_use]
    pub fn get(&self, original: &Path) -> Option<&Path> {
        self.entries.get(original).map(PathBuf::as_path)
    }

    /// Entries in original-path order.
    pub fn iter(&self) -> impl Iterator<Item = (&Path, &Path)> {
        self.entries
            .iter()
            .map(|(o, s)| (o.as_path(), s.as_path()))
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the manifest is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
