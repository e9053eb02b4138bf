//! File actions module.
//!
//! Turns cached verdicts into filesystem actions in two explicit phases:
//!
//! 1. **Stage** ([`stage`]): copy every review candidate into
//!    `<run>/<bucket>/` and record `original → copy` in the run manifest.
//!    Originals are never modified.
//! 2. **Finalize** ([`finalize`]): after the user has reviewed the bucket
//!    folders (deleting copies of anything worth keeping), move the originals
//!    whose copies remain into `<run>/final_deletion/` and drop the copies.
//!
//! Both phases are dry runs unless `execute` is set.
//!
//! ```no_run
//! use imgtriage::actions::{plan, stage, CollisionPolicy, StageOptions, Thresholds};
//! use imgtriage::cache::ModelKey;
//! use std::path::Path;
//!
//! let key: ModelKey = "gemini_512".parse().unwrap();
//! let plan = plan(Path::new(".image_analysis_cache.json"), key, &Thresholds::default()).unwrap();
//! let report = stage(&plan, &StageOptions {
//!     run_dir: "image_cleanup_moves".into(),
//!     on_collision: CollisionPolicy::Rename,
//!     limit: None,
//!     execute: false,
//! }).unwrap();
//! println!("{}", report.summary());
//! ```

pub mod bucket;
pub mod finalize;
pub mod manifest;
pub mod plan;
pub mod stage;

use std::path::{Path, PathBuf};

use thiserror::Error;

pub use bucket::{select_bucket, Bucket, Thresholds};
pub use finalize::{finalize, remaining, FinalizeReport, FinalizedMove, FINAL_DIR};
pub use manifest::{Manifest, MANIFEST_FILE};
pub use plan::{plan, plan_from, Plan, PlannedItem};
pub use stage::{stage, CollisionPolicy, StageOptions, StageReport, StagedCopy};

use crate::cache::CacheError;

/// Error type for planning and relocation.
#[derive(Debug, Error)]
pub enum RelocateError {
    /// The cache file does not exist.
    #[error("cache not found: {0}")]
    CacheNotFound(PathBuf),

    /// The cache file could not be read or parsed.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// The run manifest is not valid.
    #[error("manifest {path} is corrupt: {message}")]
    CorruptManifest {
        /// Manifest path
        path: PathBuf,
        /// Parser message
        message: String,
    },

    /// General I/O error.
    #[error("I/O error for {path}: {source}")]
    Io {
        /// Path where the error occurred
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

impl RelocateError {
    /// Get the path associated with this error (if any).
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::CacheNotFound(p)
            | Self::CorruptManifest { path: p, .. }
            | Self::Io { path: p, .. } => Some(p),
            Self::Cache(e) => e.path(),
        }
    }
}

/// `wanted` if free, else the first free `stem_N.ext` with `N >= 1`.
pub(crate) fn first_free_name(wanted: &Path, taken: impl Fn(&Path) -> bool) -> PathBuf {
    if !taken(wanted) {
        return wanted.to_path_buf();
    }
    let stem = wanted
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = wanted
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    (1..)
        .map(|n| wanted.with_file_name(format!("{stem}_{n}{ext}")))
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| wanted.to_path_buf())
}
