//! Phase 2: move originals whose copies are still awaiting review.
//!
//! The user reviews the bucket folders and deletes the copies of anything
//! they want to keep. Every manifest entry whose copy is still in a review
//! bucket then has its original moved to `<run>/final_deletion/`, the copy
//! removed and the entry dropped from the manifest.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;

use super::bucket::Bucket;
use super::manifest::Manifest;
use super::{first_free_name, RelocateError};

/// Directory under the run directory that receives finalized originals.
pub const FINAL_DIR: &str = "final_deletion";

/// One finalized (or would-be finalized) original.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinalizedMove {
    /// The original image.
    pub original: PathBuf,
    /// Its staged copy, removed on execute.
    pub staged: PathBuf,
    /// Where the original goes.
    pub destination: PathBuf,
}

/// Results of a finalize run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FinalizeReport {
    /// Originals moved (or planned, in a dry run).
    pub moves: Vec<FinalizedMove>,
    /// Manifest entries left alone, with the reason.
    pub skipped: Vec<(PathBuf, String)>,
    /// Entries whose move failed.
    pub failures: Vec<(PathBuf, String)>,
    /// Staged copies that could not be removed after their original moved.
    pub leftover_copies: Vec<(PathBuf, String)>,
    /// Whether the filesystem was modified.
    pub executed: bool,
}

impl FinalizeReport {
    /// Whether every attempted move succeeded.
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.failures.is_empty() && self.leftover_copies.is_empty()
    }

    /// Human-readable summary of the operation.
    #[must_use]
    pub fn summary(&self) -> String {
        let verb = if self.executed { "Moved" } else { "Would move" };
        let mut text = format!(
            "{verb} {} original(s) to {FINAL_DIR}/, skipped {}",
            self.moves.len(),
            self.skipped.len()
        );
        if !self.failures.is_empty() {
            text.push_str(&format!(", {} failed", self.failures.len()));
        }
        if !self.leftover_copies.is_empty() {
            text.push_str(&format!(
                ", {} staged copie(s) left behind",
                self.leftover_copies.len()
            ));
        }
        if !self.executed {
            text.push_str(" (dry run)");
        }
        text
    }
}

/// Finalize every manifest entry still awaiting review.
///
/// # Errors
///
/// Returns [`RelocateError`] if the manifest cannot be read or written.
/// Per-entry failures are collected in the report instead.
pub fn finalize(run_dir: &Path, execute: bool) -> Result<FinalizeReport, RelocateError> {
    finalize_with(run_dir, execute, |staged| fs::remove_file(staged))
}

fn finalize_with(
    run_dir: &Path,
    execute: bool,
    remove_copy: impl Fn(&Path) -> io::Result<()>,
) -> Result<FinalizeReport, RelocateError> {
    let mut manifest = Manifest::load(run_dir)?;
    let final_dir = run_dir.join(FINAL_DIR);
    let review_dirs: Vec<PathBuf> = Bucket::REVIEW
        .iter()
        .map(|b| canonical(&run_dir.join(b.dir_name())))
        .collect();

    let mut report = FinalizeReport {
        executed: execute,
        ..Default::default()
    };
    let mut claimed: HashSet<PathBuf> = HashSet::new();
    let entries: Vec<(PathBuf, PathBuf)> = manifest
        .iter()
        .map(|(o, s)| (o.to_path_buf(), s.to_path_buf()))
        .collect();

    for (original, staged) in entries {
        if !staged.is_file() {
            report
                .skipped
                .push((original, "staged copy was removed".to_string()));
            continue;
        }
        let in_review = staged
            .parent()
            .is_some_and(|parent| review_dirs.contains(&canonical(parent)));
        if !in_review {
            report
                .skipped
                .push((original, "staged copy is not in a review bucket".to_string()));
            continue;
        }
        if !original.is_file() {
            report
                .skipped
                .push((original, "original no longer exists".to_string()));
            continue;
        }

        let Some(file_name) = original.file_name() else {
            report
                .skipped
                .push((original, "original has no file name".to_string()));
            continue;
        };
        let destination = first_free_name(&final_dir.join(file_name), |p| {
            p.exists() || claimed.contains(p)
        });

        if execute {
            let moved = fs::create_dir_all(&final_dir)
                .and_then(|()| move_file(&original, &destination));
            if let Err(e) = moved {
                log::warn!("Failed to finalize {}: {}", original.display(), e);
                report.failures.push((original, e.to_string()));
                continue;
            }
            // The original is gone from its place; the entry goes with it.
            manifest.remove(&original);
            if let Err(e) = remove_copy(&staged) {
                log::warn!("Failed to remove staged copy {}: {}", staged.display(), e);
                report.leftover_copies.push((staged.clone(), e.to_string()));
            }
        }
        log::debug!("{} -> {}", original.display(), destination.display());

        claimed.insert(destination.clone());
        report.moves.push(FinalizedMove {
            original,
            staged,
            destination,
        });
    }

    if execute && !report.moves.is_empty() {
        manifest.save(run_dir)?;
    }
    log::info!("{}", report.summary());
    Ok(report)
}

/// Files left in each review bucket. Buckets with none are omitted.
///
/// # Errors
///
/// [`RelocateError::Io`] if a bucket directory exists but cannot be read.
pub fn remaining(run_dir: &Path) -> Result<BTreeMap<Bucket, usize>, RelocateError> {
    let mut counts = BTreeMap::new();
    for bucket in Bucket::REVIEW {
        let dir = run_dir.join(bucket.dir_name());
        if !dir.is_dir() {
            continue;
        }
        let io_err = |source| RelocateError::Io {
            path: dir.clone(),
            source,
        };
        let mut count = 0;
        for entry in fs::read_dir(&dir).map_err(io_err)? {
            if entry.map_err(io_err)?.file_type().map_err(io_err)?.is_file() {
                count += 1;
            }
        }
        if count > 0 {
            counts.insert(bucket, count);
        }
    }
    Ok(counts)
}

/// Rename, falling back to copy and remove when rename is not possible
/// (for example across filesystems).
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            log::debug!(
                "rename {} failed ({}), copying instead",
                from.display(),
                rename_err
            );
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}

fn canonical(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
