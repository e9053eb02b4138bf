//! Phase 1: copy review candidates into bucket folders.
//!
//! Originals are never touched. Each non-keep item is copied to
//! `<run>/<bucket>/<file name>` and recorded in the run manifest. Without
//! `execute` nothing on disk changes; the report describes what would happen.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::bucket::Bucket;
use super::manifest::Manifest;
use super::plan::Plan;
use super::{first_free_name, RelocateError};

/// What to do when a staging destination is already taken.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum CollisionPolicy {
    /// Leave the existing file and skip the item.
    #[default]
    Skip,
    /// Replace the existing file. Copies made earlier in the same run are
    /// never replaced; those items are skipped. A replaced copy's earlier
    /// manifest entry is dropped.
    Overwrite,
    /// Use the first free `stem_N.ext`.
    Rename,
}

/// Options for [`stage`].
#[derive(Debug, Clone)]
pub struct StageOptions {
    /// Run directory.
    pub run_dir: PathBuf,
    /// Collision handling.
    pub on_collision: CollisionPolicy,
    /// Stage at most this many items.
    pub limit: Option<usize>,
    /// Perform the copies. `false` is a dry run.
    pub execute: bool,
}

/// One staged (or would-be staged) copy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StagedCopy {
    /// Original image.
    pub source: PathBuf,
    /// Copy destination.
    pub destination: PathBuf,
    /// Bucket of the copy.
    pub bucket: Bucket,
    /// Whether an existing file was replaced.
    pub overwritten: bool,
}

/// Results of a staging run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StageReport {
    /// Copies made (or planned, in a dry run).
    pub copies: Vec<StagedCopy>,
    /// Items skipped with the reason.
    pub skipped: Vec<(PathBuf, String)>,
    /// Items whose copy failed.
    pub failures: Vec<(PathBuf, String)>,
    /// Whether the filesystem was modified.
    pub executed: bool,
}

impl StageReport {
    /// Whether every attempted copy succeeded.
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.failures.is_empty()
    }

    /// Human-readable summary of the operation.
    #[must_use]
    pub fn summary(&self) -> String {
        let verb = if self.executed { "Copied" } else { "Would copy" };
        let mut text = format!(
            "{verb} {} file(s), skipped {}",
            self.copies.len(),
            self.skipped.len()
        );
        if !self.failures.is_empty() {
            text.push_str(&format!(", {} failed", self.failures.len()));
        }
        if !self.executed {
            text.push_str(" (dry run)");
        }
        text
    }
}

/// Copy every review item of `plan` into its bucket folder.
///
/// Destinations claimed earlier in the same run count as collisions.
/// Originals already staged in this run directory (manifest entry whose copy
/// still exists) are skipped.
///
/// # Errors
///
/// Returns [`RelocateError`] if the manifest cannot be read or written.
/// Per-item copy failures are collected in the report instead.
pub fn stage(plan: &Plan, options: &StageOptions) -> Result<StageReport, RelocateError> {
    let mut manifest = Manifest::load(&options.run_dir)?;
    let mut report = StageReport {
        executed: options.execute,
        ..Default::default()
    };
    let mut claimed: HashSet<PathBuf> = HashSet::new();

    let items = plan
        .review_items()
        .take(options.limit.unwrap_or(usize::MAX));

    for item in items {
        if let Some(existing) = manifest.get(&item.source).filter(|p| p.exists()) {
            report
                .skipped
                .push((item.source.clone(), format!("already staged at {}", existing.display())));
            continue;
        }

        let Some(file_name) = item.source.file_name() else {
            report
                .skipped
                .push((item.source.clone(), "source has no file name".to_string()));
            continue;
        };
        let bucket_dir = options.run_dir.join(item.bucket.dir_name());
        let wanted = bucket_dir.join(file_name);
        let taken = |p: &Path| p.exists() || claimed.contains(p);

        let (destination, overwritten) = if !taken(&wanted) {
            (wanted, false)
        } else {
            match options.on_collision {
                CollisionPolicy::Skip => {
                    log::debug!("SKIP: {} -> {} (exists)", item.source.display(), wanted.display());
                    report.skipped.push((
                        item.source.clone(),
                        format!("destination exists: {}", wanted.display()),
                    ));
                    continue;
                }
                CollisionPolicy::Overwrite if claimed.contains(&wanted) => {
                    report.skipped.push((
                        item.source.clone(),
                        format!("destination claimed in this run: {}", wanted.display()),
                    ));
                    continue;
                }
                CollisionPolicy::Overwrite => (wanted, true),
                CollisionPolicy::Rename => (first_free_name(&wanted, taken), false),
            }
        };

        if options.execute {
            let copied = fs::create_dir_all(&bucket_dir)
                .and_then(|()| fs::copy(&item.source, &destination));
            if let Err(e) = copied {
                log::warn!(
                    "Failed to copy {} to {}: {}",
                    item.source.display(),
                    destination.display(),
                    e
                );
                report.failures.push((item.source.clone(), e.to_string()));
                continue;
            }
            if overwritten {
                for previous in manifest.remove_by_staged(&destination) {
                    log::info!(
                        "Dropped manifest entry for {} (copy replaced by {})",
                        previous.display(),
                        item.source.display()
                    );
                }
            }
            manifest.insert(item.source.clone(), destination.clone());
        }
        log::debug!("{} -> {}", item.source.display(), destination.display());

        claimed.insert(destination.clone());
        report.copies.push(StagedCopy {
            source: item.source.clone(),
            destination,
            bucket: item.bucket,
            overwritten,
        });
    }

    if options.execute && !report.copies.is_empty() {
        manifest.save(&options.run_dir)?;
    }
    log::info!("{}", report.summary());
    Ok(report)
}
