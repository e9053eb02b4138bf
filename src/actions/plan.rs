//! Cleanup planning from the cache file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

use super::bucket::{select_bucket, Bucket, Thresholds};
use super::RelocateError;
use crate::cache::{read_cache_file, CacheFile, ModelKey};
use crate::classify::Verdict;

/// One cached image and its bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedItem {
    /// Hex fingerprint of the record.
    pub fingerprint: String,
    /// Last known location of the image.
    pub source: PathBuf,
    /// Assigned bucket.
    pub bucket: Bucket,
    /// The verdict the bucket was derived from.
    pub verdict: Verdict,
}

/// Bucket assignments for every usable cache record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    /// Model key the plan was built for.
    #[serde(serialize_with = "serialize_display")]
    pub model_key: ModelKey,
    /// Usable records, sorted by source path. Includes [`Bucket::Keep`].
    pub items: Vec<PlannedItem>,
    /// Records whose source file no longer exists.
    pub missing_sources: Vec<PathBuf>,
    /// Records without a recorded path.
    pub without_path: usize,
    /// Records from another policy version.
    pub stale: usize,
    /// Records with nothing cached for this model key.
    pub without_result: usize,
}

fn serialize_display<S: serde::Serializer>(key: &ModelKey, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(key)
}

impl Plan {
    /// Items that will be staged (everything but keep).
    pub fn review_items(&self) -> impl Iterator<Item = &PlannedItem> {
        self.items.iter().filter(|item| item.bucket.is_review())
    }

    /// Per-bucket counts of items that would be staged.
    #[must_use]
    pub fn counts(&self) -> BTreeMap<Bucket, usize> {
        let mut counts = BTreeMap::new();
        for item in self.review_items() {
            *counts.entry(item.bucket).or_insert(0) += 1;
        }
        counts
    }

    /// Number of items that stay where they are.
    #[must_use]
    pub fn kept(&self) -> usize {
        self.items.len() - self.review_items().count()
    }

    /// Human-readable summary of the plan.
    #[must_use]
    pub fn summary(&self) -> String {
        let counts = self.counts();
        let buckets = if counts.is_empty() {
            "nothing to review".to_string()
        } else {
            counts
                .iter()
                .map(|(b, n)| format!("{b}: {n}"))
                .collect::<Vec<_>>()
                .join(", ")
        };
        format!(
            "{} ({}): {}; {} kept, {} missing source(s)",
            self.model_key,
            self.items.len(),
            buckets,
            self.kept(),
            self.missing_sources.len()
        )
    }
}

/// Build a plan from the cache file at `cache_path`, read-only.
///
/// # Errors
///
/// [`RelocateError::CacheNotFound`] if the file does not exist, or a cache
/// read/parse error.
pub fn plan(
    cache_path: &Path,
    model_key: ModelKey,
    thresholds: &Thresholds,
) -> Result<Plan, RelocateError> {
    if !cache_path.is_file() {
        return Err(RelocateError::CacheNotFound(cache_path.to_path_buf()));
    }
    let file = read_cache_file(cache_path)?;
    Ok(plan_from(&file, model_key, thresholds))
}

/// Build a plan from an already-loaded cache file.
#[must_use]
pub fn plan_from(file: &CacheFile, model_key: ModelKey, thresholds: &Thresholds) -> Plan {
    let mut plan = Plan {
        model_key,
        items: Vec::new(),
        missing_sources: Vec::new(),
        without_path: 0,
        stale: 0,
        without_result: 0,
    };

    for (fingerprint, record) in &file.entries {
        let Some(source) = &record.path else {
            plan.without_path += 1;
            continue;
        };
        if !record.is_current() {
            plan.stale += 1;
            continue;
        }
        let Some(result) = record.result(model_key) else {
            plan.without_result += 1;
            continue;
        };
        if !source.exists() {
            log::debug!("Source no longer exists: {}", source.display());
            plan.missing_sources.push(source.clone());
            continue;
        }
        plan.items.push(PlannedItem {
            fingerprint: fingerprint.clone(),
            source: source.clone(),
            bucket: select_bucket(&result.result, thresholds),
            verdict: result.result.clone(),
        });
    }

    plan.items.sort_by(|a, b| a.source.cmp(&b.source));
    plan.missing_sources.sort();
    log::info!("Cleanup plan {}", plan.summary());
    plan
}
