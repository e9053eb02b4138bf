//! Engine stages, progress events and the scan snapshot.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::classify::Provider;

/// Year bucket for images with no usable capture time.
pub const UNKNOWN_YEAR: &str = "Unknown";

/// Engine lifecycle stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Not started.
    #[default]
    Idle,
    /// Walking the tree to find files.
    Counting,
    /// Reading image metadata and fingerprints.
    Scanning,
    /// Looking up cached verdicts for one provider.
    CacheChecking,
    /// Classifying uncached images with one provider.
    Classifying,
    /// Finished.
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Counting => "counting",
            Self::Scanning => "scanning",
            Self::CacheChecking => "cache check",
            Self::Classifying => "classifying",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// Running counters of the scan stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanSnapshot {
    /// Files found while counting.
    pub total: usize,
    /// Files processed so far.
    pub scanned: usize,
    /// Images per lowercase extension.
    pub by_extension: BTreeMap<String, usize>,
    /// Images per `"Make Model"` device.
    pub by_device: BTreeMap<String, usize>,
    /// Images per capture year, then per extension.
    pub by_year: BTreeMap<String, BTreeMap<String, usize>>,
    /// Files that are not images.
    pub non_images: usize,
}

impl ScanSnapshot {
    /// Empty snapshot for `total` files.
    #[must_use]
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    /// Count one image.
    pub fn record_image(&mut self, extension: &str, device: &str, year: Option<i32>) {
        self.scanned += 1;
        *self.by_extension.entry(extension.to_string()).or_insert(0) += 1;
        *self.by_device.entry(device.to_string()).or_insert(0) += 1;
        let year = year.map_or_else(|| UNKNOWN_YEAR.to_string(), |y| y.to_string());
        *self
            .by_year
            .entry(year)
            .or_default()
            .entry(extension.to_string())
            .or_insert(0) += 1;
    }

    /// Count one file that is not an image.
    pub fn record_other(&mut self) {
        self.scanned += 1;
        self.non_images += 1;
    }

    /// Images counted so far.
    #[must_use]
    pub fn images(&self) -> usize {
        self.scanned - self.non_images
    }
}

/// Progress event sent by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    /// The engine entered a stage. `provider` is set for per-provider stages.
    Stage {
        /// New stage
        stage: Stage,
        /// Provider of the current pass
        provider: Option<Provider>,
    },
    /// Scan counters, every few files and once at the end of the scan.
    Scan(ScanSnapshot),
    /// Cache lookup progress.
    CacheCheck {
        /// Images looked up
        checked: usize,
        /// Images to look up
        total: usize,
        /// Lookups that hit
        cached: usize,
    },
    /// One classification outcome was persisted.
    Analysis {
        /// Classified image
        path: PathBuf,
        /// Outcomes so far
        done: usize,
        /// Images sent to the pipeline
        total: usize,
        /// Failures so far
        failed: usize,
    },
    /// A provider pass stopped submitting work.
    PassAborted {
        /// Provider of the pass
        provider: Provider,
        /// Why
        reason: String,
    },
}
