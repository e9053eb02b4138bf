//! Bucket assignment.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::classify::verdict::DOCUMENT_CATEGORY;
use crate::classify::{Decision, Verdict};

/// Where a classified image goes. Derived from a verdict, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    /// Confident deletion candidate.
    ToDelete,
    /// The provider was unsure.
    Unsure,
    /// Kept, but with low confidence.
    LowKeep,
    /// Kept. Never relocated.
    Keep,
    /// Photographed paper, forms, whiteboards.
    Documents,
    /// No rule matched.
    Unknown,
}

impl Bucket {
    /// Buckets that receive staged copies, in directory order.
    pub const REVIEW: [Bucket; 5] = [
        Bucket::ToDelete,
        Bucket::Unsure,
        Bucket::LowKeep,
        Bucket::Documents,
        Bucket::Unknown,
    ];

    /// Directory name under the run directory.
    #[must_use]
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::ToDelete => "to_delete",
            Self::Unsure => "unsure",
            Self::LowKeep => "low_keep",
            Self::Keep => "keep",
            Self::Documents => "documents",
            Self::Unknown => "unknown",
        }
    }

    /// Whether images in this bucket are staged for review.
    #[must_use]
    pub fn is_review(self) -> bool {
        self != Self::Keep
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Confidence thresholds for bucket assignment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Minimum `confidence_delete` for `to_delete`.
    pub delete: f64,
    /// `confidence_unsure` at or above this routes to `unsure`.
    pub unsure: f64,
    /// `confidence_keep` below this routes a keep to `low_keep`.
    pub low_keep: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            delete: 0.60,
            unsure: 0.50,
            low_keep: 0.75,
        }
    }
}

impl Thresholds {
    /// Check that every threshold lies in `[0, 1]`.
    ///
    /// # Errors
    ///
    /// Returns a message naming the first out-of-range threshold.
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("delete", self.delete),
            ("unsure", self.unsure),
            ("low_keep", self.low_keep),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(format!("{name} threshold {value} is outside 0.0..=1.0"));
            }
        }
        Ok(())
    }
}

/// Assign a bucket. Rules apply in order; the first match wins.
///
/// 1. category `document` → [`Bucket::Documents`]
/// 2. delete with `confidence_delete >= delete` → [`Bucket::ToDelete`]
/// 3. unsure, or `confidence_unsure >= unsure` → [`Bucket::Unsure`]
/// 4. keep with `confidence_keep < low_keep` → [`Bucket::LowKeep`]
/// 5. keep → [`Bucket::Keep`]
/// 6. anything else → [`Bucket::Unknown`]
#[must_use]
pub fn select_bucket(verdict: &Verdict, thresholds: &Thresholds) -> Bucket {
    if verdict.primary_category == DOCUMENT_CATEGORY {
        return Bucket::Documents;
    }
    match verdict.decision {
        Decision::Delete if verdict.confidence_delete >= thresholds.delete => Bucket::ToDelete,
        Decision::Unsure => Bucket::Unsure,
        _ if verdict.confidence_unsure >= thresholds.unsure => Bucket::Unsure,
        Decision::Keep if verdict.confidence_keep < thresholds.low_keep => Bucket::LowKeep,
        Decision::Keep => Bucket::Keep,
        _ => Bucket::Unknown,
    }
}
