//! Structured classification verdicts.
//!
//! A [`Verdict`] is what every provider response is normalized into, and what
//! the cache stores per model key. Failed calls become the
//! [`Verdict::sentinel`] so they still produce a cacheable terminal outcome.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::ClassifyError;

/// Maximum length of the reason carried by a sentinel verdict.
pub const SENTINEL_REASON_LEN: usize = 100;

/// Category tag used by sentinel verdicts.
pub const ERROR_CATEGORY: &str = "error";

/// Category tag that routes an image to the `documents` bucket.
pub const DOCUMENT_CATEGORY: &str = "document";

/// The provider's decision for an image.
///
/// Deserialization is case-insensitive. Anything that is not one of the three
/// known decisions becomes [`Decision::Unknown`], which lets old or hand-edited
/// cache records still be read; provider responses with an unknown decision
/// are rejected by [`Verdict::from_response`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Decision {
    /// Keep the image.
    Keep,
    /// The provider could not decide.
    Unsure,
    /// The image is a deletion candidate.
    Delete,
    /// Unrecognized decision string.
    Unknown,
}

impl Decision {
    /// Parse a decision string, ignoring case and surrounding whitespace.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "keep" => Self::Keep,
            "unsure" => Self::Unsure,
            "delete" => Self::Delete,
            _ => Self::Unknown,
        }
    }

    /// Lowercase wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Keep => "keep",
            Self::Unsure => "unsure",
            Self::Delete => "delete",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Decision {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Decision {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.as_deref().map_or(Self::Unknown, Self::parse))
    }
}

fn unknown_decision() -> Decision {
    Decision::Unknown
}

/// A confidence as a number, a numeric string, or null (read as 0.0).
fn lenient_confidence<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(0.0),
        Some(serde_json::Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| serde::de::Error::custom(format!("confidence {n} is not a float"))),
        Some(serde_json::Value::String(s)) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("confidence '{s}' is not a number"))),
        Some(other) => Err(serde::de::Error::custom(format!(
            "confidence must be a number, got {other}"
        ))),
    }
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Structured classification result for one image.
///
/// Confidence values are taken as the provider returns them. They are
/// expected to sum to 1.0 but that is never enforced here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    /// Keep / unsure / delete.
    #[serde(default = "unknown_decision")]
    pub decision: Decision,
    /// Confidence that the image should be kept.
    #[serde(default, deserialize_with = "lenient_confidence")]
    pub confidence_keep: f64,
    /// Confidence that the provider is unsure.
    #[serde(default, deserialize_with = "lenient_confidence")]
    pub confidence_unsure: f64,
    /// Confidence that the image should be deleted.
    #[serde(default, deserialize_with = "lenient_confidence")]
    pub confidence_delete: f64,
    /// Primary category tag (e.g. "personal", "screenshot", "document").
    #[serde(default, deserialize_with = "null_as_empty")]
    pub primary_category: String,
    /// Short free-text justification.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub reason: String,
}

impl Verdict {
    /// Build the sentinel verdict standing in for a failed classification.
    ///
    /// The reason is the error message truncated to
    /// [`SENTINEL_REASON_LEN`] characters.
    #[must_use]
    pub fn sentinel(message: &str) -> Self {
        Self {
            decision: Decision::Unsure,
            confidence_keep: 0.0,
            confidence_unsure: 1.0,
            confidence_delete: 0.0,
            primary_category: ERROR_CATEGORY.to_string(),
            reason: message.chars().take(SENTINEL_REASON_LEN).collect(),
        }
    }

    /// Whether this verdict was produced by a failure.
    #[must_use]
    pub fn is_sentinel(&self) -> bool {
        self.primary_category == ERROR_CATEGORY
    }

    /// Parse a provider's response text into a verdict.
    ///
    /// Models frequently wrap JSON in markdown fences or add a sentence of
    /// prose; the outermost `{ ... }` object is extracted before parsing.
    ///
    /// # Errors
    ///
    /// Returns [`ClassifyError::MalformedResponse`] if no JSON object is found,
    /// it does not match the verdict schema, or the decision is not one of
    /// keep / unsure / delete.
    pub fn from_response(text: &str) -> Result<Self, ClassifyError> {
        let json = extract_json_object(text).ok_or_else(|| {
            ClassifyError::MalformedResponse(format!(
                "no JSON object in response: {}",
                preview(text)
            ))
        })?;

        let verdict: Verdict = serde_json::from_str(json).map_err(|e| {
            ClassifyError::MalformedResponse(format!("invalid verdict JSON: {e}"))
        })?;

        if verdict.decision == Decision::Unknown {
            return Err(ClassifyError::MalformedResponse(format!(
                "missing or unrecognized decision in: {}",
                preview(json)
            )));
        }

        Ok(verdict)
    }
}

/// Slice out the outermost JSON object of a response.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn preview(text: &str) -> String {
    const MAX: usize = 80;
    let trimmed = text.trim();
    if trimmed.chars().count() <= MAX {
        trimmed.to_string()
    } else {
        format!("{}...", trimmed.chars().take(MAX).collect::<String>())
    }
}
