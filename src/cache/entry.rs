//! Cache entry definitions.
//!
//! On-disk shape:
//!
//! ```json
//! { "version": "1.0",
//!   "entries": { "<fingerprint>": {
//!       "path": "/photos/a.jpg", "version": "1.0",
//!       "models": { "gemini_512": { "result": { ... }, "timestamp": 1700000000.5, "size": 512 } } } } }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::classify::{Provider, Verdict};

/// Version of the scoring policy. Records with any other version are misses.
pub const CACHE_VERSION: &str = "1.0";

/// Version assigned to records converted from the pre-versioned format.
pub const LEGACY_VERSION: &str = "0.0";

/// A `(provider, size)` pair naming one cached result slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModelKey {
    /// Provider that produced the verdict.
    pub provider: Provider,
    /// Upload size used for the request.
    pub size: u32,
}

impl ModelKey {
    /// Create a model key.
    #[must_use]
    pub fn new(provider: Provider, size: u32) -> Self {
        Self { provider, size }
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.provider, self.size)
    }
}

impl FromStr for ModelKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (provider, size) = s
            .rsplit_once('_')
            .ok_or_else(|| format!("invalid model key '{s}': expected <provider>_<size>"))?;
        let size = size
            .parse()
            .map_err(|_| format!("invalid model key '{s}': '{size}' is not a size"))?;
        Ok(Self::new(provider.parse()?, size))
    }
}

/// One cached verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResult {
    /// The verdict (possibly a sentinel).
    pub result: Verdict,
    /// Seconds since the Unix epoch when the result was stored.
    #[serde(default)]
    pub timestamp: f64,
    /// Upload size, duplicated from the key.
    #[serde(default)]
    pub size: u32,
}

impl ModelResult {
    /// Wrap a verdict stamped with the current time.
    #[must_use]
    pub fn now(result: Verdict, size: u32) -> Self {
        Self {
            result,
            timestamp: epoch_seconds(SystemTime::now()),
            size,
        }
    }
}

/// All cached results for one fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    /// Last known location (informational only).
    #[serde(default, deserialize_with = "empty_path_as_none")]
    pub path: Option<PathBuf>,
    /// Policy version the record was written under.
    #[serde(default = "legacy_version")]
    pub version: String,
    /// Results keyed by `"<provider>_<size>"`.
    #[serde(default)]
    pub models: BTreeMap<String, ModelResult>,
}

impl CacheRecord {
    /// An empty record under the current version.
    #[must_use]
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            version: CACHE_VERSION.to_string(),
            models: BTreeMap::new(),
        }
    }

    /// Whether the record was written under the running policy version.
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.version == CACHE_VERSION
    }

    /// The result stored under `key`, if any.
    #[must_use]
    pub fn result(&self, key: ModelKey) -> Option<&ModelResult> {
        self.models.get(&key.to_string())
    }
}

/// The whole cache file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheFile {
    /// Store-level version.
    pub version: String,
    /// Records keyed by hex fingerprint.
    #[serde(default)]
    pub entries: BTreeMap<String, CacheRecord>,
}

impl Default for CacheFile {
    fn default() -> Self {
        Self {
            version: CACHE_VERSION.to_string(),
            entries: BTreeMap::new(),
        }
    }
}

fn legacy_version() -> String {
    LEGACY_VERSION.to_string()
}

fn empty_path_as_none<'de, D>(deserializer: D) -> Result<Option<PathBuf>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<PathBuf>::deserialize(deserializer)?;
    Ok(raw.filter(|p| !p.as_os_str().is_empty()))
}

/// Seconds since the epoch as a float, the cache's timestamp unit.
#[must_use]
pub fn epoch_seconds(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
