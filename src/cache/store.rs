//! JSON-file analysis cache.
//!
//! The whole store lives in memory and is rewritten after every mutation
//! (temp file in the same directory, then rename). Only one writer is
//! supported; the scan engine owns the store and performs every write from
//! its consumer loop.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Local};
use serde::Serialize;
use serde_json::Value;

use super::entry::{
    epoch_seconds, CacheFile, CacheRecord, ModelKey, ModelResult, CACHE_VERSION, LEGACY_VERSION,
};
use crate::classify::Verdict;
use crate::scanner::Fingerprint;

const SECONDS_PER_DAY: f64 = 24.0 * 60.0 * 60.0;

/// Errors that can occur reading or writing the cache file.
#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    /// The cache file could not be read.
    #[error("Failed to read cache file {path}: {source}")]
    Read {
        /// Cache file path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The cache file is not valid cache JSON.
    #[error("Cache file {path} is corrupt: {message}")]
    Corrupt {
        /// Cache file path
        path: PathBuf,
        /// Parser message
        message: String,
    },

    /// The cache file could not be written.
    #[error("Failed to write cache file {path}: {source}")]
    Write {
        /// Cache file path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The in-memory store could not be serialized.
    #[error("Failed to serialize cache: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl CacheError {
    /// The cache file path involved, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Read { path, .. } | Self::Corrupt { path, .. } | Self::Write { path, .. } => {
                Some(path)
            }
            Self::Serialize(_) => None,
        }
    }
}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Summary of the store's contents.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    /// Number of fingerprint records.
    pub entry_count: usize,
    /// Number of cached `(provider, size)` results across all records.
    pub model_count: usize,
    /// Size of the serialized store in bytes.
    pub size_bytes: u64,
    /// Oldest result timestamp.
    pub oldest: Option<DateTime<Local>>,
    /// Newest result timestamp.
    pub newest: Option<DateTime<Local>>,
    /// Store-level version.
    pub version: String,
}

/// Persistent fingerprint-keyed verdict cache.
#[derive(Debug)]
pub struct AnalysisCache {
    path: PathBuf,
    file: CacheFile,
}

impl AnalysisCache {
    /// Open the cache at `path`.
    ///
    /// Never fails on bad content: a missing file gives an empty store, a
    /// corrupt or unreadable one gives an empty store and a warning. Records
    /// from other policy versions are dropped and the normalized store is
    /// written back once.
    #[must_use]
    pub fn open(path: &Path) -> Self {
        let mut cache = Self {
            path: path.to_path_buf(),
            file: CacheFile::default(),
        };

        if !path.exists() {
            log::debug!("No cache at {}, starting empty", path.display());
            return cache;
        }

        match read_cache_file(path) {
            Ok(file) => cache.file = file,
            Err(e) => {
                log::warn!("{e}; starting with an empty cache");
                return cache;
            }
        }

        if cache.normalize() {
            if let Err(e) = cache.persist() {
                log::warn!("Failed to save normalized cache: {e}");
            }
        }
        cache
    }

    /// Drop records written under another version. Returns whether the
    /// in-memory store changed.
    fn normalize(&mut self) -> bool {
        if self.file.version == CACHE_VERSION {
            return false;
        }
        log::info!(
            "Cache version mismatch: expected {}, found {}",
            CACHE_VERSION,
            self.file.version
        );
        let before = self.file.entries.len();
        self.file.entries.retain(|_, record| record.is_current());
        let removed = before - self.file.entries.len();
        if removed > 0 {
            log::info!("Invalidated {removed} outdated cache entries");
        }
        self.file.version = CACHE_VERSION.to_string();
        true
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.file.entries.len()
    }

    /// Whether the store has no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.file.entries.is_empty()
    }

    /// The cached verdict for `fingerprint` under `key`.
    ///
    /// `None` if there is no record, the record is from another version, or
    /// it holds nothing for this exact `(provider, size)`.
    #[must_use]
    pub fn get(&self, fingerprint: &Fingerprint, key: ModelKey) -> Option<&Verdict> {
        self.file
            .entries
            .get(&fingerprint.to_hex())
            .filter(|record| record.is_current())
            .and_then(|record| record.result(key))
            .map(|r| &r.result)
    }

    /// Store `verdict` for `fingerprint` under `key` and persist.
    ///
    /// Updates the record's last known path. A stale record is replaced.
    ///
    /// # Errors
    ///
    /// Returns a [`CacheError`] if the store cannot be written. The
    /// in-memory store keeps the update either way.
    pub fn set(
        &mut self,
        fingerprint: &Fingerprint,
        path: &Path,
        key: ModelKey,
        verdict: Verdict,
    ) -> CacheResult<()> {
        let record = self
            .file
            .entries
            .entry(fingerprint.to_hex())
            .or_insert_with(|| CacheRecord::new(None));
        if !record.is_current() {
            *record = CacheRecord::new(None);
        }
        record.path = Some(path.to_path_buf());
        record
            .models
            .insert(key.to_string(), ModelResult::now(verdict, key.size));
        self.persist()
    }

    /// Evict old results.
    ///
    /// Drops stale-version records, then results older than `max_age_days`,
    /// then records left without results. If more than `max_entries` records
    /// remain, the globally oldest results are evicted until the cap holds.
    /// Persists if anything changed.
    ///
    /// # Returns
    ///
    /// The number of records removed.
    ///
    /// # Errors
    ///
    /// Returns a [`CacheError`] if the store cannot be written.
    pub fn cleanup(&mut self, max_age_days: u64, max_entries: usize) -> CacheResult<usize> {
        self.cleanup_at(SystemTime::now(), max_age_days, max_entries)
    }

    /// [`cleanup`](Self::cleanup) against an explicit clock.
    ///
    /// # Errors
    ///
    /// Returns a [`CacheError`] if the store cannot be written.
    pub fn cleanup_at(
        &mut self,
        now: SystemTime,
        max_age_days: u64,
        max_entries: usize,
    ) -> CacheResult<usize> {
        let before = self.file.entries.len();
        let mut changed = false;

        let max_age = Duration::from_secs_f64(max_age_days as f64 * SECONDS_PER_DAY);
        let cutoff = now
            .checked_sub(max_age)
            .map_or(0.0, epoch_seconds);

        self.file.entries.retain(|_, record| {
            if !record.is_current() {
                return false;
            }
            let models = record.models.len();
            record.models.retain(|_, result| result.timestamp >= cutoff);
            changed |= record.models.len() != models;
            !record.models.is_empty()
        });

        if self.file.entries.len() > max_entries {
            let mut results: Vec<(f64, String, String)> = self
                .file
                .entries
                .iter()
                .flat_map(|(fp, record)| {
                    record
                        .models
                        .iter()
                        .map(move |(key, r)| (r.timestamp, fp.clone(), key.clone()))
                })
                .collect();
            results.sort_by(|a, b| a.0.total_cmp(&b.0));

            for (_, fp, key) in results {
                if self.file.entries.len() <= max_entries {
                    break;
                }
                if let Some(record) = self.file.entries.get_mut(&fp) {
                    record.models.remove(&key);
                    changed = true;
                    if record.models.is_empty() {
                        self.file.entries.remove(&fp);
                    }
                }
            }
        }

        let removed = before - self.file.entries.len();
        if removed > 0 || changed {
            log::info!("Cleaned up {removed} cache entries");
            self.persist()?;
        }
        Ok(removed)
    }

    /// Summarize the store.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let timestamps: Vec<f64> = self
            .file
            .entries
            .values()
            .flat_map(|r| r.models.values().map(|m| m.timestamp))
            .collect();
        let to_local = |secs: f64| {
            DateTime::from_timestamp_millis((secs * 1000.0) as i64).map(|dt| dt.with_timezone(&Local))
        };
        let oldest = timestamps.iter().copied().reduce(f64::min).and_then(to_local);
        let newest = timestamps.iter().copied().reduce(f64::max).and_then(to_local);

        CacheStats {
            entry_count: self.file.entries.len(),
            model_count: timestamps.len(),
            size_bytes: serde_json::to_vec(&self.file).map_or(0, |v| v.len() as u64),
            oldest,
            newest,
            version: self.file.version.clone(),
        }
    }

    /// Drop every record and persist.
    ///
    /// # Errors
    ///
    /// Returns a [`CacheError`] if the store cannot be written.
    pub fn clear(&mut self) -> CacheResult<usize> {
        let removed = self.file.entries.len();
        self.file = CacheFile::default();
        self.persist()?;
        Ok(removed)
    }

    /// Write the store: temp file beside the target, then rename.
    fn persist(&self) -> CacheResult<()> {
        let json = serde_json::to_string_pretty(&self.file)?;
        let write_err = |source| CacheError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_err)?;
        }

        let mut tmp_name = self.path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp = self.path.with_file_name(tmp_name);

        let mut file = fs::File::create(&tmp).map_err(write_err)?;
        file.write_all(json.as_bytes()).map_err(write_err)?;
        file.sync_all().map_err(write_err)?;
        drop(file);
        fs::rename(&tmp, &self.path).map_err(write_err)
    }
}

/// Read and parse a cache file without normalizing or writing it.
///
/// Accepts the versioned format and the legacy flat
/// `fingerprint -> result` map, whose entries come back as
/// [`LEGACY_VERSION`] records.
///
/// # Errors
///
/// [`CacheError::Read`] if the file cannot be read, [`CacheError::Corrupt`]
/// if it is not a cache.
pub fn read_cache_file(path: &Path) -> CacheResult<CacheFile> {
    let content = fs::read_to_string(path).map_err(|source| CacheError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let corrupt = |message: String| CacheError::Corrupt {
        path: path.to_path_buf(),
        message,
    };

    let value: Value = serde_json::from_str(&content).map_err(|e| corrupt(e.to_string()))?;
    let Value::Object(mut map) = value else {
        return Err(corrupt("top level is not an object".to_string()));
    };

    if let Some(version) = map.remove("version") {
        let Value::String(version) = version else {
            return Err(corrupt("version is not a string".to_string()));
        };
        let entries = match map.remove("entries") {
            None | Some(Value::Null) => Default::default(),
            Some(Value::Object(entries)) => entries,
            Some(_) => return Err(corrupt("entries is not an object".to_string())),
        };

        let mut file = CacheFile {
            version,
            entries: Default::default(),
        };
        let mut skipped = 0usize;
        for (key, value) in entries {
            match serde_json::from_value::<CacheRecord>(value) {
                Ok(record) => {
                    file.entries.insert(key, record);
                }
                Err(e) => {
                    log::warn!("Skipping unreadable cache record {key}: {e}");
                    skipped += 1;
                }
            }
        }
        if skipped > 0 {
            log::warn!(
                "Skipped {skipped} unreadable record(s) in {}",
                path.display()
            );
        }
        return Ok(file);
    }

    log::info!("Converting legacy cache format at {}", path.display());
    let mut file = CacheFile {
        version: LEGACY_VERSION.to_string(),
        entries: Default::default(),
    };
    for (key, value) in map {
        let record = match serde_json::from_value::<CacheRecord>(value) {
            Ok(record) if !record.models.is_empty() => record,
            _ => CacheRecord {
                path: None,
                version: LEGACY_VERSION.to_string(),
                models: Default::default(),
            },
        };
        file.entries.insert(key, record);
    }
    Ok(file)
}
