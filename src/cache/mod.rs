//! Analysis cache module.
//!
//! Stores classification verdicts keyed by image fingerprint, so that
//! renamed, copied or moved photos are recognized as already analyzed.
//!
//! # Architecture
//!
//! * [`store`]: JSON persistence, versioning, eviction and statistics.
//! * [`entry`]: The on-disk data model and the `(provider, size)` model key.
//!
//! # Cache Invalidation
//!
//! Every record carries the policy version it was written under. Records
//! whose version differs from [`CACHE_VERSION`] are misses, are dropped when
//! the store is opened, and are removed again by `cleanup`. A result is only
//! ever returned for the exact `(provider, size)` that produced it.

pub mod entry;
pub mod store;

pub use entry::{
    CacheFile, CacheRecord, ModelKey, ModelResult, CACHE_VERSION, LEGACY_VERSION,
};
pub use store::{read_cache_file, AnalysisCache, CacheError, CacheResult, CacheStats};
