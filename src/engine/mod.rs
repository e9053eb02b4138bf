//! Scan and classification orchestration.
//!
//! # Overview
//!
//! [`ScanEngine::run`] drives one run over a root directory:
//!
//! 1. **Counting**: walk the tree and collect regular files
//! 2. **Scanning**: read metadata of every image, fingerprint it and fill the
//!    [`ScanSnapshot`] counters
//! 3. Per provider, strictly one after the other:
//!    - **CacheChecking**: look every fingerprint up under the pass's
//!      `(provider, size)` key
//!    - **Classifying**: send uncached images through a [`Dispatcher`] and
//!      persist every outcome before reporting it
//!
//! Progress goes out as [`ScanEvent`]s over an unbounded channel. The engine
//! is the only writer of the cache.
//!
//! # Example
//!
//! ```no_run
//! use imgtriage::cache::AnalysisCache;
//! use imgtriage::classify::{build_classifier, Provider, ProviderOverrides};
//! use imgtriage::dispatch::DispatchConfig;
//! use imgtriage::engine::{ProviderPass, ScanEngine};
//! use std::path::Path;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let cache = AnalysisCache::open(Path::new(".image_analysis_cache.json"));
//! let (classifier, settings) = build_classifier(Provider::Gemini, &ProviderOverrides::default())?;
//! let config = DispatchConfig {
//!     concurrency: settings.concurrency,
//!     requests_per_minute: settings.requests_per_minute,
//!     ..DispatchConfig::default()
//! };
//!
//! let mut engine = ScanEngine::new(cache);
//! let report = engine
//!     .run(Path::new("/photos"), vec![ProviderPass::new(classifier, config)])
//!     .await?;
//! println!("{} images", report.snapshot.images());
//! # Ok(())
//! # }
//! ```

pub mod events;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedSender};

pub use events::{ScanEvent, ScanSnapshot, Stage, UNKNOWN_YEAR};

use crate::cache::{AnalysisCache, ModelKey};
use crate::classify::{Classifier, ClassifyError, Provider, Usage};
use crate::dispatch::{
    DispatchConfig, DispatchError, DispatchOutcome, Dispatcher, ImageEncoder, TaskState,
};
use crate::scanner::{
    extension_of, fingerprint, is_image_path, FileEntry, Fingerprint, ImageMetadata, ScanError,
    Walker, WalkerConfig,
};

/// Files between two [`ScanEvent::Scan`] snapshots.
pub const SNAPSHOT_INTERVAL: usize = 24;

/// Images between two [`ScanEvent::CacheCheck`] events.
pub const CACHE_CHECK_INTERVAL: usize = 10;

/// Errors that stop a run.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The root is missing or not a directory.
    #[error(transparent)]
    Root(#[from] ScanError),

    /// A dispatch pass could not deliver its outcomes.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// A blocking scan task panicked or was cancelled.
    #[error("scan task failed: {0}")]
    Task(String),
}

/// One provider pass: a classifier and the limits to run it under.
pub struct ProviderPass {
    /// The provider client.
    pub classifier: Arc<dyn Classifier>,
    /// Concurrency, rate and retry settings.
    pub config: DispatchConfig,
}

impl ProviderPass {
    /// Create a pass.
    #[must_use]
    pub fn new(classifier: Arc<dyn Classifier>, config: DispatchConfig) -> Self {
        Self { classifier, config }
    }

    /// Cache key the pass reads and writes.
    #[must_use]
    pub fn model_key(&self) -> ModelKey {
        ModelKey::new(self.classifier.provider(), self.config.size)
    }
}

/// Results of one provider pass.
#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    /// Provider of the pass.
    pub provider: Provider,
    /// `<provider>_<size>` cache key.
    pub model_key: String,
    /// Images considered.
    pub images: usize,
    /// Images with a cached verdict before the pass.
    pub already_cached: usize,
    /// Images skipped because another path with the same fingerprint was
    /// sent in this pass.
    pub same_fingerprint: usize,
    /// Outcomes with a verdict.
    pub succeeded: usize,
    /// Failed images with the reason.
    pub failed: Vec<(PathBuf, String)>,
    /// Images never submitted.
    pub cancelled: usize,
    /// Authentication failure that stopped the pass, if any.
    pub aborted: Option<String>,
    /// Outcomes that could not be written to the cache.
    pub cache_errors: usize,
    /// Token usage across all attempts.
    pub usage: Usage,
}

impl PassReport {
    fn new(provider: Provider, key: ModelKey, images: usize) -> Self {
        Self {
            provider,
            model_key: key.to_string(),
            images,
            already_cached: 0,
            same_fingerprint: 0,
            succeeded: 0,
            failed: Vec::new(),
            cancelled: 0,
            aborted: None,
            cache_errors: 0,
            usage: Usage::default(),
        }
    }

    /// Whether every sent image got a verdict and nothing was aborted.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
            && self.cancelled == 0
            && self.aborted.is_none()
            && self.cache_errors == 0
    }

    fn record(&mut self, outcome: &DispatchOutcome) {
        match &outcome.state {
            TaskState::Succeeded(_) => self.succeeded += 1,
            TaskState::Failed(ClassifyError::Cancelled) => self.cancelled += 1,
            TaskState::Failed(err) => self.failed.push((outcome.path.clone(), err.to_string())),
        }
    }
}

/// Results of a whole run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Scanned root.
    pub root: PathBuf,
    /// Final scan counters.
    pub snapshot: ScanSnapshot,
    /// Entries that could not be read, with the reason.
    pub skipped: Vec<(PathBuf, String)>,
    /// Provider passes in the order they ran.
    pub passes: Vec<PassReport>,
    /// Whether a shutdown request cut the run short.
    pub interrupted: bool,
}

impl RunReport {
    /// Images sent to a provider across all passes.
    #[must_use]
    pub fn classified(&self) -> usize {
        self.passes
            .iter()
            .map(|p| p.succeeded + p.failed.len())
            .sum()
    }

    /// Whether anything was skipped, failed or aborted.
    #[must_use]
    pub fn has_problems(&self) -> bool {
        !self.skipped.is_empty() || self.passes.iter().any(|p| !p.is_clean())
    }
}

struct ScannedImage {
    path: PathBuf,
    fingerprint: Fingerprint,
}

struct ScanResult {
    snapshot: ScanSnapshot,
    images: Vec<ScannedImage>,
}

/// Run orchestrator. Owns the analysis cache for the duration of the run.
pub struct ScanEngine {
    cache: AnalysisCache,
    walker_config: WalkerConfig,
    events: Option<UnboundedSender<ScanEvent>>,
    encoder: Option<Arc<dyn ImageEncoder>>,
    shutdown_flag: Option<Arc<AtomicBool>>,
    stage: Stage,
}

impl ScanEngine {
    /// Create an engine over `cache`.
    #[must_use]
    pub fn new(cache: AnalysisCache) -> Self {
        Self {
            cache,
            walker_config: WalkerConfig::default(),
            events: None,
            encoder: None,
            shutdown_flag: None,
            stage: Stage::Idle,
        }
    }

    /// Set the walker configuration.
    #[must_use]
    pub fn with_walker_config(mut self, config: WalkerConfig) -> Self {
        self.walker_config = config;
        self
    }

    /// Send progress events to `tx`.
    #[must_use]
    pub fn with_events(mut self, tx: UnboundedSender<ScanEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Replace the image encoder used by every pass.
    #[must_use]
    pub fn with_encoder(mut self, encoder: Arc<dyn ImageEncoder>) -> Self {
        self.encoder = Some(encoder);
        self
    }

    /// Set the shutdown flag for graceful termination.
    #[must_use]
    pub fn with_shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown_flag = Some(flag);
        self
    }

    /// Current stage.
    #[must_use]
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// The cache.
    #[must_use]
    pub fn cache(&self) -> &AnalysisCache {
        &self.cache
    }

    /// Give the cache back.
    #[must_use]
    pub fn into_cache(self) -> AnalysisCache {
        self.cache
    }

    fn is_shutdown_requested(&self) -> bool {
        self.shutdown_flag
            .as_ref()
            .is_some_and(|f| f.load(Ordering::SeqCst))
    }

    fn emit(&self, event: ScanEvent) {
        if let Some(tx) = &self.events {
            // A dropped receiver only means nobody is watching.
            let _ = tx.send(event);
        }
    }

    fn set_stage(&mut self, stage: Stage, provider: Option<Provider>) {
        log::debug!("Stage: {} -> {}", self.stage, stage);
        self.stage = stage;
        self.emit(ScanEvent::Stage { stage, provider });
    }

    /// Scan `root`, then run each pass in order.
    ///
    /// A shutdown request stops the walk, and no further pass starts after
    /// the current one drains. Scanned paths are canonical when the root can
    /// be canonicalized.
    ///
    /// # Errors
    ///
    /// [`EngineError::Root`] if `root` is not a readable directory,
    /// [`EngineError::Dispatch`] or [`EngineError::Task`] on internal
    /// failures. Per-file and per-image problems end up in the report.
    pub async fn run(
        &mut self,
        root: &Path,
        passes: Vec<ProviderPass>,
    ) -> Result<RunReport, EngineError> {
        let root = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        let walker_config = self.run_walker_config();
        Walker::new(&root, walker_config.clone()).check_root()?;
        log::info!("Starting scan of {}", root.display());

        self.set_stage(Stage::Counting, None);
        let (entries, skipped) = {
            let root = root.clone();
            let flag = self.shutdown_flag.clone();
            tokio::task::spawn_blocking(move || count_files(&root, walker_config, flag))
                .await
                .map_err(|e| EngineError::Task(e.to_string()))?
        };
        log::info!(
            "Found {} files ({} unreadable entries)",
            entries.len(),
            skipped.len()
        );

        self.set_stage(Stage::Scanning, None);
        let scan = {
            let events = self.events.clone();
            let flag = self.shutdown_flag.clone();
            tokio::task::spawn_blocking(move || scan_files(entries, events.as_ref(), flag))
                .await
                .map_err(|e| EngineError::Task(e.to_string()))?
        };
        log::info!(
            "Scanned {} images, {} other files",
            scan.snapshot.images(),
            scan.snapshot.non_images
        );

        let mut report = RunReport {
            root,
            snapshot: scan.snapshot,
            skipped,
            passes: Vec::new(),
            interrupted: false,
        };

        for pass in passes {
            if self.is_shutdown_requested() {
                break;
            }
            let pass_report = self.run_pass(&scan.images, pass).await?;
            report.passes.push(pass_report);
        }

        report.interrupted = self.is_shutdown_requested();
        if report.interrupted {
            log::warn!("Run interrupted after {} pass(es)", report.passes.len());
        }
        self.set_stage(Stage::Done, None);
        Ok(report)
    }

    fn run_walker_config(&self) -> WalkerConfig {
        let mut config = self.walker_config.clone();
        config.exclude = config
            .exclude
            .iter()
            .map(|p| std::fs::canonicalize(p).unwrap_or_else(|_| p.clone()))
            .collect();
        config
    }

    async fn run_pass(
        &mut self,
        images: &[ScannedImage],
        pass: ProviderPass,
    ) -> Result<PassReport, EngineError> {
        let provider = pass.classifier.provider();
        let key = pass.model_key();
        let mut report = PassReport::new(provider, key, images.len());

        self.set_stage(Stage::CacheChecking, Some(provider));
        let mut uncached = Vec::new();
        let mut fingerprints: HashMap<PathBuf, Fingerprint> = HashMap::new();
        let mut queued: HashSet<Fingerprint> = HashSet::new();
        for (i, image) in images.iter().enumerate() {
            if self.cache.get(&image.fingerprint, key).is_some() {
                report.already_cached += 1;
            } else if queued.insert(image.fingerprint) {
                uncached.push(image.path.clone());
                fingerprints.insert(image.path.clone(), image.fingerprint);
            } else {
                log::debug!(
                    "{} shares a fingerprint with an image already queued",
                    image.path.display()
                );
                report.same_fingerprint += 1;
            }
            let checked = i + 1;
            if checked % CACHE_CHECK_INTERVAL == 0 && checked < images.len() {
                self.emit(ScanEvent::CacheCheck {
                    checked,
                    total: images.len(),
                    cached: report.already_cached,
                });
            }
        }
        self.emit(ScanEvent::CacheCheck {
            checked: images.len(),
            total: images.len(),
            cached: report.already_cached,
        });
        log::info!(
            "{}: {} cached, {} to classify",
            key,
            report.already_cached,
            uncached.len()
        );

        if uncached.is_empty() {
            return Ok(report);
        }

        self.set_stage(Stage::Classifying, Some(provider));
        let mut dispatcher = Dispatcher::new(pass.classifier, pass.config);
        if let Some(encoder) = &self.encoder {
            dispatcher = dispatcher.with_encoder(Arc::clone(encoder));
        }
        if let Some(flag) = &self.shutdown_flag {
            dispatcher = dispatcher.with_shutdown_flag(Arc::clone(flag));
        }

        let total = uncached.len();
        let (tx, mut rx) = mpsc::channel::<crate::dispatch::DispatchOutcome>(dispatcher.config().concurrency.max(1) * 2);
        let cache = &mut self.cache;
        let events = self.events.as_ref();
        let pass_report = &mut report;

        let consume = async move {
            let mut done = 0;
            while let Some(outcome) = rx.recv().await {
                if let Some(verdict) = outcome.cacheable_verdict() {
                    let fp = fingerprints
                        .get(&outcome.path)
                        .copied()
                        .unwrap_or_else(|| fingerprint(&outcome.path));
                    if let Err(e) = cache.set(&fp, &outcome.path, key, verdict) {
                        log::warn!(
                            "Failed to cache result for {}: {}",
                            outcome.path.display(),
                            e
                        );
                        pass_report.cache_errors += 1;
                    }
                }
                pass_report.record(&outcome);
                done += 1;
                if let Some(tx) = events {
                    let _ = tx.send(ScanEvent::Analysis {
                        path: outcome.path,
                        done,
                        total,
                        failed: pass_report.failed.len(),
                    });
                }
            }
        };

        let (summary, ()) = tokio::join!(dispatcher.run(uncached, tx), consume);
        let summary = summary?;

        report.usage = summary.usage;
        if let Some(reason) = summary.aborted {
            log::error!("{} pass aborted: {}", provider, reason);
            self.emit(ScanEvent::PassAborted {
                provider,
                reason: reason.clone(),
            });
            report.aborted = Some(reason);
        }
        Ok(report)
    }
}

fn count_files(
    root: &Path,
    config: WalkerConfig,
    flag: Option<Arc<AtomicBool>>,
) -> (Vec<FileEntry>, Vec<(PathBuf, String)>) {
    let mut walker = Walker::new(root, config);
    if let Some(flag) = flag {
        walker = walker.with_shutdown_flag(flag);
    }
    let mut files = Vec::new();
    let mut skipped = Vec::new();
    for result in walker.walk() {
        match result {
            Ok(entry) => files.push(entry),
            Err(e) => skipped.push((e.path().to_path_buf(), e.to_string())),
        }
    }
    (files, skipped)
}

fn scan_files(
    entries: Vec<FileEntry>,
    events: Option<&UnboundedSender<ScanEvent>>,
    flag: Option<Arc<AtomicBool>>,
) -> ScanResult {
    let mut snapshot = ScanSnapshot::new(entries.len());
    let mut images = Vec::new();
    let send = |snapshot: &ScanSnapshot| {
        if let Some(tx) = events {
            let _ = tx.send(ScanEvent::Scan(snapshot.clone()));
        }
    };

    for entry in entries {
        if flag.as_ref().is_some_and(|f| f.load(Ordering::SeqCst)) {
            log::debug!("Scan: Shutdown requested, stopping");
            break;
        }
        if is_image_path(&entry.path) {
            let meta = ImageMetadata::read(&entry.path);
            snapshot.record_image(
                &extension_of(&entry.path),
                &meta.device(),
                meta.capture_year(),
            );
            images.push(ScannedImage {
                fingerprint: Fingerprint::from_metadata(&meta),
                path: entry.path,
            });
        } else {
            snapshot.record_other();
        }

        if snapshot.scanned % SNAPSHOT_INTERVAL == 0 {
            send(&snapshot);
        }
    }

    // Final state, unless the last periodic snapshot already was it.
    if snapshot.scanned == 0 || snapshot.scanned % SNAPSHOT_INTERVAL != 0 {
        send(&snapshot);
    }
    ScanResult { snapshot, images }
}
