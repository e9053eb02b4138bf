//! Bounded-concurrency classification pipeline.
//!
//! [`Dispatcher::run`] sends each distinct input path through
//! encode → classify → parse under three limits:
//!
//! - a counting semaphore caps tasks in flight (`concurrency`),
//! - a FIFO [`RateGate`] spaces every call attempt `60s / rpm` apart,
//! - transient failures are retried with doubling backoff up to
//!   `max_attempts` attempts in total.
//!
//! # Completion guarantee
//!
//! Every distinct path yields exactly one [`DispatchOutcome`] on the channel.
//! Duplicate paths are collapsed before submission. Paths never submitted
//! because of a shutdown request or an authentication failure yield
//! [`ClassifyError::Cancelled`]. In-flight tasks always finish and report.

pub mod encode;
pub mod rate;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

pub use encode::{target_dimensions, EncodeMode, ImageEncoder, JpegEncoder};
pub use rate::RateGate;

use crate::classify::{Classifier, ClassifyError, Provider, Usage, Verdict, PROMPT};

/// Limits and policy for one dispatch pass.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    /// Maximum tasks in flight.
    pub concurrency: usize,
    /// Requests-per-minute ceiling (`0` = unlimited).
    pub requests_per_minute: u32,
    /// Upload size.
    pub size: u32,
    /// Resize mode.
    pub mode: EncodeMode,
    /// Per-call timeout; expiry is a transient error.
    pub timeout: Duration,
    /// Attempts per path including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_backoff: Duration,
    /// Cap on any single retry delay.
    pub max_backoff: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            requests_per_minute: 60,
            size: 512,
            mode: EncodeMode::default(),
            timeout: Duration::from_secs(30),
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl DispatchConfig {
    /// Delay before retry number `retry` (1-based).
    #[must_use]
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Terminal state of one path.
#[derive(Debug, Clone)]
pub enum TaskState {
    /// A verdict was parsed.
    Succeeded(Verdict),
    /// The path failed or was never submitted.
    Failed(ClassifyError),
}

/// The single terminal record produced for each path.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// Input path.
    pub path: PathBuf,
    /// Success or failure.
    pub state: TaskState,
    /// Wall time from task start to outcome.
    pub elapsed: Duration,
    /// Retries performed (attempts minus one).
    pub retries: u32,
    /// Usage summed over all attempts, when reported.
    pub usage: Option<Usage>,
}

impl DispatchOutcome {
    fn cancelled(path: PathBuf) -> Self {
        Self {
            path,
            state: TaskState::Failed(ClassifyError::Cancelled),
            elapsed: Duration::ZERO,
            retries: 0,
            usage: None,
        }
    }

    /// Whether a verdict was obtained.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.state, TaskState::Succeeded(_))
    }

    /// The verdict to persist for this outcome.
    ///
    /// Successes store their verdict; cacheable failures store the sentinel
    /// verdict; authentication failures and cancellations store nothing.
    #[must_use]
    pub fn cacheable_verdict(&self) -> Option<Verdict> {
        match &self.state {
            TaskState::Succeeded(verdict) => Some(verdict.clone()),
            TaskState::Failed(err) if err.is_cacheable() => Some(Verdict::sentinel(&err.to_string())),
            TaskState::Failed(_) => None,
        }
    }
}

/// Aggregate counts for a pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DispatchSummary {
    /// Distinct paths received.
    pub total: usize,
    /// Paths that started a task.
    pub submitted: usize,
    /// Outcomes with a verdict.
    pub succeeded: usize,
    /// Outcomes with an error other than cancellation.
    pub failed: usize,
    /// Paths never submitted.
    pub cancelled: usize,
    /// Retries across all tasks.
    pub retries: u64,
    /// Authentication failure that stopped submission, if any.
    pub aborted: Option<String>,
    /// Token usage across all attempts.
    pub usage: Usage,
}

impl DispatchSummary {
    fn record(&mut self, outcome: &DispatchOutcome) {
        match &outcome.state {
            TaskState::Succeeded(_) => self.succeeded += 1,
            TaskState::Failed(ClassifyError::Cancelled) => self.cancelled += 1,
            TaskState::Failed(_) => self.failed += 1,
        }
        self.retries += u64::from(outcome.retries);
        if let Some(usage) = &outcome.usage {
            self.usage.add(usage);
        }
    }
}

/// Errors that end a pass early.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The outcome consumer went away; remaining outcomes were dropped.
    #[error("outcome receiver closed before the pass finished")]
    ReceiverClosed,
}

struct TaskContext {
    classifier: Arc<dyn Classifier>,
    encoder: Arc<dyn ImageEncoder>,
    gate: RateGate,
    config: DispatchConfig,
    prompt: Arc<str>,
    abort: AtomicBool,
    abort_reason: OnceLock<String>,
    receiver_closed: AtomicBool,
    summary: Mutex<DispatchSummary>,
}

impl TaskContext {
    fn stop_requested(&self, shutdown: Option<&AtomicBool>) -> bool {
        self.abort.load(Ordering::SeqCst)
            || self.receiver_closed.load(Ordering::SeqCst)
            || shutdown.is_some_and(|f| f.load(Ordering::SeqCst))
    }

    async fn report(&self, tx: &mpsc::Sender<DispatchOutcome>, outcome: DispatchOutcome) {
        self.summary
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(&outcome);
        if tx.send(outcome).await.is_err() {
            self.receiver_closed.store(true, Ordering::SeqCst);
        }
    }

    async fn classify_path(&self, path: PathBuf) -> DispatchOutcome {
        let start = Instant::now();
        let mut outcome = DispatchOutcome {
            path,
            state: TaskState::Failed(ClassifyError::Cancelled),
            elapsed: Duration::ZERO,
            retries: 0,
            usage: None,
        };

        let payload = {
            let encoder = Arc::clone(&self.encoder);
            let path = outcome.path.clone();
            let (size, mode) = (self.config.size, self.config.mode);
            tokio::task::spawn_blocking(move || encoder.encode(&path, size, mode))
                .await
                .unwrap_or_else(|e| {
                    Err(ClassifyError::LocalEncoding {
                        path: outcome.path.clone(),
                        message: format!("encoder task failed: {e}"),
                    })
                })
        };

        let state = match payload {
            Ok(payload) => self.call_with_retry(&payload, &mut outcome).await,
            Err(e) => TaskState::Failed(e),
        };
        outcome.state = state;
        outcome.elapsed = start.elapsed();
        outcome
    }

    async fn call_with_retry(&self, payload: &str, outcome: &mut DispatchOutcome) -> TaskState {
        let provider = self.classifier.provider();
        loop {
            self.gate.wait().await;

            let result = match tokio::time::timeout(
                self.config.timeout,
                self.classifier.classify(payload, &self.prompt),
            )
            .await
            {
                Ok(Ok(raw)) => {
                    if let Some(usage) = &raw.usage {
                        outcome.usage.get_or_insert_with(Usage::default).add(usage);
                    }
                    Verdict::from_response(&raw.text)
                }
                Ok(Err(e)) => Err(e),
                Err(_) => Err(ClassifyError::Transient(format!(
                    "request timed out after {}s",
                    self.config.timeout.as_secs_f32()
                ))),
            };

            match result {
                Ok(verdict) => return TaskState::Succeeded(verdict),
                Err(e) if e.is_transient() && outcome.retries + 1 < self.config.max_attempts => {
                    outcome.retries += 1;
                    let delay = self.config.backoff_for(outcome.retries);
                    log::debug!(
                        "{} retry {}/{} for {} in {:?}: {}",
                        provider,
                        outcome.retries,
                        self.config.max_attempts - 1,
                        outcome.path.display(),
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if let ClassifyError::ProviderAuth(message) = &e {
                        if self.abort_reason.set(message.clone()).is_ok() {
                            log::error!("{provider} rejected the credential, stopping submission: {message}");
                        }
                        self.abort.store(true, Ordering::SeqCst);
                    } else {
                        log::warn!("{} failed for {}: {}", provider, outcome.path.display(), e);
                    }
                    return TaskState::Failed(e);
                }
            }
        }
    }
}

/// Runs one classification pass for one provider.
pub struct Dispatcher {
    classifier: Arc<dyn Classifier>,
    encoder: Arc<dyn ImageEncoder>,
    config: DispatchConfig,
    prompt: Arc<str>,
    shutdown_flag: Option<Arc<AtomicBool>>,
}

impl Dispatcher {
    /// Create a dispatcher using the JPEG encoder and the default prompt.
    #[must_use]
    pub fn new(classifier: Arc<dyn Classifier>, config: DispatchConfig) -> Self {
        Self {
            classifier,
            encoder: Arc::new(JpegEncoder),
            config,
            prompt: Arc::from(PROMPT),
            shutdown_flag: None,
        }
    }

    /// Replace the image encoder.
    #[must_use]
    pub fn with_encoder(mut self, encoder: Arc<dyn ImageEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    /// Replace the prompt.
    #[must_use]
    pub fn with_prompt(mut self, prompt: &str) -> Self {
        self.prompt = Arc::from(prompt);
        self
    }

    /// Set the shutdown flag for graceful termination.
    #[must_use]
    pub fn with_shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown_flag = Some(flag);
        self
    }

    /// Provider of the wrapped classifier.
    #[must_use]
    pub fn provider(&self) -> Provider {
        self.classifier.provider()
    }

    /// Pass configuration.
    #[must_use]
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Classify `paths`, sending one outcome per distinct path to `tx`.
    ///
    /// Outcomes arrive unordered as tasks finish. The returned summary is
    /// complete once this future resolves.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::ReceiverClosed`] if `tx`'s receiver was
    /// dropped. Submission stops as soon as that is noticed.
    pub async fn run(
        &self,
        paths: Vec<PathBuf>,
        tx: mpsc::Sender<DispatchOutcome>,
    ) -> Result<DispatchSummary, DispatchError> {
        let mut seen = HashSet::new();
        let paths: Vec<PathBuf> = paths.into_iter().filter(|p| seen.insert(p.clone())).collect();

        let ctx = Arc::new(TaskContext {
            classifier: Arc::clone(&self.classifier),
            encoder: Arc::clone(&self.encoder),
            gate: RateGate::per_minute(self.config.requests_per_minute),
            config: self.config.clone(),
            prompt: Arc::clone(&self.prompt),
            abort: AtomicBool::new(false),
            abort_reason: OnceLock::new(),
            receiver_closed: AtomicBool::new(false),
            summary: Mutex::new(DispatchSummary {
                total: paths.len(),
                ..Default::default()
            }),
        });
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let shutdown = self.shutdown_flag.as_deref();

        log::info!(
            "Dispatching {} images to {} ({}, concurrency {}, {} rpm)",
            paths.len(),
            self.classifier.provider(),
            self.classifier.model(),
            self.config.concurrency.max(1),
            self.config.requests_per_minute
        );

        let mut handles: Vec<(PathBuf, JoinHandle<()>)> = Vec::with_capacity(paths.len());
        let mut pending = paths.into_iter();

        for path in pending.by_ref() {
            if ctx.stop_requested(shutdown) {
                ctx.report(&tx, DispatchOutcome::cancelled(path)).await;
                break;
            }
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                ctx.report(&tx, DispatchOutcome::cancelled(path)).await;
                break;
            };
            // Limits may have tripped while waiting for capacity.
            if ctx.stop_requested(shutdown) {
                drop(permit);
                ctx.report(&tx, DispatchOutcome::cancelled(path)).await;
                break;
            }

            ctx.summary
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .submitted += 1;

            let task_ctx = Arc::clone(&ctx);
            let task_tx = tx.clone();
            let task_path = path.clone();
            let handle = tokio::spawn(async move {
                let outcome = task_ctx.classify_path(task_path).await;
                task_ctx.report(&task_tx, outcome).await;
                drop(permit);
            });
            handles.push((path, handle));
        }

        for path in pending {
            ctx.report(&tx, DispatchOutcome::cancelled(path)).await;
        }

        for (path, handle) in handles {
            if let Err(e) = handle.await {
                log::error!("Classification task for {} failed: {}", path.display(), e);
                let outcome = DispatchOutcome {
                    path,
                    state: TaskState::Failed(ClassifyError::MalformedResponse(format!(
                        "classification task failed: {e}"
                    ))),
                    elapsed: Duration::ZERO,
                    retries: 0,
                    usage: None,
                };
                ctx.report(&tx, outcome).await;
            }
        }

        let mut summary = ctx
            .summary
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        summary.aborted = ctx.abort_reason.get().cloned();

        if ctx.receiver_closed.load(Ordering::SeqCst) {
            return Err(DispatchError::ReceiverClosed);
        }
        log::info!(
            "{} pass finished: {} succeeded, {} failed, {} cancelled, {} retries",
            self.classifier.provider(),
            summary.succeeded,
            summary.failed,
            summary.cancelled,
            summary.retries
        );
        Ok(summary)
    }
}
