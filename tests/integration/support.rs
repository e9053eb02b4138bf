//! Shared fakes for the integration tests.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use imgtriage::classify::{Classifier, ClassifyError, Provider, RawResponse, Usage};
use imgtriage::dispatch::{EncodeMode, ImageEncoder};

type Behavior = Box<dyn Fn(&str, usize) -> Result<RawResponse, ClassifyError> + Send + Sync>;

/// Recording classifier. The payload it sees is whatever the encoder
/// produced; with [`PathEncoder`] that is the image path.
pub struct FakeClassifier {
    provider: Provider,
    behavior: Behavior,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    starts: Mutex<Vec<Instant>>,
}

impl FakeClassifier {
    /// Answer every call with `behavior(payload, call_index)`.
    pub fn new(
        provider: Provider,
        behavior: impl Fn(&str, usize) -> Result<RawResponse, ClassifyError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            provider,
            behavior: Box::new(behavior),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            starts: Mutex::new(Vec::new()),
        }
    }

    /// Always answer with a confident delete.
    pub fn deleting(provider: Provider) -> Self {
        Self::new(provider, |_, _| Ok(response(&verdict_json("delete", 0.05, 0.05, 0.9, "meme"))))
    }

    /// Hold every call for `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> Vec<Instant> {
        let mut starts = self.starts.lock().unwrap().clone();
        starts.sort();
        starts
    }
}

#[async_trait]
impl Classifier for FakeClassifier {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn model(&self) -> &str {
        "fake-model"
    }

    async fn classify(&self, image_base64: &str, _prompt: &str) -> Result<RawResponse, ClassifyError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.starts.lock().unwrap().push(Instant::now());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        (self.behavior)(image_base64, call)
    }
}

/// Encoder that skips decoding: the payload is the path itself. Paths whose
/// file name contains `broken` fail like an undecodable image.
pub struct PathEncoder;

impl ImageEncoder for PathEncoder {
    fn encode(&self, path: &Path, _size: u32, _mode: EncodeMode) -> Result<String, ClassifyError> {
        let name = path.file_name().unwrap_or_default().to_string_lossy();
        if name.contains("broken") {
            return Err(ClassifyError::LocalEncoding {
                path: path.to_path_buf(),
                message: "unsupported image format".into(),
            });
        }
        Ok(path.to_string_lossy().into_owned())
    }
}

pub fn verdict_json(decision: &str, keep: f64, unsure: f64, delete: f64, category: &str) -> String {
    serde_json::json!({
        "decision": decision,
        "confidence_keep": keep,
        "confidence_unsure": unsure,
        "confidence_delete": delete,
        "primary_category": category,
        "reason": "test verdict",
    })
    .to_string()
}

pub fn response(text: &str) -> RawResponse {
    RawResponse {
        text: text.to_string(),
        usage: Some(Usage {
            input_tokens: 10,
            output_tokens: 5,
            total_tokens: 15,
        }),
    }
}
