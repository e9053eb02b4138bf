//! Remote image classification.
//!
//! This module defines the boundary to the external vision providers:
//!
//! * [`Classifier`]: the capability every provider implements,
//!   `classify(image_base64, prompt) -> RawResponse`.
//! * [`Provider`]: the closed set of supported providers, selected by name.
//! * [`build_classifier`]: the factory, the only place that knows
//!   provider-specific defaults (model, concurrency, rate).
//! * [`Verdict`]: the structured result every response is parsed into.
//!
//! Errors crossing the boundary are normalized into [`ClassifyError`], which
//! the dispatch pipeline uses to decide between retrying, failing a single
//! task, and aborting the whole pass.

pub mod prompt;
pub mod providers;
pub mod verdict;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use prompt::PROMPT;
pub use providers::{
    build_classifier, ClaudeClient, GeminiClient, OpenAiClient, ProviderOverrides, ProviderSettings,
};
pub use verdict::{Decision, Verdict};

/// Supported classification providers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// OpenAI chat completions with image input.
    Openai,
    /// Anthropic messages API.
    Claude,
    /// Google Gemini generateContent.
    Gemini,
}

impl Provider {
    /// All providers, in a stable order.
    pub const ALL: [Provider; 3] = [Provider::Openai, Provider::Claude, Provider::Gemini];

    /// Lowercase name used in model keys and on the command line.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Openai => "openai",
            Self::Claude => "claude",
            Self::Gemini => "gemini",
        }
    }

    /// Environment variable holding this provider's credential.
    #[must_use]
    pub fn api_key_env(self) -> &'static str {
        match self {
            Self::Openai => "OPENAI_API_KEY",
            Self::Claude => "ANTHROPIC_API_KEY",
            Self::Gemini => "GOOGLE_API_KEY",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::Openai),
            "claude" => Ok(Self::Claude),
            "gemini" => Ok(Self::Gemini),
            other => Err(format!(
                "unsupported provider '{other}' (expected openai, claude or gemini)"
            )),
        }
    }
}

/// Token accounting reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt / input tokens.
    pub input_tokens: u64,
    /// Completion / output tokens.
    pub output_tokens: u64,
    /// Total billed tokens.
    pub total_tokens: u64,
}

impl Usage {
    /// Accumulate another usage record into this one.
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Unparsed provider answer.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    /// The model's text output, expected to hold a verdict JSON object.
    pub text: String,
    /// Usage accounting, when the provider reports it.
    pub usage: Option<Usage>,
}

/// Errors surfaced by classification.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClassifyError {
    /// Network failure, timeout, rate limiting or server error. Retried.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// The credential was rejected. Aborts the remaining dispatch for the provider.
    #[error("provider authentication failed: {0}")]
    ProviderAuth(String),

    /// The provider answered, but not with a usable verdict. Not retried.
    #[error("malformed provider response: {0}")]
    MalformedResponse(String),

    /// The source image could not be decoded or re-encoded for upload.
    #[error("failed to encode {path}: {message}")]
    LocalEncoding {
        /// Image that failed to encode
        path: PathBuf,
        /// Decoder / encoder message
        message: String,
    },

    /// The task was never submitted (run cancelled or pass aborted).
    #[error("classification cancelled")]
    Cancelled,
}

impl ClassifyError {
    /// Whether the dispatch pipeline should retry after this error.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Whether a sentinel verdict should be cached for this failure.
    ///
    /// Authentication failures and cancellations are not cached so a later
    /// run with a working key picks the image up again.
    #[must_use]
    pub fn is_cacheable(&self) -> bool {
        !matches!(self, Self::ProviderAuth(_) | Self::Cancelled)
    }
}

/// A remote image classifier.
///
/// Implementations own their credentials and response-shape normalization.
/// They must be cheap to share across tasks (`Arc<dyn Classifier>`).
#[async_trait]
pub trait Classifier: Send + Sync {
    /// The provider this client talks to.
    fn provider(&self) -> Provider;

    /// Model identifier sent to the provider.
    fn model(&self) -> &str;

    /// Classify one base64-encoded JPEG.
    ///
    /// # Errors
    ///
    /// Returns a [`ClassifyError`] describing whether the failure is
    /// transient, an authentication problem, or a malformed answer.
    async fn classify(&self, image_base64: &str, prompt: &str) -> Result<RawResponse, ClassifyError>;
}
