//! Application configuration management.
//!
//! Settings are layered with `figment`, lowest priority first:
//!
//! 1. Built-in defaults ([`Config::default`])
//! 2. TOML file: `--config <path>`, else `imgtriage.toml` in the platform
//!    config directory (if it exists)
//! 3. Environment variables prefixed `IMGTRIAGE_`, with `__` separating
//!    nested keys (`IMGTRIAGE_ANALYSIS__SIZE=256`)
//! 4. Command-line flags, applied by the command handlers
//!
//! Provider API keys are never part of this file; they are read from the
//! environment (optionally populated from `.env`) by
//! [`build_classifier`](crate::classify::build_classifier).

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::actions::{CollisionPolicy, Thresholds};
use crate::classify::{Provider, ProviderOverrides};
use crate::dispatch::{DispatchConfig, EncodeMode};

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "IMGTRIAGE_";

/// Config file name inside the platform config directory.
pub const CONFIG_FILE_NAME: &str = "imgtriage.toml";

/// Default cache file, relative to the working directory.
pub const DEFAULT_CACHE_FILE: &str = ".image_analysis_cache.json";

/// Default run directory for staged copies.
pub const DEFAULT_RUN_DIR: &str = "image_cleanup_moves";

/// Configuration and setup errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A provider was selected but its credential is not set.
    #[error("no API key for {provider}: set the {var} environment variable")]
    MissingApiKey {
        /// Provider that needs the key
        provider: Provider,
        /// Environment variable that was checked
        var: &'static str,
    },

    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),

    /// The layered configuration could not be extracted.
    #[error("invalid configuration: {0}")]
    Invalid(#[from] Box<figment::Error>),

    /// A value is out of its allowed range.
    #[error("invalid value for {key}: {message}")]
    OutOfRange {
        /// Dotted key name
        key: &'static str,
        /// What is wrong with it
        message: String,
    },
}

/// Cache location and eviction limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache file path.
    pub path: PathBuf,
    /// `cache cleanup` default: drop model entries older than this.
    pub max_age_days: u64,
    /// `cache cleanup` default: cap on the number of records.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_CACHE_FILE),
            max_age_days: 30,
            max_entries: 10_000,
        }
    }
}

/// Classification pass settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Providers run in order, one pass each.
    pub providers: Vec<Provider>,
    /// Upload size in pixels (also part of the cache model key).
    pub size: u32,
    /// How images are resized before upload.
    pub encode_mode: EncodeMode,
    /// Per-call timeout in seconds.
    pub timeout_secs: u64,
    /// Attempts per image, including the first.
    pub max_attempts: u32,
    /// First retry delay in milliseconds; doubles per retry.
    pub backoff_base_ms: u64,
    /// Upper bound on a single retry delay in milliseconds.
    pub backoff_max_ms: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            providers: vec![Provider::Gemini],
            size: 512,
            encode_mode: EncodeMode::PreserveAspect,
            timeout_secs: 30,
            max_attempts: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 10_000,
        }
    }
}

/// Per-provider overrides, one table each.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    /// `[providers.openai]`
    pub openai: ProviderOverrides,
    /// `[providers.claude]`
    pub claude: ProviderOverrides,
    /// `[providers.gemini]`
    pub gemini: ProviderOverrides,
}

impl ProvidersConfig {
    /// Overrides for one provider.
    #[must_use]
    pub fn get(&self, provider: Provider) -> &ProviderOverrides {
        match provider {
            Provider::Openai => &self.openai,
            Provider::Claude => &self.claude,
            Provider::Gemini => &self.gemini,
        }
    }
}

/// Staging and finalization settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelocationConfig {
    /// Run directory holding bucket folders and the manifest.
    pub run_dir: PathBuf,
    /// Bucket thresholds.
    pub thresholds: Thresholds,
    /// What to do when a staging destination already exists.
    pub on_collision: CollisionPolicy,
}

impl Default for RelocationConfig {
    fn default() -> Self {
        Self {
            run_dir: PathBuf::from(DEFAULT_RUN_DIR),
            thresholds: Thresholds::default(),
            on_collision: CollisionPolicy::Skip,
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `[cache]`
    pub cache: CacheConfig,
    /// `[analysis]`
    pub analysis: AnalysisConfig,
    /// `[providers.*]`
    pub providers: ProvidersConfig,
    /// `[relocation]`
    pub relocation: RelocationConfig,
}

impl Config {
    /// Load the layered configuration.
    ///
    /// # Arguments
    ///
    /// * `explicit` - Config file given with `--config`. Unlike the default
    ///   location, an explicit file must exist.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a layer cannot be parsed, or an
    /// explicit file is missing.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));

        match explicit {
            Some(path) => {
                if !path.is_file() {
                    return Err(ConfigError::Invalid(Box::new(figment::Error::from(format!(
                        "config file not found: {}",
                        path.display()
                    )))));
                }
                figment = figment.merge(Toml::file(path));
            }
            None => {
                if let Some(path) = Self::default_path().filter(|p| p.is_file()) {
                    log::debug!("Loading config from {}", path.display());
                    figment = figment.merge(Toml::file(path));
                }
            }
        }

        let config: Config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// Platform-specific default config file path.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "imgtriage", "imgtriage")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Check ranges that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::OutOfRange`] for the first offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.analysis.size < 32 {
            return Err(ConfigError::OutOfRange {
                key: "analysis.size",
                message: format!("{} is below the minimum of 32", self.analysis.size),
            });
        }
        if self.analysis.max_attempts == 0 {
            return Err(ConfigError::OutOfRange {
                key: "analysis.max_attempts",
                message: "must be at least 1".to_string(),
            });
        }
        if self.analysis.timeout_secs == 0 {
            return Err(ConfigError::OutOfRange {
                key: "analysis.timeout_secs",
                message: "must be at least 1".to_string(),
            });
        }
        self.relocation
            .thresholds
            .validate()
            .map_err(|message| ConfigError::OutOfRange {
                key: "relocation.thresholds",
                message,
            })
    }

    /// Dispatch settings for a provider whose concurrency and rate are known.
    #[must_use]
    pub fn dispatch_config(&self, concurrency: usize, requests_per_minute: u32) -> DispatchConfig {
        DispatchConfig {
            concurrency,
            requests_per_minute,
            size: self.analysis.size,
            mode: self.analysis.encode_mode,
            timeout: Duration::from_secs(self.analysis.timeout_secs),
            max_attempts: self.analysis.max_attempts,
            base_backoff: Duration::from_millis(self.analysis.backoff_base_ms),
            max_backoff: Duration::from_millis(self.analysis.backoff_max_ms),
        }
    }
}
