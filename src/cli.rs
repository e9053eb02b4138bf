//! Command-line interface definitions for imgtriage.
//!
//! Global options (verbosity, config file, error format, color) apply to
//! every subcommand. Flags override the layered configuration.
//!
//! # Example
//!
//! ```bash
//! # Classify every image under ~/Pictures with Gemini at 512px
//! imgtriage scan ~/Pictures
//!
//! # Two providers, one after the other
//! imgtriage scan ~/Pictures --provider openai --provider claude
//!
//! # Preview, then perform, staging into review buckets
//! imgtriage stage --model-key gemini_512
//! imgtriage stage --model-key gemini_512 --execute
//!
//! # After reviewing the bucket folders
//! imgtriage finalize --execute
//! ```

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::actions::CollisionPolicy;
use crate::cache::ModelKey;
use crate::classify::Provider;

/// Triage photo collections with a remote vision classifier.
///
/// Images are fingerprinted by metadata, classified as keep, unsure or
/// delete, cached, and then staged into review folders.
#[derive(Debug, Parser)]
#[command(name = "imgtriage")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase verbosity level (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Configuration file (default: platform config dir, imgtriage.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Report errors as JSON on stderr
    #[arg(long, global = true)]
    pub json_errors: bool,

    /// Disable colored output
    #[arg(long, global = true, env = "NO_COLOR")]
    pub no_color: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Scan a directory and classify uncached images
    Scan(ScanArgs),
    /// Copy review candidates into bucket folders (phase 1)
    Stage(StageArgs),
    /// Move originals whose copies are still in review buckets (phase 2)
    Finalize(FinalizeArgs),
    /// Inspect or maintain the analysis cache
    Cache(CacheArgs),
}

/// Arguments for the scan subcommand.
#[derive(Debug, Args)]
pub struct ScanArgs {
    /// Directory to scan
    #[arg(value_name = "ROOT")]
    pub root: PathBuf,

    /// Provider to run (repeatable; passes run in the given order)
    #[arg(short, long = "provider", value_enum, value_name = "PROVIDER")]
    pub providers: Vec<Provider>,

    /// Upload size in pixels
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u32).range(32..))]
    pub size: Option<u32>,

    /// Center-crop to a square instead of preserving the aspect ratio
    #[arg(long)]
    pub square: bool,

    /// Maximum requests in flight (overrides the provider default)
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u64).range(1..))]
    pub concurrency: Option<u64>,

    /// Requests per minute (0 disables rate limiting)
    #[arg(long, value_name = "N")]
    pub rpm: Option<u32>,

    /// Per-request timeout in seconds
    #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
    pub timeout: Option<u64>,

    /// Analysis cache file
    #[arg(long, value_name = "PATH")]
    pub cache: Option<PathBuf>,

    /// Directory of staged copies to leave out of the scan
    #[arg(long, value_name = "DIR")]
    pub run_dir: Option<PathBuf>,

    /// Skip hidden files and directories (starting with .)
    #[arg(long)]
    pub skip_hidden: bool,

    /// Follow symbolic links during the scan
    #[arg(long)]
    pub follow_symlinks: bool,

    /// Do not show progress bars
    #[arg(long)]
    pub no_progress: bool,

    /// Print the run report as JSON on stdout
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the stage subcommand.
#[derive(Debug, Args)]
pub struct StageArgs {
    /// Cache key to plan from, e.g. gemini_512
    #[arg(long, value_name = "KEY", value_parser = parse_model_key, conflicts_with = "provider")]
    pub model_key: Option<ModelKey>,

    /// Provider whose results to plan from (with --size)
    #[arg(long, value_enum, value_name = "PROVIDER")]
    pub provider: Option<Provider>,

    /// Upload size of the results to plan from (with --provider)
    #[arg(long, value_name = "N", requires = "provider")]
    pub size: Option<u32>,

    /// Analysis cache file
    #[arg(long, value_name = "PATH")]
    pub cache: Option<PathBuf>,

    /// Run directory holding the bucket folders
    #[arg(long, value_name = "DIR")]
    pub run_dir: Option<PathBuf>,

    /// Minimum confidence_delete for to_delete
    #[arg(long, value_name = "F", value_parser = parse_threshold)]
    pub thresh_delete: Option<f64>,

    /// Minimum confidence_unsure for unsure
    #[arg(long, value_name = "F", value_parser = parse_threshold)]
    pub thresh_unsure: Option<f64>,

    /// Keep verdicts below this confidence_keep go to low_keep
    #[arg(long, value_name = "F", value_parser = parse_threshold)]
    pub thresh_low_keep: Option<f64>,

    /// What to do when a destination already exists
    #[arg(long, value_enum, value_name = "POLICY")]
    pub on_collision: Option<CollisionPolicy>,

    /// Stage at most N files
    #[arg(long, value_name = "N")]
    pub limit: Option<usize>,

    /// Perform the copies (default is a dry run)
    #[arg(long)]
    pub execute: bool,

    /// Print the plan and report as JSON on stdout
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the finalize subcommand.
#[derive(Debug, Args)]
pub struct FinalizeArgs {
    /// Run directory holding the bucket folders
    #[arg(long, value_name = "DIR")]
    pub run_dir: Option<PathBuf>,

    /// Perform the moves (default is a dry run)
    #[arg(long)]
    pub execute: bool,

    /// Print the report as JSON on stdout
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the cache subcommand.
#[derive(Debug, Args)]
pub struct CacheArgs {
    /// Analysis cache file
    #[arg(long, global = true, value_name = "PATH")]
    pub cache: Option<PathBuf>,

    /// Cache operation
    #[command(subcommand)]
    pub command: CacheCommand,
}

/// Cache operations.
#[derive(Debug, Subcommand)]
pub enum CacheCommand {
    /// Show entry counts, size and age range
    Stats,
    /// Evict stale, old and excess results
    Cleanup {
        /// Drop results older than this many days
        #[arg(long, value_name = "N")]
        max_age_days: Option<u64>,
        /// Keep at most this many records
        #[arg(long, value_name = "N")]
        max_entries: Option<usize>,
    },
    /// Remove every record
    Clear,
}

impl StageArgs {
    /// The model key named by `--model-key`, or by `--provider`/`--size`.
    ///
    /// Falls back to `default_provider` and `default_size` for whatever is
    /// not given.
    #[must_use]
    pub fn resolve_model_key(&self, default_provider: Provider, default_size: u32) -> ModelKey {
        self.model_key.unwrap_or_else(|| {
            ModelKey::new(
                self.provider.unwrap_or(default_provider),
                self.size.unwrap_or(default_size),
            )
        })
    }
}

/// Parse a `<provider>_<size>` cache key.
///
/// # Examples
///
/// ```
/// use imgtriage::cli::parse_model_key;
///
/// assert_eq!(parse_model_key("gemini_512").unwrap().size, 512);
/// assert!(parse_model_key("gemini").is_err());
/// ```
///
/// # Errors
///
/// Returns a message if the provider is unknown or the size is not a number.
pub fn parse_model_key(s: &str) -> Result<ModelKey, String> {
    s.parse()
}

/// Parse a threshold in `[0, 1]`.
///
/// # Errors
///
/// Returns a message if `s` is not a number in range.
pub fn parse_threshold(s: &str) -> Result<f64, String> {
    let value: f64 = s
        .trim()
        .parse()
        .map_err(|_| format!("'{s}' is not a number"))?;
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(format!("{value} is outside 0.0..=1.0"))
    }
}
