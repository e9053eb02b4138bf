//! imgtriage - photo collection triage
//!
//! Classifies the images of a directory tree as keep, unsure or delete with
//! a remote vision model, caches verdicts under a metadata fingerprint so
//! moved or renamed files are recognized, and turns the verdicts into a
//! reviewable two-phase relocation.

pub mod actions;
pub mod cache;
pub mod classify;
pub mod cli;
pub mod commands;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod logging;
pub mod progress;
pub mod scanner;
pub mod signal;

use anyhow::Context;

use crate::cli::{Cli, Commands};
use crate::config::Config;
use crate::error::ExitCode;

/// Run the command described by `cli`.
///
/// Initializes logging and color, loads the layered configuration and
/// dispatches to the subcommand handler.
///
/// # Errors
///
/// Configuration errors, unusable roots, missing credentials for every
/// requested provider and I/O failures of the cache or manifest.
pub fn run_app(cli: Cli) -> anyhow::Result<ExitCode> {
    logging::init_logging(cli.verbose, cli.quiet);
    if cli.no_color {
        yansi::disable();
    }

    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    if log::log_enabled!(log::Level::Trace) {
        if let Ok(dump) = toml::to_string_pretty(&config) {
            log::trace!("Effective configuration:\n{dump}");
        }
    }

    match cli.command {
        Commands::Scan(args) => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to start the async runtime")?;
            runtime.block_on(commands::scan(&config, args, cli.quiet))
        }
        Commands::Stage(args) => commands::stage(&config, &args),
        Commands::Finalize(args) => commands::finalize(&config, &args),
        Commands::Cache(args) => commands::cache(&config, args),
    }
}
