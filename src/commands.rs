//! Subcommand handlers.
//!
//! Each handler merges its flags over the loaded [`Config`], runs the
//! library operation, prints a summary (or JSON) and maps the outcome to an
//! [`ExitCode`].

use std::collections::BTreeMap;

use anyhow::{anyhow, Context};
use bytesize::ByteSize;
use yansi::Paint;

use crate::actions::{self, Bucket, FinalizeReport, Plan, StageOptions, StageReport};
use crate::cache::{AnalysisCache, CacheStats};
use crate::classify::{build_classifier, Provider};
use crate::cli::{CacheArgs, CacheCommand, FinalizeArgs, ScanArgs, StageArgs};
use crate::config::{Config, ConfigError};
use crate::dispatch::EncodeMode;
use crate::engine::{ProviderPass, RunReport, ScanEngine};
use crate::error::ExitCode;
use crate::progress;
use crate::scanner::WalkerConfig;
use crate::signal;

/// Failed items listed per pass in the text summary.
const MAX_LISTED_FAILURES: usize = 10;

/// `imgtriage scan`.
///
/// # Errors
///
/// Invalid settings, an unusable root, no provider with credentials, or a
/// signal handler that cannot be installed.
pub async fn scan(config: &Config, args: ScanArgs, quiet: bool) -> anyhow::Result<ExitCode> {
    let handler = signal::install_handler()?;

    let mut config = config.clone();
    if let Some(size) = args.size {
        config.analysis.size = size;
    }
    if args.square {
        config.analysis.encode_mode = EncodeMode::CenterSquare;
    }
    if let Some(timeout) = args.timeout {
        config.analysis.timeout_secs = timeout;
    }
    if let Some(path) = &args.cache {
        config.cache.path = path.clone();
    }
    if let Some(run_dir) = &args.run_dir {
        config.relocation.run_dir = run_dir.clone();
    }
    config.validate()?;

    let mut providers = if args.providers.is_empty() {
        config.analysis.providers.clone()
    } else {
        args.providers.clone()
    };
    let mut seen = Vec::new();
    providers.retain(|p| {
        let first = !seen.contains(p);
        seen.push(*p);
        first
    });

    let mut passes = Vec::new();
    let mut unavailable: Vec<(Provider, String)> = Vec::new();
    for provider in providers {
        let mut overrides = config.providers.get(provider).clone();
        if let Some(concurrency) = args.concurrency {
            overrides.concurrency = Some(usize::try_from(concurrency).unwrap_or(usize::MAX));
        }
        if let Some(rpm) = args.rpm {
            overrides.requests_per_minute = Some(rpm);
        }
        match build_classifier(provider, &overrides) {
            Ok((classifier, settings)) => {
                let dispatch =
                    config.dispatch_config(settings.concurrency, settings.requests_per_minute);
                passes.push(ProviderPass::new(classifier, dispatch));
            }
            Err(e @ ConfigError::MissingApiKey { .. }) => {
                log::error!("{e}");
                unavailable.push((provider, e.to_string()));
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to set up the {provider} client"))
            }
        }
    }
    if passes.is_empty() {
        let reasons: Vec<String> = unavailable.iter().map(|(_, r)| r.clone()).collect();
        return Err(anyhow!("no usable provider: {}", reasons.join("; ")));
    }

    let cache = AnalysisCache::open(&config.cache.path);
    let walker_config = WalkerConfig {
        follow_symlinks: args.follow_symlinks,
        skip_hidden: args.skip_hidden,
        exclude: vec![config.relocation.run_dir.clone()],
    };
    let hide_progress = quiet || args.no_progress || args.json;
    let (events, progress_task) = progress::spawn(hide_progress);

    let mut engine = ScanEngine::new(cache)
        .with_walker_config(walker_config)
        .with_events(events)
        .with_shutdown_flag(handler.get_flag());
    let result = engine.run(&args.root, passes).await;
    // The progress task ends once the engine's sender is gone.
    drop(engine);
    let _ = progress_task.await;
    let report = result.with_context(|| format!("scan of {} failed", args.root.display()))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if !quiet {
        print_run_summary(&report, &unavailable);
    }

    Ok(if report.interrupted {
        ExitCode::Interrupted
    } else if report.snapshot.images() == 0 {
        ExitCode::NothingToDo
    } else if report.has_problems() || !unavailable.is_empty() {
        ExitCode::PartialSuccess
    } else {
        ExitCode::Success
    })
}

fn print_run_summary(report: &RunReport, unavailable: &[(Provider, String)]) {
    let snapshot = &report.snapshot;
    println!(
        "{} {}: {} files, {} images, {} other",
        "Scanned".bold(),
        report.root.display(),
        snapshot.scanned,
        snapshot.images(),
        snapshot.non_images
    );
    if !snapshot.by_extension.is_empty() {
        println!("  by type: {}", join_counts(&snapshot.by_extension));
    }
    if !report.skipped.is_empty() {
        println!(
            "  {}",
            format!("{} unreadable entries skipped", report.skipped.len()).yellow()
        );
    }

    for pass in &report.passes {
        println!(
            "{} {}: {} cached, {} classified, {} failed, {} cancelled, {} tokens",
            "Pass".bold(),
            pass.model_key,
            pass.already_cached,
            pass.succeeded.green(),
            pass.failed.len().red(),
            pass.cancelled,
            pass.usage.total_tokens
        );
        if let Some(reason) = &pass.aborted {
            println!("  {} {}", "aborted:".red().bold(), reason);
        }
        for (path, reason) in pass.failed.iter().take(MAX_LISTED_FAILURES) {
            println!("  {} {}: {}", "failed".red(), path.display(), reason);
        }
        if pass.failed.len() > MAX_LISTED_FAILURES {
            println!("  ... and {} more", pass.failed.len() - MAX_LISTED_FAILURES);
        }
    }
    for (provider, reason) in unavailable {
        println!("{} {}: {}", "Skipped".yellow().bold(), provider, reason);
    }
    if report.interrupted {
        println!("{}", "Interrupted; results so far are cached.".yellow());
    }
}

/// `imgtriage stage`.
///
/// # Errors
///
/// Invalid thresholds, a missing or unreadable cache file, or a manifest
/// that cannot be read or written.
pub fn stage(config: &Config, args: &StageArgs) -> anyhow::Result<ExitCode> {
    let default_provider = config
        .analysis
        .providers
        .first()
        .copied()
        .unwrap_or(Provider::Gemini);
    let key = args.resolve_model_key(default_provider, config.analysis.size);

    let mut thresholds = config.relocation.thresholds;
    if let Some(t) = args.thresh_delete {
        thresholds.delete = t;
    }
    if let Some(t) = args.thresh_unsure {
        thresholds.unsure = t;
    }
    if let Some(t) = args.thresh_low_keep {
        thresholds.low_keep = t;
    }
    thresholds
        .validate()
        .map_err(|m| anyhow!("invalid thresholds: {m}"))?;

    let cache_path = args.cache.as_ref().unwrap_or(&config.cache.path);
    let plan = actions::plan(cache_path, key, &thresholds)
        .with_context(|| format!("failed to plan from {}", cache_path.display()))?;

    let options = StageOptions {
        run_dir: args
            .run_dir
            .clone()
            .unwrap_or_else(|| config.relocation.run_dir.clone()),
        on_collision: args.on_collision.unwrap_or(config.relocation.on_collision),
        limit: args.limit,
        execute: args.execute,
    };

    if plan.review_items().next().is_none() {
        if args.json {
            println!("{}", serde_json::json!({ "plan": plan, "report": null }));
        } else {
            println!("{}", plan.summary());
        }
        return Ok(ExitCode::NothingToDo);
    }

    let report = actions::stage(&plan, &options)
        .with_context(|| format!("failed to stage into {}", options.run_dir.display()))?;

    if args.json {
        let value = serde_json::json!({ "plan": plan, "report": report });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        print_stage_summary(&plan, &report);
    }

    Ok(if report.all_succeeded() {
        ExitCode::Success
    } else {
        ExitCode::PartialSuccess
    })
}

fn print_stage_summary(plan: &Plan, report: &StageReport) {
    println!("{} {}", "Plan".bold(), plan.summary());
    for copy in &report.copies {
        let marker = if copy.overwritten { "overwrite" } else { "copy" };
        log::info!(
            "{marker} [{}] {} -> {}",
            copy.bucket,
            copy.source.display(),
            copy.destination.display()
        );
    }
    for (path, reason) in &report.skipped {
        println!("  {} {}: {}", "skip".yellow(), path.display(), reason);
    }
    for (path, reason) in &report.failures {
        println!("  {} {}: {}", "failed".red(), path.display(), reason);
    }
    println!("{}", report.summary().bold());
    if !report.executed {
        println!("Re-run with --execute to copy the files.");
    }
}

/// `imgtriage finalize`.
///
/// # Errors
///
/// A manifest or bucket directory that cannot be read or written.
pub fn finalize(config: &Config, args: &FinalizeArgs) -> anyhow::Result<ExitCode> {
    let run_dir = args
        .run_dir
        .clone()
        .unwrap_or_else(|| config.relocation.run_dir.clone());
    let report = actions::finalize(&run_dir, args.execute)
        .with_context(|| format!("failed to finalize {}", run_dir.display()))?;
    let remaining = actions::remaining(&run_dir)?;

    if args.json {
        let value = serde_json::json!({ "report": report, "remaining": remaining });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        print_finalize_summary(&report, &remaining);
    }

    Ok(if report.moves.is_empty() && report.failures.is_empty() {
        ExitCode::NothingToDo
    } else if report.all_succeeded() {
        ExitCode::Success
    } else {
        ExitCode::PartialSuccess
    })
}

fn print_finalize_summary(report: &FinalizeReport, remaining: &BTreeMap<Bucket, usize>) {
    for item in &report.moves {
        log::info!(
            "{} -> {}",
            item.original.display(),
            item.destination.display()
        );
    }
    for (path, reason) in &report.failures {
        println!("  {} {}: {}", "failed".red(), path.display(), reason);
    }
    for (path, reason) in &report.leftover_copies {
        println!("  {} {}: {}", "copy left".yellow(), path.display(), reason);
    }
    println!("{}", report.summary().bold());
    if !remaining.is_empty() {
        println!("  still in review: {}", join_counts(remaining));
    }
    if !report.executed && !report.moves.is_empty() {
        println!("Re-run with --execute to move the originals.");
    }
}

/// `imgtriage cache`.
///
/// # Errors
///
/// A cache file that cannot be written.
pub fn cache(config: &Config, args: CacheArgs) -> anyhow::Result<ExitCode> {
    let path = args.cache.unwrap_or_else(|| config.cache.path.clone());
    let mut cache = AnalysisCache::open(&path);

    match args.command {
        CacheCommand::Stats => {
            let stats = cache.stats();
            print_cache_stats(&path.display().to_string(), &stats);
            Ok(if stats.entry_count == 0 {
                ExitCode::NothingToDo
            } else {
                ExitCode::Success
            })
        }
        CacheCommand::Cleanup {
            max_age_days,
            max_entries,
        } => {
            let max_age_days = max_age_days.unwrap_or(config.cache.max_age_days);
            let max_entries = max_entries.unwrap_or(config.cache.max_entries);
            let removed = cache
                .cleanup(max_age_days, max_entries)
                .context("failed to clean up the cache")?;
            println!(
                "Removed {} record(s); {} remain (max age {} days, max {} records)",
                removed,
                cache.len(),
                max_age_days,
                max_entries
            );
            Ok(if removed == 0 {
                ExitCode::NothingToDo
            } else {
                ExitCode::Success
            })
        }
        CacheCommand::Clear => {
            let removed = AnalysisCache::clear(&mut cache).context("failed to clear the cache")?;
            println!("Removed {removed} record(s) from {}", path.display());
            Ok(if removed == 0 {
                ExitCode::NothingToDo
            } else {
                ExitCode::Success
            })
        }
    }
}

fn print_cache_stats(path: &str, stats: &CacheStats) {
    let date = |d: &Option<chrono::DateTime<chrono::Local>>| {
        d.map_or_else(|| "-".to_string(), |d| d.format("%Y-%m-%d %H:%M").to_string())
    };
    println!("{} {}", "Cache".bold(), path);
    println!("  version:  {}", stats.version);
    println!("  records:  {}", stats.entry_count);
    println!("  results:  {}", stats.model_count);
    println!("  size:     {}", ByteSize::b(stats.size_bytes));
    println!("  oldest:   {}", date(&stats.oldest));
    println!("  newest:   {}", date(&stats.newest));
}

fn join_counts<K: std::fmt::Display>(counts: &BTreeMap<K, usize>) -> String {
    counts
        .iter()
        .map(|(k, n)| format!("{k}: {n}"))
        .collect::<Vec<_>>()
        .join(", ")
}
