//! Subcommands driven through `run_app`, as the binary would.

use clap::Parser;
use imgtriage::cache::{AnalysisCache, ModelKey};
use imgtriage::classify::{Decision, Provider, Verdict};
use imgtriage::cli::Cli;
use imgtriage::error::ExitCode;
use imgtriage::run_app;
use imgtriage::scanner::Fingerprint;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("imgtriage.toml"), "").unwrap();
        Self { dir }
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    fn run(&self, args: &[&str]) -> ExitCode {
        let config = self.path("imgtriage.toml");
        let mut argv = vec![
            "imgtriage".to_string(),
            "--quiet".to_string(),
            "--config".to_string(),
            config.display().to_string(),
        ];
        argv.extend(args.iter().map(|a| a.to_string()));
        run_app(Cli::try_parse_from(argv).unwrap()).unwrap()
    }

    fn cache_delete_verdict(&self, photo: &Path) {
        let mut cache = AnalysisCache::open(&self.path("cache.json"));
        let verdict = Verdict {
            decision: Decision::Delete,
            confidence_keep: 0.0,
            confidence_unsure: 0.1,
            confidence_delete: 0.9,
            primary_category: "screenshot".into(),
            reason: "blurry screenshot".into(),
        };
        cache
            .set(
                &Fingerprint::from_fields(&photo.display().to_string()),
                photo,
                ModelKey::new(Provider::Claude, 512),
                verdict,
            )
            .unwrap();
    }
}

#[test]
fn test_stage_then_finalize_round() {
    let ws = Workspace::new();
    let photo = ws.path("photos/shot.png");
    fs::create_dir_all(photo.parent().unwrap()).unwrap();
    fs::write(&photo, b"png-ish").unwrap();
    ws.cache_delete_verdict(&photo);

    let cache = ws.path("cache.json").display().to_string();
    let run_dir = ws.path("moves").display().to_string();
    let stage_args = [
        "stage", "--model-key", "claude_512", "--cache", &cache, "--run-dir", &run_dir,
    ];

    assert_eq!(ws.run(&stage_args), ExitCode::Success);
    assert!(!ws.path("moves").exists());

    let mut execute = stage_args.to_vec();
    execute.push("--execute");
    assert_eq!(ws.run(&execute), ExitCode::Success);
    assert!(ws.path("moves/to_delete/shot.png").is_file());

    assert_eq!(
        ws.run(&["finalize", "--run-dir", &run_dir, "--execute"]),
        ExitCode::Success
    );
    assert!(!photo.exists());
    assert!(ws.path("moves/final_deletion/shot.png").is_file());

    assert_eq!(
        ws.run(&["finalize", "--run-dir", &run_dir]),
        ExitCode::NothingToDo
    );
}

#[test]
fn test_stage_with_other_key_has_nothing_to_do() {
    let ws = Workspace::new();
    let photo = ws.path("a.jpg");
    fs::write(&photo, b"jpeg-ish").unwrap();
    ws.cache_delete_verdict(&photo);

    let cache = ws.path("cache.json").display().to_string();
    let code = ws.run(&[
        "stage", "--provider", "openai", "--size", "512", "--cache", &cache,
    ]);
    assert_eq!(code, ExitCode::NothingToDo);
}

#[test]
fn test_stage_without_cache_is_an_error() {
    let ws = Workspace::new();
    let cache = ws.path("missing.json").display().to_string();
    let cli = Cli::try_parse_from([
        "imgtriage",
        "--quiet",
        "--config",
        &ws.path("imgtriage.toml").display().to_string(),
        "stage",
        "--cache",
        &cache,
    ])
    .unwrap();
    let err = run_app(cli).unwrap_err();
    assert!(format!("{err:#}").contains("cache not found"));
}

#[test]
fn test_cache_subcommands() {
    let ws = Workspace::new();
    let photo = ws.path("a.jpg");
    fs::write(&photo, b"jpeg-ish").unwrap();
    ws.cache_delete_verdict(&photo);
    let cache = ws.path("cache.json").display().to_string();

    assert_eq!(ws.run(&["cache", "--cache", &cache, "stats"]), ExitCode::Success);
    assert_eq!(
        ws.run(&["cache", "--cache", &cache, "cleanup", "--max-age-days", "30"]),
        ExitCode::NothingToDo
    );
    assert_eq!(ws.run(&["cache", "--cache", &cache, "clear"]), ExitCode::Success);
    assert_eq!(ws.run(&["cache", "--cache", &cache, "stats"]), ExitCode::NothingToDo);
}
