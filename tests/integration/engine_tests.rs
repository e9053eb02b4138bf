//! End-to-end runs of the scan engine with fake providers.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use imgtriage::cache::{read_cache_file, AnalysisCache, ModelKey};
use imgtriage::classify::{ClassifyError, Provider};
use imgtriage::dispatch::{DispatchConfig, EncodeMode};
use imgtriage::engine::{ProviderPass, ScanEngine, ScanEvent, Stage};
use imgtriage::scanner::{fingerprint, WalkerConfig};
use tempfile::TempDir;
use tokio::sync::mpsc;

use super::support::{FakeClassifier, PathEncoder};

fn dispatch_config(size: u32) -> DispatchConfig {
    DispatchConfig {
        concurrency: 4,
        requests_per_minute: 0,
        size,
        mode: EncodeMode::PreserveAspect,
        timeout: Duration::from_secs(5),
        max_attempts: 1,
        ..DispatchConfig::default()
    }
}

/// Fake images get distinct sizes so their fingerprints differ.
fn write_photos(root: &Path, names: &[&str]) -> Vec<PathBuf> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let path = root.join(name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(&path, "x".repeat(100 + i)).unwrap();
            path
        })
        .collect()
}

fn engine(cache_path: &Path) -> ScanEngine {
    ScanEngine::new(AnalysisCache::open(cache_path)).with_encoder(Arc::new(PathEncoder))
}

fn pass(classifier: Arc<FakeClassifier>, size: u32) -> ProviderPass {
    ProviderPass::new(classifier, dispatch_config(size))
}

#[tokio::test]
async fn test_first_run_classifies_and_rerun_hits_cache() {
    let root = TempDir::new().unwrap();
    let state = TempDir::new().unwrap();
    let cache_path = state.path().join("cache.json");
    write_photos(root.path(), &["a.jpg", "b.png", "trip/c.jpeg"]);
    fs::write(root.path().join("notes.txt"), b"not a photo").unwrap();

    let classifier = Arc::new(FakeClassifier::deleting(Provider::Openai));
    let mut first = engine(&cache_path);
    let report = first
        .run(root.path(), vec![pass(classifier.clone(), 512)])
        .await
        .unwrap();

    assert_eq!(report.snapshot.images(), 3);
    assert_eq!(report.snapshot.non_images, 1);
    assert_eq!(report.passes.len(), 1);
    assert_eq!(report.passes[0].succeeded, 3);
    assert_eq!(report.passes[0].model_key, "openai_512");
    assert!(!report.has_problems());
    assert_eq!(classifier.calls(), 3);
    assert_eq!(first.cache().len(), 3);

    let stored = read_cache_file(&cache_path).unwrap();
    assert_eq!(stored.entries.len(), 3);
    assert!(stored
        .entries
        .values()
        .all(|r| r.models.contains_key("openai_512") && r.path.is_some()));

    let rerun_classifier = Arc::new(FakeClassifier::deleting(Provider::Openai));
    let mut second = engine(&cache_path);
    let report = second
        .run(root.path(), vec![pass(rerun_classifier.clone(), 512)])
        .await
        .unwrap();

    assert_eq!(report.passes[0].already_cached, 3);
    assert_eq!(report.passes[0].succeeded, 0);
    assert_eq!(rerun_classifier.calls(), 0);
}

#[tokio::test]
async fn test_renamed_file_keeps_its_verdict() {
    let root = TempDir::new().unwrap();
    let state = TempDir::new().unwrap();
    let cache_path = state.path().join("cache.json");
    let photos = write_photos(root.path(), &["IMG_0001.jpg"]);

    let classifier = Arc::new(FakeClassifier::deleting(Provider::Gemini));
    engine(&cache_path)
        .run(root.path(), vec![pass(classifier.clone(), 512)])
        .await
        .unwrap();

    let moved = root.path().join("sorted").join("beach.jpg");
    fs::create_dir_all(moved.parent().unwrap()).unwrap();
    fs::rename(&photos[0], &moved).unwrap();

    let report = engine(&cache_path)
        .run(root.path(), vec![pass(classifier.clone(), 512)])
        .await
        .unwrap();

    assert_eq!(report.passes[0].already_cached, 1);
    assert_eq!(classifier.calls(), 1);
}

#[tokio::test]
async fn test_other_size_is_a_separate_slot() {
    let root = TempDir::new().unwrap();
    let state = TempDir::new().unwrap();
    let cache_path = state.path().join("cache.json");
    let photos = write_photos(root.path(), &["a.jpg", "b.jpg"]);

    let classifier = Arc::new(FakeClassifier::deleting(Provider::Openai));
    engine(&cache_path)
        .run(root.path(), vec![pass(classifier.clone(), 512)])
        .await
        .unwrap();

    let mut rerun = engine(&cache_path);
    let report = rerun
        .run(root.path(), vec![pass(classifier.clone(), 256)])
        .await
        .unwrap();

    assert_eq!(report.passes[0].already_cached, 0);
    assert_eq!(report.passes[0].succeeded, 2);
    assert_eq!(classifier.calls(), 4);

    let fp = fingerprint(&photos[0]);
    let cache = rerun.into_cache();
    assert!(cache.get(&fp, ModelKey::new(Provider::Openai, 512)).is_some());
    assert!(cache.get(&fp, ModelKey::new(Provider::Openai, 256)).is_some());
    assert!(cache.get(&fp, ModelKey::new(Provider::Claude, 512)).is_none());
}

#[tokio::test]
async fn test_run_dir_is_not_scanned() {
    let root = TempDir::new().unwrap();
    let state = TempDir::new().unwrap();
    let cache_path = state.path().join("cache.json");
    write_photos(
        root.path(),
        &["a.jpg", "image_cleanup_moves/delete/a.jpg"],
    );

    let classifier = Arc::new(FakeClassifier::deleting(Provider::Openai));
    let mut engine = engine(&cache_path).with_walker_config(WalkerConfig {
        exclude: vec![root.path().join("image_cleanup_moves")],
        ..WalkerConfig::default()
    });
    let report = engine
        .run(root.path(), vec![pass(classifier.clone(), 512)])
        .await
        .unwrap();

    assert_eq!(report.snapshot.images(), 1);
    assert_eq!(classifier.calls(), 1);
}

#[tokio::test]
async fn test_auth_failure_aborts_only_that_provider() {
    let root = TempDir::new().unwrap();
    let state = TempDir::new().unwrap();
    let cache_path = state.path().join("cache.json");
    write_photos(root.path(), &["a.jpg", "b.jpg", "c.jpg"]);

    let rejected = Arc::new(FakeClassifier::new(Provider::Claude, |_, _| {
        Err(ClassifyError::ProviderAuth("401 invalid key".into()))
    }));
    let working = Arc::new(FakeClassifier::deleting(Provider::Gemini));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut engine = engine(&cache_path).with_events(tx);
    let claude_pass = ProviderPass::new(
        rejected.clone(),
        DispatchConfig {
            concurrency: 1,
            ..dispatch_config(512)
        },
    );
    let report = engine
        .run(root.path(), vec![claude_pass, pass(working.clone(), 512)])
        .await
        .unwrap();

    let claude = &report.passes[0];
    assert!(claude.aborted.is_some());
    assert_eq!(claude.failed.len(), 1);
    assert_eq!(claude.cancelled, 2);
    assert_eq!(rejected.calls(), 1);

    let gemini = &report.passes[1];
    assert_eq!(gemini.succeeded, 3);
    assert!(gemini.is_clean());
    assert!(report.has_problems());

    // Auth failures and cancellations leave no claude records behind.
    let stored = read_cache_file(&cache_path).unwrap();
    assert!(stored
        .entries
        .values()
        .all(|r| !r.models.contains_key("claude_512")));

    drop(engine);
    let mut aborted = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let ScanEvent::PassAborted { provider, .. } = event {
            aborted.push(provider);
        }
    }
    assert_eq!(aborted, vec![Provider::Claude]);
}

#[tokio::test]
async fn test_undecodable_image_is_cached_as_sentinel() {
    let root = TempDir::new().unwrap();
    let state = TempDir::new().unwrap();
    let cache_path = state.path().join("cache.json");
    let photos = write_photos(root.path(), &["broken.heic", "fine.jpg"]);

    let classifier = Arc::new(FakeClassifier::deleting(Provider::Openai));
    let mut engine = engine(&cache_path);
    let report = engine
        .run(root.path(), vec![pass(classifier.clone(), 512)])
        .await
        .unwrap();

    assert_eq!(report.passes[0].failed.len(), 1);
    assert_eq!(report.passes[0].succeeded, 1);
    assert_eq!(classifier.calls(), 1);

    let verdict = engine
        .cache()
        .get(&fingerprint(&photos[0]), ModelKey::new(Provider::Openai, 512))
        .unwrap();
    assert!(verdict.is_sentinel());
}

#[tokio::test]
async fn test_identical_fingerprints_are_sent_once() {
    let root = TempDir::new().unwrap();
    let state = TempDir::new().unwrap();
    let cache_path = state.path().join("cache.json");
    let original = root.path().join("a.jpg");
    fs::write(&original, b"same bytes").unwrap();
    let copy = root.path().join("copy_of_a.jpg");
    fs::copy(&original, &copy).unwrap();
    let mtime = filetime::FileTime::from_unix_time(1_600_000_000, 0);
    filetime::set_file_mtime(&original, mtime).unwrap();
    filetime::set_file_mtime(&copy, mtime).unwrap();

    let classifier = Arc::new(FakeClassifier::deleting(Provider::Openai));
    let report = engine(&cache_path)
        .run(root.path(), vec![pass(classifier.clone(), 512)])
        .await
        .unwrap();

    assert_eq!(report.passes[0].same_fingerprint, 1);
    assert_eq!(report.passes[0].succeeded, 1);
    assert_eq!(classifier.calls(), 1);
}

#[tokio::test]
async fn test_stage_events_arrive_in_order() {
    let root = TempDir::new().unwrap();
    let state = TempDir::new().unwrap();
    let cache_path = state.path().join("cache.json");
    write_photos(root.path(), &["a.jpg", "b.jpg"]);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let classifier = Arc::new(FakeClassifier::deleting(Provider::Openai));
    let mut engine = engine(&cache_path).with_events(tx);
    engine
        .run(root.path(), vec![pass(classifier, 512)])
        .await
        .unwrap();
    assert_eq!(engine.stage(), Stage::Done);
    drop(engine);

    let mut stages = Vec::new();
    let mut analyses = 0;
    while let Ok(event) = rx.try_recv() {
        match event {
            ScanEvent::Stage { stage, .. } => stages.push(stage),
            ScanEvent::Analysis { total, .. } => {
                assert_eq!(total, 2);
                analyses += 1;
            }
            _ => {}
        }
    }
    assert_eq!(
        stages,
        vec![
            Stage::Counting,
            Stage::Scanning,
            Stage::CacheChecking,
            Stage::Classifying,
            Stage::Done
        ]
    );
    assert_eq!(analyses, 2);
}

#[tokio::test]
async fn test_missing_root_is_an_error() {
    let state = TempDir::new().unwrap();
    let mut engine = engine(&state.path().join("cache.json"));
    let result = engine
        .run(&state.path().join("does-not-exist"), Vec::new())
        .await;
    assert!(result.is_err());
}
