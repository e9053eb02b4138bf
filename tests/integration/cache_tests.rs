use imgtriage::cache::{read_cache_file, AnalysisCache, ModelKey, CACHE_VERSION, LEGACY_VERSION};
use imgtriage::classify::{Decision, Provider, Verdict};
use imgtriage::scanner::Fingerprint;
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tempfile::tempdir;

const GEMINI: ModelKey = ModelKey {
    provider: Provider::Gemini,
    size: 512,
};

fn verdict(decision: Decision) -> Verdict {
    Verdict {
        decision,
        confidence_keep: 0.1,
        confidence_unsure: 0.1,
        confidence_delete: 0.8,
        primary_category: "screenshot".to_string(),
        reason: "test".to_string(),
    }
}

const VERDICT_JSON: &str = r#"{"decision":"delete","confidence_keep":0.1,"confidence_unsure":0.1,"confidence_delete":0.8,"primary_category":"meme","reason":"x"}"#;

#[test]
fn test_cache_survives_reopen() {
    let dir = tempdir().unwrap();
    let cache_path = dir.path().join("cache.json");
    let fp = Fingerprint::from_fields("2021:06:01 10:00:00|Apple|4032|3024|2048||None|None");

    let mut cache = AnalysisCache::open(&cache_path);
    assert!(cache.is_empty());
    cache
        .set(&fp, Path::new("/photos/a.jpg"), GEMINI, verdict(Decision::Delete))
        .unwrap();
    drop(cache);

    let reopened = AnalysisCache::open(&cache_path);
    assert_eq!(reopened.len(), 1);
    assert_eq!(reopened.get(&fp, GEMINI).unwrap().decision, Decision::Delete);
    assert!(reopened
        .get(&fp, ModelKey::new(Provider::Gemini, 1024))
        .is_none());

    let file = read_cache_file(&cache_path).unwrap();
    assert_eq!(file.version, CACHE_VERSION);
    let record = &file.entries[&fp.to_hex()];
    assert_eq!(record.path.as_deref(), Some(Path::new("/photos/a.jpg")));
    assert_eq!(record.models["gemini_512"].size, 512);
}

#[test]
fn test_legacy_flat_cache_is_converted_and_invalidated() {
    let dir = tempdir().unwrap();
    let cache_path = dir.path().join("cache.json");
    let legacy = format!(
        r#"{{"abc123": {{"path": "/photos/old.jpg", "models": {{"gemini_512": {{"result": {VERDICT_JSON}, "timestamp": 1700000000.0, "size": 512}}}}}}}}"#
    );
    fs::write(&cache_path, legacy).unwrap();

    let file = read_cache_file(&cache_path).unwrap();
    assert_eq!(file.version, LEGACY_VERSION);
    assert_eq!(file.entries["abc123"].version, LEGACY_VERSION);
    assert_eq!(file.entries["abc123"].models.len(), 1);

    // Opening drops records of the old policy and rewrites the file once.
    let cache = AnalysisCache::open(&cache_path);
    assert!(cache.is_empty());
    let rewritten = read_cache_file(&cache_path).unwrap();
    assert_eq!(rewritten.version, CACHE_VERSION);
    assert!(rewritten.entries.is_empty());
}

#[test]
fn test_stale_records_are_dropped_on_version_change() {
    let dir = tempdir().unwrap();
    let cache_path = dir.path().join("cache.json");
    let content = format!(
        r#"{{
  "version": "0.9",
  "entries": {{
    "aa": {{"path": "/p/a.jpg", "version": "{CACHE_VERSION}", "models": {{"gemini_512": {{"result": {VERDICT_JSON}, "timestamp": 1.0, "size": 512}}}}}},
    "bb": {{"path": "/p/b.jpg", "version": "0.9", "models": {{"gemini_512": {{"result": {VERDICT_JSON}, "timestamp": 1.0, "size": 512}}}}}}
  }}
}}"#
    );
    fs::write(&cache_path, content).unwrap();

    let cache = AnalysisCache::open(&cache_path);
    assert_eq!(cache.len(), 1);

    let file = read_cache_file(&cache_path).unwrap();
    assert_eq!(file.version, CACHE_VERSION);
    assert!(file.entries.contains_key("aa"));
    assert!(!file.entries.contains_key("bb"));
}

#[test]
fn test_corrupt_cache_starts_empty() {
    let dir = tempdir().unwrap();
    let cache_path = dir.path().join("cache.json");
    fs::write(&cache_path, b"{ this is not json").unwrap();

    assert!(read_cache_file(&cache_path).is_err());

    let mut cache = AnalysisCache::open(&cache_path);
    assert!(cache.is_empty());

    // The next write replaces the corrupt file.
    let fp = Fingerprint::from_fields("x");
    cache
        .set(&fp, Path::new("/p/x.jpg"), GEMINI, verdict(Decision::Keep))
        .unwrap();
    assert_eq!(read_cache_file(&cache_path).unwrap().entries.len(), 1);
}

#[test]
fn test_one_bad_record_does_not_empty_the_cache() {
    let dir = tempdir().unwrap();
    let cache_path = dir.path().join("cache.json");
    let good = Fingerprint::from_fields("good");
    let nulls = Fingerprint::from_fields("nulls");
    let content = format!(
        r#"{{
  "version": "{CACHE_VERSION}",
  "entries": {{
    "{good}": {{"path": "/p/good.jpg", "version": "{CACHE_VERSION}", "models": {{"gemini_512": {{"result": {VERDICT_JSON}, "timestamp": 1.0, "size": 512}}}}}},
    "{nulls}": {{"path": "/p/nulls.jpg", "version": "{CACHE_VERSION}", "models": {{"gemini_512": {{"result": {{"decision": "delete", "confidence_keep": null, "confidence_unsure": 0.1, "confidence_delete": 0.9, "primary_category": "meme", "reason": null}}, "timestamp": 2.0, "size": 512}}}}}},
    "broken": {{"path": "/p/broken.jpg", "version": "{CACHE_VERSION}", "models": "not a map"}}
  }}
}}"#
    );
    fs::write(&cache_path, content).unwrap();

    let file = read_cache_file(&cache_path).unwrap();
    assert_eq!(file.entries.len(), 2);
    assert!(!file.entries.contains_key("broken"));

    let mut cache = AnalysisCache::open(&cache_path);
    assert_eq!(cache.len(), 2);
    let lenient = cache.get(&nulls, GEMINI).unwrap();
    assert_eq!(lenient.confidence_keep, 0.0);
    assert_eq!(lenient.decision, Decision::Delete);
    assert!(lenient.reason.is_empty());

    // A later write keeps the readable records.
    cache
        .set(
            &Fingerprint::from_fields("new"),
            Path::new("/p/new.jpg"),
            GEMINI,
            verdict(Decision::Keep),
        )
        .unwrap();
    let reopened = AnalysisCache::open(&cache_path);
    assert_eq!(reopened.len(), 3);
    assert!(reopened.get(&good, GEMINI).is_some());
}

#[test]
fn test_cleanup_by_age_and_count() {
    let dir = tempdir().unwrap();
    let cache_path = dir.path().join("cache.json");
    let mut cache = AnalysisCache::open(&cache_path);
    for i in 0..5 {
        let fp = Fingerprint::from_fields(&format!("photo-{i}"));
        cache
            .set(&fp, Path::new("/p/x.jpg"), GEMINI, verdict(Decision::Delete))
            .unwrap();
    }

    // Nothing is older than a day yet.
    assert_eq!(cache.cleanup(1, 100).unwrap(), 0);
    assert_eq!(cache.cleanup(1, 3).unwrap(), 2);
    assert_eq!(cache.len(), 3);

    // Ten days from now everything has aged out.
    let later = SystemTime::now() + Duration::from_secs(10 * 86_400);
    assert_eq!(cache.cleanup_at(later, 5, 100).unwrap(), 3);
    assert!(AnalysisCache::open(&cache_path).is_empty());
}

#[test]
fn test_clear_and_stats() {
    let dir = tempdir().unwrap();
    let cache_path = dir.path().join("cache.json");
    let mut cache = AnalysisCache::open(&cache_path);
    let fp = Fingerprint::from_fields("one");
    cache
        .set(&fp, Path::new("/p/one.jpg"), GEMINI, verdict(Decision::Delete))
        .unwrap();
    cache
        .set(
            &fp,
            Path::new("/p/one.jpg"),
            ModelKey::new(Provider::Openai, 512),
            verdict(Decision::Keep),
        )
        .unwrap();

    let stats = cache.stats();
    assert_eq!(stats.entry_count, 1);
    assert_eq!(stats.model_count, 2);
    assert!(stats.size_bytes > 0);
    assert!(stats.oldest.is_some());
    assert_eq!(stats.version, CACHE_VERSION);

    assert_eq!(cache.clear().unwrap(), 1);
    assert!(cache.is_empty());
    assert!(read_cache_file(&cache_path).unwrap().entries.is_empty());
}
