use figment::providers::{Env, Serialized};
use figment::Figment;
use imgtriage::actions::CollisionPolicy;
use imgtriage::classify::Provider;
use imgtriage::config::{Config, ConfigError, ENV_PREFIX};
use imgtriage::dispatch::EncodeMode;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::tempdir;

#[test]
fn test_config_defaults_extract() {
    // Figment without Env so other tests' variables cannot leak in
    let config: Config = Figment::from(Serialized::defaults(Config::default()))
        .extract()
        .unwrap();
    assert_eq!(config, Config::default());
    assert_eq!(config.analysis.encode_mode, EncodeMode::PreserveAspect);
    assert_eq!(config.relocation.on_collision, CollisionPolicy::Skip);
}

#[test]
fn test_config_load_from_toml() {
    let temp_dir = tempdir().unwrap();
    let config_path = temp_dir.path().join("imgtriage.toml");
    let toml_content = r#"
[cache]
path = "/var/lib/photos/cache.json"
max_entries = 500

[analysis]
providers = ["openai", "gemini"]
size = 768
encode_mode = "center_square"

[providers.openai]
model = "gpt-4o-mini"
concurrency = 3

[relocation]
run_dir = "review"
on_collision = "rename"

[relocation.thresholds]
delete = 0.8
"#;
    fs::write(&config_path, toml_content).unwrap();

    let config = Config::load(Some(&config_path)).unwrap();

    assert_eq!(config.cache.path, PathBuf::from("/var/lib/photos/cache.json"));
    assert_eq!(config.cache.max_entries, 500);
    assert_eq!(config.cache.max_age_days, 30);
    assert_eq!(config.analysis.providers, vec![Provider::Openai, Provider::Gemini]);
    assert_eq!(config.analysis.size, 768);
    assert_eq!(config.analysis.encode_mode, EncodeMode::CenterSquare);
    assert_eq!(config.providers.openai.model.as_deref(), Some("gpt-4o-mini"));
    assert_eq!(config.providers.openai.concurrency, Some(3));
    assert!(config.providers.gemini.model.is_none());
    assert_eq!(config.relocation.run_dir, PathBuf::from("review"));
    assert_eq!(config.relocation.on_collision, CollisionPolicy::Rename);
    assert!((config.relocation.thresholds.delete - 0.8).abs() < f64::EPSILON);
    assert!((config.relocation.thresholds.low_keep - 0.75).abs() < f64::EPSILON);

    let dispatch = config.dispatch_config(3, 30);
    assert_eq!(dispatch.size, 768);
    assert_eq!(dispatch.mode, EncodeMode::CenterSquare);
}

#[test]
fn test_config_load_from_env() {
    std::env::set_var("IMGTRIAGE_ANALYSIS__TIMEOUT_SECS", "90");
    // Double underscore for nesting
    std::env::set_var("IMGTRIAGE_PROVIDERS__CLAUDE__MODEL", "claude-test");

    let config: Config = Figment::from(Serialized::defaults(Config::default()))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .unwrap();

    assert_eq!(config.analysis.timeout_secs, 90);
    assert_eq!(config.providers.claude.model.as_deref(), Some("claude-test"));
    assert_eq!(
        config.dispatch_config(1, 1).timeout,
        Duration::from_secs(90)
    );

    std::env::remove_var("IMGTRIAGE_ANALYSIS__TIMEOUT_SECS");
    std::env::remove_var("IMGTRIAGE_PROVIDERS__CLAUDE__MODEL");
}

#[test]
fn test_config_rejects_out_of_range_thresholds() {
    let temp_dir = tempdir().unwrap();
    let config_path = temp_dir.path().join("imgtriage.toml");
    fs::write(&config_path, "[relocation.thresholds]\nunsure = 1.5\n").unwrap();

    let result = Config::load(Some(&config_path));
    assert!(matches!(
        result,
        Err(ConfigError::OutOfRange {
            key: "relocation.thresholds",
            ..
        })
    ));
}

#[test]
fn test_config_invalid_toml() {
    let temp_dir = tempdir().unwrap();
    let config_path = temp_dir.path().join("imgtriage.toml");
    fs::write(&config_path, "[analysis]\nsize = \"large\"\n").unwrap();

    assert!(matches!(
        Config::load(Some(&config_path)),
        Err(ConfigError::Invalid(_))
    ));
}

#[test]
fn test_config_missing_explicit_file() {
    let temp_dir = tempdir().unwrap();
    let result = Config::load(Some(&temp_dir.path().join("missing.toml")));
    assert!(result.is_err());
}
