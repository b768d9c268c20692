//! Integration tests for configuration management
//!
//! These tests verify that the Config struct round-trips through TOML,
//! rejects out-of-range values, and expands and creates its directories.

use proptest::prelude::*;
use slape_engine::config::{Config, ImageVariant};
use tempfile::TempDir;

proptest! {
    #[test]
    fn test_config_round_trip(
        log_level in "error|warn|info|debug|trace",
        base_port in 1024u16..60000,
        max_workers in 1usize..16,
        debate_rounds in 1usize..10,
        interval_ms in 1u64..1000,
        gpu in any::<bool>(),
    ) {
        let mut config = Config::default();
        config.core.log_level = log_level;
        config.workers.base_port = base_port;
        config.workers.max_workers = max_workers;
        config.workers.gpu = gpu;
        config.pipelines.debate_rounds = debate_rounds;
        config.readiness.interval_ms = interval_ms;

        let text = config.to_toml().unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();

        prop_assert!(parsed.validate().is_ok());
        prop_assert_eq!(parsed, config);
    }
}

#[test]
fn test_empty_file_uses_defaults() {
    let config: Config = toml::from_str("").unwrap();

    assert_eq!(config, Config::default());
    assert_eq!(config.server.bind, "0.0.0.0:8080");
    assert_eq!(config.workers.base_port, 8000);
    assert_eq!(config.workers.context_length, 16348);
    assert_eq!(config.pipelines.debate_rounds, 3);
    assert!(config.timeouts.completion() < config.timeouts.generate());
    assert_eq!(config.workers.image_ref(), "ghcr.io/ggml-org/llama.cpp:server");
}

#[test]
fn test_image_override_wins() {
    let config: Config = toml::from_str(
        r#"
[workers]
image_variant = "cuda"
image = "registry.local/llama:custom"
"#,
    )
    .unwrap();

    assert_eq!(config.workers.image_variant, ImageVariant::Cuda);
    assert_eq!(config.workers.image_ref(), "registry.local/llama:custom");
}

#[test]
fn test_out_of_range_values_rejected() {
    for text in [
        "[core]\nlog_level = \"verbose\"",
        "[workers]\nbase_port = 0",
        "[workers]\nbase_port = 65530\nmax_workers = 10",
        "[readiness]\ninterval_ms = 0",
        "[readiness]\ninterval_ms = 5000\ntimeout_secs = 1",
        "[pipelines]\ndebate_rounds = 0",
        "[timeouts]\ngenerate_secs = 0",
        "[timeouts]\ncompletion_secs = 0",
        "[timeouts]\ngenerate_secs = 60\ncompletion_secs = 120",
    ] {
        let config: Config = toml::from_str(text).unwrap();
        assert!(config.validate().is_err(), "accepted: {}", text);
    }
}

#[test]
fn test_load_creates_directories() {
    let temp_dir = TempDir::new().unwrap();
    let data_dir = temp_dir.path().join("data");
    let models_dir = temp_dir.path().join("models");
    let config_path = temp_dir.path().join("config.toml");

    std::fs::write(
        &config_path,
        format!(
            "[core]\ndata_dir = \"{}\"\n\n[workers]\nmodels_dir = \"{}\"\n\n[registry]\npath = \"{}\"\n",
            data_dir.display(),
            models_dir.display(),
            data_dir.join("registry.db").display(),
        ),
    )
    .unwrap();

    let config = Config::load_from_path(&config_path).unwrap();

    assert!(data_dir.is_dir());
    assert!(models_dir.is_dir());
    assert!(config.workers.models_dir.is_absolute());
    assert_eq!(config.registry.path, data_dir.join("registry.db"));
}
