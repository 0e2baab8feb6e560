use clap::Parser;

use super::*;
use crate::domain::content::TreeKind;

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.cache.seed_count_documents = Some(10);
    raw.logging.level = Some("info".to_string());

    let overrides = CacheOverrides {
        seed_count_documents: Some(50),
        logging: LoggingOverrides {
            log_level: Some("debug".to_string()),
            ..Default::default()
        },
        ..Default::default()
    };

    raw.apply_cache_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.cache.seed_count_documents, 50);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn cache_settings_default_to_cache_config() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
    let defaults = CacheConfig::default();

    assert_eq!(
        settings.cache.seed_count_documents,
        defaults.seed_count_documents
    );
    assert_eq!(settings.cache.kit_batch_size.get(), defaults.kit_batch_size);
    assert_eq!(settings.cache.local_dir, defaults.local_dir);
    assert!(settings.fixture.path.is_none());

    let config = CacheConfig::from(&settings.cache);
    assert_eq!(config.children_page_size, defaults.children_page_size);
}

#[test]
fn zero_capacity_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.event_channel_capacity = Some(0);

    let err = Settings::from_raw(raw).unwrap_err();

    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "cache.event_channel_capacity",
            ..
        }
    ));
}

#[test]
fn invalid_log_level_is_rejected() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("chatty".to_string());

    let err = Settings::from_raw(raw).unwrap_err();

    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "logging.level",
            ..
        }
    ));
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    raw.apply_logging_overrides(&LoggingOverrides {
        log_json: Some(true),
        ..Default::default()
    });

    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn parse_warm_arguments() {
    let args = CliArgs::parse_from([
        "canopy",
        "warm",
        "--fixture",
        "fixtures/site.toml",
        "--cache-persistence",
        "false",
        "--clear",
    ]);

    let Command::Warm(warm) = args.command else {
        panic!("expected warm command");
    };
    assert!(warm.clear);
    assert_eq!(warm.overrides.persistence_enabled, Some(false));
    assert_eq!(
        warm.overrides.fixture,
        Some(PathBuf::from("fixtures/site.toml"))
    );
}

#[test]
fn parse_seed_arguments() {
    let args = CliArgs::parse_from([
        "canopy",
        "seed",
        "--tree",
        "media",
        "--seed-count-media",
        "5",
    ]);

    let Command::Seed(seed) = args.command else {
        panic!("expected seed command");
    };
    assert_eq!(TreeKind::from(seed.tree), TreeKind::Media);
    assert_eq!(seed.overrides.seed_count_media, Some(5));
    assert!(!seed.json);
}

#[test]
fn parse_inspect_arguments() {
    let args = CliArgs::parse_from(["canopy", "inspect", "data/cache/document.canopy", "--records"]);

    let Command::Inspect(inspect) = args.command else {
        panic!("expected inspect command");
    };
    assert!(inspect.records);
    assert_eq!(inspect.file, PathBuf::from("data/cache/document.canopy"));
}
