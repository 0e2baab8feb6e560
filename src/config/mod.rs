//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{num::NonZeroUsize, path::PathBuf, str::FromStr};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::CacheConfig;

mod cli;

pub use cli::{
    CacheOverrides, CliArgs, Command, InspectArgs, LoggingOverrides, SeedArgs, TreeArg, WarmArgs,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "canopy";

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub fixture: FixtureSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub seed_count_documents: usize,
    pub seed_count_media: usize,
    pub persistence_enabled: bool,
    pub max_commit_retries: u32,
    pub local_dir: PathBuf,
    pub event_channel_capacity: NonZeroUsize,
    pub kit_batch_size: NonZeroUsize,
    pub children_page_size: NonZeroUsize,
    pub warning_channel_capacity: NonZeroUsize,
}

#[derive(Debug, Clone, Default)]
pub struct FixtureSettings {
    /// TOML file backing the fixture repository; `None` starts empty.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("CANOPY").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match &cli.command {
        Command::Warm(args) => raw.apply_cache_overrides(&args.overrides),
        Command::Seed(args) => raw.apply_cache_overrides(&args.overrides),
        Command::Inspect(args) => raw.apply_logging_overrides(&args.logging),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    fixture: RawFixtureSettings,
}

impl RawSettings {
    fn apply_logging_overrides(&mut self, overrides: &LoggingOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }

    fn apply_cache_overrides(&mut self, overrides: &CacheOverrides) {
        self.apply_logging_overrides(&overrides.logging);
        if let Some(path) = overrides.fixture.as_ref() {
            self.fixture.path = Some(path.clone());
        }
        if let Some(dir) = overrides.local_dir.as_ref() {
            self.cache.local_dir = Some(dir.clone());
        }
        if let Some(enabled) = overrides.persistence_enabled {
            self.cache.persistence_enabled = Some(enabled);
        }
        if let Some(count) = overrides.seed_count_documents {
            self.cache.seed_count_documents = Some(count);
        }
        if let Some(count) = overrides.seed_count_media {
            self.cache.seed_count_media = Some(count);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            cache,
            fixture,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache)?;
        let fixture = FixtureSettings { path: fixture.path };

        Ok(Self {
            logging,
            cache,
            fixture,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let defaults = CacheConfig::default();

    let local_dir = cache.local_dir.unwrap_or(defaults.local_dir);
    if local_dir.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "cache.local_dir",
            "directory must not be empty",
        ));
    }

    Ok(CacheSettings {
        seed_count_documents: cache
            .seed_count_documents
            .unwrap_or(defaults.seed_count_documents),
        seed_count_media: cache.seed_count_media.unwrap_or(defaults.seed_count_media),
        persistence_enabled: cache
            .persistence_enabled
            .unwrap_or(defaults.persistence_enabled),
        max_commit_retries: cache
            .max_commit_retries
            .unwrap_or(defaults.max_commit_retries),
        local_dir,
        event_channel_capacity: non_zero_usize(
            cache
                .event_channel_capacity
                .unwrap_or(defaults.event_channel_capacity),
            "cache.event_channel_capacity",
        )?,
        kit_batch_size: non_zero_usize(
            cache.kit_batch_size.unwrap_or(defaults.kit_batch_size),
            "cache.kit_batch_size",
        )?,
        children_page_size: non_zero_usize(
            cache
                .children_page_size
                .unwrap_or(defaults.children_page_size),
            "cache.children_page_size",
        )?,
        warning_channel_capacity: non_zero_usize(
            cache
                .warning_channel_capacity
                .unwrap_or(defaults.warning_channel_capacity),
            "cache.warning_channel_capacity",
        )?,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    seed_count_documents: Option<usize>,
    seed_count_media: Option<usize>,
    persistence_enabled: Option<bool>,
    max_commit_retries: Option<u32>,
    local_dir: Option<PathBuf>,
    event_channel_capacity: Option<usize>,
    kit_batch_size: Option<usize>,
    children_page_size: Option<usize>,
    warning_channel_capacity: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawFixtureSettings {
    path: Option<PathBuf>,
}

fn non_zero_usize(value: usize, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[cfg(test)]
mod tests;
