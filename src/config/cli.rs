use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum, ValueHint, builder::BoolishValueParser};

use crate::domain::content::TreeKind;

/// Command-line arguments for the Canopy binary.
#[derive(Debug, Parser)]
#[command(name = "canopy", version, about = "Published content snapshot cache")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "CANOPY_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Start both partitions against the fixture repository and report their status.
    Warm(WarmArgs),
    /// Print the seed keys selected for one tree.
    Seed(SeedArgs),
    /// Validate a local cache file and summarise its contents.
    Inspect(InspectArgs),
}

#[derive(Debug, Args, Clone, Default)]
pub struct WarmArgs {
    #[command(flatten)]
    pub overrides: CacheOverrides,

    /// Discard local cache files and rebuild from the repository.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub clear: bool,
}

#[derive(Debug, Args, Clone)]
pub struct SeedArgs {
    #[command(flatten)]
    pub overrides: CacheOverrides,

    /// Tree to seed.
    #[arg(long, value_enum, default_value_t = TreeArg::Documents)]
    pub tree: TreeArg,

    /// Print keys as JSON lines instead of `id depth` pairs.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub json: bool,
}

#[derive(Debug, Args, Clone)]
pub struct InspectArgs {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    /// Local cache file to inspect.
    #[arg(value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub file: PathBuf,

    /// List every record instead of only the header.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub records: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TreeArg {
    Documents,
    Media,
}

impl From<TreeArg> for TreeKind {
    fn from(value: TreeArg) -> Self {
        match value {
            TreeArg::Documents => TreeKind::Document,
            TreeArg::Media => TreeKind::Media,
        }
    }
}

#[derive(Debug, Args, Default, Clone)]
pub struct LoggingOverrides {
    /// Override the log level (e.g. info, debug).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Emit logs as JSON.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CacheOverrides {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    /// Override the fixture file backing the content repository.
    #[arg(long = "fixture", value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub fixture: Option<PathBuf>,

    /// Override the directory holding local cache files.
    #[arg(long = "cache-local-dir", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub local_dir: Option<PathBuf>,

    /// Enable or disable local cache files.
    #[arg(
        long = "cache-persistence",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub persistence_enabled: Option<bool>,

    /// Override the number of documents loaded eagerly.
    #[arg(long = "seed-count-documents", value_name = "COUNT")]
    pub seed_count_documents: Option<usize>,

    /// Override the number of media items loaded eagerly.
    #[arg(long = "seed-count-media", value_name = "COUNT")]
    pub seed_count_media: Option<usize>,
}
