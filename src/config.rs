// src/config.rs
use crate::session::DuplicatePolicy;
use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const PROFILE: &str = "famon";
const DEFAULT_IDENTITY: &str = "famon";
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_DEBOUNCE_MS: u64 = 200;
const DEFAULT_DURATION_SECS: u64 = 120;

/// Command-line arguments for the `famon` monitor.
#[derive(Parser, Debug, Deserialize, Default)]
#[clap(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Monitor the given paths as files instead of directories
    #[clap(short, long, help = "Monitor the given paths as files instead of directories")]
    pub file: bool,

    /// Print events as JSON lines
    #[clap(short, long, help = "Print events as JSON lines")]
    pub json: bool,

    /// Client name reported to the monitor backend
    #[clap(short, long, value_parser, help = "Client name reported to the monitor backend")]
    pub identity: Option<String>,

    /// Stop monitoring after this many seconds
    #[clap(short, long, value_parser, help = "Stop monitoring after this many seconds")]
    pub duration: Option<u64>,

    /// Path to a configuration file (e.g., famon.toml)
    #[clap(
        short,
        long,
        value_parser,
        help = "Path to a configuration file (e.g., famon.toml)"
    )]
    pub config: Option<PathBuf>,

    /// One or more paths to monitor
    #[clap(help = "One or more paths to monitor")]
    pub paths: Vec<String>,

    /// Log level (e.g., trace, debug, info, warn, error)
    #[clap(
        long,
        value_parser,
        help = "Log level (e.g., trace, debug, info, warn, error)"
    )]
    pub log_level: Option<String>,
}

/// Configuration loaded from file, environment, or defaults.
#[derive(Deserialize, Serialize, Debug, Default)]
pub struct FileConfig {
    /// Paths to monitor
    pub paths: Option<Vec<String>>,
    /// Monitor paths as files
    pub files: Option<bool>,
    /// Client identity
    pub identity: Option<String>,
    /// Bound of the auxiliary-input wait, in milliseconds
    pub poll_interval_ms: Option<u64>,
    /// Debounce timeout of the filesystem backend, in milliseconds
    pub debounce_ms: Option<u64>,
    /// Treatment of duplicate subscriptions
    pub duplicate_policy: Option<DuplicatePolicy>,
    /// Run time limit, in seconds
    pub duration_secs: Option<u64>,
    /// JSON event output
    pub json: Option<bool>,
    /// Log level
    pub log_level: Option<String>,
}

impl FileConfig {
    /// The lowest-precedence layer.
    #[must_use]
    pub fn defaults() -> Self {
        Self {
            paths: Some(vec![]),
            files: Some(false),
            identity: Some(DEFAULT_IDENTITY.to_string()),
            poll_interval_ms: Some(DEFAULT_POLL_INTERVAL_MS),
            debounce_ms: Some(DEFAULT_DEBOUNCE_MS),
            duplicate_policy: Some(DuplicatePolicy::default()),
            duration_secs: Some(DEFAULT_DURATION_SECS),
            json: Some(false),
            log_level: Some("info".to_string()),
        }
    }
}

/// Settings consumed by [`Session`](crate::session::Session) and
/// [`EventLoop`](crate::event_loop::EventLoop).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Client identity, used for diagnostics only
    pub identity: String,
    /// Bound of the auxiliary-input wait, in milliseconds
    pub poll_interval_ms: u64,
    /// Debounce timeout of the filesystem backend, in milliseconds
    pub debounce_ms: u64,
    /// Treatment of duplicate subscriptions
    pub duplicate_policy: DuplicatePolicy,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            identity: DEFAULT_IDENTITY.to_string(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            duplicate_policy: DuplicatePolicy::default(),
        }
    }
}

impl MonitorConfig {
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub const fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Final application configuration after merging all sources.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Library settings
    pub monitor: MonitorConfig,
    /// Paths to monitor
    pub paths: Vec<String>,
    /// Whether the paths are files rather than directories
    pub files: bool,
    /// How long to run before exiting
    pub duration: Duration,
    /// Whether to print events as JSON
    pub json: bool,
    /// Log level
    pub log_level: String,
}

impl AppConfig {
    /// Loads the application configuration by merging CLI, file, environment, and defaults.
    pub fn load() -> Result<Self, figment::Error> {
        let cli_args = CliArgs::parse();
        let config_file_path = cli_args
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from("famon.toml"));
        Self::resolve(cli_args, Self::figment(config_file_path))
    }

    /// Defaults, then the `[famon]` table of the TOML file, then `FAMON_*` variables.
    ///
    /// The environment layer targets the `famon` profile so it outranks the file once
    /// that profile is selected.
    #[must_use]
    pub fn figment(config_file_path: PathBuf) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(FileConfig::defaults()))
            .merge(Toml::file(config_file_path).nested())
            .merge(
                Env::prefixed("FAMON_")
                    .map(|key| key.as_str().replace("__", ".").into())
                    .profile(PROFILE),
            )
    }

    /// Applies CLI overrides on top of an already layered `figment`.
    pub fn resolve(cli_args: CliArgs, figment: Figment) -> Result<Self, figment::Error> {
        let merged: FileConfig = figment.select(PROFILE).extract()?;
        let defaults = MonitorConfig::default();

        let monitor = MonitorConfig {
            identity: cli_args
                .identity
                .or(merged.identity)
                .unwrap_or(defaults.identity),
            poll_interval_ms: merged
                .poll_interval_ms
                .unwrap_or(defaults.poll_interval_ms),
            debounce_ms: merged.debounce_ms.unwrap_or(defaults.debounce_ms),
            duplicate_policy: merged
                .duplicate_policy
                .unwrap_or(defaults.duplicate_policy),
        };

        let paths = if !cli_args.paths.is_empty() {
            cli_args.paths
        } else {
            merged.paths.unwrap_or_default()
        };

        Ok(AppConfig {
            monitor,
            paths,
            // For boolean flags, CLI presence means true
            files: cli_args.file || merged.files.unwrap_or(false),
            json: cli_args.json || merged.json.unwrap_or(false),
            duration: Duration::from_secs(
                cli_args
                    .duration
                    .or(merged.duration_secs)
                    .unwrap_or(DEFAULT_DURATION_SECS),
            ),
            log_level: cli_args
                .log_level
                .or(merged.log_level)
                .unwrap_or_else(|| "info".to_string()),
        })
    }
}
