use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the respcache binary.
#[derive(Debug, Parser)]
#[command(name = "respcache", version, about = "Request-level response cache service")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "RESPCACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    /// Environment name selecting `config/{environment}` on top of the defaults.
    #[arg(long = "environment", env = "RESPCACHE_ENV", value_name = "NAME")]
    pub environment: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the cache maintenance loops and the admin listener.
    Serve(Box<ServeArgs>),
    /// Resolve and validate configuration, then print it.
    #[command(name = "check-config")]
    CheckConfig(Box<ServeArgs>),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the administrative listener host.
    #[arg(long = "server-admin-host", value_name = "HOST")]
    pub server_admin_host: Option<String>,

    /// Override the administrative listener port.
    #[arg(long = "server-admin-port", value_name = "PORT")]
    pub admin_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Toggle the response cache.
    #[arg(
        long = "cache-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_enabled: Option<bool>,

    /// Toggle access tracking and warming.
    #[arg(
        long = "cache-warming",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_warming: Option<bool>,

    /// Toggle adaptive TTLs.
    #[arg(
        long = "cache-adaptive-ttl",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_adaptive_ttl: Option<bool>,

    /// Override the store round-trip deadline.
    #[arg(long = "cache-store-timeout-ms", value_name = "MILLIS")]
    pub cache_store_timeout_ms: Option<u64>,

    /// Persist TTL weights to this file.
    #[arg(long = "cache-weights-path", value_name = "PATH")]
    pub cache_weights_path: Option<PathBuf>,

    /// Override the warm cycle interval.
    #[arg(long = "scheduler-warm-interval-seconds", value_name = "SECONDS")]
    pub scheduler_warm_interval_seconds: Option<u64>,

    /// Override the tune cycle interval.
    #[arg(long = "scheduler-tune-interval-seconds", value_name = "SECONDS")]
    pub scheduler_tune_interval_seconds: Option<u64>,
}

impl Command {
    pub fn overrides(&self) -> &ServeOverrides {
        match self {
            Self::Serve(args) | Self::CheckConfig(args) => &args.overrides,
        }
    }
}
