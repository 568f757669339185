//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{net::SocketAddr, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::CacheConfig;

mod cli;

pub use cli::{CliArgs, Command, ServeArgs, ServeOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const ENVIRONMENT_CONFIG_DIR: &str = "config";
const LOCAL_CONFIG_BASENAME: &str = "respcache";
const ENV_PREFIX: &str = "RESPCACHE";
const DEFAULT_ADMIN_HOST: &str = "127.0.0.1";
const DEFAULT_ADMIN_PORT: u16 = 3001;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_WARM_INTERVAL_SECS: u64 = 300;
const DEFAULT_TUNE_INTERVAL_SECS: u64 = 900;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub cache: CacheConfig,
    pub scheduler: SchedulerSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub admin_addr: SocketAddr,
    pub graceful_shutdown: Duration,
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
pub struct SchedulerSettings {
    pub warm_interval: Duration,
    pub tune_interval: Duration,
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
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false));

    if let Some(environment) = cli.environment.as_deref().map(str::trim) {
        if !environment.is_empty() {
            let name = format!("{ENVIRONMENT_CONFIG_DIR}/{environment}");
            builder = builder.add_source(File::with_name(&name).required(false));
        }
    }

    builder = builder.add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("cache.cacheable_methods")
            .try_parsing(true),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    let overrides = cli
        .command
        .as_ref()
        .map(Command::overrides)
        .cloned()
        .unwrap_or_default();
    raw.apply_serve_overrides(&overrides);

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    cache: CacheConfig,
    scheduler: RawSchedulerSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_admin_host.as_ref() {
            self.server.admin_host = Some(host.clone());
        }
        if let Some(port) = overrides.admin_port {
            self.server.admin_port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(enabled) = overrides.cache_enabled {
            self.cache.enable_response_cache = enabled;
        }
        if let Some(enabled) = overrides.cache_warming {
            self.cache.enable_warming = enabled;
        }
        if let Some(enabled) = overrides.cache_adaptive_ttl {
            self.cache.enable_adaptive_ttl = enabled;
        }
        if let Some(timeout) = overrides.cache_store_timeout_ms {
            self.cache.store_timeout_ms = timeout;
        }
        if let Some(path) = overrides.cache_weights_path.as_ref() {
            self.cache.ttl.weights_path = Some(path.clone());
        }
        if let Some(seconds) = overrides.scheduler_warm_interval_seconds {
            self.scheduler.warm_interval_seconds = Some(seconds);
        }
        if let Some(seconds) = overrides.scheduler_tune_interval_seconds {
            self.scheduler.tune_interval_seconds = Some(seconds);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            cache,
            scheduler,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache)?;
        let scheduler = build_scheduler_settings(scheduler)?;

        Ok(Self {
            server,
            logging,
            cache,
            scheduler,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let admin_host = server
        .admin_host
        .unwrap_or_else(|| DEFAULT_ADMIN_HOST.to_string());
    let admin_port = server.admin_port.unwrap_or(DEFAULT_ADMIN_PORT);
    if admin_port == 0 {
        return Err(LoadError::invalid(
            "server.admin_port",
            "port must be greater than zero",
        ));
    }

    let admin_addr = parse_socket_addr(&admin_host, admin_port)
        .map_err(|reason| LoadError::invalid("server.admin_addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        admin_addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
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

/// Structural checks only; numeric knobs are clamped by `CacheConfig::sanitized`.
fn build_cache_settings(mut cache: CacheConfig) -> Result<CacheConfig, LoadError> {
    if cache.bypass_header.trim().is_empty() {
        return Err(LoadError::invalid("cache.bypass_header", "must not be empty"));
    }
    if cache.bypass_query_param.trim().is_empty() {
        return Err(LoadError::invalid(
            "cache.bypass_query_param",
            "must not be empty",
        ));
    }
    if let Some(name) = cache.resources.keys().find(|name| invalid_namespace(name)) {
        return Err(LoadError::invalid(
            "cache.resources",
            format!("resource type `{name}` must be non-empty and contain no `:`, `*` or `?`"),
        ));
    }
    if cache
        .ttl
        .weights_path
        .as_ref()
        .is_some_and(|path| path.as_os_str().is_empty())
    {
        return Err(LoadError::invalid(
            "cache.ttl.weights_path",
            "path must not be empty",
        ));
    }

    // Built-in policies survive a file that only declares extra resource types.
    for (name, policy) in CacheConfig::default().resources {
        cache.resources.entry(name).or_insert(policy);
    }

    Ok(cache.sanitized())
}

fn invalid_namespace(name: &str) -> bool {
    name.trim().is_empty() || name.contains([':', '*', '?'])
}

fn build_scheduler_settings(
    scheduler: RawSchedulerSettings,
) -> Result<SchedulerSettings, LoadError> {
    let warm_interval = positive_seconds(
        scheduler.warm_interval_seconds,
        DEFAULT_WARM_INTERVAL_SECS,
        "scheduler.warm_interval_seconds",
    )?;
    let tune_interval = positive_seconds(
        scheduler.tune_interval_seconds,
        DEFAULT_TUNE_INTERVAL_SECS,
        "scheduler.tune_interval_seconds",
    )?;

    Ok(SchedulerSettings {
        warm_interval,
        tune_interval,
    })
}

fn positive_seconds(
    value: Option<u64>,
    default: u64,
    key: &'static str,
) -> Result<Duration, LoadError> {
    match value.unwrap_or(default) {
        0 => Err(LoadError::invalid(key, "must be greater than zero")),
        seconds => Ok(Duration::from_secs(seconds)),
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    admin_host: Option<String>,
    admin_port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSchedulerSettings {
    warm_interval_seconds: Option<u64>,
    tune_interval_seconds: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[cfg(test)]
mod tests;
