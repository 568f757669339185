use std::ffi::OsString;
use std::io::Write;

use super::*;

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.server.admin_port = Some(4000);
    raw.logging.level = Some("info".to_string());

    let overrides = ServeOverrides {
        admin_port: Some(4321),
        log_level: Some("debug".to_string()),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.server.admin_addr.port(), 4321);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn defaults_resolve_without_any_source() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.server.admin_addr.port(), DEFAULT_ADMIN_PORT);
    assert_eq!(settings.server.graceful_shutdown, Duration::from_secs(30));
    assert!(matches!(settings.logging.format, LogFormat::Compact));
    assert_eq!(
        settings.scheduler.warm_interval,
        Duration::from_secs(DEFAULT_WARM_INTERVAL_SECS)
    );
    assert!(settings.cache.enable_response_cache);
    assert!(settings.cache.resources.contains_key("sentiment"));
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = ServeOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn invalid_log_level_is_rejected() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("loud".to_string());

    let err = Settings::from_raw(raw).expect_err("level must parse");
    assert!(matches!(err, LoadError::Invalid { key: "logging.level", .. }));
}

#[test]
fn zero_intervals_are_rejected() {
    let mut raw = RawSettings::default();
    raw.scheduler.tune_interval_seconds = Some(0);

    let err = Settings::from_raw(raw).expect_err("interval must be positive");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "scheduler.tune_interval_seconds",
            ..
        }
    ));
}

#[test]
fn resource_names_must_be_plain_namespaces() {
    let mut raw = RawSettings::default();
    raw.cache
        .resources
        .insert("bad:name".to_string(), Default::default());

    let err = Settings::from_raw(raw).expect_err("namespace must not contain separators");
    assert!(matches!(err, LoadError::Invalid { key: "cache.resources", .. }));
}

#[test]
fn cache_settings_can_be_overridden_via_cli() {
    let mut raw = RawSettings::default();
    let overrides = ServeOverrides {
        cache_enabled: Some(false),
        cache_adaptive_ttl: Some(false),
        cache_store_timeout_ms: Some(0),
        cache_weights_path: Some("state/weights.json".into()),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(!settings.cache.enable_response_cache);
    assert!(!settings.cache.enable_adaptive_ttl);
    // Clamped rather than rejected.
    assert_eq!(settings.cache.store_timeout_ms, 1);
    assert_eq!(
        settings.cache.ttl.weights_path.as_deref(),
        Some(std::path::Path::new("state/weights.json"))
    );
    assert!(settings.cache.enable_warming);
}

#[test]
fn config_file_layers_under_cli() {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config file");
    writeln!(
        file,
        r#"
[server]
admin_port = 5000

[cache]
warm_min_hits = 7

[cache.resources.widget]
default_ttl_secs = 120
min_ttl_secs = 30
max_ttl_secs = 600
volatility = 0.3
"#
    )
    .expect("write config");

    let args = CliArgs::parse_from([
        OsString::from("respcache"),
        OsString::from("--config-file"),
        file.path().as_os_str().to_os_string(),
        OsString::from("serve"),
        OsString::from("--server-admin-port"),
        OsString::from("5001"),
    ]);
    let settings = load(&args).expect("valid settings");

    assert_eq!(settings.server.admin_addr.port(), 5001);
    assert_eq!(settings.cache.warm_min_hits, 7);
    assert_eq!(settings.cache.resources["widget"].default_ttl_secs, 120);
    assert!(settings.cache.resources.contains_key("sentiment"));
}

#[test]
fn default_to_serve_command() {
    let args = CliArgs::parse_from(["respcache"]);
    let command = args
        .command
        .unwrap_or(Command::Serve(Box::<ServeArgs>::default()));
    assert!(matches!(command, Command::Serve(_)));
}

#[test]
fn parse_serve_overrides() {
    let args = CliArgs::parse_from([
        "respcache",
        "serve",
        "--server-admin-host",
        "0.0.0.0",
        "--cache-warming=false",
        "--scheduler-warm-interval-seconds",
        "60",
    ]);

    match args.command.expect("serve command") {
        Command::Serve(serve) => {
            assert_eq!(serve.overrides.server_admin_host.as_deref(), Some("0.0.0.0"));
            assert_eq!(serve.overrides.cache_warming, Some(false));
            assert_eq!(serve.overrides.scheduler_warm_interval_seconds, Some(60));
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_check_config_with_environment() {
    let args = CliArgs::parse_from(["respcache", "--environment", "staging", "check-config"]);

    assert_eq!(args.environment.as_deref(), Some("staging"));
    assert!(matches!(args.command, Some(Command::CheckConfig(_))));
}
