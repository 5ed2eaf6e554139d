use crate::classify::{GasThreshold, Thresholds};
use anyhow::{anyhow, Context, Result};
use chrono_tz::Tz;
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

fn env_value(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Config is read before tracing is up, so problems are collected here and
/// logged by the caller once it is.
fn env_parse<T: FromStr>(key: &str, warnings: &mut Vec<String>) -> Option<T> {
    let raw = env_value(key)?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warnings.push(format!("ignoring unparseable {key}={raw:?}"));
            None
        }
    }
}

fn env_flag(key: &str) -> Option<bool> {
    env_value(key).map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

fn env_allows(key: &str) -> bool {
    env_value(key).is_none()
}

fn setup_config_path() -> Option<PathBuf> {
    if let Some(path) = env_value("BARN_SETUP_CONFIG_PATH") {
        return Some(PathBuf::from(path));
    }
    env_value("BARN_STATE_DIR").map(|dir| PathBuf::from(dir).join("config.json"))
}

#[derive(Debug, Clone, Default, Deserialize)]
struct GasThresholdOverride {
    #[serde(default)]
    warning: Option<f64>,
    #[serde(default)]
    danger: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ThresholdOverrides {
    #[serde(default)]
    methane: Option<GasThresholdOverride>,
    #[serde(default)]
    co2: Option<GasThresholdOverride>,
    #[serde(default)]
    nh3: Option<GasThresholdOverride>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    mqtt_host: Option<String>,
    #[serde(default)]
    mqtt_port: Option<u16>,
    #[serde(default)]
    mqtt_username: Option<String>,
    #[serde(default)]
    mqtt_password: Option<String>,
    #[serde(default)]
    mqtt_sensor_topic_prefix: Option<String>,
    #[serde(default)]
    mqtt_device_topic_prefix: Option<String>,
    #[serde(default)]
    enable_mqtt_listener: Option<bool>,
    #[serde(default)]
    batch_size: Option<usize>,
    #[serde(default)]
    flush_interval_ms: Option<u64>,
    #[serde(default)]
    max_queue: Option<usize>,
    #[serde(default)]
    dead_letter_path: Option<String>,
    #[serde(default)]
    timezone: Option<String>,
    #[serde(default)]
    uptime_window_hours: Option<u64>,
    #[serde(default)]
    heartbeat_timeout_seconds: Option<u64>,
    #[serde(default)]
    thresholds: Option<ThresholdOverrides>,
}

fn load_setup_config_overrides(warnings: &mut Vec<String>) -> Option<SetupConfigOverrides> {
    let path = setup_config_path()?;
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            warnings.push(format!(
                "failed to read setup config {}: {err}; using env defaults",
                path.display()
            ));
            return None;
        }
    };
    parse_setup_config(contents.into_bytes())
        .map_err(|err| {
            warnings.push(format!(
                "failed to parse setup config {}: {err}; using env defaults",
                path.display()
            ));
        })
        .ok()
}

fn parse_setup_config(mut bytes: Vec<u8>) -> Result<SetupConfigOverrides, simd_json::Error> {
    simd_json::serde::from_slice(&mut bytes)
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
}

/// Setup-file values fill in for anything not set explicitly in the environment.
fn apply_setup_overrides(config: &mut Config, overrides: &SetupConfigOverrides) -> Result<()> {
    if env_allows("BARN_MQTT_HOST") {
        if let Some(host) = non_blank(overrides.mqtt_host.as_deref()) {
            config.mqtt_host = host;
        }
    }
    if env_allows("BARN_MQTT_PORT") {
        if let Some(port) = overrides.mqtt_port.filter(|v| *v != 0) {
            config.mqtt_port = port;
        }
    }
    if env_allows("BARN_MQTT_USERNAME") {
        if let Some(username) = overrides.mqtt_username.as_deref() {
            config.mqtt_username = non_blank(Some(username));
        }
    }
    if env_allows("BARN_MQTT_PASSWORD") {
        if let Some(password) = overrides.mqtt_password.as_deref() {
            config.mqtt_password = non_blank(Some(password));
        }
    }
    if env_allows("BARN_MQTT_SENSOR_TOPIC_PREFIX") {
        if let Some(prefix) = non_blank(overrides.mqtt_sensor_topic_prefix.as_deref()) {
            config.mqtt_sensor_topic_prefix = prefix.trim_end_matches('/').to_string();
        }
    }
    if env_allows("BARN_MQTT_DEVICE_TOPIC_PREFIX") {
        if let Some(prefix) = non_blank(overrides.mqtt_device_topic_prefix.as_deref()) {
            config.mqtt_device_topic_prefix = prefix.trim_end_matches('/').to_string();
        }
    }
    if env_allows("BARN_ENABLE_MQTT") {
        if let Some(value) = overrides.enable_mqtt_listener {
            config.enable_mqtt_listener = value;
        }
    }

    let mut batch_overridden = false;
    if env_allows("BARN_BATCH_SIZE") {
        if let Some(value) = overrides.batch_size.filter(|v| *v != 0) {
            config.batch_size = value;
            batch_overridden = true;
        }
    }
    if env_allows("BARN_FLUSH_INTERVAL_MS") {
        if let Some(value) = overrides.flush_interval_ms.filter(|v| *v != 0) {
            config.flush_interval_ms = value;
        }
    }
    if env_allows("BARN_MAX_QUEUE") {
        if let Some(value) = overrides.max_queue.filter(|v| *v != 0) {
            config.max_queue = value;
        } else if batch_overridden {
            config.max_queue = config.batch_size.saturating_mul(10);
        }
    }
    if env_allows("BARN_DEAD_LETTER_PATH") {
        if let Some(path) = non_blank(overrides.dead_letter_path.as_deref()) {
            config.dead_letter_path = Some(PathBuf::from(path));
        }
    }
    if env_allows("BARN_TIMEZONE") {
        if let Some(name) = non_blank(overrides.timezone.as_deref()) {
            config.timezone = parse_timezone(&name)?;
        }
    }
    if env_allows("BARN_UPTIME_WINDOW_HOURS") {
        if let Some(hours) = overrides.uptime_window_hours.filter(|v| *v != 0) {
            config.uptime_window_hours = hours;
        }
    }
    if env_allows("BARN_HEARTBEAT_TIMEOUT_SECONDS") {
        if let Some(secs) = overrides.heartbeat_timeout_seconds.filter(|v| *v != 0) {
            config.heartbeat_timeout_secs = secs;
        }
    }
    Ok(())
}

fn parse_timezone(name: &str) -> Result<Tz> {
    name.trim()
        .parse::<Tz>()
        .map_err(|err| anyhow!("unknown timezone {name:?}: {err}"))
}

/// Environment beats the setup file, which beats the built-in default.
fn resolve_gas_threshold(
    gas: &str,
    default: GasThreshold,
    setup: Option<&GasThresholdOverride>,
    warnings: &mut Vec<String>,
) -> Result<GasThreshold> {
    let upper = gas.to_ascii_uppercase();
    let warning = env_parse::<f64>(&format!("BARN_{upper}_WARNING_PPM"), warnings)
        .or_else(|| setup.and_then(|s| s.warning))
        .unwrap_or(default.warning);
    let danger = env_parse::<f64>(&format!("BARN_{upper}_DANGER_PPM"), warnings)
        .or_else(|| setup.and_then(|s| s.danger))
        .unwrap_or(default.danger);
    GasThreshold::new(warning, danger).with_context(|| format!("invalid {gas} thresholds"))
}

fn resolve_thresholds(
    setup: Option<&ThresholdOverrides>,
    warnings: &mut Vec<String>,
) -> Result<Thresholds> {
    let defaults = Thresholds::default();
    Ok(Thresholds {
        methane: resolve_gas_threshold(
            "methane",
            defaults.methane,
            setup.and_then(|s| s.methane.as_ref()),
            warnings,
        )?,
        co2: resolve_gas_threshold(
            "co2",
            defaults.co2,
            setup.and_then(|s| s.co2.as_ref()),
            warnings,
        )?,
        nh3: resolve_gas_threshold(
            "nh3",
            defaults.nh3,
            setup.and_then(|s| s.nh3.as_ref()),
            warnings,
        )?,
    })
}

#[derive(Clone, Debug)]
pub struct Config {
    /// `None` runs against the in-memory store.
    pub database_url: Option<String>,
    pub db_pool_size: u32,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_sensor_topic_prefix: String,
    pub mqtt_device_topic_prefix: String,
    pub mqtt_keepalive_secs: u64,
    pub mqtt_client_id: String,
    pub enable_mqtt_listener: bool,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub max_queue: usize,
    pub retry_max_attempts: u32,
    pub retry_base_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    pub dead_letter_path: Option<PathBuf>,
    pub grpc_socket_path: String,
    pub http_listen_addr: SocketAddr,
    pub broadcast_capacity: usize,
    pub thresholds: Thresholds,
    pub timezone: Tz,
    pub uptime_window_hours: u64,
    pub heartbeat_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub device_log_capacity: usize,
    pub otlp_endpoint: Option<String>,
    /// Values that were ignored while loading; log them once tracing is up.
    pub warnings: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let mut warnings = Vec::new();
        let setup_overrides = load_setup_config_overrides(&mut warnings);

        let database_url = env_value("BARN_DATABASE_URL")
            .or_else(|| env_value("DATABASE_URL"))
            .or_else(|| {
                setup_overrides
                    .as_ref()
                    .and_then(|ov| non_blank(ov.database_url.as_deref()))
            })
            .map(normalize_database_url);

        let batch_size = env_parse("BARN_BATCH_SIZE", &mut warnings).unwrap_or(500);
        let http_listen_addr = env_value("BARN_HTTP_LISTEN_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8080".to_string());
        let http_listen_addr: SocketAddr = http_listen_addr
            .parse()
            .with_context(|| format!("BARN_HTTP_LISTEN_ADDR {http_listen_addr:?} is not a socket address"))?;
        let timezone = match env_value("BARN_TIMEZONE") {
            Some(name) => parse_timezone(&name).context("BARN_TIMEZONE")?,
            None => Tz::UTC,
        };

        let mut config = Self {
            database_url,
            db_pool_size: env_parse("BARN_DB_POOL_SIZE", &mut warnings).unwrap_or(10),
            mqtt_host: env_value("BARN_MQTT_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            mqtt_port: env_parse("BARN_MQTT_PORT", &mut warnings).unwrap_or(1883),
            mqtt_username: env_value("BARN_MQTT_USERNAME"),
            mqtt_password: env_value("BARN_MQTT_PASSWORD"),
            mqtt_sensor_topic_prefix: env_value("BARN_MQTT_SENSOR_TOPIC_PREFIX")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or_else(|| "sensors/gas".to_string()),
            mqtt_device_topic_prefix: env_value("BARN_MQTT_DEVICE_TOPIC_PREFIX")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or_else(|| "livestock".to_string()),
            mqtt_keepalive_secs: env_parse("BARN_MQTT_KEEPALIVE_SECS", &mut warnings).unwrap_or(30),
            mqtt_client_id: env_value("BARN_MQTT_CLIENT_ID")
                .unwrap_or_else(|| format!("barn-telemetry-{}", std::process::id())),
            enable_mqtt_listener: env_flag("BARN_ENABLE_MQTT").unwrap_or(true),
            batch_size,
            flush_interval_ms: env_parse("BARN_FLUSH_INTERVAL_MS", &mut warnings).unwrap_or(750),
            max_queue: env_parse("BARN_MAX_QUEUE", &mut warnings).unwrap_or(batch_size * 10),
            retry_max_attempts: env_parse("BARN_RETRY_MAX_ATTEMPTS", &mut warnings).unwrap_or(5),
            retry_base_backoff_ms: env_parse("BARN_RETRY_BASE_BACKOFF_MS", &mut warnings).unwrap_or(200),
            retry_max_backoff_ms: env_parse("BARN_RETRY_MAX_BACKOFF_MS", &mut warnings).unwrap_or(10_000),
            dead_letter_path: env_value("BARN_DEAD_LETTER_PATH").map(PathBuf::from),
            grpc_socket_path: env_value("BARN_GRPC_SOCKET")
                .unwrap_or_else(|| "/tmp/barn_ingest.sock".to_string()),
            http_listen_addr,
            broadcast_capacity: env_parse("BARN_BROADCAST_CAPACITY", &mut warnings).unwrap_or(256),
            thresholds: Thresholds::default(),
            timezone,
            uptime_window_hours: env_parse("BARN_UPTIME_WINDOW_HOURS", &mut warnings).unwrap_or(24),
            heartbeat_timeout_secs: env_parse("BARN_HEARTBEAT_TIMEOUT_SECONDS", &mut warnings).unwrap_or(300),
            sweep_interval_secs: env_parse("BARN_SWEEP_INTERVAL_SECONDS", &mut warnings).unwrap_or(30),
            device_log_capacity: env_parse("BARN_DEVICE_LOG_CAPACITY", &mut warnings).unwrap_or(1000),
            otlp_endpoint: env_value("OTEL_EXPORTER_OTLP_ENDPOINT"),
            warnings: Vec::new(),
        };

        if let Some(overrides) = setup_overrides.as_ref() {
            apply_setup_overrides(&mut config, overrides)?;
        }
        config.thresholds = resolve_thresholds(
            setup_overrides
                .as_ref()
                .and_then(|ov| ov.thresholds.as_ref()),
            &mut warnings,
        )?;
        config.warnings = warnings;

        Ok(config)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    pub fn retry_base_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_base_backoff_ms)
    }

    pub fn retry_max_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_max_backoff_ms)
    }

    pub fn uptime_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.uptime_window_hours as i64)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}
