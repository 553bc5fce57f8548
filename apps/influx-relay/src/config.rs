use crate::buffer::{BufferLimits, DEFAULT_HARD_LIMIT, DEFAULT_SOFT_LIMIT};
use crate::error::{RelayError, RelayResult};
use crate::format::{FormatOptions, MeasurementMode, PercentageScale};
use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::{de, Deserialize, Deserializer, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_SETUP_CONFIG_PATH: &str = "/var/lib/influx-relay/settings.json";
const DEFAULT_PORT: u16 = 8086;
const MIN_WRITE_INTERVAL_SECS: u64 = 10;
const MAX_WRITE_INTERVAL_SECS: u64 = 60;

/// Flush cadence in whole seconds, `10..=60`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteInterval(u64);

impl WriteInterval {
    pub fn new(seconds: u64) -> RelayResult<Self> {
        if !(MIN_WRITE_INTERVAL_SECS..=MAX_WRITE_INTERVAL_SECS).contains(&seconds) {
            return Err(RelayError::InvalidWriteInterval(seconds));
        }
        Ok(Self(seconds))
    }

    pub fn seconds(&self) -> u64 {
        self.0
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.0)
    }
}

impl Default for WriteInterval {
    fn default() -> Self {
        Self(MIN_WRITE_INTERVAL_SECS)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    /// Basic credentials in the query string, `/write` + `/query`.
    V1,
    /// Token auth, `/api/v2/write` with org + bucket.
    V2,
}

/// Host/port/protocol/database tuple; a change forces re-validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseIdentity {
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub database: String,
}

/// Connection settings, replaced wholesale on every update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteSettings {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_port", deserialize_with = "deserialize_port")]
    pub port: u16,
    #[serde(default)]
    pub organization: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_credential")]
    pub username: String,
    #[serde(default = "default_credential")]
    pub password: String,
    #[serde(default)]
    pub database: String,
}

fn default_protocol() -> String {
    "http".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_credential() -> String {
    "root".to_string()
}

/// The hub stores the port as a string (`"8086"`); plain numbers are accepted too.
#[derive(Deserialize)]
#[serde(untagged)]
enum PortValue {
    Number(u64),
    Text(String),
}

impl PortValue {
    fn into_port(self) -> std::result::Result<u16, String> {
        let port = match self {
            PortValue::Number(number) => u16::try_from(number).ok(),
            PortValue::Text(text) => text.trim().parse::<u16>().ok(),
        };
        match port {
            Some(port) if port != 0 => Ok(port),
            _ => Err("port must be a number in 1..=65535".to_string()),
        }
    }
}

fn deserialize_port<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    PortValue::deserialize(deserializer)?
        .into_port()
        .map_err(de::Error::custom)
}

fn deserialize_optional_port<'de, D>(deserializer: D) -> std::result::Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<PortValue>::deserialize(deserializer)?
        .map(PortValue::into_port)
        .transpose()
        .map_err(de::Error::custom)
}

impl Default for WriteSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            protocol: default_protocol(),
            port: DEFAULT_PORT,
            organization: String::new(),
            token: String::new(),
            username: default_credential(),
            password: default_credential(),
            database: String::new(),
        }
    }
}

impl WriteSettings {
    pub fn protocol_version(&self) -> ProtocolVersion {
        if !self.organization.is_empty() && !self.token.is_empty() {
            ProtocolVersion::V2
        } else {
            ProtocolVersion::V1
        }
    }

    /// Host, database, port and protocol are all usable.
    pub fn is_complete(&self) -> bool {
        !self.host.trim().is_empty()
            && !self.database.is_empty()
            && self.port != 0
            && matches!(self.protocol.as_str(), "http" | "https")
    }

    pub fn identity(&self) -> DatabaseIdentity {
        DatabaseIdentity {
            host: self.host.clone(),
            port: self.port,
            protocol: self.protocol.clone(),
            database: self.database.clone(),
        }
    }

    /// `{protocol}://{host}:{port}`, or empty when no host is configured.
    pub fn base_url(&self) -> String {
        if self.host.trim().is_empty() {
            return String::new();
        }
        format!("{}://{}:{}", self.protocol, self.host.trim(), self.port)
    }
}

fn setup_config_path() -> PathBuf {
    if let Ok(path) = env::var("RELAY_SETUP_CONFIG_PATH") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    PathBuf::from(DEFAULT_SETUP_CONFIG_PATH)
}

/// Hub-side settings object; every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    protocol: Option<String>,
    #[serde(default, deserialize_with = "deserialize_optional_port")]
    port: Option<u16>,
    #[serde(default)]
    organization: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    database: Option<String>,
    #[serde(default)]
    write_interval: Option<u64>,
    #[serde(default)]
    measurement_mode: Option<MeasurementMode>,
    #[serde(default)]
    measurement_prefix: Option<String>,
    #[serde(default)]
    percentage_scale: Option<PercentageScale>,
}

fn load_setup_config_overrides(path: &Path) -> Option<SetupConfigOverrides> {
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "influx-relay failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    let mut bytes = contents.into_bytes();
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "influx-relay failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

fn env_value(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_value(key).and_then(|value| value.parse::<T>().ok())
}

fn env_enum<T: serde::de::DeserializeOwned>(key: &str) -> Result<Option<T>> {
    match env_value(key) {
        Some(raw) => serde_json::from_value(serde_json::Value::String(raw.clone()))
            .map(Some)
            .with_context(|| format!("{key} has an unsupported value: {raw}")),
        None => Ok(None),
    }
}

fn apply_setup_overrides(config: &mut Config, overrides: &SetupConfigOverrides) -> RelayResult<()> {
    let settings = &mut config.settings;
    let text = |value: &Option<String>| {
        value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    if env_value("INFLUX_HOST").is_none() {
        if let Some(host) = text(&overrides.host) {
            settings.host = host;
        }
    }
    if env_value("INFLUX_PROTOCOL").is_none() {
        if let Some(protocol) = text(&overrides.protocol) {
            settings.protocol = protocol;
        }
    }
    if env_value("INFLUX_PORT").is_none() {
        if let Some(port) = overrides.port {
            settings.port = port;
        }
    }
    if env_value("INFLUX_ORGANIZATION").is_none() {
        if let Some(organization) = overrides.organization.as_deref() {
            settings.organization = organization.trim().to_string();
        }
    }
    if env_value("INFLUX_TOKEN").is_none() {
        if let Some(token) = overrides.token.as_deref() {
            settings.token = token.trim().to_string();
        }
    }
    if env_value("INFLUX_USERNAME").is_none() {
        if let Some(username) = text(&overrides.username) {
            settings.username = username;
        }
    }
    if env_value("INFLUX_PASSWORD").is_none() {
        if let Some(password) = text(&overrides.password) {
            settings.password = password;
        }
    }
    if env_value("INFLUX_DATABASE").is_none() {
        if let Some(database) = text(&overrides.database) {
            settings.database = database;
        }
    }

    if env_value("RELAY_WRITE_INTERVAL_SECS").is_none() {
        if let Some(seconds) = overrides.write_interval {
            config.write_interval = WriteInterval::new(seconds)?;
        }
    }
    if env_value("RELAY_MEASUREMENT_MODE").is_none() {
        if let Some(mode) = overrides.measurement_mode {
            config.format.measurement_mode = mode;
        }
    }
    if env_value("RELAY_MEASUREMENT_PREFIX").is_none() {
        if let Some(prefix) = overrides.measurement_prefix.as_deref() {
            config.format.measurement_prefix = prefix.to_string();
        }
    }
    if env_value("RELAY_PERCENTAGE_SCALE").is_none() {
        if let Some(scale) = overrides.percentage_scale {
            config.format.percentage_scale = scale;
        }
    }
    Ok(())
}

#[derive(Clone, Debug)]
pub struct Config {
    pub settings: WriteSettings,
    pub write_interval: WriteInterval,
    pub buffer_limits: BufferLimits,
    pub format: FormatOptions,
    pub http_bind: String,
    pub host_metrics_interval_secs: u64,
    pub enable_mqtt_listener: bool,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_topic_prefix: String,
    pub mqtt_keepalive_secs: u64,
    pub mqtt_client_id: String,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        let overrides = load_setup_config_overrides(&setup_config_path());
        Self::build(overrides.as_ref())
    }

    fn build(overrides: Option<&SetupConfigOverrides>) -> Result<Self> {
        let settings = WriteSettings {
            host: env_value("INFLUX_HOST").unwrap_or_default(),
            protocol: env_value("INFLUX_PROTOCOL").unwrap_or_else(default_protocol),
            port: env_parse("INFLUX_PORT").unwrap_or(DEFAULT_PORT),
            organization: env_value("INFLUX_ORGANIZATION").unwrap_or_default(),
            token: env_value("INFLUX_TOKEN").unwrap_or_default(),
            username: env_value("INFLUX_USERNAME").unwrap_or_else(default_credential),
            password: env_value("INFLUX_PASSWORD").unwrap_or_else(default_credential),
            database: env_value("INFLUX_DATABASE").unwrap_or_else(|| "homey".to_string()),
        };

        let write_interval = match env_value("RELAY_WRITE_INTERVAL_SECS") {
            Some(raw) => {
                let seconds = raw
                    .parse::<u64>()
                    .with_context(|| format!("RELAY_WRITE_INTERVAL_SECS is not a number: {raw}"))?;
                WriteInterval::new(seconds)?
            }
            None => WriteInterval::default(),
        };

        let soft = env_parse("RELAY_SOFT_LIMIT").unwrap_or(DEFAULT_SOFT_LIMIT);
        let hard = env_parse("RELAY_HARD_LIMIT").unwrap_or(DEFAULT_HARD_LIMIT);
        let buffer_limits = BufferLimits::new(soft, hard)?;

        let format = FormatOptions {
            measurement_mode: env_enum("RELAY_MEASUREMENT_MODE")?.unwrap_or_default(),
            measurement_prefix: env::var("RELAY_MEASUREMENT_PREFIX").unwrap_or_default(),
            percentage_scale: env_enum("RELAY_PERCENTAGE_SCALE")?.unwrap_or_default(),
        };

        let http_bind =
            env_value("RELAY_HTTP_BIND").unwrap_or_else(|| "127.0.0.1:8087".to_string());
        let host_metrics_interval_secs = env_parse("RELAY_HOST_METRICS_INTERVAL_SECS").unwrap_or(30);

        let enable_mqtt_listener = env::var("RELAY_ENABLE_MQTT")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let mqtt_host = env_value("RELAY_MQTT_HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let mqtt_port = env_parse("RELAY_MQTT_PORT").unwrap_or(1883);
        let mqtt_username = env_value("RELAY_MQTT_USERNAME");
        let mqtt_password = env_value("RELAY_MQTT_PASSWORD");
        let mqtt_topic_prefix =
            env_value("RELAY_MQTT_TOPIC_PREFIX").unwrap_or_else(|| "homey".to_string());
        let mqtt_keepalive_secs = env_parse("RELAY_MQTT_KEEPALIVE_SECS").unwrap_or(30);
        let mqtt_client_id = env_value("RELAY_MQTT_CLIENT_ID")
            .unwrap_or_else(|| format!("influx-relay-{}", std::process::id()));
        let otlp_endpoint = env_value("OTEL_EXPORTER_OTLP_ENDPOINT");

        let mut config = Self {
            settings,
            write_interval,
            buffer_limits,
            format,
            http_bind,
            host_metrics_interval_secs,
            enable_mqtt_listener,
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_topic_prefix,
            mqtt_keepalive_secs,
            mqtt_client_id,
            otlp_endpoint,
        };

        if let Some(overrides) = overrides {
            apply_setup_overrides(&mut config, overrides)
                .context("setup config has an invalid value")?;
        }

        Ok(config)
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    /// `None` disables the host metrics producer.
    pub fn host_metrics_interval(&self) -> Option<Duration> {
        (self.host_metrics_interval_secs > 0)
            .then(|| Duration::from_secs(self.host_metrics_interval_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn write_interval_rejects_out_of_range_values() {
        assert!(WriteInterval::new(10).is_ok());
        assert!(WriteInterval::new(60).is_ok());
        assert!(matches!(
            WriteInterval::new(9),
            Err(RelayError::InvalidWriteInterval(9))
        ));
        assert!(matches!(
            WriteInterval::new(61),
            Err(RelayError::InvalidWriteInterval(61))
        ));
        assert_eq!(
            WriteInterval::new(15).expect("valid").duration(),
            Duration::from_secs(15)
        );
    }

    #[test]
    fn protocol_version_requires_org_and_token() {
        let mut settings = WriteSettings::default();
        assert_eq!(settings.protocol_version(), ProtocolVersion::V1);
        settings.organization = "org".to_string();
        assert_eq!(settings.protocol_version(), ProtocolVersion::V1);
        settings.token = "secret".to_string();
        assert_eq!(settings.protocol_version(), ProtocolVersion::V2);
    }

    #[test]
    fn completeness_checks_host_database_port_and_protocol() {
        let complete = WriteSettings {
            host: "influx.local".to_string(),
            database: "homey".to_string(),
            ..WriteSettings::default()
        };
        assert!(complete.is_complete());
        assert!(!WriteSettings {
            host: "  ".to_string(),
            ..complete.clone()
        }
        .is_complete());
        assert!(!WriteSettings {
            database: String::new(),
            ..complete.clone()
        }
        .is_complete());
        assert!(!WriteSettings {
            port: 0,
            ..complete.clone()
        }
        .is_complete());
        assert!(!WriteSettings {
            protocol: "udp".to_string(),
            ..complete.clone()
        }
        .is_complete());
    }

    #[test]
    fn base_url_is_empty_without_host() {
        assert_eq!(WriteSettings::default().base_url(), "");
        let settings = WriteSettings {
            host: "influx.local".to_string(),
            protocol: "https".to_string(),
            port: 8443,
            ..WriteSettings::default()
        };
        assert_eq!(settings.base_url(), "https://influx.local:8443");
    }

    #[test]
    fn settings_deserialize_with_defaults() {
        let settings: WriteSettings =
            serde_json::from_str(r#"{"host":"10.0.0.2","database":"metrics"}"#).expect("settings");
        assert_eq!(settings.port, 8086);
        assert_eq!(settings.protocol, "http");
        assert_eq!(settings.username, "root");
        assert_eq!(settings.password, "root");
    }

    #[test]
    fn setup_file_overrides_parse() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(
            file,
            r#"{{"host":"influx.lan","port":9999,"database":"house","write_interval":30,
                "measurement_mode":"by_zone_name","measurement_prefix":"homey_",
                "percentage_scale":"float","organization":"o","token":"t"}}"#
        )?;
        let overrides = load_setup_config_overrides(file.path()).expect("overrides");
        assert_eq!(overrides.host.as_deref(), Some("influx.lan"));
        assert_eq!(overrides.port, Some(9999));
        assert_eq!(overrides.write_interval, Some(30));
        assert_eq!(overrides.measurement_mode, Some(MeasurementMode::ByZoneName));
        assert_eq!(overrides.percentage_scale, Some(PercentageScale::Float));
        Ok(())
    }

    #[test]
    fn setup_file_in_hub_shape_keeps_string_port() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(
            file,
            r#"{{"host":"192.168.1.10","protocol":"http","port":"8086",
                "username":"root","password":"root","database":"homey"}}"#
        )?;
        let overrides = load_setup_config_overrides(file.path()).expect("overrides");
        assert_eq!(overrides.port, Some(8086));
        assert_eq!(overrides.host.as_deref(), Some("192.168.1.10"));
        assert_eq!(overrides.database.as_deref(), Some("homey"));
        Ok(())
    }

    #[test]
    fn settings_port_accepts_string_or_number_in_range() {
        let parse = |body: &str| serde_json::from_str::<WriteSettings>(body);
        assert_eq!(parse(r#"{"port":"9999"}"#).expect("string").port, 9999);
        assert_eq!(parse(r#"{"port":" 8086 "}"#).expect("padded").port, 8086);
        assert_eq!(parse(r#"{"port":443}"#).expect("number").port, 443);
        assert!(parse(r#"{"port":"0"}"#).is_err());
        assert!(parse(r#"{"port":70000}"#).is_err());
        assert!(parse(r#"{"port":"http"}"#).is_err());
    }

    #[test]
    fn setup_write_interval_out_of_range_fails_startup() {
        let overrides = SetupConfigOverrides {
            write_interval: Some(5),
            ..SetupConfigOverrides::default()
        };
        let err = Config::build(Some(&overrides)).expect_err("interval 5 rejected");
        assert!(matches!(
            err.downcast_ref::<RelayError>(),
            Some(RelayError::InvalidWriteInterval(5))
        ));

        let overrides = SetupConfigOverrides {
            write_interval: Some(30),
            ..SetupConfigOverrides::default()
        };
        let config = Config::build(Some(&overrides)).expect("interval 30 accepted");
        assert_eq!(config.write_interval.seconds(), 30);
    }

    #[test]
    fn unreadable_setup_file_is_ignored() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(file, "not json")?;
        assert!(load_setup_config_overrides(file.path()).is_none());
        assert!(load_setup_config_overrides(Path::new("/nonexistent/relay.json")).is_none());
        Ok(())
    }
}
