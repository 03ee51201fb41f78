//! Session settings and their sources
//!
//! Settings can come from a TOML file ([`MessengerConfig::load_from_file`])
//! or from command-line flags backed by environment variables ([`MqttArgs`],
//! [`LogArgs`]). Both end up as a plain [`SessionSettings`] value consumed by
//! the session factory.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Default broker address when nothing is configured
pub const DEFAULT_BROKER_ADDRESS: &str = "localhost:1883";

/// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid broker address: {0}")]
    InvalidBrokerAddress(String),
    #[error("Invalid duration: {0}")]
    InvalidDuration(String),
    #[error("Keepalive must be 0 (disabled) or at least 1s, got {0:?}")]
    InvalidKeepAlive(Duration),
    #[error("Failed to read {}: {source}", path.display())]
    ReadMaterial {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse PEM in {}: {source}", path.display())]
    ParseMaterial {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("No certificates found in {}", path.display())]
    NoCertificates { path: PathBuf },
    #[error("Invalid certificate in {}: {reason}", path.display())]
    InvalidCertificate { path: PathBuf, reason: String },
    #[error("No private key found in {}", path.display())]
    NoPrivateKey { path: PathBuf },
    #[error("Unsupported private key in {}", path.display())]
    UnsupportedKey { path: PathBuf },
    #[error("Client certificate {} specified without a key", path.display())]
    CertificateWithoutKey { path: PathBuf },
    #[error("Client key {} specified without a certificate", path.display())]
    KeyWithoutCertificate { path: PathBuf },
    #[error("Private key {} does not match certificate {}", key.display(), certificate.display())]
    KeyMismatch { certificate: PathBuf, key: PathBuf },
    #[error("Failed to load system trust roots: {0}")]
    NativeRoots(#[source] std::io::Error),
    #[error("Invalid TLS configuration: {0}")]
    Tls(#[from] rustls::Error),
}

/// Broker host and optional port; the URI scheme is chosen by the TLS toggle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BrokerAddress {
    host: String,
    port: Option<u16>,
}

impl BrokerAddress {
    pub fn new(host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Port to dial, falling back to the scheme default
    pub fn port_or(&self, default: u16) -> u16 {
        self.port.unwrap_or(default)
    }
}

impl Default for BrokerAddress {
    fn default() -> Self {
        Self::new("localhost", Some(1883))
    }
}

impl FromStr for BrokerAddress {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(ConfigError::InvalidBrokerAddress(
                "address is empty".to_string(),
            ));
        }
        if trimmed.contains("://") {
            return Err(ConfigError::InvalidBrokerAddress(format!(
                "'{trimmed}' must be host:port without a scheme"
            )));
        }

        let url = Url::parse(&format!("tcp://{trimmed}"))
            .map_err(|e| ConfigError::InvalidBrokerAddress(format!("'{trimmed}': {e}")))?;

        if !url.path().is_empty() && url.path() != "/" {
            return Err(ConfigError::InvalidBrokerAddress(format!(
                "'{trimmed}' must not contain a path"
            )));
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ConfigError::InvalidBrokerAddress(format!("'{trimmed}' has no host")))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        Ok(Self {
            host,
            port: url.port(),
        })
    }
}

impl TryFrom<String> for BrokerAddress {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BrokerAddress> for String {
    fn from(value: BrokerAddress) -> Self {
        value.to_string()
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            write!(f, "{}", self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}

/// Externally sourced connection settings consumed by the session factory
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionSettings {
    /// Broker host:port
    pub address: BrokerAddress,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Selects `ssl://` instead of `tcp://`
    pub tls: bool,
    /// CA bundle used as the trusted root set
    pub ca: Option<PathBuf>,
    /// Client certificate chain
    pub cert: Option<PathBuf>,
    /// Client private key
    pub key: Option<PathBuf>,
    #[serde(with = "duration_format")]
    pub connection_timeout: Duration,
    /// Interval between PINGREQ packets; 0 disables, otherwise at least 1s
    #[serde(
        serialize_with = "duration_format::serialize",
        deserialize_with = "duration_format::deserialize_keepalive"
    )]
    pub keepalive: Duration,
    /// Upper bound on the reconnect backoff
    #[serde(with = "duration_format")]
    pub max_reconnect_interval: Duration,
    #[serde(with = "duration_format")]
    pub ping_timeout: Duration,
    /// Also bounds how long a publish waits for its acknowledgement
    #[serde(with = "duration_format")]
    pub write_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            address: BrokerAddress::default(),
            username: None,
            password: None,
            tls: false,
            ca: None,
            cert: None,
            key: None,
            connection_timeout: Duration::from_secs(10),
            keepalive: Duration::from_secs(30),
            max_reconnect_interval: Duration::from_secs(120),
            ping_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
        }
    }
}

impl SessionSettings {
    /// Username, if set and non-empty
    pub fn username(&self) -> Option<&str> {
        non_empty(self.username.as_deref())
    }

    /// Password, if set and non-empty
    pub fn password(&self) -> Option<&str> {
        non_empty(self.password.as_deref())
    }

    pub fn ca_path(&self) -> Option<&Path> {
        non_empty_path(self.ca.as_deref())
    }

    pub fn cert_path(&self) -> Option<&Path> {
        non_empty_path(self.cert.as_deref())
    }

    pub fn key_path(&self) -> Option<&Path> {
        non_empty_path(self.key.as_deref())
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

fn non_empty_path(value: Option<&Path>) -> Option<&Path> {
    value.filter(|p| !p.as_os_str().is_empty())
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogSettings {
    /// debug, info, warn, error or fatal
    pub level: String,
    /// json, pretty or compact
    pub format: String,
    /// stderr, stdout or a file path
    pub file: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
            file: "stderr".to_string(),
        }
    }
}

/// File-based configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MessengerConfig {
    #[serde(default)]
    pub mqtt: SessionSettings,
    #[serde(default)]
    pub log: LogSettings,
}

impl MessengerConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }
}

/// MQTT flags, each backed by an environment variable
#[derive(Debug, Clone, clap::Args)]
pub struct MqttArgs {
    /// Address to MQTT endpoint
    #[arg(
        long = "mqtt.address",
        alias = "mqtt_address",
        env = "MQTT_ADDRESS",
        default_value = DEFAULT_BROKER_ADDRESS
    )]
    pub address: BrokerAddress,

    /// MQTT username
    #[arg(long = "mqtt.username", alias = "mqtt_username", env = "MQTT_USERNAME")]
    pub username: Option<String>,

    /// MQTT password
    #[arg(
        long = "mqtt.password",
        alias = "mqtt_password",
        env = "MQTT_PASSWORD",
        hide_env_values = true
    )]
    pub password: Option<String>,

    /// Enable TLS
    #[arg(long = "mqtt.tls", alias = "mqtt_tls", env = "MQTT_TLS")]
    pub tls: bool,

    /// Path to CA certificate
    #[arg(long = "mqtt.ca", alias = "mqtt_ca", env = "MQTT_CA")]
    pub ca: Option<PathBuf>,

    /// Path to client certificate
    #[arg(long = "mqtt.cert", alias = "mqtt_cert", env = "MQTT_CERT")]
    pub cert: Option<PathBuf>,

    /// Path to client certificate key
    #[arg(long = "mqtt.key", alias = "mqtt_key", env = "MQTT_KEY")]
    pub key: Option<PathBuf>,

    /// Connection timeout
    #[arg(
        long = "mqtt.connection-timeout",
        alias = "mqtt.connection_timeout",
        env = "MQTT_CONNECTION_TIMEOUT",
        default_value = "10s",
        value_parser = parse_duration
    )]
    pub connection_timeout: Duration,

    /// Time between each PING packet (0 disables, otherwise at least 1s)
    #[arg(
        long = "mqtt.keepalive",
        alias = "mqtt_keepalive",
        env = "MQTT_KEEPALIVE",
        default_value = "30s",
        value_parser = parse_keepalive
    )]
    pub keepalive: Duration,

    /// Maximum time to wait between reconnect attempts
    #[arg(
        long = "mqtt.max-reconnect-interval",
        alias = "mqtt.max_reconnect_interval",
        env = "MQTT_MAX_RECONNECT_INTERVAL",
        default_value = "2m",
        value_parser = parse_duration
    )]
    pub max_reconnect_interval: Duration,

    /// Time after which a ping times out
    #[arg(
        long = "mqtt.ping-timeout",
        alias = "mqtt.ping_timeout",
        env = "MQTT_PING_TIMEOUT",
        default_value = "10s",
        value_parser = parse_duration
    )]
    pub ping_timeout: Duration,

    /// Time after which a write will time out
    #[arg(
        long = "mqtt.write-timeout",
        alias = "mqtt.write_timeout",
        env = "MQTT_WRITE_TIMEOUT",
        default_value = "5s",
        value_parser = parse_duration
    )]
    pub write_timeout: Duration,
}

impl From<MqttArgs> for SessionSettings {
    fn from(args: MqttArgs) -> Self {
        Self {
            address: args.address,
            username: args.username,
            password: args.password,
            tls: args.tls,
            ca: args.ca,
            cert: args.cert,
            key: args.key,
            connection_timeout: args.connection_timeout,
            keepalive: args.keepalive,
            max_reconnect_interval: args.max_reconnect_interval,
            ping_timeout: args.ping_timeout,
            write_timeout: args.write_timeout,
        }
    }
}

/// Logging flags, each backed by an environment variable
#[derive(Debug, Clone, clap::Args)]
pub struct LogArgs {
    #[arg(long = "log.level", alias = "log_level", env = "LOG_LEVEL", default_value = "info")]
    pub level: String,

    #[arg(long = "log.format", alias = "log_format", env = "LOG_FORMAT", default_value = "json")]
    pub format: String,

    #[arg(long = "log.file", alias = "log_file", env = "LOG_FILE", default_value = "stderr")]
    pub file: String,
}

impl From<LogArgs> for LogSettings {
    fn from(args: LogArgs) -> Self {
        Self {
            level: args.level,
            format: args.format,
            file: args.file,
        }
    }
}

/// Parse a duration such as `500ms`, `10s`, `2m`, `1h` or `1m30s`.
/// A bare number is taken as seconds.
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::InvalidDuration("empty duration".to_string()));
    }
    if let Ok(secs) = trimmed.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let invalid = || ConfigError::InvalidDuration(trimmed.to_string());
    let mut total = Duration::ZERO;
    let mut rest = trimmed;

    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(invalid)?;
        if digits_end == 0 {
            return Err(invalid());
        }
        let value: u64 = rest[..digits_end].parse().map_err(|_| invalid())?;
        rest = &rest[digits_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let segment = match &rest[..unit_end] {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.saturating_mul(60)),
            "h" => Duration::from_secs(value.saturating_mul(3600)),
            _ => return Err(invalid()),
        };
        total = total.saturating_add(segment);
        rest = &rest[unit_end..];
    }

    Ok(total)
}

/// Keepalive must be zero (disabled) or at least one second
pub fn validate_keepalive(keepalive: Duration) -> Result<Duration, ConfigError> {
    if !keepalive.is_zero() && keepalive < Duration::from_secs(1) {
        return Err(ConfigError::InvalidKeepAlive(keepalive));
    }
    Ok(keepalive)
}

/// [`parse_duration`] followed by [`validate_keepalive`]
pub fn parse_keepalive(input: &str) -> Result<Duration, ConfigError> {
    parse_duration(input).and_then(validate_keepalive)
}

/// Render a duration in the largest unit that represents it exactly
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis == 0 {
        "0s".to_string()
    } else if millis % 3_600_000 == 0 {
        format!("{}h", millis / 3_600_000)
    } else if millis % 60_000 == 0 {
        format!("{}m", millis / 60_000)
    } else if millis % 1_000 == 0 {
        format!("{}s", millis / 1_000)
    } else {
        format!("{millis}ms")
    }
}

mod duration_format {
    use super::{format_duration, parse_duration, parse_keepalive};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_duration(&raw).map_err(serde::de::Error::custom)
    }

    pub fn deserialize_keepalive<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_keepalive(&raw).map_err(serde::de::Error::custom)
    }
}
