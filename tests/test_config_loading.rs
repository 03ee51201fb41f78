//! Configuration loading tests
//!
//! Focus on what a loaded file produces, including defaults and the errors
//! a malformed file yields.

use mqtt_messenger::config::{ConfigError, LogSettings, MessengerConfig};
use mqtt_messenger::session::build_session_options;
use mqtt_messenger::ClientConfig;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    write!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_from_valid_toml() {
    let temp_file = write_config(
        r#"
[mqtt]
address = "broker.internal:1884"
username = "svc-meter"
password = "hunter2"
connection_timeout = "3s"
keepalive = "1m"
max_reconnect_interval = "2m30s"
ping_timeout = "1500ms"
write_timeout = "10"

[log]
level = "debug"
format = "pretty"
file = "stdout"
"#,
    );

    let config = MessengerConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.mqtt.address.host(), "broker.internal");
    assert_eq!(config.mqtt.address.port(), Some(1884));
    assert_eq!(config.mqtt.username(), Some("svc-meter"));
    assert_eq!(config.mqtt.password(), Some("hunter2"));
    assert!(!config.mqtt.tls);
    assert_eq!(config.mqtt.connection_timeout, Duration::from_secs(3));
    assert_eq!(config.mqtt.keepalive, Duration::from_secs(60));
    assert_eq!(config.mqtt.max_reconnect_interval, Duration::from_secs(150));
    assert_eq!(config.mqtt.ping_timeout, Duration::from_millis(1500));
    assert_eq!(config.mqtt.write_timeout, Duration::from_secs(10));
    assert_eq!(config.log.level, "debug");
    assert_eq!(config.log.format, "pretty");
    assert_eq!(config.log.file, "stdout");
}

#[test]
fn test_missing_sections_use_defaults() {
    let temp_file = write_config("[mqtt]\ntls = true\n");

    let config = MessengerConfig::load_from_file(temp_file.path()).unwrap();

    assert!(config.mqtt.tls);
    assert_eq!(config.mqtt.address.host(), "localhost");
    assert_eq!(config.mqtt.connection_timeout, Duration::from_secs(10));
    assert_eq!(config.mqtt.write_timeout, Duration::from_secs(5));
    assert_eq!(config.log, LogSettings::default());
}

#[test]
fn test_loaded_settings_feed_session_factory() {
    let temp_file = write_config(
        r#"
[mqtt]
address = "[::1]"
username = ""
keepalive = "45s"
"#,
    );
    let config = MessengerConfig::load_from_file(temp_file.path()).unwrap();

    let options = build_session_options(&ClientConfig::new("meter"), &config.mqtt).unwrap();

    assert_eq!(options.broker_uri(), "tcp://[::1]:1883");
    assert_eq!(options.keep_alive, Duration::from_secs(45));
    assert_eq!(options.username, None);
}

#[test]
fn test_invalid_duration_is_rejected() {
    let temp_file = write_config("[mqtt]\nkeepalive = \"soon\"\n");

    let result = MessengerConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_address_with_scheme_is_rejected() {
    let temp_file = write_config("[mqtt]\naddress = \"mqtt://broker:1883\"\n");

    let result = MessengerConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_missing_file_is_reported() {
    let result = MessengerConfig::load_from_file(Path::new("/nonexistent/messenger.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}
