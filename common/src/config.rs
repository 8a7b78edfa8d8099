use std::{io::ErrorKind, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const MIN_DHT_PERIOD_MS: u64 = 1_000;
const MIN_LIGHT_PERIOD_MS: u64 = 100;
const MAX_DEBOUNCE_MS: u64 = 5_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config json: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub id: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: "esp8266_000000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DhtModel {
    Dht11,
    Dht22,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    pub enable: bool,
    pub pin: u8,
    pub model: DhtModel,
    pub fahrenheit: bool,
    pub period_ms: u64,
    pub mqtt_topic: String,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            enable: false,
            pin: 5,
            model: DhtModel::Dht22,
            fahrenheit: false,
            period_ms: 5_000,
            mqtt_topic: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LightConfig {
    pub enable: bool,
    pub channel: u8,
    pub period_ms: u64,
    pub mqtt_topic: String,
}

impl Default for LightConfig {
    fn default() -> Self {
        Self {
            enable: false,
            channel: 0,
            period_ms: 5_000,
            mqtt_topic: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    pub enable: bool,
    pub pin: u8,
    pub mqtt_topic: String,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            enable: false,
            pin: 4,
            mqtt_topic: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SonoffConfig {
    pub enable: bool,
    pub relay_pin: u8,
    pub led_pin: u8,
    /// The Sonoff Basic LED is wired to VCC: driving the pin low lights it.
    pub led_active_low: bool,
    pub button_pin: u8,
    pub button_debounce_ms: u64,
    pub mqtt_topic: String,
}

impl Default for SonoffConfig {
    fn default() -> Self {
        Self {
            enable: true,
            relay_pin: 12,
            led_pin: 13,
            led_active_low: true,
            button_pin: 0,
            button_debounce_ms: 500,
            mqtt_topic: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub rpc_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "192.168.1.100".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            rpc_port: 80,
        }
    }
}

impl NetworkConfig {
    /// Overrides broker and RPC settings from `MQTT_HOST`, `MQTT_PORT`,
    /// `MQTT_USER`, `MQTT_PASS` and `RPC_PORT`. Unparseable ports are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("MQTT_HOST") {
            self.mqtt_host = host;
        }
        if let Some(port) = lookup("MQTT_PORT").and_then(|value| value.parse().ok()) {
            self.mqtt_port = port;
        }
        if let Some(user) = lookup("MQTT_USER") {
            self.mqtt_user = user;
        }
        if let Some(pass) = lookup("MQTT_PASS") {
            self.mqtt_pass = pass;
        }
        if let Some(port) = lookup("RPC_PORT").and_then(|value| value.parse().ok()) {
            self.rpc_port = port;
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    pub device: DeviceConfig,
    pub dht1: DhtConfig,
    pub light1: LightConfig,
    pub motion1: MotionConfig,
    pub sonoff: SonoffConfig,
    pub network: NetworkConfig,
}

impl BoardConfig {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let mut config = serde_json::from_str::<Self>(raw)?;
        config.sanitize();
        Ok(config)
    }

    /// Loads a config file, falling back to defaults when it does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Self::from_json(&raw),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn sanitize(&mut self) {
        self.dht1.period_ms = self.dht1.period_ms.max(MIN_DHT_PERIOD_MS);
        self.light1.period_ms = self.light1.period_ms.max(MIN_LIGHT_PERIOD_MS);
        self.sonoff.button_debounce_ms = self.sonoff.button_debounce_ms.min(MAX_DEBOUNCE_MS);
        self.dht1.mqtt_topic = self.dht1.mqtt_topic.trim().to_string();
        self.light1.mqtt_topic = self.light1.mqtt_topic.trim().to_string();
        self.motion1.mqtt_topic = self.motion1.mqtt_topic.trim().to_string();
        self.sonoff.mqtt_topic = self.sonoff.mqtt_topic.trim().to_string();
    }
}

/// `Some(topic)` when MQTT publishing is configured for a feature.
pub fn topic(raw: &str) -> Option<&str> {
    if raw.is_empty() {
        None
    } else {
        Some(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = BoardConfig::from_json(
            r#"{"device":{"id":"dev1"},"dht1":{"enable":true,"mqtt_topic":"sensors/dht1"}}"#,
        )
        .unwrap();

        assert_eq!(config.device.id, "dev1");
        assert!(config.dht1.enable);
        assert_eq!(config.dht1.mqtt_topic, "sensors/dht1");
        assert_eq!(config.dht1.period_ms, 5_000);
        assert_eq!(config.dht1.model, DhtModel::Dht22);
        assert!(!config.light1.enable);
        assert_eq!(config.sonoff.relay_pin, 12);
        assert_eq!(config.sonoff.led_pin, 13);
        assert!(config.sonoff.led_active_low);
    }

    #[test]
    fn sanitize_clamps_periods_and_debounce() {
        let config = BoardConfig::from_json(
            r#"{"dht1":{"period_ms":10},"light1":{"period_ms":0},"sonoff":{"button_debounce_ms":60000}}"#,
        )
        .unwrap();

        assert_eq!(config.dht1.period_ms, 1_000);
        assert_eq!(config.light1.period_ms, 100);
        assert_eq!(config.sonoff.button_debounce_ms, 5_000);
    }

    #[test]
    fn whitespace_topic_disables_publishing() {
        let config = BoardConfig::from_json(r#"{"motion1":{"mqtt_topic":"   "}}"#).unwrap();
        assert_eq!(topic(&config.motion1.mqtt_topic), None);
        assert_eq!(topic("sensors/motion1"), Some("sensors/motion1"));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = BoardConfig::load("/nonexistent/board-config.json").unwrap();
        assert_eq!(config.device.id, "esp8266_000000");
    }

    #[test]
    fn env_overrides_replace_network_settings() {
        let mut network = NetworkConfig::default();
        network.apply_overrides(|key| match key {
            "MQTT_HOST" => Some("broker.local".to_string()),
            "MQTT_PORT" => Some("not-a-port".to_string()),
            "RPC_PORT" => Some("8080".to_string()),
            _ => None,
        });

        assert_eq!(network.mqtt_host, "broker.local");
        assert_eq!(network.mqtt_port, 1883);
        assert_eq!(network.rpc_port, 8080);
        assert!(network.mqtt_user.is_empty());
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(matches!(
            BoardConfig::from_json("{not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
