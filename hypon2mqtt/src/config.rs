use std::str::FromStr;
use std::time::Duration;
use std::{env, fs};

use serde_derive::Deserialize;
use thiserror::Error;

use crate::collector::DEFAULT_AUTH_RETRIES;
use crate::mqtt_config::MqttConfig;
use crate::session::Credentials;

pub const DEFAULT_HTTP_URL: &str = "https://api.hypon.cloud/v2";
pub const DEFAULT_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("toml config unparsable: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value {value:?} for {key}")]
    InvalidEnv { key: String, value: String },
    #[error("http_url must start with http:// or https://, got {0:?}")]
    HttpUrl(String),
    #[error("http_interval must be positive")]
    Interval,
    #[error("http_timeout must be positive")]
    Timeout,
    #[error("mqtt_port must be between 1 and 65535")]
    Port,
    #[error("mqtt broker host must not be empty")]
    BrokerHost,
    #[error("mqtt_topic must not be empty and cannot start with '$', got {0:?}")]
    Topic(String),
    #[error("system_ids must be a non-empty list")]
    SystemIds,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub http_url: String,
    pub api_username: Option<String>,
    pub api_password: Option<String>,
    pub system_ids: Vec<String>,
    // older configuration files name a single plant
    system_id: Option<String>,
    pub http_interval: u64,
    pub http_timeout: u64,
    pub verify_ssl: bool,
    pub auth_retries: u32,
    pub mqtt: MqttConfig,
    pub mqtt_topic: String,
    pub mqtt_availability_topic: Option<String>,
    pub ha_discovery_enabled: bool,
    pub ha_discovery_prefix: String,
    pub device_name: String,
    /// Fetch as usual but only log what would be published.
    pub dry_run: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_url: DEFAULT_HTTP_URL.to_string(),
            api_username: None,
            api_password: None,
            system_ids: Vec::new(),
            system_id: None,
            http_interval: DEFAULT_INTERVAL_SECS,
            http_timeout: DEFAULT_TIMEOUT_SECS,
            verify_ssl: true,
            auth_retries: DEFAULT_AUTH_RETRIES,
            mqtt: MqttConfig {
                host: "localhost".to_string(),
                ..MqttConfig::default()
            },
            mqtt_topic: "hypon".to_string(),
            mqtt_availability_topic: None,
            ha_discovery_enabled: false,
            ha_discovery_prefix: "homeassistant".to_string(),
            device_name: "Hypon Inverter".to_string(),
            dry_run: false,
        }
    }
}

impl Config {
    /// Reads `path`, applies the environment on top and validates the result.
    pub fn load(path: &str) -> Result<Config, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        let mut config = Config::from_toml(&contents)?;
        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration from the environment alone, for setups without a file.
    pub fn from_env() -> Result<Config, ConfigError> {
        let mut config = Config::default();
        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Config, ConfigError> {
        let mut config: Config = toml::from_str(contents)?;
        if let Some(system_id) = config.system_id.take() {
            if config.system_ids.is_empty() {
                config.system_ids.push(system_id);
            }
        }
        Ok(config)
    }

    /// Overwrites values for which `lookup` yields an environment variable.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let string = |key: &str, target: &mut String| {
            if let Some(value) = lookup(key) {
                *target = value;
            }
        };
        string("HTTP_URL", &mut self.http_url);
        string("MQTT_BROKER", &mut self.mqtt.host);
        string("MQTT_TOPIC", &mut self.mqtt_topic);
        string("HA_DISCOVERY_PREFIX", &mut self.ha_discovery_prefix);
        string("DEVICE_NAME", &mut self.device_name);

        let optional = |key: &str, target: &mut Option<String>| {
            if let Some(value) = lookup(key) {
                *target = Some(value);
            }
        };
        optional("API_USERNAME", &mut self.api_username);
        optional("API_PASSWORD", &mut self.api_password);
        optional("MQTT_USERNAME", &mut self.mqtt.username);
        optional("MQTT_PASSWORD", &mut self.mqtt.password);
        optional("MQTT_CLIENT_ID", &mut self.mqtt.client_id);
        optional("MQTT_CA_PATH", &mut self.mqtt.ca_path);
        optional("MQTT_AVAILABILITY_TOPIC", &mut self.mqtt_availability_topic);

        if let Some(ids) = lookup("SYSTEM_ID") {
            self.system_ids = ids
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(value) = parsed::<u64, _>(&lookup, "HTTP_INTERVAL")? {
            self.http_interval = value;
        }
        if let Some(value) = parsed::<u64, _>(&lookup, "HTTP_TIMEOUT")? {
            self.http_timeout = value;
        }
        if let Some(value) = parsed::<u32, _>(&lookup, "AUTH_RETRIES")? {
            self.auth_retries = value;
        }
        if let Some(value) = parsed::<u16, _>(&lookup, "MQTT_PORT")? {
            self.mqtt.port = Some(value);
        }
        if let Some(value) = flag(&lookup, "VERIFY_SSL") {
            self.verify_ssl = value;
        }
        if let Some(value) = flag(&lookup, "MQTT_TLS_ENABLED") {
            self.mqtt.tls = Some(value);
        }
        if let Some(value) = flag(&lookup, "MQTT_TLS_INSECURE") {
            self.mqtt.tls_insecure = value;
        }
        if let Some(value) = flag(&lookup, "HA_DISCOVERY_ENABLED") {
            self.ha_discovery_enabled = value;
        }
        if let Some(value) = flag(&lookup, "DRY_RUN") {
            self.dry_run = value;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.http_url.starts_with("http://") || self.http_url.starts_with("https://")) {
            return Err(ConfigError::HttpUrl(self.http_url.clone()));
        }
        if self.http_interval == 0 {
            return Err(ConfigError::Interval);
        }
        if self.http_timeout == 0 {
            return Err(ConfigError::Timeout);
        }
        if self.mqtt.port() == 0 {
            return Err(ConfigError::Port);
        }
        if self.mqtt.host.is_empty() {
            return Err(ConfigError::BrokerHost);
        }
        if self.mqtt_topic.is_empty() || self.mqtt_topic.starts_with('$') {
            return Err(ConfigError::Topic(self.mqtt_topic.clone()));
        }
        if self.system_ids.is_empty() {
            return Err(ConfigError::SystemIds);
        }
        Ok(())
    }

    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.api_username, &self.api_password) {
            (Some(username), Some(password)) if !username.is_empty() => Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }

    pub fn availability_topic(&self) -> String {
        self.mqtt_availability_topic
            .clone()
            .unwrap_or_else(|| format!("{}/status", self.mqtt_topic))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout)
    }
}

fn parsed<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                key: key.to_string(),
                value,
            }),
    }
}

fn flag<F>(lookup: &F, key: &str) -> Option<bool>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).map(|value| matches!(value.to_lowercase().as_str(), "true" | "1" | "t" | "yes"))
}
