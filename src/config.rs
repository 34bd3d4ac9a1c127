//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `bridge.toml`.
//!     loads configuration from file or falls back to defaults, then lets
//!     environment variables override individual fields.
//!
//! structure:
//!     - BrokerConfig: where the mqtt broker lives and how to keep the session alive.
//!     - TopicsConfig: telemetry topic, command topic and the command literal.
//!     - HttpConfig: bind address and port of the api.
//!     - ReconnectConfig: backoff schedule for the bus session.
//!     - LoggingConfig: log level, format and whether to log every reading.
//!
//! every field has a default, so a config file only needs the parts it changes.
//!
//! ==============================================================================

use anyhow::{anyhow, bail, Context};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{info, warn};

/// floor for broker.max_packet_bytes
const MIN_PACKET_BYTES: usize = 1024;

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    pub broker: BrokerConfig,
    pub topics: TopicsConfig,
    pub http: HttpConfig,
    pub reconnect: ReconnectConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub keep_alive_seconds: u64,
    /// generated per process when unset
    pub client_id: Option<String>,
    /// largest mqtt frame accepted or sent; a bigger telemetry frame drops
    /// the connection (rumqttc rejects it while reading the stream)
    pub max_packet_bytes: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "test.mosquitto.org".to_string(),
            port: 1883,
            keep_alive_seconds: 60,
            client_id: None,
            max_packet_bytes: 256 * 1024,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct TopicsConfig {
    pub telemetry: String,
    pub command: String,
    pub command_payload: String,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            telemetry: "HackViolet/AdamW/sensors".to_string(),
            command: "HackViolet/AdamW/commands".to_string(),
            command_payload: "WATER_NOW".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    pub bind_address: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { bind_address: "0.0.0.0".to_string(), port: 5000 }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// consecutive failures before the session gives up; unlimited when unset
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self { initial_delay_ms: 1_000, max_delay_ms: 30_000, max_attempts: None }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "compact" or "json"
    pub format: String,
    pub show_sensor_data: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: "compact".to_string(), show_sensor_data: true }
    }
}

/// where the loaded configuration came from
#[derive(Debug)]
pub enum ConfigOrigin {
    File(PathBuf),
    /// no usable file; carries one line per candidate that failed to load
    Defaults { skipped: Vec<String> },
}

impl ConfigOrigin {
    /// loading happens before the subscriber exists, so report afterwards
    pub fn log(&self) {
        match self {
            ConfigOrigin::File(path) => info!(path = %path.display(), "configuration loaded"),
            ConfigOrigin::Defaults { skipped } => {
                for reason in skipped {
                    warn!("{}", reason);
                }
                warn!("no config file found, using defaults");
            }
        }
    }
}

impl BridgeConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file {}", path.as_ref().display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).map_err(|e| anyhow!("failed to parse config: {}", e))
    }

    /// Load with default fallback
    ///
    /// `BLOOM_CONFIG` names an explicit file; otherwise config/bridge.toml is
    /// looked up in the working directory and its parent.
    pub fn load_or_default() -> (Self, ConfigOrigin) {
        let paths = match std::env::var_os("BLOOM_CONFIG") {
            Some(path) => vec![PathBuf::from(path)],
            None => vec![
                PathBuf::from("config").join("bridge.toml"),
                PathBuf::from("..").join("config").join("bridge.toml"),
            ],
        };

        let mut skipped = Vec::new();
        for path in paths {
            if !path.exists() {
                continue;
            }
            match Self::load(&path) {
                Ok(config) => return (config, ConfigOrigin::File(path)),
                Err(e) => skipped.push(format!("failed to load {}: {:#}", path.display(), e)),
            }
        }

        (Self::default(), ConfigOrigin::Defaults { skipped })
    }

    /// apply `BLOOM_*` overrides; `lookup` is `std::env::var` in production
    pub fn apply_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("BLOOM_BROKER_HOST") {
            self.broker.host = v;
        }
        if let Some(v) = lookup("BLOOM_BROKER_PORT") {
            self.broker.port = parse_var("BLOOM_BROKER_PORT", &v)?;
        }
        if let Some(v) = lookup("BLOOM_KEEP_ALIVE_SECONDS") {
            self.broker.keep_alive_seconds = parse_var("BLOOM_KEEP_ALIVE_SECONDS", &v)?;
        }
        if let Some(v) = lookup("BLOOM_MAX_PACKET_BYTES") {
            self.broker.max_packet_bytes = parse_var("BLOOM_MAX_PACKET_BYTES", &v)?;
        }
        if let Some(v) = lookup("BLOOM_CLIENT_ID") {
            self.broker.client_id = Some(v);
        }
        if let Some(v) = lookup("BLOOM_TELEMETRY_TOPIC") {
            self.topics.telemetry = v;
        }
        if let Some(v) = lookup("BLOOM_COMMAND_TOPIC") {
            self.topics.command = v;
        }
        if let Some(v) = lookup("BLOOM_HTTP_BIND") {
            self.http.bind_address = v;
        }
        if let Some(v) = lookup("BLOOM_HTTP_PORT") {
            self.http.port = parse_var("BLOOM_HTTP_PORT", &v)?;
        }
        if let Some(v) = lookup("BLOOM_RECONNECT_MAX_ATTEMPTS") {
            self.reconnect.max_attempts = Some(parse_var("BLOOM_RECONNECT_MAX_ATTEMPTS", &v)?);
        }
        if let Some(v) = lookup("BLOOM_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = lookup("BLOOM_LOG_FORMAT") {
            self.logging.format = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.broker.host.trim().is_empty() {
            bail!("broker.host must not be empty");
        }
        if !(1..=u64::from(u16::MAX)).contains(&self.broker.keep_alive_seconds) {
            bail!(
                "broker.keep_alive_seconds must be between 1 and {}, got {}",
                u16::MAX,
                self.broker.keep_alive_seconds
            );
        }
        if self.broker.max_packet_bytes < MIN_PACKET_BYTES {
            bail!(
                "broker.max_packet_bytes must be at least {}, got {}",
                MIN_PACKET_BYTES,
                self.broker.max_packet_bytes
            );
        }
        if self.topics.telemetry.is_empty() || self.topics.command.is_empty() {
            bail!("topics.telemetry and topics.command must not be empty");
        }
        let r = &self.reconnect;
        if r.initial_delay_ms == 0 || r.initial_delay_ms > r.max_delay_ms {
            bail!(
                "reconnect delays must satisfy 0 < initial_delay_ms ({}) <= max_delay_ms ({})",
                r.initial_delay_ms,
                r.max_delay_ms
            );
        }
        Ok(())
    }

    /// Log configuration summary
    pub fn log_summary(&self) {
        info!(
            broker = %format!("{}:{}", self.broker.host, self.broker.port),
            keep_alive_s = self.broker.keep_alive_seconds,
            max_packet_bytes = self.broker.max_packet_bytes,
            telemetry_topic = %self.topics.telemetry,
            command_topic = %self.topics.command,
            http = %format!("{}:{}", self.http.bind_address, self.http.port),
            max_reconnect_attempts = ?self.reconnect.max_attempts,
            "bridge configuration"
        );
    }
}

fn parse_var<T>(name: &str, value: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e| anyhow!("invalid value {:?} for {}: {}", value, name, e))
}
