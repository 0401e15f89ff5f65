// src/config.rs

//! Manages relay configuration: loading, resolving dynamic values, and validation.

use anyhow::{Context, Result, anyhow};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use tracing::warn;

/// Read buffer caps. Reaching a cap is fatal for the connection.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LimitsConfig {
    /// Cap on the upgrade request head of a client that has not handshaken yet.
    #[serde(default = "default_handshake_buffer")]
    pub handshake_buffer: usize,
    /// Cap on buffered WebSocket frames of an upgraded client.
    #[serde(default = "default_frame_buffer")]
    pub frame_buffer: usize,
    /// Cap on buffered commands of a control connection.
    #[serde(default = "default_control_buffer")]
    pub control_buffer: usize,
}

fn default_handshake_buffer() -> usize {
    1024
}
fn default_frame_buffer() -> usize {
    16 * 1024
}
fn default_control_buffer() -> usize {
    64 * 1024
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            handshake_buffer: default_handshake_buffer(),
            frame_buffer: default_frame_buffer(),
            control_buffer: default_control_buffer(),
        }
    }
}

/// Idle timeouts, written as humantime strings such as `"15s"`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TimeoutsConfig {
    /// How long a fresh client may take to complete the upgrade.
    #[serde(with = "humantime_serde", default = "default_handshake_timeout")]
    pub handshake: Duration,
    /// Client idle interval before a keepalive ping. Also the grace period of
    /// a relay-initiated close and the 429 `Retry-After` value.
    #[serde(with = "humantime_serde", default = "default_keepalive")]
    pub keepalive: Duration,
    /// Control connection idle interval before a `0p` probe.
    #[serde(with = "humantime_serde", default = "default_keepalive")]
    pub control_keepalive: Duration,
}

fn default_handshake_timeout() -> Duration {
    Duration::from_secs(1)
}
fn default_keepalive() -> Duration {
    Duration::from_secs(15)
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            handshake: default_handshake_timeout(),
            keepalive: default_keepalive(),
            control_keepalive: default_keepalive(),
        }
    }
}

/// Token verification settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AuthConfig {
    /// How long an issued token stays valid.
    #[serde(with = "humantime_serde", default = "default_token_lifetime")]
    pub token_lifetime: Duration,
    /// How far in the future an issue time may lie before it is refused.
    #[serde(with = "humantime_serde", default = "default_clock_skew")]
    pub clock_skew: Duration,
}

fn default_token_lifetime() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}
fn default_clock_skew() -> Duration {
    Duration::from_secs(60)
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_lifetime: default_token_lifetime(),
            clock_skew: default_clock_skew(),
        }
    }
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MetricsConfig {
    /// If true, an HTTP server will be started to expose Prometheus metrics.
    #[serde(default)]
    pub enabled: bool,
    /// The port for the Prometheus metrics server.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    8879
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

/// A raw representation of the config file before validation and resolution.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default = "default_servers")]
    servers: Vec<String>,
    #[serde(default)]
    domains: Vec<String>,
    #[serde(default = "default_control")]
    control: String,
    #[serde(default = "default_pid_file")]
    pid_file: String,
    secret: Option<String>,
    #[serde(default)]
    origins: Vec<String>,
    #[serde(default)]
    limits: LimitsConfig,
    #[serde(default)]
    timeouts: TimeoutsConfig,
    #[serde(default)]
    auth: AuthConfig,
    #[serde(default)]
    metrics: MetricsConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_servers() -> Vec<String> {
    vec!["tcp://127.0.0.1:8080".to_string()]
}
fn default_control() -> String {
    "unix:///tmp/wsrelay.sock".to_string()
}
fn default_pid_file() -> String {
    "/tmp/wsrelay.pid".to_string()
}

/// Represents the final, validated, and resolved relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub log_level: String,
    /// Front-end endpoints clients connect to.
    pub servers: Vec<String>,
    /// The address advertised for each server, index for index.
    pub domains: Vec<String>,
    /// The control-plane endpoint.
    pub control: String,
    pub pid_file: String,
    #[serde(skip_serializing)]
    pub secret: String,
    /// Accepted `Origin` header values.
    pub origins: Vec<String>,
    pub limits: LimitsConfig,
    pub timeouts: TimeoutsConfig,
    pub auth: AuthConfig,
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        let servers = default_servers();
        Self {
            log_level: default_log_level(),
            domains: servers.clone(),
            servers,
            control: default_control(),
            pid_file: default_pid_file(),
            secret: random_secret(),
            origins: Vec::new(),
            limits: LimitsConfig::default(),
            timeouts: TimeoutsConfig::default(),
            auth: AuthConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid config file '{path}'"))
    }

    /// Parses, resolves and validates configuration from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let raw_config: RawConfig =
            toml::from_str(contents).context("Failed to parse TOML configuration")?;

        let secret = match raw_config.secret {
            Some(secret) if !secret.is_empty() => secret,
            _ => {
                warn!(
                    "No secret configured; using a random one. Tokens issued by backends will not verify."
                );
                random_secret()
            }
        };

        // Servers without an advertised domain advertise their own endpoint.
        let mut domains = raw_config.domains;
        if domains.len() > raw_config.servers.len() {
            return Err(anyhow!(
                "{} domains configured for {} servers",
                domains.len(),
                raw_config.servers.len()
            ));
        }
        domains.extend(raw_config.servers.iter().skip(domains.len()).cloned());

        let config = Config {
            log_level: raw_config.log_level,
            servers: raw_config.servers,
            domains,
            control: raw_config.control,
            pid_file: raw_config.pid_file,
            secret,
            origins: raw_config.origins,
            limits: raw_config.limits,
            timeouts: raw_config.timeouts,
            auth: raw_config.auth,
            metrics: raw_config.metrics,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration to ensure logical consistency.
    fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(anyhow!("at least one server endpoint is required"));
        }
        if self.servers.iter().any(|s| s.trim().is_empty()) {
            return Err(anyhow!("server endpoints cannot be empty"));
        }
        if self.control.trim().is_empty() {
            return Err(anyhow!("control endpoint cannot be empty"));
        }
        if self.servers.contains(&self.control) {
            return Err(anyhow!(
                "control endpoint '{}' is also listed as a server",
                self.control
            ));
        }
        if self.pid_file.trim().is_empty() {
            return Err(anyhow!("pid_file cannot be empty"));
        }

        let limits = &self.limits;
        if limits.handshake_buffer == 0 || limits.frame_buffer == 0 || limits.control_buffer == 0 {
            return Err(anyhow!("buffer limits cannot be 0"));
        }
        if limits.handshake_buffer > limits.frame_buffer {
            return Err(anyhow!(
                "limits.handshake_buffer ({}) cannot exceed limits.frame_buffer ({})",
                limits.handshake_buffer,
                limits.frame_buffer
            ));
        }

        let timeouts = &self.timeouts;
        if timeouts.handshake.is_zero()
            || timeouts.keepalive.is_zero()
            || timeouts.control_keepalive.is_zero()
        {
            return Err(anyhow!("timeouts cannot be 0"));
        }
        if self.auth.token_lifetime.is_zero() {
            return Err(anyhow!("auth.token_lifetime cannot be 0"));
        }

        if self.origins.is_empty() {
            warn!("No origins configured; every client handshake will be refused.");
        }

        if self.metrics.enabled && self.metrics.port == 0 {
            return Err(anyhow!("metrics.port cannot be 0"));
        }
        Ok(())
    }
}

fn random_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
