// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 Western Formula Racing

//! Node configuration
//!
//! Everything is environment-driven so the same image runs on the car and
//! at the base; the CLI can override the role. All resource ceilings
//! (batch size, ring age, history, missing set, subscriber queues) are
//! knobs here.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which half of the link this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Car,
    Base,
    Auto,
}

impl FromStr for Role {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "car" => Ok(Self::Car),
            "base" => Ok(Self::Base),
            "auto" => Ok(Self::Auto),
            other => Err(ConfigError::InvalidValue(format!(
                "ROLE must be car, base or auto (got {:?})",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Car => write!(f, "car"),
            Self::Base => write!(f, "base"),
            Self::Auto => write!(f, "auto"),
        }
    }
}

/// Telemetry node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_role")]
    pub role: Role,

    /// IP of the other side of the link.
    #[serde(default = "default_remote_ip")]
    pub remote_ip: String,

    /// Datagram port (telemetry payload).
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,

    /// Reliable retransmission port.
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,

    /// Base-station HTTP API port.
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// External channel name for decoded frame batches.
    #[serde(default = "default_redis_channel")]
    pub redis_channel: String,

    /// FIFO path used when Redis is unreachable.
    #[serde(default = "default_pipe_path")]
    pub pipe_path: PathBuf,

    /// Bus database (JSON signal map); raw records when absent.
    #[serde(default)]
    pub dbc_file: Option<PathBuf>,

    /// Replace the CAN adapter with the simulator.
    #[serde(default)]
    pub simulate: bool,

    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    #[serde(default = "default_batch_max")]
    pub batch_max: usize,

    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,

    #[serde(default = "default_ring_age_secs")]
    pub ring_age_secs: u64,

    #[serde(default = "default_missing_max")]
    pub missing_max: usize,

    /// Sequence-jump distance that re-anchors the receiver.
    /// Defaults to 2 x missing_max when unset.
    #[serde(default)]
    pub resync_threshold: Option<u64>,

    #[serde(default = "default_recovery_period_secs")]
    pub recovery_period_secs: u64,

    /// Newest missing sequences requested per recovery cycle.
    #[serde(default = "default_recovery_batch_max")]
    pub recovery_batch_max: usize,

    #[serde(default = "default_subscriber_queue_max")]
    pub subscriber_queue_max: usize,
}

fn default_role() -> Role {
    Role::Auto
}

fn default_remote_ip() -> String {
    "192.168.1.100".to_string()
}

fn default_udp_port() -> u16 {
    5005
}

fn default_tcp_port() -> u16 {
    5006
}

fn default_http_port() -> u16 {
    8000
}

fn default_redis_url() -> String {
    "redis://localhost:6379/0".to_string()
}

fn default_redis_channel() -> String {
    "can_messages".to_string()
}

fn default_pipe_path() -> PathBuf {
    PathBuf::from("/tmp/can_data_pipe")
}

fn default_history_limit() -> usize {
    1000
}

fn default_batch_max() -> usize {
    20
}

fn default_batch_timeout_ms() -> u64 {
    50
}

fn default_ring_age_secs() -> u64 {
    60
}

fn default_missing_max() -> usize {
    1000
}

fn default_recovery_period_secs() -> u64 {
    10
}

fn default_recovery_batch_max() -> usize {
    100
}

fn default_subscriber_queue_max() -> usize {
    1000
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            role: default_role(),
            remote_ip: default_remote_ip(),
            udp_port: default_udp_port(),
            tcp_port: default_tcp_port(),
            http_port: default_http_port(),
            redis_url: default_redis_url(),
            redis_channel: default_redis_channel(),
            pipe_path: default_pipe_path(),
            dbc_file: None,
            simulate: false,
            history_limit: default_history_limit(),
            batch_max: default_batch_max(),
            batch_timeout_ms: default_batch_timeout_ms(),
            ring_age_secs: default_ring_age_secs(),
            missing_max: default_missing_max(),
            resync_threshold: None,
            recovery_period_secs: default_recovery_period_secs(),
            recovery_batch_max: default_recovery_batch_max(),
            subscriber_queue_max: default_subscriber_queue_max(),
        }
    }
}

impl NodeConfig {
    /// Read configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = get("ROLE") {
            config.role = v.parse()?;
        }
        if let Some(v) = get("REMOTE_IP") {
            config.remote_ip = v;
        }
        if let Some(v) = get("UDP_PORT") {
            config.udp_port = parse_var("UDP_PORT", &v)?;
        }
        if let Some(v) = get("TCP_PORT") {
            config.tcp_port = parse_var("TCP_PORT", &v)?;
        }
        if let Some(v) = get("HTTP_PORT") {
            config.http_port = parse_var("HTTP_PORT", &v)?;
        }
        if let Some(v) = get("REDIS_URL") {
            config.redis_url = v;
        }
        if let Some(v) = get("REDIS_CHANNEL") {
            config.redis_channel = v;
        }
        if let Some(v) = get("PIPE_PATH") {
            config.pipe_path = PathBuf::from(v);
        }
        if let Some(v) = get("DBC_FILE") {
            config.dbc_file = Some(PathBuf::from(v));
        }
        if let Some(v) = get("SIMULATE") {
            config.simulate = matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(v) = get("MESSAGE_HISTORY_LIMIT") {
            config.history_limit = parse_var("MESSAGE_HISTORY_LIMIT", &v)?;
        }
        if let Some(v) = get("BATCH_MAX") {
            config.batch_max = parse_var("BATCH_MAX", &v)?;
        }
        if let Some(v) = get("BATCH_TIMEOUT_MS") {
            config.batch_timeout_ms = parse_var("BATCH_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("RING_AGE_SECS") {
            config.ring_age_secs = parse_var("RING_AGE_SECS", &v)?;
        }
        if let Some(v) = get("MISSING_MAX") {
            config.missing_max = parse_var("MISSING_MAX", &v)?;
        }
        if let Some(v) = get("RESYNC_THRESHOLD") {
            config.resync_threshold = Some(parse_var("RESYNC_THRESHOLD", &v)?);
        }
        if let Some(v) = get("RECOVERY_PERIOD_SECS") {
            config.recovery_period_secs = parse_var("RECOVERY_PERIOD_SECS", &v)?;
        }
        if let Some(v) = get("RECOVERY_BATCH_MAX") {
            config.recovery_batch_max = parse_var("RECOVERY_BATCH_MAX", &v)?;
        }
        if let Some(v) = get("SUBSCRIBER_QUEUE_MAX") {
            config.subscriber_queue_max = parse_var("SUBSCRIBER_QUEUE_MAX", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.udp_port == 0 {
            return Err(ConfigError::InvalidValue("UDP_PORT cannot be 0".into()));
        }
        if self.tcp_port == 0 {
            return Err(ConfigError::InvalidValue("TCP_PORT cannot be 0".into()));
        }
        if self.batch_max == 0 || self.batch_max > usize::from(u16::MAX) {
            return Err(ConfigError::InvalidValue(
                "BATCH_MAX must be between 1 and 65535".into(),
            ));
        }
        if self.history_limit == 0 {
            return Err(ConfigError::InvalidValue(
                "MESSAGE_HISTORY_LIMIT cannot be 0".into(),
            ));
        }
        if self.missing_max == 0 {
            return Err(ConfigError::InvalidValue("MISSING_MAX cannot be 0".into()));
        }
        if self.subscriber_queue_max == 0 {
            return Err(ConfigError::InvalidValue(
                "SUBSCRIBER_QUEUE_MAX cannot be 0".into(),
            ));
        }
        Ok(())
    }

    /// The role this process actually runs. `auto` picks the car side only
    /// when simulation stands in for CAN hardware.
    pub fn resolved_role(&self) -> Role {
        match self.role {
            Role::Auto => {
                if self.simulate {
                    Role::Car
                } else {
                    Role::Base
                }
            }
            role => role,
        }
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn ring_age(&self) -> Duration {
        Duration::from_secs(self.ring_age_secs)
    }

    pub fn recovery_period(&self) -> Duration {
        Duration::from_secs(self.recovery_period_secs)
    }

    pub fn resync_threshold(&self) -> u64 {
        self.resync_threshold
            .unwrap_or(2 * self.missing_max as u64)
    }

    pub fn remote_udp_addr(&self) -> String {
        format!("{}:{}", self.remote_ip, self.udp_port)
    }

    pub fn remote_tcp_addr(&self) -> String {
        format!("{}:{}", self.remote_ip, self.tcp_port)
    }
}

/// Configuration error types.
#[derive(Debug, Clone)]
pub enum ConfigError {
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue(s) => write!(f, "Invalid value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}

fn parse_var<T>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e| {
        ConfigError::InvalidValue(format!("{}={:?}: {}", name, value, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let map: HashMap<&'a str, &'a str> = vars.iter().copied().collect();
        move |name| map.get(name).map(|v| v.to_string())
    }

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.udp_port, 5005);
        assert_eq!(config.tcp_port, 5006);
        assert_eq!(config.batch_max, 20);
        assert_eq!(config.batch_timeout(), Duration::from_millis(50));
        assert_eq!(config.ring_age(), Duration::from_secs(60));
        assert_eq!(config.history_limit, 1000);
        assert_eq!(config.resync_threshold(), 2000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = NodeConfig::from_lookup(lookup(&[
            ("ROLE", "base"),
            ("UDP_PORT", "6005"),
            ("REMOTE_IP", "10.0.0.7"),
            ("MESSAGE_HISTORY_LIMIT", "50"),
            ("SIMULATE", "true"),
            ("RESYNC_THRESHOLD", "77"),
        ]))
        .expect("valid overrides");

        assert_eq!(config.role, Role::Base);
        assert_eq!(config.udp_port, 6005);
        assert_eq!(config.remote_udp_addr(), "10.0.0.7:6005");
        assert_eq!(config.history_limit, 50);
        assert!(config.simulate);
        assert_eq!(config.resync_threshold(), 77);
    }

    #[test]
    fn test_invalid_port_rejected() {
        let err = NodeConfig::from_lookup(lookup(&[("UDP_PORT", "not-a-port")]))
            .expect_err("parse failure surfaces");
        assert!(err.to_string().contains("UDP_PORT"));

        assert!(NodeConfig::from_lookup(lookup(&[("TCP_PORT", "0")])).is_err());
    }

    #[test]
    fn test_invalid_role_rejected() {
        assert!(NodeConfig::from_lookup(lookup(&[("ROLE", "bicycle")])).is_err());
    }

    #[test]
    fn test_role_resolution() {
        let mut config = NodeConfig::default();
        assert_eq!(config.resolved_role(), Role::Base);

        config.simulate = true;
        assert_eq!(config.resolved_role(), Role::Car);

        config.role = Role::Base;
        assert_eq!(config.resolved_role(), Role::Base);

        config.role = Role::Car;
        config.simulate = false;
        assert_eq!(config.resolved_role(), Role::Car);
    }

    #[test]
    fn test_config_json_round_trip() {
        let config = NodeConfig::default();
        let json = serde_json::to_string(&config).expect("serializes");
        let parsed: NodeConfig = serde_json::from_str(&json).expect("parses");
        assert_eq!(parsed.udp_port, config.udp_port);
        assert_eq!(parsed.role, config.role);
    }

    #[test]
    fn test_batch_max_bounds() {
        let mut config = NodeConfig::default();
        config.batch_max = 0;
        assert!(config.validate().is_err());
        config.batch_max = 100_000;
        assert!(config.validate().is_err());
        config.batch_max = 20;
        assert!(config.validate().is_ok());
    }
}
