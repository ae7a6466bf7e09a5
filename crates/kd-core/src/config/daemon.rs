//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::error::ConfigError;

/// How pod ports are made reachable from outside the cluster
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExposeStrategy {
    /// Only Services are created
    #[default]
    None,
    /// Local port-forward tunnels through the API server
    PortForward,
    /// Listen on the wildcard address and dial the pod IP directly
    ReverseProxy,
}

impl fmt::Display for ExposeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExposeStrategy::None => write!(f, "none"),
            ExposeStrategy::PortForward => write!(f, "port-forward"),
            ExposeStrategy::ReverseProxy => write!(f, "reverse-proxy"),
        }
    }
}

impl FromStr for ExposeStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(ExposeStrategy::None),
            "port-forward" => Ok(ExposeStrategy::PortForward),
            "reverse-proxy" => Ok(ExposeStrategy::ReverseProxy),
            other => Err(ConfigError::Invalid(format!(
                "unknown expose strategy '{}' (expected none, port-forward or reverse-proxy)",
                other
            ))),
        }
    }
}

/// Configuration for the kubedock daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Namespace all workloads and services are created in
    pub namespace: String,

    /// Image of the volume-staging init container
    pub init_image: String,

    /// Pull policy for workload containers
    pub image_pull_policy: String,

    /// How long to poll for readiness (one poll per second)
    #[serde(with = "duration_secs")]
    pub readiness_timeout: Duration,

    /// Containers older than this are reaped
    #[serde(with = "duration_secs")]
    pub reaper_max_age: Duration,

    /// How long delete-and-wait waits for the cluster to confirm
    #[serde(with = "duration_secs")]
    pub delete_timeout: Duration,

    /// Address returned to clients for published ports
    pub host_ip: String,

    /// Port exposure strategy
    pub expose: ExposeStrategy,

    /// Status polls allowed per second
    pub status_rate: u32,

    /// Status polls allowed in a burst
    pub status_burst: u32,

    /// Init-container readiness checks before staging gives up (500ms apart)
    pub init_wait_attempts: u32,

    /// Reverse-proxy dialing
    pub proxy: ProxyConfig,

    /// Delete every labelled cluster object when the daemon starts
    pub prune_on_start: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            init_image: "busybox:latest".to_string(),
            image_pull_policy: "IfNotPresent".to_string(),
            readiness_timeout: Duration::from_secs(60),
            reaper_max_age: Duration::from_secs(3600),
            delete_timeout: Duration::from_secs(30),
            host_ip: "127.0.0.1".to_string(),
            expose: ExposeStrategy::None,
            status_rate: 10,
            status_burst: 20,
            init_wait_attempts: 240,
            proxy: ProxyConfig::default(),
            prune_on_start: false,
        }
    }
}

impl DaemonConfig {
    /// Reject values the subsystem cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.is_empty() {
            return Err(ConfigError::MissingField("namespace".to_string()));
        }
        if self.init_image.is_empty() {
            return Err(ConfigError::MissingField("init_image".to_string()));
        }
        if self.readiness_timeout.as_secs() == 0 {
            return Err(ConfigError::Invalid(
                "readiness_timeout must be at least one second".to_string(),
            ));
        }
        if self.status_rate == 0 || self.status_burst == 0 {
            return Err(ConfigError::Invalid(
                "status_rate and status_burst must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Number of one-second readiness polls
    pub fn readiness_polls(&self) -> u64 {
        self.readiness_timeout.as_secs().max(1)
    }
}

/// Reverse-proxy dial retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Dial attempts before giving up on a target
    pub dial_retries: u32,

    /// Delay between dial attempts in milliseconds
    pub dial_interval_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            dial_retries: 30,
            dial_interval_ms: 1000,
        }
    }
}

impl ProxyConfig {
    pub fn dial_interval(&self) -> Duration {
        Duration::from_millis(self.dial_interval_ms)
    }
}
