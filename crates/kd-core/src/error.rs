//! Core error types for kubedock

use kd_protocol::ProtocolError;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the container-lifecycle subsystem
#[derive(Error, Debug)]
pub enum KdError {
    /// Configuration error (bad config file, bind spec, port or alias)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Cluster API create/get/delete failure
    #[error("Orchestration error: {0}")]
    Orchestration(String),

    /// Readiness or init-container wait exceeded
    #[error("Timeout: {0}")]
    Timeout(String),

    /// I/O failure during exec, attach, copy or proxy
    #[error("Stream error: {0}")]
    Stream(String),

    /// Missing pod, container or exec record
    #[error("Not found: {0}")]
    NotFound(String),

    /// Stream framing error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl KdError {
    /// Whether this error belongs to the not-found class
    pub fn is_not_found(&self) -> bool {
        matches!(self, KdError::NotFound(_))
    }

    /// Whether this error belongs to the timeout class
    pub fn is_timeout(&self) -> bool {
        matches!(self, KdError::Timeout(_))
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Malformed `source:target[:mode]` bind
    #[error("Invalid bind mount: {0}")]
    InvalidBind(String),

    /// Port spec that does not parse as `port[/protocol]`
    #[error("Invalid port: {0}")]
    InvalidPort(String),

    /// Network alias that is not a lowercase DNS label
    #[error("Invalid network alias: {0}")]
    InvalidAlias(String),
}

/// Result alias used across kubedock crates
pub type Result<T, E = KdError> = std::result::Result<T, E>;
