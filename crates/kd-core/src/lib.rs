//! kd-core: Core types, configuration and collaborator interfaces for kubedock
//!
//! This crate provides the container model, error taxonomy, naming rules and
//! the store/event/image interfaces used by the orchestrator.

pub mod config;
pub mod error;
pub mod filter;
pub mod names;
pub mod tasks;
pub mod time;
pub mod traits;
pub mod types;

pub use error::{ConfigError, KdError, Result};
pub use filter::{Filters, Matcher};
pub use tasks::TaskRegistry;
pub use types::{Container, ContainerId, DeployState, Exec, Lifecycle, PortSpec, Protocol};
