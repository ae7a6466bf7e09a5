//! Core domain types

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;
use crate::tasks::TaskRegistry;

/// Label present on every cluster object kubedock creates
pub const MARKER_LABEL: &str = "kubedock";

/// Value of [`MARKER_LABEL`]
pub const MARKER_VALUE: &str = "true";

/// Label tying a workload, its pods and services to one container
pub const CONTAINER_ID_LABEL: &str = "kubedock.containerid";

/// Annotation carrying the Docker-side container name
pub const CONTAINER_NAME_ANNOTATION: &str = "kubedock.containername";

/// Length of the short id used as cluster object name
pub const SHORT_ID_LEN: usize = 12;

/// Unique identifier for a container (64 hex characters)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId(pub String);

impl ContainerId {
    /// Create a container ID from an existing string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random 64-character hex id
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// Get the raw ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Truncated id used for cluster object names and label values
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(SHORT_ID_LEN) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ContainerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport protocol of a declared port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
            Protocol::Sctp => write!(f, "sctp"),
        }
    }
}

/// A declared port such as `8080/tcp`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortSpec {
    pub port: u16,
    pub protocol: Protocol,
}

impl PortSpec {
    /// A TCP port
    pub fn tcp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Tcp,
        }
    }

    pub fn is_tcp(&self) -> bool {
        self.protocol == Protocol::Tcp
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol)
    }
}

impl FromStr for PortSpec {
    type Err = ConfigError;

    /// Parse `port` or `port/protocol`; the protocol defaults to tcp
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (port, protocol) = match s.split_once('/') {
            Some((port, protocol)) => (port, protocol),
            None => (s, "tcp"),
        };

        let port: u16 = port
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidPort(s.to_string()))?;
        if port == 0 {
            return Err(ConfigError::InvalidPort(s.to_string()));
        }

        let protocol = match protocol.trim().to_ascii_lowercase().as_str() {
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            "sctp" => Protocol::Sctp,
            _ => return Err(ConfigError::InvalidPort(s.to_string())),
        };

        Ok(Self { port, protocol })
    }
}

/// Lifecycle flags of a container
///
/// Running, Stopped and Killed exclude each other. Completed and Failed are
/// terminal markers set next to them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifecycle {
    pub running: bool,
    pub completed: bool,
    pub stopped: bool,
    pub killed: bool,
    pub failed: bool,
}

impl Lifecycle {
    pub fn mark_running(&mut self) {
        *self = Self {
            running: true,
            ..Self::default()
        };
    }

    pub fn mark_stopped(&mut self) {
        self.running = false;
        self.killed = false;
        self.stopped = true;
    }

    pub fn mark_killed(&mut self) {
        self.running = false;
        self.stopped = false;
        self.killed = true;
    }

    pub fn mark_completed(&mut self) {
        self.running = false;
        self.completed = true;
    }

    pub fn mark_failed(&mut self) {
        self.running = false;
        self.failed = true;
    }

    /// Docker-style status string
    pub fn status(&self) -> &'static str {
        if self.running {
            "running"
        } else if self.completed || self.failed || self.stopped || self.killed {
            "exited"
        } else {
            "created"
        }
    }
}

/// Outcome of deploying a container to the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeployState {
    Failed,
    Running,
    Completed,
}

impl fmt::Display for DeployState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeployState::Failed => write!(f, "failed"),
            DeployState::Running => write!(f, "running"),
            DeployState::Completed => write!(f, "completed"),
        }
    }
}

/// A container as seen by Docker clients
///
/// This is the single source of truth for what should exist in the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    pub id: ContainerId,
    pub name: String,
    pub image: String,
    /// Overrides the image entrypoint when not empty
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    /// `KEY=VALUE` entries
    pub env: Vec<String>,
    /// Ports declared by the image
    pub image_ports: BTreeSet<PortSpec>,
    /// Ports declared on the container
    pub exposed_ports: BTreeSet<PortSpec>,
    /// Requested host port per container port; `None` means "same as the container port"
    pub port_bindings: BTreeMap<PortSpec, Option<i32>>,
    /// `source:target[:mode]` entries
    pub binds: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub network_aliases: Vec<String>,
    pub lifecycle: Lifecycle,
    /// Address handed back to clients for published ports
    pub host_ip: String,
    /// Container port → host (service) port
    pub host_ports: BTreeMap<u16, u16>,
    /// Container port → local forwarded port
    pub mapped_ports: BTreeMap<u16, u16>,
    pub created: DateTime<Utc>,
    pub finished: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub tasks: TaskRegistry,
}

impl Container {
    /// Create a new container for `image` with a fresh id
    pub fn new(image: impl Into<String>) -> Self {
        let id = ContainerId::generate();
        Self {
            name: id.short().to_string(),
            id,
            image: image.into(),
            entrypoint: Vec::new(),
            cmd: Vec::new(),
            env: Vec::new(),
            image_ports: BTreeSet::new(),
            exposed_ports: BTreeSet::new(),
            port_bindings: BTreeMap::new(),
            binds: Vec::new(),
            labels: BTreeMap::new(),
            network_aliases: Vec::new(),
            lifecycle: Lifecycle::default(),
            host_ip: "127.0.0.1".to_string(),
            host_ports: BTreeMap::new(),
            mapped_ports: BTreeMap::new(),
            created: Utc::now(),
            finished: None,
            tasks: TaskRegistry::new(),
        }
    }

    /// Short id, also the workload name
    pub fn short_id(&self) -> &str {
        self.id.short()
    }

    /// Label selector matching this container's workload, pods and services
    pub fn selector(&self) -> String {
        format!("{}={}", CONTAINER_ID_LABEL, self.short_id())
    }

    /// Every port declared by image, container or host binding
    pub fn declared_ports(&self) -> BTreeSet<PortSpec> {
        self.image_ports
            .iter()
            .chain(self.exposed_ports.iter())
            .chain(self.port_bindings.keys())
            .copied()
            .collect()
    }

    pub fn has_binds(&self) -> bool {
        !self.binds.is_empty()
    }
}

/// A recorded one-shot command bound to a container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exec {
    pub id: ContainerId,
    pub container_id: ContainerId,
    pub cmd: Vec<String>,
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
    pub tty: bool,
    /// Filled in after the command ran
    pub exit_code: Option<i32>,
    pub created: DateTime<Utc>,
}

impl Exec {
    pub fn new(container_id: ContainerId, cmd: Vec<String>) -> Self {
        Self {
            id: ContainerId::generate(),
            container_id,
            cmd,
            stdin: false,
            stdout: true,
            stderr: true,
            tty: false,
            exit_code: None,
            created: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_id_shape() {
        let id = ContainerId::generate();
        assert_eq!(id.as_str().len(), 64);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id.short().len(), SHORT_ID_LEN);
        assert!(id.as_str().starts_with(id.short()));
    }

    #[test]
    fn test_short_id_of_short_input() {
        assert_eq!(ContainerId::from("abc").short(), "abc");
    }

    #[test]
    fn test_port_spec_parse() {
        assert_eq!("8080".parse::<PortSpec>().unwrap(), PortSpec::tcp(8080));
        let udp: PortSpec = "53/UDP".parse().unwrap();
        assert_eq!(udp.protocol, Protocol::Udp);
        assert_eq!(udp.to_string(), "53/udp");
        assert!("http/tcp".parse::<PortSpec>().is_err());
        assert!("0/tcp".parse::<PortSpec>().is_err());
        assert!("80/quic".parse::<PortSpec>().is_err());
    }

    #[test]
    fn test_lifecycle_flags_exclusive() {
        let mut lifecycle = Lifecycle::default();
        assert_eq!(lifecycle.status(), "created");

        lifecycle.mark_running();
        lifecycle.mark_stopped();
        assert!(!lifecycle.running && lifecycle.stopped);

        lifecycle.mark_killed();
        assert!(!lifecycle.stopped && lifecycle.killed);
        assert_eq!(lifecycle.status(), "exited");

        lifecycle.mark_failed();
        assert!(lifecycle.killed && lifecycle.failed);

        lifecycle.mark_running();
        assert_eq!(lifecycle, Lifecycle { running: true, ..Lifecycle::default() });
    }

    #[test]
    fn test_declared_ports_union() {
        let mut container = Container::new("nginx");
        container.image_ports.insert(PortSpec::tcp(80));
        container.exposed_ports.insert(PortSpec::tcp(80));
        container.exposed_ports.insert(PortSpec::tcp(443));
        container.port_bindings.insert(PortSpec::tcp(9000), Some(19000));

        let ports: Vec<u16> = container.declared_ports().iter().map(|p| p.port).collect();
        assert_eq!(ports, vec![80, 443, 9000]);
        assert_eq!(container.selector(), format!("kubedock.containerid={}", container.short_id()));
    }
}
