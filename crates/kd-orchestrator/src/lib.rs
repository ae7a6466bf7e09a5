//! kd-orchestrator: Docker-style containers as Kubernetes workloads
//!
//! The container-lifecycle subsystem of kubedock. It translates containers
//! into workloads and services, derives their deploy state from cluster
//! status, stages bind mounts into pods, exposes pod ports locally, streams
//! exec/attach/log output and reaps old resources.

pub mod cluster;
pub mod deploy;
pub mod exec;
pub mod expose;
pub mod reaper;
pub mod state;
pub mod volume;

pub use cluster::{Cluster, ClusterError, KubeCluster};
pub use deploy::Orchestrator;
pub use reaper::Reaper;
pub use state::AppContext;
