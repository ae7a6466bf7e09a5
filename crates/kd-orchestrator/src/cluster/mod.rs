//! Cluster seam
//!
//! Everything the lifecycle subsystem needs from Kubernetes goes through the
//! [`Cluster`] trait. [`KubeCluster`] talks to a real API server; tests plug
//! in an in-memory fake.

mod kubernetes;
pub mod workload;

pub use kubernetes::KubeCluster;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Service};
use std::fmt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use kd_core::KdError;

/// Boxed input stream handed to a remote process
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed output stream receiving a remote process's output
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A bidirectional byte stream to a pod port
pub trait PortStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> PortStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Errors raised by cluster operations
#[derive(Error, Debug)]
pub enum ClusterError {
    /// API server rejected or failed a request
    #[error("cluster API error: {0}")]
    Api(#[from] ::kube::Error),

    /// The named object does not exist
    #[error("{0} not found")]
    NotFound(String),

    /// Exec, attach, log or port-forward stream failure
    #[error("stream failure: {0}")]
    Stream(String),

    /// Local I/O while pumping a remote stream
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ClusterError> for KdError {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::NotFound(what) => KdError::NotFound(what),
            ClusterError::Api(::kube::Error::Api(resp)) if resp.code == 404 => {
                KdError::NotFound(resp.message)
            }
            ClusterError::Api(e) => KdError::Orchestration(e.to_string()),
            ClusterError::Stream(msg) => KdError::Stream(msg),
            ClusterError::Io(e) => KdError::Stream(e.to_string()),
        }
    }
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        match self {
            ClusterError::NotFound(_) => true,
            ClusterError::Api(::kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }
}

/// Labelled object kinds created on behalf of containers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Deployment,
    Service,
    ConfigMap,
}

impl ObjectKind {
    /// Every kind the reaper and bulk deletion sweep
    pub const ALL: [ObjectKind; 3] = [ObjectKind::Deployment, ObjectKind::Service, ObjectKind::ConfigMap];
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectKind::Deployment => write!(f, "deployment"),
            ObjectKind::Service => write!(f, "service"),
            ObjectKind::ConfigMap => write!(f, "configmap"),
        }
    }
}

/// Name and age of a listed cluster object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub name: String,
    pub created: Option<DateTime<Utc>>,
    /// Already marked for deletion
    pub deleting: bool,
}

/// A container inside a pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodTarget {
    pub pod: String,
    pub container: String,
}

impl PodTarget {
    pub fn new(pod: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            pod: pod.into(),
            container: container.into(),
        }
    }
}

impl fmt::Display for PodTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pod, self.container)
    }
}

/// Streams wired to a remote process
///
/// A missing stream is not requested from the cluster. With `tty` set the
/// remote side merges stderr into stdout.
#[derive(Default)]
pub struct ExecIo {
    pub stdin: Option<BoxedReader>,
    pub stdout: Option<BoxedWriter>,
    pub stderr: Option<BoxedWriter>,
    pub tty: bool,
}

impl ExecIo {
    /// No input, output discarded
    pub fn silent() -> Self {
        Self::default()
    }

    pub fn with_stdin(mut self, stdin: impl AsyncRead + Send + Unpin + 'static) -> Self {
        self.stdin = Some(Box::new(stdin));
        self
    }

    pub fn with_stdout(mut self, stdout: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stdout = Some(Box::new(stdout));
        self
    }

    pub fn with_stderr(mut self, stderr: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stderr = Some(Box::new(stderr));
        self
    }

    pub fn tty(mut self, tty: bool) -> Self {
        self.tty = tty;
        self
    }
}

impl fmt::Debug for ExecIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecIo")
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .field("tty", &self.tty)
            .finish()
    }
}

/// Operations the lifecycle subsystem performs against the cluster
///
/// All objects live in one namespace chosen when the implementation is
/// constructed.
#[async_trait]
pub trait Cluster: Send + Sync {
    async fn create_deployment(&self, deployment: &Deployment) -> Result<(), ClusterError>;

    async fn get_deployment(&self, name: &str) -> Result<Deployment, ClusterError>;

    /// Pods matching a label selector such as `kubedock.containerid=abc`
    async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>, ClusterError>;

    async fn create_service(&self, service: &Service) -> Result<(), ClusterError>;

    async fn list_objects(&self, kind: ObjectKind, selector: &str) -> Result<Vec<ObjectSummary>, ClusterError>;

    /// Request deletion; returns without waiting for it to finish
    async fn delete_object(&self, kind: ObjectKind, name: &str) -> Result<(), ClusterError>;

    /// Resolve once the object is gone from the cluster
    async fn await_deleted(&self, kind: ObjectKind, name: &str) -> Result<(), ClusterError>;

    /// Run `command` in a container and return its exit code
    async fn exec(&self, target: &PodTarget, command: Vec<String>, io: ExecIo) -> Result<i32, ClusterError>;

    /// Attach to the main process of a container until it detaches or exits
    async fn attach(&self, target: &PodTarget, io: ExecIo) -> Result<(), ClusterError>;

    /// Copy a container's log to `out`, following it when asked
    async fn logs(&self, target: &PodTarget, follow: bool, out: BoxedWriter) -> Result<(), ClusterError>;

    /// Open a stream to `port` on a pod
    async fn port_forward(&self, pod: &str, port: u16) -> Result<Box<dyn PortStream>, ClusterError>;
}

/// First pod matching `selector` that is not being deleted
pub async fn active_pod(cluster: &dyn Cluster, selector: &str) -> Result<Pod, ClusterError> {
    cluster
        .list_pods(selector)
        .await?
        .into_iter()
        .find(|pod| pod.metadata.deletion_timestamp.is_none())
        .ok_or_else(|| ClusterError::NotFound(format!("pod for {selector}")))
}

/// Name of a pod, empty when unset
pub fn pod_name(pod: &Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        let err: KdError = ClusterError::NotFound("pod".into()).into();
        assert!(err.is_not_found());

        let err: KdError = ClusterError::Stream("closed".into()).into();
        assert!(matches!(err, KdError::Stream(_)));

        let err: KdError = ClusterError::Io(std::io::ErrorKind::BrokenPipe.into()).into();
        assert!(matches!(err, KdError::Stream(_)));
    }

    #[test]
    fn test_api_not_found() {
        let err = ClusterError::Api(::kube::Error::Api(::kube::error::ErrorResponse {
            status: "Failure".into(),
            message: "deployments.apps \"abc\" not found".into(),
            reason: "NotFound".into(),
            code: 404,
        }));
        assert!(err.is_not_found());
        assert!(KdError::from(err).is_not_found());
    }

    #[test]
    fn test_exec_io_debug() {
        let io = ExecIo::silent().with_stdin(tokio::io::empty()).tty(true);
        assert_eq!(
            format!("{io:?}"),
            "ExecIo { stdin: true, stdout: false, stderr: false, tty: true }"
        );
    }
}
