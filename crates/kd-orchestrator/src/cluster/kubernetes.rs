//! Kubernetes-backed [`Cluster`]

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, AttachParams, AttachedProcess, DeleteParams, ListParams, LogParams, PostParams};
use kube::runtime::wait::{await_condition, conditions};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::task::JoinHandle;

use super::{BoxedReader, BoxedWriter, Cluster, ClusterError, ExecIo, ObjectKind, ObjectSummary, PodTarget, PortStream};

/// Reason carried by the exec status cause holding the exit code
const EXIT_CODE_REASON: &str = "ExitCode";

/// Cluster access through the Kubernetes API, scoped to one namespace
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    namespace: String,
}

impl KubeCluster {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    /// Connect using the in-cluster config or the local kubeconfig
    pub async fn connect(namespace: impl Into<String>) -> Result<Self, ClusterError> {
        let client = Client::try_default().await?;
        Ok(Self::new(client, namespace))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        self.api()
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn create_deployment(&self, deployment: &Deployment) -> Result<(), ClusterError> {
        self.api::<Deployment>()
            .create(&PostParams::default(), deployment)
            .await?;
        Ok(())
    }

    async fn get_deployment(&self, name: &str) -> Result<Deployment, ClusterError> {
        Ok(self.api::<Deployment>().get(name).await?)
    }

    async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>, ClusterError> {
        let pods = self.pods().list(&ListParams::default().labels(selector)).await?;
        Ok(pods.items)
    }

    async fn create_service(&self, service: &Service) -> Result<(), ClusterError> {
        self.api::<Service>()
            .create(&PostParams::default(), service)
            .await?;
        Ok(())
    }

    async fn list_objects(&self, kind: ObjectKind, selector: &str) -> Result<Vec<ObjectSummary>, ClusterError> {
        match kind {
            ObjectKind::Deployment => summaries(self.api::<Deployment>(), selector).await,
            ObjectKind::Service => summaries(self.api::<Service>(), selector).await,
            ObjectKind::ConfigMap => summaries(self.api::<ConfigMap>(), selector).await,
        }
    }

    async fn delete_object(&self, kind: ObjectKind, name: &str) -> Result<(), ClusterError> {
        let params = DeleteParams::background();
        match kind {
            ObjectKind::Deployment => {
                self.api::<Deployment>().delete(name, &params).await?;
            }
            ObjectKind::Service => {
                self.api::<Service>().delete(name, &params).await?;
            }
            ObjectKind::ConfigMap => {
                self.api::<ConfigMap>().delete(name, &params).await?;
            }
        }
        tracing::debug!(%kind, name, "delete requested");
        Ok(())
    }

    async fn await_deleted(&self, kind: ObjectKind, name: &str) -> Result<(), ClusterError> {
        match kind {
            ObjectKind::Deployment => await_gone(self.api::<Deployment>(), name).await,
            ObjectKind::Service => await_gone(self.api::<Service>(), name).await,
            ObjectKind::ConfigMap => await_gone(self.api::<ConfigMap>(), name).await,
        }
    }

    async fn exec(&self, target: &PodTarget, command: Vec<String>, io: ExecIo) -> Result<i32, ClusterError> {
        tracing::debug!(%target, ?command, ?io, "exec");
        let params = attach_params(target, &io);
        let mut process = self.pods().exec(&target.pod, command, &params).await?;

        let status = process.take_status();
        let ExecIo { stdin, stdout, stderr, .. } = io;
        let feeder = feed_stdin(&mut process, stdin);
        let drained = drain_output(&mut process, stdout, stderr).await;

        let status = match status {
            Some(status) => status.await,
            None => None,
        };
        if let Some(feeder) = feeder {
            feeder.abort();
        }
        if let Err(error) = process.join().await {
            tracing::debug!(%target, %error, "exec session ended with error");
        }

        drained?;
        exit_code(status.as_ref())
    }

    async fn attach(&self, target: &PodTarget, io: ExecIo) -> Result<(), ClusterError> {
        tracing::debug!(%target, ?io, "attach");
        let params = attach_params(target, &io);
        let mut process = self.pods().attach(&target.pod, &params).await?;

        let ExecIo { stdin, stdout, stderr, .. } = io;
        let feeder = feed_stdin(&mut process, stdin);
        let drained = drain_output(&mut process, stdout, stderr).await;

        if let Some(feeder) = feeder {
            feeder.abort();
        }
        if let Err(error) = process.join().await {
            tracing::debug!(%target, %error, "attach session ended with error");
        }
        drained
    }

    async fn logs(&self, target: &PodTarget, follow: bool, mut out: BoxedWriter) -> Result<(), ClusterError> {
        use futures::AsyncReadExt as _;

        let params = LogParams {
            container: Some(target.container.clone()),
            follow,
            ..LogParams::default()
        };
        let reader = self.pods().log_stream(&target.pod, &params).await?;
        let mut reader = Box::pin(reader);

        let mut chunk = vec![0u8; 8 * 1024];
        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            out.write_all(&chunk[..n]).await?;
        }
        out.flush().await?;
        Ok(())
    }

    async fn port_forward(&self, pod: &str, port: u16) -> Result<Box<dyn PortStream>, ClusterError> {
        let mut forwarder = self.pods().portforward(pod, &[port]).await?;
        let stream = forwarder
            .take_stream(port)
            .ok_or_else(|| ClusterError::Stream(format!("no stream for {pod}:{port}")))?;

        let pod = pod.to_string();
        tokio::spawn(async move {
            if let Err(error) = forwarder.join().await {
                tracing::debug!(%pod, port, %error, "port-forward ended with error");
            }
        });

        Ok(Box::new(stream))
    }
}

async fn summaries<K>(api: Api<K>, selector: &str) -> Result<Vec<ObjectSummary>, ClusterError>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let list = api.list(&ListParams::default().labels(selector)).await?;
    Ok(list
        .items
        .iter()
        .map(|object| {
            let meta = object.meta();
            ObjectSummary {
                name: meta.name.clone().unwrap_or_default(),
                created: meta.creation_timestamp.as_ref().map(|t| t.0),
                deleting: meta.deletion_timestamp.is_some(),
            }
        })
        .collect())
}

async fn await_gone<K>(api: Api<K>, name: &str) -> Result<(), ClusterError>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    let uid = match api.get_opt(name).await? {
        Some(object) => object.meta().uid.clone().unwrap_or_default(),
        None => return Ok(()),
    };

    await_condition(api, name, conditions::is_deleted(&uid))
        .await
        .map_err(|e| ClusterError::Stream(format!("watching {name}: {e}")))?;
    Ok(())
}

fn attach_params(target: &PodTarget, io: &ExecIo) -> AttachParams {
    AttachParams::default()
        .container(target.container.clone())
        .stdin(io.stdin.is_some())
        .stdout(true)
        .stderr(!io.tty)
        .tty(io.tty)
}

/// Copy `stdin` into the remote process
///
/// The remote writer is held open after the copy: closing it ends the
/// session before the exit status arrives. The caller aborts the task once
/// the process is done.
fn feed_stdin(process: &mut AttachedProcess, stdin: Option<BoxedReader>) -> Option<JoinHandle<()>> {
    let (mut local, mut remote) = match (stdin, process.stdin()) {
        (Some(local), Some(remote)) => (local, remote),
        _ => return None,
    };

    Some(tokio::spawn(async move {
        if let Err(error) = tokio::io::copy(&mut local, &mut remote).await {
            tracing::debug!(%error, "stdin copy ended with error");
        }
        std::future::pending::<()>().await;
        drop(remote);
    }))
}

/// Copy remote stdout and stderr out until both end
async fn drain_output(
    process: &mut AttachedProcess,
    stdout: Option<BoxedWriter>,
    stderr: Option<BoxedWriter>,
) -> Result<(), ClusterError> {
    let remote_stdout = process.stdout();
    let remote_stderr = process.stderr();
    tokio::try_join!(drain(remote_stdout, stdout), drain(remote_stderr, stderr))?;
    Ok(())
}

async fn drain<R>(remote: Option<R>, local: Option<BoxedWriter>) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    match (remote, local) {
        (Some(mut remote), Some(mut local)) => {
            tokio::io::copy(&mut remote, &mut local).await?;
            local.flush().await?;
        }
        (Some(mut remote), None) => {
            tokio::io::copy(&mut remote, &mut tokio::io::sink()).await?;
        }
        (None, _) => {}
    }
    Ok(())
}

/// Exit code reported in an exec status
///
/// A session that closed without a status is an error, never a success.
fn exit_code(status: Option<&Status>) -> Result<i32, ClusterError> {
    let status = status.ok_or_else(|| ClusterError::Stream("exec status not received".to_string()))?;
    if status.status.as_deref() == Some("Success") {
        return Ok(0);
    }

    Ok(status
        .details
        .as_ref()
        .and_then(|details| details.causes.as_ref())
        .into_iter()
        .flatten()
        .find(|cause| cause.reason.as_deref() == Some(EXIT_CODE_REASON))
        .and_then(|cause| cause.message.as_deref())
        .and_then(|message| message.parse().ok())
        .unwrap_or(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{StatusCause, StatusDetails};
    use kd_core::KdError;

    fn failure(causes: Vec<StatusCause>) -> Status {
        Status {
            status: Some("Failure".into()),
            details: Some(StatusDetails {
                causes: Some(causes),
                ..StatusDetails::default()
            }),
            ..Status::default()
        }
    }

    #[test]
    fn test_exit_code_success() {
        let status = Status {
            status: Some("Success".into()),
            ..Status::default()
        };
        assert_eq!(exit_code(Some(&status)).unwrap(), 0);
    }

    #[test]
    fn test_missing_status_is_an_error() {
        let err = exit_code(None).unwrap_err();
        assert!(matches!(err, ClusterError::Stream(_)));
        assert!(matches!(KdError::from(err), KdError::Stream(_)));
    }

    #[test]
    fn test_exit_code_from_cause() {
        let status = failure(vec![StatusCause {
            reason: Some("ExitCode".into()),
            message: Some("42".into()),
            ..StatusCause::default()
        }]);
        assert_eq!(exit_code(Some(&status)).unwrap(), 42);
    }

    #[test]
    fn test_exit_code_without_cause() {
        assert_eq!(exit_code(Some(&failure(Vec::new()))).unwrap(), 1);
    }

    #[test]
    fn test_attach_params_follow_tty() {
        let target = PodTarget::new("abc", "main");
        let params = attach_params(&target, &ExecIo::silent().tty(true));
        assert!(params.tty);
        assert!(!params.stderr);
        assert!(!params.stdin);
        assert_eq!(params.container.as_deref(), Some("main"));
    }
}
