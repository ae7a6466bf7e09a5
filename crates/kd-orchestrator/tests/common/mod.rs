//! In-memory cluster shared by the integration tests

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateRunning, ContainerStateTerminated, ContainerStateWaiting, ContainerStatus, Pod, PodStatus, Service,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use kd_core::config::DaemonConfig;
use kd_core::traits::{EventBus, ImageInspector, NoImageInspector};
use kd_orchestrator::cluster::{
    BoxedWriter, Cluster, ClusterError, ExecIo, ObjectKind, ObjectSummary, PodTarget, PortStream,
};
use kd_orchestrator::AppContext;

/// How a fake workload behaves once it may start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ready,
    Completed,
    Failing,
    Restarting,
    Never,
}

/// A recorded exec call
#[derive(Debug, Clone)]
pub struct ExecCall {
    pub target: PodTarget,
    pub command: Vec<String>,
    pub stdin: Vec<u8>,
}

#[derive(Debug, Clone)]
struct FakeObject {
    kind: ObjectKind,
    name: String,
    labels: BTreeMap<String, String>,
    created: DateTime<Utc>,
    deleting: bool,
}

#[derive(Default)]
struct State {
    objects: Vec<FakeObject>,
    deployments: BTreeMap<String, Deployment>,
    services: BTreeMap<String, Service>,
    /// Deployment name → released by the setup container
    released: BTreeMap<String, bool>,
    execs: Vec<ExecCall>,
    /// (action, kind, name) in call order
    calls: Vec<(String, ObjectKind, String)>,
}

pub struct FakeCluster {
    state: Mutex<State>,
    outcome: Mutex<Outcome>,
    forward_to: Mutex<Option<SocketAddr>>,
    setup_stuck: AtomicBool,
    reject_services: AtomicBool,
    log: Vec<u8>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            outcome: Mutex::new(Outcome::Ready),
            forward_to: Mutex::new(None),
            setup_stuck: AtomicBool::new(false),
            reject_services: AtomicBool::new(false),
            log: b"line one\nline two\n".to_vec(),
        }
    }

    pub fn with_outcome(self, outcome: Outcome) -> Self {
        *self.outcome.lock().unwrap() = outcome;
        self
    }

    /// Keep the setup container waiting instead of running
    pub fn with_setup_stuck(self) -> Self {
        self.setup_stuck.store(true, Ordering::SeqCst);
        self
    }

    /// Fail every Service creation
    pub fn with_rejected_services(self) -> Self {
        self.reject_services.store(true, Ordering::SeqCst);
        self
    }

    /// Send port-forward streams to `addr`
    pub fn forward_to(&self, addr: SocketAddr) {
        *self.forward_to.lock().unwrap() = Some(addr);
    }

    /// Add a labelled object created `age` ago
    pub fn add_object(&self, kind: ObjectKind, name: &str, age: Duration, deleting: bool) {
        let created = Utc::now() - chrono::Duration::from_std(age).unwrap();
        self.state.lock().unwrap().objects.push(FakeObject {
            kind,
            name: name.to_string(),
            labels: BTreeMap::from([("kubedock".to_string(), "true".to_string())]),
            created,
            deleting,
        });
    }

    pub fn has_object(&self, kind: ObjectKind, name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .objects
            .iter()
            .any(|o| o.kind == kind && o.name == name)
    }

    pub fn deployment(&self, name: &str) -> Option<Deployment> {
        self.state.lock().unwrap().deployments.get(name).cloned()
    }

    pub fn services(&self) -> Vec<Service> {
        self.state.lock().unwrap().services.values().cloned().collect()
    }

    pub fn execs(&self) -> Vec<ExecCall> {
        self.state.lock().unwrap().execs.clone()
    }

    pub fn calls(&self) -> Vec<(String, ObjectKind, String)> {
        self.state.lock().unwrap().calls.clone()
    }

    fn outcome(&self) -> Outcome {
        *self.outcome.lock().unwrap()
    }

    fn release(&self, pod: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(name) = pod.strip_suffix("-pod") {
            state.released.insert(name.to_string(), true);
        }
    }

    fn pod_for(&self, name: &str, deployment: &Deployment) -> Pod {
        let state = self.state.lock().unwrap();
        let released = state.released.get(name).copied().unwrap_or(false);
        let outcome = self.outcome();

        let labels = deployment
            .spec
            .as_ref()
            .and_then(|s| s.template.metadata.as_ref())
            .and_then(|m| m.labels.clone());
        let has_setup = deployment
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|s| s.init_containers.as_ref())
            .is_some_and(|c| !c.is_empty());

        let mut status = PodStatus {
            phase: Some("Pending".into()),
            pod_ip: Some("127.0.0.1".into()),
            ..PodStatus::default()
        };

        if has_setup && !released {
            let setup_state = if self.setup_stuck.load(Ordering::SeqCst) {
                ContainerState {
                    waiting: Some(ContainerStateWaiting {
                        reason: Some("PodInitializing".into()),
                        ..ContainerStateWaiting::default()
                    }),
                    ..ContainerState::default()
                }
            } else {
                ContainerState {
                    running: Some(ContainerStateRunning::default()),
                    ..ContainerState::default()
                }
            };
            status.init_container_statuses = Some(vec![ContainerStatus {
                name: "setup".into(),
                state: Some(setup_state),
                ..ContainerStatus::default()
            }]);
        } else {
            match outcome {
                Outcome::Ready | Outcome::Never => {}
                Outcome::Failing => status.phase = Some("Failed".into()),
                Outcome::Restarting => {
                    status.container_statuses = Some(vec![ContainerStatus {
                        name: "main".into(),
                        restart_count: 2,
                        ..ContainerStatus::default()
                    }]);
                }
                Outcome::Completed => {
                    status.phase = Some("Succeeded".into());
                    status.container_statuses = Some(vec![ContainerStatus {
                        name: "main".into(),
                        state: Some(ContainerState {
                            terminated: Some(ContainerStateTerminated {
                                reason: Some("Completed".into()),
                                ..ContainerStateTerminated::default()
                            }),
                            ..ContainerState::default()
                        }),
                        ..ContainerStatus::default()
                    }]);
                }
            }
        }

        Pod {
            metadata: ObjectMeta {
                name: Some(format!("{name}-pod")),
                labels,
                ..ObjectMeta::default()
            },
            status: Some(status),
            ..Pod::default()
        }
    }

    fn is_ready(&self, name: &str, deployment: &Deployment) -> bool {
        let has_setup = deployment
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|s| s.init_containers.as_ref())
            .is_some_and(|c| !c.is_empty());
        let released = self.state.lock().unwrap().released.get(name).copied().unwrap_or(false);
        self.outcome() == Outcome::Ready && (!has_setup || released)
    }
}

fn matches(selector: &str, labels: &BTreeMap<String, String>) -> bool {
    selector.split(',').all(|term| match term.split_once('=') {
        Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
        None => labels.contains_key(term),
    })
}

#[async_trait]
impl Cluster for FakeCluster {
    async fn create_deployment(&self, deployment: &Deployment) -> Result<(), ClusterError> {
        let name = deployment.metadata.name.clone().unwrap_or_default();
        let mut state = self.state.lock().unwrap();
        state.calls.push(("create".into(), ObjectKind::Deployment, name.clone()));
        state.objects.push(FakeObject {
            kind: ObjectKind::Deployment,
            name: name.clone(),
            labels: deployment.metadata.labels.clone().unwrap_or_default(),
            created: Utc::now(),
            deleting: false,
        });
        state.released.insert(name.clone(), false);
        state.deployments.insert(name, deployment.clone());
        Ok(())
    }

    async fn get_deployment(&self, name: &str) -> Result<Deployment, ClusterError> {
        let mut deployment = self
            .deployment(name)
            .ok_or_else(|| ClusterError::NotFound(format!("deployment {name}")))?;
        let ready = i32::from(self.is_ready(name, &deployment));
        deployment.status = Some(DeploymentStatus {
            ready_replicas: Some(ready),
            ..DeploymentStatus::default()
        });
        Ok(deployment)
    }

    async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>, ClusterError> {
        let deployments: Vec<(String, Deployment)> = self
            .state
            .lock()
            .unwrap()
            .deployments
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(deployments
            .iter()
            .map(|(name, deployment)| self.pod_for(name, deployment))
            .filter(|pod| matches(selector, pod.metadata.labels.as_ref().unwrap_or(&BTreeMap::new())))
            .collect())
    }

    async fn create_service(&self, service: &Service) -> Result<(), ClusterError> {
        let name = service.metadata.name.clone().unwrap_or_default();
        if self.reject_services.load(Ordering::SeqCst) {
            return Err(ClusterError::Stream(format!("service {name} rejected")));
        }
        let mut state = self.state.lock().unwrap();
        state.calls.push(("create".into(), ObjectKind::Service, name.clone()));
        state.objects.push(FakeObject {
            kind: ObjectKind::Service,
            name: name.clone(),
            labels: service.metadata.labels.clone().unwrap_or_default(),
            created: Utc::now(),
            deleting: false,
        });
        state.services.insert(name, service.clone());
        Ok(())
    }

    async fn list_objects(&self, kind: ObjectKind, selector: &str) -> Result<Vec<ObjectSummary>, ClusterError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .objects
            .iter()
            .filter(|o| o.kind == kind && matches(selector, &o.labels))
            .map(|o| ObjectSummary {
                name: o.name.clone(),
                created: Some(o.created),
                deleting: o.deleting,
            })
            .collect())
    }

    async fn delete_object(&self, kind: ObjectKind, name: &str) -> Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(("delete".into(), kind, name.to_string()));

        let before = state.objects.len();
        state.objects.retain(|o| !(o.kind == kind && o.name == name));
        if state.objects.len() == before {
            return Err(ClusterError::NotFound(format!("{kind} {name}")));
        }

        match kind {
            ObjectKind::Deployment => {
                state.deployments.remove(name);
                state.released.remove(name);
            }
            ObjectKind::Service => {
                state.services.remove(name);
            }
            ObjectKind::ConfigMap => {}
        }
        Ok(())
    }

    async fn await_deleted(&self, _kind: ObjectKind, _name: &str) -> Result<(), ClusterError> {
        Ok(())
    }

    async fn exec(&self, target: &PodTarget, command: Vec<String>, io: ExecIo) -> Result<i32, ClusterError> {
        let ExecIo {
            stdin,
            stdout,
            stderr,
            ..
        } = io;

        let mut input = Vec::new();
        if let Some(mut stdin) = stdin {
            stdin.read_to_end(&mut input).await?;
        }
        self.state.lock().unwrap().execs.push(ExecCall {
            target: target.clone(),
            command: command.clone(),
            stdin: input,
        });

        let code = match command.first().map(String::as_str) {
            Some("touch") => {
                self.release(&target.pod);
                0
            }
            Some("echo") => {
                if let Some(mut out) = stdout {
                    out.write_all(format!("{}\n", command[1..].join(" ")).as_bytes()).await?;
                }
                0
            }
            // Extraction into a read-only path fails like tar does.
            Some("tar") if command.last().is_some_and(|path| path.starts_with("/readonly")) => {
                if let Some(mut err) = stderr {
                    err.write_all(b"tar: read-only file system\n").await?;
                }
                2
            }
            Some("fail") => {
                if let Some(mut err) = stderr {
                    err.write_all(b"boom\n").await?;
                }
                2
            }
            _ => 0,
        };
        Ok(code)
    }

    async fn attach(&self, _target: &PodTarget, io: ExecIo) -> Result<(), ClusterError> {
        if let Some(mut out) = io.stdout {
            out.write_all(b"attached\n").await?;
        }
        if let Some(mut stdin) = io.stdin {
            let mut sink = Vec::new();
            stdin.read_to_end(&mut sink).await?;
        }
        Ok(())
    }

    async fn logs(&self, _target: &PodTarget, follow: bool, mut out: BoxedWriter) -> Result<(), ClusterError> {
        out.write_all(&self.log).await?;
        out.flush().await?;
        if follow {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn port_forward(&self, pod: &str, _port: u16) -> Result<Box<dyn PortStream>, ClusterError> {
        let addr = self
            .forward_to
            .lock()
            .unwrap()
            .ok_or_else(|| ClusterError::Stream(format!("no forward target for {pod}")))?;
        Ok(Box::new(TcpStream::connect(addr).await?))
    }
}

/// Config with short timeouts
pub fn test_config() -> DaemonConfig {
    DaemonConfig {
        namespace: "test".to_string(),
        readiness_timeout: Duration::from_secs(3),
        delete_timeout: Duration::from_secs(1),
        init_wait_attempts: 20,
        status_rate: 1000,
        status_burst: 1000,
        ..DaemonConfig::default()
    }
}

/// Context over `cluster` with fast polling
pub fn context(cluster: Arc<FakeCluster>, config: DaemonConfig) -> AppContext {
    AppContext::builder(config, cluster, Arc::new(NoImageInspector))
        .poll_interval(Duration::from_millis(5))
        .build()
}

/// Context whose image inspector is `images`
pub fn context_with_images(cluster: Arc<FakeCluster>, config: DaemonConfig, images: Arc<dyn ImageInspector>) -> AppContext {
    AppContext::builder(config, cluster, images)
        .poll_interval(Duration::from_millis(5))
        .build()
}

pub fn context_with_reap_interval(cluster: Arc<FakeCluster>, config: DaemonConfig, interval: Duration) -> AppContext {
    AppContext::builder(config, cluster, Arc::new(NoImageInspector))
        .poll_interval(Duration::from_millis(5))
        .reap_interval(interval)
        .build()
}

/// Subscribe before acting to capture published events
pub fn subscribe(ctx: &AppContext) -> tokio::sync::broadcast::Receiver<kd_core::traits::Event> {
    EventBus::subscribe(&ctx.events)
}

/// Echo server for tunnel tests
pub async fn echo_server() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

pub fn time_ago(age: Duration) -> Time {
    Time(Utc::now() - chrono::Duration::from_std(age).unwrap())
}
