//! Deploy-state resolution from a cluster status snapshot

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};

use kd_core::DeployState;

/// Terminated reason of a container that exited with status 0
const COMPLETED_REASON: &str = "Completed";

/// A terminal state derived from one snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub state: DeployState,
    /// Why the deploy failed
    pub reason: Option<String>,
}

impl Resolution {
    fn running() -> Self {
        Self {
            state: DeployState::Running,
            reason: None,
        }
    }

    fn completed() -> Self {
        Self {
            state: DeployState::Completed,
            reason: None,
        }
    }

    fn failed(reason: String) -> Self {
        Self {
            state: DeployState::Failed,
            reason: Some(reason),
        }
    }
}

/// Resolve the deploy state of a workload and its pods
///
/// A ready replica wins over any pod signal. Otherwise pods being deleted
/// are ignored and the rest are aggregated: a failed phase or any restart
/// fails the deploy, then a container terminated as `Completed` completes
/// it. `None` means keep polling.
pub fn resolve(deployment: &Deployment, pods: &[Pod]) -> Option<Resolution> {
    let ready = deployment
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    if ready > 0 {
        return Some(Resolution::running());
    }

    let live: Vec<&Pod> = pods
        .iter()
        .filter(|pod| pod.metadata.deletion_timestamp.is_none())
        .collect();

    for pod in &live {
        let name = pod.metadata.name.as_deref().unwrap_or_default();
        let status = pod.status.as_ref();

        if status.and_then(|s| s.phase.as_deref()) == Some("Failed") {
            let message = status
                .and_then(|s| s.message.clone())
                .unwrap_or_else(|| "no message".to_string());
            return Some(Resolution::failed(format!("pod {name} failed: {message}")));
        }

        if let Some(restarted) = container_statuses(pod).find(|c| c.restart_count > 0) {
            return Some(Resolution::failed(format!(
                "container {} in pod {name} restarted {} time(s)",
                restarted.name, restarted.restart_count
            )));
        }
    }

    live.iter()
        .flat_map(|pod| container_statuses(pod))
        .any(terminated_completed)
        .then(Resolution::completed)
}

fn container_statuses(pod: &Pod) -> impl Iterator<Item = &ContainerStatus> {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .into_iter()
        .flatten()
}

fn terminated_completed(status: &ContainerStatus) -> bool {
    [status.state.as_ref(), status.last_state.as_ref()]
        .into_iter()
        .flatten()
        .filter_map(|state| state.terminated.as_ref())
        .any(|t| t.reason.as_deref() == Some(COMPLETED_REASON))
}
