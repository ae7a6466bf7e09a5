//! Bind-mount staging into a pod
//!
//! The workload's setup init container blocks on a sentinel file. Once it
//! runs, every bind source is packed into a tar archive and extracted into
//! the matching volume through exec; touching the sentinel then lets the
//! main container start.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;

use kd_core::names::SETUP_CONTAINER;
use kd_core::{Container, KdError, Result};

use crate::cluster::workload::{mounts, Mount, DONE_SENTINEL};
use crate::cluster::{pod_name, Cluster, ExecIo, PodTarget};

/// Delay between init-container readiness checks
pub const INIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Copies bind-mount sources into a pod's setup container
pub struct VolumeStager {
    cluster: Arc<dyn Cluster>,
    attempts: u32,
    interval: Duration,
}

impl VolumeStager {
    pub fn new(cluster: Arc<dyn Cluster>, attempts: u32) -> Self {
        Self {
            cluster,
            attempts,
            interval: INIT_POLL_INTERVAL,
        }
    }

    /// Override the init-container poll interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Stage every bind mount of `container` and release the main container
    pub async fn stage(&self, container: &Container) -> Result<()> {
        let mounts = mounts(container);
        if mounts.is_empty() {
            return Ok(());
        }

        let pod = self.wait_for_setup(container).await?;
        let target = PodTarget::new(pod, SETUP_CONTAINER);

        for mount in &mounts {
            self.copy(&target, mount).await?;
            tracing::debug!(id = %container.short_id(), source = %mount.source, target = %mount.target, "volume staged");
        }

        self.run(&target, vec!["touch".to_string(), DONE_SENTINEL.to_string()], ExecIo::silent())
            .await?;
        tracing::info!(id = %container.short_id(), volumes = mounts.len(), "volumes staged");
        Ok(())
    }

    /// Name of the pod whose setup container is running
    async fn wait_for_setup(&self, container: &Container) -> Result<String> {
        let selector = container.selector();

        for _ in 0..self.attempts {
            let pods = self.cluster.list_pods(&selector).await?;
            if let Some(pod) = pods.iter().find(|pod| setup_running(pod)) {
                return Ok(pod_name(pod).to_string());
            }
            tokio::time::sleep(self.interval).await;
        }

        Err(KdError::Timeout(format!(
            "init container of {} did not start",
            container.short_id()
        )))
    }

    async fn copy(&self, target: &PodTarget, mount: &Mount) -> Result<()> {
        let source = mount.source.clone();
        let archive = tokio::task::spawn_blocking(move || pack(Path::new(&source)))
            .await
            .map_err(|e| KdError::Stream(format!("archiving task failed: {e}")))??;

        let command = vec![
            "tar".to_string(),
            "-xf".to_string(),
            "-".to_string(),
            "-C".to_string(),
            mount.target.clone(),
        ];
        let io = ExecIo::silent().with_stdin(std::io::Cursor::new(archive));
        self.run(target, command, io).await
    }

    async fn run(&self, target: &PodTarget, command: Vec<String>, io: ExecIo) -> Result<()> {
        let summary = command.join(" ");
        match self.cluster.exec(target, command, io).await? {
            0 => Ok(()),
            code => Err(KdError::Stream(format!("`{summary}` in {target} exited with {code}"))),
        }
    }
}

fn setup_running(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_none()
        && pod
            .status
            .as_ref()
            .and_then(|s| s.init_container_statuses.as_ref())
            .into_iter()
            .flatten()
            .any(|s| s.name == SETUP_CONTAINER && s.state.as_ref().is_some_and(|st| st.running.is_some()))
}

/// Tar `source`; a directory is archived by its contents, a file by its name
pub fn pack(source: &Path) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);

    if source.is_dir() {
        builder.append_dir_all(".", source)?;
    } else {
        let name = source.file_name().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("bind source {} has no file name", source.display()),
            )
        })?;
        builder.append_path_with_name(source, name)?;
    }

    builder.into_inner()
}
