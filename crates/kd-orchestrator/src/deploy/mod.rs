//! Container lifecycle against the cluster
//!
//! The [`Orchestrator`] turns a stored [`Container`] into a workload, stages
//! its volumes, polls until the workload resolves to a [`DeployState`] and
//! exposes its ports. It also owns every deletion path: single, by age, by
//! marker label and delete-and-wait.

pub mod ports;
pub mod readiness;

pub use ports::PortAllocator;
pub use readiness::{resolve, Resolution};

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::sync::oneshot;

use kd_core::config::DaemonConfig;
use kd_core::time::is_older_than;
use kd_core::traits::{EventAction, EventKind, EventSink, ImageInspector, MetadataStore};
use kd_core::types::{MARKER_LABEL, MARKER_VALUE};
use kd_core::{Container, DeployState, Filters, KdError, Result};

use crate::cluster::{workload, Cluster, ObjectKind};
use crate::expose::PortExposer;
use crate::volume::VolumeStager;

/// Delay between readiness polls
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Selector matching every object kubedock created
pub fn marker_selector() -> String {
    format!("{MARKER_LABEL}={MARKER_VALUE}")
}

/// Drives containers through their lifecycle
pub struct Orchestrator {
    cluster: Arc<dyn Cluster>,
    store: Arc<dyn MetadataStore>,
    events: Arc<dyn EventSink>,
    images: Arc<dyn ImageInspector>,
    config: DaemonConfig,
    limiter: DefaultDirectRateLimiter,
    ports: PortAllocator,
    stager: VolumeStager,
    exposer: PortExposer,
    poll_interval: Duration,
}

impl Orchestrator {
    pub fn new(
        cluster: Arc<dyn Cluster>,
        store: Arc<dyn MetadataStore>,
        events: Arc<dyn EventSink>,
        images: Arc<dyn ImageInspector>,
        config: DaemonConfig,
    ) -> Self {
        let rate = NonZeroU32::new(config.status_rate).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.status_burst).unwrap_or(rate);
        let limiter = RateLimiter::direct(Quota::per_second(rate).allow_burst(burst));

        Self {
            stager: VolumeStager::new(Arc::clone(&cluster), config.init_wait_attempts),
            exposer: PortExposer::new(Arc::clone(&cluster), config.clone()),
            cluster,
            store,
            events,
            images,
            config,
            limiter,
            ports: PortAllocator::new(),
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Override the readiness and init-container poll intervals
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self.stager = VolumeStager::new(Arc::clone(&self.cluster), self.config.init_wait_attempts)
            .with_interval(interval);
        self
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    /// Record a new container; nothing is created in the cluster yet
    pub fn create(&self, mut container: Container) -> Container {
        if container.host_ip.is_empty() {
            container.host_ip = self.config.host_ip.clone();
        }
        self.store.save_container(&container);
        self.events
            .publish(container.id.as_str(), EventKind::Container, EventAction::Create);
        tracing::info!(id = %container.short_id(), image = %container.image, "container created");
        container
    }

    /// Stored containers matching `filters`, oldest first
    pub fn list(&self, filters: &Filters) -> Vec<Container> {
        let mut containers: Vec<Container> = self
            .store
            .containers()
            .into_iter()
            .filter(|container| filters.matches(container))
            .collect();
        containers.sort_by_key(|container| container.created);
        containers
    }

    /// Deploy a stored container and wait until it is running or completed
    ///
    /// A failed deploy is returned as an error after the container is
    /// marked failed.
    pub async fn start(&self, id: &str) -> Result<DeployState> {
        let mut container = self.store.get_container(id)?;
        if container.lifecycle.running {
            return Ok(DeployState::Running);
        }

        match self.deploy(&mut container).await {
            Ok(state) => {
                self.store.save_container(&container);
                Ok(state)
            }
            Err(error) => {
                tracing::warn!(id = %container.short_id(), %error, "start failed");
                container.tasks.cancel_all();
                self.release_ports(&mut container);
                container.lifecycle.mark_failed();
                container.finished = Some(Utc::now());
                self.store.save_container(&container);
                self.events
                    .publish(container.id.as_str(), EventKind::Container, EventAction::Die);
                Err(error)
            }
        }
    }

    async fn deploy(&self, container: &mut Container) -> Result<DeployState> {
        match self.images.exposed_ports(&container.image).await {
            Ok(ports) => container.image_ports = ports,
            Err(error) => {
                tracing::warn!(id = %container.short_id(), image = %container.image, %error, "image inspection failed")
            }
        }

        let deployment = workload::deployment(container, &self.config);
        self.cluster.create_deployment(&deployment).await?;
        tracing::info!(id = %container.short_id(), image = %container.image, "workload created");

        if container.has_binds() {
            // A staging failure leaves the main container blocked; readiness
            // polling reports it.
            if let Err(error) = self.stager.stage(container).await {
                tracing::error!(id = %container.short_id(), %error, "volume staging failed");
            }
        }

        let state = self.wait_ready(container).await?;
        match state {
            DeployState::Running => {
                container.lifecycle.mark_running();
                self.allocate_ports(container)?;
                self.store.save_container(container);
                self.exposer.expose(container).await?;
                self.events
                    .publish(container.id.as_str(), EventKind::Container, EventAction::Start);
            }
            DeployState::Completed => {
                container.lifecycle.mark_completed();
                container.finished = Some(Utc::now());
                self.events
                    .publish(container.id.as_str(), EventKind::Container, EventAction::Start);
                self.events
                    .publish(container.id.as_str(), EventKind::Container, EventAction::Die);
            }
            DeployState::Failed => {}
        }

        tracing::info!(id = %container.short_id(), %state, "deployed");
        Ok(state)
    }

    /// Poll the workload until it resolves or the poll budget runs out
    pub async fn wait_ready(&self, container: &Container) -> Result<DeployState> {
        let name = container.short_id();
        let selector = container.selector();

        for attempt in 0..self.config.readiness_polls() {
            if attempt > 0 {
                tokio::time::sleep(self.poll_interval).await;
            }
            self.limiter.until_ready().await;

            let deployment = self.cluster.get_deployment(name).await?;
            let pods = self.cluster.list_pods(&selector).await?;

            match resolve(&deployment, &pods) {
                Some(Resolution {
                    state: DeployState::Failed,
                    reason,
                }) => {
                    return Err(KdError::Orchestration(
                        reason.unwrap_or_else(|| format!("deploy of {name} failed")),
                    ));
                }
                Some(resolution) => return Ok(resolution.state),
                None => tracing::trace!(id = name, attempt, "not ready yet"),
            }
        }

        Err(KdError::Timeout(format!(
            "{name} not ready after {}s",
            self.config.readiness_timeout.as_secs()
        )))
    }

    fn allocate_ports(&self, container: &mut Container) -> Result<()> {
        self.release_ports(container);
        for spec in container.declared_ports().into_iter().filter(|p| p.is_tcp()) {
            let local = self
                .ports
                .allocate()
                .ok_or_else(|| KdError::Orchestration("no free local ports left".to_string()))?;
            container.mapped_ports.insert(spec.port, local);
        }
        Ok(())
    }

    fn release_ports(&self, container: &mut Container) {
        for (_, local) in std::mem::take(&mut container.mapped_ports) {
            self.ports.release(local);
        }
    }

    /// Stop a container's tasks and remove its workload
    pub async fn stop(&self, id: &str) -> Result<Container> {
        self.halt(id, |container| container.lifecycle.mark_stopped())
            .await
    }

    /// Like [`stop`](Self::stop), recording the container as killed
    pub async fn kill(&self, id: &str) -> Result<Container> {
        self.halt(id, |container| container.lifecycle.mark_killed())
            .await
    }

    async fn halt(&self, id: &str, mark: impl FnOnce(&mut Container)) -> Result<Container> {
        let mut container = self.store.get_container(id)?;
        let was_running = container.lifecycle.running;

        self.teardown(&mut container).await;
        mark(&mut container);
        container.finished = Some(Utc::now());
        self.store.save_container(&container);

        if was_running {
            self.events
                .publish(container.id.as_str(), EventKind::Container, EventAction::Die);
        }
        Ok(container)
    }

    /// Remove a container, its workload and its services
    pub async fn delete(&self, id: &str) -> Result<()> {
        let mut container = self.store.get_container(id)?;
        let was_running = container.lifecycle.running;

        self.teardown(&mut container).await;
        self.delete_services(&container).await;
        self.store.delete_container(&container.id)?;

        if was_running {
            self.events
                .publish(container.id.as_str(), EventKind::Container, EventAction::Die);
        }
        tracing::info!(id = %container.short_id(), "container deleted");
        Ok(())
    }

    /// Delete and recreate the workload of a container
    ///
    /// The new workload is only created once the old one is observed gone
    /// or the delete timeout passed.
    pub async fn restart(&self, id: &str) -> Result<DeployState> {
        let mut container = self.store.get_container(id)?;
        let cancelled = container.tasks.cancel_all();
        tracing::debug!(id = %container.short_id(), cancelled, "restarting");

        let gone = self.delete_and_wait(container.short_id());
        self.delete_services(&container).await;
        // A dropped sender also means the wait is over.
        let _ = gone.await;

        self.release_ports(&mut container);
        container.lifecycle.mark_stopped();
        self.store.save_container(&container);
        self.start(id).await
    }

    /// Tear down a container the reaper evicts; the store record is left to the caller
    pub(crate) async fn evict(&self, container: &mut Container) {
        self.teardown(container).await;
    }

    /// Signal every task of `container`, release its ports and delete its workload
    async fn teardown(&self, container: &mut Container) {
        let cancelled = container.tasks.cancel_all();
        if cancelled > 0 {
            tracing::debug!(id = %container.short_id(), cancelled, "background tasks cancelled");
        }
        self.release_ports(container);

        if let Err(error) = self.delete_workload(container.short_id()).await {
            tracing::warn!(id = %container.short_id(), %error, "workload deletion failed");
        }
    }

    async fn delete_services(&self, container: &Container) {
        let services = match self
            .cluster
            .list_objects(ObjectKind::Service, &container.selector())
            .await
        {
            Ok(services) => services,
            Err(error) => {
                tracing::warn!(id = %container.short_id(), %error, "listing services failed");
                return;
            }
        };

        for service in services {
            if let Err(error) = self.cluster.delete_object(ObjectKind::Service, &service.name).await {
                if !error.is_not_found() {
                    tracing::warn!(id = %container.short_id(), service = %service.name, %error, "service deletion failed");
                }
            }
        }
    }

    /// Delete the workload named `short_id`; a missing workload is fine
    pub async fn delete_workload(&self, short_id: &str) -> Result<()> {
        match self.cluster.delete_object(ObjectKind::Deployment, short_id).await {
            Ok(()) => Ok(()),
            Err(error) if error.is_not_found() => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    /// Delete the workload and signal the returned channel once it is gone
    ///
    /// The channel fires when the cluster reports the deletion or when
    /// `delete_timeout` elapses, whichever comes first.
    pub fn delete_and_wait(&self, short_id: &str) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let cluster = Arc::clone(&self.cluster);
        let name = short_id.to_string();
        let timeout = self.config.delete_timeout;

        tokio::spawn(async move {
            match cluster.delete_object(ObjectKind::Deployment, &name).await {
                Ok(()) => {}
                Err(error) if error.is_not_found() => {
                    let _ = tx.send(());
                    return;
                }
                Err(error) => tracing::warn!(id = %name, %error, "workload deletion failed"),
            }

            tokio::select! {
                watched = cluster.await_deleted(ObjectKind::Deployment, &name) => {
                    if let Err(error) = watched {
                        tracing::warn!(id = %name, %error, "watching workload deletion failed");
                    }
                }
                _ = tokio::time::sleep(timeout) => {
                    tracing::warn!(id = %name, ?timeout, "workload deletion not observed in time");
                }
            }
            let _ = tx.send(());
        });

        rx
    }

    /// Delete labelled objects created more than `age` ago
    ///
    /// Objects already marked for deletion are skipped. Returns how many
    /// deletions were requested.
    pub async fn delete_older_than(&self, age: Duration) -> Result<usize> {
        self.sweep(|object| {
            !object.deleting && object.created.is_some_and(|created| is_older_than(created, age))
        })
        .await
    }

    /// Delete every labelled object regardless of age
    pub async fn delete_all(&self) -> Result<usize> {
        self.sweep(|_| true).await
    }

    async fn sweep(&self, select: impl Fn(&crate::cluster::ObjectSummary) -> bool) -> Result<usize> {
        let selector = marker_selector();
        let mut deleted = 0;

        for kind in ObjectKind::ALL {
            for object in self.cluster.list_objects(kind, &selector).await? {
                if !select(&object) {
                    continue;
                }
                match self.cluster.delete_object(kind, &object.name).await {
                    Ok(()) => {
                        tracing::info!(%kind, name = %object.name, "deleted");
                        deleted += 1;
                    }
                    Err(error) if error.is_not_found() => {}
                    Err(error) => tracing::warn!(%kind, name = %object.name, %error, "deletion failed"),
                }
            }
        }

        Ok(deleted)
    }
}
