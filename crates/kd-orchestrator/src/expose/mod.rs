//! Port exposure: alias Services plus optional local tunnels

pub mod forward;
pub mod proxy;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::task::JoinHandle;

use kd_core::config::{DaemonConfig, ExposeStrategy};
use kd_core::names::{service_ports, valid_aliases};
use kd_core::{Container, KdError, Result};

use crate::cluster::{active_pod, pod_name, workload, Cluster};

/// A running tunnel task
#[derive(Debug)]
pub struct Tunnel {
    /// Address the tunnel listens on
    pub local_addr: SocketAddr,
    pub handle: JoinHandle<()>,
}

/// Makes a running container's ports reachable
pub struct PortExposer {
    cluster: Arc<dyn Cluster>,
    config: DaemonConfig,
}

impl PortExposer {
    pub fn new(cluster: Arc<dyn Cluster>, config: DaemonConfig) -> Self {
        Self { cluster, config }
    }

    /// Create alias Services and start tunnels for `container.mapped_ports`
    ///
    /// Service creation failures are returned; tunnels that cannot start are
    /// logged and skipped.
    pub async fn expose(&self, container: &mut Container) -> Result<Vec<Tunnel>> {
        self.create_services(container).await?;

        match self.config.expose {
            ExposeStrategy::None => Ok(Vec::new()),
            ExposeStrategy::PortForward => self.port_forward(container).await,
            ExposeStrategy::ReverseProxy => self.reverse_proxy(container).await,
        }
    }

    /// One Service per valid alias over the computed port set
    pub async fn create_services(&self, container: &mut Container) -> Result<usize> {
        let ports = service_ports(container);
        container.host_ports = ports.iter().map(|(src, dst)| (*dst, *src)).collect();

        if ports.is_empty() {
            if !container.network_aliases.is_empty() {
                tracing::info!(
                    id = %container.short_id(),
                    aliases = ?container.network_aliases,
                    "no ports to expose, ignoring network aliases"
                );
            }
            return Ok(0);
        }

        let services = workload::services(container, &self.config.namespace, &ports);
        for service in &services {
            self.cluster.create_service(service).await?;
            tracing::debug!(id = %container.short_id(), service = ?service.metadata.name, "service created");
        }

        if !services.is_empty() {
            tracing::info!(id = %container.short_id(), aliases = ?valid_aliases(container), "services created");
        }
        Ok(services.len())
    }

    async fn port_forward(&self, container: &Container) -> Result<Vec<Tunnel>> {
        let pod = active_pod(self.cluster.as_ref(), &container.selector()).await?;
        let pod = pod_name(&pod).to_string();

        let mut tunnels = Vec::new();
        for (&port, &local) in &container.mapped_ports {
            let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local);
            let cancel = container.tasks.register();
            match forward::spawn(Arc::clone(&self.cluster), bind, pod.clone(), port, cancel).await {
                Ok(tunnel) => tunnels.push(tunnel),
                Err(error) => {
                    tracing::warn!(id = %container.short_id(), port, local, %error, "could not start port-forward")
                }
            }
        }
        Ok(tunnels)
    }

    async fn reverse_proxy(&self, container: &Container) -> Result<Vec<Tunnel>> {
        let pod = active_pod(self.cluster.as_ref(), &container.selector()).await?;
        let ip: IpAddr = pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.as_deref())
            .ok_or_else(|| KdError::NotFound(format!("ip of pod {}", pod_name(&pod))))?
            .parse()
            .map_err(|e| KdError::Orchestration(format!("pod ip of {}: {e}", pod_name(&pod))))?;

        let mut tunnels = Vec::new();
        for (&port, &local) in &container.mapped_ports {
            let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), local);
            let target = SocketAddr::new(ip, port);
            let cancel = container.tasks.register();
            match proxy::spawn(bind, target, self.config.proxy.clone(), cancel).await {
                Ok(tunnel) => tunnels.push(tunnel),
                Err(error) => {
                    tracing::warn!(id = %container.short_id(), port, local, %error, "could not start reverse proxy")
                }
            }
        }
        Ok(tunnels)
    }
}
