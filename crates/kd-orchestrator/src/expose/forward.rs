//! Port-forward tunnels through the cluster API

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use super::Tunnel;
use crate::cluster::Cluster;

/// Listen on `bind` and forward every connection to `pod:port`
///
/// Each connection opens its own port-forward stream. The listener and all
/// open connections close when `cancel` fires.
pub async fn spawn(
    cluster: Arc<dyn Cluster>,
    bind: SocketAddr,
    pod: String,
    port: u16,
    cancel: CancellationToken,
) -> std::io::Result<Tunnel> {
    let listener = TcpListener::bind(bind).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, %pod, port, "port-forward listening");

    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, %pod, port, "port-forward connection");
                        let cluster = Arc::clone(&cluster);
                        let pod = pod.clone();
                        let cancel = cancel.child_token();
                        tokio::spawn(async move {
                            if let Err(error) = forward(cluster, stream, &pod, port, cancel).await {
                                tracing::warn!(%pod, port, %error, "port-forward connection failed");
                            }
                        });
                    }
                    Err(error) => {
                        tracing::error!(%local_addr, %error, "port-forward accept failed");
                    }
                },
                _ = cancel.cancelled() => {
                    tracing::info!(%local_addr, %pod, port, "port-forward closed");
                    break;
                }
            }
        }
    });

    Ok(Tunnel { local_addr, handle })
}

async fn forward(
    cluster: Arc<dyn Cluster>,
    mut stream: TcpStream,
    pod: &str,
    port: u16,
    cancel: CancellationToken,
) -> kd_core::Result<()> {
    let mut upstream = cluster.port_forward(pod, port).await?;

    tokio::select! {
        copied = tokio::io::copy_bidirectional(&mut stream, &mut upstream) => {
            let (sent, received) = copied?;
            tracing::debug!(pod, port, sent, received, "port-forward connection done");
        }
        _ = cancel.cancelled() => {}
    }
    Ok(())
}
