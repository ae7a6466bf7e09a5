//! Reverse-proxy tunnels straight to the pod address

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use kd_core::config::ProxyConfig;

use super::Tunnel;

/// Listen on `bind` and proxy every connection to `target`
///
/// Connections are only accepted once `target` answers, so a slow container
/// start does not turn into refused client connections.
pub async fn spawn(
    bind: SocketAddr,
    target: SocketAddr,
    config: ProxyConfig,
    cancel: CancellationToken,
) -> std::io::Result<Tunnel> {
    let listener = TcpListener::bind(bind).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, %target, "reverse proxy listening");

    let handle = tokio::spawn(async move {
        let ready = tokio::select! {
            first = dial(target, &config) => match first {
                Some(_) => true,
                None => {
                    tracing::warn!(%target, retries = config.dial_retries, "proxy target never became reachable");
                    false
                }
            },
            _ = cancel.cancelled() => false,
        };
        if !ready {
            return;
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, %target, "proxy connection");
                        let config = config.clone();
                        let cancel = cancel.child_token();
                        tokio::spawn(proxy(stream, target, config, cancel));
                    }
                    Err(error) => {
                        tracing::error!(%local_addr, %error, "proxy accept failed");
                    }
                },
                _ = cancel.cancelled() => break,
            }
        }
        tracing::info!(%local_addr, %target, "reverse proxy closed");
    });

    Ok(Tunnel { local_addr, handle })
}

async fn proxy(mut client: TcpStream, target: SocketAddr, config: ProxyConfig, cancel: CancellationToken) {
    let mut upstream = tokio::select! {
        dialed = dial(target, &config) => match dialed {
            Some(upstream) => upstream,
            None => {
                tracing::warn!(%target, "giving up on proxy connection");
                return;
            }
        },
        _ = cancel.cancelled() => return,
    };

    tokio::select! {
        copied = tokio::io::copy_bidirectional(&mut client, &mut upstream) => match copied {
            Ok((sent, received)) => tracing::debug!(%target, sent, received, "proxy connection done"),
            Err(error) => tracing::debug!(%target, %error, "proxy connection ended"),
        },
        _ = cancel.cancelled() => {}
    }
}

/// Connect to `target`, retrying at a fixed rate within the dial budget
async fn dial(target: SocketAddr, config: &ProxyConfig) -> Option<TcpStream> {
    let attempts = config.dial_retries.max(1);
    for attempt in 1..=attempts {
        match TcpStream::connect(target).await {
            Ok(stream) => return Some(stream),
            Err(error) => {
                tracing::trace!(%target, attempt, %error, "dial failed");
                if attempt < attempts {
                    tokio::time::sleep(config.dial_interval().max(Duration::from_millis(1))).await;
                }
            }
        }
    }
    None
}
