//! kubedock daemon
//!
//! Runs Docker-style containers as Kubernetes workloads. `server` keeps the
//! lifecycle subsystem and reaper alive, `run` deploys one container from
//! the command line and `prune` removes everything kubedock created.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kd_core::config::{self, DaemonConfig, ExposeStrategy};
use kd_core::traits::NoImageInspector;
use kd_core::{Container, PortSpec};
use kd_orchestrator::{AppContext, KubeCluster};
use kd_protocol::{StreamCodec, StreamType};

#[derive(Parser)]
#[command(name = "kubedock")]
#[command(about = "Docker-style containers on Kubernetes")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "KUBEDOCK_CONFIG")]
    config: Option<PathBuf>,

    /// Namespace to create workloads in (overrides config)
    #[arg(short, long, env = "KUBEDOCK_NAMESPACE")]
    namespace: Option<String>,

    /// Port exposure strategy: none, port-forward or reverse-proxy (overrides config)
    #[arg(long, env = "KUBEDOCK_EXPOSE")]
    expose: Option<ExposeStrategy>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon until interrupted
    Server,

    /// Deploy one container, follow its logs, delete it on exit
    Run {
        /// Image to run
        image: String,

        /// Command and arguments
        args: Vec<String>,

        /// Container name
        #[arg(long)]
        name: Option<String>,

        /// Published port, `[host:]container[/protocol]`
        #[arg(short, long = "publish")]
        ports: Vec<String>,

        /// Bind mount, `source:target[:mode]`
        #[arg(short = 'v', long = "volume")]
        binds: Vec<String>,

        /// Environment variable, `KEY=VALUE`
        #[arg(short, long)]
        env: Vec<String>,

        /// Network alias
        #[arg(long = "network-alias")]
        aliases: Vec<String>,
    },

    /// Delete every cluster object kubedock created
    Prune,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = load_config(args.config.as_ref())?;
    if let Some(namespace) = args.namespace {
        config.namespace = namespace;
    }
    if let Some(expose) = args.expose {
        config.expose = expose;
    }
    config.validate().context("Invalid configuration")?;

    let cluster = KubeCluster::connect(config.namespace.clone())
        .await
        .context("Failed to connect to the Kubernetes API")?;
    tracing::info!(namespace = %cluster.namespace(), expose = %config.expose, "connected to cluster");

    let ctx = AppContext::new(config, Arc::new(cluster), Arc::new(NoImageInspector));

    match args.command.unwrap_or(Command::Server) {
        Command::Server => server(&ctx).await,
        Command::Run {
            image,
            args,
            name,
            ports,
            binds,
            env,
            aliases,
        } => {
            let mut container = Container::new(image);
            container.cmd = args;
            if let Some(name) = name {
                container.name = name;
            }
            container.binds = binds;
            container.env = env;
            container.network_aliases = aliases;
            for port in &ports {
                publish(&mut container, port)?;
            }
            run(&ctx, container).await
        }
        Command::Prune => {
            let deleted = ctx.orchestrator.delete_all().await?;
            tracing::info!(deleted, "prune complete");
            Ok(())
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<DaemonConfig> {
    if let Some(path) = path {
        return config::load_config(path).with_context(|| format!("Failed to load config from {:?}", path));
    }

    let default_path = config::default_config_path();
    if default_path.exists() {
        Ok(config::load_config(&default_path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
            DaemonConfig::default()
        }))
    } else {
        tracing::info!("Using default configuration");
        Ok(DaemonConfig::default())
    }
}

/// Apply a `[host:]container[/protocol]` publish flag
fn publish(container: &mut Container, flag: &str) -> Result<()> {
    match flag.split_once(':') {
        Some((host, port)) => {
            let spec: PortSpec = port.parse()?;
            let host: i32 = host
                .parse()
                .with_context(|| format!("Invalid host port in {flag:?}"))?;
            container.port_bindings.insert(spec, Some(host));
        }
        None => {
            container.exposed_ports.insert(flag.parse()?);
        }
    }
    Ok(())
}

async fn server(ctx: &AppContext) -> Result<()> {
    tracing::info!("kubedock starting...");

    if ctx.config.prune_on_start {
        let deleted = ctx.orchestrator.delete_all().await?;
        tracing::info!(deleted, "pruned leftovers");
    }

    ctx.reaper.start();

    let cancel = CancellationToken::new();
    shutdown_signal(cancel.clone());
    cancel.cancelled().await;

    ctx.reaper.stop();
    tracing::info!("kubedock shutdown complete");
    Ok(())
}

async fn run(ctx: &AppContext, container: Container) -> Result<()> {
    let container = ctx.orchestrator.create(container);
    let id = container.id.to_string();

    let state = match ctx.orchestrator.start(&id).await {
        Ok(state) => state,
        Err(e) => {
            if let Err(error) = ctx.orchestrator.delete(&id).await {
                tracing::warn!(%error, "cleanup after failed start failed");
            }
            return Err(e).context("Failed to start container");
        }
    };

    let started = ctx.store.get_container(&id)?;
    println!("{} {}", started.short_id(), state);
    for (port, local) in &started.mapped_ports {
        println!("  {port} -> {}:{local}", started.host_ip);
    }
    for (port, host) in &started.host_ports {
        println!("  {port} -> service port {host}");
    }

    let cancel = CancellationToken::new();
    shutdown_signal(cancel.clone());

    tokio::select! {
        result = follow_logs(ctx, &id) => {
            if let Err(error) = result {
                tracing::warn!(%error, "log stream ended");
            }
        }
        _ = cancel.cancelled() => {}
    }

    ctx.orchestrator.delete(&id).await?;
    Ok(())
}

/// Follow a container's log, splitting the multiplexed stream back apart
async fn follow_logs(ctx: &AppContext, id: &str) -> Result<()> {
    let (writer, reader) = tokio::io::duplex(64 * 1024);
    let mut frames = FramedRead::new(reader, StreamCodec::new());

    let printer = async {
        let mut stdout = tokio::io::stdout();
        let mut stderr = tokio::io::stderr();
        while let Some(frame) = frames.next().await {
            let frame = frame?;
            match frame.stream {
                StreamType::Stderr => stderr.write_all(&frame.payload).await?,
                _ => stdout.write_all(&frame.payload).await?,
            }
        }
        stdout.flush().await?;
        Ok::<_, anyhow::Error>(())
    };

    let (logged, printed) = tokio::join!(ctx.streams.logs(id, true, writer), printer);
    logged?;
    printed
}

/// Cancel `cancel` on Ctrl+C or SIGTERM
fn shutdown_signal(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(error) => {
                    tracing::warn!(%error, "failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel.cancel();
    });
}
