//! Exec, logs, attach and archive copy against a container's main process
//!
//! Output headed for a Docker client goes through a [`Multiplexer`] pair
//! unless the session uses a tty, in which case it is passed through raw.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};

use kd_core::names::MAIN_CONTAINER;
use kd_core::traits::{EventAction, EventKind, EventSink, MetadataStore};
use kd_core::{Container, Exec, KdError, Result};
use kd_protocol::{Multiplexer, StreamType};

use crate::cluster::{active_pod, pod_name, BoxedReader, Cluster, ExecIo, PodTarget};

/// Buffer between a remote stream and its multiplexer
const PIPE_CAPACITY: usize = 64 * 1024;

/// Options of a new exec record
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub stdin: bool,
    pub tty: bool,
}

/// Streams to and from running containers
pub struct RemoteStreams {
    cluster: Arc<dyn Cluster>,
    store: Arc<dyn MetadataStore>,
    events: Arc<dyn EventSink>,
}

impl RemoteStreams {
    pub fn new(cluster: Arc<dyn Cluster>, store: Arc<dyn MetadataStore>, events: Arc<dyn EventSink>) -> Self {
        Self { cluster, store, events }
    }

    /// The main container of the pod currently backing `container`
    async fn target(&self, container: &Container) -> Result<PodTarget> {
        let pod = active_pod(self.cluster.as_ref(), &container.selector()).await?;
        Ok(PodTarget::new(pod_name(&pod), MAIN_CONTAINER))
    }

    fn running(&self, id: &str) -> Result<Container> {
        let container = self.store.get_container(id)?;
        if !container.lifecycle.running {
            return Err(KdError::Orchestration(format!(
                "container {} is not running",
                container.short_id()
            )));
        }
        Ok(container)
    }

    /// Record a command to run later in a running container
    pub fn create_exec(&self, container_id: &str, cmd: Vec<String>, options: ExecOptions) -> Result<Exec> {
        let container = self.running(container_id)?;
        let mut exec = Exec::new(container.id.clone(), cmd);
        exec.stdin = options.stdin;
        exec.tty = options.tty;
        self.store.save_exec(&exec);
        tracing::debug!(exec = %exec.id, id = %container.short_id(), "exec created");
        Ok(exec)
    }

    /// Run a recorded exec, writing its output to `out`, and store its exit code
    pub async fn run_exec<W>(&self, exec_id: &str, stdin: Option<BoxedReader>, out: W) -> Result<i32>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut exec = self.store.get_exec(exec_id)?;
        let container = self.running(exec.container_id.as_str())?;
        let target = self.target(&container).await?;

        let mut io = ExecIo::silent().tty(exec.tty);
        if exec.stdin {
            io.stdin = stdin;
        }

        let command = exec.cmd.clone();
        let cluster = Arc::clone(&self.cluster);
        let code = with_output(out, exec.tty, io, |io| async move { cluster.exec(&target, command, io).await })
            .await?;

        exec.exit_code = Some(code);
        self.store.save_exec(&exec);
        tracing::debug!(exec = %exec.id, code, "exec finished");
        Ok(code)
    }

    /// Stream the main container's log to `out`
    ///
    /// With `follow` the stream stays open until the log ends or the
    /// container's tasks are cancelled.
    pub async fn logs<W>(&self, container_id: &str, follow: bool, out: W) -> Result<()>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let container = self.store.get_container(container_id)?;
        let target = self.target(&container).await?;

        let (remote, local) = tokio::io::duplex(PIPE_CAPACITY);
        let writer = Arc::new(tokio::sync::Mutex::new(out));
        let mut mux = Multiplexer::new(StreamType::Stdout, writer);
        let cluster = Arc::clone(&self.cluster);
        let stream = async move {
            let (copied, pumped) = tokio::join!(cluster.logs(&target, follow, Box::new(remote)), mux.pump(local));
            copied?;
            pumped?;
            Ok::<_, KdError>(())
        };

        if !follow {
            return stream.await;
        }

        let cancel = container.tasks.register();
        tokio::select! {
            result = stream => result,
            _ = cancel.cancelled() => {
                tracing::debug!(id = %container.short_id(), "log follow cancelled");
                Ok(())
            }
        }
    }

    /// Attach to the main process until it exits, the client hangs up or the
    /// container's tasks are cancelled; publishes `detach` when done
    pub async fn attach<W>(&self, container_id: &str, stdin: Option<BoxedReader>, tty: bool, out: W) -> Result<()>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let container = self.running(container_id)?;
        let target = self.target(&container).await?;
        let cancel = container.tasks.register();

        let mut io = ExecIo::silent().tty(tty);
        io.stdin = stdin;

        let cluster = Arc::clone(&self.cluster);
        let session = with_output(out, tty, io, |io| async move { cluster.attach(&target, io).await });

        let result = tokio::select! {
            result = session => result,
            _ = cancel.cancelled() => Ok(()),
        };

        self.events
            .publish(container.id.as_str(), EventKind::Container, EventAction::Detach);
        tracing::debug!(id = %container.short_id(), "detached");
        result
    }

    /// Extract a tar archive into `path` inside the main container
    pub async fn copy_to_container<R>(&self, container_id: &str, path: &str, archive: R) -> Result<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let container = self.running(container_id)?;
        let target = self.target(&container).await?;

        let (stderr, mut errors) = tokio::io::duplex(PIPE_CAPACITY);
        let command = vec![
            "tar".to_string(),
            "-xf".to_string(),
            "-".to_string(),
            "-C".to_string(),
            path.to_string(),
        ];
        let io = ExecIo::silent().with_stdin(archive).with_stderr(stderr);

        let mut message = Vec::new();
        let (code, _) = tokio::join!(
            self.cluster.exec(&target, command, io),
            tokio::io::AsyncReadExt::read_to_end(&mut errors, &mut message)
        );

        match code? {
            0 => Ok(()),
            code => Err(KdError::Stream(format!(
                "extracting into {path} exited with {code}: {}",
                String::from_utf8_lossy(&message).trim()
            ))),
        }
    }
}

/// Run `session` with its output wired to `out`
///
/// Without a tty, stdout and stderr are multiplexed onto `out`.
async fn with_output<W, F, Fut, T>(out: W, tty: bool, mut io: ExecIo, session: F) -> Result<T>
where
    W: AsyncWrite + Send + Unpin + 'static,
    F: FnOnce(ExecIo) -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, crate::cluster::ClusterError>>,
{
    if tty {
        io.stdout = Some(Box::new(out));
        return Ok(session(io).await?);
    }

    let (stdout_remote, stdout_local) = pipe();
    let (stderr_remote, stderr_local) = pipe();
    io.stdout = Some(Box::new(stdout_remote));
    io.stderr = Some(Box::new(stderr_remote));

    let (mut stdout_mux, mut stderr_mux) = Multiplexer::pair(out);
    let (result, out_pumped, err_pumped) = tokio::join!(
        session(io),
        stdout_mux.pump(stdout_local),
        stderr_mux.pump(stderr_local)
    );

    let value = result?;
    out_pumped?;
    err_pumped?;
    Ok(value)
}

fn pipe() -> (DuplexStream, DuplexStream) {
    tokio::io::duplex(PIPE_CAPACITY)
}
