use std::{process::Stdio, time::Duration};

use custos_ipc::{control, transport::TransportKind, Connection};
use serde_json::Value;
use snafu::ResultExt as _;
use tokio::{
    process::{Child, Command},
    select,
    time::{sleep, timeout},
};
use tracing::{debug, warn};

use crate::{ConnectTimeout, ExitedBeforeConnecting, Listen, Spawn, Wait, WorkerError, WorkerSpec};

/// A single running worker process and its connection.
pub(crate) struct Instance {
    pub(crate) child: Child,
    pub(crate) pid: u32,
    pub(crate) connection: Connection,
}

impl Instance {
    /// Spawns a worker process and establishes its connection.
    pub(crate) async fn spawn(spec: &WorkerSpec, name: &str) -> Result<Self, WorkerError> {
        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(working_dir) = spec.working_dir.as_ref() {
            command.current_dir(working_dir);
        }

        let instance = match spec.transport {
            TransportKind::Stdio => spawn_stdio(command, spec, name)?,
            TransportKind::Unix => spawn_unix(command, spec, name).await?,
            TransportKind::Tcp => spawn_tcp(command, spec, name).await?,
        };

        debug!(pid = instance.pid, command = %spec.command.display(), transport = ?spec.transport, "Spawned worker process.");
        Ok(instance)
    }

    /// Stops the worker process, first gracefully and then forcefully.
    ///
    /// The worker is asked to shut down over its connection, and killed if it has not exited within
    /// `shutdown_timeout`.
    pub(crate) async fn stop(&mut self, shutdown_timeout: Duration) {
        if self.connection.cast(Value::from(control::SHUTDOWN)).is_err() {
            debug!(pid = self.pid, "Connection to worker process already closed. Waiting for exit.");
        }

        // The shutdown request is still written before the stream is closed. Closing it also lets a worker reading
        // from standard input observe the end of its input.
        self.connection.close();

        match timeout(shutdown_timeout, self.child.wait()).await {
            Ok(Ok(status)) => debug!(pid = self.pid, %status, "Worker process exited after shutdown request."),
            Ok(Err(e)) => {
                warn!(pid = self.pid, error = %e, "Failed to wait for worker process. Killing.");
                self.kill().await;
            }
            Err(_) => {
                warn!(pid = self.pid, timeout = ?shutdown_timeout, "Worker process did not exit in time after shutdown request. Killing.");
                self.kill().await;
            }
        }
    }

    /// Kills the worker process without asking it to shut down first.
    pub(crate) async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            warn!(pid = self.pid, error = %e, "Failed to kill worker process.");
        }

        self.connection.close();
    }
}

fn spawn_child(command: &mut Command, spec: &WorkerSpec) -> Result<(Child, u32), WorkerError> {
    let child = command.spawn().context(Spawn {
        command: spec.command.display().to_string(),
    })?;
    let pid = child.id().unwrap_or_default();
    Ok((child, pid))
}

fn spawn_stdio(mut command: Command, spec: &WorkerSpec, name: &str) -> Result<Instance, WorkerError> {
    command.stdin(Stdio::piped()).stdout(Stdio::piped());

    let (mut child, pid) = spawn_child(&mut command, spec)?;
    let missing_pipe = || WorkerError::Listen {
        source: std::io::Error::other("standard I/O of the worker process was not captured"),
    };
    let stdin = child.stdin.take().ok_or_else(missing_pipe)?;
    let stdout = child.stdout.take().ok_or_else(missing_pipe)?;

    let (connection, _incoming) = Connection::spawn(name, stdout, stdin);
    Ok(Instance { child, pid, connection })
}

/// Waits for a freshly spawned worker to connect back, failing early if it exits first.
async fn accept_from<F, S>(child: &mut Child, spec: &WorkerSpec, accept: F) -> Result<S, WorkerError>
where
    F: std::future::Future<Output = std::io::Result<S>>,
{
    select! {
        accepted = accept => accepted.context(Listen),
        status = child.wait() => {
            let status = status.context(Wait)?;
            ExitedBeforeConnecting { status }.fail()
        }
        _ = sleep(spec.connect_timeout) => ConnectTimeout { timeout: spec.connect_timeout }.fail(),
    }
}

#[cfg(unix)]
async fn spawn_unix(mut command: Command, spec: &WorkerSpec, name: &str) -> Result<Instance, WorkerError> {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use custos_ipc::transport::IPC_SOCKET_ENV;
    use tokio::net::UnixListener;

    static NEXT_SOCKET_ID: AtomicUsize = AtomicUsize::new(0);

    struct SocketPath(std::path::PathBuf);

    impl Drop for SocketPath {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    let socket_path = SocketPath(std::env::temp_dir().join(format!(
        "custos-{}-{}.sock",
        std::process::id(),
        NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed)
    )));
    let _ = std::fs::remove_file(&socket_path.0);
    let listener = UnixListener::bind(&socket_path.0).context(Listen)?;

    command
        .env(IPC_SOCKET_ENV, &socket_path.0)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit());
    let (mut child, pid) = spawn_child(&mut command, spec)?;

    let (stream, _) = accept_from(&mut child, spec, listener.accept()).await?;
    let (reader, writer) = stream.into_split();
    let (connection, _incoming) = Connection::spawn(name, reader, writer);
    Ok(Instance { child, pid, connection })
}

#[cfg(not(unix))]
async fn spawn_unix(_command: Command, _spec: &WorkerSpec, _name: &str) -> Result<Instance, WorkerError> {
    crate::UnsupportedTransport { transport: "unix" }.fail()
}

async fn spawn_tcp(mut command: Command, spec: &WorkerSpec, name: &str) -> Result<Instance, WorkerError> {
    use custos_ipc::transport::IPC_ADDR_ENV;
    use tokio::net::TcpListener;

    let listener = TcpListener::bind(("127.0.0.1", 0)).await.context(Listen)?;
    let local_addr = listener.local_addr().context(Listen)?;

    command
        .env(IPC_ADDR_ENV, local_addr.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::inherit());
    let (mut child, pid) = spawn_child(&mut command, spec)?;

    let (stream, _) = accept_from(&mut child, spec, listener.accept()).await?;
    stream.set_nodelay(true).context(Listen)?;
    let (reader, writer) = stream.into_split();
    let (connection, _incoming) = Connection::spawn(name, reader, writer);
    Ok(Instance { child, pid, connection })
}
