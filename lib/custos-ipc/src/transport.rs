//! Transports for establishing connections.
//!
//! A supervisor reaches its external worker over one of three transports:
//!
//! - **stdio**: the worker's standard input and output (the default)
//! - **Unix domain socket**: the supervisor listens on a socket path passed to the worker in `CUSTOS_IPC_SOCKET`
//! - **TCP**: the supervisor listens on a loopback address passed to the worker in `CUSTOS_IPC_ADDR`
//!
//! Workers call [`connect_from_env`] to pick the transport their supervisor chose.

use std::{env, net::SocketAddr, path::Path};

use serde::Deserialize;
use snafu::ResultExt as _;
use tokio::net::TcpStream;
use tracing::debug;

use crate::{Connect, Connection, Incoming, IpcError};

/// Environment variable holding the Unix domain socket path a worker should connect to.
pub const IPC_SOCKET_ENV: &str = "CUSTOS_IPC_SOCKET";

/// Environment variable holding the TCP address a worker should connect to.
pub const IPC_ADDR_ENV: &str = "CUSTOS_IPC_ADDR";

/// Transport used between a supervisor and its external worker.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// The worker's standard input and output.
    #[default]
    Stdio,

    /// A Unix domain socket.
    Unix,

    /// A loopback TCP socket.
    Tcp,
}

/// Creates a connection over the standard input and output of the current process.
///
/// Anything else writing to standard output, such as logging, corrupts the stream, so workers using this transport
/// must log to standard error.
pub fn stdio() -> (Connection, Incoming) {
    Connection::spawn("stdio", tokio::io::stdin(), tokio::io::stdout())
}

/// Connects to the Unix domain socket at `path`.
///
/// # Errors
///
/// If the connection cannot be established, an error is returned.
#[cfg(unix)]
pub async fn connect_unix<P: AsRef<Path>>(path: P) -> Result<(Connection, Incoming), IpcError> {
    let path = path.as_ref();
    let stream = tokio::net::UnixStream::connect(path).await.context(Connect {
        address: path.display().to_string(),
    })?;
    let (reader, writer) = stream.into_split();
    debug!(path = %path.display(), "Connected to Unix domain socket.");
    Ok(Connection::spawn("unix", reader, writer))
}

/// Connects to the Unix domain socket at `path`.
///
/// # Errors
///
/// Unix domain sockets are not supported on this platform, so an error is always returned.
#[cfg(not(unix))]
pub async fn connect_unix<P: AsRef<Path>>(path: P) -> Result<(Connection, Incoming), IpcError> {
    Err(IpcError::Connect {
        address: path.as_ref().display().to_string(),
        source: std::io::Error::new(std::io::ErrorKind::Unsupported, "Unix domain sockets are not supported."),
    })
}

/// Connects to the TCP socket at `addr`.
///
/// # Errors
///
/// If the connection cannot be established, an error is returned.
pub async fn connect_tcp(addr: SocketAddr) -> Result<(Connection, Incoming), IpcError> {
    let stream = TcpStream::connect(addr).await.context(Connect {
        address: addr.to_string(),
    })?;
    stream.set_nodelay(true).context(Connect {
        address: addr.to_string(),
    })?;
    let (reader, writer) = stream.into_split();
    debug!(%addr, "Connected to TCP socket.");
    Ok(Connection::spawn("tcp", reader, writer))
}

/// Connects using the transport described by the environment.
///
/// Uses the Unix domain socket in `CUSTOS_IPC_SOCKET` if set, then the TCP address in `CUSTOS_IPC_ADDR` if set, and
/// falls back to standard input and output otherwise.
///
/// # Errors
///
/// If the environment describes an invalid address, or the connection cannot be established, an error is returned.
pub async fn connect_from_env() -> Result<(Connection, Incoming), IpcError> {
    if let Some(path) = env::var_os(IPC_SOCKET_ENV) {
        return connect_unix(path).await;
    }

    if let Ok(addr) = env::var(IPC_ADDR_ENV) {
        let parsed = addr.parse::<SocketAddr>().map_err(|_| IpcError::InvalidEnvironment {
            var: IPC_ADDR_ENV,
            value: addr.clone(),
        })?;
        return connect_tcp(parsed).await;
    }

    Ok(stdio())
}
