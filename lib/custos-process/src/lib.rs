//! Supervision of external worker processes.
//!
//! An [`OsProcessSupervisor`] runs a [`WorkerSpec`] as a real operating system process, and exposes it to a
//! [`Supervisor`][custos_core::runtime::Supervisor] like any other supervisable process. Memory used by a worker is
//! fully isolated from the supervisor, so restarting the worker is a reliable way to reclaim memory that cannot
//! otherwise be released.
//!
//! While a worker is running, a health monitor periodically checks it:
//!
//! - **liveness**: a `ping` call that must be answered with `pong` within a timeout; repeated failures kill the worker
//!   and fail the supervised process
//! - **readiness**: a `ready` call answered with a boolean; a worker that is not ready keeps running, but is reported
//!   as unavailable for new work
//! - **custom**: an arbitrary predicate over the running process, evaluated by the supervisor; a failure fails the
//!   supervised process
//! - **resources**: resident memory above the configured limit, or more requests than the configured maximum, cause
//!   the worker to be _recycled_: stopped gracefully and replaced by a fresh process, without being treated as a
//!   failure
//!
//! Stopping a worker, whether on shutdown or for a recycle, first asks it to exit over its IPC connection, and kills
//! it if it has not exited within the configured shutdown timeout.
//!
//! Callers reach the worker through an [`OsProcessHandle`], which stays valid across restarts and recycles, and exposes
//! the latest [`HealthReport`] of the worker.
#![deny(warnings)]
#![deny(missing_docs)]

use std::{io, process::ExitStatus, time::Duration};

use custos_error::GenericError;
use snafu::Snafu;

mod health;
pub use self::health::{CheckStatus, CustomCheck, HealthReport, ProcessSnapshot, RecycleReason};

mod instance;

mod proxy;
pub use self::proxy::{OsProcessHandle, RemoteServer};

mod supervisor;
pub use self::supervisor::OsProcessSupervisor;

mod worker_spec;
pub use self::worker_spec::{HealthCheckConfig, WorkerSpec};

/// Worker process errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum WorkerError {
    /// The worker process could not be spawned.
    #[snafu(display("Failed to spawn worker process '{}': {}", command, source))]
    Spawn {
        /// The command that failed to spawn.
        command: String,

        /// The underlying I/O error.
        source: io::Error,
    },

    /// The transport for the worker could not be set up.
    #[snafu(display("Failed to set up transport for worker process: {}", source))]
    Listen {
        /// The underlying I/O error.
        source: io::Error,
    },

    /// The configured transport is not supported on this platform.
    #[snafu(display("Transport '{}' is not supported on this platform.", transport))]
    UnsupportedTransport {
        /// The unsupported transport.
        transport: &'static str,
    },

    /// The worker process did not connect back in time.
    #[snafu(display("Worker process did not connect within {:?}.", timeout))]
    ConnectTimeout {
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The worker process exited before connecting back.
    #[snafu(display("Worker process exited before connecting ({}).", status))]
    ExitedBeforeConnecting {
        /// The exit status of the process.
        status: ExitStatus,
    },

    /// Waiting on the worker process failed.
    #[snafu(display("Failed to wait for worker process: {}", source))]
    Wait {
        /// The underlying I/O error.
        source: io::Error,
    },

    /// The worker process exited with a failure status.
    #[snafu(display("Worker process exited unexpectedly ({}).", status))]
    Exited {
        /// The exit status of the process.
        status: ExitStatus,
    },

    /// The connection to the worker process was lost while the process kept running.
    #[snafu(display("Lost connection to worker process."))]
    ConnectionLost,

    /// The worker process failed too many consecutive liveness checks.
    #[snafu(display("Worker process failed {} consecutive liveness checks.", failures))]
    LivenessFailed {
        /// Number of consecutive failed checks.
        failures: u32,
    },

    /// The custom health check failed.
    #[snafu(display("Custom health check failed: {:#}", source))]
    CustomCheckFailed {
        /// The error returned by the check.
        source: GenericError,
    },
}
