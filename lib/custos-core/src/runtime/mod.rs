//! Runtime system.
//!
//! This module contains the core components of the runtime system: supervisors, the processes they supervise, and the
//! policies that govern how failed processes are restarted. It is directly inspired by
//! [Erlang/OTP](https://www.erlang.org/docs/28/system/design_principles#supervision-trees).
//!
//! # Processes
//!
//! A process is a unit of work that runs until it is asked to stop or until it fails. Anything implementing
//! [`Supervisable`] is a process: a plain asynchronous task, a nested [`Supervisor`], or a wrapper that owns an
//! external operating system process.
//!
//! Every running instance of a process is identified by a unique numerical identifier and a hierarchical name, such as
//! `root_sup.pool.worker_1`, and runs within its own `tracing` span.
//!
//! # Supervisors
//!
//! Supervisors own an ordered set of children, each described by a [`ChildSpec`], and drive them concurrently. When a
//! child terminates, the supervisor consults the child's [`RestartPolicy`] to decide whether it restarts at all, and its
//! own [`RestartStrategy`] to decide which siblings restart along with it:
//!
//! - [`RestartMode::OneForOne`]: only the failed child
//! - [`RestartMode::OneForAll`]: every child, stopped in reverse start order and restarted in start order
//! - [`RestartMode::RestForOne`]: the failed child and every child started after it
//! - [`RestartMode::SimpleOneForOne`]: dynamically added instances of a single template, restarted individually
//!
//! Each restart is preceded by an exponentially increasing delay (see [`BackoffConfig`]), and counted against a
//! sliding window of restart intensity. A supervisor that exceeds its restart intensity stops all of its children and
//! fails, which its own parent observes as an ordinary child failure.
//!
//! # Shutdown
//!
//! Cancelling the shutdown signal passed to a supervisor is the only way to stop a subtree: children are stopped in
//! reverse start order, depth-first, each according to its [`ShutdownStrategy`], before the supervisor returns.

mod backoff;
pub use self::backoff::{BackoffConfig, ExponentialBackoff};

mod dedicated;
pub use self::dedicated::{RuntimeConfiguration, RuntimeMode};

mod process;
pub use self::process::{Id, InstrumentedProcess, Name, Process, ProcessExt};

mod restart;
pub use self::restart::{ExitReason, RestartMode, RestartPolicy, RestartStrategy, RestartStrategyConfig};

mod shutdown;
pub use self::shutdown::{ProcessShutdown, ShutdownHandle};

mod supervisor;
pub use self::supervisor::{
    ChildInfo, ChildSpec, ChildState, ProcessContext, ProcessError, ShutdownStrategy, Supervisable, Supervisor,
    SupervisorError, SupervisorHandle,
};
