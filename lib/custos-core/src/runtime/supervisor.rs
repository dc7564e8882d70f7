use std::{
    collections::VecDeque,
    fmt,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use custos_error::{ErrorContext as _, GenericError};
use snafu::{OptionExt as _, Snafu};
use tokio::{
    pin, select,
    sync::{mpsc, oneshot},
    task::{AbortHandle, Id, JoinError, JoinSet},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    backoff::{BackoffConfig, ChildBackoff, ExponentialBackoff},
    dedicated::{spawn_dedicated_runtime, RuntimeConfiguration, RuntimeMode},
    process::{Name, Process, ProcessExt as _},
    restart::{ExitReason, RestartAction, RestartMode, RestartPolicy, RestartState, RestartStrategy},
    shutdown::{ProcessShutdown, ShutdownHandle},
};
use crate::collections::FastIndexMap;

/// Process errors.
#[derive(Debug, Snafu)]
pub enum ProcessError {
    /// The child process was aborted by the supervisor.
    #[snafu(display("Child process was aborted by the supervisor."))]
    Aborted,

    /// The child process panicked.
    #[snafu(display("Child process panicked."))]
    Panicked,

    /// The child process terminated with an error.
    #[snafu(display("Child process terminated with an error: {}", source))]
    Terminated {
        /// The error that caused the termination.
        source: GenericError,
    },
}

impl ProcessError {
    fn from_join_error(e: JoinError) -> Self {
        if e.is_cancelled() {
            Self::Aborted
        } else {
            Self::Panicked
        }
    }
}

/// Strategy for shutting down a process.
#[derive(Clone, Copy, Debug)]
pub enum ShutdownStrategy {
    /// Waits for the configured duration for the process to exit, and then forcefully aborts it otherwise.
    Graceful(Duration),

    /// Forcefully aborts the process without waiting.
    Brutal,
}

/// Context handed to a supervised process when it is started.
///
/// Carries the identity of the running instance and its shutdown signal. A process is expected to return as soon as
/// reasonably possible after the shutdown signal resolves.
pub struct ProcessContext {
    process: Process,
    shutdown: ProcessShutdown,
}

impl ProcessContext {
    pub(crate) fn new(process: Process, shutdown: ProcessShutdown) -> Self {
        Self { process, shutdown }
    }

    /// Creates a context for running a supervisable process outside of any supervisor.
    ///
    /// # Errors
    ///
    /// If `name` is not a valid process name, an error is returned.
    pub fn detached<N: AsRef<str>>(name: N, shutdown: ProcessShutdown) -> Result<Self, SupervisorError> {
        let process = Process::root(&name).context(InvalidName {
            name: name.as_ref().to_string(),
        })?;
        Ok(Self::new(process, shutdown))
    }

    /// Returns the running process.
    pub fn process(&self) -> &Process {
        &self.process
    }

    /// Returns the hierarchical name of the running process.
    pub fn name(&self) -> &str {
        self.process.name()
    }

    /// Waits for the shutdown signal to be received.
    pub async fn wait_for_shutdown(&mut self) {
        self.shutdown.wait_for_shutdown().await
    }

    /// Returns `true` if shutdown has been triggered.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_shutdown()
    }

    /// Returns a cancellation token that is cancelled when this process is asked to shut down.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.cancellation_token()
    }

    /// Creates a shutdown signal for an auxiliary task, which resolves whenever this process is asked to shut down.
    pub fn child_shutdown(&self) -> (ProcessShutdown, ShutdownHandle) {
        self.shutdown.child()
    }

    /// Consumes the context, returning the process and its shutdown signal.
    pub fn into_parts(self) -> (Process, ProcessShutdown) {
        (self.process, self.shutdown)
    }
}

/// A supervisable process.
///
/// This is the single capability shared by every unit in a supervision tree: plain workers, nested supervisors, and
/// wrappers around external operating system processes.
#[async_trait]
pub trait Supervisable: Send {
    /// Returns the shutdown strategy for the process.
    fn shutdown_strategy(&self) -> ShutdownStrategy {
        ShutdownStrategy::Graceful(Duration::from_secs(5))
    }

    /// Runs the process.
    ///
    /// Runs until the shutdown signal in `ctx` resolves, in which case `Ok(())` should be returned, or until the
    /// process fails, in which case an error is returned. Returning `Ok(())` without having been asked to shut down is
    /// considered a normal exit.
    ///
    /// # Errors
    ///
    /// If the process fails, an error is returned.
    async fn serve(&mut self, ctx: ProcessContext) -> Result<(), GenericError>;
}

#[async_trait]
impl Supervisable for Box<dyn Supervisable> {
    fn shutdown_strategy(&self) -> ShutdownStrategy {
        (**self).shutdown_strategy()
    }

    async fn serve(&mut self, ctx: ProcessContext) -> Result<(), GenericError> {
        (**self).serve(ctx).await
    }
}

/// Supervisor errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum SupervisorError {
    /// Supervisor or child name is invalid.
    #[snafu(display("Invalid name for supervisor or child: '{}'", name))]
    InvalidName {
        /// The invalid name.
        name: String,
    },

    /// The supervisor has no child processes.
    #[snafu(display("Supervisor has no child processes."))]
    NoChildren,

    /// The supervisor is already running.
    #[snafu(display("Supervisor '{}' is already running.", supervisor_id))]
    AlreadyRunning {
        /// The supervisor ID.
        supervisor_id: String,
    },

    /// The supervisor is not running.
    #[snafu(display("Supervisor is not running."))]
    NotRunning,

    /// A child with the same ID already exists.
    #[snafu(display("Child '{}' already exists.", child_id))]
    DuplicateChild {
        /// The conflicting child ID.
        child_id: String,
    },

    /// No child exists with the given ID.
    #[snafu(display("Child '{}' does not exist.", child_id))]
    UnknownChild {
        /// The unknown child ID.
        child_id: String,
    },

    /// Instances can only be added to a simple one-for-one supervisor.
    #[snafu(display("Supervisor has no child template; instances can only be added to a simple one-for-one supervisor."))]
    NoTemplate,

    /// Children of a simple one-for-one supervisor are all created from its template.
    #[snafu(display("Children of a simple one-for-one supervisor must be added as instances of its template."))]
    TemplateOnly,

    /// The supervisor exceeded its restart limits and was forced to shutdown.
    #[snafu(display(
        "Supervisor has exceeded restart limits after child '{}' terminated and was forced to shutdown.",
        child_id
    ))]
    RestartLimitExceeded {
        /// The child whose termination exceeded the limit.
        child_id: String,
    },
}

type ChildFactory = Arc<dyn Fn() -> Box<dyn Supervisable> + Send + Sync>;

/// A child process specification.
///
/// All children added to a [`Supervisor`] are specified as a `ChildSpec`, which acts as a template for how the
/// supervisor creates a fresh instance of the child each time it is started or restarted, along with the child's ID
/// and restart policy.
#[derive(Clone)]
pub struct ChildSpec {
    id: Arc<str>,
    factory: ChildFactory,
    restart_policy: RestartPolicy,
}

impl ChildSpec {
    /// Creates a new `ChildSpec` with the given ID and factory, and a permanent restart policy.
    pub fn new<I, F, S>(id: I, factory: F) -> Self
    where
        I: AsRef<str>,
        F: Fn() -> S + Send + Sync + 'static,
        S: Supervisable + 'static,
    {
        Self {
            id: id.as_ref().into(),
            factory: Arc::new(move || -> Box<dyn Supervisable> { Box::new(factory()) }),
            restart_policy: RestartPolicy::default(),
        }
    }

    /// Creates a new `ChildSpec` for a nested supervisor.
    ///
    /// The child ID is the supervisor's ID. Nested supervisors are always given as much time as they need to shut
    /// down, so that their entire subtree can be stopped cleanly.
    pub fn supervisor(supervisor: Supervisor) -> Self {
        let id = Arc::clone(&supervisor.supervisor_id);
        Self {
            id,
            factory: Arc::new(move || -> Box<dyn Supervisable> { Box::new(supervisor.inner_clone()) }),
            restart_policy: RestartPolicy::default(),
        }
    }

    /// Sets the restart policy.
    pub fn with_restart_policy(mut self, restart_policy: RestartPolicy) -> Self {
        self.restart_policy = restart_policy;
        self
    }

    /// Returns the child ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the restart policy.
    pub fn restart_policy(&self) -> RestartPolicy {
        self.restart_policy
    }

    fn with_id(&self, id: &str) -> Self {
        Self {
            id: id.into(),
            factory: Arc::clone(&self.factory),
            restart_policy: self.restart_policy,
        }
    }

    pub(crate) fn create(&self) -> Box<dyn Supervisable> {
        (self.factory)()
    }
}

impl fmt::Debug for ChildSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildSpec")
            .field("id", &self.id)
            .field("restart_policy", &self.restart_policy)
            .finish_non_exhaustive()
    }
}

/// Lifecycle state of a child.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildState {
    /// The child has been spawned, and is waiting out its restart delay or has not yet started serving.
    Starting,

    /// The child is serving.
    Running,

    /// The child has been asked to shut down and the supervisor is waiting for it to exit.
    Stopping,

    /// The child exited cleanly, or was stopped, and is not running.
    Stopped,

    /// The child failed and was not restarted.
    Failed,
}

/// A snapshot of a child's state.
#[derive(Clone, Debug)]
pub struct ChildInfo {
    id: Arc<str>,
    state: ChildState,
    restart_count: usize,
    restart_policy: RestartPolicy,
}

impl ChildInfo {
    /// Returns the child ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> ChildState {
        self.state
    }

    /// Returns how many times the child has been restarted.
    pub fn restart_count(&self) -> usize {
        self.restart_count
    }

    /// Returns the restart policy.
    pub fn restart_policy(&self) -> RestartPolicy {
        self.restart_policy
    }
}

struct ChildEntry {
    spec: ChildSpec,
    state: ChildState,
    restart_count: usize,
    generation: u64,
    backoff: ChildBackoff,
}

impl ChildEntry {
    fn new(spec: ChildSpec) -> Self {
        Self {
            spec,
            state: ChildState::Stopped,
            restart_count: 0,
            generation: 0,
            backoff: ChildBackoff::default(),
        }
    }
}

enum Control {
    Add {
        spec: ChildSpec,
        reply: oneshot::Sender<Result<(), SupervisorError>>,
    },
    Remove {
        child_id: Arc<str>,
        reply: oneshot::Sender<Result<(), SupervisorError>>,
    },
    Restart {
        child_id: Arc<str>,
        reply: oneshot::Sender<Result<(), SupervisorError>>,
    },
}

#[derive(Default)]
struct SupervisorState {
    children: FastIndexMap<Arc<str>, ChildEntry>,
    control_tx: Option<mpsc::UnboundedSender<Control>>,
}

impl SupervisorState {
    fn insert_child(&mut self, spec: ChildSpec) -> Result<(), SupervisorError> {
        if Name::root(spec.id()).is_none() {
            return Err(SupervisorError::InvalidName {
                name: spec.id().to_string(),
            });
        }

        if self.children.contains_key(spec.id()) {
            return Err(SupervisorError::DuplicateChild {
                child_id: spec.id().to_string(),
            });
        }

        self.children.insert(Arc::clone(&spec.id), ChildEntry::new(spec));
        Ok(())
    }

    fn remove_child(&mut self, child_id: &str) -> Result<(), SupervisorError> {
        self.children
            .shift_remove(child_id)
            .map(|_| ())
            .context(UnknownChild { child_id })
    }

    fn child_ids(&self) -> Vec<Arc<str>> {
        self.children.keys().cloned().collect()
    }
}

type SharedState = Arc<Mutex<SupervisorState>>;

fn lock_state(state: &Mutex<SupervisorState>) -> MutexGuard<'_, SupervisorState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Marks a supervisor as running for as long as it is held.
struct RunningGuard {
    state: SharedState,
}

impl RunningGuard {
    fn acquire(
        supervisor_id: &str, state: &SharedState, control_tx: mpsc::UnboundedSender<Control>, require_children: bool,
    ) -> Result<Self, SupervisorError> {
        let mut guard = lock_state(state);
        if guard.control_tx.is_some() {
            return Err(SupervisorError::AlreadyRunning {
                supervisor_id: supervisor_id.to_string(),
            });
        }

        if require_children && guard.children.is_empty() {
            return Err(SupervisorError::NoChildren);
        }

        guard.control_tx = Some(control_tx);
        Ok(Self {
            state: Arc::clone(state),
        })
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        let mut state = lock_state(&self.state);
        state.control_tx = None;
        for entry in state.children.values_mut() {
            if matches!(
                entry.state,
                ChildState::Starting | ChildState::Running | ChildState::Stopping
            ) {
                entry.state = ChildState::Stopped;
            }
        }
    }
}

/// Supervises a set of children.
///
/// # Children
///
/// Children are defined through [`ChildSpec`], which wraps a factory producing fresh instances of anything that
/// implements [`Supervisable`]. Supervisors themselves implement [`Supervisable`], so they can be nested to build
/// _supervision trees_.
///
/// Children have a fixed start order, which is the order in which they were added. A restart never changes a child's
/// ID or its position in the start order.
///
/// # Instrumentation
///
/// Every child instance is wrapped in a dedicated [`tracing::Span`] carrying its hierarchical process name, such as
/// `root_sup.pool.worker_1`, and a unique process ID.
///
/// # Restart strategies
///
/// Restart behavior is configured through [`RestartStrategy`] (which children restart, and how many restarts are
/// tolerated over a sliding window), per-child [`RestartPolicy`] (whether a child restarts at all, based on how it
/// exited), and [`BackoffConfig`] (how long to wait before each restart).
///
/// # Runtime control
///
/// A [`SupervisorHandle`], acquired with [`handle`][Supervisor::handle], allows adding, removing, restarting, and
/// inspecting children. While the supervisor is running, every such operation is serialized with failure handling
/// through the supervisor's control loop.
pub struct Supervisor {
    supervisor_id: Arc<str>,
    restart_strategy: RestartStrategy,
    backoff: BackoffConfig,
    template: Option<ChildSpec>,
    runtime_mode: RuntimeMode,
    state: SharedState,
}

impl Supervisor {
    /// Creates an empty `Supervisor` with the default restart strategy.
    ///
    /// # Errors
    ///
    /// If the supervisor ID is not a valid process name, an error is returned.
    pub fn new<S: AsRef<str>>(supervisor_id: S) -> Result<Self, SupervisorError> {
        // Catch invalid names as early as possible, rather than when the supervisor is first run.
        if Name::root(supervisor_id.as_ref()).is_none() {
            return Err(SupervisorError::InvalidName {
                name: supervisor_id.as_ref().to_string(),
            });
        }

        Ok(Self {
            supervisor_id: supervisor_id.as_ref().into(),
            restart_strategy: RestartStrategy::default(),
            backoff: BackoffConfig::default(),
            template: None,
            runtime_mode: RuntimeMode::default(),
            state: Arc::default(),
        })
    }

    /// Creates an empty simple one-for-one `Supervisor`.
    ///
    /// All children are instances of `template`, added and removed dynamically with
    /// [`SupervisorHandle::add_instance`] and [`SupervisorHandle::remove_child`]. Only a failed instance is restarted,
    /// and adding or removing an instance never affects its siblings.
    ///
    /// # Errors
    ///
    /// If the supervisor ID is not a valid process name, an error is returned.
    pub fn simple_one_for_one<S: AsRef<str>>(supervisor_id: S, template: ChildSpec) -> Result<Self, SupervisorError> {
        let mut supervisor = Self::new(supervisor_id)?;
        supervisor.restart_strategy = supervisor.restart_strategy.with_mode(RestartMode::SimpleOneForOne);
        supervisor.template = Some(template);
        Ok(supervisor)
    }

    /// Returns the supervisor's ID.
    pub fn id(&self) -> &str {
        &self.supervisor_id
    }

    /// Sets the restart strategy for the supervisor.
    ///
    /// A simple one-for-one supervisor always keeps its mode, and only takes the intensity and period from `strategy`.
    pub fn with_restart_strategy(mut self, strategy: RestartStrategy) -> Self {
        self.restart_strategy = if self.template.is_some() {
            strategy.with_mode(RestartMode::SimpleOneForOne)
        } else {
            strategy
        };
        self
    }

    /// Sets the backoff applied before restarting children.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Configures this supervisor to run in a dedicated runtime.
    ///
    /// When this supervisor is added as a child to another supervisor, it will spawn its own OS thread(s) and Tokio
    /// runtime instead of running on the parent's ambient runtime. Failures of the supervisor are still reported to
    /// the parent as ordinary child failures.
    pub fn with_dedicated_runtime(mut self, config: RuntimeConfiguration) -> Self {
        self.runtime_mode = RuntimeMode::Dedicated(config);
        self
    }

    /// Adds a child to the supervisor.
    ///
    /// Intended for building the supervisor before it runs; use [`SupervisorHandle::add_child`] to add children to a
    /// running supervisor.
    ///
    /// # Errors
    ///
    /// If the child ID is invalid or already in use, or this is a simple one-for-one supervisor, an error is
    /// returned.
    pub fn add_child(&mut self, spec: ChildSpec) -> Result<(), SupervisorError> {
        if self.template.is_some() {
            return Err(SupervisorError::TemplateOnly);
        }

        debug!(supervisor_id = %self.supervisor_id, child_id = spec.id(), "Adding static child process.");
        lock_state(&self.state).insert_child(spec)
    }

    /// Adds a nested supervisor as a child.
    ///
    /// # Errors
    ///
    /// If the supervisor ID is already in use by another child, an error is returned.
    pub fn add_supervisor(&mut self, supervisor: Supervisor) -> Result<(), SupervisorError> {
        self.add_child(ChildSpec::supervisor(supervisor))
    }

    /// Returns a handle for controlling and inspecting this supervisor's children.
    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            supervisor_id: Arc::clone(&self.supervisor_id),
            template: self.template.clone(),
            state: Arc::clone(&self.state),
        }
    }

    /// Runs the supervisor forever.
    ///
    /// # Errors
    ///
    /// If the supervisor exceeds its restart limits, an error is returned.
    pub async fn run(&mut self) -> Result<(), SupervisorError> {
        self.run_with_process_shutdown(ProcessShutdown::noop()).await
    }

    /// Runs the supervisor until shutdown is triggered.
    ///
    /// When `shutdown` resolves, the supervisor will shutdown all child processes in reverse start order, according to
    /// their shutdown strategy, and then return.
    ///
    /// # Errors
    ///
    /// If the supervisor exceeds its restart limits, an error is returned.
    pub async fn run_with_shutdown<F: Future + Send + 'static>(&mut self, shutdown: F) -> Result<(), SupervisorError> {
        self.run_with_process_shutdown(ProcessShutdown::wrapped(shutdown)).await
    }

    async fn run_with_process_shutdown(&mut self, process_shutdown: ProcessShutdown) -> Result<(), SupervisorError> {
        let process = Process::root(&*self.supervisor_id).context(InvalidName {
            name: self.supervisor_id.to_string(),
        })?;

        info!(supervisor_id = %self.supervisor_id, "Supervisor starting.");
        self.run_inner(process.clone(), process_shutdown)
            .into_instrumented(process)
            .await
    }

    pub(super) async fn run_inner(
        &self, process: Process, mut process_shutdown: ProcessShutdown,
    ) -> Result<(), SupervisorError> {
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let _running = RunningGuard::acquire(
            &self.supervisor_id,
            &self.state,
            control_tx,
            self.template.is_none(),
        )?;

        let mut sup_loop = SupervisorLoop::new(self, process);
        if let Err(e) = sup_loop.start_all() {
            sup_loop.stop_all().await;
            return Err(e);
        }

        let shutdown = process_shutdown.wait_for_shutdown();
        pin!(shutdown);

        let result = loop {
            select! {
                // Shutdown has been triggered.
                //
                // Propagate shutdown to all child processes and wait for them to exit.
                _ = &mut shutdown => {
                    debug!(supervisor_id = %self.supervisor_id, "Shutdown triggered, shutting down all child processes.");
                    break Ok(());
                },
                Some(control) = control_rx.recv() => sup_loop.handle_control(control).await,
                Some(exit) = sup_loop.workers.wait_for_next_worker(), if sup_loop.workers.has_pending() => {
                    if let Err(e) = sup_loop.handle_exit(exit).await {
                        break Err(e);
                    }
                },
            }
        };

        sup_loop.stop_all().await;
        debug!(supervisor_id = %self.supervisor_id, "Supervisor stopped.");
        result
    }

    fn inner_clone(&self) -> Self {
        // Not exposed as `Clone`, since two clones can never run at the same time: they share their children.
        Self {
            supervisor_id: Arc::clone(&self.supervisor_id),
            restart_strategy: self.restart_strategy,
            backoff: self.backoff.clone(),
            template: self.template.clone(),
            runtime_mode: self.runtime_mode.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

#[async_trait]
impl Supervisable for Supervisor {
    fn shutdown_strategy(&self) -> ShutdownStrategy {
        // Supervisors should always be given as much time as necessary to shut down gracefully so that the entire
        // supervision subtree can be stopped cleanly. Their own children are still bounded by their own strategies.
        ShutdownStrategy::Graceful(Duration::MAX)
    }

    async fn serve(&mut self, ctx: ProcessContext) -> Result<(), GenericError> {
        let (process, process_shutdown) = ctx.into_parts();
        match &self.runtime_mode {
            RuntimeMode::Ambient => {
                debug!(supervisor_id = %self.supervisor_id, "Nested supervisor starting.");
                self.run_inner(process, process_shutdown)
                    .await
                    .error_context("Nested supervisor failed to exit cleanly.")
            }
            RuntimeMode::Dedicated(config) => {
                debug!(supervisor_id = %self.supervisor_id, "Nested supervisor starting on dedicated runtime.");
                spawn_dedicated_runtime(self.inner_clone(), config.clone(), process, process_shutdown)?.await
            }
        }
    }
}

/// A handle for controlling a [`Supervisor`].
///
/// Operations on a running supervisor are queued to its control loop and applied in order, interleaved with the
/// handling of child exits. Operations on a supervisor that is not running apply directly to its child list, and take
/// effect the next time it runs.
#[derive(Clone)]
pub struct SupervisorHandle {
    supervisor_id: Arc<str>,
    template: Option<ChildSpec>,
    state: SharedState,
}

impl SupervisorHandle {
    /// Returns the supervisor's ID.
    pub fn id(&self) -> &str {
        &self.supervisor_id
    }

    /// Adds a child, starting it immediately if the supervisor is running.
    ///
    /// # Errors
    ///
    /// If the child ID is invalid or already in use, or this is a simple one-for-one supervisor, an error is
    /// returned.
    pub async fn add_child(&self, spec: ChildSpec) -> Result<(), SupervisorError> {
        if self.template.is_some() {
            return Err(SupervisorError::TemplateOnly);
        }

        self.add(spec).await
    }

    /// Adds a new instance of the template of a simple one-for-one supervisor.
    ///
    /// # Errors
    ///
    /// If the supervisor is not a simple one-for-one supervisor, or the ID is invalid or already in use, an error is
    /// returned.
    pub async fn add_instance<I: AsRef<str>>(&self, id: I) -> Result<(), SupervisorError> {
        let template = self.template.as_ref().context(NoTemplate)?;
        self.add(template.with_id(id.as_ref())).await
    }

    async fn add(&self, spec: ChildSpec) -> Result<(), SupervisorError> {
        let offline_spec = spec.clone();
        self.dispatch(
            |reply| Control::Add { spec, reply },
            move |state| state.insert_child(offline_spec),
        )
        .await
    }

    /// Removes a child, stopping it first if it is running or waiting to be restarted.
    ///
    /// # Errors
    ///
    /// If no child exists with the given ID, an error is returned.
    pub async fn remove_child<I: AsRef<str>>(&self, id: I) -> Result<(), SupervisorError> {
        let child_id: Arc<str> = id.as_ref().into();
        let offline_id = Arc::clone(&child_id);
        self.dispatch(
            |reply| Control::Remove { child_id, reply },
            move |state| state.remove_child(&offline_id),
        )
        .await
    }

    /// Restarts a child.
    ///
    /// The child is stopped, if running, and started again immediately. Its restart counter is incremented and its
    /// backoff is reset. Manual restarts do not count toward the supervisor's restart intensity.
    ///
    /// # Errors
    ///
    /// If the supervisor is not running, or no child exists with the given ID, an error is returned.
    pub async fn restart_child<I: AsRef<str>>(&self, id: I) -> Result<(), SupervisorError> {
        let child_id: Arc<str> = id.as_ref().into();
        self.dispatch(
            |reply| Control::Restart { child_id, reply },
            |_| Err(SupervisorError::NotRunning),
        )
        .await
    }

    /// Returns a snapshot of every child, in start order.
    pub fn children(&self) -> Vec<ChildInfo> {
        lock_state(&self.state)
            .children
            .iter()
            .map(|(id, entry)| ChildInfo {
                id: Arc::clone(id),
                state: entry.state,
                restart_count: entry.restart_count,
                restart_policy: entry.spec.restart_policy(),
            })
            .collect()
    }

    /// Returns `true` if the supervisor is currently running.
    pub fn is_running(&self) -> bool {
        lock_state(&self.state).control_tx.is_some()
    }

    async fn dispatch<C, O>(&self, make_control: C, offline: O) -> Result<(), SupervisorError>
    where
        C: FnOnce(oneshot::Sender<Result<(), SupervisorError>>) -> Control,
        O: FnOnce(&mut SupervisorState) -> Result<(), SupervisorError>,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut state = lock_state(&self.state);
            let sent = match state.control_tx.as_ref() {
                Some(control_tx) => control_tx.send(make_control(reply_tx)).is_ok(),
                None => false,
            };

            if !sent {
                return offline(&mut state);
            }
        }

        reply_rx.await.unwrap_or(Err(SupervisorError::NotRunning))
    }
}

struct ExitEvent {
    child_id: Arc<str>,
    generation: u64,
    ran_for: Duration,
    result: Result<(), ProcessError>,
}

impl ExitEvent {
    fn reason(&self) -> ExitReason {
        match &self.result {
            Ok(()) => ExitReason::Normal,
            Err(ProcessError::Aborted) => ExitReason::Shutdown,
            Err(_) => ExitReason::Abnormal,
        }
    }
}

struct SupervisorLoop {
    supervisor_id: Arc<str>,
    simple: bool,
    state: SharedState,
    restart_state: RestartState,
    backoff: ExponentialBackoff,
    reset_after: Duration,
    workers: WorkerState,
}

impl SupervisorLoop {
    fn new(supervisor: &Supervisor, process: Process) -> Self {
        Self {
            supervisor_id: Arc::clone(&supervisor.supervisor_id),
            simple: supervisor.template.is_some(),
            state: Arc::clone(&supervisor.state),
            restart_state: RestartState::new(supervisor.restart_strategy),
            backoff: supervisor.backoff.build(),
            reset_after: supervisor.backoff.reset_after(),
            workers: WorkerState::new(process, Arc::clone(&supervisor.state)),
        }
    }

    fn start_all(&mut self) -> Result<(), SupervisorError> {
        debug!(supervisor_id = %self.supervisor_id, "Spawning all child processes.");
        let child_ids = lock_state(&self.state).child_ids();
        for child_id in child_ids {
            self.spawn_child(&child_id, Duration::ZERO, false)?;
        }

        Ok(())
    }

    fn spawn_child(&mut self, child_id: &Arc<str>, delay: Duration, restarted: bool) -> Result<(), SupervisorError> {
        let (spec, generation) = {
            let mut state = lock_state(&self.state);
            let entry = state
                .children
                .get_mut(child_id)
                .context(UnknownChild { child_id: &**child_id })?;
            entry.generation += 1;
            entry.state = ChildState::Starting;
            if restarted {
                entry.restart_count += 1;
            }
            (entry.spec.clone(), entry.generation)
        };

        debug!(supervisor_id = %self.supervisor_id, child_id = %child_id, ?delay, "Spawning child process.");
        self.workers.add_worker(child_id, generation, &spec, delay)
    }

    async fn stop_all(&mut self) {
        debug!(supervisor_id = %self.supervisor_id, "Shutting down all child processes.");
        let child_ids = lock_state(&self.state).child_ids();
        for child_id in child_ids.iter().rev() {
            self.workers.stop_worker(child_id).await;
        }

        self.workers.stop_remaining().await;
    }

    async fn handle_control(&mut self, control: Control) {
        match control {
            Control::Add { spec, reply } => {
                let child_id = Arc::clone(&spec.id);
                let result = lock_state(&self.state).insert_child(spec);
                let result = match result {
                    Ok(()) => {
                        info!(supervisor_id = %self.supervisor_id, child_id = %child_id, "Adding child process.");
                        let spawned = self.spawn_child(&child_id, Duration::ZERO, false);
                        if spawned.is_err() {
                            let _ = lock_state(&self.state).remove_child(&child_id);
                        }
                        spawned
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Control::Remove { child_id, reply } => {
                let exists = lock_state(&self.state).children.contains_key(&child_id);
                let result = if exists {
                    info!(supervisor_id = %self.supervisor_id, child_id = %child_id, "Removing child process.");
                    self.workers.stop_worker(&child_id).await;
                    lock_state(&self.state).remove_child(&child_id)
                } else {
                    Err(SupervisorError::UnknownChild {
                        child_id: child_id.to_string(),
                    })
                };
                let _ = reply.send(result);
            }
            Control::Restart { child_id, reply } => {
                let exists = lock_state(&self.state).children.contains_key(&child_id);
                let result = if exists {
                    info!(supervisor_id = %self.supervisor_id, child_id = %child_id, "Manually restarting child process.");
                    self.workers.stop_worker(&child_id).await;
                    if let Some(entry) = lock_state(&self.state).children.get_mut(&child_id) {
                        entry.backoff.reset();
                    }
                    self.spawn_child(&child_id, Duration::ZERO, true)
                } else {
                    Err(SupervisorError::UnknownChild {
                        child_id: child_id.to_string(),
                    })
                };
                let _ = reply.send(result);
            }
        }
    }

    async fn handle_exit(&mut self, exit: ExitEvent) -> Result<(), SupervisorError> {
        let reason = exit.reason();
        let child_id = Arc::clone(&exit.child_id);

        let (policy, position) = {
            let state = lock_state(&self.state);
            match state.children.get_full(&*child_id) {
                Some((position, _, entry)) if entry.generation == exit.generation => {
                    (entry.spec.restart_policy(), position)
                }
                _ => {
                    debug!(supervisor_id = %self.supervisor_id, child_id = %child_id, "Ignoring exit of stale child process.");
                    return Ok(());
                }
            }
        };

        if !policy.should_restart(reason) {
            match &exit.result {
                Ok(()) => {
                    info!(supervisor_id = %self.supervisor_id, child_id = %child_id, ?policy, "Child process exited, not restarting.")
                }
                Err(e) => {
                    warn!(supervisor_id = %self.supervisor_id, child_id = %child_id, ?policy, error = %e, "Child process failed, not restarting.")
                }
            }

            let mut state = lock_state(&self.state);
            if self.simple {
                state.children.shift_remove(&*child_id);
            } else if let Some(entry) = state.children.get_mut(&*child_id) {
                entry.state = if reason == ExitReason::Abnormal {
                    ChildState::Failed
                } else {
                    ChildState::Stopped
                };
            }
            return Ok(());
        }

        let mode = match self.restart_state.evaluate_restart() {
            RestartAction::Restart(mode) => mode,
            RestartAction::Shutdown => {
                error!(supervisor_id = %self.supervisor_id, child_id = %child_id, result = ?exit.result, "Supervisor shutting down due to restart limits.");
                if let Some(entry) = lock_state(&self.state).children.get_mut(&*child_id) {
                    entry.state = ChildState::Failed;
                }
                return Err(SupervisorError::RestartLimitExceeded {
                    child_id: child_id.to_string(),
                });
            }
        };

        let delay = {
            let mut state = lock_state(&self.state);
            let clean_exit = reason == ExitReason::Normal;
            match state.children.get_mut(&*child_id) {
                Some(entry) => entry
                    .backoff
                    .next_delay(&mut self.backoff, self.reset_after, exit.ran_for, clean_exit),
                None => Duration::ZERO,
            }
        };

        let group = match mode {
            RestartMode::OneForOne | RestartMode::SimpleOneForOne => {
                warn!(supervisor_id = %self.supervisor_id, child_id = %child_id, result = ?exit.result, ?delay, "Child process terminated, restarting.");
                vec![Arc::clone(&child_id)]
            }
            RestartMode::OneForAll => {
                warn!(supervisor_id = %self.supervisor_id, child_id = %child_id, result = ?exit.result, ?delay, "Child process terminated, restarting all processes.");
                lock_state(&self.state).child_ids()
            }
            RestartMode::RestForOne => {
                warn!(supervisor_id = %self.supervisor_id, child_id = %child_id, result = ?exit.result, ?delay, "Child process terminated, restarting it and all processes started after it.");
                let child_ids = lock_state(&self.state).child_ids();
                child_ids.into_iter().skip(position).collect()
            }
        };

        self.restart_group(&child_id, &group, delay).await
    }

    async fn restart_group(
        &mut self, failed_child_id: &Arc<str>, group: &[Arc<str>], delay: Duration,
    ) -> Result<(), SupervisorError> {
        // Members that were already terminated by their restart policy stay terminated.
        let live_members = group
            .iter()
            .filter(|id| *id == failed_child_id || self.workers.is_live(id))
            .cloned()
            .collect::<Vec<_>>();

        for child_id in live_members.iter().rev() {
            if child_id != failed_child_id {
                self.workers.stop_worker(child_id).await;
            }
        }

        for child_id in &live_members {
            self.spawn_child(child_id, delay, true)?;
        }

        Ok(())
    }
}

struct ProcessState {
    child_id: Arc<str>,
    generation: u64,
    started_at: Instant,
    shutdown_strategy: ShutdownStrategy,
    shutdown_handle: ShutdownHandle,
    abort_handle: AbortHandle,
}

struct WorkerState {
    process: Process,
    state: SharedState,
    worker_tasks: JoinSet<Result<(), GenericError>>,
    worker_map: FastIndexMap<Id, ProcessState>,
    deferred: VecDeque<ExitEvent>,
}

impl WorkerState {
    fn new(process: Process, state: SharedState) -> Self {
        Self {
            process,
            state,
            worker_tasks: JoinSet::new(),
            worker_map: FastIndexMap::default(),
            deferred: VecDeque::new(),
        }
    }

    fn has_pending(&self) -> bool {
        !self.deferred.is_empty() || !self.worker_tasks.is_empty()
    }

    fn is_live(&self, child_id: &str) -> bool {
        self.worker_map.values().any(|ps| &*ps.child_id == child_id)
    }

    fn add_worker(
        &mut self, child_id: &Arc<str>, generation: u64, spec: &ChildSpec, delay: Duration,
    ) -> Result<(), SupervisorError> {
        let process = Process::scoped(&**child_id, &self.process).context(InvalidName {
            name: child_id.to_string(),
        })?;
        let (process_shutdown, shutdown_handle) = ProcessShutdown::paired();
        let mut ctx = ProcessContext::new(process.clone(), process_shutdown);

        let mut worker = spec.create();
        let shutdown_strategy = worker.shutdown_strategy();

        let state = Arc::clone(&self.state);
        let running_child_id = Arc::clone(child_id);
        let worker_future = async move {
            if !delay.is_zero() {
                select! {
                    _ = tokio::time::sleep(delay) => {},
                    _ = ctx.wait_for_shutdown() => return Ok(()),
                }
            }

            if let Some(entry) = lock_state(&state).children.get_mut(&*running_child_id) {
                if entry.generation == generation {
                    entry.state = ChildState::Running;
                }
            }

            worker.serve(ctx).await
        };

        let abort_handle = self.worker_tasks.spawn(worker_future.into_instrumented(process));
        self.worker_map.insert(
            abort_handle.id(),
            ProcessState {
                child_id: Arc::clone(child_id),
                generation,
                started_at: Instant::now() + delay,
                shutdown_strategy,
                shutdown_handle,
                abort_handle,
            },
        );
        Ok(())
    }

    fn exit_event(process_state: ProcessState, result: Result<Result<(), GenericError>, JoinError>) -> ExitEvent {
        let result = match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ProcessError::Terminated { source: e }),
            Err(e) => Err(ProcessError::from_join_error(e)),
        };

        ExitEvent {
            child_id: process_state.child_id,
            generation: process_state.generation,
            ran_for: Instant::now().saturating_duration_since(process_state.started_at),
            result,
        }
    }

    async fn wait_for_next_worker(&mut self) -> Option<ExitEvent> {
        if let Some(exit) = self.deferred.pop_front() {
            return Some(exit);
        }

        loop {
            let (worker_task_id, result) = match self.worker_tasks.join_next_with_id().await? {
                Ok((id, result)) => (id, Ok(result)),
                Err(e) => (e.id(), Err(e)),
            };

            // Tasks that were stopped on purpose have already been removed from the map.
            if let Some(process_state) = self.worker_map.shift_remove(&worker_task_id) {
                return Some(Self::exit_event(process_state, result));
            }
        }
    }

    /// Stops the worker for the given child, if it is live, and waits for it to exit.
    ///
    /// Other workers that exit while waiting are queued, and returned by subsequent calls to `wait_for_next_worker`.
    async fn stop_worker(&mut self, child_id: &str) -> bool {
        let Some(task_id) = self
            .worker_map
            .iter()
            .find(|(_, ps)| &*ps.child_id == child_id)
            .map(|(id, _)| *id)
        else {
            return false;
        };

        if let Some(process_state) = self.worker_map.shift_remove(&task_id) {
            self.stop_process(task_id, process_state).await;
        }
        true
    }

    /// Stops every worker still tracked, most recently spawned first.
    async fn stop_remaining(&mut self) {
        while let Some((task_id, process_state)) = self.worker_map.pop() {
            self.stop_process(task_id, process_state).await;
        }

        self.deferred.clear();
        debug_assert!(self.worker_tasks.is_empty(), "worker tasks should be empty after shutdown");
    }

    async fn stop_process(&mut self, target_task_id: Id, process_state: ProcessState) {
        let ProcessState {
            child_id,
            generation,
            shutdown_strategy,
            shutdown_handle,
            abort_handle,
            ..
        } = process_state;

        if let Some(entry) = lock_state(&self.state).children.get_mut(&*child_id) {
            if entry.generation == generation {
                entry.state = ChildState::Stopping;
            }
        }

        // Trigger the process to shutdown based on the configured shutdown strategy.
        let shutdown_deadline = match shutdown_strategy {
            ShutdownStrategy::Graceful(timeout) => {
                debug!(child_id = %child_id, shutdown_timeout = ?timeout, "Gracefully shutting down process.");
                shutdown_handle.trigger();
                tokio::time::sleep(timeout)
            }
            ShutdownStrategy::Brutal => {
                debug!(child_id = %child_id, "Forcefully aborting process.");
                abort_handle.abort();
                drop(shutdown_handle);

                // Already aborting, so the deadline must never fire.
                tokio::time::sleep(Duration::MAX)
            }
        };
        pin!(shutdown_deadline);
        let mut aborted = false;

        // Wait for the process to exit by driving the `JoinSet`. Other workers exiting in the meantime are queued.
        loop {
            select! {
                worker_result = self.worker_tasks.join_next_with_id() => {
                    let (worker_task_id, result) = match worker_result {
                        Some(Ok((id, result))) => (id, Ok(result)),
                        Some(Err(e)) => (e.id(), Err(e)),
                        None => break,
                    };

                    if worker_task_id == target_task_id {
                        debug!(child_id = %child_id, "Target process exited.");
                        break;
                    }

                    if let Some(other) = self.worker_map.shift_remove(&worker_task_id) {
                        debug!(child_id = %other.child_id, "Non-target process exited. Continuing to wait.");
                        self.deferred.push_back(Self::exit_event(other, result));
                    }
                },
                // We've exceeded the shutdown timeout, so we need to abort the process.
                _ = &mut shutdown_deadline, if !aborted => {
                    debug!(child_id = %child_id, "Shutdown timeout expired, forcefully aborting process.");
                    abort_handle.abort();
                    aborted = true;
                }
            }
        }

        if let Some(entry) = lock_state(&self.state).children.get_mut(&*child_id) {
            if entry.generation == generation {
                entry.state = ChildState::Stopped;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        future::pending,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use custos_error::generic_error;
    use tokio::{task::JoinHandle, time::timeout};

    use super::*;

    // -- Test infrastructure ---------------------------------------------------------------

    /// Behavior for a mock worker, decided each time an instance starts.
    #[derive(Clone, Copy)]
    enum RunBehavior {
        /// Runs until shutdown is received.
        UntilShutdown,
        /// Fails after the given delay.
        FailAfter(Duration),
        /// Returns cleanly after the given delay.
        ExitAfter(Duration),
        /// Panics immediately.
        Panic,
        /// Never returns, even after shutdown is received.
        IgnoreShutdown,
    }

    type EventLog = Arc<Mutex<Vec<String>>>;
    type BehaviorFn = Arc<dyn Fn(usize, &str) -> RunBehavior + Send + Sync>;

    /// A configurable mock child, producing a fresh worker for every start.
    #[derive(Clone)]
    struct Mock {
        label: &'static str,
        behavior: BehaviorFn,
        start_count: Arc<AtomicUsize>,
        start_times: Arc<Mutex<Vec<Instant>>>,
        log: EventLog,
        shutdown_strategy: ShutdownStrategy,
    }

    impl Mock {
        fn new<F>(label: &'static str, behavior: F) -> Self
        where
            F: Fn(usize, &str) -> RunBehavior + Send + Sync + 'static,
        {
            Self {
                label,
                behavior: Arc::new(behavior),
                start_count: Arc::new(AtomicUsize::new(0)),
                start_times: Arc::default(),
                log: Arc::default(),
                shutdown_strategy: ShutdownStrategy::Graceful(Duration::from_millis(500)),
            }
        }

        fn long_running(label: &'static str) -> Self {
            Self::new(label, |_, _| RunBehavior::UntilShutdown)
        }

        fn failing(label: &'static str, delay: Duration) -> Self {
            Self::new(label, move |_, _| RunBehavior::FailAfter(delay))
        }

        /// Fails after `delay` on each of its first `failures` starts, and then runs until shutdown.
        fn fail_first(label: &'static str, failures: usize, delay: Duration) -> Self {
            Self::new(label, move |start, _| {
                if start <= failures {
                    RunBehavior::FailAfter(delay)
                } else {
                    RunBehavior::UntilShutdown
                }
            })
        }

        fn with_log(mut self, log: &EventLog) -> Self {
            self.log = Arc::clone(log);
            self
        }

        fn with_shutdown_strategy(mut self, shutdown_strategy: ShutdownStrategy) -> Self {
            self.shutdown_strategy = shutdown_strategy;
            self
        }

        fn starts(&self) -> usize {
            self.start_count.load(Ordering::SeqCst)
        }

        fn spec(&self) -> ChildSpec {
            let mock = self.clone();
            ChildSpec::new(self.label, move || mock.clone())
        }

        fn record(&self, event: &str) {
            self.log.lock().unwrap().push(format!("{}:{}", event, self.label));
        }
    }

    #[async_trait]
    impl Supervisable for Mock {
        fn shutdown_strategy(&self) -> ShutdownStrategy {
            self.shutdown_strategy
        }

        async fn serve(&mut self, mut ctx: ProcessContext) -> Result<(), GenericError> {
            let start = self.start_count.fetch_add(1, Ordering::SeqCst) + 1;
            self.start_times.lock().unwrap().push(Instant::now());
            self.record("start");

            match (self.behavior)(start, ctx.name()) {
                RunBehavior::UntilShutdown => {
                    ctx.wait_for_shutdown().await;
                    self.record("stop");
                    Ok(())
                }
                RunBehavior::FailAfter(delay) => select! {
                    _ = tokio::time::sleep(delay) => {
                        self.record("fail");
                        Err(generic_error!("worker failed"))
                    }
                    _ = ctx.wait_for_shutdown() => {
                        self.record("stop");
                        Ok(())
                    }
                },
                RunBehavior::ExitAfter(delay) => {
                    select! {
                        _ = tokio::time::sleep(delay) => {},
                        _ = ctx.wait_for_shutdown() => {},
                    }
                    self.record("exit");
                    Ok(())
                }
                RunBehavior::Panic => panic!("worker panicked"),
                RunBehavior::IgnoreShutdown => pending().await,
            }
        }
    }

    fn start_supervisor(
        mut supervisor: Supervisor,
    ) -> (
        oneshot::Sender<()>,
        JoinHandle<Result<(), SupervisorError>>,
        SupervisorHandle,
    ) {
        let handle = supervisor.handle();
        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(async move { supervisor.run_with_shutdown(rx).await });
        (tx, task, handle)
    }

    async fn stop_supervisor(
        tx: oneshot::Sender<()>, task: JoinHandle<Result<(), SupervisorError>>,
    ) -> Result<(), SupervisorError> {
        let _ = tx.send(());
        timeout(Duration::from_secs(30), task).await.unwrap().unwrap()
    }

    fn restart_counts(handle: &SupervisorHandle) -> Vec<(String, usize)> {
        handle
            .children()
            .into_iter()
            .map(|child| (child.id().to_string(), child.restart_count()))
            .collect()
    }

    fn counts(expected: &[(&str, usize)]) -> Vec<(String, usize)> {
        expected.iter().map(|(id, count)| (id.to_string(), *count)).collect()
    }

    fn supervisor(id: &str, strategy: RestartStrategy) -> Supervisor {
        Supervisor::new(id)
            .unwrap()
            .with_restart_strategy(strategy)
            .with_backoff(BackoffConfig::immediate())
    }

    fn events_after(log: &EventLog, marker: &str) -> Vec<String> {
        let log = log.lock().unwrap();
        let position = log.iter().position(|event| event == marker).unwrap();
        log[position + 1..].to_vec()
    }

    // -- Supervisor run mode tests ---------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn standalone_supervisor_shuts_down_cleanly() {
        let mut sup = Supervisor::new("test-sup").unwrap();
        sup.add_child(Mock::long_running("worker1").spec()).unwrap();
        sup.add_child(Mock::long_running("worker2").spec()).unwrap();

        let (tx, task, handle) = start_supervisor(sup);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.is_running());
        assert!(handle.children().iter().all(|c| c.state() == ChildState::Running));

        assert!(stop_supervisor(tx, task).await.is_ok());
        assert!(!handle.is_running());
        assert!(handle.children().iter().all(|c| c.state() == ChildState::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn nested_supervisor_shuts_down_depth_first() {
        let log = EventLog::default();

        let mut child_sup = Supervisor::new("child-sup").unwrap();
        child_sup
            .add_child(Mock::long_running("inner").with_log(&log).spec())
            .unwrap();

        let mut parent_sup = Supervisor::new("parent-sup").unwrap();
        parent_sup
            .add_child(Mock::long_running("outer").with_log(&log).spec())
            .unwrap();
        parent_sup.add_supervisor(child_sup).unwrap();

        let (tx, task, _handle) = start_supervisor(parent_sup);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(stop_supervisor(tx, task).await.is_ok());

        // The nested supervisor was started last, so its subtree is stopped first.
        assert_eq!(events_after(&log, "start:inner"), vec!["stop:inner", "stop:outer"]);
    }

    #[tokio::test(start_paused = true)]
    async fn supervisor_with_no_children_returns_error() {
        let mut sup = Supervisor::new("empty-sup").unwrap();

        let (_tx, rx) = oneshot::channel::<()>();
        let result = sup.run_with_shutdown(rx).await;

        assert!(matches!(result, Err(SupervisorError::NoChildren)));
    }

    #[tokio::test(start_paused = true)]
    async fn supervisor_cannot_run_twice_concurrently() {
        let mut sup = Supervisor::new("test-sup").unwrap();
        sup.add_child(Mock::long_running("worker").spec()).unwrap();
        let mut twin = sup.inner_clone();

        let (tx, task, _handle) = start_supervisor(sup);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let result = twin.run_with_shutdown(pending::<()>()).await;
        assert!(matches!(result, Err(SupervisorError::AlreadyRunning { .. })));
        assert!(stop_supervisor(tx, task).await.is_ok());
    }

    #[test]
    fn invalid_names_are_rejected() {
        assert!(matches!(
            Supervisor::new("--"),
            Err(SupervisorError::InvalidName { .. })
        ));

        let mut sup = Supervisor::new("sup").unwrap();
        assert!(matches!(
            sup.add_child(Mock::long_running("").spec()),
            Err(SupervisorError::InvalidName { .. })
        ));
    }

    // -- Restart strategy tests ------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn one_for_one_restarts_only_failed_child() {
        let failing = Mock::failing("failing-worker", Duration::from_millis(50));
        let stable = Mock::long_running("stable-worker");

        let mut sup = supervisor(
            "test-sup",
            RestartStrategy::one_for_one().with_intensity_and_period(20, Duration::from_secs(10)),
        );
        sup.add_child(stable.spec()).unwrap();
        sup.add_child(failing.spec()).unwrap();

        let (tx, task, _handle) = start_supervisor(sup);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(stop_supervisor(tx, task).await.is_ok());

        assert!(failing.starts() >= 2, "failing worker should have been restarted");
        assert_eq!(stable.starts(), 1, "stable worker should not have been restarted");
    }

    #[tokio::test(start_paused = true)]
    async fn restart_storm_exceeding_intensity_is_fatal() {
        let flaky = Mock::failing("flaky", Duration::from_millis(100));

        let mut sup = supervisor(
            "test-sup",
            RestartStrategy::one_for_one().with_intensity_and_period(5, Duration::from_secs(10)),
        );
        sup.add_child(flaky.spec()).unwrap();

        let (_tx, task, handle) = start_supervisor(sup);
        let result = timeout(Duration::from_secs(30), task).await.unwrap().unwrap();

        // Five restarts are tolerated, and the sixth crash is fatal.
        match result {
            Err(SupervisorError::RestartLimitExceeded { child_id }) => assert_eq!(child_id, "flaky"),
            other => panic!("expected RestartLimitExceeded, got: {:?}", other),
        }
        assert_eq!(flaky.starts(), 6);
        assert_eq!(handle.children()[0].state(), ChildState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_within_intensity_are_tolerated() {
        let flaky = Mock::fail_first("flaky", 5, Duration::from_millis(100));
        let stable = Mock::long_running("stable");

        let mut sup = supervisor(
            "test-sup",
            RestartStrategy::one_for_one().with_intensity_and_period(5, Duration::from_secs(10)),
        );
        sup.add_child(stable.spec()).unwrap();
        sup.add_child(flaky.spec()).unwrap();

        let (tx, task, handle) = start_supervisor(sup);
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(!task.is_finished());
        assert_eq!(restart_counts(&handle), counts(&[("stable", 0), ("flaky", 5)]));
        assert!(handle.children().iter().all(|c| c.state() == ChildState::Running));
        assert!(stop_supervisor(tx, task).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn one_for_all_restarts_every_child_once() {
        let log = EventLog::default();
        let a = Mock::long_running("a").with_log(&log);
        let b = Mock::fail_first("b", 1, Duration::from_millis(50)).with_log(&log);
        let c = Mock::long_running("c").with_log(&log);

        let mut sup = supervisor(
            "test-sup",
            RestartStrategy::one_for_all().with_intensity_and_period(5, Duration::from_secs(10)),
        );
        for mock in [&a, &b, &c] {
            sup.add_child(mock.spec()).unwrap();
        }

        let (tx, task, handle) = start_supervisor(sup);
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(restart_counts(&handle), counts(&[("a", 1), ("b", 1), ("c", 1)]));
        assert_eq!((a.starts(), b.starts(), c.starts()), (2, 2, 2));

        // Stopped in reverse start order, restarted in start order.
        assert_eq!(
            events_after(&log, "fail:b"),
            vec!["stop:c", "stop:a", "start:a", "start:b", "start:c"]
        );

        assert!(stop_supervisor(tx, task).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn rest_for_one_restarts_later_children_only() {
        let log = EventLog::default();
        let a = Mock::long_running("a").with_log(&log);
        let b = Mock::long_running("b").with_log(&log);
        let c = Mock::fail_first("c", 1, Duration::from_millis(50)).with_log(&log);
        let d = Mock::long_running("d").with_log(&log);

        let mut sup = supervisor(
            "test-sup",
            RestartStrategy::rest_for_one().with_intensity_and_period(5, Duration::from_secs(10)),
        );
        for mock in [&a, &b, &c, &d] {
            sup.add_child(mock.spec()).unwrap();
        }

        let (tx, task, handle) = start_supervisor(sup);
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(
            restart_counts(&handle),
            counts(&[("a", 0), ("b", 0), ("c", 1), ("d", 1)])
        );
        assert_eq!((a.starts(), b.starts(), c.starts(), d.starts()), (1, 1, 2, 2));

        // Only the children started after the failed one are stopped, and they are restarted in start order.
        assert_eq!(events_after(&log, "fail:c"), vec!["stop:d", "start:c", "start:d"]);

        assert!(stop_supervisor(tx, task).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn simple_one_for_one_instances_are_independent() {
        let failed_once = Arc::new(Mutex::new(HashSet::new()));
        let template = Mock::new("template", move |_, name| {
            if name.ends_with(".w2") && failed_once.lock().unwrap().insert(name.to_string()) {
                RunBehavior::FailAfter(Duration::from_millis(50))
            } else {
                RunBehavior::UntilShutdown
            }
        });

        let sup = Supervisor::simple_one_for_one("pool", template.spec())
            .unwrap()
            .with_restart_strategy(RestartStrategy::one_for_all().with_intensity_and_period(5, Duration::from_secs(10)))
            .with_backoff(BackoffConfig::immediate());

        let (tx, task, handle) = start_supervisor(sup);
        for id in ["w1", "w2", "w3"] {
            handle.add_instance(id).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(500)).await;

        // The strategy mode is pinned to simple one-for-one, so only the failed instance restarted.
        assert_eq!(restart_counts(&handle), counts(&[("w1", 0), ("w2", 1), ("w3", 0)]));

        handle.remove_child("w3").await.unwrap();
        assert_eq!(restart_counts(&handle), counts(&[("w1", 0), ("w2", 1)]));
        assert_eq!(template.starts(), 4);

        assert!(matches!(
            handle.add_instance("w1").await,
            Err(SupervisorError::DuplicateChild { .. })
        ));
        assert!(matches!(
            handle.add_child(Mock::long_running("other").spec()).await,
            Err(SupervisorError::TemplateOnly)
        ));

        assert!(stop_supervisor(tx, task).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn remove_during_backoff_cancels_pending_restart() {
        let template = Mock::fail_first("template", 1, Duration::from_millis(10));
        let sup = Supervisor::simple_one_for_one("pool", template.spec())
            .unwrap()
            .with_restart_strategy(RestartStrategy::one_for_one().with_intensity_and_period(5, Duration::from_secs(60)))
            .with_backoff(BackoffConfig::new(Duration::from_secs(10), Duration::from_secs(10)));

        let (tx, task, handle) = start_supervisor(sup);
        handle.add_instance("w1").await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        // The instance failed and is waiting out its backoff.
        let children = handle.children();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].state(), ChildState::Starting);
        assert_eq!(children[0].restart_count(), 1);

        handle.remove_child("w1").await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(template.starts(), 1);
        assert!(handle.children().is_empty());
        assert!(stop_supervisor(tx, task).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn manual_restart_does_not_count_toward_intensity() {
        let worker = Mock::long_running("worker");
        let mut sup = supervisor(
            "test-sup",
            RestartStrategy::one_for_one().with_intensity_and_period(0, Duration::from_secs(10)),
        );
        sup.add_child(worker.spec()).unwrap();

        let (tx, task, handle) = start_supervisor(sup);
        tokio::time::sleep(Duration::from_millis(50)).await;

        handle.restart_child("worker").await.unwrap();
        handle.restart_child("worker").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!task.is_finished());
        assert_eq!(worker.starts(), 3);
        assert_eq!(restart_counts(&handle), counts(&[("worker", 2)]));
        assert!(matches!(
            handle.restart_child("missing").await,
            Err(SupervisorError::UnknownChild { .. })
        ));

        assert!(stop_supervisor(tx, task).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_policies_follow_exit_reason() {
        let transient = Mock::new("transient", |_, _| RunBehavior::ExitAfter(Duration::from_millis(50)));
        let temporary = Mock::failing("temporary", Duration::from_millis(50));
        let permanent = Mock::new("permanent", |start, _| {
            if start == 1 {
                RunBehavior::ExitAfter(Duration::from_millis(50))
            } else {
                RunBehavior::UntilShutdown
            }
        });
        let flaky_transient = Mock::fail_first("flaky_transient", 1, Duration::from_millis(50));

        let mut sup = supervisor(
            "test-sup",
            RestartStrategy::one_for_one().with_intensity_and_period(10, Duration::from_secs(10)),
        );
        sup.add_child(transient.spec().with_restart_policy(RestartPolicy::Transient))
            .unwrap();
        sup.add_child(temporary.spec().with_restart_policy(RestartPolicy::Temporary))
            .unwrap();
        sup.add_child(permanent.spec()).unwrap();
        sup.add_child(flaky_transient.spec().with_restart_policy(RestartPolicy::Transient))
            .unwrap();

        let (tx, task, handle) = start_supervisor(sup);
        tokio::time::sleep(Duration::from_millis(500)).await;

        let states = handle
            .children()
            .into_iter()
            .map(|c| (c.id().to_string(), c.state(), c.restart_count()))
            .collect::<Vec<_>>();
        assert_eq!(
            states,
            vec![
                ("transient".to_string(), ChildState::Stopped, 0),
                ("temporary".to_string(), ChildState::Failed, 0),
                ("permanent".to_string(), ChildState::Running, 1),
                ("flaky_transient".to_string(), ChildState::Running, 1),
            ]
        );
        assert_eq!((transient.starts(), temporary.starts()), (1, 1));

        assert!(stop_supervisor(tx, task).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_child_is_restarted() {
        let worker = Mock::new("worker", |start, _| {
            if start == 1 {
                RunBehavior::Panic
            } else {
                RunBehavior::UntilShutdown
            }
        });

        let mut sup = supervisor(
            "test-sup",
            RestartStrategy::one_for_one().with_intensity_and_period(5, Duration::from_secs(10)),
        );
        sup.add_child(worker.spec().with_restart_policy(RestartPolicy::Transient))
            .unwrap();

        let (tx, task, handle) = start_supervisor(sup);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(worker.starts(), 2);
        assert_eq!(restart_counts(&handle), counts(&[("worker", 1)]));
        assert!(stop_supervisor(tx, task).await.is_ok());
    }

    // -- Backoff tests ---------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn restart_delays_grow_exponentially_and_cap() {
        let worker = Mock::failing("worker", Duration::ZERO);

        let mut sup = Supervisor::new("test-sup")
            .unwrap()
            .with_restart_strategy(
                RestartStrategy::one_for_one().with_intensity_and_period(100, Duration::from_secs(3600)),
            )
            .with_backoff(BackoffConfig::new(Duration::from_secs(1), Duration::from_secs(4)));
        sup.add_child(worker.spec()).unwrap();

        let (tx, task, _handle) = start_supervisor(sup);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(stop_supervisor(tx, task).await.is_ok());

        let start_times = worker.start_times.lock().unwrap().clone();
        assert!(start_times.len() >= 6, "expected at least six starts, got {}", start_times.len());

        let gaps = start_times
            .windows(2)
            .take(5)
            .map(|pair| pair[1].duration_since(pair[0]))
            .collect::<Vec<_>>();
        let expected = [1, 2, 4, 4, 4].map(Duration::from_secs);
        for (gap, expected) in gaps.iter().zip(expected) {
            assert!(
                *gap >= expected && *gap < expected + Duration::from_millis(100),
                "gaps: {:?}",
                gaps
            );
        }
    }

    // -- Escalation tests ------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn nested_supervisor_failure_escalates_to_parent() {
        let inner_worker = Mock::failing("inner_worker", Duration::from_millis(50));

        let mut child_sup = supervisor(
            "child_sup",
            RestartStrategy::one_for_one().with_intensity_and_period(0, Duration::from_secs(10)),
        );
        child_sup.add_child(inner_worker.spec()).unwrap();

        let mut parent_sup = supervisor(
            "parent_sup",
            RestartStrategy::one_for_one().with_intensity_and_period(1, Duration::from_secs(10)),
        );
        parent_sup.add_supervisor(child_sup).unwrap();

        let (_tx, task, _handle) = start_supervisor(parent_sup);
        let result = timeout(Duration::from_secs(30), task).await.unwrap().unwrap();

        // The parent restarted the nested supervisor once, then exceeded its own limit on the second failure.
        match result {
            Err(SupervisorError::RestartLimitExceeded { child_id }) => assert_eq!(child_id, "child_sup"),
            other => panic!("expected RestartLimitExceeded, got: {:?}", other),
        }
        assert_eq!(inner_worker.starts(), 2);
    }

    // -- Runtime control tests -------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn children_can_be_added_and_removed_while_running() {
        let log = EventLog::default();
        let a = Mock::long_running("a").with_log(&log);
        let b = Mock::long_running("b").with_log(&log);

        let mut sup = Supervisor::new("test-sup").unwrap();
        sup.add_child(a.spec()).unwrap();

        let (tx, task, handle) = start_supervisor(sup);
        handle.add_child(b.spec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(b.starts(), 1);

        assert!(matches!(
            handle.add_child(b.spec()).await,
            Err(SupervisorError::DuplicateChild { .. })
        ));
        assert!(matches!(
            handle.add_instance("c").await,
            Err(SupervisorError::NoTemplate)
        ));

        handle.remove_child("a").await.unwrap();
        assert!(log.lock().unwrap().contains(&"stop:a".to_string()));
        assert_eq!(restart_counts(&handle), counts(&[("b", 0)]));
        assert!(matches!(
            handle.remove_child("a").await,
            Err(SupervisorError::UnknownChild { .. })
        ));

        assert!(stop_supervisor(tx, task).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn operations_on_stopped_supervisor_apply_on_next_run() {
        let a = Mock::long_running("a");
        let sup = Supervisor::new("test-sup").unwrap();
        let handle = sup.handle();

        handle.add_child(a.spec()).await.unwrap();
        assert!(!handle.is_running());
        assert_eq!(handle.children()[0].state(), ChildState::Stopped);
        assert!(matches!(
            handle.restart_child("a").await,
            Err(SupervisorError::NotRunning)
        ));

        let (tx, task, _) = start_supervisor(sup);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(a.starts(), 1);
        assert!(stop_supervisor(tx, task).await.is_ok());
    }

    // -- Shutdown responsiveness tests -----------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn unresponsive_child_is_aborted_after_graceful_timeout() {
        let stubborn = Mock::new("stubborn", |_, _| RunBehavior::IgnoreShutdown)
            .with_shutdown_strategy(ShutdownStrategy::Graceful(Duration::from_secs(1)));
        let brutal = Mock::long_running("brutal").with_shutdown_strategy(ShutdownStrategy::Brutal);

        let mut sup = Supervisor::new("test-sup").unwrap();
        sup.add_child(stubborn.spec()).unwrap();
        sup.add_child(brutal.spec()).unwrap();

        let (tx, task, _handle) = start_supervisor(sup);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stopping_at = Instant::now();
        assert!(stop_supervisor(tx, task).await.is_ok());
        assert!(stopping_at.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_backoff_completes_promptly() {
        let worker = Mock::failing("worker", Duration::ZERO);
        let mut sup = Supervisor::new("test-sup")
            .unwrap()
            .with_restart_strategy(RestartStrategy::one_for_one().with_intensity_and_period(5, Duration::from_secs(10)))
            .with_backoff(BackoffConfig::new(Duration::from_secs(60), Duration::from_secs(60)));
        sup.add_child(worker.spec()).unwrap();

        let (tx, task, _handle) = start_supervisor(sup);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stopping_at = Instant::now();
        assert!(stop_supervisor(tx, task).await.is_ok());
        assert!(stopping_at.elapsed() < Duration::from_secs(1));
        assert_eq!(worker.starts(), 1);
    }

    #[tokio::test]
    async fn dedicated_runtime_supervisor_runs_and_stops() {
        let inner = Mock::long_running("inner");

        let mut child_sup = Supervisor::new("dedicated")
            .unwrap()
            .with_dedicated_runtime(RuntimeConfiguration::single_threaded());
        child_sup.add_child(inner.spec()).unwrap();
        let child_handle = child_sup.handle();

        let mut parent_sup = Supervisor::new("parent").unwrap();
        parent_sup.add_supervisor(child_sup).unwrap();

        let (tx, task, _handle) = start_supervisor(parent_sup);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(inner.starts(), 1);
        assert!(child_handle.is_running());

        assert!(stop_supervisor(tx, task).await.is_ok());
        assert!(!child_handle.is_running());
    }
}
