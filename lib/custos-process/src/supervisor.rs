use std::{
    process::ExitStatus,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering::Relaxed},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use custos_core::{
    runtime::{ChildSpec, ProcessContext, ShutdownStrategy, Supervisable},
    task::spawn_traced_named,
};
use custos_error::{ErrorContext as _, GenericError};
use custos_ipc::Connection;
use tokio::{
    select,
    sync::{mpsc, watch},
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    health::{HealthMonitor, Telemetry, Verdict},
    instance::Instance,
    CustomCheck, HealthReport, OsProcessHandle, ProcessSnapshot, RecycleReason, WorkerError, WorkerSpec,
};

// How long to wait for the worker process to be reaped once its connection closes.
const CONNECTION_LOSS_GRACE_PERIOD: Duration = Duration::from_secs(1);

/// State of a worker shared between its supervisor, health monitor, and handles.
///
/// Outlives individual worker processes, so that handles stay valid across restarts and recycles.
pub(crate) struct WorkerState {
    name: Arc<str>,
    connection: Mutex<Option<Connection>>,
    pid: AtomicU32,
    request_count: AtomicU64,
    recycle_count: AtomicU64,
    ready: AtomicBool,
    health_tx: watch::Sender<HealthReport>,
    telemetry: Telemetry,
}

impl WorkerState {
    fn new(name: &str) -> Self {
        let (health_tx, _) = watch::channel(HealthReport::stopped());
        Self {
            name: name.into(),
            connection: Mutex::new(None),
            pid: AtomicU32::new(0),
            request_count: AtomicU64::new(0),
            recycle_count: AtomicU64::new(0),
            ready: AtomicBool::new(false),
            health_tx,
            telemetry: Telemetry::new(name),
        }
    }

    fn lock_connection(&self) -> MutexGuard<'_, Option<Connection>> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub(crate) fn connection(&self) -> Option<Connection> {
        self.lock_connection().clone()
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        match self.pid.load(Relaxed) {
            0 => None,
            pid => Some(pid),
        }
    }

    pub(crate) fn request_count(&self) -> u64 {
        self.request_count.load(Relaxed)
    }

    pub(crate) fn record_request(&self) {
        let request_count = self.request_count.fetch_add(1, Relaxed) + 1;
        self.telemetry.update_requests(request_count);
    }

    pub(crate) fn recycle_count(&self) -> u64 {
        self.recycle_count.load(Relaxed)
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.ready.load(Relaxed)
    }

    pub(crate) fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Relaxed);
        self.telemetry.update_readiness(ready);
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<HealthReport> {
        self.health_tx.subscribe()
    }

    pub(crate) fn publish(&self, report: HealthReport) {
        self.health_tx.send_replace(report);
    }

    fn attach(&self, instance: &Instance, spec: &WorkerSpec, has_custom_check: bool) {
        *self.lock_connection() = Some(instance.connection.clone());
        self.request_count.store(0, Relaxed);
        self.telemetry.update_requests(0);
        self.telemetry.reset_liveness();

        // Without readiness checks, a connected worker is assumed to be ready.
        self.set_ready(!spec.health_check.readiness_enabled);
        self.publish(HealthReport::started(instance.pid, &spec.health_check, has_custom_check));
        self.pid.store(instance.pid, Relaxed);
    }

    fn detach(&self) {
        self.pid.store(0, Relaxed);
        *self.lock_connection() = None;
        self.set_ready(false);
        self.telemetry.reset_liveness();
        self.publish(HealthReport::stopped());
    }

    fn record_recycle(&self) {
        self.recycle_count.fetch_add(1, Relaxed);
        self.telemetry.increment_recycles();
    }
}

enum InstanceOutcome {
    Shutdown,
    Exited(ExitStatus),
    Recycle(RecycleReason),
    Failed(WorkerError),
}

/// Supervises a worker as an external operating system process.
///
/// Each call to `serve` spawns a worker process from the [`WorkerSpec`], monitors its health, and keeps it running
/// until the process is asked to shut down or fails:
///
/// - a process exiting with a success status is a normal exit, while any other exit is a failure
/// - a process failing its liveness or custom health checks is stopped, and fails
/// - a process exceeding its memory limit or maximum request count is recycled: stopped gracefully and replaced by a
///   fresh process, within the same call to `serve`, so the recycle is never seen as a failure by the supervisor
///
/// Clones share the same [`OsProcessHandle`], which makes [`child_spec`][OsProcessSupervisor::child_spec] a natural fit
/// for adding the worker to a supervisor.
#[derive(Clone)]
pub struct OsProcessSupervisor {
    spec: Arc<WorkerSpec>,
    custom_check: Option<CustomCheck>,
    state: Arc<WorkerState>,
}

impl OsProcessSupervisor {
    /// Creates a new `OsProcessSupervisor` for the given worker.
    pub fn new(spec: WorkerSpec) -> Self {
        let state = Arc::new(WorkerState::new(&spec.name));
        Self {
            spec: Arc::new(spec),
            custom_check: None,
            state,
        }
    }

    /// Sets a custom health check.
    ///
    /// The check runs on every resource check of the worker. If it returns an error, the worker is stopped and fails.
    pub fn with_custom_check<F>(mut self, check: F) -> Self
    where
        F: Fn(&ProcessSnapshot) -> Result<(), GenericError> + Send + Sync + 'static,
    {
        self.custom_check = Some(Arc::new(check));
        self
    }

    /// Returns the worker specification.
    pub fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    /// Returns a handle to the worker.
    pub fn handle(&self) -> OsProcessHandle {
        OsProcessHandle::new(Arc::clone(&self.state))
    }

    /// Creates a child specification for running the worker under a supervisor.
    ///
    /// The child ID is the worker name, and the restart policy is the one from the worker specification.
    pub fn child_spec(&self) -> ChildSpec {
        let supervisor = self.clone();
        ChildSpec::new(&self.spec.name, move || supervisor.clone()).with_restart_policy(self.spec.restart_policy)
    }

    async fn watch_instance(
        &self, ctx: &mut ProcessContext, instance: &mut Instance, verdicts: &mut mpsc::Receiver<Verdict>,
    ) -> InstanceOutcome {
        let connection = instance.connection.clone();

        select! {
            biased;

            _ = ctx.wait_for_shutdown() => InstanceOutcome::Shutdown,
            status = instance.child.wait() => match status {
                Ok(status) => InstanceOutcome::Exited(status),
                Err(source) => InstanceOutcome::Failed(WorkerError::Wait { source }),
            },
            Some(verdict) = verdicts.recv() => match verdict {
                Verdict::Unhealthy(e) => InstanceOutcome::Failed(e),
                Verdict::Recycle(reason) => InstanceOutcome::Recycle(reason),
            },
            _ = connection.closed() => {
                // The connection usually closes because the process is exiting.
                match timeout(CONNECTION_LOSS_GRACE_PERIOD, instance.child.wait()).await {
                    Ok(Ok(status)) => InstanceOutcome::Exited(status),
                    _ => InstanceOutcome::Failed(WorkerError::ConnectionLost),
                }
            }
        }
    }
}

#[async_trait]
impl Supervisable for OsProcessSupervisor {
    fn shutdown_strategy(&self) -> ShutdownStrategy {
        // Leave room for the graceful stop, and the kill that may follow it.
        ShutdownStrategy::Graceful(self.spec.shutdown_timeout.saturating_mul(2) + Duration::from_secs(1))
    }

    async fn serve(&mut self, mut ctx: ProcessContext) -> Result<(), GenericError> {
        let process_name = ctx.name().to_string();

        loop {
            let mut instance = select! {
                _ = ctx.wait_for_shutdown() => return Ok(()),
                result = Instance::spawn(&self.spec, &process_name) => result
                    .with_error_context(|| format!("Failed to start worker '{}'.", self.spec.name))?,
            };
            let pid = instance.pid;

            self.state.attach(&instance, &self.spec, self.custom_check.is_some());
            info!(worker = self.state.name(), pid, "Worker process started.");

            let (monitor_shutdown, monitor_handle) = ctx.child_shutdown();
            let (verdict_tx, mut verdict_rx) = mpsc::channel(1);
            let monitor = HealthMonitor::new(
                Arc::clone(&self.state),
                &self.spec,
                self.custom_check.clone(),
                pid,
                instance.connection.clone(),
                verdict_tx,
            );
            let monitor_task = spawn_traced_named(format!("{}-health", process_name), monitor.run(monitor_shutdown));

            let outcome = self.watch_instance(&mut ctx, &mut instance, &mut verdict_rx).await;

            monitor_handle.trigger();
            self.state.detach();

            let result = match outcome {
                InstanceOutcome::Shutdown => {
                    debug!(worker = self.state.name(), pid, "Stopping worker process.");
                    instance.stop(self.spec.shutdown_timeout).await;
                    Some(Ok(()))
                }
                InstanceOutcome::Recycle(reason) => {
                    info!(worker = self.state.name(), pid, %reason, "Recycling worker process.");
                    instance.stop(self.spec.shutdown_timeout).await;
                    self.state.record_recycle();
                    None
                }
                InstanceOutcome::Exited(status) if status.success() => {
                    info!(worker = self.state.name(), pid, "Worker process exited normally.");
                    instance.connection.close();
                    Some(Ok(()))
                }
                InstanceOutcome::Exited(status) => {
                    warn!(worker = self.state.name(), pid, %status, "Worker process exited unexpectedly.");
                    instance.connection.close();
                    Some(Err(WorkerError::Exited { status }))
                }
                InstanceOutcome::Failed(e) => {
                    warn!(worker = self.state.name(), pid, error = %e, "Worker process failed.");
                    if matches!(e, WorkerError::LivenessFailed { .. }) {
                        instance.kill().await;
                    } else {
                        instance.stop(self.spec.shutdown_timeout).await;
                    }
                    Some(Err(e))
                }
            };

            if monitor_task.await.is_err() {
                debug!(worker = self.state.name(), "Health monitor task did not complete cleanly.");
            }

            if let Some(result) = result {
                return result.map_err(Into::into);
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use custos_core::runtime::{ProcessShutdown, ShutdownHandle};
    use custos_error::generic_error;
    use serde_json::json;
    use tokio::{task::JoinHandle, time::sleep};

    use super::*;
    use crate::HealthCheckConfig;

    fn shell(name: &str, script: &str) -> WorkerSpec {
        WorkerSpec::new(name, "/bin/sh")
            .with_args(["-c", script])
            .with_shutdown_timeout(Duration::from_millis(200))
            .with_health_check(
                HealthCheckConfig::default()
                    .without_liveness()
                    .without_readiness()
                    .with_resource_interval(Duration::from_millis(50)),
            )
    }

    fn serve(supervisor: &OsProcessSupervisor) -> (ShutdownHandle, JoinHandle<Result<(), GenericError>>) {
        let (shutdown, handle) = ProcessShutdown::paired();
        let ctx = ProcessContext::detached(&supervisor.spec().name, shutdown).unwrap();
        let mut supervisor = supervisor.clone();
        let task = tokio::spawn(async move { supervisor.serve(ctx).await });
        (handle, task)
    }

    async fn wait_for_pid(handle: &OsProcessHandle) -> u32 {
        for _ in 0..200 {
            if let Some(pid) = handle.pid() {
                return pid;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("worker process never started");
    }

    fn worker_error(error: &GenericError) -> &WorkerError {
        error
            .chain()
            .find_map(|e| e.downcast_ref::<WorkerError>())
            .expect("error should be a worker error")
    }

    #[tokio::test]
    async fn clean_exit_is_normal() {
        let supervisor = OsProcessSupervisor::new(shell("clean", "exit 0"));
        let (_shutdown, task) = serve(&supervisor);

        task.await.unwrap().unwrap();
        assert_eq!(supervisor.handle().pid(), None);
    }

    #[tokio::test]
    async fn failed_exit_is_an_error() {
        let supervisor = OsProcessSupervisor::new(shell("crash", "exit 3"));
        let (_shutdown, task) = serve(&supervisor);

        let error = task.await.unwrap().unwrap_err();
        match worker_error(&error) {
            WorkerError::Exited { status } => assert_eq!(status.code(), Some(3)),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error() {
        let spec = WorkerSpec::new("missing", "/nonexistent/custos-worker");
        let supervisor = OsProcessSupervisor::new(spec);
        let (_shutdown, task) = serve(&supervisor);

        let error = task.await.unwrap().unwrap_err();
        assert!(matches!(worker_error(&error), WorkerError::Spawn { .. }));
    }

    #[tokio::test]
    async fn shutdown_kills_unresponsive_worker() {
        let supervisor = OsProcessSupervisor::new(shell("sleepy", "exec sleep 30"));
        let handle = supervisor.handle();
        let (shutdown, task) = serve(&supervisor);

        wait_for_pid(&handle).await;
        assert!(handle.is_ready());

        // The worker ignores the shutdown request, so it is killed once the shutdown timeout elapses.
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("worker should be killed after the shutdown timeout")
            .unwrap()
            .unwrap();
        assert_eq!(handle.pid(), None);
        assert!(!handle.is_ready());
    }

    #[tokio::test]
    async fn unresponsive_worker_fails_liveness() {
        let spec = shell("deaf", "exec sleep 30").with_health_check(
            HealthCheckConfig::default()
                .with_liveness(Duration::from_millis(50), Duration::from_millis(50))
                .with_failure_threshold(2)
                .without_readiness(),
        );
        let supervisor = OsProcessSupervisor::new(spec);
        let (_shutdown, task) = serve(&supervisor);

        let error = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("liveness failures should fail the worker")
            .unwrap()
            .unwrap_err();
        assert!(matches!(worker_error(&error), WorkerError::LivenessFailed { failures: 2 }));
    }

    #[tokio::test]
    async fn custom_check_failure_fails_worker() {
        let supervisor = OsProcessSupervisor::new(shell("custom", "exec sleep 30"))
            .with_custom_check(|snapshot| Err(generic_error!("pid {} is not welcome", snapshot.pid)));
        let health = supervisor.handle().health();
        let (_shutdown, task) = serve(&supervisor);

        let error = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("custom check should fail the worker")
            .unwrap()
            .unwrap_err();
        assert!(matches!(worker_error(&error), WorkerError::CustomCheckFailed { .. }));
        assert_eq!(health.borrow().pid, None);
    }

    #[tokio::test]
    async fn max_requests_recycles_worker() {
        let spec = shell("recycled", "exec sleep 30").with_max_requests(2);
        let supervisor = OsProcessSupervisor::new(spec);
        let handle = supervisor.handle();
        let (shutdown, task) = serve(&supervisor);

        let first_pid = wait_for_pid(&handle).await;

        // Nothing answers, but every request still counts against the worker.
        for _ in 0..2 {
            let _ = handle.cast(json!("work"));
        }
        assert_eq!(handle.request_count(), 2);

        let mut second_pid = first_pid;
        for _ in 0..200 {
            if handle.recycle_count() == 1 {
                if let Some(pid) = handle.pid() {
                    second_pid = pid;
                    break;
                }
            }
            sleep(Duration::from_millis(10)).await;
        }

        assert_ne!(first_pid, second_pid);
        assert_eq!(handle.recycle_count(), 1);
        assert_eq!(handle.request_count(), 0);

        shutdown.trigger();
        task.await.unwrap().unwrap();
    }
}
