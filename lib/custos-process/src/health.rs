use std::{
    fmt,
    sync::Arc,
    time::{Duration, SystemTime},
};

use custos_core::runtime::ProcessShutdown;
use custos_error::GenericError;
use custos_ipc::{control, Connection};
use metrics::{counter, gauge, Counter, Gauge};
use process_memory::Querier;
use serde_json::Value;
use tokio::{
    select,
    sync::mpsc,
    time::{interval_at, Instant, Interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{supervisor::WorkerState, HealthCheckConfig, WorkerError, WorkerSpec};

/// Outcome of a single kind of health check.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CheckStatus {
    /// The check has not completed yet.
    #[default]
    Unknown,

    /// The check is not configured.
    Disabled,

    /// The last check passed.
    Passing,

    /// The last check failed.
    Failing,
}

/// Health of an external worker, as of the latest monitoring tick.
#[derive(Clone, Debug)]
pub struct HealthReport {
    /// When the report was last updated.
    pub timestamp: SystemTime,

    /// Process ID of the running worker, if any.
    pub pid: Option<u32>,

    /// Resident memory of the worker, if known.
    pub memory_usage_bytes: Option<u64>,

    /// Number of requests sent to the current worker process.
    pub request_count: u64,

    /// Status of the liveness check.
    pub liveness: CheckStatus,

    /// Status of the readiness check.
    pub readiness: CheckStatus,

    /// Status of the custom check.
    pub custom: CheckStatus,

    /// Most recent check failure.
    pub last_error: Option<String>,
}

impl HealthReport {
    pub(crate) fn stopped() -> Self {
        Self {
            timestamp: SystemTime::now(),
            pid: None,
            memory_usage_bytes: None,
            request_count: 0,
            liveness: CheckStatus::Unknown,
            readiness: CheckStatus::Unknown,
            custom: CheckStatus::Unknown,
            last_error: None,
        }
    }

    pub(crate) fn started(pid: u32, config: &HealthCheckConfig, has_custom_check: bool) -> Self {
        let enabled_or_disabled = |enabled| {
            if enabled {
                CheckStatus::Unknown
            } else {
                CheckStatus::Disabled
            }
        };

        Self {
            pid: Some(pid),
            liveness: enabled_or_disabled(config.liveness_enabled),
            readiness: enabled_or_disabled(config.readiness_enabled),
            custom: enabled_or_disabled(has_custom_check),
            ..Self::stopped()
        }
    }
}

/// Snapshot of a running worker, handed to custom health checks.
#[derive(Clone, Copy, Debug)]
pub struct ProcessSnapshot {
    /// Process ID of the worker.
    pub pid: u32,

    /// Resident memory of the worker, if known.
    pub memory_usage_bytes: Option<u64>,

    /// Number of requests sent to the worker process.
    pub request_count: u64,
}

/// A custom health check.
///
/// Evaluated by the supervisor on every resource check. Returning an error fails the worker.
pub type CustomCheck = Arc<dyn Fn(&ProcessSnapshot) -> Result<(), GenericError> + Send + Sync>;

/// Why a worker was recycled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecycleReason {
    /// Resident memory exceeded the memory limit.
    MemoryLimit {
        /// Observed resident memory, in bytes.
        usage: u64,

        /// Configured limit, in bytes.
        limit: u64,
    },

    /// The worker served its maximum number of requests.
    MaxRequests {
        /// Observed request count.
        count: u64,

        /// Configured maximum.
        limit: u64,
    },
}

impl fmt::Display for RecycleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MemoryLimit { usage, limit } => {
                write!(f, "resident memory of {} bytes exceeds limit of {} bytes", usage, limit)
            }
            Self::MaxRequests { count, limit } => {
                write!(f, "served {} requests, maximum is {}", count, limit)
            }
        }
    }
}

/// Decision reached by the health monitor about the current worker process.
pub(crate) enum Verdict {
    /// The worker is unhealthy and must be failed.
    Unhealthy(WorkerError),

    /// The worker must be replaced by a fresh process.
    Recycle(RecycleReason),
}

enum LivenessState {
    Live,
    Unknown,
    Dead,
}

pub(crate) struct Telemetry {
    memory_bytes: Gauge,
    requests: Gauge,
    ready: Gauge,
    live: Gauge,
    recycles: Counter,
}

impl Telemetry {
    pub(crate) fn new(worker: &str) -> Self {
        let worker: Arc<str> = Arc::from(worker);

        Self {
            memory_bytes: gauge!("worker.memory_bytes", "worker" => Arc::clone(&worker)),
            requests: gauge!("worker.requests", "worker" => Arc::clone(&worker)),
            ready: gauge!("worker.ready", "worker" => Arc::clone(&worker)),
            live: gauge!("worker.live", "worker" => Arc::clone(&worker)),
            recycles: counter!("worker.recycles", "worker" => worker),
        }
    }

    fn update_memory(&self, memory_usage_bytes: u64) {
        self.memory_bytes.set(memory_usage_bytes as f64);
    }

    pub(crate) fn update_requests(&self, request_count: u64) {
        self.requests.set(request_count as f64);
    }

    pub(crate) fn update_readiness(&self, ready: bool) {
        self.ready.set(if ready { 1.0 } else { 0.0 });
    }

    fn update_liveness(&self, state: LivenessState) {
        let live = match state {
            LivenessState::Live => 1.0,
            LivenessState::Unknown => 0.0,
            LivenessState::Dead => -1.0,
        };

        self.live.set(live);
    }

    pub(crate) fn reset_liveness(&self) {
        self.update_liveness(LivenessState::Unknown);
    }

    pub(crate) fn increment_recycles(&self) {
        self.recycles.increment(1);
    }
}

fn check_interval(period: Duration, immediate: bool) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let start = if immediate { Instant::now() } else { Instant::now() + period };
    let mut interval = interval_at(start, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Periodic health checks of a single worker process.
///
/// Runs until its shutdown signal resolves, or until it reaches a verdict about the worker, which it reports exactly
/// once.
pub(crate) struct HealthMonitor {
    state: Arc<WorkerState>,
    config: HealthCheckConfig,
    memory_limit: Option<u64>,
    max_requests: Option<u64>,
    custom_check: Option<CustomCheck>,
    pid: u32,
    connection: Connection,
    querier: Querier,
    liveness_failures: u32,
    report: HealthReport,
    verdict_tx: mpsc::Sender<Verdict>,
}

impl HealthMonitor {
    pub(crate) fn new(
        state: Arc<WorkerState>, spec: &WorkerSpec, custom_check: Option<CustomCheck>, pid: u32, connection: Connection,
        verdict_tx: mpsc::Sender<Verdict>,
    ) -> Self {
        let report = HealthReport::started(pid, &spec.health_check, custom_check.is_some());
        Self {
            state,
            config: spec.health_check.clone(),
            memory_limit: spec.memory_limit.map(|limit| limit.as_u64()),
            max_requests: spec.max_requests,
            custom_check,
            pid,
            connection,
            querier: Querier::for_process(pid),
            liveness_failures: 0,
            report,
            verdict_tx,
        }
    }

    pub(crate) async fn run(mut self, mut shutdown: ProcessShutdown) {
        let mut liveness = check_interval(self.config.liveness_interval, false);
        let mut readiness = check_interval(self.config.readiness_interval, true);
        let mut resources = check_interval(self.config.resource_interval, false);

        debug!(pid = self.pid, "Health monitor started.");

        loop {
            let verdict = select! {
                _ = shutdown.wait_for_shutdown() => break,
                _ = liveness.tick(), if self.config.liveness_enabled => self.check_liveness().await,
                _ = readiness.tick(), if self.config.readiness_enabled => {
                    self.check_readiness().await;
                    None
                },
                _ = resources.tick() => self.check_resources(),
            };

            self.publish();

            if let Some(verdict) = verdict {
                let _ = self.verdict_tx.send(verdict).await;
                break;
            }
        }

        debug!(pid = self.pid, "Health monitor stopped.");
    }

    fn publish(&mut self) {
        self.report.timestamp = SystemTime::now();
        self.report.request_count = self.state.request_count();
        self.state.publish(self.report.clone());
    }

    fn record_failure(&mut self, error: String) {
        self.report.last_error = Some(error);
    }

    async fn check_liveness(&mut self) -> Option<Verdict> {
        let response = self
            .connection
            .call(Value::from(control::PING), self.config.liveness_timeout)
            .await;

        let failure = match response {
            Ok(Value::String(ref pong)) if pong == control::PONG => None,
            Ok(other) => Some(format!("Unexpected liveness response: {}", other)),
            Err(e) => Some(format!("Liveness check failed: {}", e)),
        };

        match failure {
            None => {
                self.liveness_failures = 0;
                self.report.liveness = CheckStatus::Passing;
                self.state.telemetry().update_liveness(LivenessState::Live);
                None
            }
            Some(error) => {
                self.liveness_failures += 1;
                self.report.liveness = CheckStatus::Failing;
                warn!(pid = self.pid, failures = self.liveness_failures, %error, "Worker failed liveness check.");
                self.record_failure(error);

                if self.liveness_failures >= self.config.failure_threshold.max(1) {
                    self.state.telemetry().update_liveness(LivenessState::Dead);
                    Some(Verdict::Unhealthy(WorkerError::LivenessFailed {
                        failures: self.liveness_failures,
                    }))
                } else {
                    self.state.telemetry().update_liveness(LivenessState::Unknown);
                    None
                }
            }
        }
    }

    async fn check_readiness(&mut self) {
        // Readiness shares the liveness timeout.
        let response = self
            .connection
            .call(Value::from(control::READY), self.config.liveness_timeout)
            .await;

        let ready = match response {
            Ok(Value::Bool(ready)) => ready,
            Ok(other) => {
                self.record_failure(format!("Unexpected readiness response: {}", other));
                false
            }
            Err(e) => {
                self.record_failure(format!("Readiness check failed: {}", e));
                false
            }
        };

        if ready != self.state.is_ready() {
            info!(pid = self.pid, ready, "Worker readiness changed.");
        }

        self.report.readiness = if ready { CheckStatus::Passing } else { CheckStatus::Failing };
        self.state.set_ready(ready);
    }

    fn check_resources(&mut self) -> Option<Verdict> {
        let memory_usage_bytes = self.querier.resident_set_size().map(|rss| rss as u64);
        if let Some(usage) = memory_usage_bytes {
            self.state.telemetry().update_memory(usage);
        }
        self.report.memory_usage_bytes = memory_usage_bytes;

        let request_count = self.state.request_count();

        if let Some(custom_check) = self.custom_check.as_ref() {
            let snapshot = ProcessSnapshot {
                pid: self.pid,
                memory_usage_bytes,
                request_count,
            };

            match custom_check(&snapshot) {
                Ok(()) => self.report.custom = CheckStatus::Passing,
                Err(e) => {
                    warn!(pid = self.pid, error = %e, "Worker failed custom health check.");
                    self.report.custom = CheckStatus::Failing;
                    self.record_failure(format!("{:#}", e));
                    return Some(Verdict::Unhealthy(WorkerError::CustomCheckFailed { source: e }));
                }
            }
        }

        if let (Some(usage), Some(limit)) = (memory_usage_bytes, self.memory_limit) {
            if usage > limit {
                return Some(Verdict::Recycle(RecycleReason::MemoryLimit { usage, limit }));
            }
        }

        if let Some(limit) = self.max_requests {
            if request_count >= limit {
                return Some(Verdict::Recycle(RecycleReason::MaxRequests {
                    count: request_count,
                    limit,
                }));
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn started_report_marks_disabled_checks() {
        let config = HealthCheckConfig::default().without_readiness();
        let report = HealthReport::started(42, &config, false);

        assert_eq!(report.pid, Some(42));
        assert_eq!(report.liveness, CheckStatus::Unknown);
        assert_eq!(report.readiness, CheckStatus::Disabled);
        assert_eq!(report.custom, CheckStatus::Disabled);
        assert_eq!(report.request_count, 0);
    }

    #[test]
    fn recycle_reason_display() {
        let reason = RecycleReason::MemoryLimit { usage: 600, limit: 500 };
        assert_eq!(reason.to_string(), "resident memory of 600 bytes exceeds limit of 500 bytes");

        let reason = RecycleReason::MaxRequests { count: 10, limit: 10 };
        assert_eq!(reason.to_string(), "served 10 requests, maximum is 10");
    }
}
