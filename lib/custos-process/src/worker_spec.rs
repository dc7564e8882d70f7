use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use bytesize::ByteSize;
use custos_core::runtime::RestartPolicy;
use custos_ipc::transport::TransportKind;
use serde::Deserialize;
use serde_with::{serde_as, DurationMilliSeconds};

const fn default_true() -> bool {
    true
}

const fn default_check_interval() -> Duration {
    Duration::from_secs(1)
}

const fn default_liveness_timeout() -> Duration {
    Duration::from_secs(1)
}

const fn default_failure_threshold() -> u32 {
    3
}

const fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

const fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Health check configuration for an external worker.
///
/// All durations are expressed in milliseconds when deserialized.
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct HealthCheckConfig {
    /// Whether liveness checks are enabled.
    #[serde(default = "default_true")]
    pub liveness_enabled: bool,

    /// Interval between liveness checks.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_check_interval")]
    pub liveness_interval: Duration,

    /// How long to wait for a liveness response.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_liveness_timeout")]
    pub liveness_timeout: Duration,

    /// Number of consecutive failed liveness checks after which the worker is considered dead.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Whether readiness checks are enabled.
    #[serde(default = "default_true")]
    pub readiness_enabled: bool,

    /// Interval between readiness checks.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_check_interval")]
    pub readiness_interval: Duration,

    /// Interval between resource checks (memory usage, request count) and custom checks.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_check_interval")]
    pub resource_interval: Duration,
}

impl HealthCheckConfig {
    /// Disables liveness checks.
    pub fn without_liveness(mut self) -> Self {
        self.liveness_enabled = false;
        self
    }

    /// Enables liveness checks with the given interval and response timeout.
    pub fn with_liveness(mut self, interval: Duration, timeout: Duration) -> Self {
        self.liveness_enabled = true;
        self.liveness_interval = interval;
        self.liveness_timeout = timeout;
        self
    }

    /// Sets the number of consecutive failed liveness checks tolerated.
    pub fn with_failure_threshold(mut self, failure_threshold: u32) -> Self {
        self.failure_threshold = failure_threshold;
        self
    }

    /// Disables readiness checks.
    pub fn without_readiness(mut self) -> Self {
        self.readiness_enabled = false;
        self
    }

    /// Enables readiness checks with the given interval.
    pub fn with_readiness(mut self, interval: Duration) -> Self {
        self.readiness_enabled = true;
        self.readiness_interval = interval;
        self
    }

    /// Sets the interval between resource and custom checks.
    pub fn with_resource_interval(mut self, interval: Duration) -> Self {
        self.resource_interval = interval;
        self
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            liveness_enabled: true,
            liveness_interval: default_check_interval(),
            liveness_timeout: default_liveness_timeout(),
            failure_threshold: default_failure_threshold(),
            readiness_enabled: true,
            readiness_interval: default_check_interval(),
            resource_interval: default_check_interval(),
        }
    }
}

/// Template for an external worker process.
///
/// Every start of the worker, whether the first one, a restart after a failure, or a recycle, spawns a fresh process
/// from the same `WorkerSpec`.
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct WorkerSpec {
    /// Name of the worker, used as its child ID.
    pub name: String,

    /// Program to execute.
    pub command: PathBuf,

    /// Arguments passed to the program.
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory of the process.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Additional environment variables for the process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Resident memory above which the worker is recycled.
    #[serde(default)]
    pub memory_limit: Option<ByteSize>,

    /// Number of requests after which the worker is recycled.
    #[serde(default)]
    pub max_requests: Option<u64>,

    /// Health check configuration.
    #[serde(default)]
    pub health_check: HealthCheckConfig,

    /// Restart policy of the worker within its supervisor.
    #[serde(default)]
    pub restart_policy: RestartPolicy,

    /// Transport between the supervisor and the worker.
    #[serde(default)]
    pub transport: TransportKind,

    /// How long to wait for the worker to exit after a graceful shutdown request before killing it.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: Duration,

    /// How long to wait for a freshly spawned worker to connect back over a socket transport.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: Duration,
}

impl WorkerSpec {
    /// Creates a new `WorkerSpec` running `command` with default settings.
    pub fn new<N, C>(name: N, command: C) -> Self
    where
        N: Into<String>,
        C: Into<PathBuf>,
    {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            memory_limit: None,
            max_requests: None,
            health_check: HealthCheckConfig::default(),
            restart_policy: RestartPolicy::default(),
            transport: TransportKind::default(),
            shutdown_timeout: default_shutdown_timeout(),
            connect_timeout: default_connect_timeout(),
        }
    }

    /// Sets the program arguments.
    pub fn with_args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the working directory.
    pub fn with_working_dir<P: Into<PathBuf>>(mut self, working_dir: P) -> Self {
        self.working_dir = Some(working_dir.into());
        self
    }

    /// Adds an environment variable.
    pub fn with_env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets the memory limit.
    pub fn with_memory_limit(mut self, memory_limit: ByteSize) -> Self {
        self.memory_limit = Some(memory_limit);
        self
    }

    /// Sets the maximum number of requests served before recycling.
    pub fn with_max_requests(mut self, max_requests: u64) -> Self {
        self.max_requests = Some(max_requests);
        self
    }

    /// Sets the health check configuration.
    pub fn with_health_check(mut self, health_check: HealthCheckConfig) -> Self {
        self.health_check = health_check;
        self
    }

    /// Sets the restart policy.
    pub fn with_restart_policy(mut self, restart_policy: RestartPolicy) -> Self {
        self.restart_policy = restart_policy;
        self
    }

    /// Sets the transport.
    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    /// Sets the graceful shutdown timeout.
    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    /// Sets the connect timeout for socket transports.
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}
