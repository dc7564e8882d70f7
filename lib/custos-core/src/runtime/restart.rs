use std::{collections::VecDeque, time::Duration};

use serde::Deserialize;
use serde_with::{serde_as, DurationMilliSeconds};
use tokio::time::Instant;
use tracing::debug;

/// Restart mode for child processes.
///
/// Determines _which_ children are restarted when one child terminates and is eligible for restart.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RestartMode {
    /// Restarts the failed child process only.
    OneForOne,

    /// Restarts all child processes, including the failed one.
    ///
    /// Children are stopped in reverse start order, and then started again in start order.
    OneForAll,

    /// Restarts the failed child process and every child started after it.
    ///
    /// Children started before the failed one are left untouched.
    RestForOne,

    /// Restarts the failed child process only, where all children are dynamically added instances of a single
    /// template.
    ///
    /// See [`Supervisor::simple_one_for_one`][super::Supervisor::simple_one_for_one].
    SimpleOneForOne,
}

/// Restart policy for a single child.
///
/// Determines _whether_ a child is restarted at all, based on how it exited.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    /// Always restarted, whether it exited cleanly or failed.
    #[default]
    Permanent,

    /// Never restarted.
    Temporary,

    /// Restarted only if it failed.
    Transient,
}

/// How a child process exited.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitReason {
    /// The process returned successfully on its own.
    Normal,

    /// The process returned an error, or panicked.
    Abnormal,

    /// The process was stopped by its supervisor.
    Shutdown,
}

impl RestartPolicy {
    /// Returns `true` if a child with this policy should be restarted after exiting for the given reason.
    pub fn should_restart(&self, reason: ExitReason) -> bool {
        match (self, reason) {
            (_, ExitReason::Shutdown) => false,
            (Self::Temporary, _) => false,
            (Self::Permanent, _) => true,
            (Self::Transient, ExitReason::Abnormal) => true,
            (Self::Transient, ExitReason::Normal) => false,
        }
    }
}

/// Restart strategy for a supervisor.
///
/// Defaults to one-for-one mode (only restart the failed process) and a restart intensity of 1 over a period of 5
/// seconds.
///
/// # Restarts and permanent failure
///
/// A supervisor will allow up to `max_restarts` process restarts, across all child processes, over a sliding window of
/// `max_time`. When this limit is exceeded, the supervisor will stop all child processes and return an error itself,
/// indicating that the supervisor has failed overall.
///
/// Permanent failure bubbles up to the parent supervisor as an ordinary child failure, until reaching the root
/// supervisor, whose `run` call then returns the error.
#[derive(Clone, Copy, Debug)]
pub struct RestartStrategy {
    mode: RestartMode,
    max_restarts: usize,
    max_time: Duration,
}

impl RestartStrategy {
    /// Creates a new `RestartStrategy` with the given mode, intensity, and period.
    pub const fn new(mode: RestartMode, max_restarts: usize, max_time: Duration) -> Self {
        Self {
            mode,
            max_restarts,
            max_time,
        }
    }

    /// Creates a new `RestartStrategy` with the one-for-one restart mode, and the default intensity/period.
    pub fn one_for_one() -> Self {
        Self {
            mode: RestartMode::OneForOne,
            ..Default::default()
        }
    }

    /// Creates a new `RestartStrategy` with the one-for-all restart mode, and the default intensity/period.
    pub fn one_for_all() -> Self {
        Self {
            mode: RestartMode::OneForAll,
            ..Default::default()
        }
    }

    /// Creates a new `RestartStrategy` with the rest-for-one restart mode, and the default intensity/period.
    pub fn rest_for_one() -> Self {
        Self {
            mode: RestartMode::RestForOne,
            ..Default::default()
        }
    }

    /// Sets the restart intensity and period for the strategy.
    pub const fn with_intensity_and_period(mut self, max_restarts: usize, max_time: Duration) -> Self {
        self.max_restarts = max_restarts;
        self.max_time = max_time;
        self
    }

    /// Returns the restart mode.
    pub fn mode(&self) -> RestartMode {
        self.mode
    }

    pub(super) fn with_mode(mut self, mode: RestartMode) -> Self {
        self.mode = mode;
        self
    }
}

impl Default for RestartStrategy {
    fn default() -> Self {
        Self::new(RestartMode::OneForOne, 1, Duration::from_secs(5))
    }
}

const fn default_max_restarts() -> usize {
    1
}

const fn default_max_time() -> Duration {
    Duration::from_secs(5)
}

const fn default_mode() -> RestartMode {
    RestartMode::OneForOne
}

/// Restart strategy configuration.
///
/// `max_time` is expressed in milliseconds.
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct RestartStrategyConfig {
    #[serde(default = "default_mode")]
    strategy: RestartMode,

    #[serde(default = "default_max_restarts")]
    max_restarts: usize,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_max_time")]
    max_time: Duration,
}

impl From<RestartStrategyConfig> for RestartStrategy {
    fn from(config: RestartStrategyConfig) -> Self {
        Self::new(config.strategy, config.max_restarts, config.max_time)
    }
}

pub(super) enum RestartAction {
    /// Execute a restart with the given mode.
    Restart(RestartMode),

    /// Supervisor must shutdown as the maximum number of restarts has been reached.
    Shutdown,
}

pub(super) struct RestartState {
    strategy: RestartStrategy,
    restart_history: VecDeque<Instant>,
}

impl RestartState {
    /// Creates a new `RestartState` with the given strategy.
    pub fn new(strategy: RestartStrategy) -> Self {
        Self {
            strategy,
            restart_history: VecDeque::with_capacity(strategy.max_restarts.min(64) + 1),
        }
    }

    /// Evaluates a restart based on the current state and determine the action the supervisor should take in response.
    pub fn evaluate_restart(&mut self) -> RestartAction {
        let now = Instant::now();

        // Drop every restart that has aged out of the window before counting this one.
        while let Some(oldest) = self.restart_history.front() {
            if now.saturating_duration_since(*oldest) >= self.strategy.max_time {
                self.restart_history.pop_front();
            } else {
                break;
            }
        }

        self.restart_history.push_back(now);

        if self.restart_history.len() > self.strategy.max_restarts {
            debug!(
                "Restart limit exceeded ({} in {:?}), shutting down.",
                self.strategy.max_restarts, self.strategy.max_time
            );
            return RestartAction::Shutdown;
        }

        debug!(
            restarts_in_window = self.restart_history.len(),
            "Restart limit not exceeded, restarting worker."
        );
        RestartAction::Restart(self.strategy.mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_matrix() {
        use ExitReason::*;
        use RestartPolicy::*;

        let cases = [
            (Permanent, Normal, true),
            (Permanent, Abnormal, true),
            (Permanent, Shutdown, false),
            (Transient, Normal, false),
            (Transient, Abnormal, true),
            (Transient, Shutdown, false),
            (Temporary, Normal, false),
            (Temporary, Abnormal, false),
            (Temporary, Shutdown, false),
        ];

        for (policy, reason, expected) in cases {
            assert_eq!(policy.should_restart(reason), expected, "{:?} / {:?}", policy, reason);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn intensity_window_allows_up_to_max_restarts() {
        let strategy = RestartStrategy::one_for_one().with_intensity_and_period(5, Duration::from_secs(10));
        let mut state = RestartState::new(strategy);

        for _ in 0..5 {
            assert!(matches!(state.evaluate_restart(), RestartAction::Restart(RestartMode::OneForOne)));
            tokio::time::advance(Duration::from_secs(1)).await;
        }

        assert!(matches!(state.evaluate_restart(), RestartAction::Shutdown));
    }

    #[tokio::test(start_paused = true)]
    async fn intensity_window_slides() {
        let strategy = RestartStrategy::one_for_all().with_intensity_and_period(2, Duration::from_secs(10));
        let mut state = RestartState::new(strategy);

        assert!(matches!(state.evaluate_restart(), RestartAction::Restart(_)));
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(matches!(state.evaluate_restart(), RestartAction::Restart(_)));

        // The first restart has aged out of the window by now.
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(matches!(state.evaluate_restart(), RestartAction::Restart(RestartMode::OneForAll)));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_intensity_is_immediately_fatal() {
        let strategy = RestartStrategy::one_for_one().with_intensity_and_period(0, Duration::from_secs(5));
        let mut state = RestartState::new(strategy);
        assert!(matches!(state.evaluate_restart(), RestartAction::Shutdown));
    }

    #[test]
    fn config_conversion() {
        let config: RestartStrategyConfig =
            serde_json::from_str(r#"{"strategy": "rest_for_one", "max_restarts": 3, "max_time": 2500}"#).unwrap();
        let strategy = RestartStrategy::from(config);
        assert_eq!(strategy.mode(), RestartMode::RestForOne);
        assert_eq!(strategy.max_restarts, 3);
        assert_eq!(strategy.max_time, Duration::from_millis(2500));
    }
}
