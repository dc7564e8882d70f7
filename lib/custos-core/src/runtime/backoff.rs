use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use rand::{rngs::StdRng, Rng as _, SeedableRng as _};
use serde::Deserialize;
use serde_with::{serde_as, DurationMilliSeconds};

const fn default_initial_backoff() -> Duration {
    Duration::from_millis(100)
}

const fn default_max_backoff() -> Duration {
    Duration::from_secs(5)
}

const fn default_jitter_factor() -> f64 {
    1.0
}

const fn default_reset_after() -> Duration {
    Duration::from_secs(10)
}

/// Backoff configuration for restarting children.
///
/// Each restart of a child is preceded by a delay starting at `initial_backoff`, doubling with each consecutive failure
/// of the same child, and capped at `max_backoff`. A child that stays up for at least `reset_after`, or that exits
/// cleanly, has its delay reset back to `initial_backoff`.
///
/// When `jitter_factor` is greater than 1.0, each delay `D` is spread uniformly over `[D/jitter_factor, D]`. The factor
/// is clamped to `[1.0, 2.0]` so that delays never decrease across consecutive failures.
///
/// All durations are expressed in milliseconds when deserialized.
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct BackoffConfig {
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_initial_backoff")]
    initial_backoff: Duration,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_max_backoff")]
    max_backoff: Duration,

    #[serde(default = "default_jitter_factor")]
    jitter_factor: f64,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_reset_after")]
    reset_after: Duration,
}

impl BackoffConfig {
    /// Creates a new `BackoffConfig` with the given initial and maximum backoff durations, and no jitter.
    pub const fn new(initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            initial_backoff,
            max_backoff,
            jitter_factor: 1.0,
            reset_after: default_reset_after(),
        }
    }

    /// Creates a `BackoffConfig` that restarts children immediately.
    pub const fn immediate() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Sets the jitter factor.
    pub const fn with_jitter_factor(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }

    /// Sets how long a child must stay up before its backoff is reset.
    pub const fn with_reset_after(mut self, reset_after: Duration) -> Self {
        self.reset_after = reset_after;
        self
    }

    /// Returns how long a child must stay up before its backoff is reset.
    pub fn reset_after(&self) -> Duration {
        self.reset_after
    }

    /// Builds the backoff calculator for this configuration.
    pub fn build(&self) -> ExponentialBackoff {
        ExponentialBackoff::with_jitter(self.initial_backoff, self.max_backoff, self.jitter_factor)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::new(default_initial_backoff(), default_max_backoff())
    }
}

#[derive(Clone)]
enum BackoffRng {
    ThreadLocal,
    Seeded(Arc<Mutex<StdRng>>),
}

impl fmt::Debug for BackoffRng {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffRng::ThreadLocal => f.debug_tuple("ThreadLocal").finish(),
            BackoffRng::Seeded(_) => f.debug_tuple("Seeded").finish(),
        }
    }
}

impl BackoffRng {
    fn duration_between(&self, low: Duration, high: Duration) -> Duration {
        match self {
            BackoffRng::ThreadLocal => rand::rng().random_range(low..=high),
            BackoffRng::Seeded(rng) => rng
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .random_range(low..=high),
        }
    }
}

/// An exponential backoff strategy.
///
/// Provides backoff durations that increase exponentially based on a caller-provided error count, bounded by a minimum
/// and maximum duration, with optional jitter.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    min_backoff: Duration,
    max_backoff: Duration,
    min_backoff_factor: f64,
    rng: BackoffRng,
}

impl ExponentialBackoff {
    /// Creates a new `ExponentialBackoff` with the given minimum and maximum backoff durations.
    ///
    /// Jitter is not applied to the calculated backoff durations.
    pub fn new(min_backoff: Duration, max_backoff: Duration) -> Self {
        Self::with_jitter(min_backoff, max_backoff, 1.0)
    }

    /// Creates a new `ExponentialBackoff` with jitter.
    ///
    /// Any given backoff duration will be between `D/min_backoff_factor` and `D`, where `D` is the duration calculated
    /// for the given error count. A factor of 1.0 or less disables jitter, and factors above 2.0 are clamped to 2.0.
    ///
    /// With a minimum backoff of 10ms and a factor of 2.0, an error count of one yields anywhere between 10ms and 20ms,
    /// and an error count of two yields anywhere between 20ms and 40ms.
    pub fn with_jitter(min_backoff: Duration, max_backoff: Duration, min_backoff_factor: f64) -> Self {
        let min_backoff_factor = if min_backoff_factor.is_nan() {
            1.0
        } else {
            min_backoff_factor.clamp(1.0, 2.0)
        };

        Self {
            min_backoff,
            max_backoff: max_backoff.max(min_backoff),
            min_backoff_factor,
            rng: BackoffRng::ThreadLocal,
        }
    }

    /// Uses a seeded random number generator for jitter.
    ///
    /// Useful for tests, where jittered durations must be reproducible.
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: BackoffRng::Seeded(Arc::new(Mutex::new(StdRng::seed_from_u64(seed)))),
            ..self
        }
    }

    /// Calculates the backoff duration for the given error count.
    ///
    /// The error count is the number of consecutive errors seen before this attempt, so an error count of zero always
    /// yields the minimum backoff.
    pub fn get_backoff_duration(&mut self, error_count: u32) -> Duration {
        if error_count == 0 {
            return self.min_backoff;
        }

        let mut backoff = self.min_backoff.saturating_mul(2u32.saturating_pow(error_count));

        if self.min_backoff_factor > 1.0 {
            let backoff_lower = backoff.div_f64(self.min_backoff_factor);
            backoff = self.rng.duration_between(backoff_lower, backoff);
        }

        backoff.clamp(self.min_backoff, self.max_backoff)
    }
}

/// Per-child backoff tracking.
#[derive(Debug, Default)]
pub(super) struct ChildBackoff {
    consecutive_failures: u32,
}

impl ChildBackoff {
    /// Records a restart and returns the delay to wait before starting the next instance.
    ///
    /// `ran_for` is how long the previous instance was up. A clean exit, or a run longer than the reset threshold,
    /// starts the sequence over.
    pub fn next_delay(
        &mut self, backoff: &mut ExponentialBackoff, reset_after: Duration, ran_for: Duration, clean_exit: bool,
    ) -> Duration {
        if clean_exit || ran_for >= reset_after {
            self.consecutive_failures = 0;
        }

        let delay = backoff.get_backoff_duration(self.consecutive_failures);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        delay
    }

    /// Resets the sequence, so that the next delay is the minimum backoff.
    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
    }
}
