//! Logging.

use custos_error::GenericError;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, Layer as _};

mod config;
pub use self::config::LoggingConfiguration;

mod layer;
use self::layer::build_formatting_layer;

/// Guard for the logging subsystem.
///
/// Must be held until the application is about to exit, so that buffered log lines are flushed.
pub struct LoggingGuard {
    _worker_guard: WorkerGuard,
}

/// Initializes the logging subsystem for `tracing`.
///
/// Logs are always written to standard error. Standard output is left untouched, since external workers use it as
/// their IPC channel back to the supervising process.
///
/// Filtering directives come from `log_level` in the configuration, which can be overridden at the environment level
/// with `CUSTOS_LOG_LEVEL` when the configuration was loaded with the `CUSTOS` prefix.
///
/// # Errors
///
/// If the logging subsystem was already initialized, an error will be returned.
pub fn initialize_logging(config: &LoggingConfiguration) -> Result<LoggingGuard, GenericError> {
    let (nb_stderr, worker_guard) = tracing_appender::non_blocking(std::io::stderr());

    tracing_subscriber::registry()
        .with(build_formatting_layer(config, nb_stderr).with_filter(config.env_filter()))
        .try_init()?;

    Ok(LoggingGuard {
        _worker_guard: worker_guard,
    })
}
