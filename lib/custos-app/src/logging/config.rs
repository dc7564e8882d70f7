use custos_config::GenericConfiguration;
use custos_error::{generic_error, ErrorContext as _, GenericError};
use serde::Deserialize;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

fn default_log_level() -> LogLevel {
    LevelFilter::INFO.into()
}

const fn default_false() -> bool {
    false
}

fn default_app_name() -> String {
    "custos".to_string()
}

/// Logging configuration.
///
/// All fields are optional and are read from the top level of the configuration:
///
/// - `log_level`: filtering directives in `EnvFilter` syntax, such as `info` or `custos_core=debug,info` (default:
///   `info`)
/// - `log_format_json`: whether to emit JSON lines instead of the human-readable format (default: `false`)
/// - `log_app_name`: the label written at the start of every human-readable line (default: `custos`)
#[derive(Deserialize)]
pub struct LoggingConfiguration {
    #[serde(default = "default_log_level")]
    log_level: LogLevel,

    #[serde(default = "default_false")]
    log_format_json: bool,

    #[serde(default = "default_app_name")]
    log_app_name: String,
}

impl LoggingConfiguration {
    /// Creates a new `LoggingConfiguration` instance from the given configuration.
    ///
    /// # Errors
    ///
    /// If the configuration cannot be deserialized as `LoggingConfiguration`, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        let logging_config = config.as_typed()?;
        Ok(logging_config)
    }

    /// Creates a human-readable configuration with the given level filtering directives and application label.
    ///
    /// # Errors
    ///
    /// If the directives cannot be parsed, an error is returned.
    pub fn with_level(level: &str, app_name: &str) -> Result<Self, GenericError> {
        Ok(Self {
            log_level: LogLevel::try_from(level.to_string())?,
            log_format_json: false,
            log_app_name: app_name.to_string(),
        })
    }

    pub(super) fn env_filter(&self) -> EnvFilter {
        self.log_level.as_env_filter()
    }

    pub(super) fn is_json(&self) -> bool {
        self.log_format_json
    }

    pub(super) fn app_name(&self) -> &str {
        &self.log_app_name
    }
}

#[derive(Deserialize)]
#[serde(try_from = "String")]
struct LogLevel(String);

impl LogLevel {
    fn as_env_filter(&self) -> EnvFilter {
        // Directives were validated when deserializing, so parsing again cannot fail.
        EnvFilter::builder().parse_lossy(&self.0)
    }
}

impl From<LevelFilter> for LogLevel {
    fn from(level: LevelFilter) -> Self {
        Self(level.to_string().to_lowercase())
    }
}

impl TryFrom<String> for LogLevel {
    type Error = GenericError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            return Err(generic_error!("Log level cannot be empty."));
        }

        EnvFilter::builder()
            .parse(&value)
            .error_context("Failed to parse valid log level.")?;
        Ok(Self(value))
    }
}
