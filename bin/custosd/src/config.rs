use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Command-line interface.
#[derive(Parser)]
#[command(about = "Supervision trees for external worker processes.")]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub action: Action,
}

/// Subcommands.
#[derive(Subcommand)]
pub enum Action {
    /// Runs a supervision tree of workers described by a configuration file.
    #[command(name = "run")]
    Run(RunConfig),

    /// Runs a built-in worker behavior as an external worker process.
    #[command(name = "worker")]
    Worker(WorkerConfig),
}

/// Run subcommand configuration.
#[derive(Args, Debug)]
pub struct RunConfig {
    /// Path to the configuration file, in YAML or JSON.
    #[arg(short = 'c', long = "config")]
    pub config: PathBuf,
}

/// Worker behaviors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Behavior {
    /// Keeps a counter that can be incremented and read.
    Counter,

    /// Replies to every call with the request itself.
    Echo,

    /// Holds on to memory on request, for exercising memory limits.
    Ballast,
}

/// Worker subcommand configuration.
#[derive(Args, Debug)]
pub struct WorkerConfig {
    /// Behavior of the worker.
    #[arg(short = 'b', long = "behavior", value_enum)]
    pub behavior: Behavior,

    /// Logging directives, written to standard error.
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,
}
