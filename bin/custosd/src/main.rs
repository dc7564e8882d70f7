//! Supervision tree host for external worker processes.
//!
//! `custosd run` builds a supervision tree of external workers from a configuration file and runs it until interrupted.
//! `custosd worker` runs one of the built-in worker behaviors, speaking the worker protocol over the transport chosen
//! by its supervisor.
#![deny(warnings)]
#![deny(missing_docs)]

use clap::Parser as _;
use custos_app::prelude::*;
use tracing::{error, info};

mod config;
use self::config::{Action, Cli};

mod run;
use self::run::run;

mod worker;
use self::worker::run_worker_command;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.action {
        Action::Run(config) => run(config).await,
        Action::Worker(config) => {
            let logging_config = match LoggingConfiguration::with_level(&config.log_level, "custosd-worker") {
                Ok(logging_config) => logging_config,
                Err(e) => {
                    eprintln!("failed to parse log level: {:#}", e);
                    std::process::exit(1);
                }
            };
            let _guard = match initialize_logging(&logging_config) {
                Ok(guard) => guard,
                Err(e) => {
                    eprintln!("failed to initialize logging: {:#}", e);
                    std::process::exit(1);
                }
            };

            run_worker_command(config).await
        }
    };

    match result {
        Ok(()) => info!("custosd stopped."),
        Err(e) => {
            error!("{:?}", e);
            eprintln!("custosd failed: {:#}", e);
            std::process::exit(1);
        }
    }
}
