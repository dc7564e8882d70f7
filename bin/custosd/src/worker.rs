use async_trait::async_trait;
use custos_core::gen_server::GenServer;
use custos_error::{generic_error, ErrorContext as _, GenericError};
use custos_ipc::{
    transport::connect_from_env,
    worker::{run_worker, Readiness},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::{Behavior, WorkerConfig};

const MIB: usize = 1024 * 1024;

/// Requests understood by the counter worker.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterRequest {
    /// Increments the counter, returning the new value.
    Increment,

    /// Returns the current value.
    Get,
}

/// Messages understood by the counter worker.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterMessage {
    /// Resets the counter to zero.
    Reset,
}

#[derive(Default)]
struct Counter {
    value: u64,
}

#[async_trait]
impl GenServer for Counter {
    type Call = CounterRequest;
    type Reply = u64;
    type Cast = CounterMessage;
    type Info = ();

    async fn handle_call(&mut self, request: CounterRequest) -> Result<u64, GenericError> {
        match request {
            CounterRequest::Increment => self.value += 1,
            CounterRequest::Get => {}
        }
        Ok(self.value)
    }

    async fn handle_cast(&mut self, message: CounterMessage) -> Result<(), GenericError> {
        match message {
            CounterMessage::Reset => self.value = 0,
        }
        Ok(())
    }
}

struct Echo;

#[async_trait]
impl GenServer for Echo {
    type Call = Value;
    type Reply = Value;
    type Cast = Value;
    type Info = ();

    async fn handle_call(&mut self, request: Value) -> Result<Value, GenericError> {
        Ok(request)
    }

    async fn handle_cast(&mut self, message: Value) -> Result<(), GenericError> {
        debug!(%message, "Received cast.");
        Ok(())
    }
}

/// Requests understood by the ballast worker.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BallastRequest {
    /// Allocates and holds on to the given number of mebibytes, returning the total held in bytes.
    Allocate {
        /// Mebibytes to allocate.
        mebibytes: usize,
    },

    /// Releases all held memory.
    Release,

    /// Returns the number of bytes held.
    Held,
}

#[derive(Default)]
struct Ballast {
    chunks: Vec<Vec<u8>>,
}

impl Ballast {
    fn held(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum()
    }
}

#[async_trait]
impl GenServer for Ballast {
    type Call = BallastRequest;
    type Reply = usize;
    type Cast = ();
    type Info = ();

    async fn handle_call(&mut self, request: BallastRequest) -> Result<usize, GenericError> {
        match request {
            BallastRequest::Allocate { mebibytes } => {
                if mebibytes > 4096 {
                    return Err(generic_error!("Refusing to allocate {} MiB at once.", mebibytes));
                }

                // Filled with non-zero bytes so that every page is resident.
                for _ in 0..mebibytes {
                    self.chunks.push(vec![0xA5; MIB]);
                }
            }
            BallastRequest::Release => self.chunks.clear(),
            BallastRequest::Held => {}
        }

        Ok(self.held())
    }
}

/// Entrypoint for the `worker` subcommand.
pub async fn run_worker_command(config: WorkerConfig) -> Result<(), GenericError> {
    let (connection, incoming) = connect_from_env()
        .await
        .error_context("Failed to connect to supervisor.")?;

    info!(behavior = ?config.behavior, process_id = std::process::id(), "Worker starting.");

    let readiness = Readiness::new();
    match config.behavior {
        Behavior::Counter => run_worker(Counter::default(), connection, incoming, readiness).await,
        Behavior::Echo => run_worker(Echo, connection, incoming, readiness).await,
        Behavior::Ballast => run_worker(Ballast::default(), connection, incoming, readiness).await,
    }
}
