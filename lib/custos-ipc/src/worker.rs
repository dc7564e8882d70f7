//! Worker-side runtime.
//!
//! An external worker process serves a [`GenServer`] over a [`Connection`] to its supervisor with [`run_worker`].
//! Requests and replies are carried as JSON payloads, so the server's message types must be serializable.
//!
//! Reserved control payloads are answered by the runtime itself: `ping` calls are answered with `pong`, `ready` calls
//! with the current readiness, and a `shutdown` cast stops the server gracefully once the messages received before it
//! have been handled.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use custos_core::{gen_server::GenServer, task::spawn_traced_named};
use custos_error::{ErrorContext as _, GenericError};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::{control, Connection, Incoming, IpcError, Message, MessageKind};

/// Readiness of a worker.
///
/// Workers start out not ready, and become ready once their server has initialized. The worker itself can flip its
/// readiness at any time, such as while it is temporarily overloaded.
#[derive(Clone, Debug, Default)]
pub struct Readiness {
    ready: Arc<AtomicBool>,
}

impl Readiness {
    /// Creates a new `Readiness`, initially not ready.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether the worker is ready to accept work.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Returns `true` if the worker is ready to accept work.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

/// Serves `server` over `connection` until the supervisor asks it to stop or the connection closes.
///
/// Calls and casts are processed one at a time, in the order they are received. Errors from `handle_call` are returned
/// to the caller as error replies, while errors from `handle_cast` stop the server.
///
/// Control payloads are answered as soon as they arrive, even while the server is busy with an earlier message, so a
/// long-running call does not fail liveness checks.
///
/// # Errors
///
/// If the server fails to initialize, fails while handling a cast, or fails to terminate cleanly, an error is
/// returned.
pub async fn run_worker<S>(
    mut server: S, connection: Connection, incoming: Incoming, readiness: Readiness,
) -> Result<(), GenericError>
where
    S: GenServer,
    S::Call: DeserializeOwned,
    S::Reply: Serialize,
    S::Cast: DeserializeOwned,
{
    let (work_tx, mut work_rx) = mpsc::unbounded_channel();
    let dispatcher = spawn_traced_named(
        format!("ipc-dispatcher-{}", connection.name()),
        dispatch_incoming(incoming, connection.clone(), readiness.clone(), work_tx),
    );

    if let Err(e) = server.init().await.error_context("Worker server failed to initialize.") {
        dispatcher.abort();
        connection.close();
        return Err(e);
    }
    readiness.set_ready(true);
    debug!(connection = connection.name(), "Worker server initialized.");

    let outcome = loop {
        let Some(message) = work_rx.recv().await else {
            debug!("Connection to supervisor closed.");
            break Ok(());
        };

        match message.kind {
            MessageKind::Call => {
                let reply = handle_call(&mut server, message.payload).await;
                send_reply(&connection, message.correlation_id, reply);
            }
            MessageKind::Cast if message.is_control(control::SHUTDOWN) => {
                debug!("Supervisor requested shutdown.");
                break Ok(());
            }
            MessageKind::Cast => {
                let result = match serde_json::from_value::<S::Cast>(message.payload) {
                    Ok(cast) => server.handle_cast(cast).await,
                    Err(e) => {
                        warn!(error = %e, "Dropping malformed cast.");
                        Ok(())
                    }
                };
                if let Err(e) = result {
                    break Err(e);
                }
            }
            MessageKind::Response | MessageKind::Error => {
                warn!(correlation_id = message.correlation_id, "Ignoring unexpected reply from supervisor.");
            }
        }
    };

    readiness.set_ready(false);
    dispatcher.abort();
    match outcome {
        Ok(()) => {
            let result = server.terminate(None).await;
            connection.close();
            result
        }
        Err(e) => {
            error!(error = %e, "Worker server failed while handling cast.");
            if let Err(terminate_error) = server.terminate(Some(&e)).await {
                error!(error = %terminate_error, "Worker server failed to terminate cleanly.");
            }
            connection.close();
            Err(e)
        }
    }
}

/// Answers control calls directly, and forwards everything else to the server in arrival order.
async fn dispatch_incoming(
    mut incoming: Incoming, connection: Connection, readiness: Readiness, work_tx: mpsc::UnboundedSender<Message>,
) {
    while let Some(message) = incoming.recv().await {
        match message.kind {
            MessageKind::Call if message.is_control(control::PING) => {
                let _ = connection.reply(message.correlation_id, Ok(Value::from(control::PONG)));
            }
            MessageKind::Call if message.is_control(control::READY) => {
                let _ = connection.reply(message.correlation_id, Ok(Value::from(readiness.is_ready())));
            }
            _ => {
                if work_tx.send(message).is_err() {
                    break;
                }
            }
        }
    }
}

fn send_reply(connection: &Connection, correlation_id: u64, reply: Result<Value, String>) {
    match connection.reply(correlation_id, reply) {
        Ok(()) | Err(IpcError::ConnectionClosed) => {}
        Err(e) => {
            // The reply itself could not be sent, but the caller can still be told why.
            warn!(correlation_id, error = %e, "Failed to send reply. Sending error reply instead.");
            let _ = connection.reply(correlation_id, Err(format!("Failed to send reply: {}", e)));
        }
    }
}

async fn handle_call<S>(server: &mut S, payload: Value) -> Result<Value, String>
where
    S: GenServer,
    S::Call: DeserializeOwned,
    S::Reply: Serialize,
{
    let request = serde_json::from_value::<S::Call>(payload).map_err(|e| format!("Malformed request: {}", e))?;
    let reply = server.handle_call(request).await.map_err(|e| format!("{:#}", e))?;
    serde_json::to_value(reply).map_err(|e| format!("Failed to encode reply: {}", e))
}
