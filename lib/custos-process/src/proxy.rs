use std::{fmt, marker::PhantomData, sync::Arc, time::Duration};

use async_trait::async_trait;
use custos_core::gen_server::{CallError, ServerHandle};
use custos_error::generic_error;
use custos_ipc::IpcError;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::trace;

use crate::{supervisor::WorkerState, HealthReport};

fn map_ipc_error(error: IpcError) -> CallError {
    match error {
        IpcError::Timeout { timeout } => CallError::Timeout { timeout },
        IpcError::Remote { message } => CallError::Failed {
            source: generic_error!(message),
        },
        IpcError::ConnectionClosed => CallError::Terminated,
        other => CallError::Transport { source: other.into() },
    }
}

/// A handle to a worker running in an external process.
///
/// Acts as a proxy for the generic server running inside the worker: calls and casts are forwarded over the worker's
/// IPC connection, and every one of them counts as a request against the worker's maximum request count. The handle
/// stays valid across restarts and recycles of the worker, always addressing the current process.
///
/// Payloads are untyped JSON values. Use [`typed`][OsProcessHandle::typed] for a handle with concrete request and
/// reply types.
#[derive(Clone)]
pub struct OsProcessHandle {
    state: Arc<WorkerState>,
}

impl OsProcessHandle {
    pub(crate) fn new(state: Arc<WorkerState>) -> Self {
        Self { state }
    }

    /// Returns the worker name.
    pub fn name(&self) -> &str {
        self.state.name()
    }

    /// Returns a receiver for the latest health report of the worker.
    pub fn health(&self) -> watch::Receiver<HealthReport> {
        self.state.subscribe()
    }

    /// Returns `true` if the worker is running and ready to accept new work.
    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    /// Returns the process ID of the current worker process, if one is running.
    pub fn pid(&self) -> Option<u32> {
        self.state.pid()
    }

    /// Returns the number of requests sent to the current worker process.
    pub fn request_count(&self) -> u64 {
        self.state.request_count()
    }

    /// Returns how many times the worker has been recycled.
    pub fn recycle_count(&self) -> u64 {
        self.state.recycle_count()
    }

    /// Sends a synchronous request to the worker and waits up to `timeout` for the reply.
    ///
    /// # Errors
    ///
    /// If no worker process is running, the worker does not reply in time, the worker fails to handle the request, or
    /// the connection fails, an error is returned.
    pub async fn call(&self, request: Value, timeout: Duration) -> Result<Value, CallError> {
        let connection = self.state.connection().ok_or(CallError::Unavailable)?;
        self.state.record_request();

        trace!(worker = self.name(), "Forwarding call to worker process.");
        connection.call(request, timeout).await.map_err(map_ipc_error)
    }

    /// Sends an asynchronous message to the worker.
    ///
    /// # Errors
    ///
    /// If no worker process is running, or the connection is closed, an error is returned.
    pub fn cast(&self, message: Value) -> Result<(), CallError> {
        let connection = self.state.connection().ok_or(CallError::Unavailable)?;
        self.state.record_request();

        trace!(worker = self.name(), "Forwarding cast to worker process.");
        connection.cast(message).map_err(map_ipc_error)
    }

    /// Returns a typed handle to the worker.
    pub fn typed<Req, Rep, Msg>(&self) -> RemoteServer<Req, Rep, Msg> {
        RemoteServer {
            handle: self.clone(),
            _types: PhantomData,
        }
    }
}

impl fmt::Debug for OsProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OsProcessHandle")
            .field("name", &self.name())
            .field("pid", &self.pid())
            .field("ready", &self.is_ready())
            .finish()
    }
}

#[async_trait]
impl ServerHandle for OsProcessHandle {
    type Request = Value;
    type Reply = Value;
    type Message = Value;

    async fn call(&self, request: Value, timeout: Duration) -> Result<Value, CallError> {
        OsProcessHandle::call(self, request, timeout).await
    }

    async fn cast(&self, message: Value) -> Result<(), CallError> {
        OsProcessHandle::cast(self, message)
    }
}

/// A typed handle to a worker running in an external process.
///
/// Requests and messages are serialized to JSON before being forwarded, and replies are deserialized from JSON.
pub struct RemoteServer<Req, Rep, Msg> {
    handle: OsProcessHandle,
    _types: PhantomData<fn(Req, Msg) -> Rep>,
}

impl<Req, Rep, Msg> RemoteServer<Req, Rep, Msg> {
    /// Returns the untyped handle to the worker.
    pub fn handle(&self) -> &OsProcessHandle {
        &self.handle
    }
}

impl<Req, Rep, Msg> Clone for RemoteServer<Req, Rep, Msg> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            _types: PhantomData,
        }
    }
}

#[async_trait]
impl<Req, Rep, Msg> ServerHandle for RemoteServer<Req, Rep, Msg>
where
    Req: Serialize + Send + 'static,
    Rep: DeserializeOwned + Send + 'static,
    Msg: Serialize + Send + 'static,
{
    type Request = Req;
    type Reply = Rep;
    type Message = Msg;

    async fn call(&self, request: Req, timeout: Duration) -> Result<Rep, CallError> {
        let request = serde_json::to_value(request).map_err(|e| CallError::Transport { source: e.into() })?;
        let reply = self.handle.call(request, timeout).await?;
        serde_json::from_value(reply).map_err(|e| CallError::Transport {
            source: generic_error!("Failed to decode reply: {}", e),
        })
    }

    async fn cast(&self, message: Msg) -> Result<(), CallError> {
        let message = serde_json::to_value(message).map_err(|e| CallError::Transport { source: e.into() })?;
        self.handle.cast(message)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use custos_core::gen_server::call;
    use serde_json::json;

    use super::*;
    use crate::{OsProcessSupervisor, WorkerSpec};

    #[test]
    fn ipc_errors_map_to_call_errors() {
        let timeout = Duration::from_millis(10);
        assert!(matches!(
            map_ipc_error(IpcError::Timeout { timeout }),
            CallError::Timeout { timeout: t } if t == timeout
        ));
        assert!(matches!(map_ipc_error(IpcError::ConnectionClosed), CallError::Terminated));

        match map_ipc_error(IpcError::Remote {
            message: "unknown request".to_string(),
        }) {
            CallError::Failed { source } => assert_eq!(source.to_string(), "unknown request"),
            other => panic!("unexpected error: {}", other),
        }

        let io = std::io::Error::other("broken pipe");
        assert!(matches!(
            map_ipc_error(IpcError::Io { source: io }),
            CallError::Transport { .. }
        ));
    }

    #[tokio::test]
    async fn calls_fail_without_running_worker() {
        let supervisor = OsProcessSupervisor::new(WorkerSpec::new("idle", "/bin/true"));
        let handle = supervisor.handle();

        let result = call(&handle, json!("ping"), Duration::from_millis(10)).await;
        assert!(matches!(result, Err(CallError::Unavailable)));
        assert!(matches!(handle.cast(json!("work")), Err(CallError::Unavailable)));
        assert_eq!(handle.request_count(), 0);
        assert_eq!(handle.pid(), None);
        assert!(!handle.is_ready());

        let typed = handle.typed::<u64, u64, u64>();
        let result = call(&typed, 1, Duration::from_millis(10)).await;
        assert!(matches!(result, Err(CallError::Unavailable)));
    }
}
