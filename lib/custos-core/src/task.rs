//! Helpers for working with asynchronous tasks.

use std::future::Future;

use tokio::task::JoinHandle;
use tracing::{debug_span, Instrument as _};

/// Spawns a new named asynchronous task, returning a [`JoinHandle`] for it.
///
/// This function is a thin wrapper over [`tokio::spawn`], and attaches the spawned future to the current `tracing`
/// span, nested under a `task` span carrying the given name.
pub fn spawn_traced_named<S, F, T>(name: S, f: F) -> JoinHandle<T>
where
    S: Into<String>,
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let name = name.into();
    tokio::task::spawn(f.instrument(debug_span!("task", task_name = %name)))
}
