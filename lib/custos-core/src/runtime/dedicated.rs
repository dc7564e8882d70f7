//! Dedicated runtime support for supervisors.

use std::{
    future::Future,
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    task::{ready, Context, Poll},
    thread::JoinHandle,
};

use custos_error::{generic_error, GenericError};
use tokio::sync::oneshot;

use super::{
    process::{Process, ProcessExt as _},
    shutdown::ProcessShutdown,
    supervisor::Supervisor,
};

/// Configuration for a dedicated Tokio runtime.
#[derive(Clone, Debug)]
pub struct RuntimeConfiguration {
    worker_threads: usize,
}

impl RuntimeConfiguration {
    /// Creates a single-threaded configuration, based on Tokio's "current thread" runtime.
    pub const fn single_threaded() -> Self {
        Self { worker_threads: 1 }
    }

    /// Creates a multi-threaded configuration with the given number of worker threads.
    ///
    /// A value of zero or one yields a single-threaded runtime.
    pub const fn multi_threaded(worker_threads: usize) -> Self {
        Self { worker_threads }
    }

    fn build(&self, supervisor_id: &str) -> io::Result<tokio::runtime::Runtime> {
        if self.worker_threads <= 1 {
            return tokio::runtime::Builder::new_current_thread().enable_all().build();
        }

        let supervisor_id = supervisor_id.to_string();
        let next_thread_id = Arc::new(AtomicUsize::new(0));
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .worker_threads(self.worker_threads)
            .thread_name_fn(move || {
                let thread_id = next_thread_id.fetch_add(1, Ordering::Relaxed);
                format!("{}-sup-{:02}", supervisor_id, thread_id)
            })
            .build()
    }
}

/// Controls which runtime a supervisor runs on.
#[derive(Clone, Debug, Default)]
pub enum RuntimeMode {
    /// Run on whatever Tokio runtime is driving the parent supervisor.
    #[default]
    Ambient,

    /// Run on a dedicated runtime, on its own OS thread(s).
    Dedicated(RuntimeConfiguration),
}

/// A supervisor running on a dedicated runtime.
///
/// Resolves once the supervisor returns, or immediately if the runtime could not be built.
pub(crate) struct DedicatedRuntimeHandle {
    init_rx: Option<oneshot::Receiver<Result<(), GenericError>>>,
    result_rx: oneshot::Receiver<Result<(), GenericError>>,
    thread_handle: Option<JoinHandle<()>>,
}

impl DedicatedRuntimeHandle {
    fn join_thread(&mut self) {
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Future for DedicatedRuntimeHandle {
    type Output = Result<(), GenericError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(init_rx) = self.init_rx.as_mut() {
            let init_result = match ready!(Pin::new(init_rx).poll(cx)) {
                Ok(result) => result,
                Err(_) => Err(generic_error!("Dedicated runtime thread exited before reporting initialization.")),
            };
            self.init_rx = None;

            if let Err(e) = init_result {
                self.join_thread();
                return Poll::Ready(Err(e));
            }
        }

        let result = match ready!(Pin::new(&mut self.result_rx).poll(cx)) {
            Ok(result) => result,
            Err(_) => Err(generic_error!("Dedicated runtime thread exited without a supervisor result.")),
        };
        self.join_thread();
        Poll::Ready(result)
    }
}

/// Spawns a supervisor on a dedicated runtime, on a new OS thread named `<id>-sup-rt`.
///
/// Multi-threaded runtimes spawn additional worker threads named `<id>-sup-NN`.
///
/// # Errors
///
/// If the OS thread cannot be spawned, an error is returned.
pub(crate) fn spawn_dedicated_runtime(
    supervisor: Supervisor, config: RuntimeConfiguration, process: Process, process_shutdown: ProcessShutdown,
) -> Result<DedicatedRuntimeHandle, GenericError> {
    let (init_tx, init_rx) = oneshot::channel();
    let (result_tx, result_rx) = oneshot::channel();

    let thread_name = format!("{}-sup-rt", supervisor.id());
    let thread_handle = std::thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            let runtime = match config.build(supervisor.id()) {
                Ok(runtime) => runtime,
                Err(e) => {
                    let _ = init_tx.send(Err(generic_error!("Failed to build dedicated runtime: {}", e)));
                    return;
                }
            };

            if init_tx.send(Ok(())).is_err() {
                return;
            }

            let result = runtime.block_on(
                supervisor
                    .run_inner(process.clone(), process_shutdown)
                    .into_instrumented(process),
            );
            let _ = result_tx.send(result.map_err(GenericError::from));
        })
        .map_err(|e| generic_error!("Failed to spawn dedicated runtime thread '{}': {}", thread_name, e))?;

    Ok(DedicatedRuntimeHandle {
        init_rx: Some(init_rx),
        result_rx,
        thread_handle: Some(thread_handle),
    })
}
