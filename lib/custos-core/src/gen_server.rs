//! Generic server behavior.
//!
//! A generic server is a process that owns some state and reacts to three kinds of messages:
//!
//! - **calls**, which are synchronous requests that produce a reply for the caller
//! - **casts**, which are fire-and-forget messages
//! - **infos**, which are out-of-band notifications
//!
//! Messages are delivered through a mailbox and processed one at a time, so handlers can mutate the server state
//! without any locking of their own. Callers interact with a server through a [`ServerRef`], which can be cloned
//! freely.
//!
//! Servers are usually run under a [`Supervisor`][crate::runtime::Supervisor], by building a [`ChildSpec`] with
//! [`child_spec`]. The mailbox outlives individual instances of the server, so a `ServerRef` stays valid across
//! restarts: messages sent while the server is restarting are processed by the next instance.
//!
//! The [`ServerHandle`] trait abstracts over how a server is reached, so that callers can use the same
//! [`call`]/[`cast`] API for in-process servers and for servers running in an external worker process.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use custos_error::{generic_error, ErrorContext as _, GenericError};
use snafu::Snafu;
use tokio::{
    select,
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error};

use crate::runtime::{ChildSpec, ProcessContext, ProcessShutdown, ShutdownHandle, Supervisable, SupervisorError};

/// A generic server.
#[async_trait]
pub trait GenServer: Send + 'static {
    /// Synchronous request type.
    type Call: Send + 'static;

    /// Reply type for synchronous requests.
    type Reply: Send + 'static;

    /// Asynchronous message type.
    type Cast: Send + 'static;

    /// Out-of-band notification type.
    type Info: Send + 'static;

    /// Initializes the server before any message is processed.
    ///
    /// # Errors
    ///
    /// If initialization fails, the server instance fails without processing any messages.
    async fn init(&mut self) -> Result<(), GenericError> {
        Ok(())
    }

    /// Handles a synchronous request.
    ///
    /// # Errors
    ///
    /// Errors are returned to the caller, and do not stop the server.
    async fn handle_call(&mut self, request: Self::Call) -> Result<Self::Reply, GenericError>;

    /// Handles an asynchronous message.
    ///
    /// # Errors
    ///
    /// If an error is returned, the server terminates with that error.
    async fn handle_cast(&mut self, _message: Self::Cast) -> Result<(), GenericError> {
        Ok(())
    }

    /// Handles an out-of-band notification.
    ///
    /// # Errors
    ///
    /// If an error is returned, the server terminates with that error.
    async fn handle_info(&mut self, _info: Self::Info) -> Result<(), GenericError> {
        Ok(())
    }

    /// Called when the server is about to stop.
    ///
    /// `reason` is `None` when the server was asked to shut down, and holds the error otherwise.
    ///
    /// # Errors
    ///
    /// If cleanup fails, an error is returned.
    async fn terminate(&mut self, _reason: Option<&GenericError>) -> Result<(), GenericError> {
        Ok(())
    }
}

/// Errors returned when calling or casting to a server.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum CallError {
    /// No reply was received within the timeout.
    #[snafu(display("No reply received within {:?}.", timeout))]
    Timeout {
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The server can no longer receive messages.
    #[snafu(display("Server is unavailable."))]
    Unavailable,

    /// The server stopped before replying.
    #[snafu(display("Server terminated before replying."))]
    Terminated,

    /// The server returned an error for the request.
    #[snafu(display("Server failed to handle request: {}", source))]
    Failed {
        /// The error returned by the server.
        source: GenericError,
    },

    /// The transport to a remote server failed.
    #[snafu(display("Transport to server failed: {}", source))]
    Transport {
        /// The underlying transport error.
        source: GenericError,
    },
}

/// A handle to a server that accepts calls and casts.
///
/// Implemented by [`ServerRef`] for in-process servers, and by proxies to servers living in other processes.
#[async_trait]
pub trait ServerHandle: Send + Sync {
    /// Synchronous request type.
    type Request: Send;

    /// Reply type.
    type Reply: Send;

    /// Asynchronous message type.
    type Message: Send;

    /// Sends a request and waits up to `timeout` for its reply.
    ///
    /// # Errors
    ///
    /// If no reply arrives in time, the server fails to handle the request, or the server cannot be reached, an error
    /// is returned.
    async fn call(&self, request: Self::Request, timeout: Duration) -> Result<Self::Reply, CallError>;

    /// Sends a message without waiting for it to be processed.
    ///
    /// # Errors
    ///
    /// If the server cannot be reached, an error is returned.
    async fn cast(&self, message: Self::Message) -> Result<(), CallError>;
}

/// Sends a request to `server` and waits up to `timeout` for its reply.
///
/// # Errors
///
/// See [`ServerHandle::call`].
pub async fn call<H: ServerHandle>(server: &H, request: H::Request, timeout: Duration) -> Result<H::Reply, CallError> {
    server.call(request, timeout).await
}

/// Sends a message to `server` without waiting for it to be processed.
///
/// # Errors
///
/// See [`ServerHandle::cast`].
pub async fn cast<H: ServerHandle>(server: &H, message: H::Message) -> Result<(), CallError> {
    server.cast(message).await
}

enum Envelope<S: GenServer> {
    Call {
        request: S::Call,
        reply: oneshot::Sender<Result<S::Reply, GenericError>>,
    },
    Cast(S::Cast),
    Info(S::Info),
}

type Mailbox<S> = mpsc::UnboundedReceiver<Envelope<S>>;

/// A reference to a generic server.
pub struct ServerRef<S: GenServer> {
    tx: mpsc::UnboundedSender<Envelope<S>>,
}

impl<S: GenServer> ServerRef<S> {
    fn new() -> (Self, Mailbox<S>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Sends a request and waits up to `timeout` for its reply.
    ///
    /// # Errors
    ///
    /// If no reply arrives in time, the server returns an error for the request, the server instance handling the
    /// request stops before replying, or the server can no longer receive messages, an error is returned.
    pub async fn call(&self, request: S::Call, timeout: Duration) -> Result<S::Reply, CallError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Envelope::Call {
                request,
                reply: reply_tx,
            })
            .map_err(|_| CallError::Unavailable)?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(Ok(reply))) => Ok(reply),
            Ok(Ok(Err(source))) => Err(CallError::Failed { source }),
            Ok(Err(_)) => Err(CallError::Terminated),
            Err(_) => Err(CallError::Timeout { timeout }),
        }
    }

    /// Sends a message without waiting for it to be processed.
    ///
    /// # Errors
    ///
    /// If the server can no longer receive messages, an error is returned.
    pub fn cast(&self, message: S::Cast) -> Result<(), CallError> {
        self.tx.send(Envelope::Cast(message)).map_err(|_| CallError::Unavailable)
    }

    /// Sends an out-of-band notification.
    ///
    /// # Errors
    ///
    /// If the server can no longer receive messages, an error is returned.
    pub fn send_info(&self, info: S::Info) -> Result<(), CallError> {
        self.tx.send(Envelope::Info(info)).map_err(|_| CallError::Unavailable)
    }
}

impl<S: GenServer> Clone for ServerRef<S> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<S: GenServer> PartialEq for ServerRef<S> {
    fn eq(&self, other: &Self) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

impl<S: GenServer> Eq for ServerRef<S> {}

impl<S: GenServer> fmt::Debug for ServerRef<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerRef")
            .field("server", &std::any::type_name::<S>())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<S: GenServer> ServerHandle for ServerRef<S> {
    type Request = S::Call;
    type Reply = S::Reply;
    type Message = S::Cast;

    async fn call(&self, request: S::Call, timeout: Duration) -> Result<S::Reply, CallError> {
        ServerRef::call(self, request, timeout).await
    }

    async fn cast(&self, message: S::Cast) -> Result<(), CallError> {
        ServerRef::cast(self, message)
    }
}

/// Builds a child specification for a supervised generic server.
///
/// `factory` is called to create a fresh server each time the child starts. The returned [`ServerRef`] reaches
/// whichever instance is currently running.
pub fn child_spec<S, I, F>(id: I, factory: F) -> (ServerRef<S>, ChildSpec)
where
    S: GenServer,
    I: AsRef<str>,
    F: Fn() -> S + Send + Sync + 'static,
{
    let (server_ref, mailbox) = ServerRef::new();
    let mailbox = Arc::new(Mutex::new(mailbox));
    let factory = Arc::new(factory);

    let spec = ChildSpec::new(id, move || ServerProcess {
        factory: Arc::clone(&factory),
        mailbox: Arc::clone(&mailbox),
    });
    (server_ref, spec)
}

struct ServerProcess<S: GenServer, F> {
    factory: Arc<F>,
    mailbox: Arc<Mutex<Mailbox<S>>>,
}

#[async_trait]
impl<S, F> Supervisable for ServerProcess<S, F>
where
    S: GenServer,
    F: Fn() -> S + Send + Sync + 'static,
{
    async fn serve(&mut self, ctx: ProcessContext) -> Result<(), GenericError> {
        let mut mailbox = self.mailbox.lock().await;
        run_server((self.factory)(), &mut mailbox, ctx).await
    }
}

/// A generic server started outside of any supervisor.
pub struct StartedServer<S: GenServer> {
    server_ref: ServerRef<S>,
    shutdown_handle: ShutdownHandle,
    task: JoinHandle<Result<(), GenericError>>,
}

impl<S: GenServer> StartedServer<S> {
    /// Returns a reference to the server.
    pub fn server_ref(&self) -> &ServerRef<S> {
        &self.server_ref
    }

    /// Stops the server and waits for it to terminate.
    ///
    /// # Errors
    ///
    /// If the server failed, or its termination failed, an error is returned.
    pub async fn stop(self) -> Result<(), GenericError> {
        self.shutdown_handle.trigger();
        self.task.await.error_context("Server task panicked.")?
    }
}

/// Starts a generic server on the current runtime, outside of any supervisor.
///
/// The server is not restarted if it fails.
///
/// # Errors
///
/// If `name` is not a valid process name, an error is returned.
pub fn start<S: GenServer, N: AsRef<str>>(name: N, server: S) -> Result<StartedServer<S>, SupervisorError> {
    let (server_ref, mut mailbox) = ServerRef::new();
    let (shutdown, shutdown_handle) = ProcessShutdown::paired();
    let ctx = ProcessContext::detached(name, shutdown)?;

    let task = tokio::spawn(async move { run_server(server, &mut mailbox, ctx).await });
    Ok(StartedServer {
        server_ref,
        shutdown_handle,
        task,
    })
}

async fn run_server<S: GenServer>(
    mut server: S, mailbox: &mut Mailbox<S>, mut ctx: ProcessContext,
) -> Result<(), GenericError> {
    server
        .init()
        .await
        .with_error_context(|| format!("Server '{}' failed to initialize.", ctx.name()))?;
    debug!(server = ctx.name(), "Server initialized.");

    loop {
        select! {
            _ = ctx.wait_for_shutdown() => break,
            envelope = mailbox.recv() => {
                let result = match envelope {
                    Some(Envelope::Call { request, reply }) => {
                        let _ = reply.send(server.handle_call(request).await);
                        Ok(())
                    }
                    Some(Envelope::Cast(message)) => server.handle_cast(message).await,
                    Some(Envelope::Info(info)) => server.handle_info(info).await,
                    None => {
                        debug!(server = ctx.name(), "All server references dropped. Waiting for shutdown.");
                        ctx.wait_for_shutdown().await;
                        break;
                    }
                };

                if let Err(e) = result {
                    error!(server = ctx.name(), error = %e, "Server failed while handling message.");
                    if let Err(terminate_error) = server.terminate(Some(&e)).await {
                        error!(server = ctx.name(), error = %terminate_error, "Server failed to terminate cleanly.");
                    }
                    return Err(e);
                }
            }
        }
    }

    debug!(server = ctx.name(), "Server stopping.");
    server
        .terminate(None)
        .await
        .map_err(|e| generic_error!("Server '{}' failed to terminate cleanly: {}", ctx.name(), e))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::runtime::{BackoffConfig, RestartStrategy, Supervisor};

    const TIMEOUT: Duration = Duration::from_secs(5);

    enum CounterCall {
        Increment,
        Get,
        Divide(u64),
        Crash,
        Stall,
    }

    enum CounterCast {
        Add(u64),
        Poison,
    }

    struct Counter {
        count: u64,
        terminations: Arc<AtomicUsize>,
    }

    impl Counter {
        fn new(terminations: &Arc<AtomicUsize>) -> Self {
            Self {
                count: 0,
                terminations: Arc::clone(terminations),
            }
        }
    }

    #[async_trait]
    impl GenServer for Counter {
        type Call = CounterCall;
        type Reply = u64;
        type Cast = CounterCast;
        type Info = oneshot::Sender<u64>;

        async fn handle_call(&mut self, request: CounterCall) -> Result<u64, GenericError> {
            match request {
                CounterCall::Increment => {
                    self.count += 1;
                    Ok(self.count)
                }
                CounterCall::Get => Ok(self.count),
                CounterCall::Divide(0) => Err(generic_error!("division by zero")),
                CounterCall::Divide(divisor) => Ok(self.count / divisor),
                CounterCall::Crash => panic!("counter crashed"),
                CounterCall::Stall => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(self.count)
                }
            }
        }

        async fn handle_cast(&mut self, message: CounterCast) -> Result<(), GenericError> {
            match message {
                CounterCast::Add(n) => {
                    self.count += n;
                    Ok(())
                }
                CounterCast::Poison => Err(generic_error!("poisoned")),
            }
        }

        async fn handle_info(&mut self, reply: oneshot::Sender<u64>) -> Result<(), GenericError> {
            let _ = reply.send(self.count);
            Ok(())
        }

        async fn terminate(&mut self, _reason: Option<&GenericError>) -> Result<(), GenericError> {
            self.terminations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn supervised_counter() -> (ServerRef<Counter>, Supervisor, Arc<AtomicUsize>) {
        let terminations = Arc::new(AtomicUsize::new(0));
        let factory_terminations = Arc::clone(&terminations);
        let (server_ref, spec) = child_spec("counter", move || Counter::new(&factory_terminations));

        let mut sup = Supervisor::new("server_sup")
            .unwrap()
            .with_restart_strategy(RestartStrategy::one_for_one().with_intensity_and_period(5, Duration::from_secs(10)))
            .with_backoff(BackoffConfig::immediate());
        sup.add_child(spec).unwrap();
        (server_ref, sup, terminations)
    }

    #[tokio::test]
    async fn counter_counts_calls() {
        let (server_ref, mut sup, terminations) = supervised_counter();
        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move { sup.run_with_shutdown(rx).await });

        for _ in 0..3 {
            call(&server_ref, CounterCall::Increment, TIMEOUT).await.unwrap();
        }
        assert_eq!(call(&server_ref, CounterCall::Get, TIMEOUT).await.unwrap(), 3);

        tx.send(()).unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(terminations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn messages_are_processed_in_order() {
        let terminations = Arc::new(AtomicUsize::new(0));
        let server = start("counter", Counter::new(&terminations)).unwrap();
        let server_ref = server.server_ref().clone();

        cast(&server_ref, CounterCast::Add(10)).await.unwrap();
        server_ref.cast(CounterCast::Add(5)).unwrap();
        let (info_tx, info_rx) = oneshot::channel();
        server_ref.send_info(info_tx).unwrap();
        assert_eq!(info_rx.await.unwrap(), 15);
        assert_eq!(server_ref.call(CounterCall::Divide(3), TIMEOUT).await.unwrap(), 5);

        server.stop().await.unwrap();
        assert_eq!(terminations.load(Ordering::SeqCst), 1);
        assert!(matches!(server_ref.cast(CounterCast::Add(1)), Err(CallError::Unavailable)));
    }

    #[tokio::test]
    async fn call_error_is_returned_to_caller_without_stopping_server() {
        let terminations = Arc::new(AtomicUsize::new(0));
        let server = start("counter", Counter::new(&terminations)).unwrap();
        let server_ref = server.server_ref();

        server_ref.call(CounterCall::Increment, TIMEOUT).await.unwrap();
        let result = server_ref.call(CounterCall::Divide(0), TIMEOUT).await;
        assert!(matches!(result, Err(CallError::Failed { .. })));
        assert_eq!(server_ref.call(CounterCall::Get, TIMEOUT).await.unwrap(), 1);

        server.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn call_times_out() {
        let terminations = Arc::new(AtomicUsize::new(0));
        let server = start("counter", Counter::new(&terminations)).unwrap();

        let result = server
            .server_ref()
            .call(CounterCall::Stall, Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(CallError::Timeout { timeout }) if timeout == Duration::from_millis(100)));
    }

    #[tokio::test]
    async fn server_ref_survives_restarts() {
        let (server_ref, mut sup, terminations) = supervised_counter();
        let sup_handle = sup.handle();
        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move { sup.run_with_shutdown(rx).await });

        server_ref.call(CounterCall::Increment, TIMEOUT).await.unwrap();

        // A failing cast terminates the instance; the next one starts from scratch with the same mailbox.
        server_ref.cast(CounterCast::Poison).unwrap();
        assert_eq!(server_ref.call(CounterCall::Get, TIMEOUT).await.unwrap(), 0);

        // A call in flight when the instance crashes is answered with an error.
        let result = server_ref.call(CounterCall::Crash, TIMEOUT).await;
        assert!(matches!(result, Err(CallError::Terminated)));
        assert_eq!(server_ref.call(CounterCall::Increment, TIMEOUT).await.unwrap(), 1);

        assert_eq!(sup_handle.children()[0].restart_count(), 2);
        assert_eq!(terminations.load(Ordering::SeqCst), 1);

        tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[test]
    fn server_refs_compare_by_mailbox() {
        let (first, _) = child_spec("a", || Counter::new(&Arc::default()));
        let (second, _) = child_spec("b", || Counter::new(&Arc::default()));

        assert_eq!(first, first.clone());
        assert_ne!(first, second);
    }
}
