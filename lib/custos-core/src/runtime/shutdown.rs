use std::{
    future::{pending, Future},
    pin::Pin,
};

use tokio::select;
use tokio_util::sync::{CancellationToken, DropGuard};

/// A shutdown signal for a process.
///
/// This struct can be used to wait for a shutdown signal from the supervisor to which the process belongs. Derived
/// signals can be created with [`child`][Self::child] for auxiliary tasks, such as health checks, which must stop
/// whenever the owning process is asked to stop.
pub struct ProcessShutdown {
    token: CancellationToken,
    external: Option<Pin<Box<dyn Future<Output = ()> + Send>>>,
}

/// A handle to trigger process shutdown.
///
/// Dropping the handle also triggers shutdown.
pub struct ShutdownHandle {
    _guard: DropGuard,
}

impl ProcessShutdown {
    /// Creates a new `ProcessShutdown` and `ShutdownHandle` pair.
    ///
    /// When `ShutdownHandle` is triggered, or dropped, `ProcessShutdown` will resolve.
    pub fn paired() -> (Self, ShutdownHandle) {
        let token = CancellationToken::new();
        let handle = ShutdownHandle {
            _guard: token.clone().drop_guard(),
        };

        (Self { token, external: None }, handle)
    }

    /// Creates a new `ProcessShutdown` from the given `future`.
    ///
    /// `ProcessShutdown` will resolve only once `future` resolves. Signals derived with [`child`][Self::child] are
    /// triggered once this signal has observed the future resolving.
    pub fn wrapped<F: Future + Send + 'static>(future: F) -> Self {
        Self {
            token: CancellationToken::new(),
            external: Some(Box::pin(async move {
                future.await;
            })),
        }
    }

    /// Creates a new `ProcessShutdown` that never resolves.
    ///
    /// This is useful for cases where a `ProcessShutdown` is required, but no shutdown signal is expected.
    pub fn noop() -> Self {
        Self {
            token: CancellationToken::new(),
            external: Some(Box::pin(pending())),
        }
    }

    /// Creates a derived `ProcessShutdown` that resolves whenever this one does.
    ///
    /// The derived signal can be independently triggered through the returned handle without affecting this one.
    pub fn child(&self) -> (ProcessShutdown, ShutdownHandle) {
        let token = self.token.child_token();
        let handle = ShutdownHandle {
            _guard: token.clone().drop_guard(),
        };

        (
            ProcessShutdown {
                token,
                external: None,
            },
            handle,
        )
    }

    /// Returns a cancellation token that is cancelled whenever this signal resolves.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Returns `true` if shutdown has been triggered.
    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Waits for the shutdown signal to be received.
    ///
    /// If the shutdown signal has been received during a previous call to this function, this function will return
    /// immediately for all subsequent calls.
    pub async fn wait_for_shutdown(&mut self) {
        let external_resolved = match self.external.as_mut() {
            Some(external) => select! {
                _ = self.token.cancelled() => false,
                _ = external => true,
            },
            None => {
                self.token.cancelled().await;
                false
            }
        };

        if external_resolved {
            self.external = None;
            self.token.cancel();
        }
    }
}

impl ShutdownHandle {
    /// Triggers the process to shutdown.
    pub fn trigger(self) {
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{sync::oneshot, time::timeout};
    use tokio_test::{assert_pending, assert_ready, task::spawn};

    use super::*;

    #[test]
    fn paired_resolves_on_trigger() {
        let (mut shutdown, handle) = ProcessShutdown::paired();
        let mut wait = spawn(shutdown.wait_for_shutdown());
        assert_pending!(wait.poll());

        handle.trigger();
        assert!(wait.is_woken());
        assert_ready!(wait.poll());
        drop(wait);

        assert!(shutdown.is_shutdown());
    }

    #[test]
    fn paired_resolves_on_drop() {
        let (shutdown, handle) = ProcessShutdown::paired();
        drop(handle);
        assert!(shutdown.is_shutdown());
    }

    #[test]
    fn child_follows_parent_but_not_the_reverse() {
        let (parent, parent_handle) = ProcessShutdown::paired();
        let (child, child_handle) = parent.child();
        let (sibling, _sibling_handle) = parent.child();

        child_handle.trigger();
        assert!(child.is_shutdown());
        assert!(!parent.is_shutdown());
        assert!(!sibling.is_shutdown());

        parent_handle.trigger();
        assert!(sibling.is_shutdown());
    }

    #[tokio::test]
    async fn wrapped_cancels_derived_signals() {
        let (tx, rx) = oneshot::channel::<()>();
        let mut shutdown = ProcessShutdown::wrapped(rx);
        let token = shutdown.cancellation_token();

        tx.send(()).unwrap();
        timeout(Duration::from_secs(1), shutdown.wait_for_shutdown())
            .await
            .unwrap();

        assert!(token.is_cancelled());

        // Subsequent waits return immediately.
        timeout(Duration::from_secs(1), shutdown.wait_for_shutdown())
            .await
            .unwrap();
    }
}
