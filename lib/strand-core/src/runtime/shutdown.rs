use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// A shutdown signal for a supervised task.
///
/// Termination is cooperative: a task is expected to check or wait on its `ProcessShutdown` and return soon after the
/// signal fires. Nothing forcibly stops a thread that ignores it.
#[derive(Clone, Debug)]
pub struct ProcessShutdown {
    token: CancellationToken,
}

/// A handle to trigger a paired [`ProcessShutdown`].
///
/// Dropping the handle also triggers shutdown.
#[derive(Debug)]
pub struct ShutdownHandle {
    token: CancellationToken,
}

impl ProcessShutdown {
    /// Creates a new `ProcessShutdown` and `ShutdownHandle` pair.
    pub fn paired() -> (Self, ShutdownHandle) {
        let token = CancellationToken::new();
        let handle = ShutdownHandle { token: token.clone() };
        (Self { token }, handle)
    }

    /// Creates a `ProcessShutdown` that resolves when `token` is cancelled.
    pub fn from_token(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Creates a `ProcessShutdown` that never resolves.
    pub fn noop() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Returns `true` if shutdown has been signalled.
    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Returns the underlying cancellation token.
    ///
    /// This can be passed to [`Channel::receive_until`][crate::channel::Channel::receive_until] so that a task blocked
    /// on a channel notices shutdown.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Blocks the current thread until shutdown is signalled.
    pub fn wait_for_shutdown(&self) {
        futures::executor::block_on(self.token.cancelled());
    }

    /// Blocks the current thread until shutdown is signalled or `timeout` elapses.
    ///
    /// Returns `true` if shutdown was signalled. A timeout too large to represent waits without a deadline.
    pub fn wait_for_shutdown_timeout(&self, timeout: Duration) -> bool {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait_for_shutdown();
            return true;
        };
        loop {
            if self.token.is_cancelled() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }
}

impl ShutdownHandle {
    /// Triggers shutdown.
    pub fn trigger(&self) {
        self.token.cancel();
    }
}

impl Drop for ShutdownHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn dropping_handle_triggers_shutdown() {
        let (shutdown, handle) = ProcessShutdown::paired();
        assert!(!shutdown.is_shutdown());
        drop(handle);
        assert!(shutdown.is_shutdown());
        shutdown.wait_for_shutdown();
    }

    #[test]
    fn wait_from_another_thread() {
        let (shutdown, handle) = ProcessShutdown::paired();
        let waiter = thread::spawn(move || shutdown.wait_for_shutdown());

        thread::sleep(Duration::from_millis(20));
        handle.trigger();
        waiter.join().unwrap();
    }

    #[test]
    fn unbounded_timeout_returns_once_signalled() {
        let (shutdown, handle) = ProcessShutdown::paired();
        handle.trigger();
        assert!(shutdown.wait_for_shutdown_timeout(Duration::MAX));
    }

    #[test]
    fn noop_times_out() {
        let shutdown = ProcessShutdown::noop();
        assert!(!shutdown.wait_for_shutdown_timeout(Duration::from_millis(15)));
    }
}
