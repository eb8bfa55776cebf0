//! Bounded blocking channels.
//!
//! A [`Channel`] is a capacity-bounded FIFO queue shared between any number of senders and receivers. Senders block
//! while the channel is full, receivers block while it is empty, and closing the channel wakes every waiter.
//!
//! Closing is "drain-then-close": values already buffered when the channel is closed are still delivered, and receivers
//! only observe [`ChannelError::Closed`] once the buffer is empty. Senders observe it immediately.

use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use serde::Deserialize;
use snafu::Snafu;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// How often a cancellable receive re-checks its cancellation token.
const CANCELLATION_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Channel errors.
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(context(suffix(false)))]
pub enum ChannelError {
    /// The channel is closed.
    ///
    /// For senders, this is returned as soon as the channel is closed. For receivers, this is only returned once the
    /// channel is closed _and_ all buffered values have been received.
    #[snafu(display("channel is closed"))]
    Closed,

    /// The channel is full and the operation would have blocked.
    #[snafu(display("channel is full"))]
    Full,

    /// The channel is empty and the operation would have blocked.
    #[snafu(display("channel is empty"))]
    Empty,

    /// The operation did not complete before its deadline.
    #[snafu(display("channel operation timed out after {:?}", timeout))]
    TimedOut {
        /// How long the operation waited.
        timeout: Duration,
    },

    /// The operation was interrupted by cancellation before it could complete.
    #[snafu(display("channel operation was interrupted"))]
    Interrupted,

    /// The endpoint attached to the channel is invalid.
    #[snafu(display("invalid channel endpoint: {}", reason))]
    InvalidEndpoint {
        /// Why the endpoint was rejected.
        reason: String,
    },

    /// The requested capacity is not supported.
    #[snafu(display("invalid channel capacity {}: capacity must be at least 1", capacity))]
    InvalidCapacity {
        /// The requested capacity.
        capacity: usize,
    },
}

/// Intended communication topology of a channel.
///
/// Patterns are metadata for routing and optimization layers. They never change the buffering semantics of the channel:
/// every pattern is a single FIFO queue.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChannelPattern {
    /// Plain point-to-point queue.
    #[default]
    Default,

    /// Publishing side of a publish/subscribe pair.
    Pub,

    /// Subscribing side of a publish/subscribe pair.
    Sub,

    /// Pushing side of a pipeline.
    Push,

    /// Pulling side of a pipeline.
    Pull,

    /// Requesting side of a request/reply pair.
    Req,

    /// Replying side of a request/reply pair.
    Rep,

    /// Asynchronous requester.
    Dealer,

    /// Asynchronous replier.
    Router,

    /// Exclusive pair.
    Pair,
}

impl fmt::Display for ChannelPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Default => "default",
            Self::Pub => "pub",
            Self::Sub => "sub",
            Self::Push => "push",
            Self::Pull => "pull",
            Self::Req => "req",
            Self::Rep => "rep",
            Self::Dealer => "dealer",
            Self::Router => "router",
            Self::Pair => "pair",
        };
        f.write_str(name)
    }
}

// Time left before `deadline`: `None` when there is no deadline (the timeout does not fit in an `Instant`), and
// `Some(None)` once it has passed.
fn remaining(deadline: Option<Instant>) -> Option<Option<Duration>> {
    deadline.map(|deadline| {
        let now = Instant::now();
        (now < deadline).then(|| deadline - now)
    })
}

struct State<T> {
    buffer: VecDeque<T>,
    closed: bool,
}

struct Shared<T> {
    capacity: usize,
    pattern: ChannelPattern,
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> Shared<T> {
    // Every critical section leaves the buffer in a consistent state, so a poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_not_full<'a>(&self, guard: MutexGuard<'a, State<T>>) -> MutexGuard<'a, State<T>> {
        self.not_full.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_not_empty<'a>(&self, guard: MutexGuard<'a, State<T>>) -> MutexGuard<'a, State<T>> {
        self.not_empty.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_not_full_timeout<'a>(
        &self, guard: MutexGuard<'a, State<T>>, timeout: Duration,
    ) -> MutexGuard<'a, State<T>> {
        self.not_full
            .wait_timeout(guard, timeout)
            .map(|(guard, _)| guard)
            .unwrap_or_else(|e| e.into_inner().0)
    }

    fn wait_not_empty_timeout<'a>(
        &self, guard: MutexGuard<'a, State<T>>, timeout: Duration,
    ) -> MutexGuard<'a, State<T>> {
        self.not_empty
            .wait_timeout(guard, timeout)
            .map(|(guard, _)| guard)
            .unwrap_or_else(|e| e.into_inner().0)
    }
}

/// A bounded, blocking, closable FIFO channel.
///
/// `Channel` is a handle: cloning it is cheap and every clone refers to the same underlying queue. The queue is torn
/// down when the last handle is dropped.
pub struct Channel<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Channel<T> {
    /// Creates a new `Channel` with the given capacity and the default pattern.
    ///
    /// # Errors
    ///
    /// If `capacity` is zero, an error is returned.
    pub fn bounded(capacity: usize) -> Result<Self, ChannelError> {
        Self::with_pattern(capacity, ChannelPattern::Default)
    }

    /// Creates a new `Channel` with the given capacity and pattern.
    ///
    /// # Errors
    ///
    /// If `capacity` is zero, an error is returned. Unbuffered rendezvous channels are not supported; a capacity of one
    /// is the closest equivalent.
    pub fn with_pattern(capacity: usize, pattern: ChannelPattern) -> Result<Self, ChannelError> {
        if capacity == 0 {
            return Err(ChannelError::InvalidCapacity { capacity });
        }

        Ok(Self {
            shared: Arc::new(Shared {
                capacity,
                pattern,
                state: Mutex::new(State {
                    buffer: VecDeque::with_capacity(capacity),
                    closed: false,
                }),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
            }),
        })
    }

    /// Returns the capacity of the channel.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Returns the pattern the channel was created with.
    pub fn pattern(&self) -> ChannelPattern {
        self.shared.pattern
    }

    /// Returns the number of buffered values.
    pub fn len(&self) -> usize {
        self.shared.lock().buffer.len()
    }

    /// Returns `true` if no values are buffered.
    pub fn is_empty(&self) -> bool {
        self.shared.lock().buffer.is_empty()
    }

    /// Returns `true` if the channel is at capacity.
    pub fn is_full(&self) -> bool {
        self.shared.lock().buffer.len() == self.shared.capacity
    }

    /// Returns `true` if the channel has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Sends a value, blocking while the channel is full.
    ///
    /// # Errors
    ///
    /// If the channel is closed, either before the call or while waiting for space, `ChannelError::Closed` is returned
    /// and the value is not enqueued.
    pub fn send(&self, value: T) -> Result<(), ChannelError> {
        let mut state = self.shared.lock();
        loop {
            if state.closed {
                return Err(ChannelError::Closed);
            }
            if state.buffer.len() < self.shared.capacity {
                break;
            }
            state = self.shared.wait_not_full(state);
        }

        self.enqueue(state, value);
        Ok(())
    }

    /// Sends a value without blocking.
    ///
    /// # Errors
    ///
    /// If the channel is closed, `ChannelError::Closed` is returned. If the channel is full, `ChannelError::Full` is
    /// returned.
    pub fn try_send(&self, value: T) -> Result<(), ChannelError> {
        let state = self.shared.lock();
        if state.closed {
            return Err(ChannelError::Closed);
        }
        if state.buffer.len() == self.shared.capacity {
            return Err(ChannelError::Full);
        }

        self.enqueue(state, value);
        Ok(())
    }

    /// Sends a value, blocking for at most `timeout` while the channel is full.
    ///
    /// # Errors
    ///
    /// If the channel is closed, `ChannelError::Closed` is returned. If no space became available before the timeout
    /// elapsed, `ChannelError::TimedOut` is returned.
    pub fn send_timeout(&self, value: T, timeout: Duration) -> Result<(), ChannelError> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.shared.lock();
        loop {
            if state.closed {
                return Err(ChannelError::Closed);
            }
            if state.buffer.len() < self.shared.capacity {
                break;
            }
            state = match remaining(deadline) {
                Some(Some(left)) => self.shared.wait_not_full_timeout(state, left),
                Some(None) => return Err(ChannelError::TimedOut { timeout }),
                None => self.shared.wait_not_full(state),
            };
        }

        self.enqueue(state, value);
        Ok(())
    }

    /// Sends a value, blocking while the channel is full or until `token` is cancelled.
    ///
    /// # Errors
    ///
    /// If the channel is closed, `ChannelError::Closed` is returned. If `token` is cancelled while waiting for space,
    /// `ChannelError::Interrupted` is returned and the value is dropped.
    pub fn send_until(&self, value: T, token: &CancellationToken) -> Result<(), ChannelError> {
        let mut state = self.shared.lock();
        loop {
            if state.closed {
                return Err(ChannelError::Closed);
            }
            if state.buffer.len() < self.shared.capacity {
                break;
            }
            if token.is_cancelled() {
                return Err(ChannelError::Interrupted);
            }
            state = self.shared.wait_not_full_timeout(state, CANCELLATION_POLL_INTERVAL);
        }

        self.enqueue(state, value);
        Ok(())
    }

    /// Receives a value, blocking while the channel is empty.
    ///
    /// # Errors
    ///
    /// If the channel is closed and empty, `ChannelError::Closed` is returned.
    pub fn receive(&self) -> Result<T, ChannelError> {
        let mut state = self.shared.lock();
        loop {
            if let Some(value) = self.dequeue(&mut state) {
                return Ok(value);
            }
            if state.closed {
                return Err(ChannelError::Closed);
            }
            state = self.shared.wait_not_empty(state);
        }
    }

    /// Receives a value without blocking.
    ///
    /// # Errors
    ///
    /// If the channel is empty, `ChannelError::Empty` is returned, or `ChannelError::Closed` if it is also closed.
    pub fn try_receive(&self) -> Result<T, ChannelError> {
        let mut state = self.shared.lock();
        match self.dequeue(&mut state) {
            Some(value) => Ok(value),
            None if state.closed => Err(ChannelError::Closed),
            None => Err(ChannelError::Empty),
        }
    }

    /// Receives a value, blocking for at most `timeout` while the channel is empty.
    ///
    /// # Errors
    ///
    /// If the channel is closed and empty, `ChannelError::Closed` is returned. If no value arrived before the timeout
    /// elapsed, `ChannelError::TimedOut` is returned.
    pub fn receive_timeout(&self, timeout: Duration) -> Result<T, ChannelError> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.shared.lock();
        loop {
            if let Some(value) = self.dequeue(&mut state) {
                return Ok(value);
            }
            if state.closed {
                return Err(ChannelError::Closed);
            }
            state = match remaining(deadline) {
                Some(Some(left)) => self.shared.wait_not_empty_timeout(state, left),
                Some(None) => return Err(ChannelError::TimedOut { timeout }),
                None => self.shared.wait_not_empty(state),
            };
        }
    }

    /// Receives a value, blocking while the channel is empty until `token` is cancelled.
    ///
    /// Cancellation is observed on a short polling interval, so an interrupted receive may return slightly after the
    /// token was cancelled. A value that is already buffered is always returned, even if the token is cancelled.
    ///
    /// # Errors
    ///
    /// If the channel is closed and empty, `ChannelError::Closed` is returned. If the token is cancelled while waiting,
    /// `ChannelError::Interrupted` is returned.
    pub fn receive_until(&self, token: &CancellationToken) -> Result<T, ChannelError> {
        let mut state = self.shared.lock();
        loop {
            if let Some(value) = self.dequeue(&mut state) {
                return Ok(value);
            }
            if state.closed {
                return Err(ChannelError::Closed);
            }
            if token.is_cancelled() {
                return Err(ChannelError::Interrupted);
            }
            state = self.shared.wait_not_empty_timeout(state, CANCELLATION_POLL_INTERVAL);
        }
    }

    /// Closes the channel.
    ///
    /// All blocked senders and receivers are woken. Closing an already-closed channel has no effect.
    pub fn close(&self) {
        let mut state = self.shared.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        trace!(buffered = state.buffer.len(), pattern = %self.shared.pattern, "Channel closed.");
        drop(state);

        self.shared.not_empty.notify_all();
        self.shared.not_full.notify_all();
    }

    /// Returns an iterator that receives values until the channel is closed and drained.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter { channel: self }
    }

    fn enqueue(&self, mut state: MutexGuard<'_, State<T>>, value: T) {
        state.buffer.push_back(value);
        drop(state);
        self.shared.not_empty.notify_one();
    }

    fn dequeue(&self, state: &mut MutexGuard<'_, State<T>>) -> Option<T> {
        let value = state.buffer.pop_front()?;
        self.shared.not_full.notify_one();
        Some(value)
    }
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("Channel")
            .field("capacity", &self.shared.capacity)
            .field("pattern", &self.shared.pattern)
            .field("len", &state.buffer.len())
            .field("closed", &state.closed)
            .finish()
    }
}

/// Blocking iterator over the values received from a [`Channel`].
pub struct Iter<'a, T> {
    channel: &'a Channel<T>,
}

impl<T> Iterator for Iter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.channel.receive().ok()
    }
}

impl<'a, T> IntoIterator for &'a Channel<T> {
    type Item = T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
