//! Goroutine spawning and tracking.
//!
//! Every goroutine is a closure running on its own named OS thread. The [`GoroutineManager`] records the join handle of
//! everything it spawns and joins all of them on [`shutdown`][GoroutineManager::shutdown] or when dropped.
//!
//! Managers are unbounded by default. A limit can be configured with [`GoroutineConfig`], in which case spawning past
//! the limit either blocks until a running goroutine finishes or fails immediately, depending on the
//! [`SaturationPolicy`].

use std::{
    any::Any,
    io,
    sync::{
        atomic::{AtomicUsize, Ordering::Relaxed},
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
};

use serde::Deserialize;
use snafu::Snafu;
use strand_config::{ConfigurationError, GenericConfiguration};
use tracing::{debug, error, trace};

use crate::context::{Capability, RuntimeContext};

const DEFAULT_THREAD_NAME_PREFIX: &str = "strand-go";

/// Spawn errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum SpawnError {
    /// The operating system refused to create the thread.
    #[snafu(display("failed to spawn goroutine thread: {}", source))]
    FailedToSpawn {
        /// The underlying I/O error.
        source: io::Error,
    },

    /// The manager is at its goroutine limit and is configured to reject new goroutines.
    #[snafu(display("goroutine limit of {} reached", limit))]
    Saturated {
        /// The configured limit.
        limit: usize,
    },

    /// The runtime context does not permit spawning threads.
    #[snafu(display("spawning goroutines is not permitted"))]
    NotPermitted,
}

/// What to do when spawning on a manager that is already at its goroutine limit.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SaturationPolicy {
    /// Wait until a running goroutine finishes.
    #[default]
    Block,

    /// Fail with [`SpawnError::Saturated`].
    Reject,
}

/// Goroutine manager configuration.
#[derive(Clone, Debug)]
pub struct GoroutineConfig {
    max_goroutines: Option<usize>,
    saturation: SaturationPolicy,
    thread_name_prefix: String,
}

impl GoroutineConfig {
    /// Creates an unbounded configuration.
    pub fn unbounded() -> Self {
        Self {
            max_goroutines: None,
            saturation: SaturationPolicy::Block,
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
        }
    }

    /// Creates a configuration that allows at most `max_goroutines` goroutines to run at once.
    pub fn bounded(max_goroutines: usize, saturation: SaturationPolicy) -> Self {
        Self {
            max_goroutines: Some(max_goroutines),
            saturation,
            ..Self::unbounded()
        }
    }

    /// Reads the configuration from `goroutines.max` and `goroutines.saturation`.
    ///
    /// # Errors
    ///
    /// If either key is present but has the wrong type, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, ConfigurationError> {
        let mut goroutine_config = Self::unbounded();
        goroutine_config.max_goroutines = config.try_get_typed::<usize>("goroutines.max")?;
        if let Some(saturation) = config.try_get_typed::<SaturationPolicy>("goroutines.saturation")? {
            goroutine_config.saturation = saturation;
        }
        Ok(goroutine_config)
    }

    /// Sets the prefix used to name goroutine threads.
    pub fn with_thread_name_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Returns the goroutine limit, if any.
    pub fn max_goroutines(&self) -> Option<usize> {
        self.max_goroutines
    }

    /// Returns the saturation policy.
    pub fn saturation(&self) -> SaturationPolicy {
        self.saturation
    }
}

impl Default for GoroutineConfig {
    fn default() -> Self {
        Self::unbounded()
    }
}

struct Slots {
    active: Mutex<usize>,
    freed: Condvar,
}

impl Slots {
    fn lock(&self) -> MutexGuard<'_, usize> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// Held by a running goroutine; frees its slot when the goroutine finishes, even if it panics.
struct SlotGuard {
    slots: Arc<Slots>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut active = self.slots.lock();
        *active -= 1;
        drop(active);
        self.slots.freed.notify_one();
    }
}

/// Spawns goroutines and joins them on shutdown.
pub struct GoroutineManager {
    config: GoroutineConfig,
    context: RuntimeContext,
    slots: Arc<Slots>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicUsize,
}

impl GoroutineManager {
    /// Creates a new `GoroutineManager` with the given configuration.
    pub fn new(config: GoroutineConfig) -> Self {
        Self::with_context(config, RuntimeContext::default())
    }

    /// Creates a new `GoroutineManager` with the given configuration and runtime context.
    ///
    /// The context is consulted for [`Capability::Spawn`] on every spawn.
    pub fn with_context(config: GoroutineConfig, context: RuntimeContext) -> Self {
        Self {
            config,
            context,
            slots: Arc::new(Slots {
                active: Mutex::new(0),
                freed: Condvar::new(),
            }),
            handles: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }

    /// Returns the configuration of this manager.
    pub fn config(&self) -> &GoroutineConfig {
        &self.config
    }

    /// Returns the number of goroutines that are currently running.
    pub fn active_count(&self) -> usize {
        *self.slots.lock()
    }

    /// Spawns `task` on a new goroutine.
    ///
    /// Returns as soon as the goroutine has been scheduled. The task does not return a value; a panic inside the task
    /// is caught and logged when the goroutine is joined.
    ///
    /// # Errors
    ///
    /// If spawning is not permitted, the manager is saturated under [`SaturationPolicy::Reject`], or the operating
    /// system fails to create the thread, an error is returned.
    pub fn spawn<F>(&self, task: F) -> Result<(), SpawnError>
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Relaxed);
        let name = format!("{}-{}", self.config.thread_name_prefix, id);
        self.spawn_named(name, task)
    }

    /// Spawns `task` on a new goroutine whose thread has the given name.
    ///
    /// # Errors
    ///
    /// See [`spawn`][Self::spawn].
    pub fn spawn_named<F>(&self, name: String, task: F) -> Result<(), SpawnError>
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.context.is_permitted(Capability::Spawn) {
            return Err(SpawnError::NotPermitted);
        }

        let slot = self.acquire_slot()?;
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || {
                let _slot = slot;
                task();
            })
            .map_err(|source| SpawnError::FailedToSpawn { source })?;

        let mut handles = self.lock_handles();
        reap_finished(&mut handles);
        handles.push(handle);
        trace!(tracked = handles.len(), "Spawned goroutine.");

        Ok(())
    }

    /// Joins every goroutine spawned so far.
    ///
    /// Goroutines spawned concurrently with this call may or may not be joined.
    pub fn join_all(&self) {
        let handles = std::mem::take(&mut *self.lock_handles());
        if handles.is_empty() {
            return;
        }

        debug!(goroutines = handles.len(), "Joining goroutines.");
        let current = thread::current().id();
        for handle in handles {
            // A goroutine that ends up dropping its own manager cannot join itself.
            if handle.thread().id() == current {
                continue;
            }
            join_goroutine(handle);
        }
    }

    /// Joins every outstanding goroutine and consumes the manager.
    pub fn shutdown(self) {
        self.join_all();
    }

    fn lock_handles(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire_slot(&self) -> Result<SlotGuard, SpawnError> {
        let mut active = self.slots.lock();
        if let Some(limit) = self.config.max_goroutines {
            while *active >= limit {
                match self.config.saturation {
                    SaturationPolicy::Reject => return Err(SpawnError::Saturated { limit }),
                    SaturationPolicy::Block => {
                        active = self.slots.freed.wait(active).unwrap_or_else(PoisonError::into_inner);
                    }
                }
            }
        }
        *active += 1;

        Ok(SlotGuard {
            slots: Arc::clone(&self.slots),
        })
    }
}

impl Default for GoroutineManager {
    fn default() -> Self {
        Self::new(GoroutineConfig::default())
    }
}

impl Drop for GoroutineManager {
    fn drop(&mut self) {
        self.join_all();
    }
}

fn reap_finished(handles: &mut Vec<JoinHandle<()>>) {
    let mut i = 0;
    while i < handles.len() {
        if handles[i].is_finished() {
            join_goroutine(handles.swap_remove(i));
        } else {
            i += 1;
        }
    }
}

fn join_goroutine(handle: JoinHandle<()>) {
    let thread_name = handle.thread().name().unwrap_or("<unnamed>").to_string();
    if let Err(payload) = handle.join() {
        error!(thread_name = %thread_name, "Goroutine panicked: {}", panic_message(payload.as_ref()));
    }
}

/// Extracts a printable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic payload>"
    }
}
