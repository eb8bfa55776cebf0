use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak},
    time::{Duration, Instant},
};

use metrics::counter;
use snafu::{OptionExt as _, ResultExt as _, Snafu};
use strand_error::{generic_error, GenericError};
use tracing::{debug, debug_span, error, info, trace, warn};

use super::{
    deps::{DependencyGraph, EdgeError},
    process::Name,
    restart::{RestartAction, RestartPolicy, RestartState, RestartStrategy},
    shutdown::{ProcessShutdown, ShutdownHandle},
    task::Supervisable,
};
use crate::{
    channel::Channel,
    context::RuntimeContext,
    goroutine::{panic_message, GoroutineConfig, GoroutineManager, SpawnError},
};

// How often a nested supervisor re-checks its parent's shutdown signal.
const NESTED_POLL_INTERVAL: Duration = Duration::from_millis(20);

type InitHook = Box<dyn FnMut() -> Result<(), GenericError> + Send>;
type ChannelCloser = Box<dyn Fn() + Send>;

/// Supervisor errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum SupervisorError {
    /// Supervisor or child name is invalid.
    #[snafu(display("Invalid name for supervisor or child: '{}'", name))]
    InvalidName {
        /// The rejected name.
        name: String,
    },

    /// The supervisor is running and does not accept new children.
    #[snafu(display("Supervisor is running and dynamic children are disabled."))]
    RegistrationClosed,

    /// No child is registered at the given index.
    #[snafu(display("No child registered at index {}.", index))]
    InvalidChild {
        /// The requested index.
        index: usize,
    },

    /// Adding the dependency would create a cycle.
    #[snafu(display("Child {} depending on child {} would create a dependency cycle.", child, depends_on))]
    DependencyCycle {
        /// The dependent child.
        child: usize,

        /// The child it would depend on.
        depends_on: usize,
    },

    /// The supervisor has already been started.
    #[snafu(display("Supervisor is already running."))]
    AlreadyStarted,

    /// The supervisor is not running.
    #[snafu(display("Supervisor is not running."))]
    NotRunning,

    /// The initialization hook failed.
    #[snafu(display("Supervisor failed to initialize: {}", source))]
    FailedToInitialize {
        /// The error returned by the hook.
        source: GenericError,
    },

    /// A child thread could not be spawned.
    #[snafu(display("Failed to spawn child '{}': {}", child_name, source))]
    FailedToSpawn {
        /// Name of the child.
        child_name: String,

        /// The underlying spawn error.
        source: SpawnError,
    },
}

/// Lifecycle state of a supervisor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupervisorStatus {
    /// Children can be registered; nothing is running yet.
    Created,

    /// Children are running and failures are being handled.
    Running,

    /// The restart budget was exhausted at least once. Children that were not affected keep running.
    Degraded,

    /// Every child has been signalled to shut down.
    Stopped,
}

impl fmt::Display for SupervisorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Degraded => write!(f, "degraded"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Lifecycle state of a single child.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildState {
    /// Registered but never started.
    Idle,

    /// Running.
    Running,

    /// Returned `Ok(())` on its own. Completed children are not restarted.
    Completed,

    /// Failed and was not restarted.
    Failed,

    /// Signalled to shut down when the supervisor stopped.
    Stopped,
}

/// A point-in-time view of a child.
#[derive(Clone, Debug)]
pub struct ChildInfo {
    /// Registration index.
    pub index: usize,

    /// Scoped process name.
    pub name: String,

    /// Current state.
    pub state: ChildState,

    /// Whether the most recent instance failed.
    pub failed: bool,

    /// Execution instance counter, bumped on every start.
    pub generation: u64,

    /// Number of times the child has been restarted.
    pub restarts: usize,
}

/// Notable supervisor events.
///
/// Delivered on the channel given to [`Supervisor::with_events`]. Events are sent without blocking; they are dropped
/// when the channel is full or closed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// A child was started by [`Supervisor::start`] or dynamic registration.
    ChildStarted {
        /// Child index.
        child: usize,

        /// Child name.
        name: String,

        /// Execution instance.
        generation: u64,
    },

    /// A child failed.
    ChildFailed {
        /// Child index.
        child: usize,

        /// Child name.
        name: String,

        /// Rendered failure.
        error: String,
    },

    /// A child was restarted.
    ChildRestarted {
        /// Child index.
        child: usize,

        /// Child name.
        name: String,

        /// Execution instance.
        generation: u64,
    },

    /// A failure exceeded the restart budget. The failed child was left stopped.
    RestartLimitExceeded {
        /// Child index.
        child: usize,

        /// Child name.
        name: String,
    },

    /// The supervisor stopped and joined all of its children.
    Stopped,
}

struct Child {
    name: Name,
    task: Arc<dyn Supervisable>,
    state: ChildState,
    failed: bool,
    generation: u64,
    restarts: usize,
    shutdown: Option<ShutdownHandle>,
}

impl Child {
    fn info(&self, index: usize) -> ChildInfo {
        ChildInfo {
            index,
            name: self.name.to_string(),
            state: self.state,
            failed: self.failed,
            generation: self.generation,
            restarts: self.restarts,
        }
    }
}

struct State {
    status: SupervisorStatus,
    context: RuntimeContext,
    restart: RestartState,
    dynamic_children: bool,
    escalate_on_exhaustion: bool,
    init: Option<InitHook>,
    events: Option<Channel<SupervisorEvent>>,
    channel_closers: Vec<ChannelCloser>,
    children: Vec<Child>,
    deps: DependencyGraph,

    // Declared last: children must be signalled, by dropping their shutdown handles, before they are joined.
    goroutines: Arc<GoroutineManager>,
}

impl State {
    fn emit(&self, event: SupervisorEvent) {
        if let Some(events) = &self.events {
            if let Err(e) = events.try_send(event) {
                trace!(error = %e, "Dropped supervisor event.");
            }
        }
    }
}

struct Inner {
    id: Name,
    state: Mutex<State>,
    status_changed: Condvar,
}

impl Inner {
    // State is only mutated through methods that leave it consistent, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Supervises a set of children, restarting them when they fail.
///
/// # Children
///
/// A child is anything that implements [`Supervisable`], including closures wrapped in
/// [`TaskFn`][super::TaskFn] and other supervisors, which is how supervision trees are built. Every child runs on its
/// own named thread and is identified by its registration index, which never changes.
///
/// # Failures
///
/// A child that returns an error or panics is marked failed and handled according to the [`RestartStrategy`]. When the
/// restart budget is exhausted, the failed child is left stopped, the failure is logged, and the supervisor is marked
/// [`Degraded`][SupervisorStatus::Degraded]. Nothing else happens unless escalation was enabled with
/// [`with_escalation`][Self::with_escalation].
///
/// Restarts signal the previous instance of a child to shut down and start the new instance right away, without
/// waiting for the previous one to exit. Reports from previous instances are ignored.
///
/// # Handles
///
/// `Supervisor` is a handle: clones refer to the same supervisor. Children hold no strong reference to it, so dropping
/// every handle signals all children to shut down and joins them.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    /// Creates an empty `Supervisor` with the default restart strategy.
    ///
    /// # Errors
    ///
    /// If `supervisor_id` contains no alphanumeric characters, an error is returned.
    pub fn new<S: AsRef<str>>(supervisor_id: S) -> Result<Self, SupervisorError> {
        let supervisor_id = supervisor_id.as_ref();
        let id = Name::root(supervisor_id).context(InvalidName { name: supervisor_id })?;
        let context = RuntimeContext::default();

        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    status: SupervisorStatus::Created,
                    restart: RestartState::new(RestartStrategy::default()),
                    dynamic_children: false,
                    escalate_on_exhaustion: false,
                    init: None,
                    events: None,
                    channel_closers: Vec::new(),
                    children: Vec::new(),
                    deps: DependencyGraph::default(),
                    goroutines: Arc::new(child_goroutines(&id, context.clone())),
                    context,
                }),
                id,
                status_changed: Condvar::new(),
            }),
        })
    }

    /// Sets the restart strategy.
    ///
    /// The remaining settings are meant to be applied before the supervisor is started.
    pub fn with_restart_strategy(self, strategy: RestartStrategy) -> Self {
        self.inner.lock().restart = RestartState::new(strategy);
        self
    }

    /// Sets the runtime context, which provides the clock for the restart window and the capability checker consulted
    /// before spawning children.
    pub fn with_context(self, context: RuntimeContext) -> Self {
        {
            let mut state = self.inner.lock();
            state.goroutines = Arc::new(child_goroutines(&self.inner.id, context.clone()));
            state.context = context;
        }
        self
    }

    /// Allows children to be registered while the supervisor is running. They are started immediately.
    pub fn with_dynamic_children(self, enabled: bool) -> Self {
        self.inner.lock().dynamic_children = enabled;
        self
    }

    /// Makes this supervisor fail when its restart budget is exhausted while it runs as the child of another
    /// supervisor, so that the parent's restart strategy applies.
    ///
    /// Disabled by default.
    pub fn with_escalation(self, enabled: bool) -> Self {
        self.inner.lock().escalate_on_exhaustion = enabled;
        self
    }

    /// Sets a hook that runs at the beginning of every [`start`][Self::start].
    ///
    /// The hook runs while the supervisor is locked, so it must not call back into the supervisor.
    pub fn with_init<F>(self, init: F) -> Self
    where
        F: FnMut() -> Result<(), GenericError> + Send + 'static,
    {
        self.inner.lock().init = Some(Box::new(init));
        self
    }

    /// Sends [`SupervisorEvent`]s to the given channel.
    pub fn with_events(self, events: Channel<SupervisorEvent>) -> Self {
        self.inner.lock().events = Some(events);
        self
    }

    /// Returns the supervisor's ID.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Returns the current status.
    pub fn status(&self) -> SupervisorStatus {
        self.inner.lock().status
    }

    /// Returns the restart strategy.
    pub fn restart_strategy(&self) -> RestartStrategy {
        *self.inner.lock().restart.strategy()
    }

    /// Returns the number of restarts counted in the current restart window.
    pub fn restart_count(&self) -> usize {
        self.inner.lock().restart.restart_count()
    }

    /// Returns the number of registered children.
    pub fn child_count(&self) -> usize {
        self.inner.lock().children.len()
    }

    /// Returns a view of the child at `index`.
    pub fn child(&self, index: usize) -> Option<ChildInfo> {
        self.inner.lock().children.get(index).map(|child| child.info(index))
    }

    /// Registers a child, returning its index.
    ///
    /// # Errors
    ///
    /// If the child's name is invalid, or the supervisor is running without dynamic children enabled, an error is
    /// returned. If a dynamic child cannot be spawned, an error is returned and the child stays registered but idle.
    pub fn register<T>(&self, task: T) -> Result<usize, SupervisorError>
    where
        T: Supervisable + 'static,
    {
        self.register_arc(Arc::new(task))
    }

    /// Registers a shared child, returning its index.
    ///
    /// # Errors
    ///
    /// See [`register`][Self::register].
    pub fn register_arc(&self, task: Arc<dyn Supervisable>) -> Result<usize, SupervisorError> {
        let name = Name::scoped(&self.inner.id, task.name()).context(InvalidName { name: task.name() })?;

        let mut state = self.inner.lock();
        let start_now = match state.status {
            SupervisorStatus::Created | SupervisorStatus::Stopped => false,
            SupervisorStatus::Running | SupervisorStatus::Degraded if state.dynamic_children => true,
            SupervisorStatus::Running | SupervisorStatus::Degraded => return Err(SupervisorError::RegistrationClosed),
        };

        let index = state.children.len();
        debug!(supervisor_id = %self.inner.id, child = index, child_name = %name, "Registering child.");
        state.children.push(Child {
            name,
            task,
            state: ChildState::Idle,
            failed: false,
            generation: 0,
            restarts: 0,
            shutdown: None,
        });
        state.deps.add_node();

        if start_now {
            self.spawn_child(&mut state, index)?;
            emit_started(&state, index);
        }

        Ok(index)
    }

    /// Records that `child` depends on `depends_on`, so that a restart of `depends_on` under
    /// [`RestForOne`][RestartPolicy::RestForOne] also restarts `child`.
    ///
    /// Once any dependency has been added, only explicit dependencies are used. Until then, every child depends on the
    /// child registered right before it.
    ///
    /// # Errors
    ///
    /// If either index is out of bounds, or the dependency would create a cycle, an error is returned.
    pub fn add_dependency(&self, child: usize, depends_on: usize) -> Result<(), SupervisorError> {
        let mut state = self.inner.lock();
        match state.deps.add_edge(child, depends_on) {
            Ok(()) => Ok(()),
            Err(EdgeError::OutOfBounds) => Err(SupervisorError::InvalidChild {
                index: child.max(depends_on),
            }),
            Err(EdgeError::Cycle) => Err(SupervisorError::DependencyCycle { child, depends_on }),
        }
    }

    /// Closes `channel` when the supervisor stops.
    pub fn supervise_channel<T>(&self, channel: Channel<T>)
    where
        T: Send + 'static,
    {
        self.inner.lock().channel_closers.push(Box::new(move || channel.close()));
    }

    /// Runs the init hook, if any, and starts every registered child.
    ///
    /// A stopped supervisor can be started again, with a fresh restart budget.
    ///
    /// # Errors
    ///
    /// If the supervisor is already running, the init hook fails, or a child cannot be spawned, an error is returned.
    /// On a spawn failure, children that were already started are signalled to shut down.
    pub fn start(&self) -> Result<(), SupervisorError> {
        let mut state = self.inner.lock();
        if matches!(state.status, SupervisorStatus::Running | SupervisorStatus::Degraded) {
            return Err(SupervisorError::AlreadyStarted);
        }

        if let Some(init) = state.init.as_mut() {
            init().context(FailedToInitialize)?;
        }

        state.restart.reset();
        for child in &mut state.children {
            child.state = ChildState::Idle;
            child.failed = false;
        }
        state.status = SupervisorStatus::Running;

        for index in 0..state.children.len() {
            if let Err(e) = self.spawn_child(&mut state, index) {
                error!(supervisor_id = %self.inner.id, child = index, error = %e, "Failed to start child.");
                for child in &mut state.children {
                    child.shutdown = None;
                    child.state = ChildState::Idle;
                }
                state.status = SupervisorStatus::Stopped;
                self.inner.status_changed.notify_all();
                return Err(e);
            }
            emit_started(&state, index);
        }

        info!(
            supervisor_id = %self.inner.id,
            children = state.children.len(),
            policy = %state.restart.strategy().policy(),
            "Supervisor started."
        );
        self.inner.status_changed.notify_all();
        Ok(())
    }

    /// Restarts the child at `index`, regardless of the restart strategy and without counting against the restart
    /// budget.
    ///
    /// # Errors
    ///
    /// If the supervisor is not running, the index is out of bounds, or the child cannot be spawned, an error is
    /// returned.
    pub fn restart_child(&self, index: usize) -> Result<(), SupervisorError> {
        let mut state = self.inner.lock();
        ensure_running(&state)?;
        if index >= state.children.len() {
            return Err(SupervisorError::InvalidChild { index });
        }

        self.restart_locked(&mut state, index)
    }

    /// Reports a failure of the child at `index`, as if it had returned `error`.
    ///
    /// The child's current instance is signalled to shut down before the restart strategy is applied.
    ///
    /// # Errors
    ///
    /// If the supervisor is not running, or the index is out of bounds, an error is returned.
    pub fn report_failure(&self, index: usize, error: GenericError) -> Result<(), SupervisorError> {
        let mut state = self.inner.lock();
        ensure_running(&state)?;
        if index >= state.children.len() {
            return Err(SupervisorError::InvalidChild { index });
        }

        self.handle_failure(&mut state, index, error);
        Ok(())
    }

    /// Signals every child to shut down, joins their threads, and closes supervised channels.
    ///
    /// Children are expected to honor their [`ProcessShutdown`]: this blocks until every child has returned. Stopping a
    /// stopped supervisor does nothing.
    ///
    /// # Errors
    ///
    /// If the supervisor was never started, an error is returned.
    pub fn stop(&self) -> Result<(), SupervisorError> {
        let (goroutines, channel_closers) = {
            let mut state = self.inner.lock();
            match state.status {
                SupervisorStatus::Created => return Err(SupervisorError::NotRunning),
                SupervisorStatus::Stopped => return Ok(()),
                SupervisorStatus::Running | SupervisorStatus::Degraded => {}
            }

            debug!(supervisor_id = %self.inner.id, "Stopping all children.");
            state.status = SupervisorStatus::Stopped;
            for child in &mut state.children {
                child.shutdown = None;
                if child.state == ChildState::Running {
                    child.state = ChildState::Stopped;
                }
            }
            self.inner.status_changed.notify_all();

            (
                Arc::clone(&state.goroutines),
                std::mem::take(&mut state.channel_closers),
            )
        };

        // Children report their exit through the lock, so they are joined without holding it.
        goroutines.join_all();
        for close in channel_closers {
            close();
        }

        self.inner.lock().emit(SupervisorEvent::Stopped);
        info!(supervisor_id = %self.inner.id, "Supervisor stopped.");
        Ok(())
    }

    /// Blocks until the supervisor reaches `status` or `timeout` elapses.
    ///
    /// Returns `true` if the status was reached. A timeout too large to represent waits without a deadline.
    pub fn wait_for_status(&self, status: SupervisorStatus, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.inner.lock();
        while state.status != status {
            let Some(deadline) = deadline else {
                state = self
                    .inner
                    .status_changed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
                continue;
            };
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .inner
                .status_changed
                .wait_timeout(state, deadline - now)
                .map(|(state, _)| state)
                .unwrap_or_else(|e| e.into_inner().0);
        }
        true
    }

    fn spawn_child(&self, state: &mut State, index: usize) -> Result<(), SupervisorError> {
        let goroutines = Arc::clone(&state.goroutines);
        let child = &mut state.children[index];
        child.generation += 1;

        let (process_shutdown, shutdown_handle) = ProcessShutdown::paired();
        let supervisor = Arc::downgrade(&self.inner);
        let generation = child.generation;
        let name = child.name.clone();
        let task = Arc::clone(&child.task);

        debug!(supervisor_id = %self.inner.id, child = index, generation, "Spawning child.");
        goroutines
            .spawn_named(child.name.to_string(), move || {
                run_child(supervisor, index, generation, name, task, process_shutdown)
            })
            .context(FailedToSpawn {
                child_name: child.name.to_string(),
            })?;

        // Replacing the handle signals the previous instance, if any.
        child.shutdown = Some(shutdown_handle);
        child.state = ChildState::Running;
        child.failed = false;
        Ok(())
    }

    fn restart_locked(&self, state: &mut State, index: usize) -> Result<(), SupervisorError> {
        self.spawn_child(state, index)?;

        let child = &mut state.children[index];
        child.restarts += 1;
        let event = SupervisorEvent::ChildRestarted {
            child: index,
            name: child.name.to_string(),
            generation: child.generation,
        };
        info!(
            supervisor_id = %self.inner.id,
            child = index,
            child_name = %child.name,
            generation = child.generation,
            "Child restarted."
        );
        counter!("strand_supervisor_restarts_total", "supervisor_id" => self.inner.id.to_string()).increment(1);
        state.emit(event);
        Ok(())
    }

    fn handle_failure(&self, state: &mut State, index: usize, error: GenericError) {
        let child = &mut state.children[index];
        child.failed = true;
        child.state = ChildState::Failed;
        child.shutdown = None;
        let child_name = child.name.to_string();

        warn!(supervisor_id = %self.inner.id, child = index, child_name = %child_name, error = %error, "Child failed.");
        counter!("strand_supervisor_child_failures_total", "supervisor_id" => self.inner.id.to_string()).increment(1);
        state.emit(SupervisorEvent::ChildFailed {
            child: index,
            name: child_name.clone(),
            error: format!("{:#}", error),
        });

        let now = state.context.clock().now();
        match state.restart.evaluate_restart(now) {
            RestartAction::Exhausted => {
                let strategy = *state.restart.strategy();
                error!(
                    supervisor_id = %self.inner.id,
                    child = index,
                    child_name = %child_name,
                    max_restarts = strategy.max_restarts(),
                    time_window = ?strategy.time_window(),
                    "Restart limit exceeded. Leaving child stopped."
                );
                state.status = SupervisorStatus::Degraded;
                state.emit(SupervisorEvent::RestartLimitExceeded {
                    child: index,
                    name: child_name,
                });
                self.inner.status_changed.notify_all();
            }
            RestartAction::Restart(policy) => {
                let targets = match policy {
                    RestartPolicy::OneForOne => vec![index],
                    RestartPolicy::OneForAll => (0..state.children.len()).collect(),
                    RestartPolicy::RestForOne => state.deps.cascade(index),
                };
                debug!(supervisor_id = %self.inner.id, %policy, ?targets, "Restarting children.");

                for target in targets {
                    if let Err(e) = self.restart_locked(state, target) {
                        error!(supervisor_id = %self.inner.id, child = target, error = %e, "Failed to restart child.");
                        let child = &mut state.children[target];
                        child.failed = true;
                        child.state = ChildState::Failed;
                        state.status = SupervisorStatus::Degraded;
                        self.inner.status_changed.notify_all();
                    }
                }
            }
        }
    }

    fn child_exited(&self, index: usize, generation: u64, result: Result<(), GenericError>) {
        let mut state = self.inner.lock();
        if !matches!(state.status, SupervisorStatus::Running | SupervisorStatus::Degraded) {
            return;
        }

        let Some(child) = state.children.get_mut(index) else {
            return;
        };
        if child.generation != generation || child.state != ChildState::Running {
            debug!(supervisor_id = %self.inner.id, child = index, generation, "Ignoring exit of superseded instance.");
            return;
        }

        match result {
            Ok(()) => {
                debug!(supervisor_id = %self.inner.id, child = index, "Child completed.");
                child.state = ChildState::Completed;
                child.shutdown = None;
            }
            Err(e) => self.handle_failure(&mut state, index, e),
        }
    }

    // A previous instance of this supervisor may still be stopping after the parent restarted it.
    fn wait_while_active(&self, process_shutdown: &ProcessShutdown) {
        let mut state = self.inner.lock();
        while matches!(state.status, SupervisorStatus::Running | SupervisorStatus::Degraded)
            && !process_shutdown.is_shutdown()
        {
            state = self
                .inner
                .status_changed
                .wait_timeout(state, NESTED_POLL_INTERVAL)
                .map(|(state, _)| state)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }
}

impl Supervisable for Supervisor {
    fn name(&self) -> &str {
        self.inner.id.leaf()
    }

    fn run(&self, process_shutdown: ProcessShutdown) -> Result<(), GenericError> {
        self.wait_while_active(&process_shutdown);
        if process_shutdown.is_shutdown() {
            return Ok(());
        }

        self.start()?;
        debug!(supervisor_id = %self.inner.id, "Nested supervisor started.");

        let escalated = loop {
            if process_shutdown.is_shutdown() {
                break false;
            }

            let state = self.inner.lock();
            if state.escalate_on_exhaustion && state.status == SupervisorStatus::Degraded {
                break true;
            }
            drop(self.inner.status_changed.wait_timeout(state, NESTED_POLL_INTERVAL));
        };

        self.stop()?;
        if escalated {
            return Err(generic_error!(
                "Supervisor '{}' exhausted its restart budget.",
                self.inner.id
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("Supervisor")
            .field("id", &&*self.inner.id)
            .field("status", &state.status)
            .field("children", &state.children.len())
            .finish()
    }
}

/// Creates a one-for-one supervisor with `size` workers produced by `factory`.
///
/// `factory` is called with each worker's index.
///
/// # Errors
///
/// If the supervisor ID or a worker name is invalid, an error is returned.
pub fn worker_pool<T, F>(id: &str, size: usize, mut factory: F) -> Result<Supervisor, SupervisorError>
where
    T: Supervisable + 'static,
    F: FnMut(usize) -> T,
{
    let supervisor = Supervisor::new(id)?.with_restart_strategy(RestartStrategy::one_for_one());
    for index in 0..size {
        supervisor.register(factory(index))?;
    }
    Ok(supervisor)
}

/// Creates a supervisor whose children are other supervisors.
///
/// # Errors
///
/// If the supervisor ID is invalid, an error is returned.
pub fn supervision_tree<I>(id: &str, strategy: RestartStrategy, subtrees: I) -> Result<Supervisor, SupervisorError>
where
    I: IntoIterator<Item = Supervisor>,
{
    let supervisor = Supervisor::new(id)?.with_restart_strategy(strategy);
    for subtree in subtrees {
        supervisor.register(subtree)?;
    }
    Ok(supervisor)
}

/// Creates a supervisor for `workers` that closes `channels` when it stops.
///
/// # Errors
///
/// If the supervisor ID or a worker name is invalid, an error is returned.
pub fn supervised_channels<T, W, C, I>(
    id: &str, strategy: RestartStrategy, channels: C, workers: I,
) -> Result<Supervisor, SupervisorError>
where
    T: Send + 'static,
    W: Supervisable + 'static,
    C: IntoIterator<Item = Channel<T>>,
    I: IntoIterator<Item = W>,
{
    let supervisor = Supervisor::new(id)?.with_restart_strategy(strategy);
    for channel in channels {
        supervisor.supervise_channel(channel);
    }
    for worker in workers {
        supervisor.register(worker)?;
    }
    Ok(supervisor)
}

fn child_goroutines(id: &Name, context: RuntimeContext) -> GoroutineManager {
    // Children are never refused a thread: a bounded pool could block a restart while the supervisor is locked.
    GoroutineManager::with_context(GoroutineConfig::unbounded().with_thread_name_prefix(id.to_string()), context)
}

fn ensure_running(state: &State) -> Result<(), SupervisorError> {
    match state.status {
        SupervisorStatus::Running | SupervisorStatus::Degraded => Ok(()),
        SupervisorStatus::Created | SupervisorStatus::Stopped => Err(SupervisorError::NotRunning),
    }
}

fn emit_started(state: &State, index: usize) {
    let child = &state.children[index];
    state.emit(SupervisorEvent::ChildStarted {
        child: index,
        name: child.name.to_string(),
        generation: child.generation,
    });
}

fn run_child(
    supervisor: Weak<Inner>, index: usize, generation: u64, name: Name, task: Arc<dyn Supervisable>,
    process_shutdown: ProcessShutdown,
) {
    let span = debug_span!("process", process_name = %name, generation);
    let _entered = span.enter();

    let result = match panic::catch_unwind(AssertUnwindSafe(|| task.run(process_shutdown))) {
        Ok(result) => result,
        Err(payload) => Err(generic_error!("Child panicked: {}", panic_message(payload.as_ref()))),
    };

    if let Some(inner) = supervisor.upgrade() {
        Supervisor { inner }.child_exited(index, generation, result);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use quanta::Clock;

    use super::*;
    use crate::runtime::TaskFn;

    const WAIT: Duration = Duration::from_secs(5);

    fn events() -> Channel<SupervisorEvent> {
        Channel::bounded(256).unwrap()
    }

    /// A child that fails on its first `failures` runs and then runs until shutdown.
    fn flaky(name: &'static str, failures: usize, starts: Arc<AtomicUsize>) -> impl Supervisable {
        TaskFn::new(name, move |shutdown: ProcessShutdown| {
            let run = starts.fetch_add(1, Ordering::SeqCst) + 1;
            if run <= failures {
                return Err(generic_error!("{} failed on run {}", name, run));
            }
            shutdown.wait_for_shutdown();
            Ok(())
        })
    }

    fn steady(name: &'static str, starts: Arc<AtomicUsize>) -> impl Supervisable {
        flaky(name, 0, starts)
    }

    fn counters<const N: usize>() -> [Arc<AtomicUsize>; N] {
        std::array::from_fn(|_| Arc::new(AtomicUsize::new(0)))
    }

    fn wait_for_event<F>(events: &Channel<SupervisorEvent>, mut predicate: F) -> SupervisorEvent
    where
        F: FnMut(&SupervisorEvent) -> bool,
    {
        loop {
            let event = events.receive_timeout(WAIT).expect("timed out waiting for supervisor event");
            if predicate(&event) {
                return event;
            }
        }
    }

    fn restarted_children(events: &Channel<SupervisorEvent>, count: usize) -> Vec<usize> {
        (0..count)
            .map(|_| match wait_for_event(events, |e| matches!(e, SupervisorEvent::ChildRestarted { .. })) {
                SupervisorEvent::ChildRestarted { child, .. } => child,
                _ => unreachable!(),
            })
            .collect()
    }

    fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn invalid_supervisor_name() {
        assert!(matches!(
            Supervisor::new("--"),
            Err(SupervisorError::InvalidName { .. })
        ));
    }

    #[test]
    fn one_for_one_restarts_only_the_failed_child() {
        let events = events();
        let [a, b, c] = counters::<3>();
        let sup = Supervisor::new("one_for_one")
            .unwrap()
            .with_restart_strategy(RestartStrategy::one_for_one())
            .with_events(events.clone());
        sup.register(steady("a", Arc::clone(&a))).unwrap();
        sup.register(flaky("b", 1, Arc::clone(&b))).unwrap();
        sup.register(steady("c", Arc::clone(&c))).unwrap();
        sup.start().unwrap();
        assert!(sup.wait_for_status(SupervisorStatus::Running, Duration::MAX));

        assert_eq!(restarted_children(&events, 1), vec![1]);
        assert!(wait_until(|| b.load(Ordering::SeqCst) == 2));
        assert_eq!(sup.child(1).unwrap().restarts, 1);
        assert!(!sup.child(1).unwrap().failed);
        for (index, starts) in [(0, &a), (2, &c)] {
            let child = sup.child(index).unwrap();
            assert!(!child.failed);
            assert_eq!(child.restarts, 0);
            assert_eq!(child.generation, 1);
            assert_eq!(child.state, ChildState::Running);
            assert_eq!(starts.load(Ordering::SeqCst), 1);
        }
        assert_eq!(sup.status(), SupervisorStatus::Running);

        sup.stop().unwrap();
        assert!(sup.wait_for_status(SupervisorStatus::Stopped, Duration::MAX));
        assert_eq!(sup.child(0).unwrap().state, ChildState::Stopped);
        assert_eq!(sup.child(2).unwrap().state, ChildState::Stopped);
    }

    #[test]
    fn one_for_all_restarts_every_child() {
        let events = events();
        let [a, b, c] = counters::<3>();
        let sup = Supervisor::new("one_for_all")
            .unwrap()
            .with_restart_strategy(RestartStrategy::one_for_all())
            .with_events(events.clone());
        sup.register(steady("a", Arc::clone(&a))).unwrap();
        sup.register(flaky("b", 1, Arc::clone(&b))).unwrap();
        sup.register(steady("c", Arc::clone(&c))).unwrap();
        sup.start().unwrap();

        assert_eq!(restarted_children(&events, 3), vec![0, 1, 2]);
        assert!(wait_until(|| [&a, &b, &c].iter().all(|n| n.load(Ordering::SeqCst) == 2)));
        sup.stop().unwrap();
    }

    #[test]
    fn rest_for_one_cascades_in_registration_order() {
        let events = events();
        let [a, b, c] = counters::<3>();
        let sup = Supervisor::new("rest_for_one")
            .unwrap()
            .with_restart_strategy(RestartStrategy::rest_for_one())
            .with_events(events.clone());
        sup.register(flaky("a", 1, Arc::clone(&a))).unwrap();
        sup.register(steady("b", Arc::clone(&b))).unwrap();
        sup.register(steady("c", Arc::clone(&c))).unwrap();
        sup.start().unwrap();

        assert_eq!(restarted_children(&events, 3), vec![0, 1, 2]);
        sup.stop().unwrap();
    }

    #[test]
    fn rest_for_one_leaves_earlier_children_alone() {
        let events = events();
        let [a, b, c] = counters::<3>();
        let sup = Supervisor::new("rest_for_one_mid")
            .unwrap()
            .with_restart_strategy(RestartStrategy::rest_for_one())
            .with_events(events.clone());
        sup.register(steady("a", Arc::clone(&a))).unwrap();
        sup.register(flaky("b", 1, Arc::clone(&b))).unwrap();
        sup.register(steady("c", Arc::clone(&c))).unwrap();
        sup.start().unwrap();

        assert_eq!(restarted_children(&events, 2), vec![1, 2]);
        assert!(wait_until(|| c.load(Ordering::SeqCst) == 2));
        assert_eq!(a.load(Ordering::SeqCst), 1);
        sup.stop().unwrap();
    }

    #[test]
    fn rest_for_one_follows_explicit_dependencies() {
        let events = events();
        let [a, b, c] = counters::<3>();
        let sup = Supervisor::new("explicit_deps")
            .unwrap()
            .with_restart_strategy(RestartStrategy::rest_for_one())
            .with_events(events.clone());
        sup.register(flaky("a", 1, Arc::clone(&a))).unwrap();
        sup.register(steady("b", Arc::clone(&b))).unwrap();
        sup.register(steady("c", Arc::clone(&c))).unwrap();
        sup.add_dependency(2, 0).unwrap();
        sup.start().unwrap();

        assert_eq!(restarted_children(&events, 2), vec![0, 2]);
        assert_eq!(b.load(Ordering::SeqCst), 1);
        sup.stop().unwrap();
    }

    #[test]
    fn dependency_validation() {
        let sup = Supervisor::new("deps").unwrap();
        let [a, b] = counters::<2>();
        sup.register(steady("a", a)).unwrap();
        sup.register(steady("b", b)).unwrap();

        sup.add_dependency(1, 0).unwrap();
        assert!(matches!(
            sup.add_dependency(0, 1),
            Err(SupervisorError::DependencyCycle { child: 0, depends_on: 1 })
        ));
        assert!(matches!(
            sup.add_dependency(0, 5),
            Err(SupervisorError::InvalidChild { index: 5 })
        ));
    }

    #[test]
    fn restart_budget_is_enforced() {
        let events = events();
        let [starts] = counters::<1>();
        let sup = Supervisor::new("budget")
            .unwrap()
            .with_restart_strategy(RestartStrategy::one_for_one().with_budget(2, Duration::from_secs(60)))
            .with_events(events.clone());
        sup.register(flaky("always", usize::MAX, Arc::clone(&starts))).unwrap();
        sup.start().unwrap();

        assert!(sup.wait_for_status(SupervisorStatus::Degraded, WAIT));
        wait_for_event(&events, |e| matches!(e, SupervisorEvent::RestartLimitExceeded { child: 0, .. }));

        let child = sup.child(0).unwrap();
        assert!(child.failed);
        assert_eq!(child.state, ChildState::Failed);
        assert_eq!(child.restarts, 2);
        assert_eq!(starts.load(Ordering::SeqCst), 3);

        sup.stop().unwrap();
        assert_eq!(sup.status(), SupervisorStatus::Stopped);
    }

    #[test]
    fn restart_window_resets_with_time() {
        let (clock, mock) = Clock::mock();
        let [starts] = counters::<1>();
        let sup = Supervisor::new("window")
            .unwrap()
            .with_context(RuntimeContext::default().with_clock(clock))
            .with_restart_strategy(RestartStrategy::one_for_one().with_budget(1, Duration::from_secs(5)));
        sup.register(steady("worker", Arc::clone(&starts))).unwrap();
        sup.start().unwrap();

        sup.report_failure(0, generic_error!("first")).unwrap();
        assert_eq!(sup.child(0).unwrap().restarts, 1);

        mock.increment(Duration::from_secs(6));
        sup.report_failure(0, generic_error!("second")).unwrap();
        assert_eq!(sup.child(0).unwrap().restarts, 2);
        assert_eq!(sup.status(), SupervisorStatus::Running);

        mock.increment(Duration::from_secs(1));
        sup.report_failure(0, generic_error!("third")).unwrap();
        assert_eq!(sup.status(), SupervisorStatus::Degraded);
        assert!(sup.child(0).unwrap().failed);

        sup.stop().unwrap();
    }

    #[test]
    fn completed_child_is_not_restarted() {
        let sup = Supervisor::new("completes").unwrap();
        sup.register(TaskFn::new("once", |_: ProcessShutdown| Ok(()))).unwrap();
        sup.start().unwrap();

        assert!(wait_until(|| sup.child(0).unwrap().state == ChildState::Completed));
        assert_eq!(sup.child(0).unwrap().restarts, 0);
        assert_eq!(sup.restart_count(), 0);
        sup.stop().unwrap();
    }

    #[test]
    fn panicking_child_is_restarted() {
        let events = events();
        let [starts] = counters::<1>();
        let sup = Supervisor::new("panics").unwrap().with_events(events.clone());
        let task_starts = Arc::clone(&starts);
        sup.register(TaskFn::new("panicky", move |shutdown: ProcessShutdown| {
            if task_starts.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first run panics");
            }
            shutdown.wait_for_shutdown();
            Ok(())
        }))
        .unwrap();
        sup.start().unwrap();

        match wait_for_event(&events, |e| matches!(e, SupervisorEvent::ChildFailed { .. })) {
            SupervisorEvent::ChildFailed { error, .. } => assert!(error.contains("first run panics"), "{}", error),
            _ => unreachable!(),
        }
        assert_eq!(restarted_children(&events, 1), vec![0]);
        sup.stop().unwrap();
    }

    #[test]
    fn registration_after_start() {
        let [a, b] = counters::<2>();
        let fixed = Supervisor::new("fixed").unwrap();
        fixed.register(steady("a", Arc::clone(&a))).unwrap();
        fixed.start().unwrap();
        assert!(matches!(
            fixed.register(steady("b", Arc::clone(&b))),
            Err(SupervisorError::RegistrationClosed)
        ));
        fixed.stop().unwrap();

        let dynamic = Supervisor::new("dynamic").unwrap().with_dynamic_children(true);
        dynamic.start().unwrap();
        assert_eq!(dynamic.register(steady("b", Arc::clone(&b))).unwrap(), 0);
        assert!(wait_until(|| b.load(Ordering::SeqCst) == 1));
        assert_eq!(dynamic.child(0).unwrap().state, ChildState::Running);
        dynamic.stop().unwrap();
    }

    #[test]
    fn lifecycle_errors() {
        let sup = Supervisor::new("lifecycle").unwrap();
        assert!(matches!(sup.stop(), Err(SupervisorError::NotRunning)));
        assert!(matches!(sup.restart_child(0), Err(SupervisorError::NotRunning)));

        sup.start().unwrap();
        assert!(matches!(sup.start(), Err(SupervisorError::AlreadyStarted)));
        assert!(matches!(sup.restart_child(3), Err(SupervisorError::InvalidChild { index: 3 })));

        sup.stop().unwrap();
        sup.stop().unwrap();
    }

    #[test]
    fn init_hook_failure_prevents_start() {
        let [starts] = counters::<1>();
        let sup = Supervisor::new("init").unwrap().with_init(|| Err(generic_error!("not ready")));
        sup.register(steady("a", Arc::clone(&starts))).unwrap();

        assert!(matches!(sup.start(), Err(SupervisorError::FailedToInitialize { .. })));
        assert_eq!(sup.status(), SupervisorStatus::Created);
        assert_eq!(starts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn manual_restart_does_not_count_against_budget() {
        let [starts] = counters::<1>();
        let sup = Supervisor::new("manual").unwrap();
        sup.register(steady("a", Arc::clone(&starts))).unwrap();
        sup.start().unwrap();

        sup.restart_child(0).unwrap();
        assert!(wait_until(|| starts.load(Ordering::SeqCst) == 2));
        assert_eq!(sup.child(0).unwrap().generation, 2);
        assert_eq!(sup.restart_count(), 0);
        sup.stop().unwrap();
    }

    #[test]
    fn stop_closes_supervised_channels() {
        let events = events();
        let inbox = Channel::<u32>::bounded(4).unwrap();
        let received = Arc::new(AtomicUsize::new(0));

        let consumer = {
            let inbox = inbox.clone();
            let received = Arc::clone(&received);
            TaskFn::new("consumer", move |shutdown: ProcessShutdown| {
                while inbox.receive_until(shutdown.token()).is_ok() {
                    received.fetch_add(1, Ordering::SeqCst);
                }
                Ok(())
            })
        };

        let sup = supervised_channels("channels", RestartStrategy::default(), [inbox.clone()], [consumer])
            .unwrap()
            .with_events(events.clone());
        sup.start().unwrap();

        inbox.send(1).unwrap();
        inbox.send(2).unwrap();
        assert!(wait_until(|| received.load(Ordering::SeqCst) == 2));

        sup.stop().unwrap();
        assert!(inbox.is_closed());
        wait_for_event(&events, |e| *e == SupervisorEvent::Stopped);
    }

    #[test]
    fn worker_pool_starts_every_worker() {
        let starts = Arc::new(AtomicUsize::new(0));
        let pool = worker_pool("pool", 4, |index| {
            let starts = Arc::clone(&starts);
            TaskFn::new(format!("worker-{}", index), move |shutdown: ProcessShutdown| {
                starts.fetch_add(1, Ordering::SeqCst);
                shutdown.wait_for_shutdown();
                Ok(())
            })
        })
        .unwrap();

        assert_eq!(pool.child_count(), 4);
        assert_eq!(pool.child(3).unwrap().name, "pool.worker_3");
        pool.start().unwrap();
        assert!(wait_until(|| starts.load(Ordering::SeqCst) == 4));
        pool.stop().unwrap();
    }

    #[test]
    fn nested_supervisor_escalates_when_enabled() {
        let parent_events = events();
        let [starts] = counters::<1>();

        let child_sup = Supervisor::new("child_sup")
            .unwrap()
            .with_restart_strategy(RestartStrategy::one_for_one().with_budget(0, Duration::from_secs(60)))
            .with_escalation(true);
        child_sup.register(flaky("always", usize::MAX, Arc::clone(&starts))).unwrap();

        let root = supervision_tree(
            "root",
            RestartStrategy::one_for_one().with_budget(1, Duration::from_secs(60)),
            [child_sup.clone()],
        )
        .unwrap()
        .with_events(parent_events.clone());
        assert_eq!(root.child(0).unwrap().name, "root.child_sup");
        assert_eq!(child_sup.child(0).unwrap().name, "child_sup.always");
        root.start().unwrap();

        assert_eq!(restarted_children(&parent_events, 1), vec![0]);
        assert!(root.wait_for_status(SupervisorStatus::Degraded, WAIT));
        assert!(root.child(0).unwrap().failed);

        root.stop().unwrap();
        assert!(child_sup.wait_for_status(SupervisorStatus::Stopped, WAIT));
    }

    #[test]
    fn nested_supervisor_is_fail_silent_by_default() {
        let [starts] = counters::<1>();
        let child_sup = Supervisor::new("quiet_sup")
            .unwrap()
            .with_restart_strategy(RestartStrategy::one_for_one().with_budget(0, Duration::from_secs(60)));
        child_sup.register(flaky("always", usize::MAX, Arc::clone(&starts))).unwrap();

        let root = supervision_tree("quiet_root", RestartStrategy::default(), [child_sup.clone()]).unwrap();
        root.start().unwrap();

        assert!(child_sup.wait_for_status(SupervisorStatus::Degraded, WAIT));
        assert_eq!(root.status(), SupervisorStatus::Running);
        assert_eq!(root.child(0).unwrap().state, ChildState::Running);

        root.stop().unwrap();
        assert_eq!(child_sup.status(), SupervisorStatus::Stopped);
    }
}
