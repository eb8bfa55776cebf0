use std::fmt;

use strand_error::GenericError;

use super::shutdown::ProcessShutdown;

/// A supervisable task.
///
/// `run` is called on a dedicated thread every time the task is started or restarted. It should run until
/// `process_shutdown` fires and then return `Ok(())`.
///
/// How the task ends decides what the supervisor does next:
///
/// - returning `Ok(())` marks the child as completed, and it is not restarted
/// - returning an error, or panicking, is a failure and is handled by the supervisor's restart strategy
pub trait Supervisable: Send + Sync {
    /// Returns the name of the task.
    fn name(&self) -> &str;

    /// Runs the task until it completes, fails, or is asked to shut down.
    ///
    /// # Errors
    ///
    /// If the task fails, an error is returned.
    fn run(&self, process_shutdown: ProcessShutdown) -> Result<(), GenericError>;
}

/// A [`Supervisable`] task backed by a closure.
pub struct TaskFn<F> {
    name: String,
    f: F,
}

impl<F> TaskFn<F>
where
    F: Fn(ProcessShutdown) -> Result<(), GenericError> + Send + Sync,
{
    /// Creates a new `TaskFn` with the given name.
    pub fn new<S: Into<String>>(name: S, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

impl<F> Supervisable for TaskFn<F>
where
    F: Fn(ProcessShutdown) -> Result<(), GenericError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, process_shutdown: ProcessShutdown) -> Result<(), GenericError> {
        (self.f)(process_shutdown)
    }
}

impl<F> fmt::Debug for TaskFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFn").field("name", &self.name).finish_non_exhaustive()
    }
}
