//! Supervision runtime.
//!
//! This module contains supervisors and the tasks they manage. It is directly inspired by
//! [Erlang/OTP](https://www.erlang.org/docs/28/system/design_principles#supervision-trees).
//!
//! # Tasks
//!
//! A task is a unit of work that runs on its own OS thread, described by the [`Supervisable`] trait. Tasks are never
//! pre-empted: they are handed a [`ProcessShutdown`] and are expected to return soon after it fires.
//!
//! # Supervisors
//!
//! A [`Supervisor`] owns an ordered list of children, starts them, and restarts them when they fail, according to a
//! [`RestartStrategy`]:
//!
//! - [`RestartPolicy::OneForOne`] restarts only the failed child, for children that are independent of each other
//! - [`RestartPolicy::OneForAll`] restarts every child, for children that only work as a group
//! - [`RestartPolicy::RestForOne`] restarts the failed child and every child that depends on it
//!
//! Restarts are limited by a budget (`max_restarts` within `time_window`). Once a failure exceeds the budget, the
//! failed child stays down and the supervisor reports itself as [`Degraded`][SupervisorStatus::Degraded].
//!
//! # Supervision trees
//!
//! Supervisors are themselves supervisable, so a supervisor can be registered as the child of another one. A nested
//! supervisor that was built [`with_escalation`][Supervisor::with_escalation] fails its slot in the parent once its
//! own budget is exhausted, which hands the failure to the parent's strategy.

mod deps;

mod process;
pub use self::process::Name;

mod restart;
pub use self::restart::{RestartPolicy, RestartStrategy};

mod shutdown;
pub use self::shutdown::{ProcessShutdown, ShutdownHandle};

mod supervisor;
pub use self::supervisor::{
    supervised_channels, supervision_tree, worker_pool, ChildInfo, ChildState, Supervisor, SupervisorError,
    SupervisorEvent, SupervisorStatus,
};

mod task;
pub use self::task::{Supervisable, TaskFn};
