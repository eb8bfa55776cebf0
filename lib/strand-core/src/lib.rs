//! Concurrency primitives for the strand runtime.
//!
//! - [`channel`]: bounded, blocking, closable FIFO channels
//! - [`goroutine`]: spawning and joining tasks on named OS threads
//! - [`parallel`]: fanning one function out across a fixed number of threads
//! - [`runtime`]: supervisors that restart failed tasks
//! - [`context`]: the clock and capability checker those components share
#![deny(warnings)]
#![deny(missing_docs)]

pub mod channel;
pub mod context;
pub mod goroutine;
pub mod parallel;
pub mod runtime;
