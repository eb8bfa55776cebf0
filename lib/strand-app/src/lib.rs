//! High-level application primitives.
//!
//! This crate provides the primitives a strand binary needs before it starts running, such as initializing logging.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod logging;

/// Common imports.
pub mod prelude {
    pub use super::logging::{fatal_and_exit, initialize_logging_from_configuration};
}
