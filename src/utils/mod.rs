//! The `utils` module provides a collection of utility functions and common
//! definitions used across the `courier` crate.
//!
//! - `error`: the crate-wide error type.
//! - `logging`: tracing subscriber installation.
//! - `sync`: the wait group and one-way flag used for startup and shutdown.

pub mod error;
pub mod logging;
pub mod sync;
