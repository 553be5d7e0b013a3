//! detector-host library crate.
//!
//! Host side: the scheduler, the alert-rule store and the retry policy.
//! Child side: the detector runner, the loader and the built-in detectors.

pub mod config;
pub mod database;
pub mod detectors;
pub mod domain;
pub mod error;
pub mod logging;
pub mod panic_hook;
pub mod resilience;
pub mod runner;
pub mod scheduler;

pub use error::{Error, Result};
