//! The `utils` module provides shared definitions used across the engine.
//!
//! - `error`: the `MqttError` taxonomy and the crate-wide `Result` alias.
//! - `logging`: tracing subscriber setup for binaries and tests.

pub mod error;
pub mod logging;

pub use error::{ConnectReturnCode, MqttError, Result};

#[cfg(test)]
mod tests;
