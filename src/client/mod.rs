//! The `client` module is the MQTT engine proper.
//!
//! It provides `MqttClient`, which ties together the connection supervisor
//! (`connection`), the per-connection reader, writer and worker pool
//! (`dispatch`), keep-alive bookkeeping (`keepalive`) and the application
//! callbacks (`callbacks`).

pub mod callbacks;
#[allow(clippy::module_inception)]
pub mod client;
pub mod connection;
mod dispatch;
mod keepalive;

pub use callbacks::{LoggingCallbacks, MqttCallbacks, NoopCallbacks};
pub use client::MqttClient;
pub use connection::ConnectionState;

#[cfg(test)]
mod tests;
