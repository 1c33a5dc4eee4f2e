//! # mqtt-engine
//!
//! `mqtt-engine` is an asynchronous MQTT 3.1.1 client engine built on Tokio.
//! It connects to a broker over a pluggable transport, keeps the connection
//! alive and re-establishes it with backoff, routes inbound messages to
//! wildcard subscriptions, and carries outbound QoS 1 and QoS 2 messages to
//! completion across reconnects.
//!
//! ## Core Modules
//!
//! - `client`: `MqttClient`, the connection supervisor and the dispatch loop.
//! - `config`: Layered configuration (file, environment, defaults) and validation.
//! - `session`: Topic matching, the subscription registry and the delivery tracker.
//! - `transport`: The MQTT packet codec, framed I/O and the `Connector` seam.
//! - `utils`: Error taxonomy and logging setup.

pub mod client;
pub mod config;
pub mod session;
pub mod transport;
pub mod utils;

pub use client::{
    ConnectionState, LoggingCallbacks, MqttCallbacks, MqttClient, NoopCallbacks,
};
pub use config::Settings;
pub use session::{Delivery, Message};
pub use transport::{Connector, Endpoint, MemoryConnector, QoS, TcpConnector};
pub use utils::{ConnectReturnCode, MqttError, Result};
