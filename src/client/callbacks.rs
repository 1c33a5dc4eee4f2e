//! Application callbacks
//!
//! `MqttCallbacks` is the capability set a consumer implements to observe a
//! client: connection established, message arrived, connection lost, and
//! delivery finished. Every method has a no-op default, so implementors only
//! override what they need.
//!
//! Callbacks run on the client's worker pool, never on the reader task. A
//! slow callback occupies a worker; it cannot stall frame decoding unless
//! every worker is busy.

use tracing::{info, warn};

use crate::session::delivery::Delivery;
use crate::session::message::Message;
use crate::utils::error::MqttError;

pub trait MqttCallbacks: Send + Sync + 'static {
    /// The broker accepted a CONNECT. `reconnect` is true for every
    /// connection after the first; `server_uri` is the endpoint that answered.
    fn on_connected(&self, _reconnect: bool, _server_uri: &str) {}

    /// Every inbound message, in addition to the handlers of matching
    /// subscriptions.
    fn on_message(&self, _message: &Message) {}

    fn on_connection_lost(&self, _cause: &MqttError) {}

    /// Final outcome of a publish: written (QoS 0), acknowledged (QoS 1/2),
    /// or failed.
    fn on_delivery_complete(&self, _delivery: &Delivery) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCallbacks;

impl MqttCallbacks for NoopCallbacks {}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingCallbacks;

impl MqttCallbacks for LoggingCallbacks {
    fn on_connected(&self, reconnect: bool, server_uri: &str) {
        if reconnect {
            info!("reconnected to {server_uri}");
        } else {
            info!("connected to {server_uri}");
        }
    }

    fn on_message(&self, message: &Message) {
        info!(
            "message on '{}' (QoS {}): {}",
            message.topic,
            message.qos as u8,
            String::from_utf8_lossy(&message.payload)
        );
    }

    fn on_connection_lost(&self, cause: &MqttError) {
        warn!("connection lost: {cause}");
    }

    fn on_delivery_complete(&self, delivery: &Delivery) {
        match &delivery.outcome {
            Ok(()) => info!(
                "delivered packet {} to '{}'",
                delivery.packet_id, delivery.topic
            ),
            Err(err) => warn!(
                "delivery of packet {} to '{}' failed: {err}",
                delivery.packet_id, delivery.topic
            ),
        }
    }
}
