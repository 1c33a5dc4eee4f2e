//! Inbound application message
//!
//! `Message` is what subscription handlers and `on_message` receive. It is
//! built from an inbound PUBLISH once the QoS exchange allows delivery.
//!
//! Notes on fields:
//! - `payload`: raw bytes; MQTT does not constrain the encoding
//! - `received_at`: milliseconds since UNIX epoch, stamped when the frame is
//!   decoded (for QoS 2, when the PUBLISH arrived, not the PUBREL)
//! - `dup`: the broker flagged this as a possible redelivery; handlers must be
//!   idempotent for QoS 1

use bytes::Bytes;

use crate::transport::packet::{Publish, QoS};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    pub packet_id: u16,
    pub received_at: i64,
}

impl Message {
    pub fn from_publish(publish: Publish) -> Self {
        Self {
            topic: publish.topic,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
            dup: publish.dup,
            packet_id: publish.packet_id,
            received_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// The payload as UTF-8 text, if it is valid UTF-8.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}
