//! Error taxonomy for the MQTT client engine.
//!
//! Every fallible operation returns [`Result`]. `MqttError` is `Clone` so a
//! single failure (for example a closed connection) can be handed to every
//! caller waiting on an acknowledgement.

use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MqttError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MqttError {
    /// Bad setup. Fatal, never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("no CONNACK within {timeout_ms}ms")]
    ConnectTimeout { timeout_ms: u64 },

    #[error("connection refused by broker: {0}")]
    ConnectRefused(ConnectReturnCode),

    #[error("invalid topic filter '{filter}': {reason}")]
    InvalidTopicFilter { filter: String, reason: &'static str },

    #[error("invalid topic name '{topic}': {reason}")]
    InvalidTopicName { topic: String, reason: &'static str },

    #[error("PUBLISH of {size} bytes exceeds the {max} byte frame limit")]
    PayloadTooLarge { size: usize, max: usize },

    /// The message was dropped after its retry budget was spent.
    #[error("delivery of packet {packet_id} timed out after {attempts} attempts")]
    DeliveryTimeout { packet_id: u16, attempts: u32 },

    #[error("outbound queue still full after {timeout_ms}ms")]
    BackpressureTimeout { timeout_ms: u64 },

    /// A synchronous call stopped waiting; the exchange itself may still complete.
    #[error("operation not completed within {timeout_ms}ms")]
    CompletionTimeout { timeout_ms: u64 },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("no PINGRESP within {timeout_ms}ms")]
    KeepAliveTimeout { timeout_ms: u64 },

    #[error("broker rejected subscription to '{filter}'")]
    SubscriptionRejected { filter: String },

    #[error("no UNSUBACK within {timeout_ms}ms")]
    UnsubscribeTimeout { timeout_ms: u64 },

    #[error("all packet identifiers are in flight")]
    PacketIdsExhausted,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl From<std::io::Error> for MqttError {
    fn from(err: std::io::Error) -> Self {
        MqttError::Transport(err.to_string())
    }
}

impl MqttError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        MqttError::Protocol(msg.into())
    }
}

/// CONNACK return codes (MQTT 3.1.1 section 3.2.2.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReturnCode {
    Accepted,
    UnacceptableProtocolVersion,
    IdentifierRejected,
    ServerUnavailable,
    BadUsernameOrPassword,
    NotAuthorized,
    Reserved(u8),
}

impl From<u8> for ConnectReturnCode {
    fn from(code: u8) -> Self {
        match code {
            0 => ConnectReturnCode::Accepted,
            1 => ConnectReturnCode::UnacceptableProtocolVersion,
            2 => ConnectReturnCode::IdentifierRejected,
            3 => ConnectReturnCode::ServerUnavailable,
            4 => ConnectReturnCode::BadUsernameOrPassword,
            5 => ConnectReturnCode::NotAuthorized,
            other => ConnectReturnCode::Reserved(other),
        }
    }
}

impl From<ConnectReturnCode> for u8 {
    fn from(code: ConnectReturnCode) -> Self {
        match code {
            ConnectReturnCode::Accepted => 0,
            ConnectReturnCode::UnacceptableProtocolVersion => 1,
            ConnectReturnCode::IdentifierRejected => 2,
            ConnectReturnCode::ServerUnavailable => 3,
            ConnectReturnCode::BadUsernameOrPassword => 4,
            ConnectReturnCode::NotAuthorized => 5,
            ConnectReturnCode::Reserved(other) => other,
        }
    }
}

impl fmt::Display for ConnectReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectReturnCode::Accepted => write!(f, "accepted"),
            ConnectReturnCode::UnacceptableProtocolVersion => {
                write!(f, "unacceptable protocol version")
            }
            ConnectReturnCode::IdentifierRejected => write!(f, "identifier rejected"),
            ConnectReturnCode::ServerUnavailable => write!(f, "server unavailable"),
            ConnectReturnCode::BadUsernameOrPassword => write!(f, "bad user name or password"),
            ConnectReturnCode::NotAuthorized => write!(f, "not authorized"),
            ConnectReturnCode::Reserved(code) => write!(f, "reserved return code {code}"),
        }
    }
}
