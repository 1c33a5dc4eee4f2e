//! The `session` module holds the per-client protocol state that outlives a
//! single transport connection.
//!
//! - `topic`: filter validation, wildcard matching and the subscription registry.
//! - `delivery`: packet ids and the QoS 1/2 in-flight table.
//! - `message`: the inbound message handed to handlers.

pub mod delivery;
pub mod message;
pub mod topic;

pub use delivery::{Delivery, DeliveryTracker, OutboundStage, PendingRequest};
pub use message::Message;
pub use topic::{MessageHandler, SubscriptionRegistry, matches, validate_filter, validate_topic_name};
