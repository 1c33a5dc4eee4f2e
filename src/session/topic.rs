//! Topic filters and the subscription registry
//!
//! Filters are validated before anything goes on the wire: `#` may only be
//! the whole final level and `+` must occupy a whole level. Matching is
//! segment-wise; topics starting with `$` never match a filter whose first
//! level is a wildcard.
//!
//! The registry maps each filter to its requested QoS, the QoS the broker
//! granted (unknown until SUBACK) and the handler bound to it. Only granted
//! entries receive messages. Callers synchronize access (the client keeps it
//! behind a mutex that is never held across an await).

use std::fmt;
use std::sync::Arc;

use crate::session::message::Message;
use crate::transport::packet::QoS;
use crate::utils::error::{MqttError, Result};

pub const MAX_TOPIC_LEN: usize = 65_535;

pub type MessageHandler = Arc<dyn Fn(&Message) + Send + Sync>;

pub fn validate_filter(filter: &str) -> Result<()> {
    let invalid = |reason| MqttError::InvalidTopicFilter {
        filter: filter.to_string(),
        reason,
    };

    if filter.is_empty() {
        return Err(invalid("filter is empty"));
    }
    if filter.len() > MAX_TOPIC_LEN {
        return Err(invalid("filter is longer than 65535 bytes"));
    }
    if filter.contains('\0') {
        return Err(invalid("filter contains NUL"));
    }

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        if level.contains('#') {
            if level != "#" {
                return Err(invalid("'#' must occupy a whole level"));
            }
            if levels.peek().is_some() {
                return Err(invalid("'#' must be the last level"));
            }
        }
        if level.contains('+') && level != "+" {
            return Err(invalid("'+' must occupy a whole level"));
        }
    }
    Ok(())
}

/// Topic names used for PUBLISH carry no wildcards.
pub fn validate_topic_name(topic: &str) -> Result<()> {
    let invalid = |reason| MqttError::InvalidTopicName {
        topic: topic.to_string(),
        reason,
    };

    if topic.is_empty() {
        return Err(invalid("topic is empty"));
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(invalid("topic is longer than 65535 bytes"));
    }
    if topic.contains('\0') {
        return Err(invalid("topic contains NUL"));
    }
    if topic.contains(['+', '#']) {
        return Err(invalid("wildcards are not allowed in topic names"));
    }
    Ok(())
}

/// Does `topic` fall under `filter`? Both are assumed valid.
pub fn matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            // '#' also matches the parent level itself: "a/#" matches "a"
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[derive(Clone)]
pub struct Subscription {
    pub filter: String,
    pub requested: QoS,
    pub granted: Option<QoS>,
    handler: MessageHandler,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("filter", &self.filter)
            .field("requested", &self.requested)
            .field("granted", &self.granted)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: Vec<Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a subscription awaiting SUBACK. Re-registering a filter
    /// replaces its QoS and handler; a grant already received stays in force
    /// until the new SUBACK arrives.
    pub fn register(&mut self, filter: &str, requested: QoS, handler: MessageHandler) {
        if let Some(existing) = self.entries.iter_mut().find(|s| s.filter == filter) {
            existing.requested = requested;
            existing.handler = handler;
            return;
        }
        self.entries.push(Subscription {
            filter: filter.to_string(),
            requested,
            granted: None,
            handler,
        });
    }

    /// Apply a SUBACK return code. `None` (0x80) removes the entry.
    pub fn grant(&mut self, filter: &str, granted: Option<QoS>) {
        match granted {
            Some(qos) => {
                if let Some(entry) = self.entries.iter_mut().find(|s| s.filter == filter) {
                    entry.granted = Some(qos);
                }
            }
            None => {
                self.remove(filter);
            }
        }
    }

    /// Drop a registration whose SUBSCRIBE never completed. Entries that were
    /// granted earlier stay.
    pub fn abandon(&mut self, filter: &str) {
        self.entries
            .retain(|s| s.filter != filter || s.granted.is_some());
    }

    pub fn remove(&mut self, filter: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|s| s.filter != filter);
        self.entries.len() != before
    }

    pub fn get(&self, filter: &str) -> Option<&Subscription> {
        self.entries.iter().find(|s| s.filter == filter)
    }

    /// Handlers of every granted subscription matching `topic`.
    pub fn handlers_for(&self, topic: &str) -> Vec<MessageHandler> {
        self.entries
            .iter()
            .filter(|s| s.granted.is_some() && matches(&s.filter, topic))
            .map(|s| s.handler.clone())
            .collect()
    }

    /// Granted filters with the QoS originally requested, for re-subscribing
    /// after the broker lost the session.
    pub fn granted_filters(&self) -> Vec<(String, QoS)> {
        self.entries
            .iter()
            .filter(|s| s.granted.is_some())
            .map(|s| (s.filter.clone(), s.requested))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
