use std::time::Duration;

use tokio::time::Instant;

/// PINGRESP must arrive within this share of the keep-alive interval.
pub(crate) const TIMEOUT_PERCENT: u32 = 150;

/// Keep-alive bookkeeping for one connection.
///
/// The writer reports every frame it puts on the wire; housekeeping asks
/// whether a PINGREQ is due and whether the outstanding one has expired.
#[derive(Debug)]
pub(crate) struct KeepAlive {
    interval: Duration,
    last_outbound: Instant,
    ping_sent_at: Option<Instant>,
}

impl KeepAlive {
    pub(crate) fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            last_outbound: now,
            ping_sent_at: None,
        }
    }

    pub(crate) fn record_outbound(&mut self, now: Instant) {
        self.last_outbound = now;
    }

    /// Quiet for a whole interval and no PINGREQ outstanding.
    pub(crate) fn ping_due(&self, now: Instant) -> bool {
        !self.interval.is_zero()
            && self.ping_sent_at.is_none()
            && now.duration_since(self.last_outbound) >= self.interval
    }

    pub(crate) fn ping_sent(&mut self, now: Instant) {
        self.ping_sent_at = Some(now);
    }

    pub(crate) fn pong_received(&mut self) {
        self.ping_sent_at = None;
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.interval * TIMEOUT_PERCENT / 100
    }

    pub(crate) fn timed_out(&self, now: Instant) -> bool {
        match self.ping_sent_at {
            Some(sent) => now.duration_since(sent) >= self.timeout(),
            None => false,
        }
    }
}
