//! Delivery tracker
//!
//! This module owns the protocol state of every QoS > 0 exchange on a session:
//! - allocating packet identifiers that are never reused while in flight
//! - tracking outbound PUBLISH through PUBACK, or PUBREC -> PUBREL -> PUBCOMP
//! - retransmitting a stage that went unacknowledged for `retry_interval`,
//!   and dropping the message with `DeliveryTimeout` once `max_attempts`
//!   transmissions of that stage went unanswered
//! - remembering inbound QoS 2 ids between PUBLISH and PUBREL so a message is
//!   handed to the application once, even if PUBREL is retransmitted
//! - correlating SUBSCRIBE/UNSUBSCRIBE with their acknowledgements
//!
//! Concurrency and usage notes:
//! - The tracker is synchronous and is kept behind a mutex by the client.
//!   It returns the packets to send and the deliveries that finished; the
//!   caller does the I/O after releasing the lock.
//! - State survives a reconnect. `resume` replays every outbound exchange
//!   from the stage it reached, `discard_session` drops what a clean session
//!   invalidates.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::session::message::Message;
use crate::transport::packet::{Packet, Publish, QoS};
use crate::utils::error::{MqttError, Result};

/// The acknowledgement an outbound exchange is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundStage {
    AwaitingPubAck,
    AwaitingPubRec,
    AwaitingPubComp,
}

/// Final outcome of one publish, reported through `on_delivery_complete`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// `0` for QoS 0 publishes.
    pub packet_id: u16,
    pub topic: String,
    pub qos: QoS,
    pub outcome: Result<()>,
}

pub type DeliveryReply = oneshot::Sender<Result<()>>;
pub type SubscribeReply = oneshot::Sender<Result<Vec<Option<QoS>>>>;
pub type UnsubscribeReply = oneshot::Sender<Result<()>>;

#[derive(Debug)]
struct OutboundExchange {
    publish: Publish,
    stage: OutboundStage,
    /// Transmissions of the current stage.
    attempts: u32,
    /// `None` until the first transmission.
    last_sent: Option<Instant>,
    seq: u64,
    reply: Option<DeliveryReply>,
}

impl OutboundExchange {
    fn packet(&self) -> Packet {
        match self.stage {
            OutboundStage::AwaitingPubComp => Packet::PubRel(self.publish.packet_id),
            _ => {
                let mut publish = self.publish.clone();
                publish.dup = self.last_sent.is_some();
                Packet::Publish(publish)
            }
        }
    }

    fn finish(self, outcome: Result<()>) -> Finished {
        Finished {
            delivery: Delivery {
                packet_id: self.publish.packet_id,
                topic: self.publish.topic,
                qos: self.publish.qos,
                outcome,
            },
            reply: self.reply,
        }
    }
}

/// A SUBSCRIBE or UNSUBSCRIBE waiting for its acknowledgement.
#[derive(Debug)]
pub enum PendingRequest {
    Subscribe {
        filters: Vec<(String, QoS)>,
        reply: Option<SubscribeReply>,
    },
    Unsubscribe {
        filters: Vec<String>,
        reply: Option<UnsubscribeReply>,
    },
}

impl PendingRequest {
    pub fn fail(self, err: MqttError) {
        match self {
            PendingRequest::Subscribe { reply, .. } => {
                if let Some(reply) = reply {
                    let _ = reply.send(Err(err));
                }
            }
            PendingRequest::Unsubscribe { reply, .. } => {
                if let Some(reply) = reply {
                    let _ = reply.send(Err(err));
                }
            }
        }
    }
}

/// An outbound exchange that reached its end. `resolve` wakes the waiting
/// caller, if any, and hands back the outcome for the callback.
#[derive(Debug)]
pub struct Finished {
    pub delivery: Delivery,
    reply: Option<DeliveryReply>,
}

impl Finished {
    pub fn resolve(self) -> Delivery {
        if let Some(reply) = self.reply {
            let _ = reply.send(self.delivery.outcome.clone());
        }
        self.delivery
    }
}

#[derive(Debug)]
pub struct DeliveryTracker {
    outbound: HashMap<u16, OutboundExchange>,
    inbound: HashMap<u16, Message>,
    requests: HashMap<u16, PendingRequest>,
    next_id: u16,
    next_seq: u64,
    retry_interval: Duration,
    max_attempts: u32,
}

impl DeliveryTracker {
    pub fn new(retry_interval: Duration, max_attempts: u32) -> Self {
        Self {
            outbound: HashMap::new(),
            inbound: HashMap::new(),
            requests: HashMap::new(),
            next_id: 1,
            next_seq: 0,
            retry_interval,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Next identifier not used by any outbound exchange or pending request.
    pub fn next_packet_id(&mut self) -> Result<u16> {
        for _ in 0..u16::MAX {
            let id = self.next_id;
            self.next_id = if id == u16::MAX { 1 } else { id + 1 };
            if !self.outbound.contains_key(&id) && !self.requests.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(MqttError::PacketIdsExhausted)
    }

    /// Start tracking a QoS 1/2 publish and give it a packet id.
    ///
    /// With `sent_at` set the caller transmits the returned frame now;
    /// without it the message waits for `resume`.
    pub fn begin_publish(
        &mut self,
        mut publish: Publish,
        reply: Option<DeliveryReply>,
        sent_at: Option<Instant>,
    ) -> Result<Publish> {
        let stage = match publish.qos {
            QoS::AtLeastOnce => OutboundStage::AwaitingPubAck,
            QoS::ExactlyOnce => OutboundStage::AwaitingPubRec,
            QoS::AtMostOnce => {
                return Err(MqttError::protocol("QoS 0 publishes are not tracked"));
            }
        };
        publish.packet_id = self.next_packet_id()?;
        publish.dup = false;

        let seq = self.next_seq;
        self.next_seq += 1;
        self.outbound.insert(
            publish.packet_id,
            OutboundExchange {
                publish: publish.clone(),
                stage,
                attempts: u32::from(sent_at.is_some()),
                last_sent: sent_at,
                seq,
                reply,
            },
        );
        Ok(publish)
    }

    /// Stop tracking a publish that never reached the broker.
    pub fn abandon(&mut self, packet_id: u16, err: MqttError) -> Option<Finished> {
        self.outbound
            .remove(&packet_id)
            .map(|exchange| exchange.finish(Err(err)))
    }

    pub fn begin_request(&mut self, request: PendingRequest) -> Result<u16> {
        let id = self.next_packet_id()?;
        self.requests.insert(id, request);
        Ok(id)
    }

    pub fn take_request(&mut self, packet_id: u16) -> Option<PendingRequest> {
        self.requests.remove(&packet_id)
    }

    pub fn on_puback(&mut self, packet_id: u16) -> Option<Finished> {
        self.complete(packet_id, OutboundStage::AwaitingPubAck, "PUBACK")
    }

    pub fn on_pubcomp(&mut self, packet_id: u16) -> Option<Finished> {
        self.complete(packet_id, OutboundStage::AwaitingPubComp, "PUBCOMP")
    }

    /// Move a QoS 2 exchange to its release stage. Returns the PUBREL to
    /// send; a repeated PUBREC gets the PUBREL again.
    pub fn on_pubrec(&mut self, packet_id: u16, now: Instant) -> Option<Packet> {
        let Some(exchange) = self.outbound.get_mut(&packet_id) else {
            warn!("PUBREC for unknown packet {packet_id}");
            return None;
        };
        match exchange.stage {
            OutboundStage::AwaitingPubRec => {
                exchange.stage = OutboundStage::AwaitingPubComp;
                exchange.attempts = 1;
                exchange.last_sent = Some(now);
                Some(Packet::PubRel(packet_id))
            }
            OutboundStage::AwaitingPubComp => Some(Packet::PubRel(packet_id)),
            OutboundStage::AwaitingPubAck => {
                warn!("PUBREC for QoS 1 packet {packet_id}");
                None
            }
        }
    }

    fn complete(
        &mut self,
        packet_id: u16,
        expected: OutboundStage,
        ack: &str,
    ) -> Option<Finished> {
        match self.outbound.get(&packet_id) {
            Some(exchange) if exchange.stage == expected => {}
            Some(exchange) => {
                warn!(
                    "{ack} for packet {packet_id} while in stage {:?}",
                    exchange.stage
                );
                return None;
            }
            None => {
                debug!("{ack} for unknown packet {packet_id}");
                return None;
            }
        }
        self.outbound
            .remove(&packet_id)
            .map(|exchange| exchange.finish(Ok(())))
    }

    /// Remember an inbound QoS 2 message until PUBREL. Returns `false` when
    /// the id is already held (a retransmitted PUBLISH).
    pub fn store_inbound(&mut self, message: Message) -> bool {
        if self.inbound.contains_key(&message.packet_id) {
            return false;
        }
        self.inbound.insert(message.packet_id, message);
        true
    }

    /// Take the message released by PUBREL. Only the first PUBREL for an id
    /// yields it.
    pub fn release_inbound(&mut self, packet_id: u16) -> Option<Message> {
        self.inbound.remove(&packet_id)
    }

    /// Stages whose acknowledgement is overdue: frames to retransmit and
    /// exchanges that ran out of attempts.
    pub fn due(&mut self, now: Instant) -> (Vec<Packet>, Vec<Finished>) {
        let mut resend = Vec::new();
        let mut expired = Vec::new();

        for (id, exchange) in self.outbound.iter_mut() {
            let Some(last_sent) = exchange.last_sent else {
                continue;
            };
            if now.duration_since(last_sent) < self.retry_interval {
                continue;
            }
            if exchange.attempts >= self.max_attempts {
                expired.push(*id);
            } else {
                exchange.attempts += 1;
                resend.push((exchange.seq, exchange.packet()));
                exchange.last_sent = Some(now);
                debug!(
                    "retransmitting packet {id}, attempt {} of {}",
                    exchange.attempts, self.max_attempts
                );
            }
        }

        resend.sort_by_key(|(seq, _)| *seq);
        let finished = expired
            .into_iter()
            .filter_map(|id| self.outbound.remove(&id))
            .map(|exchange| {
                warn!(
                    "packet {} dropped after {} attempts",
                    exchange.publish.packet_id, exchange.attempts
                );
                let outcome = Err(MqttError::DeliveryTimeout {
                    packet_id: exchange.publish.packet_id,
                    attempts: exchange.attempts,
                });
                exchange.finish(outcome)
            })
            .collect();

        (resend.into_iter().map(|(_, packet)| packet).collect(), finished)
    }

    /// Every outbound exchange, in original send order, as the frame that
    /// continues it on a fresh connection. Does not consume attempts.
    pub fn resume(&mut self, now: Instant) -> Vec<Packet> {
        let mut exchanges: Vec<&mut OutboundExchange> = self.outbound.values_mut().collect();
        exchanges.sort_by_key(|e| e.seq);
        exchanges
            .into_iter()
            .map(|exchange| {
                let packet = exchange.packet();
                if exchange.last_sent.is_none() {
                    exchange.attempts = 1;
                }
                exchange.last_sent = Some(now);
                packet
            })
            .collect()
    }

    /// The broker starts from scratch: transmitted exchanges can never be
    /// acknowledged and inbound QoS 2 state is void. Queued, never-sent
    /// publishes stay and go out on `resume`.
    pub fn discard_session(&mut self) -> Vec<Finished> {
        self.inbound.clear();
        let stale: Vec<u16> = self
            .outbound
            .iter()
            .filter(|(_, e)| e.last_sent.is_some())
            .map(|(id, _)| *id)
            .collect();
        stale
            .into_iter()
            .filter_map(|id| self.outbound.remove(&id))
            .map(|exchange| exchange.finish(Err(MqttError::ConnectionClosed)))
            .collect()
    }

    /// The broker resumed without our session, so no PUBREL will follow for
    /// the held inbound QoS 2 messages. Returns how many were dropped.
    pub fn forget_inbound(&mut self) -> usize {
        let held = self.inbound.len();
        self.inbound.clear();
        held
    }

    /// SUBSCRIBE/UNSUBSCRIBE waits do not survive the connection they were
    /// sent on. The caller fails each one after cleaning up the registry.
    pub fn take_requests(&mut self) -> Vec<PendingRequest> {
        let mut ids: Vec<u16> = self.requests.keys().copied().collect();
        ids.sort_unstable();
        ids.into_iter()
            .filter_map(|id| self.requests.remove(&id))
            .collect()
    }

    /// Tear everything down, failing every waiter with `err`.
    pub fn fail_all(&mut self, err: MqttError) -> Vec<Finished> {
        for request in self.take_requests() {
            request.fail(err.clone());
        }
        self.inbound.clear();
        let mut exchanges: Vec<OutboundExchange> =
            self.outbound.drain().map(|(_, exchange)| exchange).collect();
        exchanges.sort_by_key(|e| e.seq);
        exchanges
            .into_iter()
            .map(|exchange| exchange.finish(Err(err.clone())))
            .collect()
    }

    pub fn stage(&self, packet_id: u16) -> Option<OutboundStage> {
        self.outbound.get(&packet_id).map(|e| e.stage)
    }

    pub fn in_flight(&self) -> usize {
        self.outbound.len()
    }

    pub fn inbound_pending(&self) -> usize {
        self.inbound.len()
    }

    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }
}
