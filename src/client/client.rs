use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::client::callbacks::MqttCallbacks;
use crate::client::connection::{ConnectionState, supervise};
use crate::client::dispatch::{Link, Shared};
use crate::config::Settings;
use crate::session::delivery::{Delivery, PendingRequest};
use crate::session::message::Message;
use crate::session::topic::{MessageHandler, validate_filter, validate_topic_name};
use crate::transport::connector::{Connector, TcpConnector};
use crate::transport::packet::{
    MAX_REMAINING_LENGTH, Packet, Publish, QoS, Subscribe, Unsubscribe,
};
use crate::utils::error::{MqttError, Result};

struct Running {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

/// An MQTT 3.1.1 client.
///
/// Each instance owns its configuration, subscription registry, delivery
/// tracker and connection; several clients can live in one process.
/// Methods take `&self`, so a client can be shared behind an `Arc` and used
/// from many tasks at once.
///
/// # Example
///
/// ```no_run
/// use mqtt_engine::{MqttClient, NoopCallbacks, QoS, Settings};
///
/// # async fn run() -> mqtt_engine::Result<()> {
/// let mut settings = Settings::default();
/// settings.connection.server_uris = vec!["tcp://localhost:1883".into()];
///
/// let client = MqttClient::new(settings, NoopCallbacks);
/// client.connect().await?;
/// client
///     .subscribe("sensors/+/temp", QoS::AtLeastOnce, |msg| {
///         println!("{}: {:?}", msg.topic, msg.payload_str());
///     })
///     .await?;
/// client.publish("sensors/a/temp", "21.5", QoS::AtLeastOnce, false).await?;
/// client.disconnect().await?;
/// # Ok(())
/// # }
/// ```
pub struct MqttClient {
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    running: Mutex<Option<Running>>,
}

impl MqttClient {
    /// A client that connects over plain TCP.
    pub fn new(settings: Settings, callbacks: impl MqttCallbacks) -> Self {
        Self::with_connector(settings, TcpConnector, callbacks)
    }

    /// A client with its own transport, e.g. TLS or an in-memory pipe.
    pub fn with_connector(
        settings: Settings,
        connector: impl Connector,
        callbacks: impl MqttCallbacks,
    ) -> Self {
        Self {
            shared: Arc::new(Shared::new(settings, Arc::new(callbacks))),
            connector: Arc::new(connector),
            running: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.shared.settings
    }

    pub fn client_id(&self) -> &str {
        &self.shared.settings.connection.client_id
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Follow state transitions as they happen.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.watch_state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Outbound QoS 1/2 messages not yet fully acknowledged.
    pub fn in_flight(&self) -> usize {
        self.shared.tracker().in_flight()
    }

    /// QoS granted for `filter`, once its SUBACK arrived.
    pub fn granted_qos(&self, filter: &str) -> Option<QoS> {
        self.shared.registry().get(filter).and_then(|s| s.granted)
    }

    /// Connect to the first endpoint that accepts.
    ///
    /// Resolves once a CONNACK accepted the connection, or with the final
    /// error when every endpoint failed and reconnecting is disabled or out
    /// of attempts. Calling it on a client that is already running does
    /// nothing.
    pub async fn connect(&self) -> Result<()> {
        self.shared.settings.validate()?;
        let endpoints = self.shared.settings.endpoints()?;

        let ready = {
            let mut running = self.running.lock().await;
            if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
                debug!("connect called on a running client");
                return Ok(());
            }

            let (shutdown, shutdown_rx) = watch::channel(false);
            let (ready_tx, ready_rx) = oneshot::channel();
            self.shared.set_state(ConnectionState::Connecting);
            info!("client '{}' connecting", self.client_id());

            let handle = tokio::spawn(supervise(
                self.shared.clone(),
                self.connector.clone(),
                endpoints,
                shutdown_rx,
                ready_tx,
            ));
            *running = Some(Running { handle, shutdown });
            ready_rx
        };

        ready.await.unwrap_or(Err(MqttError::ConnectionClosed))
    }

    /// Send DISCONNECT, close the connection and stop reconnecting.
    ///
    /// Every pending publish and subscription request fails with
    /// `ConnectionClosed` and the subscription registry is cleared. Calling it
    /// again, or before `connect`, does nothing.
    pub async fn disconnect(&self) -> Result<()> {
        let running = self.running.lock().await.take();
        let Some(Running { handle, shutdown }) = running else {
            return Ok(());
        };

        if !handle.is_finished() {
            self.shared.set_state(ConnectionState::Disconnecting);
        }
        let _ = shutdown.send(true);
        if let Err(err) = handle.await {
            error!("connection supervisor failed: {err}");
            self.shared.set_state(ConnectionState::Disconnected);
        }
        info!("client '{}' disconnected", self.client_id());
        Ok(())
    }

    /// Subscribe to one filter. Returns the QoS the broker granted.
    pub async fn subscribe<F>(&self, filter: &str, qos: QoS, handler: F) -> Result<QoS>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let granted = self.subscribe_many(&[(filter, qos)], handler).await?;
        match granted.first().copied().flatten() {
            Some(qos) => Ok(qos),
            None => Err(MqttError::SubscriptionRejected {
                filter: filter.to_string(),
            }),
        }
    }

    /// Subscribe to several filters with one SUBSCRIBE, all sharing
    /// `handler`. Returns the SUBACK code per filter, `None` where the broker
    /// refused it.
    pub async fn subscribe_many<F>(
        &self,
        filters: &[(&str, QoS)],
        handler: F,
    ) -> Result<Vec<Option<QoS>>>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        if filters.is_empty() {
            return Err(MqttError::InvalidTopicFilter {
                filter: String::new(),
                reason: "no topic filters given",
            });
        }
        for (filter, _) in filters {
            validate_filter(filter)?;
        }
        let link = self.shared.link().ok_or(MqttError::ConnectionClosed)?;

        let filters: Vec<(String, QoS)> = filters
            .iter()
            .map(|(filter, qos)| (filter.to_string(), *qos))
            .collect();
        let handler: MessageHandler = Arc::new(handler);
        {
            let mut registry = self.shared.registry();
            for (filter, qos) in &filters {
                registry.register(filter, *qos, handler.clone());
            }
        }

        let (reply, response) = oneshot::channel();
        let begun = self.shared.tracker().begin_request(PendingRequest::Subscribe {
            filters: filters.clone(),
            reply: Some(reply),
        });
        let packet_id = match begun {
            Ok(id) => id,
            Err(err) => {
                self.abandon_filters(&filters);
                return Err(err);
            }
        };
        debug!("subscribing to {} filters as packet {packet_id}", filters.len());

        let packet = Packet::Subscribe(Subscribe {
            packet_id,
            filters: filters.clone(),
        });
        if let Err(err) = self.enqueue(&link, packet).await {
            self.shared.tracker().take_request(packet_id);
            self.abandon_filters(&filters);
            return Err(err);
        }

        let timeout = self.shared.settings.completion_timeout();
        let outcome = match tokio::time::timeout(timeout, response).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(MqttError::ConnectionClosed),
            Err(_) => {
                self.shared.tracker().take_request(packet_id);
                warn!("no SUBACK for packet {packet_id}");
                Err(MqttError::CompletionTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        };
        if outcome.is_err() {
            self.abandon_filters(&filters);
        }
        outcome
    }

    fn abandon_filters(&self, filters: &[(String, QoS)]) {
        let mut registry = self.shared.registry();
        for (filter, _) in filters {
            registry.abandon(filter);
        }
    }

    /// Remove a subscription. The handler stops receiving messages once the
    /// broker acknowledges, or once the completion timeout passes.
    pub async fn unsubscribe(&self, filter: &str) -> Result<()> {
        validate_filter(filter)?;
        let link = self.shared.link().ok_or(MqttError::ConnectionClosed)?;

        let (reply, response) = oneshot::channel();
        let packet_id = self
            .shared
            .tracker()
            .begin_request(PendingRequest::Unsubscribe {
                filters: vec![filter.to_string()],
                reply: Some(reply),
            })?;

        let packet = Packet::Unsubscribe(Unsubscribe {
            packet_id,
            filters: vec![filter.to_string()],
        });
        if let Err(err) = self.enqueue(&link, packet).await {
            self.shared.tracker().take_request(packet_id);
            return Err(err);
        }

        let timeout = self.shared.settings.completion_timeout();
        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(MqttError::ConnectionClosed),
            Err(_) => {
                self.shared.tracker().take_request(packet_id);
                self.shared.registry().remove(filter);
                warn!("no UNSUBACK for '{filter}', removed locally");
                Err(MqttError::UnsubscribeTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Publish with the configured default QoS, not retained.
    pub async fn publish_default(&self, topic: &str, payload: impl Into<Bytes>) -> Result<()> {
        let qos = self.shared.settings.default_qos()?;
        self.publish(topic, payload, qos, false).await
    }

    /// Publish one message.
    ///
    /// In blocking mode this waits for room in the outbound queue, then for
    /// the final acknowledgement (QoS 1/2), each bounded by the completion
    /// timeout. In async mode it returns as soon as the message is handed
    /// over; the outcome arrives through `on_delivery_complete`.
    ///
    /// QoS 1/2 messages published while the client is reconnecting are held
    /// and sent when the connection comes back.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<()> {
        validate_topic_name(topic)?;
        let publish = Publish {
            topic: topic.to_string(),
            payload: payload.into(),
            qos,
            retain,
            dup: false,
            packet_id: 0,
        };
        let size = publish.remaining_length();
        if size > MAX_REMAINING_LENGTH {
            return Err(MqttError::PayloadTooLarge {
                size,
                max: MAX_REMAINING_LENGTH,
            });
        }
        if qos == QoS::AtMostOnce {
            return self.publish_at_most_once(publish).await;
        }

        let async_mode = self.shared.settings.delivery.async_mode;
        let (reply, response) = if async_mode {
            (None, None)
        } else {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        };

        // The tracker lock orders this against the replay of a new
        // connection: either the message is tracked before the replay is
        // taken, or the new link is already visible here.
        let (link, publish) = {
            let mut tracker = self.shared.tracker();
            let link = self.shared.link();
            let waiting = matches!(
                self.shared.state(),
                ConnectionState::Connecting | ConnectionState::Reconnecting
            );
            if link.is_none() && !waiting {
                return Err(MqttError::ConnectionClosed);
            }
            let sent_at = link.as_ref().map(|_| Instant::now());
            let publish = tracker.begin_publish(publish, reply, sent_at)?;
            (link, publish)
        };
        let packet_id = publish.packet_id;

        match link {
            Some(link) if async_mode => match link.try_send(Packet::Publish(publish)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("outbound queue full, dropping packet {packet_id}");
                    self.drop_publish(packet_id, MqttError::BackpressureTimeout { timeout_ms: 0 })
                        .await;
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("connection closed under packet {packet_id}, held for resume");
                }
            },
            Some(link) => {
                let timeout = self.shared.settings.completion_timeout();
                match link.send_timeout(Packet::Publish(publish), timeout).await {
                    Ok(()) => {}
                    Err(SendTimeoutError::Timeout(_)) => {
                        let err = MqttError::BackpressureTimeout {
                            timeout_ms: timeout.as_millis() as u64,
                        };
                        self.drop_publish(packet_id, err.clone()).await;
                        return Err(err);
                    }
                    Err(SendTimeoutError::Closed(_)) => {
                        debug!("connection closed under packet {packet_id}, held for resume");
                    }
                }
            }
            None => debug!("packet {packet_id} held until reconnected"),
        }

        let Some(response) = response else {
            return Ok(());
        };
        let timeout = self.shared.settings.completion_timeout();
        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(MqttError::ConnectionClosed),
            Err(_) => Err(MqttError::CompletionTimeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    async fn drop_publish(&self, packet_id: u16, err: MqttError) {
        let abandoned = self.shared.tracker().abandon(packet_id, err);
        if let Some(finished) = abandoned {
            self.shared.finish(finished).await;
        }
    }

    async fn publish_at_most_once(&self, publish: Publish) -> Result<()> {
        let link = self.shared.link().ok_or(MqttError::ConnectionClosed)?;
        let topic = publish.topic.clone();
        let packet = Packet::Publish(publish);

        if self.shared.settings.delivery.async_mode {
            return match link.try_send(packet) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => {
                    self.report_dropped(topic, MqttError::BackpressureTimeout { timeout_ms: 0 })
                        .await;
                    Ok(())
                }
                Err(TrySendError::Closed(_)) => Err(MqttError::ConnectionClosed),
            };
        }

        if let Err(err) = self.enqueue(&link, packet).await {
            self.report_dropped(topic, err.clone()).await;
            return Err(err);
        }
        Ok(())
    }

    async fn report_dropped(&self, topic: String, err: MqttError) {
        warn!("QoS 0 publish to '{topic}' dropped: {err}");
        self.shared
            .notify_delivery(Delivery {
                packet_id: 0,
                topic,
                qos: QoS::AtMostOnce,
                outcome: Err(err),
            })
            .await;
    }

    /// Queue a frame for the writer, waiting at most the completion timeout
    /// for room.
    async fn enqueue(&self, link: &Link, packet: Packet) -> Result<()> {
        let timeout = self.shared.settings.completion_timeout();
        link.send_timeout(packet, timeout)
            .await
            .map_err(|err| match err {
                SendTimeoutError::Timeout(_) => MqttError::BackpressureTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                },
                SendTimeoutError::Closed(_) => MqttError::ConnectionClosed,
            })
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            let _ = running.shutdown.send(true);
        }
    }
}
