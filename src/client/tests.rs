use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

use super::callbacks::MqttCallbacks;
use super::client::MqttClient;
use super::connection::{Backoff, ConnectionState};
use crate::config::{ReconnectSettings, Settings};
use crate::session::delivery::Delivery;
use crate::session::message::Message;
use crate::transport::connector::{MemoryConnector, MemoryListener};
use crate::transport::framed::{PacketReader, PacketWriter};
use crate::transport::packet::{
    ConnAck, Connect, MAX_REMAINING_LENGTH, Packet, Publish, QoS, SubAck, Subscribe,
};
use crate::utils::error::{ConnectReturnCode, MqttError};

const WAIT: Duration = Duration::from_secs(30);

#[derive(Debug)]
enum Event {
    Connected { reconnect: bool, uri: String },
    Message(Message),
    Lost(MqttError),
    Delivered(Delivery),
}

struct Recorder(mpsc::UnboundedSender<Event>);

impl MqttCallbacks for Recorder {
    fn on_connected(&self, reconnect: bool, server_uri: &str) {
        let _ = self.0.send(Event::Connected {
            reconnect,
            uri: server_uri.to_string(),
        });
    }

    fn on_message(&self, message: &Message) {
        let _ = self.0.send(Event::Message(message.clone()));
    }

    fn on_connection_lost(&self, cause: &MqttError) {
        let _ = self.0.send(Event::Lost(cause.clone()));
    }

    fn on_delivery_complete(&self, delivery: &Delivery) {
        let _ = self.0.send(Event::Delivered(delivery.clone()));
    }
}

struct Events(mpsc::UnboundedReceiver<Event>);

impl Events {
    async fn next(&mut self) -> Event {
        tokio::time::timeout(WAIT, self.0.recv())
            .await
            .expect("timed out waiting for a callback")
            .expect("callbacks dropped")
    }

    async fn connected(&mut self) -> (bool, String) {
        loop {
            if let Event::Connected { reconnect, uri } = self.next().await {
                return (reconnect, uri);
            }
        }
    }

    async fn message(&mut self) -> Message {
        loop {
            if let Event::Message(message) = self.next().await {
                return message;
            }
        }
    }

    async fn lost(&mut self) -> MqttError {
        loop {
            if let Event::Lost(cause) = self.next().await {
                return cause;
            }
        }
    }

    async fn delivered(&mut self) -> Delivery {
        loop {
            if let Event::Delivered(delivery) = self.next().await {
                return delivery;
            }
        }
    }
}

/// Broker side of one in-memory connection.
struct BrokerConn {
    uri: String,
    connect: Connect,
    reader: PacketReader<ReadHalf<DuplexStream>>,
    writer: PacketWriter<WriteHalf<DuplexStream>>,
}

impl BrokerConn {
    /// Take the next connection and read its CONNECT.
    async fn open(listener: &mut MemoryListener) -> Self {
        let (endpoint, stream) = tokio::time::timeout(WAIT, listener.accept())
            .await
            .expect("no connection attempt")
            .expect("connector dropped");
        let (read, write) = tokio::io::split(stream);
        let mut reader = PacketReader::new(read);
        let connect = match reader.next().await {
            Ok(Some(Packet::Connect(connect))) => connect,
            other => panic!("expected CONNECT, got {other:?}"),
        };
        Self {
            uri: endpoint.uri,
            connect,
            reader,
            writer: PacketWriter::new(write),
        }
    }

    async fn accept(listener: &mut MemoryListener, session_present: bool) -> Self {
        let mut conn = Self::open(listener).await;
        conn.send(Packet::ConnAck(ConnAck {
            session_present,
            code: ConnectReturnCode::Accepted,
        }))
        .await;
        conn
    }

    async fn refuse(listener: &mut MemoryListener, code: ConnectReturnCode) {
        let mut conn = Self::open(listener).await;
        conn.send(Packet::ConnAck(ConnAck {
            session_present: false,
            code,
        }))
        .await;
    }

    async fn send(&mut self, packet: Packet) {
        self.writer.send(&packet).await.expect("broker write");
    }

    async fn recv(&mut self) -> Packet {
        tokio::time::timeout(WAIT, self.reader.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("undecodable frame")
            .expect("client closed the connection")
    }

    /// `true` when nothing arrives for `quiet`.
    async fn silent_for(&mut self, quiet: Duration) -> bool {
        tokio::time::timeout(quiet, self.reader.next()).await.is_err()
    }

    async fn recv_publish(&mut self) -> Publish {
        match self.recv().await {
            Packet::Publish(publish) => publish,
            other => panic!("expected PUBLISH, got {other:?}"),
        }
    }

    /// Answer the next SUBSCRIBE with `codes`.
    async fn grant(&mut self, codes: Vec<Option<QoS>>) -> Subscribe {
        match self.recv().await {
            Packet::Subscribe(subscribe) => {
                self.send(Packet::SubAck(SubAck {
                    packet_id: subscribe.packet_id,
                    return_codes: codes,
                }))
                .await;
                subscribe
            }
            other => panic!("expected SUBSCRIBE, got {other:?}"),
        }
    }

    async fn publish(&mut self, topic: &str, qos: QoS, packet_id: u16) {
        self.send(Packet::Publish(Publish {
            topic: topic.to_string(),
            payload: "hello".into(),
            qos,
            retain: false,
            dup: false,
            packet_id,
        }))
        .await;
    }
}

fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.connection.server_uris = vec!["memory://broker".into()];
    settings.connection.client_id = "test-client".into();
    settings.connection.keep_alive_secs = 0;
    settings.reconnect.initial_delay_ms = 10;
    settings.reconnect.max_delay_ms = 100;
    settings.dispatch.worker_pool_size = 1;
    settings
}

fn start(settings: Settings) -> (MqttClient, MemoryListener, Events) {
    let (connector, listener) = MemoryConnector::new();
    let (tx, rx) = mpsc::unbounded_channel();
    let client = MqttClient::with_connector(settings, connector, Recorder(tx));
    (client, listener, Events(rx))
}

async fn connect(
    client: &MqttClient,
    listener: &mut MemoryListener,
    session_present: bool,
) -> BrokerConn {
    let (result, conn) = tokio::join!(
        client.connect(),
        BrokerConn::accept(listener, session_present)
    );
    result.expect("connect");
    conn
}

fn topic_recorder() -> (
    impl Fn(&Message) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<String>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |msg: &Message| {
        let _ = tx.send(msg.topic.clone());
    };
    (handler, rx)
}

#[test]
fn backoff_grows_to_the_cap_and_stops_after_max_attempts() {
    let mut backoff = Backoff::from_settings(&ReconnectSettings {
        enabled: true,
        initial_delay_ms: 100,
        max_delay_ms: 1_000,
        backoff_factor: 2.0,
        max_attempts: Some(5),
        resubscribe: true,
    });
    let delays: Vec<u64> = std::iter::from_fn(|| backoff.next_delay())
        .map(|d| d.as_millis() as u64)
        .collect();
    assert_eq!(delays, vec![100, 200, 400, 800, 1_000]);

    backoff.reset();
    assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
}

#[tokio::test]
async fn connect_sends_configured_connect_fields() {
    let mut settings = test_settings();
    settings.connection.keep_alive_secs = 30;
    settings.connection.clean_session = false;
    settings.connection.username = Some("user".into());
    settings.connection.password = Some("secret".into());
    let (client, mut listener, mut events) = start(settings);

    let conn = connect(&client, &mut listener, false).await;
    assert_eq!(
        conn.connect,
        Connect {
            client_id: "test-client".into(),
            keep_alive: 30,
            clean_session: false,
            username: Some("user".into()),
            password: Some("secret".into()),
        }
    );
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(events.connected().await, (false, "memory://broker".to_string()));

    // already running
    client.connect().await.unwrap();
    assert!(client.is_connected());
}

#[tokio::test]
async fn connect_rejects_invalid_settings() {
    let mut settings = test_settings();
    settings.connection.server_uris.clear();
    let (client, _listener, _events) = start(settings);

    assert!(matches!(client.connect().await, Err(MqttError::Configuration(_))));
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn refused_connect_fails_when_reconnect_is_disabled() {
    let mut settings = test_settings();
    settings.reconnect.enabled = false;
    let (client, mut listener, _events) = start(settings);

    let (result, _) = tokio::join!(
        client.connect(),
        BrokerConn::refuse(&mut listener, ConnectReturnCode::BadUsernameOrPassword)
    );
    assert_eq!(
        result,
        Err(MqttError::ConnectRefused(ConnectReturnCode::BadUsernameOrPassword))
    );
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn silent_broker_hits_connect_timeout() {
    let mut settings = test_settings();
    settings.reconnect.enabled = false;
    settings.connection.connect_timeout_ms = 200;
    let (client, mut listener, _events) = start(settings);

    // the accepted stream stays open but never answers
    let (result, _silent) = tokio::join!(client.connect(), listener.accept());
    assert_eq!(result, Err(MqttError::ConnectTimeout { timeout_ms: 200 }));
}

#[tokio::test]
async fn connect_fails_over_to_the_next_endpoint() {
    let mut settings = test_settings();
    settings.connection.server_uris = vec!["memory://primary".into(), "memory://backup".into()];
    let (client, mut listener, mut events) = start(settings);

    let broker = async {
        BrokerConn::refuse(&mut listener, ConnectReturnCode::ServerUnavailable).await;
        BrokerConn::accept(&mut listener, false).await
    };
    let (result, conn) = tokio::join!(client.connect(), broker);
    result.unwrap();
    assert_eq!(conn.uri, "memory://backup");
    assert_eq!(events.connected().await, (false, "memory://backup".to_string()));
}

#[tokio::test(start_paused = true)]
async fn reconnect_gives_up_after_max_attempts() {
    let mut settings = test_settings();
    settings.reconnect.max_attempts = Some(2);
    let (client, mut listener, _events) = start(settings);

    let mut states = client.watch_state();
    let observed = tokio::spawn(async move {
        let mut seen = Vec::new();
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            seen.push(state);
            if state == ConnectionState::Disconnected {
                break;
            }
        }
        seen
    });

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    tokio::spawn(async move {
        loop {
            let mut conn = BrokerConn::open(&mut listener).await;
            counter.fetch_add(1, Ordering::SeqCst);
            conn.send(Packet::ConnAck(ConnAck {
                session_present: false,
                code: ConnectReturnCode::NotAuthorized,
            }))
            .await;
        }
    });

    assert_eq!(
        client.connect().await,
        Err(MqttError::ConnectRefused(ConnectReturnCode::NotAuthorized))
    );
    // the first pass plus two retries
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(client.state(), ConnectionState::Disconnected);

    let seen = observed.await.unwrap();
    assert!(seen.contains(&ConnectionState::Reconnecting));
    assert_eq!(seen.last(), Some(&ConnectionState::Disconnected));
}

#[tokio::test]
async fn subscribe_returns_granted_qos_and_routes_matching_messages() {
    let (client, mut listener, mut events) = start(test_settings());
    let mut conn = connect(&client, &mut listener, false).await;
    let (handler, mut topics) = topic_recorder();

    let (granted, request) = tokio::join!(
        client.subscribe("sensors/+/temp", QoS::ExactlyOnce, handler),
        conn.grant(vec![Some(QoS::AtLeastOnce)])
    );
    assert_eq!(granted, Ok(QoS::AtLeastOnce));
    assert_eq!(
        request.filters,
        vec![("sensors/+/temp".to_string(), QoS::ExactlyOnce)]
    );
    assert_eq!(client.granted_qos("sensors/+/temp"), Some(QoS::AtLeastOnce));

    conn.publish("sensors/a/humidity", QoS::AtMostOnce, 0).await;
    conn.publish("sensors/a/temp", QoS::AtMostOnce, 0).await;

    // on_message sees both, the handler only the match
    assert_eq!(events.message().await.topic, "sensors/a/humidity");
    assert_eq!(events.message().await.topic, "sensors/a/temp");
    assert_eq!(topics.recv().await.unwrap(), "sensors/a/temp");
    assert!(topics.try_recv().is_err());
}

#[tokio::test]
async fn rejected_subscription_is_removed() {
    let (client, mut listener, _events) = start(test_settings());
    let mut conn = connect(&client, &mut listener, false).await;
    let (handler, _topics) = topic_recorder();

    let (granted, _) = tokio::join!(
        client.subscribe("private/#", QoS::AtLeastOnce, handler),
        conn.grant(vec![None])
    );
    assert_eq!(
        granted,
        Err(MqttError::SubscriptionRejected {
            filter: "private/#".into()
        })
    );
    assert_eq!(client.granted_qos("private/#"), None);
}

#[tokio::test]
async fn subscribe_many_reports_each_filter() {
    let (client, mut listener, _events) = start(test_settings());
    let mut conn = connect(&client, &mut listener, false).await;
    let (handler, _topics) = topic_recorder();

    let (granted, request) = tokio::join!(
        client.subscribe_many(&[("a", QoS::AtMostOnce), ("b", QoS::ExactlyOnce)], handler),
        conn.grant(vec![Some(QoS::AtMostOnce), None])
    );
    assert_eq!(request.filters.len(), 2);
    assert_eq!(granted, Ok(vec![Some(QoS::AtMostOnce), None]));
    assert_eq!(client.granted_qos("a"), Some(QoS::AtMostOnce));
    assert_eq!(client.granted_qos("b"), None);
}

#[tokio::test]
async fn invalid_filters_and_topics_are_rejected_locally() {
    let (client, _listener, _events) = start(test_settings());
    let (handler, _topics) = topic_recorder();

    assert!(matches!(
        client.subscribe("a/#/b", QoS::AtMostOnce, handler).await,
        Err(MqttError::InvalidTopicFilter { .. })
    ));
    assert!(matches!(
        client.publish("a/+", "x", QoS::AtMostOnce, false).await,
        Err(MqttError::InvalidTopicName { .. })
    ));
}

#[tokio::test]
async fn multi_level_wildcard_skips_dollar_topics() {
    let (client, mut listener, mut events) = start(test_settings());
    let mut conn = connect(&client, &mut listener, false).await;
    let (handler, mut topics) = topic_recorder();

    let (granted, _) = tokio::join!(
        client.subscribe("#", QoS::AtMostOnce, handler),
        conn.grant(vec![Some(QoS::AtMostOnce)])
    );
    granted.unwrap();

    conn.publish("$SYS/uptime", QoS::AtMostOnce, 0).await;
    conn.publish("plant/line1", QoS::AtMostOnce, 0).await;

    assert_eq!(events.message().await.topic, "$SYS/uptime");
    assert_eq!(events.message().await.topic, "plant/line1");
    assert_eq!(topics.recv().await.unwrap(), "plant/line1");
    assert!(topics.try_recv().is_err());
}

#[tokio::test]
async fn unsubscribe_completes_on_unsuback() {
    let (client, mut listener, _events) = start(test_settings());
    let mut conn = connect(&client, &mut listener, false).await;
    let (handler, _topics) = topic_recorder();

    let (granted, _) = tokio::join!(
        client.subscribe("a/b", QoS::AtLeastOnce, handler),
        conn.grant(vec![Some(QoS::AtLeastOnce)])
    );
    granted.unwrap();

    let broker = async {
        match conn.recv().await {
            Packet::Unsubscribe(unsubscribe) => {
                assert_eq!(unsubscribe.filters, vec!["a/b".to_string()]);
                conn.send(Packet::UnsubAck(unsubscribe.packet_id)).await;
            }
            other => panic!("expected UNSUBSCRIBE, got {other:?}"),
        }
    };
    let (result, _) = tokio::join!(client.unsubscribe("a/b"), broker);
    assert_eq!(result, Ok(()));
    assert_eq!(client.granted_qos("a/b"), None);
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_without_unsuback_times_out_and_removes_locally() {
    let mut settings = test_settings();
    settings.delivery.completion_timeout_ms = 200;
    let (client, mut listener, _events) = start(settings);
    let mut conn = connect(&client, &mut listener, false).await;
    let (handler, _topics) = topic_recorder();

    let (granted, _) = tokio::join!(
        client.subscribe("a/b", QoS::AtLeastOnce, handler),
        conn.grant(vec![Some(QoS::AtLeastOnce)])
    );
    granted.unwrap();

    let (result, request) = tokio::join!(client.unsubscribe("a/b"), conn.recv());
    assert!(matches!(request, Packet::Unsubscribe(_)));
    assert_eq!(result, Err(MqttError::UnsubscribeTimeout { timeout_ms: 200 }));
    assert_eq!(client.granted_qos("a/b"), None);
}

#[tokio::test]
async fn qos0_publish_is_reported_once_written() {
    let (client, mut listener, mut events) = start(test_settings());
    let mut conn = connect(&client, &mut listener, false).await;

    client
        .publish("status", "online", QoS::AtMostOnce, true)
        .await
        .unwrap();

    let publish = conn.recv_publish().await;
    assert_eq!(publish.topic, "status");
    assert_eq!(publish.payload, "online");
    assert!(publish.retain);
    assert_eq!(publish.packet_id, 0);

    let delivery = events.delivered().await;
    assert_eq!(delivery.packet_id, 0);
    assert_eq!(delivery.outcome, Ok(()));
}

#[tokio::test]
async fn qos1_publish_completes_on_puback() {
    let (client, mut listener, mut events) = start(test_settings());
    let mut conn = connect(&client, &mut listener, false).await;

    let broker = async {
        let publish = conn.recv_publish().await;
        assert_eq!(publish.qos, QoS::AtLeastOnce);
        assert!(!publish.dup);
        assert_ne!(publish.packet_id, 0);
        conn.send(Packet::PubAck(publish.packet_id)).await;
        publish.packet_id
    };
    let (result, packet_id) = tokio::join!(
        client.publish("a/b", "x", QoS::AtLeastOnce, false),
        broker
    );
    assert_eq!(result, Ok(()));
    assert_eq!(client.in_flight(), 0);

    let delivery = events.delivered().await;
    assert_eq!(delivery.packet_id, packet_id);
    assert_eq!(delivery.outcome, Ok(()));
}

#[tokio::test]
async fn qos2_publish_runs_the_full_handshake() {
    let (client, mut listener, mut events) = start(test_settings());
    let mut conn = connect(&client, &mut listener, false).await;

    let broker = async {
        let publish = conn.recv_publish().await;
        assert_eq!(publish.qos, QoS::ExactlyOnce);
        conn.send(Packet::PubRec(publish.packet_id)).await;
        assert_eq!(conn.recv().await, Packet::PubRel(publish.packet_id));
        conn.send(Packet::PubComp(publish.packet_id)).await;
    };
    let (result, _) = tokio::join!(
        client.publish("a/b", "x", QoS::ExactlyOnce, false),
        broker
    );
    assert_eq!(result, Ok(()));
    assert_eq!(events.delivered().await.outcome, Ok(()));
}

#[tokio::test]
async fn async_mode_publish_returns_before_the_ack() {
    let mut settings = test_settings();
    settings.delivery.async_mode = true;
    let (client, mut listener, mut events) = start(settings);
    let mut conn = connect(&client, &mut listener, false).await;

    client
        .publish("a/b", "x", QoS::AtLeastOnce, false)
        .await
        .unwrap();
    assert_eq!(client.in_flight(), 1);

    let publish = conn.recv_publish().await;
    conn.send(Packet::PubAck(publish.packet_id)).await;

    let delivery = events.delivered().await;
    assert_eq!(delivery.packet_id, publish.packet_id);
    assert_eq!(delivery.outcome, Ok(()));
}

#[tokio::test(start_paused = true)]
async fn async_mode_full_queue_drops_and_reports_backpressure() {
    let mut settings = test_settings();
    settings.delivery.async_mode = true;
    settings.dispatch.queue_capacity = 1;
    let (client, mut listener, mut events) = start(settings);
    // the broker never reads, so the pipe fills during the first frame
    let _conn = connect(&client, &mut listener, false).await;

    client
        .publish("bulk", vec![0u8; 70_000], QoS::AtLeastOnce, false)
        .await
        .unwrap();
    // the writer takes the first frame and stalls on the full pipe
    tokio::time::sleep(Duration::from_millis(10)).await;
    client
        .publish("queued", "x", QoS::AtLeastOnce, false)
        .await
        .unwrap();

    assert_eq!(
        client.publish("dropped", "x", QoS::AtLeastOnce, false).await,
        Ok(())
    );
    let delivery = events.delivered().await;
    assert_eq!(delivery.topic, "dropped");
    assert_eq!(delivery.qos, QoS::AtLeastOnce);
    assert_eq!(
        delivery.outcome,
        Err(MqttError::BackpressureTimeout { timeout_ms: 0 })
    );
    assert_eq!(client.in_flight(), 2);

    assert_eq!(
        client.publish("dropped/qos0", "x", QoS::AtMostOnce, false).await,
        Ok(())
    );
    let delivery = events.delivered().await;
    assert_eq!(delivery.topic, "dropped/qos0");
    assert_eq!(delivery.qos, QoS::AtMostOnce);
    assert_eq!(
        delivery.outcome,
        Err(MqttError::BackpressureTimeout { timeout_ms: 0 })
    );
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_qos1_is_retried_with_dup_then_dropped() {
    let mut settings = test_settings();
    settings.delivery.retry_interval_ms = 1_000;
    settings.delivery.max_attempts = 3;
    settings.delivery.completion_timeout_ms = 60_000;
    let (client, mut listener, mut events) = start(settings);
    let mut conn = connect(&client, &mut listener, false).await;

    let broker = async {
        let first = conn.recv_publish().await;
        let second = conn.recv_publish().await;
        let third = conn.recv_publish().await;
        (first, second, third)
    };
    let (result, (first, second, third)) = tokio::join!(
        client.publish("a/b", "x", QoS::AtLeastOnce, false),
        broker
    );

    assert!(!first.dup);
    assert!(second.dup && third.dup);
    assert_eq!(first.packet_id, second.packet_id);
    assert_eq!(first.packet_id, third.packet_id);

    let expected = MqttError::DeliveryTimeout {
        packet_id: first.packet_id,
        attempts: 3,
    };
    assert_eq!(result, Err(expected.clone()));
    assert_eq!(events.delivered().await.outcome, Err(expected));
    assert_eq!(client.in_flight(), 0);
}

#[tokio::test]
async fn inbound_qos1_is_acked_after_the_handler_ran() {
    let (client, mut listener, _events) = start(test_settings());
    let mut conn = connect(&client, &mut listener, false).await;
    let (handler, mut topics) = topic_recorder();

    let (granted, _) = tokio::join!(
        client.subscribe("jobs/#", QoS::AtLeastOnce, handler),
        conn.grant(vec![Some(QoS::AtLeastOnce)])
    );
    granted.unwrap();

    conn.publish("jobs/1", QoS::AtLeastOnce, 3).await;
    assert_eq!(conn.recv().await, Packet::PubAck(3));
    assert_eq!(topics.try_recv().unwrap(), "jobs/1");
}

#[tokio::test]
async fn inbound_qos2_is_delivered_once_despite_repeats() {
    let (client, mut listener, _events) = start(test_settings());
    let mut conn = connect(&client, &mut listener, false).await;
    let (handler, mut topics) = topic_recorder();

    let (granted, _) = tokio::join!(
        client.subscribe("orders", QoS::ExactlyOnce, handler),
        conn.grant(vec![Some(QoS::ExactlyOnce)])
    );
    granted.unwrap();

    conn.publish("orders", QoS::ExactlyOnce, 7).await;
    assert_eq!(conn.recv().await, Packet::PubRec(7));
    conn.publish("orders", QoS::ExactlyOnce, 7).await;
    assert_eq!(conn.recv().await, Packet::PubRec(7));

    conn.send(Packet::PubRel(7)).await;
    assert_eq!(conn.recv().await, Packet::PubComp(7));
    conn.send(Packet::PubRel(7)).await;
    assert_eq!(conn.recv().await, Packet::PubComp(7));

    assert_eq!(topics.try_recv().unwrap(), "orders");
    assert!(topics.try_recv().is_err());
}

#[tokio::test]
async fn reconnect_resends_in_flight_publish_with_dup() {
    let mut settings = test_settings();
    settings.connection.clean_session = false;
    let (client, mut listener, mut events) = start(settings);
    let conn = connect(&client, &mut listener, false).await;
    assert!(!events.connected().await.0);

    let broker = async {
        let mut conn = conn;
        let original = conn.recv_publish().await;
        drop(conn);

        let mut conn = BrokerConn::accept(&mut listener, true).await;
        let resent = conn.recv_publish().await;
        conn.send(Packet::PubAck(resent.packet_id)).await;
        (original, resent, conn)
    };
    let (result, (original, resent, _conn)) = tokio::join!(
        client.publish("a/b", "x", QoS::AtLeastOnce, false),
        broker
    );

    assert_eq!(result, Ok(()));
    assert!(!original.dup);
    assert!(resent.dup);
    assert_eq!(resent.packet_id, original.packet_id);
    assert_eq!(events.lost().await, MqttError::ConnectionClosed);
    assert!(events.connected().await.0);
    assert_eq!(events.delivered().await.outcome, Ok(()));
    assert_eq!(client.in_flight(), 0);
}

#[tokio::test]
async fn qos1_publish_while_reconnecting_is_sent_on_resume() {
    let mut settings = test_settings();
    settings.delivery.async_mode = true;
    let (client, mut listener, mut events) = start(settings);
    let conn = connect(&client, &mut listener, false).await;
    let mut state = client.watch_state();

    drop(conn);
    state
        .wait_for(|s| *s == ConnectionState::Reconnecting)
        .await
        .unwrap();

    client
        .publish("queued", "x", QoS::AtLeastOnce, false)
        .await
        .unwrap();
    assert!(matches!(
        client.publish("queued", "x", QoS::AtMostOnce, false).await,
        Err(MqttError::ConnectionClosed)
    ));

    let mut conn = BrokerConn::accept(&mut listener, false).await;
    let publish = conn.recv_publish().await;
    assert_eq!(publish.topic, "queued");
    assert!(!publish.dup);
    conn.send(Packet::PubAck(publish.packet_id)).await;
    assert_eq!(events.delivered().await.outcome, Ok(()));
}

#[tokio::test]
async fn lost_session_triggers_resubscribe() {
    let (client, mut listener, _events) = start(test_settings());
    let mut conn = connect(&client, &mut listener, false).await;
    let (handler, mut topics) = topic_recorder();

    let (granted, _) = tokio::join!(
        client.subscribe("s/#", QoS::AtLeastOnce, handler),
        conn.grant(vec![Some(QoS::AtLeastOnce)])
    );
    granted.unwrap();
    drop(conn);

    let mut conn = BrokerConn::accept(&mut listener, false).await;
    let request = conn.grant(vec![Some(QoS::AtLeastOnce)]).await;
    assert_eq!(request.filters, vec![("s/#".to_string(), QoS::AtLeastOnce)]);

    conn.publish("s/x", QoS::AtMostOnce, 0).await;
    assert_eq!(
        tokio::time::timeout(WAIT, topics.recv()).await.unwrap().unwrap(),
        "s/x"
    );
}

#[tokio::test(start_paused = true)]
async fn idle_connection_sends_pingreq() {
    let mut settings = test_settings();
    settings.connection.keep_alive_secs = 1;
    let (client, mut listener, _events) = start(settings);
    let mut conn = connect(&client, &mut listener, false).await;

    assert_eq!(conn.recv().await, Packet::PingReq);
    // one PINGREQ per idle interval, none while it is outstanding
    assert!(conn.silent_for(Duration::from_millis(1_200)).await);
    conn.send(Packet::PingResp).await;
    assert_eq!(conn.recv().await, Packet::PingReq);
    assert!(client.is_connected());
}

#[tokio::test(start_paused = true)]
async fn missing_pingresp_ends_the_session_and_reconnects() {
    let mut settings = test_settings();
    settings.connection.keep_alive_secs = 1;
    let (client, mut listener, mut events) = start(settings);
    let mut conn = connect(&client, &mut listener, false).await;

    assert_eq!(conn.recv().await, Packet::PingReq);
    assert_eq!(
        events.lost().await,
        MqttError::KeepAliveTimeout { timeout_ms: 1_500 }
    );

    let _conn = BrokerConn::accept(&mut listener, false).await;
    assert!(events.connected().await.0);
}

#[tokio::test]
async fn disconnect_sends_disconnect_and_is_idempotent() {
    let (client, mut listener, _events) = start(test_settings());
    let mut conn = connect(&client, &mut listener, false).await;

    let (result, packet) = tokio::join!(client.disconnect(), conn.recv());
    assert_eq!(result, Ok(()));
    assert_eq!(packet, Packet::Disconnect);
    assert_eq!(client.state(), ConnectionState::Disconnected);

    assert_eq!(client.disconnect().await, Ok(()));
    assert_eq!(
        client.publish("a", "x", QoS::AtLeastOnce, false).await,
        Err(MqttError::ConnectionClosed)
    );
}

#[tokio::test]
async fn disconnect_fails_pending_publishes() {
    let (client, mut listener, mut events) = start(test_settings());
    let mut conn = connect(&client, &mut listener, false).await;

    let disconnect_after_send = async {
        conn.recv_publish().await;
        client.disconnect().await
    };
    let (result, disconnected) = tokio::join!(
        client.publish("a/b", "x", QoS::AtLeastOnce, false),
        disconnect_after_send
    );
    assert_eq!(disconnected, Ok(()));
    assert_eq!(result, Err(MqttError::ConnectionClosed));
    assert_eq!(events.delivered().await.outcome, Err(MqttError::ConnectionClosed));
}

#[tokio::test]
async fn publish_before_connect_fails() {
    let (client, _listener, _events) = start(test_settings());
    for qos in [QoS::AtMostOnce, QoS::AtLeastOnce] {
        assert_eq!(
            client.publish("a", "x", qos, false).await,
            Err(MqttError::ConnectionClosed)
        );
    }
}

#[tokio::test]
async fn oversized_publish_is_rejected_before_it_is_tracked() {
    let (client, mut listener, _events) = start(test_settings());
    let mut conn = connect(&client, &mut listener, false).await;

    let payload = vec![0u8; MAX_REMAINING_LENGTH];
    assert_eq!(
        client.publish("big", payload, QoS::AtLeastOnce, false).await,
        Err(MqttError::PayloadTooLarge {
            size: MAX_REMAINING_LENGTH + 7,
            max: MAX_REMAINING_LENGTH,
        })
    );
    assert_eq!(client.in_flight(), 0);

    // the connection is unaffected
    let broker = async {
        let publish = conn.recv_publish().await;
        conn.send(Packet::PubAck(publish.packet_id)).await;
        publish.topic
    };
    let (result, topic) = tokio::join!(
        client.publish("small", "x", QoS::AtLeastOnce, false),
        broker
    );
    assert_eq!(result, Ok(()));
    assert_eq!(topic, "small");
    assert!(client.is_connected());
}

#[tokio::test(start_paused = true)]
async fn full_outbound_queue_times_out() {
    let mut settings = test_settings();
    settings.dispatch.queue_capacity = 1;
    settings.delivery.completion_timeout_ms = 500;
    let (client, mut listener, _events) = start(settings);
    // the broker never reads, so the pipe fills during the first frame
    let _conn = connect(&client, &mut listener, false).await;

    let payload = vec![0u8; 70_000];
    client
        .publish("bulk", payload.clone(), QoS::AtMostOnce, false)
        .await
        .unwrap();
    client
        .publish("bulk", payload.clone(), QoS::AtMostOnce, false)
        .await
        .unwrap();
    assert_eq!(
        client.publish("bulk", payload, QoS::AtMostOnce, false).await,
        Err(MqttError::BackpressureTimeout { timeout_ms: 500 })
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_handler_does_not_stall_other_messages() {
    let mut settings = test_settings();
    settings.dispatch.worker_pool_size = 2;
    let (client, mut listener, _events) = start(settings);
    let mut conn = connect(&client, &mut listener, false).await;

    let (release, gate) = std::sync::mpsc::channel::<()>();
    let gate = Mutex::new(gate);
    let handler = move |msg: &Message| {
        if msg.topic.starts_with("slow") {
            let _ = gate.lock().unwrap().recv();
        }
    };
    let (granted, _) = tokio::join!(
        client.subscribe("#", QoS::AtLeastOnce, handler),
        conn.grant(vec![Some(QoS::AtLeastOnce)])
    );
    granted.unwrap();

    conn.publish("slow/report", QoS::AtLeastOnce, 1).await;
    conn.publish("fast/ping", QoS::AtLeastOnce, 2).await;
    assert_eq!(conn.recv().await, Packet::PubAck(2));

    release.send(()).unwrap();
    assert_eq!(conn.recv().await, Packet::PubAck(1));
}

#[tokio::test]
async fn inbound_ack_on_a_full_queue_does_not_starve_the_writer() {
    let mut settings = test_settings();
    settings.dispatch.queue_capacity = 1;
    settings.dispatch.worker_pool_size = 1;
    let (client, mut listener, mut events) = start(settings);
    let mut conn = connect(&client, &mut listener, false).await;

    let (granted, _) = tokio::join!(
        client.subscribe("#", QoS::AtLeastOnce, |_msg: &Message| {}),
        conn.grant(vec![Some(QoS::AtLeastOnce)])
    );
    granted.unwrap();

    // the broker is not reading: the first frame stalls the writer and the
    // second one fills the queue
    client
        .publish("bulk", vec![0u8; 200_000], QoS::AtMostOnce, false)
        .await
        .unwrap();
    client
        .publish("small", "x", QoS::AtMostOnce, false)
        .await
        .unwrap();

    conn.publish("in/qos1", QoS::AtLeastOnce, 5).await;
    assert_eq!(events.message().await.topic, "in/qos1");

    assert_eq!(conn.recv_publish().await.topic, "bulk");
    assert_eq!(conn.recv_publish().await.topic, "small");
    assert_eq!(conn.recv().await, Packet::PubAck(5));
}
