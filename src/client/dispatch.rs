//! Dispatch loop
//!
//! One session runs three kinds of work:
//! - the reader (this task) decodes frames in receipt order and routes them:
//!   PUBLISH/PUBREL to the subscription registry, PUBACK/PUBREC/PUBCOMP to
//!   the delivery tracker, SUBACK/UNSUBACK to the pending request, PINGRESP
//!   to keep-alive
//! - the writer task drains a bounded queue of outbound frames; the queue
//!   capacity is where publishers feel back-pressure
//! - a bounded worker pool runs handlers and callbacks on blocking threads so
//!   a slow handler cannot stall decoding; neither the writer nor a worker
//!   ever waits on the other
//!
//! The reader also drives a housekeeping tick for PINGREQ scheduling and
//! retransmission. None of the shared tables is locked across an await.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{Semaphore, mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::client::callbacks::MqttCallbacks;
use crate::client::connection::ConnectionState;
use crate::client::keepalive::KeepAlive;
use crate::config::Settings;
use crate::session::delivery::{Delivery, DeliveryTracker, Finished, PendingRequest};
use crate::session::message::Message;
use crate::session::topic::SubscriptionRegistry;
use crate::transport::connector::BoxedStream;
use crate::transport::framed::{PacketReader, PacketWriter};
use crate::transport::packet::{Packet, Publish, QoS, SubAck, Subscribe, Unsubscribe};
use crate::utils::error::{MqttError, Result};

pub(crate) const HOUSEKEEPING_TICK: Duration = Duration::from_millis(100);
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) type SessionReader = PacketReader<ReadHalf<BoxedStream>>;
pub(crate) type SessionWriter = PacketWriter<WriteHalf<BoxedStream>>;
/// Sending side of the current connection's writer queue.
pub(crate) type Link = mpsc::Sender<Packet>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bounded pool of blocking threads for handlers and callbacks.
#[derive(Debug, Clone)]
pub(crate) struct WorkerPool {
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size.max(1))),
        }
    }

    /// Waits for a free worker, then runs `job` on it.
    pub(crate) async fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let Ok(permit) = self.permits.clone().acquire_owned().await else {
            return;
        };
        tokio::task::spawn_blocking(move || {
            job();
            drop(permit);
        });
    }
}

fn guarded(what: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!("{what} panicked");
    }
}

/// Everything a client instance shares between its API handle, the
/// connection supervisor and the session tasks.
pub(crate) struct Shared {
    pub(crate) settings: Settings,
    pub(crate) callbacks: Arc<dyn MqttCallbacks>,
    registry: Mutex<SubscriptionRegistry>,
    tracker: Mutex<DeliveryTracker>,
    state: watch::Sender<ConnectionState>,
    link: Mutex<Option<Link>>,
    workers: WorkerPool,
}

impl Shared {
    pub(crate) fn new(settings: Settings, callbacks: Arc<dyn MqttCallbacks>) -> Self {
        let tracker = DeliveryTracker::new(settings.retry_interval(), settings.delivery.max_attempts);
        let workers = WorkerPool::new(settings.dispatch.worker_pool_size);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            settings,
            callbacks,
            registry: Mutex::new(SubscriptionRegistry::new()),
            tracker: Mutex::new(tracker),
            state,
            link: Mutex::new(None),
            workers,
        }
    }

    pub(crate) fn registry(&self) -> MutexGuard<'_, SubscriptionRegistry> {
        lock(&self.registry)
    }

    pub(crate) fn tracker(&self) -> MutexGuard<'_, DeliveryTracker> {
        lock(&self.tracker)
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub(crate) fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!("connection state {previous} -> {next}");
        }
    }

    /// The writer queue of the live connection, if there is one.
    pub(crate) fn link(&self) -> Option<Link> {
        lock(&self.link).clone()
    }

    fn install_link(&self, link: Link) {
        *lock(&self.link) = Some(link);
    }

    pub(crate) fn clear_link(&self) {
        lock(&self.link).take();
    }

    pub(crate) async fn finish(&self, finished: Finished) {
        let delivery = finished.resolve();
        self.notify_delivery(delivery).await;
    }

    pub(crate) async fn notify_delivery(&self, delivery: Delivery) {
        let callbacks = self.callbacks.clone();
        self.workers
            .submit(move || {
                guarded("on_delivery_complete", || {
                    callbacks.on_delivery_complete(&delivery)
                })
            })
            .await;
    }

    pub(crate) async fn notify_connected(&self, reconnect: bool, server_uri: String) {
        let callbacks = self.callbacks.clone();
        self.workers
            .submit(move || {
                guarded("on_connected", || callbacks.on_connected(reconnect, &server_uri))
            })
            .await;
    }

    pub(crate) async fn notify_connection_lost(&self, cause: MqttError) {
        let callbacks = self.callbacks.clone();
        self.workers
            .submit(move || guarded("on_connection_lost", || callbacks.on_connection_lost(&cause)))
            .await;
    }

    /// SUBSCRIBE/UNSUBSCRIBE sent on a dead connection will never be
    /// acknowledged. Unfinished subscriptions are dropped, unfinished
    /// unsubscriptions are applied locally.
    pub(crate) fn abandon_requests(&self) {
        let requests = self.tracker().take_requests();
        if requests.is_empty() {
            return;
        }
        let mut registry = self.registry();
        for request in requests {
            match &request {
                PendingRequest::Subscribe { filters, .. } => {
                    for (filter, _) in filters {
                        registry.abandon(filter);
                    }
                }
                PendingRequest::Unsubscribe { filters, .. } => {
                    for filter in filters {
                        registry.remove(filter);
                    }
                }
            }
            request.fail(MqttError::ConnectionClosed);
        }
    }

    /// Final cleanup once the client stops for good: every waiter fails with
    /// `ConnectionClosed` and the subscriptions are forgotten.
    pub(crate) async fn teardown(&self) {
        self.clear_link();
        let failed = self.tracker().fail_all(MqttError::ConnectionClosed);
        for finished in failed {
            self.finish(finished).await;
        }
        self.registry().clear();
        self.set_state(ConnectionState::Disconnected);
    }
}

async fn send(link: &Link, packet: Packet) -> Result<()> {
    link.send(packet)
        .await
        .map_err(|_| MqttError::ConnectionClosed)
}

/// Run one established connection until it is lost (`Err`) or shut down on
/// request (`Ok`, after DISCONNECT went out). `on_resumed` runs once the
/// connection accepts new work.
pub(crate) async fn run_session<F>(
    shared: &Arc<Shared>,
    reader: SessionReader,
    writer: SessionWriter,
    session_present: bool,
    shutdown: &mut watch::Receiver<bool>,
    on_resumed: F,
) -> Result<()>
where
    F: FnOnce() + Send,
{
    let (link, outbound) = mpsc::channel(shared.settings.dispatch.queue_capacity.max(1));
    let keepalive = Arc::new(Mutex::new(KeepAlive::new(
        shared.settings.keep_alive(),
        Instant::now(),
    )));
    let (failed_tx, mut writer_failed) = oneshot::channel();
    let mut writer_task = tokio::spawn(write_loop(
        shared.clone(),
        writer,
        outbound,
        keepalive.clone(),
        failed_tx,
    ));

    let outcome = session_loop(
        shared,
        &link,
        &keepalive,
        reader,
        session_present,
        &mut writer_failed,
        shutdown,
        on_resumed,
    )
    .await;
    shared.clear_link();

    if outcome.is_ok() {
        let _ = link.send_timeout(Packet::Disconnect, WRITER_DRAIN_TIMEOUT).await;
        drop(link);
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer_task)
            .await
            .is_err()
        {
            warn!("writer did not drain in time");
            writer_task.abort();
        }
    } else {
        drop(link);
        writer_task.abort();
    }
    outcome
}

#[allow(clippy::too_many_arguments)]
async fn session_loop<F>(
    shared: &Arc<Shared>,
    link: &Link,
    keepalive: &Mutex<KeepAlive>,
    mut reader: SessionReader,
    session_present: bool,
    writer_failed: &mut oneshot::Receiver<MqttError>,
    shutdown: &mut watch::Receiver<bool>,
    on_resumed: F,
) -> Result<()>
where
    F: FnOnce() + Send,
{
    resume(shared, link, session_present).await?;
    on_resumed();

    let mut tick = tokio::time::interval(HOUSEKEEPING_TICK);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            frame = reader.next() => match frame? {
                Some(packet) => {
                    trace!("received {}", packet.name());
                    route(shared, link, keepalive, packet).await?;
                }
                None => return Err(MqttError::ConnectionClosed),
            },
            _ = tick.tick() => housekeeping(shared, link, keepalive).await?,
            err = &mut *writer_failed => {
                return Err(err.unwrap_or(MqttError::ConnectionClosed));
            }
            _ = shutdown.changed() => return Ok(()),
        }
    }
}

/// Bring a fresh connection up to date with the session state.
async fn resume(shared: &Arc<Shared>, link: &Link, session_present: bool) -> Result<()> {
    if shared.settings.connection.clean_session {
        let stale = shared.tracker().discard_session();
        for finished in stale {
            shared.finish(finished).await;
        }
    } else if !session_present {
        let forgotten = shared.tracker().forget_inbound();
        if forgotten > 0 {
            info!("broker kept no session, dropped {forgotten} unreleased QoS 2 messages");
        }
    }

    // Publishers check for a link under the tracker lock, so anything queued
    // before this point is part of the replay and nothing after it is.
    let replay = {
        let mut tracker = shared.tracker();
        shared.install_link(link.clone());
        tracker.resume(Instant::now())
    };
    if !replay.is_empty() {
        info!("resuming {} in-flight exchanges", replay.len());
    }
    for packet in replay {
        send(link, packet).await?;
    }

    if !session_present && shared.settings.reconnect.resubscribe {
        resubscribe(shared, link).await?;
    }
    Ok(())
}

async fn resubscribe(shared: &Arc<Shared>, link: &Link) -> Result<()> {
    let filters = shared.registry().granted_filters();
    if filters.is_empty() {
        return Ok(());
    }
    let packet_id = shared.tracker().begin_request(PendingRequest::Subscribe {
        filters: filters.clone(),
        reply: None,
    })?;
    info!("re-subscribing to {} filters", filters.len());
    send(link, Packet::Subscribe(Subscribe { packet_id, filters })).await
}

async fn route(
    shared: &Arc<Shared>,
    link: &Link,
    keepalive: &Mutex<KeepAlive>,
    packet: Packet,
) -> Result<()> {
    match packet {
        Packet::Publish(publish) => {
            let message = Message::from_publish(publish);
            let packet_id = message.packet_id;
            match message.qos {
                QoS::AtMostOnce => deliver(shared, link, message, None).await,
                QoS::AtLeastOnce => {
                    deliver(shared, link, message, Some(Packet::PubAck(packet_id))).await
                }
                QoS::ExactlyOnce => {
                    let fresh = shared.tracker().store_inbound(message);
                    if !fresh {
                        debug!("repeated QoS 2 PUBLISH {packet_id}");
                    }
                    send(link, Packet::PubRec(packet_id)).await?;
                }
            }
        }
        Packet::PubRel(packet_id) => {
            let released = shared.tracker().release_inbound(packet_id);
            match released {
                Some(message) => {
                    deliver(shared, link, message, Some(Packet::PubComp(packet_id))).await
                }
                None => {
                    debug!("PUBREL for {packet_id} already released");
                    send(link, Packet::PubComp(packet_id)).await?;
                }
            }
        }
        Packet::PubAck(packet_id) => {
            let finished = shared.tracker().on_puback(packet_id);
            if let Some(finished) = finished {
                shared.finish(finished).await;
            }
        }
        Packet::PubRec(packet_id) => {
            let release = shared.tracker().on_pubrec(packet_id, Instant::now());
            if let Some(release) = release {
                send(link, release).await?;
            }
        }
        Packet::PubComp(packet_id) => {
            let finished = shared.tracker().on_pubcomp(packet_id);
            if let Some(finished) = finished {
                shared.finish(finished).await;
            }
        }
        Packet::SubAck(ack) => complete_subscribe(shared, ack),
        Packet::UnsubAck(packet_id) => complete_unsubscribe(shared, packet_id),
        Packet::PingResp => lock(keepalive).pong_received(),
        other => {
            return Err(MqttError::protocol(format!(
                "unexpected {} from broker",
                other.name()
            )));
        }
    }
    Ok(())
}

/// Hand a message to every matching handler on the worker pool, then send
/// the acknowledgement the QoS level calls for.
///
/// The acknowledgement waits for queue room on its own task once the
/// handlers are done. Workers never wait on the writer queue.
async fn deliver(shared: &Arc<Shared>, link: &Link, message: Message, ack: Option<Packet>) {
    let handlers = shared.registry().handlers_for(&message.topic);
    if handlers.is_empty() {
        debug!("no subscription matches '{}'", message.topic);
    }
    let callbacks = shared.callbacks.clone();
    let packet_id = message.packet_id;
    let (handled_tx, handled) = oneshot::channel();

    shared
        .workers
        .submit(move || {
            for handler in &handlers {
                guarded("message handler", || handler(&message));
            }
            guarded("on_message", || callbacks.on_message(&message));
            let _ = handled_tx.send(());
        })
        .await;

    let Some(ack) = ack else {
        return;
    };
    let link = link.clone();
    tokio::spawn(async move {
        if handled.await.is_err() {
            return;
        }
        let name = ack.name();
        if link.send(ack).await.is_err() {
            warn!("{name} for packet {packet_id} not sent, connection closed");
        }
    });
}

fn complete_subscribe(shared: &Shared, ack: SubAck) {
    let request = shared.tracker().take_request(ack.packet_id);
    match request {
        Some(PendingRequest::Subscribe { filters, reply }) => {
            if ack.return_codes.len() != filters.len() {
                warn!(
                    "SUBACK {} carries {} codes for {} filters",
                    ack.packet_id,
                    ack.return_codes.len(),
                    filters.len()
                );
            }
            let mut granted = Vec::with_capacity(filters.len());
            {
                let mut registry = shared.registry();
                for (i, (filter, requested)) in filters.iter().enumerate() {
                    let code = ack.return_codes.get(i).copied().flatten();
                    match code {
                        Some(qos) => debug!(
                            "'{filter}' granted QoS {} (requested {})",
                            qos as u8, *requested as u8
                        ),
                        None => warn!("broker rejected subscription to '{filter}'"),
                    }
                    registry.grant(filter, code);
                    granted.push(code);
                }
            }
            if let Some(reply) = reply {
                let _ = reply.send(Ok(granted));
            }
        }
        Some(other) => {
            warn!("SUBACK {} does not answer a SUBSCRIBE", ack.packet_id);
            other.fail(MqttError::protocol("SUBACK received for UNSUBSCRIBE"));
        }
        None => debug!("SUBACK for unknown packet {}", ack.packet_id),
    }
}

fn complete_unsubscribe(shared: &Shared, packet_id: u16) {
    let request = shared.tracker().take_request(packet_id);
    match request {
        Some(PendingRequest::Unsubscribe { filters, reply }) => {
            {
                let mut registry = shared.registry();
                for filter in &filters {
                    registry.remove(filter);
                }
            }
            if let Some(reply) = reply {
                let _ = reply.send(Ok(()));
            }
        }
        Some(other) => {
            warn!("UNSUBACK {packet_id} does not answer an UNSUBSCRIBE");
            other.fail(MqttError::protocol("UNSUBACK received for SUBSCRIBE"));
        }
        None => debug!("UNSUBACK for unknown packet {packet_id}"),
    }
}

async fn housekeeping(shared: &Arc<Shared>, link: &Link, keepalive: &Mutex<KeepAlive>) -> Result<()> {
    let now = Instant::now();

    let ping = {
        let mut keepalive = lock(keepalive);
        if keepalive.timed_out(now) {
            let timeout_ms = keepalive.timeout().as_millis() as u64;
            warn!("no PINGRESP within {timeout_ms}ms");
            return Err(MqttError::KeepAliveTimeout { timeout_ms });
        }
        let due = keepalive.ping_due(now);
        if due {
            keepalive.ping_sent(now);
        }
        due
    };
    if ping {
        trace!("sending PINGREQ");
        send(link, Packet::PingReq).await?;
    }

    let (resend, expired) = shared.tracker().due(now);
    for packet in resend {
        send(link, packet).await?;
    }
    for finished in expired {
        shared.finish(finished).await;
    }
    Ok(())
}

async fn write_loop(
    shared: Arc<Shared>,
    mut writer: SessionWriter,
    mut outbound: mpsc::Receiver<Packet>,
    keepalive: Arc<Mutex<KeepAlive>>,
    failed: oneshot::Sender<MqttError>,
) {
    while let Some(packet) = outbound.recv().await {
        if let Err(err) = writer.frame(&packet) {
            warn!("cannot encode {}: {err}", packet.name());
            reject(&shared, packet, err);
            continue;
        }
        if let Err(err) = writer.write_frame().await {
            warn!("writing {} failed: {err}", packet.name());
            let _ = failed.send(err);
            return;
        }
        trace!("sent {}", packet.name());
        lock(&keepalive).record_outbound(Instant::now());

        match packet {
            Packet::Publish(publish) if publish.qos == QoS::AtMostOnce => {
                notify_detached(
                    &shared,
                    Delivery {
                        packet_id: 0,
                        topic: publish.topic,
                        qos: publish.qos,
                        outcome: Ok(()),
                    },
                );
            }
            Packet::Disconnect => break,
            _ => {}
        }
    }
    let _ = writer.shutdown().await;
}

/// Completion callbacks queued by the writer wait for a worker on their own
/// task; the writer keeps draining.
fn notify_detached(shared: &Arc<Shared>, delivery: Delivery) {
    let shared = shared.clone();
    tokio::spawn(async move { shared.notify_delivery(delivery).await });
}

/// Fail the exchange behind a frame that cannot be encoded.
fn reject(shared: &Arc<Shared>, packet: Packet, err: MqttError) {
    match packet {
        Packet::Publish(publish) if publish.qos == QoS::AtMostOnce => {
            notify_detached(
                shared,
                Delivery {
                    packet_id: 0,
                    topic: publish.topic,
                    qos: publish.qos,
                    outcome: Err(err),
                },
            );
        }
        Packet::Publish(Publish { packet_id, .. }) | Packet::PubRel(packet_id) => {
            let abandoned = shared.tracker().abandon(packet_id, err);
            if let Some(finished) = abandoned {
                notify_detached(shared, finished.resolve());
            }
        }
        Packet::Subscribe(Subscribe { packet_id, .. })
        | Packet::Unsubscribe(Unsubscribe { packet_id, .. }) => {
            let request = shared.tracker().take_request(packet_id);
            if let Some(request) = request {
                if let PendingRequest::Subscribe { filters, .. } = &request {
                    let mut registry = shared.registry();
                    for (filter, _) in filters {
                        registry.abandon(filter);
                    }
                }
                request.fail(err);
            }
        }
        _ => {}
    }
}
