//! Connection manager
//!
//! The supervisor task owns the connection lifecycle of one client:
//! it walks the endpoint list in order, performs the CONNECT/CONNACK
//! handshake under a per-endpoint timeout, runs the session until it ends,
//! and then either stops or goes back to connecting with exponential backoff.
//!
//! Observable states: `Disconnected -> Connecting -> Connected`, then
//! `Connected -> Reconnecting -> Connected` on connection loss,
//! `Connecting -> Reconnecting` while a failed first connect waits for its
//! next attempt, and `-> Disconnecting -> Disconnected` on request.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::client::dispatch::{SessionReader, SessionWriter, Shared, run_session};
use crate::config::ReconnectSettings;
use crate::transport::connector::{Connector, Endpoint};
use crate::transport::framed::{PacketReader, PacketWriter};
use crate::transport::packet::{Connect, Packet};
use crate::utils::error::{ConnectReturnCode, MqttError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Exponential reconnect delay: `min(initial * factor^n, max)` for the n-th
/// retry, with an optional cap on the number of retries.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    max_attempts: Option<u32>,
    attempts: u32,
}

impl Backoff {
    pub(crate) fn from_settings(settings: &ReconnectSettings) -> Self {
        Self {
            initial: Duration::from_millis(settings.initial_delay_ms),
            max: Duration::from_millis(settings.max_delay_ms),
            factor: settings.backoff_factor,
            max_attempts: settings.max_attempts,
            attempts: 0,
        }
    }

    /// Delay before the next retry, or `None` once the retry budget is spent.
    pub(crate) fn next_delay(&mut self) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| self.attempts >= max) {
            return None;
        }
        let exponent = self.attempts.min(1_000) as i32;
        let millis = (self.initial.as_millis() as f64 * self.factor.powi(exponent))
            .min(self.max.as_millis() as f64);
        self.attempts += 1;
        Some(Duration::from_millis(millis as u64))
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }

    pub(crate) fn reset(&mut self) {
        self.attempts = 0;
    }
}

/// A connection that completed the handshake.
pub(crate) struct Established {
    pub(crate) reader: SessionReader,
    pub(crate) writer: SessionWriter,
    pub(crate) endpoint: Endpoint,
    pub(crate) session_present: bool,
}

async fn handshake(
    shared: &Shared,
    connector: &dyn Connector,
    endpoint: &Endpoint,
) -> Result<Established> {
    let stream = connector.connect(endpoint).await?;
    let (read, write) = tokio::io::split(stream);
    let mut reader = PacketReader::new(read);
    let mut writer = PacketWriter::new(write);

    let conn = &shared.settings.connection;
    writer
        .send(&Packet::Connect(Connect {
            client_id: conn.client_id.clone(),
            keep_alive: conn.keep_alive_secs,
            clean_session: conn.clean_session,
            username: conn.username.clone(),
            password: conn.password.clone(),
        }))
        .await?;

    match reader.next().await? {
        Some(Packet::ConnAck(ack)) if ack.code == ConnectReturnCode::Accepted => Ok(Established {
            reader,
            writer,
            endpoint: endpoint.clone(),
            session_present: ack.session_present,
        }),
        Some(Packet::ConnAck(ack)) => Err(MqttError::ConnectRefused(ack.code)),
        Some(other) => Err(MqttError::protocol(format!(
            "expected CONNACK, got {}",
            other.name()
        ))),
        None => Err(MqttError::ConnectionClosed),
    }
}

/// One pass over the endpoint list. The first endpoint that accepts wins;
/// otherwise the error of the last endpoint tried is returned.
pub(crate) async fn establish(
    shared: &Shared,
    connector: &dyn Connector,
    endpoints: &[Endpoint],
) -> Result<Established> {
    let timeout = shared.settings.connect_timeout();
    let mut last_error = MqttError::ConnectionClosed;

    for endpoint in endpoints {
        debug!("connecting to {endpoint}");
        match tokio::time::timeout(timeout, handshake(shared, connector, endpoint)).await {
            Ok(Ok(established)) => return Ok(established),
            Ok(Err(err)) => {
                warn!("{endpoint}: {err}");
                last_error = err;
            }
            Err(_) => {
                let err = MqttError::ConnectTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                };
                warn!("{endpoint}: {err}");
                last_error = err;
            }
        }
    }
    Err(last_error)
}

/// Supervisor task body. `ready` resolves with the outcome of the initial
/// connect; the task itself runs until shutdown, until the connection is lost
/// with reconnect disabled, or until the retry budget is spent.
pub(crate) async fn supervise(
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    endpoints: Vec<Endpoint>,
    mut shutdown: watch::Receiver<bool>,
    ready: oneshot::Sender<Result<()>>,
) {
    let mut ready = Some(ready);
    let mut backoff = Backoff::from_settings(&shared.settings.reconnect);
    let mut reconnect = false;
    let mut failure = MqttError::ConnectionClosed;

    loop {
        let attempt = tokio::select! {
            result = establish(&shared, connector.as_ref(), &endpoints) => result,
            _ = shutdown.changed() => break,
        };

        let Established {
            reader,
            writer,
            endpoint,
            session_present,
        } = match attempt {
            Ok(established) => established,
            Err(err) => {
                failure = err;
                if !shared.settings.reconnect.enabled {
                    break;
                }
                let Some(delay) = backoff.next_delay() else {
                    error!(
                        "giving up after {} reconnect attempts: {failure}",
                        backoff.attempts()
                    );
                    break;
                };
                shared.set_state(ConnectionState::Reconnecting);
                info!("next connection attempt in {}ms", delay.as_millis());
                let interrupted = tokio::select! {
                    _ = tokio::time::sleep(delay) => false,
                    _ = shutdown.changed() => true,
                };
                if interrupted {
                    break;
                }
                continue;
            }
        };

        backoff.reset();
        info!("connected to {endpoint} (session present: {session_present})");
        shared
            .notify_connected(reconnect, endpoint.uri.clone())
            .await;
        reconnect = true;

        let outcome = run_session(
            &shared,
            reader,
            writer,
            session_present,
            &mut shutdown,
            || {
                shared.set_state(ConnectionState::Connected);
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Ok(()));
                }
            },
        )
        .await;

        match outcome {
            Ok(()) => break,
            Err(err) => {
                warn!("connection to {endpoint} lost: {err}");
                shared.abandon_requests();
                shared.notify_connection_lost(err.clone()).await;
                failure = err;
                if !shared.settings.reconnect.enabled {
                    break;
                }
                shared.set_state(ConnectionState::Reconnecting);
            }
        }
    }

    shared.teardown().await;
    if let Some(ready) = ready.take() {
        let _ = ready.send(Err(failure));
    }
    info!("connection supervisor stopped");
}
