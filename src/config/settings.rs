use std::time::Duration;

use serde::Deserialize;

use crate::transport::connector::{Endpoint, Scheme};
use crate::transport::packet::QoS;
use crate::utils::error::MqttError;

/// Longest client identifier accepted.
pub const MAX_CLIENT_ID_LEN: usize = 64;

/// Top-level configuration for one client instance.
///
/// Groups the connection options, delivery policy, reconnect policy and
/// dispatch sizing. Every client owns its own copy; nothing here is global.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub connection: ConnectionSettings,
    pub delivery: DeliverySettings,
    pub reconnect: ReconnectSettings,
    pub dispatch: DispatchSettings,
}

/// Where and as whom to connect.
///
/// `server_uris` is an ordered failover list and the only source of
/// endpoints.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ConnectionSettings {
    pub server_uris: Vec<String>,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub clean_session: bool,
    pub keep_alive_secs: u16,
    pub connect_timeout_ms: u64,
}

/// QoS defaults, blocking mode and the retransmission budget.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct DeliverySettings {
    pub default_qos: u8,
    pub completion_timeout_ms: u64,
    #[serde(rename = "async")]
    pub async_mode: bool,
    pub retry_interval_ms: u64,
    pub max_attempts: u32,
}

/// Automatic reconnect with exponential backoff.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ReconnectSettings {
    pub enabled: bool,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    pub resubscribe: bool,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct DispatchSettings {
    pub worker_pool_size: usize,
    pub queue_capacity: usize,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values are filled from
/// `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub connection: Option<PartialConnectionSettings>,
    pub delivery: Option<PartialDeliverySettings>,
    pub reconnect: Option<PartialReconnectSettings>,
    pub dispatch: Option<PartialDispatchSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialConnectionSettings {
    pub server_uris: Option<Vec<String>>,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub clean_session: Option<bool>,
    pub keep_alive_secs: Option<u16>,
    pub connect_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialDeliverySettings {
    pub default_qos: Option<u8>,
    pub completion_timeout_ms: Option<u64>,
    #[serde(rename = "async")]
    pub async_mode: Option<bool>,
    pub retry_interval_ms: Option<u64>,
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialReconnectSettings {
    pub enabled: Option<bool>,
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub backoff_factor: Option<f64>,
    pub max_attempts: Option<u32>,
    pub resubscribe: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialDispatchSettings {
    pub worker_pool_size: Option<usize>,
    pub queue_capacity: Option<usize>,
}

/// Provides default values for `Settings`.
///
/// There is no default endpoint: `validate` rejects an empty
/// list.
impl Default for Settings {
    fn default() -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self {
            connection: ConnectionSettings {
                server_uris: Vec::new(),
                client_id: format!("mqtt-engine-{}", &suffix[..8]),
                username: None,
                password: None,
                clean_session: true,
                keep_alive_secs: 60,
                connect_timeout_ms: 30_000,
            },
            delivery: DeliverySettings {
                default_qos: 1,
                completion_timeout_ms: 5_000,
                async_mode: false,
                retry_interval_ms: 10_000,
                max_attempts: 3,
            },
            reconnect: ReconnectSettings {
                enabled: true,
                initial_delay_ms: 1_000,
                max_delay_ms: 120_000,
                backoff_factor: 2.0,
                max_attempts: None,
                resubscribe: true,
            },
            dispatch: DispatchSettings {
                worker_pool_size: 4,
                queue_capacity: 64,
            },
        }
    }
}

impl PartialSettings {
    /// Overlay whatever was provided onto `base`.
    pub fn merge_into(self, base: Settings) -> Settings {
        let connection = self.connection.unwrap_or_default();
        let delivery = self.delivery.unwrap_or_default();
        let reconnect = self.reconnect.unwrap_or_default();
        let dispatch = self.dispatch.unwrap_or_default();

        Settings {
            connection: ConnectionSettings {
                server_uris: connection
                    .server_uris
                    .unwrap_or(base.connection.server_uris),
                client_id: connection.client_id.unwrap_or(base.connection.client_id),
                username: connection.username.or(base.connection.username),
                password: connection.password.or(base.connection.password),
                clean_session: connection
                    .clean_session
                    .unwrap_or(base.connection.clean_session),
                keep_alive_secs: connection
                    .keep_alive_secs
                    .unwrap_or(base.connection.keep_alive_secs),
                connect_timeout_ms: connection
                    .connect_timeout_ms
                    .unwrap_or(base.connection.connect_timeout_ms),
            },
            delivery: DeliverySettings {
                default_qos: delivery.default_qos.unwrap_or(base.delivery.default_qos),
                completion_timeout_ms: delivery
                    .completion_timeout_ms
                    .unwrap_or(base.delivery.completion_timeout_ms),
                async_mode: delivery.async_mode.unwrap_or(base.delivery.async_mode),
                retry_interval_ms: delivery
                    .retry_interval_ms
                    .unwrap_or(base.delivery.retry_interval_ms),
                max_attempts: delivery.max_attempts.unwrap_or(base.delivery.max_attempts),
            },
            reconnect: ReconnectSettings {
                enabled: reconnect.enabled.unwrap_or(base.reconnect.enabled),
                initial_delay_ms: reconnect
                    .initial_delay_ms
                    .unwrap_or(base.reconnect.initial_delay_ms),
                max_delay_ms: reconnect.max_delay_ms.unwrap_or(base.reconnect.max_delay_ms),
                backoff_factor: reconnect
                    .backoff_factor
                    .unwrap_or(base.reconnect.backoff_factor),
                max_attempts: reconnect.max_attempts.or(base.reconnect.max_attempts),
                resubscribe: reconnect.resubscribe.unwrap_or(base.reconnect.resubscribe),
            },
            dispatch: DispatchSettings {
                worker_pool_size: dispatch
                    .worker_pool_size
                    .unwrap_or(base.dispatch.worker_pool_size),
                queue_capacity: dispatch
                    .queue_capacity
                    .unwrap_or(base.dispatch.queue_capacity),
            },
        }
    }
}

impl Settings {
    /// Check everything `connect` relies on. Failures are
    /// `MqttError::Configuration` and are never retried.
    pub fn validate(&self) -> Result<(), MqttError> {
        let fail = |msg: &str| Err(MqttError::Configuration(msg.to_string()));

        let endpoints = self.endpoints()?;
        if endpoints.is_empty() {
            return fail("at least one server URI is required");
        }
        if endpoints.iter().any(|e| e.scheme == Scheme::Memory)
            && endpoints.iter().any(|e| e.scheme != Scheme::Memory)
        {
            return fail("memory:// endpoints cannot be mixed with network endpoints");
        }

        let conn = &self.connection;
        if conn.client_id.chars().count() > MAX_CLIENT_ID_LEN {
            return Err(MqttError::Configuration(format!(
                "client id is longer than {MAX_CLIENT_ID_LEN} characters"
            )));
        }
        if conn.client_id.is_empty() && !conn.clean_session {
            return fail("an empty client id requires clean_session = true");
        }
        if conn.password.is_some() && conn.username.is_none() {
            return fail("a password requires a username");
        }
        if conn.connect_timeout_ms == 0 {
            return fail("connect_timeout_ms must be positive");
        }

        self.default_qos()?;
        let delivery = &self.delivery;
        if delivery.retry_interval_ms == 0 {
            return fail("retry_interval_ms must be positive");
        }
        if delivery.max_attempts == 0 {
            return fail("delivery.max_attempts must be at least 1");
        }
        if delivery.completion_timeout_ms == 0 {
            return fail("completion_timeout_ms must be positive");
        }

        let reconnect = &self.reconnect;
        if reconnect.backoff_factor < 1.0 || !reconnect.backoff_factor.is_finite() {
            return fail("backoff_factor must be a finite number >= 1.0");
        }
        if reconnect.max_attempts == Some(0) {
            return fail("reconnect.max_attempts must be at least 1 when set");
        }
        if reconnect.initial_delay_ms > reconnect.max_delay_ms {
            return fail("initial_delay_ms must not exceed max_delay_ms");
        }

        if self.dispatch.worker_pool_size == 0 {
            return fail("worker_pool_size must be at least 1");
        }
        if self.dispatch.queue_capacity == 0 {
            return fail("queue_capacity must be at least 1");
        }
        Ok(())
    }

    pub fn endpoints(&self) -> Result<Vec<Endpoint>, MqttError> {
        self.connection
            .server_uris
            .iter()
            .map(|uri| Endpoint::parse(uri))
            .collect()
    }

    pub fn default_qos(&self) -> Result<QoS, MqttError> {
        QoS::try_from(self.delivery.default_qos).map_err(|_| {
            MqttError::Configuration(format!(
                "default_qos must be 0, 1 or 2, got {}",
                self.delivery.default_qos
            ))
        })
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(u64::from(self.connection.keep_alive_secs))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connection.connect_timeout_ms)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery.completion_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.delivery.retry_interval_ms)
    }
}
