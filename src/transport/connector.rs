//! Endpoint resolution and the transport seam.
//!
//! The engine never opens sockets itself. It asks a [`Connector`] for a
//! byte stream to an [`Endpoint`] and speaks MQTT over whatever comes back.
//! `TcpConnector` covers plain `tcp://` endpoints; TLS stacks plug in by
//! implementing the trait. `MemoryConnector` hands out in-process duplex
//! pipes, which is how the engine is exercised without a broker.

use std::fmt;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

use crate::utils::error::{MqttError, Result};

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn AsyncStream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Tcp,
    Tls,
    Memory,
}

impl Scheme {
    fn default_port(self) -> u16 {
        match self {
            Scheme::Tcp => 1883,
            Scheme::Tls => 8883,
            Scheme::Memory => 0,
        }
    }
}

/// One entry of the configured failover list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub uri: String,
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn parse(uri: &str) -> Result<Self> {
        let invalid = |reason: &str| MqttError::Configuration(format!("server URI '{uri}': {reason}"));

        let (scheme, rest) = uri
            .trim()
            .split_once("://")
            .ok_or_else(|| invalid("missing scheme"))?;
        let scheme = match scheme.to_ascii_lowercase().as_str() {
            "tcp" | "mqtt" => Scheme::Tcp,
            "ssl" | "tls" | "mqtts" => Scheme::Tls,
            "memory" => Scheme::Memory,
            _ => return Err(invalid("unsupported scheme")),
        };

        let authority = rest.strip_suffix('/').unwrap_or(rest);
        if authority.contains('/') {
            return Err(invalid("paths are not supported"));
        }

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            // [v6-address]:port
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid("unterminated IPv6 address"))?;
            let port = match tail.strip_prefix(':') {
                Some(port) => Some(port),
                None if tail.is_empty() => None,
                None => return Err(invalid("garbage after IPv6 address")),
            };
            (host, port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };

        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port = match port {
            Some(port) => port.parse::<u16>().map_err(|_| invalid("bad port"))?,
            None => scheme.default_port(),
        };

        Ok(Self {
            uri: uri.trim().to_string(),
            scheme,
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri)
    }
}

pub trait Connector: Send + Sync + 'static {
    fn connect<'a>(&'a self, endpoint: &'a Endpoint) -> BoxFuture<'a, Result<BoxedStream>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect<'a>(&'a self, endpoint: &'a Endpoint) -> BoxFuture<'a, Result<BoxedStream>> {
        Box::pin(async move {
            if endpoint.scheme != Scheme::Tcp {
                return Err(MqttError::Transport(format!(
                    "{endpoint} needs a connector that supports its scheme"
                )));
            }
            let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
            stream.set_nodelay(true)?;
            debug!("TCP connection open to {endpoint}");
            Ok(Box::new(stream) as BoxedStream)
        })
    }
}

const MEMORY_PIPE_BYTES: usize = 64 * 1024;

/// Connector that hands every connection's far end to a [`MemoryListener`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    accepted: mpsc::UnboundedSender<(Endpoint, DuplexStream)>,
}

#[derive(Debug)]
pub struct MemoryListener {
    incoming: mpsc::UnboundedReceiver<(Endpoint, DuplexStream)>,
}

impl MemoryConnector {
    pub fn new() -> (Self, MemoryListener) {
        let (accepted, incoming) = mpsc::unbounded_channel();
        (Self { accepted }, MemoryListener { incoming })
    }
}

impl Connector for MemoryConnector {
    fn connect<'a>(&'a self, endpoint: &'a Endpoint) -> BoxFuture<'a, Result<BoxedStream>> {
        Box::pin(async move {
            let (near, far) = tokio::io::duplex(MEMORY_PIPE_BYTES);
            self.accepted
                .send((endpoint.clone(), far))
                .map_err(|_| std::io::Error::from(std::io::ErrorKind::ConnectionRefused))?;
            Ok(Box::new(near) as BoxedStream)
        })
    }
}

impl MemoryListener {
    /// Wait for the next connection. `None` once every connector is dropped.
    pub async fn accept(&mut self) -> Option<(Endpoint, DuplexStream)> {
        self.incoming.recv().await
    }
}
