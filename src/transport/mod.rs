//! The `transport` module owns everything between the engine and the bytes
//! on the wire.
//!
//! - `packet`: MQTT 3.1.1 control packets and their codec.
//! - `framed`: packet reader/writer over split stream halves.
//! - `connector`: endpoint parsing and the pluggable `Connector` seam.

pub mod connector;
pub mod framed;
pub mod packet;

pub use connector::{BoxedStream, Connector, Endpoint, MemoryConnector, MemoryListener, Scheme, TcpConnector};
pub use framed::{PacketReader, PacketWriter};
pub use packet::{Packet, QoS};
