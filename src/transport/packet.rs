//! MQTT 3.1.1 control packets
//!
//! `Packet` is the canonical wire representation exchanged by the reader and
//! writer tasks. Encoding writes a complete frame (fixed header, remaining
//! length, variable header, payload) into a `BytesMut`. Decoding consumes one
//! complete frame from the front of a buffer and leaves partial frames
//! untouched, so it can be called again once more bytes arrive.
//!
//! Notes on fields:
//! - `packet_id`: 16-bit identifier, non-zero for every packet that carries
//!   one; a QoS 0 `Publish` uses `0` and does not put it on the wire
//! - `SubAck::return_codes`: `None` marks a `0x80` failure for that filter

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::utils::error::{ConnectReturnCode, MqttError, Result};

pub const PROTOCOL_NAME: &str = "MQTT";
pub const PROTOCOL_LEVEL: u8 = 4;
/// Largest value the four-byte remaining-length encoding can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

const CONNECT: u8 = 1;
const CONNACK: u8 = 2;
const PUBLISH: u8 = 3;
const PUBACK: u8 = 4;
const PUBREC: u8 = 5;
const PUBREL: u8 = 6;
const PUBCOMP: u8 = 7;
const SUBSCRIBE: u8 = 8;
const SUBACK: u8 = 9;
const UNSUBSCRIBE: u8 = 10;
const UNSUBACK: u8 = 11;
const PINGREQ: u8 = 12;
const PINGRESP: u8 = 13;
const DISCONNECT: u8 = 14;

const FLAG_USERNAME: u8 = 0x80;
const FLAG_PASSWORD: u8 = 0x40;
const FLAG_WILL_RETAIN: u8 = 0x20;
const FLAG_WILL: u8 = 0x04;
const FLAG_CLEAN_SESSION: u8 = 0x02;
const SUBACK_FAILURE: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = MqttError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(MqttError::protocol(format!("invalid QoS level {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub client_id: String,
    pub keep_alive: u16,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub code: ConnectReturnCode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    pub packet_id: u16,
}

impl Publish {
    /// Size of the frame body: topic, packet id when QoS > 0, payload.
    pub fn remaining_length(&self) -> usize {
        let packet_id = if self.qos == QoS::AtMostOnce { 0 } else { 2 };
        2 + self.topic.len() + packet_id + self.payload.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub filters: Vec<(String, QoS)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub packet_id: u16,
    pub return_codes: Vec<Option<QoS>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub filters: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(u16),
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(u16),
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::ConnAck(_) => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::PubAck(_) => "PUBACK",
            Packet::PubRec(_) => "PUBREC",
            Packet::PubRel(_) => "PUBREL",
            Packet::PubComp(_) => "PUBCOMP",
            Packet::Subscribe(_) => "SUBSCRIBE",
            Packet::SubAck(_) => "SUBACK",
            Packet::Unsubscribe(_) => "UNSUBSCRIBE",
            Packet::UnsubAck(_) => "UNSUBACK",
            Packet::PingReq => "PINGREQ",
            Packet::PingResp => "PINGRESP",
            Packet::Disconnect => "DISCONNECT",
        }
    }

    /// Append one complete frame to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        let mut body = BytesMut::new();
        let header = match self {
            Packet::Connect(connect) => {
                write_string(&mut body, PROTOCOL_NAME)?;
                body.put_u8(PROTOCOL_LEVEL);
                let mut flags = 0u8;
                if connect.clean_session {
                    flags |= FLAG_CLEAN_SESSION;
                }
                if connect.username.is_some() {
                    flags |= FLAG_USERNAME;
                }
                if connect.password.is_some() {
                    flags |= FLAG_PASSWORD;
                }
                body.put_u8(flags);
                body.put_u16(connect.keep_alive);
                write_string(&mut body, &connect.client_id)?;
                if let Some(username) = &connect.username {
                    write_string(&mut body, username)?;
                }
                if let Some(password) = &connect.password {
                    write_binary(&mut body, password.as_bytes())?;
                }
                CONNECT << 4
            }
            Packet::ConnAck(ack) => {
                body.put_u8(u8::from(ack.session_present));
                body.put_u8(ack.code.into());
                CONNACK << 4
            }
            Packet::Publish(publish) => {
                write_string(&mut body, &publish.topic)?;
                if publish.qos != QoS::AtMostOnce {
                    if publish.packet_id == 0 {
                        return Err(MqttError::protocol("QoS > 0 PUBLISH needs a packet id"));
                    }
                    body.put_u16(publish.packet_id);
                }
                body.put_slice(&publish.payload);
                let mut header = PUBLISH << 4 | (publish.qos as u8) << 1;
                if publish.dup {
                    header |= 0x08;
                }
                if publish.retain {
                    header |= 0x01;
                }
                header
            }
            Packet::PubAck(id) => {
                body.put_u16(*id);
                PUBACK << 4
            }
            Packet::PubRec(id) => {
                body.put_u16(*id);
                PUBREC << 4
            }
            Packet::PubRel(id) => {
                body.put_u16(*id);
                PUBREL << 4 | 0x02
            }
            Packet::PubComp(id) => {
                body.put_u16(*id);
                PUBCOMP << 4
            }
            Packet::Subscribe(subscribe) => {
                if subscribe.filters.is_empty() {
                    return Err(MqttError::protocol("SUBSCRIBE without filters"));
                }
                body.put_u16(subscribe.packet_id);
                for (filter, qos) in &subscribe.filters {
                    write_string(&mut body, filter)?;
                    body.put_u8(*qos as u8);
                }
                SUBSCRIBE << 4 | 0x02
            }
            Packet::SubAck(ack) => {
                body.put_u16(ack.packet_id);
                for code in &ack.return_codes {
                    body.put_u8(code.map(|q| q as u8).unwrap_or(SUBACK_FAILURE));
                }
                SUBACK << 4
            }
            Packet::Unsubscribe(unsubscribe) => {
                if unsubscribe.filters.is_empty() {
                    return Err(MqttError::protocol("UNSUBSCRIBE without filters"));
                }
                body.put_u16(unsubscribe.packet_id);
                for filter in &unsubscribe.filters {
                    write_string(&mut body, filter)?;
                }
                UNSUBSCRIBE << 4 | 0x02
            }
            Packet::UnsubAck(id) => {
                body.put_u16(*id);
                UNSUBACK << 4
            }
            Packet::PingReq => PINGREQ << 4,
            Packet::PingResp => PINGRESP << 4,
            Packet::Disconnect => DISCONNECT << 4,
        };

        buf.reserve(body.len() + 5);
        buf.put_u8(header);
        write_remaining_length(buf, body.len())?;
        buf.extend_from_slice(&body);
        Ok(())
    }

    /// Take one complete frame off the front of `buf`.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a whole frame.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Packet>> {
        if buf.len() < 2 {
            return Ok(None);
        }
        let Some((remaining, len_bytes)) = read_remaining_length(&buf[1..])? else {
            return Ok(None);
        };
        let frame_len = 1 + len_bytes + remaining;
        if buf.len() < frame_len {
            return Ok(None);
        }

        let mut frame = buf.split_to(frame_len).freeze();
        let header = frame.get_u8();
        frame.advance(len_bytes);
        parse(header, frame).map(Some)
    }
}

fn parse(header: u8, mut body: Bytes) -> Result<Packet> {
    let kind = header >> 4;
    let flags = header & 0x0F;

    let packet = match kind {
        CONNECT => {
            let name = read_string(&mut body)?;
            if name != PROTOCOL_NAME {
                return Err(MqttError::protocol(format!("unknown protocol name '{name}'")));
            }
            let level = read_u8(&mut body)?;
            if level != PROTOCOL_LEVEL {
                return Err(MqttError::protocol(format!("unsupported protocol level {level}")));
            }
            let connect_flags = read_u8(&mut body)?;
            let keep_alive = read_u16(&mut body)?;
            let client_id = read_string(&mut body)?;
            if connect_flags & FLAG_WILL != 0 {
                read_string(&mut body)?;
                read_binary(&mut body)?;
            } else if connect_flags & (FLAG_WILL_RETAIN | 0x18) != 0 {
                return Err(MqttError::protocol("will flags set without a will"));
            }
            let username = if connect_flags & FLAG_USERNAME != 0 {
                Some(read_string(&mut body)?)
            } else {
                None
            };
            let password = if connect_flags & FLAG_PASSWORD != 0 {
                let raw = read_binary(&mut body)?;
                Some(
                    String::from_utf8(raw.to_vec())
                        .map_err(|_| MqttError::protocol("password is not UTF-8"))?,
                )
            } else {
                None
            };
            Packet::Connect(Connect {
                client_id,
                keep_alive,
                clean_session: connect_flags & FLAG_CLEAN_SESSION != 0,
                username,
                password,
            })
        }
        CONNACK => {
            expect_len(&body, 2, "CONNACK")?;
            let ack_flags = read_u8(&mut body)?;
            let code = read_u8(&mut body)?;
            Packet::ConnAck(ConnAck {
                session_present: ack_flags & 0x01 != 0,
                code: ConnectReturnCode::from(code),
            })
        }
        PUBLISH => {
            let qos = QoS::try_from((flags >> 1) & 0x03)?;
            let topic = read_string(&mut body)?;
            let packet_id = if qos == QoS::AtMostOnce {
                0
            } else {
                let id = read_u16(&mut body)?;
                if id == 0 {
                    return Err(MqttError::protocol("PUBLISH with packet id 0"));
                }
                id
            };
            Packet::Publish(Publish {
                topic,
                payload: body,
                qos,
                retain: flags & 0x01 != 0,
                dup: flags & 0x08 != 0,
                packet_id,
            })
        }
        PUBACK => Packet::PubAck(read_ack(&mut body, "PUBACK")?),
        PUBREC => Packet::PubRec(read_ack(&mut body, "PUBREC")?),
        PUBREL => {
            if flags != 0x02 {
                return Err(MqttError::protocol("PUBREL with bad header flags"));
            }
            Packet::PubRel(read_ack(&mut body, "PUBREL")?)
        }
        PUBCOMP => Packet::PubComp(read_ack(&mut body, "PUBCOMP")?),
        SUBSCRIBE => {
            let packet_id = read_u16(&mut body)?;
            let mut filters = Vec::new();
            while body.has_remaining() {
                let filter = read_string(&mut body)?;
                let qos = QoS::try_from(read_u8(&mut body)?)?;
                filters.push((filter, qos));
            }
            if filters.is_empty() {
                return Err(MqttError::protocol("SUBSCRIBE without filters"));
            }
            Packet::Subscribe(Subscribe { packet_id, filters })
        }
        SUBACK => {
            let packet_id = read_u16(&mut body)?;
            let mut return_codes = Vec::with_capacity(body.remaining());
            while body.has_remaining() {
                let code = body.get_u8();
                return_codes.push(if code == SUBACK_FAILURE {
                    None
                } else {
                    Some(QoS::try_from(code)?)
                });
            }
            Packet::SubAck(SubAck {
                packet_id,
                return_codes,
            })
        }
        UNSUBSCRIBE => {
            let packet_id = read_u16(&mut body)?;
            let mut filters = Vec::new();
            while body.has_remaining() {
                filters.push(read_string(&mut body)?);
            }
            if filters.is_empty() {
                return Err(MqttError::protocol("UNSUBSCRIBE without filters"));
            }
            Packet::Unsubscribe(Unsubscribe { packet_id, filters })
        }
        UNSUBACK => Packet::UnsubAck(read_ack(&mut body, "UNSUBACK")?),
        PINGREQ => Packet::PingReq,
        PINGRESP => Packet::PingResp,
        DISCONNECT => Packet::Disconnect,
        other => {
            return Err(MqttError::protocol(format!("unknown packet type {other}")));
        }
    };
    Ok(packet)
}

/// Encode `len` with the 7-bits-per-byte continuation scheme.
pub(crate) fn write_remaining_length(buf: &mut BytesMut, mut len: usize) -> Result<()> {
    if len > MAX_REMAINING_LENGTH {
        return Err(MqttError::protocol(format!("frame of {len} bytes is too large")));
    }
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if len == 0 {
            return Ok(());
        }
    }
}

/// Returns the decoded length and how many bytes encoded it, or `None` if
/// the encoding is still incomplete.
pub(crate) fn read_remaining_length(bytes: &[u8]) -> Result<Option<(usize, usize)>> {
    let mut value = 0usize;
    let mut multiplier = 1usize;
    for (i, byte) in bytes.iter().enumerate() {
        if i == 4 {
            return Err(MqttError::protocol("remaining length longer than 4 bytes"));
        }
        value += (*byte as usize & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        multiplier *= 128;
    }
    if bytes.len() >= 4 {
        return Err(MqttError::protocol("remaining length longer than 4 bytes"));
    }
    Ok(None)
}

fn write_string(buf: &mut BytesMut, s: &str) -> Result<()> {
    write_binary(buf, s.as_bytes())
}

fn write_binary(buf: &mut BytesMut, data: &[u8]) -> Result<()> {
    let len = u16::try_from(data.len())
        .map_err(|_| MqttError::protocol("field longer than 65535 bytes"))?;
    buf.put_u16(len);
    buf.put_slice(data);
    Ok(())
}

fn read_u8(buf: &mut Bytes) -> Result<u8> {
    if !buf.has_remaining() {
        return Err(MqttError::protocol("truncated packet"));
    }
    Ok(buf.get_u8())
}

fn read_u16(buf: &mut Bytes) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(MqttError::protocol("truncated packet"));
    }
    Ok(buf.get_u16())
}

fn read_binary(buf: &mut Bytes) -> Result<Bytes> {
    let len = read_u16(buf)? as usize;
    if buf.remaining() < len {
        return Err(MqttError::protocol("truncated packet"));
    }
    Ok(buf.split_to(len))
}

fn read_string(buf: &mut Bytes) -> Result<String> {
    let raw = read_binary(buf)?;
    String::from_utf8(raw.to_vec()).map_err(|_| MqttError::protocol("string is not UTF-8"))
}

fn read_ack(buf: &mut Bytes, name: &str) -> Result<u16> {
    expect_len(buf, 2, name)?;
    read_u16(buf)
}

fn expect_len(buf: &Bytes, len: usize, name: &str) -> Result<()> {
    if buf.remaining() != len {
        return Err(MqttError::protocol(format!(
            "{name} must have {len} bytes, got {}",
            buf.remaining()
        )));
    }
    Ok(())
}
