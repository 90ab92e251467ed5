//! MQTT wire codec for protocol levels 3, 4 (3.1.1) and 5.
//!
//! Every control packet is framed the same way:
//! ```text
//! [type:4 | flags:4][remaining length: 1-4 byte varint][variable header + payload]
//! ```
//! Multi-byte integers are big-endian; strings are a `u16` length followed by
//! UTF-8 bytes.  MQTT 5 adds a varint-prefixed property section to most
//! variable headers and per-item reason codes to the acknowledgements.
//!
//! A CONNECT carries its own protocol level, so it decodes under any
//! [`ProtocolVersion`]; every other packet is read in the dialect the
//! connection's CONNECT selected.
//!
//! [`decode_packet_with`] works on a growing buffer: it returns `Ok(None)`
//! until a whole packet is present and only then removes that packet's bytes.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::packet::{
    ConnAck, Connect, ConnectReturnCode, MqttPacket, Properties, ProtocolVersion, Publish, QoS,
    SubAck, Subscribe, SubscribeFilter, SubscribeReasonCode, UnsubAck, Unsubscribe,
    UnsubscribeReasonCode,
};

/// Largest value a remaining-length varint can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Errors produced while encoding or decoding MQTT packets.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// The fixed header announces a packet larger than the configured limit.
    #[error("packet of {size} bytes exceeds the limit of {max}")]
    PacketTooLarge { size: usize, max: usize },

    /// The remaining-length varint runs past four bytes.
    #[error("malformed remaining length")]
    MalformedRemainingLength,

    /// Packet type 0 or 15.
    #[error("unknown packet type: {0}")]
    UnknownPacketType(u8),

    /// Fixed-header flags do not match the packet type.
    #[error("invalid flags 0x{flags:X} for {packet}")]
    InvalidFlags { packet: &'static str, flags: u8 },

    /// A CONNECT naming a protocol or level other than MQTT 3.1, 3.1.1 or 5.
    #[error("unsupported protocol {name:?} level {level}")]
    UnsupportedProtocol { name: String, level: u8 },

    #[error("invalid QoS: {0}")]
    InvalidQoS(u8),

    /// Any other structural problem in the variable header or payload.
    #[error("malformed packet: {0}")]
    Malformed(String),
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Decodes one MQTT 3.1.1 packet from the front of `buf`.
///
/// Shorthand for [`decode_packet_with`] and [`ProtocolVersion::V3`].
///
/// # Examples
///
/// ```rust
/// use bytes::BytesMut;
/// use devlink_core::mqtt::{decode_packet, MqttPacket};
///
/// let mut buf = BytesMut::from(&[0xC0, 0x00, 0xE0][..]);
/// assert_eq!(decode_packet(&mut buf, 1024).unwrap(), Some(MqttPacket::PingReq));
/// assert_eq!(decode_packet(&mut buf, 1024).unwrap(), None);
/// assert_eq!(buf.len(), 1);
/// ```
pub fn decode_packet(
    buf: &mut BytesMut,
    max_packet_size: usize,
) -> Result<Option<MqttPacket>, CodecError> {
    decode_packet_with(buf, max_packet_size, ProtocolVersion::V3)
}

/// Decodes one packet of the given dialect from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` does not hold a whole packet yet; nothing is
/// removed in that case.  On success exactly one packet's bytes are removed.
///
/// # Errors
///
/// Returns [`CodecError`] when the bytes can never form a valid packet or the
/// packet is larger than `max_packet_size` (fixed header included).  The
/// offending packet's bytes are consumed whenever its length was known.
pub fn decode_packet_with(
    buf: &mut BytesMut,
    max_packet_size: usize,
    version: ProtocolVersion,
) -> Result<Option<MqttPacket>, CodecError> {
    let Some((remaining, varint_len)) = read_remaining_length(buf)? else {
        return Ok(None);
    };

    let header_len = 1 + varint_len;
    let size = header_len + remaining;
    if size > max_packet_size {
        return Err(CodecError::PacketTooLarge {
            size,
            max: max_packet_size,
        });
    }
    if buf.len() < size {
        return Ok(None);
    }

    let frame = buf.split_to(size).freeze();
    let first = frame[0];
    let body = frame.slice(header_len..);
    parse_packet(first >> 4, first & 0x0F, body, version).map(Some)
}

/// Appends the MQTT 3.1.1 wire form of `packet` to `buf`.
///
/// Shorthand for [`encode_packet_with`] and [`ProtocolVersion::V3`].
pub fn encode_packet(packet: &MqttPacket, buf: &mut BytesMut) -> Result<usize, CodecError> {
    encode_packet_with(packet, buf, ProtocolVersion::V3)
}

/// Appends the wire form of `packet` in the given dialect to `buf` and
/// returns the number of bytes written.
///
/// A CONNECT is always written in the dialect of its own `protocol_level`.
/// Properties and UNSUBACK reason codes are dropped on a 3.1.1 wire.
///
/// # Errors
///
/// Returns [`CodecError::Malformed`] when a field cannot be represented on
/// the wire (a string over 65,535 bytes, a QoS > 0 PUBLISH with packet id 0,
/// a packet over [`MAX_REMAINING_LENGTH`]).
pub fn encode_packet_with(
    packet: &MqttPacket,
    buf: &mut BytesMut,
    version: ProtocolVersion,
) -> Result<usize, CodecError> {
    let v5 = version == ProtocolVersion::V5;
    let mut body = BytesMut::new();
    let first = match packet {
        MqttPacket::Connect(connect) => {
            write_connect(connect, &mut body)?;
            0x10
        }
        MqttPacket::ConnAck(ack) => {
            body.put_u8(u8::from(ack.session_present));
            body.put_u8(ack.code.wire_code(version));
            if v5 {
                write_properties(&ack.properties, &mut body)?;
            }
            0x20
        }
        MqttPacket::Publish(publish) => {
            write_string(&publish.topic, &mut body)?;
            if publish.qos != QoS::AtMostOnce {
                if publish.pkid == 0 {
                    return Err(CodecError::Malformed(
                        "QoS > 0 publish needs a non-zero packet id".into(),
                    ));
                }
                body.put_u16(publish.pkid);
            }
            if v5 {
                write_properties(&publish.properties, &mut body)?;
            }
            body.put_slice(&publish.payload);
            0x30 | (u8::from(publish.dup) << 3) | (publish.qos.as_u8() << 1) | u8::from(publish.retain)
        }
        MqttPacket::PubAck(pkid) => {
            body.put_u16(*pkid);
            0x40
        }
        MqttPacket::PubRec(pkid) => {
            body.put_u16(*pkid);
            0x50
        }
        MqttPacket::PubRel(pkid) => {
            body.put_u16(*pkid);
            0x62
        }
        MqttPacket::PubComp(pkid) => {
            body.put_u16(*pkid);
            0x70
        }
        MqttPacket::Subscribe(subscribe) => {
            body.put_u16(subscribe.pkid);
            if v5 {
                write_varint(0, &mut body);
            }
            for filter in &subscribe.filters {
                write_string(&filter.path, &mut body)?;
                body.put_u8(filter.qos.as_u8());
            }
            0x82
        }
        MqttPacket::SubAck(ack) => {
            body.put_u16(ack.pkid);
            if v5 {
                write_varint(0, &mut body);
            }
            for code in &ack.codes {
                body.put_u8(code.wire_code(version));
            }
            0x90
        }
        MqttPacket::Unsubscribe(unsubscribe) => {
            body.put_u16(unsubscribe.pkid);
            if v5 {
                write_varint(0, &mut body);
            }
            for topic in &unsubscribe.topics {
                write_string(topic, &mut body)?;
            }
            0xA2
        }
        MqttPacket::UnsubAck(ack) => {
            body.put_u16(ack.pkid);
            if v5 {
                write_varint(0, &mut body);
                for code in &ack.codes {
                    body.put_u8(code.code());
                }
            }
            0xB0
        }
        MqttPacket::PingReq => 0xC0,
        MqttPacket::PingResp => 0xD0,
        MqttPacket::Disconnect => 0xE0,
    };

    if body.len() > MAX_REMAINING_LENGTH {
        return Err(CodecError::Malformed(format!(
            "{} body of {} bytes is too large",
            packet.name(),
            body.len()
        )));
    }

    let start = buf.len();
    buf.put_u8(first);
    write_varint(body.len(), buf);
    buf.put_slice(&body);
    Ok(buf.len() - start)
}

// ── Fixed header ──────────────────────────────────────────────────────────────

/// Reads the remaining-length varint that follows the first byte.
///
/// Returns `(value, varint bytes)` or `None` when the varint is incomplete.
fn read_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>, CodecError> {
    let mut value = 0usize;
    for (i, byte) in buf.iter().skip(1).take(4).enumerate() {
        value |= usize::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if buf.len() >= 5 {
        return Err(CodecError::MalformedRemainingLength);
    }
    Ok(None)
}

/// Variable byte integer, used for the remaining length and MQTT 5 property
/// lengths.
fn write_varint(mut value: usize, buf: &mut BytesMut) {
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

// ── Decoding ──────────────────────────────────────────────────────────────────

fn parse_packet(
    packet_type: u8,
    flags: u8,
    body: Bytes,
    version: ProtocolVersion,
) -> Result<MqttPacket, CodecError> {
    let expect_flags = |packet: &'static str, expected: u8| {
        if flags == expected {
            Ok(())
        } else {
            Err(CodecError::InvalidFlags { packet, flags })
        }
    };
    let v5 = version == ProtocolVersion::V5;

    let mut r = BodyReader::new(&body);
    let packet = match packet_type {
        1 => {
            expect_flags("CONNECT", 0)?;
            MqttPacket::Connect(parse_connect(&mut r)?)
        }
        2 => {
            expect_flags("CONNACK", 0)?;
            let ack_flags = r.u8()?;
            let raw = r.u8()?;
            let code = match version {
                ProtocolVersion::V3 => ConnectReturnCode::from_code(raw),
                ProtocolVersion::V5 => ConnectReturnCode::from_reason_code(raw),
            }
            .ok_or_else(|| CodecError::Malformed(format!("unknown CONNACK code {raw}")))?;
            let properties = if v5 && !r.is_empty() {
                r.properties()?
            } else {
                Properties::default()
            };
            MqttPacket::ConnAck(ConnAck {
                code,
                session_present: ack_flags & 0x01 != 0,
                properties,
            })
        }
        3 => return parse_publish(flags, &body, version),
        // MQTT 5 may append a reason code and properties to the four
        // acknowledgements; only the packet id matters here.
        4 => {
            expect_flags("PUBACK", 0)?;
            MqttPacket::PubAck(r.u16()?)
        }
        5 => {
            expect_flags("PUBREC", 0)?;
            MqttPacket::PubRec(r.u16()?)
        }
        6 => {
            expect_flags("PUBREL", 0b0010)?;
            MqttPacket::PubRel(r.u16()?)
        }
        7 => {
            expect_flags("PUBCOMP", 0)?;
            MqttPacket::PubComp(r.u16()?)
        }
        8 => {
            expect_flags("SUBSCRIBE", 0b0010)?;
            let pkid = r.packet_id("SUBSCRIBE")?;
            if v5 {
                r.properties()?;
            }
            let mut filters = Vec::new();
            while !r.is_empty() {
                let path = r.string()?;
                let raw = r.u8()?;
                let qos = QoS::from_u8(raw & 0x03).ok_or(CodecError::InvalidQoS(raw))?;
                filters.push(SubscribeFilter::new(path, qos));
            }
            if filters.is_empty() {
                return Err(CodecError::Malformed("SUBSCRIBE without filters".into()));
            }
            MqttPacket::Subscribe(Subscribe { pkid, filters })
        }
        9 => {
            expect_flags("SUBACK", 0)?;
            let pkid = r.u16()?;
            if v5 {
                r.properties()?;
            }
            let mut codes = Vec::new();
            while !r.is_empty() {
                codes.push(SubscribeReasonCode::from_wire_code(r.u8()?, version));
            }
            MqttPacket::SubAck(SubAck { pkid, codes })
        }
        10 => {
            expect_flags("UNSUBSCRIBE", 0b0010)?;
            let pkid = r.packet_id("UNSUBSCRIBE")?;
            if v5 {
                r.properties()?;
            }
            let mut topics = Vec::new();
            while !r.is_empty() {
                topics.push(r.string()?);
            }
            if topics.is_empty() {
                return Err(CodecError::Malformed("UNSUBSCRIBE without topics".into()));
            }
            MqttPacket::Unsubscribe(Unsubscribe { pkid, topics })
        }
        11 => {
            expect_flags("UNSUBACK", 0)?;
            let pkid = r.u16()?;
            let mut codes = Vec::new();
            if v5 {
                r.properties()?;
                while !r.is_empty() {
                    codes.push(UnsubscribeReasonCode::from_code(r.u8()?));
                }
            }
            MqttPacket::UnsubAck(UnsubAck { pkid, codes })
        }
        12 => {
            expect_flags("PINGREQ", 0)?;
            MqttPacket::PingReq
        }
        13 => {
            expect_flags("PINGRESP", 0)?;
            MqttPacket::PingResp
        }
        // An MQTT 5 DISCONNECT may carry a reason code and properties.
        14 => {
            expect_flags("DISCONNECT", 0)?;
            MqttPacket::Disconnect
        }
        other => return Err(CodecError::UnknownPacketType(other)),
    };
    Ok(packet)
}

fn parse_connect(r: &mut BodyReader<'_>) -> Result<Connect, CodecError> {
    let name = r.string()?;
    let level = r.u8()?;
    let Some(version) = ProtocolVersion::from_connect(&name, level) else {
        return Err(CodecError::UnsupportedProtocol { name, level });
    };
    let v5 = version == ProtocolVersion::V5;

    let connect_flags = r.u8()?;
    if connect_flags & 0x01 != 0 {
        return Err(CodecError::Malformed("reserved CONNECT flag is set".into()));
    }
    let keep_alive = r.u16()?;
    let properties = if v5 { r.properties()? } else { Properties::default() };
    let client_id = r.string()?;

    if connect_flags & 0x04 != 0 {
        let will_qos = (connect_flags >> 3) & 0x03;
        QoS::from_u8(will_qos).ok_or(CodecError::InvalidQoS(will_qos))?;
        if v5 {
            r.properties()?;
        }
        let _will_topic = r.string()?;
        let _will_message = r.binary()?;
    }
    let username = if connect_flags & 0x80 != 0 {
        Some(r.string()?)
    } else {
        None
    };
    let password = if connect_flags & 0x40 != 0 {
        Some(Bytes::copy_from_slice(r.binary()?))
    } else {
        None
    };

    Ok(Connect {
        protocol_level: level,
        client_id,
        keep_alive,
        clean_session: connect_flags & 0x02 != 0,
        username,
        password,
        properties,
    })
}

fn parse_publish(flags: u8, body: &Bytes, version: ProtocolVersion) -> Result<MqttPacket, CodecError> {
    let raw_qos = (flags >> 1) & 0x03;
    let qos = QoS::from_u8(raw_qos).ok_or(CodecError::InvalidQoS(raw_qos))?;
    let dup = flags & 0b1000 != 0;
    if qos == QoS::AtMostOnce && dup {
        return Err(CodecError::InvalidFlags {
            packet: "PUBLISH",
            flags,
        });
    }

    let mut r = BodyReader::new(body);
    let topic = r.string()?;
    let pkid = match qos {
        QoS::AtMostOnce => 0,
        _ => r.packet_id("PUBLISH")?,
    };
    let properties = match version {
        ProtocolVersion::V3 => Properties::default(),
        ProtocolVersion::V5 => r.properties()?,
    };
    let payload = body.slice(r.position()..);

    Ok(MqttPacket::Publish(Publish {
        topic,
        qos,
        pkid,
        retain: flags & 0b0001 != 0,
        dup,
        payload,
        properties,
    }))
}

/// Cursor over a packet body.
struct BodyReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BodyReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| CodecError::Malformed("unexpected end of packet".into()))?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Packet identifier of a packet that must carry a non-zero one.
    fn packet_id(&mut self, packet: &str) -> Result<u16, CodecError> {
        match self.u16()? {
            0 => Err(CodecError::Malformed(format!("{packet} with packet id 0"))),
            pkid => Ok(pkid),
        }
    }

    fn varint(&mut self) -> Result<usize, CodecError> {
        let mut value = 0usize;
        for i in 0..4 {
            let byte = self.u8()?;
            value |= usize::from(byte & 0x7F) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(CodecError::Malformed("variable byte integer runs past four bytes".into()))
    }

    fn binary(&mut self) -> Result<&'a [u8], CodecError> {
        let len = usize::from(self.u16()?);
        self.take(len)
    }

    fn string(&mut self) -> Result<String, CodecError> {
        let raw = self.binary()?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|e| CodecError::Malformed(format!("invalid UTF-8 string: {e}")))
    }

    fn flag(&mut self) -> Result<bool, CodecError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::Malformed(format!("boolean property value {other}"))),
        }
    }

    /// Reads an MQTT 5 property section.  Properties the model does not keep
    /// are skipped by their wire type.
    fn properties(&mut self) -> Result<Properties, CodecError> {
        let len = self.varint()?;
        let mut r = BodyReader::new(self.take(len)?);
        let mut props = Properties::default();
        while !r.is_empty() {
            match r.varint()? {
                0x11 => props.session_expiry_interval = Some(r.u32()?),
                0x1F => props.reason_string = Some(r.string()?),
                0x21 => props.receive_maximum = Some(r.u16()?),
                0x22 => props.topic_alias_maximum = Some(r.u16()?),
                0x23 => props.topic_alias = Some(r.u16()?),
                0x25 => props.retain_available = Some(r.flag()?),
                0x26 => {
                    let key = r.string()?;
                    let value = r.string()?;
                    props.user_properties.push((key, value));
                }
                0x27 => props.maximum_packet_size = Some(r.u32()?),
                0x28 => props.wildcard_subscription_available = Some(r.flag()?),
                0x29 => props.subscription_identifiers_available = Some(r.flag()?),
                0x2A => props.shared_subscription_available = Some(r.flag()?),
                0x01 | 0x17 | 0x19 | 0x24 => {
                    r.u8()?;
                }
                0x13 => {
                    r.u16()?;
                }
                0x02 | 0x18 => {
                    r.u32()?;
                }
                0x0B => {
                    r.varint()?;
                }
                0x03 | 0x08 | 0x09 | 0x12 | 0x15 | 0x16 | 0x1A | 0x1C => {
                    r.binary()?;
                }
                id => return Err(CodecError::Malformed(format!("unknown property 0x{id:02X}"))),
            }
        }
        Ok(props)
    }
}

// ── Encoding helpers ──────────────────────────────────────────────────────────

fn write_connect(connect: &Connect, body: &mut BytesMut) -> Result<(), CodecError> {
    let name = if connect.protocol_level == 3 { "MQIsdp" } else { "MQTT" };
    write_string(name, body)?;
    body.put_u8(connect.protocol_level);

    let mut flags = 0u8;
    if connect.clean_session {
        flags |= 0x02;
    }
    if connect.username.is_some() {
        flags |= 0x80;
    }
    if connect.password.is_some() {
        flags |= 0x40;
    }
    body.put_u8(flags);
    body.put_u16(connect.keep_alive);
    if connect.version() == ProtocolVersion::V5 {
        write_properties(&connect.properties, body)?;
    }
    write_string(&connect.client_id, body)?;
    if let Some(username) = &connect.username {
        write_string(username, body)?;
    }
    if let Some(password) = &connect.password {
        write_binary(password, body)?;
    }
    Ok(())
}

/// Writes an MQTT 5 property section, identifiers in ascending order.
fn write_properties(props: &Properties, body: &mut BytesMut) -> Result<(), CodecError> {
    fn put_flag(id: u8, value: Option<bool>, section: &mut BytesMut) {
        if let Some(value) = value {
            section.put_u8(id);
            section.put_u8(u8::from(value));
        }
    }

    let mut section = BytesMut::new();

    if let Some(interval) = props.session_expiry_interval {
        section.put_u8(0x11);
        section.put_u32(interval);
    }
    if let Some(reason) = &props.reason_string {
        section.put_u8(0x1F);
        write_string(reason, &mut section)?;
    }
    if let Some(max) = props.receive_maximum {
        section.put_u8(0x21);
        section.put_u16(max);
    }
    if let Some(max) = props.topic_alias_maximum {
        section.put_u8(0x22);
        section.put_u16(max);
    }
    if let Some(alias) = props.topic_alias {
        section.put_u8(0x23);
        section.put_u16(alias);
    }
    put_flag(0x25, props.retain_available, &mut section);
    for (key, value) in &props.user_properties {
        section.put_u8(0x26);
        write_string(key, &mut section)?;
        write_string(value, &mut section)?;
    }
    if let Some(max) = props.maximum_packet_size {
        section.put_u8(0x27);
        section.put_u32(max);
    }
    put_flag(0x28, props.wildcard_subscription_available, &mut section);
    put_flag(0x29, props.subscription_identifiers_available, &mut section);
    put_flag(0x2A, props.shared_subscription_available, &mut section);

    write_varint(section.len(), body);
    body.put_slice(&section);
    Ok(())
}

fn write_binary(bytes: &[u8], body: &mut BytesMut) -> Result<(), CodecError> {
    let len = u16::try_from(bytes.len()).map_err(|_| {
        CodecError::Malformed(format!("field of {} bytes exceeds 65535", bytes.len()))
    })?;
    body.put_u16(len);
    body.put_slice(bytes);
    Ok(())
}

fn write_string(s: &str, body: &mut BytesMut) -> Result<(), CodecError> {
    write_binary(s.as_bytes(), body)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 1024;

    fn encode(packet: &MqttPacket) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_packet(packet, &mut buf).unwrap();
        buf.to_vec()
    }

    fn encode_v5(packet: &MqttPacket) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_packet_with(packet, &mut buf, ProtocolVersion::V5).unwrap();
        buf.to_vec()
    }

    fn decode_v5(bytes: &[u8]) -> MqttPacket {
        let mut buf = BytesMut::from(bytes);
        let packet = decode_packet_with(&mut buf, MAX, ProtocolVersion::V5)
            .unwrap()
            .expect("complete packet");
        assert!(buf.is_empty(), "trailing bytes left: {buf:?}");
        packet
    }

    fn decode_all(bytes: &[u8]) -> MqttPacket {
        let mut buf = BytesMut::from(bytes);
        let packet = decode_packet(&mut buf, MAX).unwrap().expect("complete packet");
        assert!(buf.is_empty(), "trailing bytes left: {buf:?}");
        packet
    }

    fn connect_bytes(client_id: &str) -> Vec<u8> {
        let mut body = vec![0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 0x3C];
        body.extend_from_slice(&(client_id.len() as u16).to_be_bytes());
        body.extend_from_slice(client_id.as_bytes());
        let mut frame = vec![0x10, body.len() as u8];
        frame.extend(body);
        frame
    }

    #[test]
    fn test_decode_connect_from_wire() {
        let packet = decode_all(&connect_bytes("dev-1"));

        match packet {
            MqttPacket::Connect(c) => {
                assert_eq!(c.client_id, "dev-1");
                assert_eq!(c.keep_alive, 60);
                assert!(c.clean_session);
                assert_eq!(c.protocol_level, 4);
                assert_eq!(c.username, None);
            }
            other => panic!("expected CONNECT, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_connect_skips_will_and_reads_credentials() {
        // Arrange: will flag, will QoS 1, username, password
        let mut body = vec![0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0b1100_1110, 0x00, 0x0A];
        let fields: [&[u8]; 5] = [b"id", b"will/t", b"bye", b"user", b"pw"];
        for field in fields {
            body.extend_from_slice(&(field.len() as u16).to_be_bytes());
            body.extend_from_slice(field);
        }
        let mut frame = vec![0x10, body.len() as u8];
        frame.extend(body);

        // Act
        let packet = decode_all(&frame);

        // Assert
        let MqttPacket::Connect(c) = packet else {
            panic!("expected CONNECT");
        };
        assert_eq!(c.client_id, "id");
        assert_eq!(c.username.as_deref(), Some("user"));
        assert_eq!(c.password.as_deref(), Some(&b"pw"[..]));
    }

    #[test]
    fn test_unknown_protocol_name_is_rejected() {
        let mut frame = connect_bytes("x");
        frame[4] = b'X';

        let err = decode_packet(&mut BytesMut::from(&frame[..]), MAX).unwrap_err();

        assert!(matches!(err, CodecError::UnsupportedProtocol { level: 4, .. }));
    }

    #[test]
    fn test_partial_packet_leaves_buffer_untouched() {
        let frame = connect_bytes("device");
        let mut buf = BytesMut::from(&frame[..frame.len() - 1]);

        assert_eq!(decode_packet(&mut buf, MAX).unwrap(), None);
        assert_eq!(buf.len(), frame.len() - 1);

        buf.extend_from_slice(&frame[frame.len() - 1..]);
        assert!(matches!(
            decode_packet(&mut buf, MAX).unwrap(),
            Some(MqttPacket::Connect(_))
        ));
    }

    #[test]
    fn test_single_byte_needs_more() {
        let mut buf = BytesMut::from(&[0x30][..]);
        assert_eq!(decode_packet(&mut buf, MAX).unwrap(), None);
    }

    #[test]
    fn test_decode_qos1_publish() {
        let frame = [0x32, 0x09, 0x00, 0x03, b'a', b'/', b'b', 0x00, 0x07, b'h', b'i'];

        let MqttPacket::Publish(p) = decode_all(&frame) else {
            panic!("expected PUBLISH");
        };

        assert_eq!(p.topic, "a/b");
        assert_eq!(p.qos, QoS::AtLeastOnce);
        assert_eq!(p.pkid, 7);
        assert_eq!(&p.payload[..], b"hi");
        assert!(!p.retain);
    }

    #[test]
    fn test_qos3_publish_is_rejected() {
        let mut buf = BytesMut::from(&[0x36, 0x02, 0x00, 0x00][..]);
        assert_eq!(decode_packet(&mut buf, MAX).unwrap_err(), CodecError::InvalidQoS(3));
    }

    #[test]
    fn test_oversized_packet_is_rejected_before_body_arrives() {
        // Remaining length 200 with a 64-byte limit; no body bytes yet.
        let mut buf = BytesMut::from(&[0x30, 0xC8, 0x01][..]);

        let err = decode_packet(&mut buf, 64).unwrap_err();

        assert_eq!(err, CodecError::PacketTooLarge { size: 203, max: 64 });
    }

    #[test]
    fn test_five_byte_remaining_length_is_malformed() {
        let mut buf = BytesMut::from(&[0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0x01][..]);
        assert_eq!(
            decode_packet(&mut buf, usize::MAX).unwrap_err(),
            CodecError::MalformedRemainingLength
        );
    }

    #[test]
    fn test_subscribe_requires_reserved_flags() {
        let mut buf = BytesMut::from(&[0x80, 0x06, 0x00, 0x01, 0x00, 0x01, b't', 0x00][..]);
        assert!(matches!(
            decode_packet(&mut buf, MAX).unwrap_err(),
            CodecError::InvalidFlags { packet: "SUBSCRIBE", .. }
        ));
    }

    #[test]
    fn test_decode_subscribe_keeps_filter_order() {
        let frame = [
            0x82, 0x0D, 0x00, 0x05, 0x00, 0x01, b'a', 0x01, 0x00, 0x04, b'b', b'/', b'#', b'!',
            0x02,
        ];

        let MqttPacket::Subscribe(s) = decode_all(&frame) else {
            panic!("expected SUBSCRIBE");
        };

        assert_eq!(s.pkid, 5);
        assert_eq!(
            s.filters,
            vec![
                SubscribeFilter::new("a", QoS::AtLeastOnce),
                SubscribeFilter::new("b/#!", QoS::ExactlyOnce),
            ]
        );
    }

    #[test]
    fn test_encode_connack_accepted() {
        assert_eq!(encode(&MqttPacket::ConnAck(ConnAck::accepted())), [0x20, 0x02, 0x00, 0x00]);
    }

    #[test]
    fn test_encode_connack_not_authorized_drops_reason_on_v3() {
        let ack = ConnAck::refused(ConnectReturnCode::NotAuthorized, "client identifier is empty");
        assert_eq!(encode(&MqttPacket::ConnAck(ack)), [0x20, 0x02, 0x00, 0x05]);
    }

    #[test]
    fn test_encode_acks() {
        assert_eq!(encode(&MqttPacket::PubAck(7)), [0x40, 0x02, 0x00, 0x07]);
        assert_eq!(encode(&MqttPacket::PubRec(0x0102)), [0x50, 0x02, 0x01, 0x02]);
        assert_eq!(encode(&MqttPacket::PubRel(9)), [0x62, 0x02, 0x00, 0x09]);
        assert_eq!(encode(&MqttPacket::PubComp(9)), [0x70, 0x02, 0x00, 0x09]);
        let unsuback = UnsubAck {
            pkid: 3,
            codes: vec![UnsubscribeReasonCode::Success],
        };
        assert_eq!(encode(&MqttPacket::UnsubAck(unsuback)), [0xB0, 0x02, 0x00, 0x03]);
        assert_eq!(encode(&MqttPacket::PingResp), [0xD0, 0x00]);
    }

    #[test]
    fn test_encode_suback_codes_in_order() {
        let ack = SubAck {
            pkid: 4,
            codes: vec![
                SubscribeReasonCode::Granted(QoS::ExactlyOnce),
                SubscribeReasonCode::SharedSubscriptionsNotSupported,
                SubscribeReasonCode::Granted(QoS::AtMostOnce),
            ],
        };

        assert_eq!(
            encode(&MqttPacket::SubAck(ack)),
            [0x90, 0x05, 0x00, 0x04, 0x02, 0x80, 0x00]
        );
    }

    #[test]
    fn test_encode_publish_sets_header_flags() {
        let mut publish = Publish::new("t", QoS::ExactlyOnce, &b"x"[..]);
        publish.pkid = 1;
        publish.retain = true;

        assert_eq!(
            encode(&MqttPacket::Publish(publish)),
            [0x35, 0x06, 0x00, 0x01, b't', 0x00, 0x01, b'x']
        );
    }

    #[test]
    fn test_encode_qos1_publish_without_pkid_fails() {
        let publish = Publish::new("t", QoS::AtLeastOnce, &b"x"[..]);
        let err = encode_packet(&MqttPacket::Publish(publish), &mut BytesMut::new()).unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }

    #[test]
    fn test_encode_long_remaining_length_uses_two_bytes() {
        let publish = Publish::new("t", QoS::AtMostOnce, vec![0u8; 200]);

        let bytes = encode(&MqttPacket::Publish(publish));

        // 3 bytes of topic + 200 payload = 203 = 0xCB 0x01
        assert_eq!(&bytes[..3], &[0x30, 0xCB, 0x01]);
        assert_eq!(bytes.len(), 206);
    }

    #[test]
    fn test_encoded_connect_decodes_back() {
        let mut connect = Connect::new("meter-12");
        connect.username = Some("ops".into());
        connect.password = Some(Bytes::from_static(b"secret"));
        let packet = MqttPacket::Connect(connect);

        assert_eq!(decode_all(&encode(&packet)), packet);
    }

    #[test]
    fn test_back_to_back_packets_decode_one_at_a_time() {
        let mut buf = BytesMut::from(&[0xC0, 0x00, 0x62, 0x02, 0x00, 0x2A, 0xE0, 0x00][..]);

        assert_eq!(decode_packet(&mut buf, MAX).unwrap(), Some(MqttPacket::PingReq));
        assert_eq!(decode_packet(&mut buf, MAX).unwrap(), Some(MqttPacket::PubRel(42)));
        assert_eq!(decode_packet(&mut buf, MAX).unwrap(), Some(MqttPacket::Disconnect));
        assert_eq!(decode_packet(&mut buf, MAX).unwrap(), None);
    }

    #[test]
    fn test_publish_qos1_with_packet_id_zero_is_malformed() {
        let mut buf = BytesMut::from(&[0x32, 0x06, 0x00, 0x01, b't', 0x00, 0x00, b'x'][..]);

        let err = decode_packet(&mut buf, MAX).unwrap_err();

        assert!(matches!(err, CodecError::Malformed(_)));
    }

    #[test]
    fn test_subscribe_with_packet_id_zero_is_malformed() {
        let mut buf = BytesMut::from(&[0x82, 0x06, 0x00, 0x00, 0x00, 0x01, b't', 0x00][..]);
        assert!(matches!(decode_packet(&mut buf, MAX).unwrap_err(), CodecError::Malformed(_)));
    }

    #[test]
    fn test_unsupported_level_reports_name_and_level() {
        let mut frame = connect_bytes("x");
        frame[8] = 6;

        let err = decode_packet(&mut BytesMut::from(&frame[..]), MAX).unwrap_err();

        assert_eq!(
            err,
            CodecError::UnsupportedProtocol {
                name: "MQTT".into(),
                level: 6
            }
        );
    }

    // ── MQTT 5 ────────────────────────────────────────────────────────────────

    #[test]
    fn test_decode_v5_connect_reads_properties() {
        // Arrange: level 5, clean start, keep alive 30, session expiry 120,
        // receive maximum 10, one user property, client id "m5"
        let frame = [
            0x10, 0x22, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x05, 0x02, 0x00, 0x1E, // header
            0x13, 0x11, 0x00, 0x00, 0x00, 0x78, 0x21, 0x00, 0x0A, 0x26, 0x00, 0x01, b'k', 0x00,
            0x01, b'v', 0x15, 0x00, 0x01, b'x', // properties (auth method skipped)
            0x00, 0x02, b'm', b'5',
        ];

        // Act
        let MqttPacket::Connect(c) = decode_all(&frame) else {
            panic!("expected CONNECT");
        };

        // Assert
        assert_eq!(c.protocol_level, 5);
        assert_eq!(c.version(), ProtocolVersion::V5);
        assert_eq!(c.client_id, "m5");
        assert_eq!(c.keep_alive, 30);
        assert_eq!(c.properties.session_expiry_interval, Some(120));
        assert_eq!(c.properties.receive_maximum, Some(10));
        assert_eq!(c.properties.user_properties, vec![("k".into(), "v".into())]);
    }

    #[test]
    fn test_v5_connect_skips_will_properties() {
        let mut connect = Connect::new("w");
        connect.protocol_level = 5;
        let mut frame = encode(&MqttPacket::Connect(connect));
        // Set the will flag and append will properties, topic and payload.
        frame[9] |= 0x04;
        frame.extend_from_slice(&[0x02, 0x01, 0x01, 0x00, 0x01, b't', 0x00, 0x00]);
        frame[1] += 8;

        let MqttPacket::Connect(c) = decode_all(&frame) else {
            panic!("expected CONNECT");
        };

        assert_eq!(c.client_id, "w");
    }

    #[test]
    fn test_encoded_v5_connect_decodes_back() {
        let mut connect = Connect::new("meter-5");
        connect.protocol_level = 5;
        connect.properties.session_expiry_interval = Some(3600);
        connect.properties.topic_alias_maximum = Some(8);
        let packet = MqttPacket::Connect(connect);

        assert_eq!(decode_all(&encode(&packet)), packet);
    }

    #[test]
    fn test_encode_v5_connack_refusal_carries_reason_string() {
        let ack = ConnAck::refused(ConnectReturnCode::IdentifierRejected, "no id");

        let bytes = encode_v5(&MqttPacket::ConnAck(ack));

        assert_eq!(
            bytes,
            [0x20, 0x0B, 0x00, 0x85, 0x08, 0x1F, 0x00, 0x05, b'n', b'o', b' ', b'i', b'd']
        );
    }

    #[test]
    fn test_encode_v5_connack_accepted_with_capabilities() {
        let mut ack = ConnAck::accepted();
        ack.properties.shared_subscription_available = Some(false);
        ack.properties.topic_alias_maximum = Some(u16::MAX);

        let bytes = encode_v5(&MqttPacket::ConnAck(ack.clone()));

        assert_eq!(
            bytes,
            [0x20, 0x08, 0x00, 0x00, 0x05, 0x22, 0xFF, 0xFF, 0x2A, 0x00]
        );
        assert_eq!(decode_v5(&bytes), MqttPacket::ConnAck(ack));
    }

    #[test]
    fn test_encode_v5_suback_uses_shared_subscription_code() {
        let ack = SubAck {
            pkid: 4,
            codes: vec![
                SubscribeReasonCode::Granted(QoS::AtLeastOnce),
                SubscribeReasonCode::SharedSubscriptionsNotSupported,
            ],
        };

        let bytes = encode_v5(&MqttPacket::SubAck(ack.clone()));

        assert_eq!(bytes, [0x90, 0x05, 0x00, 0x04, 0x00, 0x01, 0x9E]);
        assert_eq!(decode_v5(&bytes), MqttPacket::SubAck(ack));
    }

    #[test]
    fn test_encode_v5_unsuback_has_code_per_topic() {
        let ack = UnsubAck {
            pkid: 2,
            codes: vec![UnsubscribeReasonCode::Success, UnsubscribeReasonCode::Success],
        };

        assert_eq!(
            encode_v5(&MqttPacket::UnsubAck(ack)),
            [0xB0, 0x05, 0x00, 0x02, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_decode_v5_publish_with_topic_alias() {
        // QoS 1, empty topic, pkid 3, properties { topic alias 2 }, payload "ok"
        let frame = [0x32, 0x0A, 0x00, 0x00, 0x00, 0x03, 0x03, 0x23, 0x00, 0x02, b'o', b'k'];

        let MqttPacket::Publish(p) = decode_v5(&frame) else {
            panic!("expected PUBLISH");
        };

        assert_eq!(p.topic, "");
        assert_eq!(p.pkid, 3);
        assert_eq!(p.properties.topic_alias, Some(2));
        assert_eq!(&p.payload[..], b"ok");
    }

    #[test]
    fn test_decode_v5_subscribe_and_acks_with_reason_codes() {
        // SUBSCRIBE pkid 1, no properties, "a" with options 0x15 (QoS 1, no-local,
        // retain handling 1); PUBACK pkid 5 reason 0x10 with empty properties;
        // DISCONNECT with reason 0x04.
        let mut buf = BytesMut::from(
            &[
                0x82, 0x07, 0x00, 0x01, 0x00, 0x00, 0x01, b'a', 0x15, // SUBSCRIBE
                0x40, 0x04, 0x00, 0x05, 0x10, 0x00, // PUBACK
                0xE0, 0x01, 0x04, // DISCONNECT
            ][..],
        );
        let v5 = ProtocolVersion::V5;

        let subscribe = decode_packet_with(&mut buf, MAX, v5).unwrap();
        let puback = decode_packet_with(&mut buf, MAX, v5).unwrap();
        let disconnect = decode_packet_with(&mut buf, MAX, v5).unwrap();

        assert_eq!(
            subscribe,
            Some(MqttPacket::Subscribe(Subscribe {
                pkid: 1,
                filters: vec![SubscribeFilter::new("a", QoS::AtLeastOnce)],
            }))
        );
        assert_eq!(puback, Some(MqttPacket::PubAck(5)));
        assert_eq!(disconnect, Some(MqttPacket::Disconnect));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_unknown_v5_property_is_malformed() {
        // PUBLISH QoS 0 with property id 0x7F
        let mut buf = BytesMut::from(&[0x30, 0x06, 0x00, 0x01, b't', 0x02, 0x7F, 0x00][..]);

        let err = decode_packet_with(&mut buf, MAX, ProtocolVersion::V5).unwrap_err();

        assert!(matches!(err, CodecError::Malformed(_)));
    }
}
