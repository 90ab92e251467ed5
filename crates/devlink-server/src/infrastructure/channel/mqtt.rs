//! MQTT channel: a TCP connection carrying MQTT 3.1.1 or MQTT 5 packets.
//!
//! [`MqttChannel`] is the outbound half, used by the protocol engine for
//! acknowledgements and by the application to publish to the device.
//! [`MqttPacketReader`] is the inbound half.  The reader fixes the wire
//! dialect when it decodes the CONNECT; until then both halves speak 3.1.1.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use devlink_core::mqtt::{
    decode_packet_with, encode_packet_with, CodecError, MqttPacket, ProtocolVersion, Publish, QoS,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

use super::tcp::TcpChannel;
use crate::application::channel::{Channel, ChannelError};
use crate::application::mqtt_engine::{MqttPacketSink, MqttPacketSource};
use crate::application::session::Session;

const READ_CHUNK: usize = 8 * 1024;

/// Session property under which the MQTT listener stores the session's
/// [`MqttChannel`].
pub const MQTT_CHANNEL_PROPERTY: &str = "devlink.mqtt_channel";

pub struct MqttChannel {
    inner: Arc<TcpChannel>,
    next_pkid: AtomicU16,
    version: OnceLock<ProtocolVersion>,
}

impl MqttChannel {
    pub fn from_tcp_stream(stream: TcpStream, max_packet_size: usize) -> (Arc<Self>, MqttPacketReader) {
        let endpoint = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "could not set TCP_NODELAY");
        }
        let (reader, writer) = stream.into_split();
        Self::pair(reader, writer, endpoint, max_packet_size)
    }

    pub fn pair<R, W>(
        reader: R,
        writer: W,
        endpoint: Option<SocketAddr>,
        max_packet_size: usize,
    ) -> (Arc<Self>, MqttPacketReader<R>)
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let channel = Arc::new(Self {
            inner: TcpChannel::with_writer(writer, endpoint),
            next_pkid: AtomicU16::new(1),
            version: OnceLock::new(),
        });
        let reader = MqttPacketReader {
            channel: Arc::clone(&channel),
            version: ProtocolVersion::V3,
            reader,
            window: BytesMut::with_capacity(READ_CHUNK),
            buf: vec![0; READ_CHUNK],
            max_packet_size,
        };
        (channel, reader)
    }

    /// The MQTT channel behind `session`, if it is an MQTT session.
    pub fn of_session(session: &dyn Session) -> Option<Arc<MqttChannel>> {
        session.properties().get::<Arc<MqttChannel>>(MQTT_CHANNEL_PROPERTY)
    }

    /// Wire dialect chosen by the client's CONNECT; 3.1.1 before it arrives.
    pub fn protocol_version(&self) -> ProtocolVersion {
        self.version.get().copied().unwrap_or_default()
    }

    /// Encodes one packet in the connection's dialect and sends it.
    pub async fn send_packet(&self, packet: &MqttPacket) -> Result<(), ChannelError> {
        let mut buf = BytesMut::new();
        encode_packet_with(packet, &mut buf, self.protocol_version())?;
        self.inner.send(&buf).await
    }

    /// Sends a server-originated PUBLISH to the device.
    ///
    /// Returns the packet id used; `0` for QoS 0.  Acknowledgements from
    /// the device are accepted but not tracked.
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: QoS,
    ) -> Result<u16, ChannelError> {
        let mut publish = Publish::new(topic, qos, payload);
        if qos != QoS::AtMostOnce {
            publish.pkid = self.allocate_pkid();
        }
        let pkid = publish.pkid;
        self.send_packet(&MqttPacket::Publish(publish)).await?;
        Ok(pkid)
    }

    /// Next non-zero packet id, wrapping after 65535.
    fn allocate_pkid(&self) -> u16 {
        loop {
            let id = self.next_pkid.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}

#[async_trait]
impl Channel for MqttChannel {
    fn channel_id(&self) -> &str {
        self.inner.channel_id()
    }

    fn endpoint(&self) -> Option<SocketAddr> {
        self.inner.endpoint()
    }

    fn last_active(&self) -> Instant {
        self.inner.last_active()
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    async fn send(&self, data: &[u8]) -> Result<(), ChannelError> {
        self.inner.send(data).await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

#[async_trait]
impl MqttPacketSink for MqttChannel {
    async fn send_packet(&self, packet: &MqttPacket) -> Result<(), ChannelError> {
        MqttChannel::send_packet(self, packet).await
    }
}

/// Inbound half of an [`MqttChannel`]: decodes packets from the socket.
pub struct MqttPacketReader<R = OwnedReadHalf> {
    channel: Arc<MqttChannel>,
    version: ProtocolVersion,
    reader: R,
    window: BytesMut,
    buf: Vec<u8>,
    max_packet_size: usize,
}

#[async_trait]
impl<R: AsyncRead + Send + Unpin> MqttPacketSource for MqttPacketReader<R> {
    async fn next_packet(&mut self) -> Result<Option<MqttPacket>, ChannelError> {
        loop {
            match decode_packet_with(&mut self.window, self.max_packet_size, self.version) {
                Ok(Some(packet)) => {
                    // Only the first CONNECT fixes the dialect.
                    if let MqttPacket::Connect(connect) = &packet {
                        if self.channel.version.set(connect.version()).is_ok() {
                            self.version = connect.version();
                        }
                    }
                    return Ok(Some(packet));
                }
                Ok(None) => {}
                // Left open so the engine can answer with a CONNACK.
                Err(e @ CodecError::UnsupportedProtocol { .. }) => return Err(e.into()),
                Err(e) => {
                    self.channel.close().await;
                    return Err(e.into());
                }
            }

            let Some(n) = self.channel.inner.read_some(&mut self.reader, &mut self.buf).await? else {
                return Ok(None);
            };
            self.window.extend_from_slice(&self.buf[..n]);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
