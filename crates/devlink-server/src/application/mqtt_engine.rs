//! MQTT server-side protocol engine for 3.1, 3.1.1 and 5 clients.
//!
//! The engine answers the control packets a device sends and turns every
//! inbound PUBLISH into an [`MqttPackage`] for the session's handler.  It is
//! a [`SessionDriver`], so an MQTT connection shares the session lifecycle
//! with plain framed connections: CONNECT is the identity handshake, the
//! client id becomes the device key.
//!
//! There is no broker behind it.  SUBSCRIBE is acknowledged so clients can
//! proceed, but nothing is routed between devices.  MQTT 5 clients are told
//! so in the CONNACK capabilities; their topic aliases are resolved before
//! the package reaches the handler.

use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;
use std::sync::Arc;

use async_trait::async_trait;
use devlink_core::mqtt::{
    CodecError, ConnAck, Connect, ConnectReturnCode, MqttPackage, MqttPacket, ProtocolVersion,
    Publish, QoS, SubAck, SubscribeReasonCode, UnsubAck, UnsubscribeReasonCode,
};
use tracing::{debug, trace};

use super::channel::ChannelError;
use super::session::{PackageSink, SessionDriver, SessionError};

const EMPTY_CLIENT_ID: &str = "client identifier is empty";

/// Topic aliases an MQTT 5 client may use, advertised in the CONNACK.
pub const TOPIC_ALIAS_MAXIMUM: u16 = u16::MAX;

/// Inbound side of an MQTT connection.
#[async_trait]
pub trait MqttPacketSource: Send {
    /// Next packet, or `Ok(None)` once the peer has gone away.
    async fn next_packet(&mut self) -> Result<Option<MqttPacket>, ChannelError>;
}

/// Outbound side of an MQTT connection.
#[async_trait]
pub trait MqttPacketSink: Send + Sync + 'static {
    async fn send_packet(&self, packet: &MqttPacket) -> Result<(), ChannelError>;
}

pub struct MqttEngine<S> {
    source: S,
    sink: Arc<dyn MqttPacketSink>,
    client_id: Option<String>,
    version: ProtocolVersion,
    /// QoS 2 packet ids acknowledged with PUBREC and waiting for PUBREL.
    awaiting_rel: HashSet<u16>,
    /// MQTT 5 inbound topic aliases.
    topic_aliases: HashMap<u16, String>,
}

impl<S: MqttPacketSource> MqttEngine<S> {
    pub fn new(source: S, sink: Arc<dyn MqttPacketSink>) -> Self {
        Self {
            source,
            sink,
            client_id: None,
            version: ProtocolVersion::V3,
            awaiting_rel: HashSet::new(),
            topic_aliases: HashMap::new(),
        }
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Dialect of the accepted CONNECT.
    pub fn protocol_version(&self) -> ProtocolVersion {
        self.version
    }

    fn connack_accepted(&self) -> ConnAck {
        let mut ack = ConnAck::accepted();
        if self.version == ProtocolVersion::V5 {
            let props = &mut ack.properties;
            props.retain_available = Some(true);
            props.wildcard_subscription_available = Some(true);
            props.subscription_identifiers_available = Some(true);
            props.shared_subscription_available = Some(false);
            props.topic_alias_maximum = Some(TOPIC_ALIAS_MAXIMUM);
        }
        ack
    }

    /// Replaces an MQTT 5 topic alias with the topic it stands for, and
    /// records new aliases.
    fn resolve_topic(&mut self, publish: &mut Publish) -> Result<(), SessionError> {
        let Some(alias) = publish.properties.topic_alias else {
            if publish.topic.is_empty() {
                return Err(SessionError::ProtocolViolation(
                    "PUBLISH without topic or topic alias".into(),
                ));
            }
            return Ok(());
        };
        // Every non-zero alias fits under TOPIC_ALIAS_MAXIMUM.
        if alias == 0 {
            return Err(SessionError::ProtocolViolation("topic alias 0".into()));
        }
        if publish.topic.is_empty() {
            match self.topic_aliases.get(&alias) {
                Some(topic) => publish.topic = topic.clone(),
                None => {
                    return Err(SessionError::ProtocolViolation(format!(
                        "unknown topic alias {alias}"
                    )));
                }
            }
        } else {
            self.topic_aliases.insert(alias, publish.topic.clone());
        }
        Ok(())
    }

    async fn reply(&self, packet: MqttPacket) -> Result<(), SessionError> {
        trace!(packet = packet.name(), "mqtt reply");
        self.sink.send_packet(&packet).await?;
        Ok(())
    }

    async fn on_packet(
        &mut self,
        packet: MqttPacket,
        sink: &PackageSink<MqttPackage>,
    ) -> Result<ControlFlow<()>, SessionError> {
        trace!(packet = packet.name(), "mqtt packet");
        match packet {
            MqttPacket::Publish(mut publish) => {
                if self.version == ProtocolVersion::V5 {
                    self.resolve_topic(&mut publish)?;
                }
                let (qos, pkid) = (publish.qos, publish.pkid);
                let key = self.client_id.clone().unwrap_or_default();
                sink.deliver(MqttPackage::from_publish(key, publish));
                match qos {
                    QoS::AtMostOnce => {}
                    QoS::AtLeastOnce => self.reply(MqttPacket::PubAck(pkid)).await?,
                    QoS::ExactlyOnce => {
                        self.awaiting_rel.insert(pkid);
                        self.reply(MqttPacket::PubRec(pkid)).await?;
                    }
                }
            }
            MqttPacket::PubRel(pkid) => {
                if !self.awaiting_rel.remove(&pkid) {
                    debug!(pkid, "PUBREL for unknown packet id");
                }
                self.reply(MqttPacket::PubComp(pkid)).await?;
            }
            MqttPacket::PubRec(pkid) => self.reply(MqttPacket::PubRel(pkid)).await?,
            MqttPacket::PubAck(_) | MqttPacket::PubComp(_) => {}
            MqttPacket::Subscribe(subscribe) => {
                let codes = subscribe
                    .filters
                    .iter()
                    .map(|filter| {
                        if filter.is_shared() {
                            SubscribeReasonCode::SharedSubscriptionsNotSupported
                        } else {
                            SubscribeReasonCode::Granted(filter.qos)
                        }
                    })
                    .collect();
                self.reply(MqttPacket::SubAck(SubAck {
                    pkid: subscribe.pkid,
                    codes,
                }))
                .await?;
            }
            MqttPacket::Unsubscribe(unsubscribe) => {
                let codes = vec![UnsubscribeReasonCode::Success; unsubscribe.topics.len()];
                self.reply(MqttPacket::UnsubAck(UnsubAck {
                    pkid: unsubscribe.pkid,
                    codes,
                }))
                .await?;
            }
            MqttPacket::PingReq => self.reply(MqttPacket::PingResp).await?,
            MqttPacket::Disconnect => {
                debug!(client_id = ?self.client_id, "client sent DISCONNECT");
                return Ok(ControlFlow::Break(()));
            }
            other => {
                return Err(SessionError::ProtocolViolation(format!(
                    "unexpected {} packet from client",
                    other.name()
                )));
            }
        }
        Ok(ControlFlow::Continue(()))
    }
}

#[async_trait]
impl<S: MqttPacketSource + Sync + 'static> SessionDriver<MqttPackage> for MqttEngine<S> {
    async fn identify(
        &mut self,
        _sink: &PackageSink<MqttPackage>,
    ) -> Result<Option<String>, SessionError> {
        let connect: Connect = match self.source.next_packet().await {
            Ok(None) => return Ok(None),
            Ok(Some(MqttPacket::Connect(connect))) => connect,
            Ok(Some(other)) => {
                return Err(SessionError::ProtocolViolation(format!(
                    "expected CONNECT, got {}",
                    other.name()
                )));
            }
            // The channel has not switched dialect, so this goes out as a
            // 3.1.1 CONNACK with return code 0x01.
            Err(ChannelError::Codec(e @ CodecError::UnsupportedProtocol { .. })) => {
                let reason = e.to_string();
                let refusal =
                    ConnAck::refused(ConnectReturnCode::UnacceptableProtocolVersion, reason.clone());
                self.reply(MqttPacket::ConnAck(refusal)).await?;
                return Err(SessionError::Refused(reason));
            }
            Err(e) => return Err(e.into()),
        };
        self.version = connect.version();

        if connect.client_id.trim().is_empty() {
            let code = match self.version {
                ProtocolVersion::V3 => ConnectReturnCode::NotAuthorized,
                ProtocolVersion::V5 => ConnectReturnCode::IdentifierRejected,
            };
            let refusal = ConnAck::refused(code, EMPTY_CLIENT_ID);
            self.reply(MqttPacket::ConnAck(refusal)).await?;
            return Err(SessionError::Refused(EMPTY_CLIENT_ID.into()));
        }

        self.reply(MqttPacket::ConnAck(self.connack_accepted())).await?;
        debug!(
            client_id = %connect.client_id,
            version = ?self.version,
            keep_alive = connect.keep_alive,
            clean_session = connect.clean_session,
            "mqtt client connected"
        );
        self.client_id = Some(connect.client_id.clone());
        Ok(Some(connect.client_id))
    }

    async fn pump(&mut self, sink: &PackageSink<MqttPackage>) -> Result<(), SessionError> {
        while let Some(packet) = self.source.next_packet().await? {
            if self.on_packet(packet, sink).await?.is_break() {
                break;
            }
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
