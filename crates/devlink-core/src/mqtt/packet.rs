//! MQTT control packets as plain Rust values.
//!
//! One model serves both MQTT 3.1.1 and MQTT 5; the codec decides what
//! reaches the wire for a given [`ProtocolVersion`].  Only the fields the
//! server acts on are modelled.  A CONNECT will message is parsed past but
//! not kept, since will delivery is not offered.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::domain::package::Package;

/// Wire dialect of a connection, fixed by its CONNECT.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    /// MQTT 3.1 ("MQIsdp", level 3) and 3.1.1 ("MQTT", level 4).
    #[default]
    V3,
    /// MQTT 5 ("MQTT", level 5): properties and reason codes.
    V5,
}

impl ProtocolVersion {
    /// The dialect a CONNECT protocol name and level select, if supported.
    pub fn from_connect(name: &str, level: u8) -> Option<Self> {
        match (name, level) {
            ("MQTT", 4) | ("MQIsdp", 3) => Some(Self::V3),
            ("MQTT", 5) => Some(Self::V5),
            _ => None,
        }
    }
}

/// Delivery guarantee of a PUBLISH.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::AtMostOnce),
            1 => Some(Self::AtLeastOnce),
            2 => Some(Self::ExactlyOnce),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// MQTT 5 properties the server reads or writes.
///
/// Properties not listed here are skipped when decoding.  Every field is
/// ignored on a 3.1.1 wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    pub session_expiry_interval: Option<u32>,
    pub receive_maximum: Option<u16>,
    pub maximum_packet_size: Option<u32>,
    pub topic_alias_maximum: Option<u16>,
    pub topic_alias: Option<u16>,
    pub reason_string: Option<String>,
    pub retain_available: Option<bool>,
    pub wildcard_subscription_available: Option<bool>,
    pub subscription_identifiers_available: Option<bool>,
    pub shared_subscription_available: Option<bool>,
    pub user_properties: Vec<(String, String)>,
}

impl Properties {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// CONNACK result.  Both wire dialects are covered by [`code`] (3.1.1
/// §3.2.2.3) and [`reason_code`] (MQTT 5 §3.2.2.2).
///
/// [`code`]: ConnectReturnCode::code
/// [`reason_code`]: ConnectReturnCode::reason_code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReturnCode {
    Accepted,
    UnacceptableProtocolVersion,
    IdentifierRejected,
    ServerUnavailable,
    BadUserNameOrPassword,
    NotAuthorized,
}

impl ConnectReturnCode {
    pub fn code(self) -> u8 {
        match self {
            Self::Accepted => 0x00,
            Self::UnacceptableProtocolVersion => 0x01,
            Self::IdentifierRejected => 0x02,
            Self::ServerUnavailable => 0x03,
            Self::BadUserNameOrPassword => 0x04,
            Self::NotAuthorized => 0x05,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(Self::Accepted),
            0x01 => Some(Self::UnacceptableProtocolVersion),
            0x02 => Some(Self::IdentifierRejected),
            0x03 => Some(Self::ServerUnavailable),
            0x04 => Some(Self::BadUserNameOrPassword),
            0x05 => Some(Self::NotAuthorized),
            _ => None,
        }
    }

    /// MQTT 5 reason code.
    pub fn reason_code(self) -> u8 {
        match self {
            Self::Accepted => 0x00,
            Self::UnacceptableProtocolVersion => 0x84,
            Self::IdentifierRejected => 0x85,
            Self::BadUserNameOrPassword => 0x86,
            Self::NotAuthorized => 0x87,
            Self::ServerUnavailable => 0x88,
        }
    }

    pub fn from_reason_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(Self::Accepted),
            0x84 => Some(Self::UnacceptableProtocolVersion),
            0x85 => Some(Self::IdentifierRejected),
            0x86 => Some(Self::BadUserNameOrPassword),
            0x87 => Some(Self::NotAuthorized),
            0x88 => Some(Self::ServerUnavailable),
            _ => None,
        }
    }

    pub fn wire_code(self, version: ProtocolVersion) -> u8 {
        match version {
            ProtocolVersion::V3 => self.code(),
            ProtocolVersion::V5 => self.reason_code(),
        }
    }
}

/// Per-filter result carried by a SUBACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReasonCode {
    Granted(QoS),
    /// `$share/...` filters.  0x9E on MQTT 5; a 3.1.1 wire can only say
    /// "failure" (0x80).
    SharedSubscriptionsNotSupported,
    Failure,
}

impl SubscribeReasonCode {
    /// MQTT 3.1.1 return code.
    pub fn code(self) -> u8 {
        self.wire_code(ProtocolVersion::V3)
    }

    pub fn wire_code(self, version: ProtocolVersion) -> u8 {
        match (self, version) {
            (Self::Granted(qos), _) => qos.as_u8(),
            (Self::SharedSubscriptionsNotSupported, ProtocolVersion::V5) => 0x9E,
            (Self::SharedSubscriptionsNotSupported | Self::Failure, _) => 0x80,
        }
    }

    pub fn from_wire_code(code: u8, version: ProtocolVersion) -> Self {
        match (code, version) {
            (0x9E, ProtocolVersion::V5) => Self::SharedSubscriptionsNotSupported,
            _ => QoS::from_u8(code).map_or(Self::Failure, Self::Granted),
        }
    }

    pub fn is_granted(self) -> bool {
        matches!(self, Self::Granted(_))
    }
}

/// Per-filter result carried by an MQTT 5 UNSUBACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsubscribeReasonCode {
    Success,
    NoSubscriptionExisted,
    UnspecifiedError,
}

impl UnsubscribeReasonCode {
    pub fn code(self) -> u8 {
        match self {
            Self::Success => 0x00,
            Self::NoSubscriptionExisted => 0x11,
            Self::UnspecifiedError => 0x80,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => Self::Success,
            0x11 => Self::NoSubscriptionExisted,
            _ => Self::UnspecifiedError,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// 3 for MQTT 3.1 ("MQIsdp"), 4 for MQTT 3.1.1 ("MQTT"), 5 for MQTT 5.
    pub protocol_level: u8,
    pub client_id: String,
    pub keep_alive: u16,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub properties: Properties,
}

impl Connect {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            protocol_level: 4,
            client_id: client_id.into(),
            keep_alive: 60,
            clean_session: true,
            username: None,
            password: None,
            properties: Properties::default(),
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        if self.protocol_level == 5 {
            ProtocolVersion::V5
        } else {
            ProtocolVersion::V3
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnAck {
    pub code: ConnectReturnCode,
    pub session_present: bool,
    /// Written on MQTT 5 wires only.
    pub properties: Properties,
}

impl ConnAck {
    pub fn accepted() -> Self {
        Self {
            code: ConnectReturnCode::Accepted,
            session_present: false,
            properties: Properties::default(),
        }
    }

    /// A refusal; `reason` travels as the MQTT 5 reason string.
    pub fn refused(code: ConnectReturnCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            session_present: false,
            properties: Properties {
                reason_string: Some(reason.into()),
                ..Properties::default()
            },
        }
    }

    pub fn reason(&self) -> Option<&str> {
        self.properties.reason_string.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub qos: QoS,
    /// Zero for QoS 0.
    pub pkid: u16,
    pub retain: bool,
    pub dup: bool,
    pub payload: Bytes,
    pub properties: Properties,
}

impl Publish {
    pub fn new(topic: impl Into<String>, qos: QoS, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            qos,
            pkid: 0,
            retain: false,
            dup: false,
            payload: payload.into(),
            properties: Properties::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeFilter {
    pub path: String,
    pub qos: QoS,
}

impl SubscribeFilter {
    pub fn new(path: impl Into<String>, qos: QoS) -> Self {
        Self {
            path: path.into(),
            qos,
        }
    }

    /// True for shared subscriptions (`$share/<group>/<filter>`).
    pub fn is_shared(&self) -> bool {
        self.path.starts_with("$share/")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub pkid: u16,
    pub filters: Vec<SubscribeFilter>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub pkid: u16,
    pub codes: Vec<SubscribeReasonCode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub pkid: u16,
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubAck {
    pub pkid: u16,
    /// One per topic filter, MQTT 5 only.  Never written on 3.1.1 wires and
    /// empty when decoded from one.
    pub codes: Vec<UnsubscribeReasonCode>,
}

/// Every MQTT control packet except AUTH.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MqttPacket {
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
    UnsubAck(UnsubAck),
    PingReq,
    PingResp,
    Disconnect,
}

impl MqttPacket {
    /// Upper-case packet name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect(_) => "CONNECT",
            Self::ConnAck(_) => "CONNACK",
            Self::Publish(_) => "PUBLISH",
            Self::PubAck(_) => "PUBACK",
            Self::PubRec(_) => "PUBREC",
            Self::PubRel(_) => "PUBREL",
            Self::PubComp(_) => "PUBCOMP",
            Self::Subscribe(_) => "SUBSCRIBE",
            Self::SubAck(_) => "SUBACK",
            Self::Unsubscribe(_) => "UNSUBSCRIBE",
            Self::UnsubAck(_) => "UNSUBACK",
            Self::PingReq => "PINGREQ",
            Self::PingResp => "PINGRESP",
            Self::Disconnect => "DISCONNECT",
        }
    }
}

/// A PUBLISH received from a device, handed to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttPackage {
    pub device_key: String,
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub payload: Bytes,
}

impl MqttPackage {
    pub fn from_publish(device_key: impl Into<String>, publish: Publish) -> Self {
        Self {
            device_key: device_key.into(),
            topic: publish.topic,
            qos: publish.qos,
            retain: publish.retain,
            payload: publish.payload,
        }
    }
}

impl Package for MqttPackage {
    fn device_key(&self) -> &str {
        &self.device_key
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
