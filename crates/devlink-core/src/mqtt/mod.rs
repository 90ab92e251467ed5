//! MQTT 3.1, 3.1.1 and 5 support: the packet model and its wire codec.

pub mod codec;
pub mod packet;

pub use codec::{
    decode_packet, decode_packet_with, encode_packet, encode_packet_with, CodecError,
    MAX_REMAINING_LENGTH,
};
pub use packet::{
    ConnAck, Connect, ConnectReturnCode, MqttPackage, MqttPacket, Properties, ProtocolVersion,
    Publish, QoS, SubAck, Subscribe, SubscribeFilter, SubscribeReasonCode, UnsubAck, Unsubscribe,
    UnsubscribeReasonCode,
};
