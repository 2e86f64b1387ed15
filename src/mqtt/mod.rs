//! MQTT protocol handling module
//!
//! Framing, decoding and re-encoding of MQTT 3.1.1 control packets, and topic
//! matching for the policy layer.

mod codec;
mod parser;
mod topic;

pub use codec::{read_packet, write_packet, ControlPacket};
pub use parser::{
    encode_packet, parse_packet, MqttPacket, MqttPacketType, ParsedConnect, ParsedPublish,
    ParsedSubscribe, ParsedUnsubscribe, ParsedWill, RawPacket, Subscription,
};
pub use topic::{TopicMatcher, TopicPrefix};

/// Errors raised while framing, decoding or encoding control packets
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("stream ended in the middle of a packet")]
    Truncated,

    #[error("malformed remaining length")]
    InvalidRemainingLength,

    #[error("incomplete MQTT packet")]
    Incomplete,

    #[error("failed to decode MQTT packet: {0}")]
    Malformed(String),

    #[error("failed to encode MQTT packet: {0}")]
    Unencodable(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
