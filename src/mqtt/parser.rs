//! MQTT packet parsing and encoding
//!
//! Wraps the mqttrs crate to turn one complete MQTT 3.1.1 control packet into
//! an owned [`MqttPacket`] and back. Packets the relay never inspects are kept
//! as their original bytes.

use mqttrs::{decode_slice, encode_slice, LastWill, Packet, Pid, Protocol, QoS, QosPid};

use super::CodecError;

/// Largest value of the remaining length field
const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Protocol name "MQTT" and level 4
const MQTT311_PROTOCOL: [u8; 7] = [0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04];
/// Protocol name "MQIsdp" and level 3
const MQISDP_PROTOCOL: [u8; 9] = [0x00, 0x06, b'M', b'Q', b'I', b's', b'd', b'p', 0x03];

/// Decoded MQTT control packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MqttPacket {
    Connect(ParsedConnect),
    Publish(ParsedPublish),
    Subscribe(ParsedSubscribe),
    Unsubscribe(ParsedUnsubscribe),
    PingReq,
    PingResp,
    Disconnect,
    /// Any other packet type, carried as its original wire bytes
    Other(RawPacket),
}

/// MQTT packet type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqttPacketType {
    Connect,
    Connack,
    Publish,
    Puback,
    Pubrec,
    Pubrel,
    Pubcomp,
    Subscribe,
    Suback,
    Unsubscribe,
    Unsuback,
    Pingreq,
    Pingresp,
    Disconnect,
}

impl MqttPacketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Connack => "CONNACK",
            Self::Publish => "PUBLISH",
            Self::Puback => "PUBACK",
            Self::Pubrec => "PUBREC",
            Self::Pubrel => "PUBREL",
            Self::Pubcomp => "PUBCOMP",
            Self::Subscribe => "SUBSCRIBE",
            Self::Suback => "SUBACK",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Unsuback => "UNSUBACK",
            Self::Pingreq => "PINGREQ",
            Self::Pingresp => "PINGRESP",
            Self::Disconnect => "DISCONNECT",
        }
    }
}

impl std::fmt::Display for MqttPacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed CONNECT packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedConnect {
    /// Protocol level (3 = 3.1, 4 = 3.1.1)
    pub protocol_version: u8,
    /// Client identifier
    pub client_id: String,
    /// Clean session flag
    pub clean_session: bool,
    /// Keep alive interval in seconds
    pub keep_alive: u16,
    /// Username if provided
    pub username: Option<String>,
    /// Password if provided (stored as bytes for non-UTF8 passwords)
    pub password: Option<Vec<u8>>,
    /// Last will message
    pub will: Option<ParsedWill>,
}

/// Last will carried by a CONNECT packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedWill {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
}

/// Parsed PUBLISH packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPublish {
    /// Topic name
    pub topic: String,
    /// Message payload
    pub payload: Vec<u8>,
    /// QoS level (0, 1, or 2)
    pub qos: u8,
    /// Retain flag
    pub retain: bool,
    /// Duplicate delivery flag
    pub dup: bool,
    /// Packet identifier (for QoS > 0)
    pub packet_id: Option<u16>,
}

/// Parsed SUBSCRIBE packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSubscribe {
    /// Packet identifier
    pub packet_id: u16,
    /// Topic filters with requested QoS
    pub subscriptions: Vec<Subscription>,
}

impl ParsedSubscribe {
    pub fn topic_filters(&self) -> Vec<String> {
        self.subscriptions
            .iter()
            .map(|s| s.topic_filter.clone())
            .collect()
    }

    /// Replace the requested topic filters.
    ///
    /// Filters keep the QoS requested at the same position; filters added
    /// beyond the original count inherit the QoS of the last subscription.
    pub fn replace_topic_filters(&mut self, filters: Vec<String>) {
        let fallback_qos = self.subscriptions.last().map(|s| s.qos).unwrap_or(0);
        self.subscriptions = filters
            .into_iter()
            .enumerate()
            .map(|(i, topic_filter)| Subscription {
                qos: self
                    .subscriptions
                    .get(i)
                    .map(|s| s.qos)
                    .unwrap_or(fallback_qos),
                topic_filter,
            })
            .collect();
    }
}

/// A single subscription in a SUBSCRIBE packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Topic filter (may contain + and # wildcards)
    pub topic_filter: String,
    /// Requested QoS level
    pub qos: u8,
}

/// Parsed UNSUBSCRIBE packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUnsubscribe {
    /// Packet identifier
    pub packet_id: u16,
    /// Topic filters to unsubscribe from
    pub topics: Vec<String>,
}

/// A packet the relay forwards without looking inside
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    pub packet_type: MqttPacketType,
    pub bytes: Vec<u8>,
}

impl MqttPacket {
    pub fn packet_type(&self) -> MqttPacketType {
        match self {
            Self::Connect(_) => MqttPacketType::Connect,
            Self::Publish(_) => MqttPacketType::Publish,
            Self::Subscribe(_) => MqttPacketType::Subscribe,
            Self::Unsubscribe(_) => MqttPacketType::Unsubscribe,
            Self::PingReq => MqttPacketType::Pingreq,
            Self::PingResp => MqttPacketType::Pingresp,
            Self::Disconnect => MqttPacketType::Disconnect,
            Self::Other(raw) => raw.packet_type,
        }
    }
}

/// Parse exactly one complete MQTT packet from raw bytes
pub fn parse_packet(data: &[u8]) -> Result<MqttPacket, CodecError> {
    let packet = decode_slice(data)
        .map_err(|e| CodecError::Malformed(e.to_string()))?
        .ok_or(CodecError::Incomplete)?;

    let other = |packet_type| {
        Ok(MqttPacket::Other(RawPacket {
            packet_type,
            bytes: data.to_vec(),
        }))
    };

    match packet {
        Packet::Connect(connect) => {
            let protocol_version = match connect.protocol {
                Protocol::MQTT311 => 4,
                Protocol::MQIsdp => 3,
            };

            Ok(MqttPacket::Connect(ParsedConnect {
                protocol_version,
                client_id: connect.client_id.to_string(),
                clean_session: connect.clean_session,
                keep_alive: connect.keep_alive,
                username: connect.username.map(|s| s.to_string()),
                password: connect.password.map(|p| p.to_vec()),
                will: connect.last_will.as_ref().map(|w| ParsedWill {
                    topic: w.topic.to_string(),
                    payload: w.message.to_vec(),
                    qos: qos_to_u8(w.qos),
                    retain: w.retain,
                }),
            }))
        }

        Packet::Publish(publish) => {
            // mqttrs uses QosPid enum to combine QoS and packet ID
            let (qos, packet_id) = match publish.qospid {
                QosPid::AtMostOnce => (0, None),
                QosPid::AtLeastOnce(pid) => (1, Some(pid.get())),
                QosPid::ExactlyOnce(pid) => (2, Some(pid.get())),
            };

            Ok(MqttPacket::Publish(ParsedPublish {
                topic: publish.topic_name.to_string(),
                payload: publish.payload.to_vec(),
                qos,
                retain: publish.retain,
                dup: publish.dup,
                packet_id,
            }))
        }

        Packet::Subscribe(subscribe) => {
            let subscriptions = subscribe
                .topics
                .iter()
                .map(|t| Subscription {
                    topic_filter: t.topic_path.to_string(),
                    qos: qos_to_u8(t.qos),
                })
                .collect();

            Ok(MqttPacket::Subscribe(ParsedSubscribe {
                packet_id: subscribe.pid.get(),
                subscriptions,
            }))
        }

        Packet::Unsubscribe(unsub) => Ok(MqttPacket::Unsubscribe(ParsedUnsubscribe {
            packet_id: unsub.pid.get(),
            topics: unsub.topics.iter().map(|t| t.to_string()).collect(),
        })),

        Packet::Pingreq => Ok(MqttPacket::PingReq),
        Packet::Pingresp => Ok(MqttPacket::PingResp),
        Packet::Disconnect => Ok(MqttPacket::Disconnect),

        Packet::Connack(_) => other(MqttPacketType::Connack),
        Packet::Puback(_) => other(MqttPacketType::Puback),
        Packet::Pubrec(_) => other(MqttPacketType::Pubrec),
        Packet::Pubrel(_) => other(MqttPacketType::Pubrel),
        Packet::Pubcomp(_) => other(MqttPacketType::Pubcomp),
        Packet::Suback(_) => other(MqttPacketType::Suback),
        Packet::Unsuback(_) => other(MqttPacketType::Unsuback),
    }
}

/// Encode a packet into its wire representation
pub fn encode_packet(packet: &MqttPacket) -> Result<Vec<u8>, CodecError> {
    let encoded = match packet {
        MqttPacket::Other(raw) => return Ok(raw.bytes.clone()),

        MqttPacket::Connect(connect) => {
            check_field("client identifier", connect.client_id.len())?;
            if let Some(username) = &connect.username {
                check_field("username", username.len())?;
            }
            if let Some(password) = &connect.password {
                check_field("password", password.len())?;
            }
            let last_will = match &connect.will {
                Some(will) => {
                    check_field("will topic", will.topic.len())?;
                    check_field("will payload", will.payload.len())?;
                    Some(LastWill {
                        topic: &will.topic,
                        message: &will.payload,
                        qos: u8_to_qos(will.qos)?,
                        retain: will.retain,
                    })
                }
                None => None,
            };
            // mqttrs cannot write the MQIsdp protocol name, so 3.1 CONNECTs
            // are encoded as 3.1.1 and relabelled
            let encoded = encode_to_vec(&Packet::Connect(mqttrs::Connect {
                protocol: Protocol::MQTT311,
                keep_alive: connect.keep_alive,
                client_id: &connect.client_id,
                clean_session: connect.clean_session,
                last_will,
                username: connect.username.as_deref(),
                password: connect.password.as_deref(),
            }))?;
            if connect.protocol_version == 3 {
                relabel_mqisdp(&encoded)?
            } else {
                encoded
            }
        }

        MqttPacket::Publish(publish) => {
            let qospid = match (publish.qos, publish.packet_id) {
                (0, _) => QosPid::AtMostOnce,
                (1, Some(pid)) => QosPid::AtLeastOnce(to_pid(pid)?),
                (2, Some(pid)) => QosPid::ExactlyOnce(to_pid(pid)?),
                (qos, _) => {
                    return Err(CodecError::Unencodable(format!(
                        "PUBLISH with QoS {} requires a valid packet identifier",
                        qos
                    )))
                }
            };
            check_field("topic name", publish.topic.len())?;
            encode_to_vec(&Packet::Publish(mqttrs::Publish {
                dup: publish.dup,
                qospid,
                retain: publish.retain,
                topic_name: &publish.topic,
                payload: &publish.payload,
            }))?
        }

        MqttPacket::Subscribe(subscribe) => {
            let topics = subscribe
                .subscriptions
                .iter()
                .map(|s| {
                    check_field("topic filter", s.topic_filter.len())?;
                    Ok(mqttrs::SubscribeTopic {
                        topic_path: s.topic_filter.clone(),
                        qos: u8_to_qos(s.qos)?,
                    })
                })
                .collect::<Result<Vec<_>, CodecError>>()?;
            encode_to_vec(&Packet::Subscribe(mqttrs::Subscribe {
                pid: to_pid(subscribe.packet_id)?,
                topics,
            }))?
        }

        MqttPacket::Unsubscribe(unsubscribe) => {
            for topic in &unsubscribe.topics {
                check_field("topic filter", topic.len())?;
            }
            encode_to_vec(&Packet::Unsubscribe(mqttrs::Unsubscribe {
                pid: to_pid(unsubscribe.packet_id)?,
                topics: unsubscribe.topics.clone(),
            }))?
        }

        MqttPacket::PingReq => encode_to_vec(&Packet::Pingreq)?,
        MqttPacket::PingResp => encode_to_vec(&Packet::Pingresp)?,
        MqttPacket::Disconnect => encode_to_vec(&Packet::Disconnect)?,
    };

    Ok(encoded)
}

fn encode_to_vec(packet: &Packet<'_>) -> Result<Vec<u8>, CodecError> {
    let mut buf = vec![0u8; encoded_size(packet)?];
    let len = encode_slice(packet, &mut buf).map_err(|e| CodecError::Unencodable(e.to_string()))?;
    buf.truncate(len);
    Ok(buf)
}

/// Size of `packet` on the wire: packet type byte, remaining length and the
/// variable header plus payload as mqttrs writes them
fn encoded_size(packet: &Packet<'_>) -> Result<usize, CodecError> {
    let remaining = match packet {
        Packet::Connect(c) => {
            // protocol name and level, connect flags, keep alive
            MQTT311_PROTOCOL.len()
                + 1
                + 2
                + 2
                + c.client_id.len()
                + c.last_will
                    .as_ref()
                    .map_or(0, |w| 2 + w.topic.len() + 2 + w.message.len())
                + c.username.map_or(0, |u| 2 + u.len())
                + c.password.map_or(0, |p| 2 + p.len())
        }
        Packet::Publish(p) => {
            let packet_id = match p.qospid {
                QosPid::AtMostOnce => 0,
                _ => 2,
            };
            2 + p.topic_name.len() + packet_id + p.payload.len()
        }
        Packet::Subscribe(s) => 2 + s.topics.iter().map(|t| 2 + t.topic_path.len() + 1).sum::<usize>(),
        Packet::Unsubscribe(u) => 2 + u.topics.iter().map(|t| 2 + t.len()).sum::<usize>(),
        _ => 0,
    };
    Ok(1 + remaining_length_size(remaining)? + remaining)
}

/// Bytes needed to encode `remaining` as an MQTT variable byte integer
fn remaining_length_size(remaining: usize) -> Result<usize, CodecError> {
    match remaining {
        0..=127 => Ok(1),
        128..=16_383 => Ok(2),
        16_384..=2_097_151 => Ok(3),
        2_097_152..=MAX_REMAINING_LENGTH => Ok(4),
        _ => Err(CodecError::Unencodable(format!(
            "remaining length {} exceeds {}",
            remaining, MAX_REMAINING_LENGTH
        ))),
    }
}

fn push_remaining_length(out: &mut Vec<u8>, mut remaining: usize) {
    loop {
        let mut byte = (remaining % 128) as u8;
        remaining /= 128;
        if remaining > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if remaining == 0 {
            break;
        }
    }
}

/// Replace the 3.1.1 protocol name and level of an encoded CONNECT with the
/// MQTT 3.1 ones
fn relabel_mqisdp(encoded: &[u8]) -> Result<Vec<u8>, CodecError> {
    let unexpected = || CodecError::Unencodable("unexpected CONNECT encoding".to_string());

    let header_len = encoded
        .iter()
        .skip(1)
        .position(|byte| byte & 0x80 == 0)
        .map(|i| i + 2)
        .ok_or_else(unexpected)?;
    let rest = encoded
        .get(header_len..)
        .and_then(|body| body.strip_prefix(&MQTT311_PROTOCOL[..]))
        .ok_or_else(unexpected)?;

    let remaining = MQISDP_PROTOCOL.len() + rest.len();
    let mut out = Vec::with_capacity(1 + remaining_length_size(remaining)? + remaining);
    out.push(encoded[0]);
    push_remaining_length(&mut out, remaining);
    out.extend_from_slice(&MQISDP_PROTOCOL);
    out.extend_from_slice(rest);
    Ok(out)
}

/// Length prefixed strings and binary fields are limited to two length bytes
fn check_field(name: &str, len: usize) -> Result<(), CodecError> {
    if len > usize::from(u16::MAX) {
        return Err(CodecError::Unencodable(format!(
            "{} of {} bytes exceeds {} bytes",
            name,
            len,
            u16::MAX
        )));
    }
    Ok(())
}

fn to_pid(packet_id: u16) -> Result<Pid, CodecError> {
    Pid::try_from(packet_id)
        .map_err(|_| CodecError::Unencodable(format!("invalid packet identifier {}", packet_id)))
}

pub(crate) fn qos_to_u8(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}

fn u8_to_qos(qos: u8) -> Result<QoS, CodecError> {
    match qos {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(CodecError::Unencodable(format!("invalid QoS level {}", other))),
    }
}
