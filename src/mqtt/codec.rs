//! Control packet framing over byte streams
//!
//! Reads one MQTT control packet at a time from an async reader: the fixed
//! header byte, the variable length "remaining length" field (at most four
//! bytes) and then exactly that many body bytes.

use std::borrow::Cow;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::parser::{encode_packet, parse_packet, MqttPacket, MqttPacketType};
use super::CodecError;

/// Longest valid encoding of the remaining length field
const MAX_LENGTH_BYTES: usize = 4;

/// A decoded control packet together with the bytes it was read from.
///
/// Untouched packets are written back exactly as they arrived. Any mutable
/// access drops the original bytes so the packet is re-encoded on write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPacket {
    packet: MqttPacket,
    raw: Option<Vec<u8>>,
}

impl ControlPacket {
    /// Build a packet that will be encoded from its fields
    pub fn new(packet: MqttPacket) -> Self {
        Self { packet, raw: None }
    }

    pub fn disconnect() -> Self {
        Self::new(MqttPacket::Disconnect)
    }

    pub(crate) fn decoded(packet: MqttPacket, raw: Vec<u8>) -> Self {
        Self {
            packet,
            raw: Some(raw),
        }
    }

    pub fn packet(&self) -> &MqttPacket {
        &self.packet
    }

    /// Mutable access to the packet; the packet is re-encoded on write
    pub fn packet_mut(&mut self) -> &mut MqttPacket {
        self.raw = None;
        &mut self.packet
    }

    pub fn into_packet(self) -> MqttPacket {
        self.packet
    }

    pub fn packet_type(&self) -> MqttPacketType {
        self.packet.packet_type()
    }

    /// Whether the original wire bytes will be forwarded unchanged
    pub fn is_original(&self) -> bool {
        self.raw.is_some()
    }

    /// Wire representation of this packet
    pub fn to_bytes(&self) -> Result<Cow<'_, [u8]>, CodecError> {
        match &self.raw {
            Some(raw) => Ok(Cow::Borrowed(raw)),
            None => Ok(Cow::Owned(encode_packet(&self.packet)?)),
        }
    }
}

impl From<MqttPacket> for ControlPacket {
    fn from(packet: MqttPacket) -> Self {
        Self::new(packet)
    }
}

/// Read the next control packet.
///
/// Returns `Ok(None)` when the stream ends cleanly before the first byte of a
/// packet. End of stream anywhere inside a packet is [`CodecError::Truncated`].
pub async fn read_packet<R>(reader: &mut R) -> Result<Option<ControlPacket>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut first = [0u8; 1];
    if reader.read(&mut first).await? == 0 {
        return Ok(None);
    }

    let mut frame = Vec::with_capacity(MAX_LENGTH_BYTES + 1);
    frame.push(first[0]);

    let mut remaining = 0usize;
    let mut multiplier = 1usize;
    let mut terminated = false;
    for _ in 0..MAX_LENGTH_BYTES {
        let byte = reader.read_u8().await.map_err(truncated)?;
        frame.push(byte);
        remaining += usize::from(byte & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            terminated = true;
            break;
        }
        multiplier *= 128;
    }
    if !terminated {
        return Err(CodecError::InvalidRemainingLength);
    }

    // The buffer grows with the bytes that actually arrive
    let body_len = (&mut *reader)
        .take(remaining as u64)
        .read_to_end(&mut frame)
        .await?;
    if body_len < remaining {
        return Err(CodecError::Truncated);
    }

    let packet = parse_packet(&frame)?;
    Ok(Some(ControlPacket::decoded(packet, frame)))
}

/// Write one control packet and flush it
pub async fn write_packet<W>(writer: &mut W, packet: &ControlPacket) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = packet.to_bytes()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

fn truncated(e: std::io::Error) -> CodecError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        CodecError::Truncated
    } else {
        CodecError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::ParsedPublish;

    const PUBLISH: [u8; 14] = [
        0x30, 0x0C, // PUBLISH QoS 0, remaining length 12
        0x00, 0x05, b't', b'e', b's', b't', b'/', // Topic "test/"
        b'h', b'e', b'l', b'l', b'o', // Payload "hello"
    ];

    #[tokio::test]
    async fn test_read_consecutive_packets() {
        let mut input: Vec<u8> = PUBLISH.to_vec();
        input.extend_from_slice(&[0xC0, 0x00]); // PINGREQ
        let mut reader = &input[..];

        let first = read_packet(&mut reader).await.unwrap().unwrap();
        assert_eq!(first.packet_type(), MqttPacketType::Publish);
        assert!(first.is_original());

        let second = read_packet(&mut reader).await.unwrap().unwrap();
        assert_eq!(second.packet(), &MqttPacket::PingReq);

        assert!(read_packet(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eof_inside_frame_is_truncated() {
        let mut reader = &PUBLISH[..6];
        assert!(matches!(
            read_packet(&mut reader).await,
            Err(CodecError::Truncated)
        ));
    }

    #[tokio::test]
    async fn test_eof_inside_length_is_truncated() {
        // Continuation bit set, then end of stream
        let mut reader: &[u8] = &[0x30, 0x80];
        assert!(matches!(
            read_packet(&mut reader).await,
            Err(CodecError::Truncated)
        ));
    }

    #[tokio::test]
    async fn test_largest_frame_header_with_short_body() {
        // Remaining length 268435455, then three body bytes and end of stream
        let mut reader: &[u8] = &[0x30, 0xFF, 0xFF, 0xFF, 0x7F, 0x00, 0x01, b'a'];
        assert!(matches!(
            read_packet(&mut reader).await,
            Err(CodecError::Truncated)
        ));
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_overlong_remaining_length() {
        let mut reader: &[u8] = &[0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0x01];
        assert!(matches!(
            read_packet(&mut reader).await,
            Err(CodecError::InvalidRemainingLength)
        ));
    }

    #[tokio::test]
    async fn test_multi_byte_remaining_length() {
        let payload = vec![b'x'; 200];
        let packet = ControlPacket::new(MqttPacket::Publish(ParsedPublish {
            topic: "big".to_string(),
            payload: payload.clone(),
            qos: 0,
            retain: false,
            dup: false,
            packet_id: None,
        }));
        let bytes = packet.to_bytes().unwrap().into_owned();
        // 2 + 3 + 200 = 205 needs two length bytes
        assert_eq!(&bytes[1..3], &[0xCD, 0x01]);

        let mut reader = &bytes[..];
        let decoded = read_packet(&mut reader).await.unwrap().unwrap();
        match decoded.packet() {
            MqttPacket::Publish(p) => assert_eq!(p.payload, payload),
            _ => panic!("Expected PUBLISH packet"),
        }
    }

    #[tokio::test]
    async fn test_untouched_packet_is_byte_exact() {
        let mut reader = &PUBLISH[..];
        let packet = read_packet(&mut reader).await.unwrap().unwrap();

        let mut out = Vec::new();
        write_packet(&mut out, &packet).await.unwrap();
        assert_eq!(out, PUBLISH);
    }

    #[tokio::test]
    async fn test_mutated_packet_is_reencoded() {
        let mut reader = &PUBLISH[..];
        let mut packet = read_packet(&mut reader).await.unwrap().unwrap();
        if let MqttPacket::Publish(p) = packet.packet_mut() {
            p.topic = "other/".to_string();
        }
        assert!(!packet.is_original());

        let bytes = packet.to_bytes().unwrap();
        match parse_packet(&bytes).unwrap() {
            MqttPacket::Publish(p) => {
                assert_eq!(p.topic, "other/");
                assert_eq!(p.payload, b"hello");
            }
            _ => panic!("Expected PUBLISH packet"),
        }
    }
}
