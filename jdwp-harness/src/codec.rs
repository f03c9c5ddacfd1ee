// Packet framing
//
// Encodes and decodes command/reply packets. Decoding is resumable: a buffer
// holding less than one whole packet yields `Truncated` (or `Ok(None)` from the
// streaming decoder) so the transport can read more and try again.

use crate::commands::{command_sets, event_set_commands};
use crate::events::{parse_event_packet, EventSet};
use crate::protocol::*;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// A decoded packet classified by what the session has to do with it.
#[derive(Debug, Clone, PartialEq)]
pub enum PacketBody {
    Reply(ReplyPacket),
    Events(EventSet),
    /// Debuggee-originated commands other than events.
    Command(CommandPacket),
}

impl Packet {
    /// Classify the packet; event payloads are parsed here.
    pub fn into_body(self) -> HarnessResult<PacketBody> {
        match self {
            Packet::Reply(reply) => Ok(PacketBody::Reply(reply)),
            Packet::Command(cmd)
                if cmd.command_set == command_sets::EVENT
                    && cmd.command == event_set_commands::COMPOSITE =>
            {
                Ok(PacketBody::Events(parse_event_packet(&cmd.data)?))
            }
            Packet::Command(cmd) => Ok(PacketBody::Command(cmd)),
        }
    }
}

/// Build the wire form of an event set.
pub fn event_packet(id: u32, events: &EventSet) -> CommandPacket {
    CommandPacket::new(id, command_sets::EVENT, event_set_commands::COMPOSITE)
        .with_data(events.encode())
}

/// Encode a packet into a fresh buffer.
pub fn encode(packet: &Packet) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(packet.length());
    encode_into(packet, &mut buf);
    buf.to_vec()
}

/// Append a packet to `dst`. The length field is written last, once the
/// body has been laid out. The flags byte follows the packet variant.
pub fn encode_into(packet: &Packet, dst: &mut BytesMut) {
    let start = dst.len();
    dst.put_u32(0); // length placeholder

    match packet {
        Packet::Command(cmd) => {
            dst.put_u32(cmd.id);
            dst.put_u8(COMMAND_FLAG);
            dst.put_u8(cmd.command_set);
            dst.put_u8(cmd.command);
            dst.put_slice(&cmd.data);
        }
        Packet::Reply(reply) => {
            dst.put_u32(reply.id);
            dst.put_u8(REPLY_FLAG);
            dst.put_u16(reply.error_code);
            dst.put_slice(&reply.data);
        }
    }

    let length = (dst.len() - start) as u32;
    dst[start..start + 4].copy_from_slice(&length.to_be_bytes());
}

/// Validate the header at the front of `buf` and return the packet length.
pub fn frame_length(buf: &[u8], max_packet_size: usize) -> HarnessResult<usize> {
    if buf.len() < HEADER_SIZE {
        return Err(HarnessError::Truncated {
            needed: HEADER_SIZE - buf.len(),
        });
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length < HEADER_SIZE {
        return Err(HarnessError::MalformedHeader(format!(
            "Invalid packet length: {}",
            length
        )));
    }

    if length > max_packet_size {
        return Err(HarnessError::MalformedHeader(format!(
            "Packet too large: {} bytes (max: {} bytes)",
            length, max_packet_size
        )));
    }

    let flags = buf[8];
    if flags != COMMAND_FLAG && flags != REPLY_FLAG {
        return Err(HarnessError::MalformedHeader(format!(
            "Invalid flags: {:#x}",
            flags
        )));
    }

    Ok(length)
}

/// Decode one packet from the front of `buf`; trailing bytes are ignored.
pub fn decode(buf: &[u8]) -> HarnessResult<Packet> {
    decode_with_limit(buf, MAX_PACKET_SIZE)
}

pub fn decode_with_limit(buf: &[u8], max_packet_size: usize) -> HarnessResult<Packet> {
    let length = frame_length(buf, max_packet_size)?;
    if buf.len() < length {
        return Err(HarnessError::Truncated {
            needed: length - buf.len(),
        });
    }

    let mut frame = &buf[4..length];
    let id = frame.get_u32();
    let flags = frame.get_u8();

    let packet = if flags == REPLY_FLAG {
        let error_code = frame.get_u16();
        Packet::Reply(ReplyPacket {
            id,
            flags,
            error_code,
            data: bytes::Bytes::copy_from_slice(frame),
        })
    } else {
        let command_set = frame.get_u8();
        let command = frame.get_u8();
        Packet::Command(CommandPacket {
            id,
            flags,
            command_set,
            command,
            data: frame.to_vec(),
        })
    };

    Ok(packet)
}

/// Streaming codec for framed readers and writers.
#[derive(Debug, Clone, Copy)]
pub struct PacketCodec {
    max_packet_size: usize,
}

impl PacketCodec {
    pub fn new(max_packet_size: usize) -> Self {
        Self { max_packet_size }
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(MAX_PACKET_SIZE)
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = HarnessError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, HarnessError> {
        match decode_with_limit(src, self.max_packet_size) {
            Ok(packet) => {
                src.advance(packet.length());
                Ok(Some(packet))
            }
            Err(HarnessError::Truncated { needed }) => {
                src.reserve(needed);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = HarnessError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), HarnessError> {
        encode_into(&packet, dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventrequest::SuspendPolicy;
    use crate::events::{Event, EventKind};

    #[test]
    fn test_command_packet_encode() {
        let packet = CommandPacket::new(1, 1, 1).into();
        let encoded = encode(&packet);

        assert_eq!(encoded.len(), HEADER_SIZE);
        assert_eq!(&encoded[0..4], &[0, 0, 0, 11]); // length (big-endian)
        assert_eq!(&encoded[4..8], &[0, 0, 0, 1]); // id (big-endian)
        assert_eq!(encoded[8], 0x00); // command flag
        assert_eq!(encoded[9], 1); // command set
        assert_eq!(encoded[10], 1); // command
    }

    #[test]
    fn test_flags_follow_packet_kind() {
        let mut cmd = CommandPacket::new(4, 1, 1);
        cmd.flags = REPLY_FLAG;
        let encoded = encode(&cmd.into());
        assert_eq!(encoded[8], COMMAND_FLAG);

        match decode(&encoded).unwrap() {
            Packet::Command(decoded) => assert_eq!(decoded.flags, COMMAND_FLAG),
            other => panic!("expected command, got {:?}", other),
        }

        let mut reply = ReplyPacket::new(4, 0, Vec::new());
        reply.flags = COMMAND_FLAG;
        assert_eq!(encode(&reply.into())[8], REPLY_FLAG);
    }

    #[test]
    fn test_big_endian_encoding() {
        let packet = CommandPacket::new(0x12345678, 1, 1).into();
        let encoded = encode(&packet);

        assert_eq!(&encoded[4..8], &[0x12, 0x34, 0x56, 0x78]);
        assert_ne!(&encoded[4..8], &[0x78, 0x56, 0x34, 0x12]);
    }

    #[test]
    fn test_length_is_backpatched() {
        let packet = CommandPacket::new(9, 2, 16).with_data(vec![0xAA; 300]).into();
        let encoded = encode(&packet);
        assert_eq!(encoded.len(), HEADER_SIZE + 300);
        assert_eq!(
            u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]) as usize,
            encoded.len()
        );
    }

    #[test]
    fn test_reply_packet_decode() {
        let reply_data = vec![
            0, 0, 0, 13, // length = 13
            0, 0, 0, 1, // id = 1
            0x80, // reply flag
            0, 0, // error code = 0
            7, 8, // payload
        ];

        match decode(&reply_data).unwrap() {
            Packet::Reply(reply) => {
                assert_eq!(reply.id, 1);
                assert_eq!(reply.error_code, 0);
                assert!(!reply.is_error());
                assert_eq!(reply.data(), &[7, 8]);
            }
            other => panic!("expected reply, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_round_trip() {
        let packets: Vec<Packet> = vec![
            CommandPacket::new(7, 11, 14).with_data(vec![1, 2, 3]).into(),
            ReplyPacket::new(7, 103, vec![9, 9]).into(),
            ReplyPacket::new(u32::MAX, 0, Vec::new()).into(),
        ];
        for packet in packets {
            assert_eq!(decode(&encode(&packet)).unwrap(), packet);
        }
    }

    #[test]
    fn test_partial_input_is_truncated() {
        let encoded = encode(&CommandPacket::new(3, 1, 1).with_data(vec![0; 5]).into());

        assert!(matches!(
            decode(&encoded[..4]),
            Err(HarnessError::Truncated { needed: 7 })
        ));
        assert!(matches!(
            decode(&encoded[..12]),
            Err(HarnessError::Truncated { needed: 4 })
        ));
    }

    #[test]
    fn test_malformed_headers() {
        let mut short = encode(&CommandPacket::new(1, 1, 1).into());
        short[3] = 5;
        assert!(matches!(decode(&short), Err(HarnessError::MalformedHeader(_))));

        let mut bad_flags = encode(&CommandPacket::new(1, 1, 1).into());
        bad_flags[8] = 0x42;
        assert!(matches!(
            decode(&bad_flags),
            Err(HarnessError::MalformedHeader(_))
        ));

        let huge = encode(&CommandPacket::new(1, 1, 1).with_data(vec![0; 64]).into());
        assert!(matches!(
            decode_with_limit(&huge, 32),
            Err(HarnessError::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_streaming_decoder_resumes() {
        let first: Packet = ReplyPacket::new(1, 0, vec![1, 2, 3, 4]).into();
        let second: Packet = CommandPacket::new(2, 1, 9).into();
        let mut wire = encode(&first);
        wire.extend_from_slice(&encode(&second));

        let mut codec = PacketCodec::default();
        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();

        // Feed three bytes at a time, as a slow socket would
        for chunk in wire.chunks(3) {
            buf.extend_from_slice(chunk);
            while let Some(packet) = codec.decode(&mut buf).unwrap() {
                decoded.push(packet);
            }
        }

        assert_eq!(decoded, vec![first, second]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_event_packet_classification() {
        let set = EventSet::new(
            SuspendPolicy::All,
            vec![Event::new(1, EventKind::ThreadStart { thread: 5 })],
        );
        let packet = Packet::from(event_packet(44, &set));
        let decoded = decode(&encode(&packet)).unwrap();

        match decoded.into_body().unwrap() {
            PacketBody::Events(events) => assert_eq!(events, set),
            other => panic!("expected events, got {:?}", other),
        }

        let other = Packet::from(CommandPacket::new(1, 1, 1));
        assert!(matches!(other.into_body().unwrap(), PacketBody::Command(_)));
    }
}
