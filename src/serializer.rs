use bytes::{BufMut, BytesMut};
use anyhow::bail;

use crate::packet::{MessageKind, MessagePacket};
use crate::safe_converter::PrecheckedCast;
use crate::util::buf_ext::BufExt;

/// Encoding of message packets. This is pluggable so that both sides of a connection can
///  agree on a different encoding, the only requirement being that every field round-trips
///  exactly.
pub trait PacketSerializer: Send + Sync + 'static {
    fn serialize(&self, header: &[u8], packet: &MessagePacket, buf: &mut BytesMut);

    fn deserialize(&self, header: &[u8], buf: &[u8]) -> anyhow::Result<MessagePacket>;
}


/// The reference binary layout, all numbers little endian:
///
/// ```ascii
///  0: magic prefix (2 bytes)
///  2: channel id (i32)
///  6: seq (i32)
/// 10: group id (i32)
/// 14: qty (i32) - fragment count, 0 for unfragmented messages
/// 18: kind (u8)
/// 19: payload length (i32)
/// 23: payload
/// ```
pub struct BinarySerializer;

impl PacketSerializer for BinarySerializer {
    fn serialize(&self, header: &[u8], packet: &MessagePacket, buf: &mut BytesMut) {
        buf.reserve(header.len() + 17 + 4 + packet.payload.len());

        buf.put_slice(header);
        buf.put_i32_le(packet.channel_id);
        buf.put_i32_le(packet.seq);
        buf.put_i32_le(packet.group_id);
        buf.put_i32_le(packet.qty);
        buf.put_u8(packet.kind.into());
        buf.put_i32_le(packet.payload.len().prechecked_cast());
        buf.put_slice(&packet.payload);
    }

    fn deserialize(&self, header: &[u8], mut buf: &[u8]) -> anyhow::Result<MessagePacket> {
        if !buf.starts_with(header) {
            bail!("not a message packet");
        }
        buf = &buf[header.len()..];

        let channel_id = buf.try_read_i32_le()?;
        let seq = buf.try_read_i32_le()?;
        let group_id = buf.try_read_i32_le()?;
        let qty = buf.try_read_i32_le()?;
        let kind = MessageKind::try_from(buf.try_read_u8()?)?;

        let payload_len = buf.try_read_i32_le()?;
        if payload_len < 0 {
            bail!("negative payload length {}", payload_len);
        }
        let payload = buf.try_read_bytes(payload_len as usize)?;

        if qty < 0 {
            bail!("negative fragment count {}", qty);
        }

        Ok(MessagePacket {
            channel_id,
            seq,
            group_id,
            qty,
            kind,
            payload,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const HEADER: [u8; 2] = [0xFF, 0x01];

    fn packet(seq: i32, group_id: i32, qty: i32, kind: MessageKind, payload: Vec<u8>) -> MessagePacket {
        MessagePacket {
            channel_id: 1,
            seq,
            group_id,
            qty,
            kind,
            payload,
        }
    }

    #[rstest]
    #[case::syn(packet(100, 1, 0, MessageKind::Syn, vec![]),
        vec![0xFF,0x01, 1,0,0,0, 100,0,0,0, 1,0,0,0, 0,0,0,0, 1, 0,0,0,0])]
    #[case::ack(packet(200, 1, 0, MessageKind::Ack, vec![]),
        vec![0xFF,0x01, 1,0,0,0, 200,0,0,0, 1,0,0,0, 0,0,0,0, 2, 0,0,0,0])]
    #[case::data(packet(101, 2, 0, MessageKind::Data, vec![9, 8, 7]),
        vec![0xFF,0x01, 1,0,0,0, 101,0,0,0, 2,0,0,0, 0,0,0,0, 3, 3,0,0,0, 9,8,7])]
    #[case::fragment(packet(0x01020304, 3, 2, MessageKind::Data, vec![5]),
        vec![0xFF,0x01, 1,0,0,0, 4,3,2,1, 3,0,0,0, 2,0,0,0, 3, 1,0,0,0, 5])]
    fn test_ser(#[case] packet: MessagePacket, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        BinarySerializer.serialize(&HEADER, &packet, &mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());

        let deser = BinarySerializer.deserialize(&HEADER, &buf).unwrap();
        assert_eq!(deser, packet);
    }

    #[test]
    fn test_round_trip_large_payload() {
        let payload = (0..10_000).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        let original = packet(105, 17, 4, MessageKind::Data, payload);

        let mut buf = BytesMut::new();
        BinarySerializer.serialize(&HEADER, &original, &mut buf);
        assert_eq!(buf.len(), 23 + 10_000);
        assert_eq!(BinarySerializer.deserialize(&HEADER, &buf).unwrap(), original);
    }

    #[rstest]
    #[case::control_header(vec![0xFF,0x02, 1,0,0,0, 100,0,0,0, 1,0,0,0, 0,0,0,0, 1, 0,0,0,0])]
    #[case::truncated_header(vec![0xFF,0x01, 1,0,0,0, 100,0,0,0, 1,0])]
    #[case::unknown_kind(vec![0xFF,0x01, 1,0,0,0, 100,0,0,0, 1,0,0,0, 0,0,0,0, 0, 0,0,0,0])]
    #[case::truncated_payload(vec![0xFF,0x01, 1,0,0,0, 101,0,0,0, 2,0,0,0, 0,0,0,0, 3, 3,0,0,0, 9,8])]
    #[case::negative_len(vec![0xFF,0x01, 1,0,0,0, 101,0,0,0, 2,0,0,0, 0,0,0,0, 3, 0xff,0xff,0xff,0xff])]
    #[case::negative_qty(vec![0xFF,0x01, 1,0,0,0, 101,0,0,0, 2,0,0,0, 0xff,0xff,0xff,0xff, 3, 0,0,0,0])]
    fn test_deser_invalid(#[case] raw: Vec<u8>) {
        assert!(BinarySerializer.deserialize(&HEADER, &raw).is_err());
    }
}
