use std::fmt::{Display, Formatter};
use bytes::{BufMut, BytesMut};
use anyhow::bail;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::util::buf_ext::{BufExt, BufMutExt};

pub type ChannelId = i32;
pub type Seq = i32;
pub type GroupId = i32;

/// Channel id for control traffic that addresses the connection rather than a channel
pub const CONNECTION_CHANNEL_ID: ChannelId = 0;

/// Bytes a message packet adds around its payload: magic prefix, four int32 fields, kind and
///  payload length
pub const MESSAGE_PACKET_OVERHEAD: usize = 2 + 4 * 4 + 1 + 4;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MessageKind {
    /// client side handshake request
    Syn = 1,
    /// server side handshake reply
    Ack = 2,
    Data = 3,
}

/// One unit of sequenced, application-plane traffic on a channel.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MessagePacket {
    pub channel_id: ChannelId,
    pub seq: Seq,
    pub group_id: GroupId,
    /// number of fragments in the group, `0` for an unfragmented message
    pub qty: i32,
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

impl MessagePacket {
    pub fn is_fragment(&self) -> bool {
        self.qty > 0
    }
}

impl Display for MessagePacket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "CH:{} | SEQ:{} | GRP:{} | KIND:{:?} | QTY:{} | LEN:{}",
               self.channel_id, self.seq, self.group_id, self.kind, self.qty, self.payload.len())
    }
}


#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ControlKind {
    Ack = 1,
    Ping = 2,
    ChannelRequest = 3,
    ChannelAssign = 4,
}

pub const PING_PROBE: i32 = 0;
pub const PING_REPLY: i32 = 1;

/// Connection and channel control-plane traffic. It is not sequenced and never retransmitted.
///
/// ```ascii
/// 0: magic prefix (2 bytes)
/// 2: channel id (i32 LE) - 0 for connection scoped packets
/// 6: kind (u8)
/// 7: int arg (i32 LE) - acknowledged seq, ping direction or assigned channel id
/// 11: string arg (varint length + UTF-8) - channel name
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ControlPacket {
    pub channel_id: ChannelId,
    pub kind: ControlKind,
    pub int_arg: i32,
    pub string_arg: String,
}

impl ControlPacket {
    pub fn ack(channel_id: ChannelId, seq: Seq) -> ControlPacket {
        Self::new(channel_id, ControlKind::Ack, seq, "")
    }

    pub fn ping_probe(channel_id: ChannelId) -> ControlPacket {
        Self::new(channel_id, ControlKind::Ping, PING_PROBE, "")
    }

    pub fn ping_reply(channel_id: ChannelId) -> ControlPacket {
        Self::new(channel_id, ControlKind::Ping, PING_REPLY, "")
    }

    pub fn channel_request(name: &str) -> ControlPacket {
        Self::new(CONNECTION_CHANNEL_ID, ControlKind::ChannelRequest, 0, name)
    }

    pub fn channel_assign(assigned_id: ChannelId, name: &str) -> ControlPacket {
        Self::new(CONNECTION_CHANNEL_ID, ControlKind::ChannelAssign, assigned_id, name)
    }

    fn new(channel_id: ChannelId, kind: ControlKind, int_arg: i32, string_arg: &str) -> ControlPacket {
        ControlPacket {
            channel_id,
            kind,
            int_arg,
            string_arg: string_arg.to_string(),
        }
    }

    pub fn ser(&self, header: &[u8], buf: &mut BytesMut) {
        buf.put_slice(header);
        buf.put_i32_le(self.channel_id);
        buf.put_u8(self.kind.into());
        buf.put_i32_le(self.int_arg);
        buf.put_string(&self.string_arg);
    }

    pub fn deser(header: &[u8], mut buf: &[u8]) -> anyhow::Result<ControlPacket> {
        if !buf.starts_with(header) {
            bail!("not a control packet");
        }
        buf = &buf[header.len()..];

        let channel_id = buf.try_read_i32_le()?;
        let kind = ControlKind::try_from(buf.try_read_u8()?)?;
        let int_arg = buf.try_read_i32_le()?;
        let string_arg = buf.try_read_string()?;

        Ok(ControlPacket {
            channel_id,
            kind,
            int_arg,
            string_arg,
        })
    }
}


/// What a datagram is, judged by its magic prefix and nothing else
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DatagramKind {
    Message,
    Control,
    Unrecognized,
}

impl DatagramKind {
    pub fn classify(buf: &[u8], message_header: &[u8], control_header: &[u8]) -> DatagramKind {
        if buf.starts_with(message_header) {
            DatagramKind::Message
        }
        else if buf.starts_with(control_header) {
            DatagramKind::Control
        }
        else {
            DatagramKind::Unrecognized
        }
    }
}
