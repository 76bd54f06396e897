use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

use crate::packet::{ChannelId, GroupId, MessageKind, MessagePacket, Seq};
use crate::safe_converter::PrecheckedCast;

pub(crate) struct PendingPacket {
    pub packet: MessagePacket,
    pub sent_at: Instant,
    pub num_sends: u32,
}

/// What a single wake of the send loop puts on the wire
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum Transmission {
    Idle,
    Fresh(Vec<MessagePacket>),
    Retransmit(Vec<MessagePacket>),
}

/// Send side state of a channel: numbering, fragmentation, and the pending set of sent but
///  unacknowledged packets.
pub(crate) struct SendBuffers {
    channel_id: ChannelId,
    max_fragment_size: usize,
    local_next: Seq,
    group_counter: GroupId,
    send_queue: Vec<MessagePacket>,
    pending: BTreeMap<Seq, PendingPacket>,
}

impl SendBuffers {
    pub fn new(channel_id: ChannelId, start_sequence: Seq, max_fragment_size: usize) -> SendBuffers {
        SendBuffers {
            channel_id,
            max_fragment_size,
            local_next: start_sequence,
            group_counter: 1,
            send_queue: Vec::new(),
            pending: BTreeMap::new(),
        }
    }

    /// Numbers a message's packets and appends them to the send queue. Messages longer than
    ///  the maximum fragment size are split into a fragment group, shorter ones (including
    ///  empty messages) go into a single packet with `qty` 0.
    ///
    /// Returns the number of packets that were enqueued.
    pub fn enqueue(&mut self, kind: MessageKind, data: &[u8]) -> usize {
        let group_id = self.group_counter;
        self.group_counter += 1;

        if data.len() <= self.max_fragment_size {
            let packet = self.next_packet(group_id, 0, kind, data);
            self.send_queue.push(packet);
            return 1;
        }

        let qty: i32 = data.len().div_ceil(self.max_fragment_size).prechecked_cast();
        trace!("channel {}: splitting message of {} bytes into {} fragments", self.channel_id, data.len(), qty);

        for chunk in data.chunks(self.max_fragment_size) {
            let packet = self.next_packet(group_id, qty, kind, chunk);
            self.send_queue.push(packet);
        }
        qty as usize
    }

    fn next_packet(&mut self, group_id: GroupId, qty: i32, kind: MessageKind, payload: &[u8]) -> MessagePacket {
        let seq = self.local_next;
        self.local_next += 1;

        MessagePacket {
            channel_id: self.channel_id,
            seq,
            group_id,
            qty,
            kind,
            payload: payload.to_vec(),
        }
    }

    /// Returns `true` if the seq was pending, `false` for duplicate or unexpected acks
    pub fn acknowledge(&mut self, seq: Seq) -> bool {
        self.pending.remove(&seq).is_some()
    }

    pub fn has_overdue(&self, now: Instant, retransmit_timeout: Duration) -> bool {
        self.pending.values()
            .any(|p| Self::is_overdue(p, now, retransmit_timeout))
    }

    fn is_overdue(pending: &PendingPacket, now: Instant, retransmit_timeout: Duration) -> bool {
        now.saturating_duration_since(pending.sent_at) > retransmit_timeout
    }

    /// Decides what to send on this wake. Overdue pending packets take precedence over
    ///  queued packets: if there are any, all of them (and nothing else) are sent again,
    ///  keeping their original seq. Otherwise the entire send queue moves to the pending set
    ///  and is returned for sending.
    ///
    /// Send timestamps are updated here, i.e. before the packets are actually on the wire.
    pub fn next_transmission(&mut self, now: Instant, retransmit_timeout: Duration) -> Transmission {
        let channel_id = self.channel_id;
        let overdue = self.pending.values_mut()
            .filter(|p| Self::is_overdue(p, now, retransmit_timeout))
            .map(|p| {
                p.sent_at = now;
                p.num_sends += 1;
                trace!("channel {}: packet {} is overdue, sending it for the {}. time", channel_id, p.packet.seq, p.num_sends);
                p.packet.clone()
            })
            .collect::<Vec<_>>();
        if !overdue.is_empty() {
            return Transmission::Retransmit(overdue);
        }

        if self.send_queue.is_empty() {
            return Transmission::Idle;
        }

        let fresh = std::mem::take(&mut self.send_queue);
        for packet in &fresh {
            self.pending.insert(packet.seq, PendingPacket {
                packet: packet.clone(),
                sent_at: now,
                num_sends: 1,
            });
        }
        Transmission::Fresh(fresh)
    }

    #[cfg(test)]
    pub fn pending_seqs(&self) -> Vec<Seq> {
        self.pending.keys().cloned().collect()
    }

    #[cfg(test)]
    pub fn num_sends(&self, seq: Seq) -> Option<u32> {
        self.pending.get(&seq).map(|p| p.num_sends)
    }
}
