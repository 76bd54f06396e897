use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use rustc_hash::FxHashSet;
use tracing::{debug, trace};

use crate::channel::ChannelRole;
use crate::error::RudpError;
use crate::packet::{ChannelId, MessageKind, MessagePacket, Seq};

/// Number of delivered seqs below `remote_next` that are remembered for duplicate detection.
///  Anything older is rejected based on `remote_next` alone.
const PROCESSED_SEQ_HISTORY: Seq = 4096;

/// The outcome of a receive pass, to be executed in order after the receive lock is released
#[derive(Debug)]
pub(crate) enum ReceiveAction {
    Deliver(Vec<u8>),
    /// server role: the client's SYN arrived
    IncomingConnection,
    /// client role: the server's handshake reply arrived
    HandshakeAcknowledged,
    /// the channel must be torn down; no further actions follow
    ProtocolViolation(RudpError),
}

/// Receive side state of a channel: packets that arrived but were not delivered yet, either
///  because they are out of order or because their fragment group is incomplete.
pub(crate) struct ReceiveBuffers {
    channel_id: ChannelId,
    role: ChannelRole,
    remote_next: Seq,
    buffer: BTreeMap<Seq, MessagePacket>,
    processed: FxHashSet<Seq>,
}

impl ReceiveBuffers {
    pub fn new(channel_id: ChannelId, role: ChannelRole, remote_start_sequence: Seq) -> ReceiveBuffers {
        ReceiveBuffers {
            channel_id,
            role,
            remote_next: remote_start_sequence,
            buffer: BTreeMap::new(),
            processed: FxHashSet::default(),
        }
    }

    /// Buffers a packet for the next receive pass. Packets that were delivered already or that
    ///  are buffered already are dropped, returning `false`.
    pub fn insert(&mut self, packet: MessagePacket) -> bool {
        if packet.seq < self.remote_next || self.processed.contains(&packet.seq) {
            trace!("channel {}: packet {} was delivered already - dropping", self.channel_id, packet.seq);
            return false;
        }

        match self.buffer.entry(packet.seq) {
            Entry::Occupied(_) => {
                trace!("channel {}: packet {} is buffered already - dropping", self.channel_id, packet.seq);
                false
            }
            Entry::Vacant(e) => {
                e.insert(packet);
                true
            }
        }
    }

    /// Delivers everything that is in order, advancing `remote_next` past it. Packets beyond a
    ///  gap and incomplete fragment groups stay buffered for a later pass.
    pub fn process(&mut self) -> Vec<ReceiveAction> {
        let mut actions = Vec::new();

        let snapshot = self.buffer.keys().cloned().collect::<Vec<_>>();
        for seq in snapshot {
            if self.processed.contains(&seq) {
                continue;
            }
            if seq > self.remote_next {
                // there is a gap before this packet, but a later packet may complete a group
                //  that starts at remote_next
                continue;
            }
            if seq < self.remote_next {
                debug!("channel {}: stale packet {} below {} in receive buffer", self.channel_id, seq, self.remote_next);
                self.buffer.remove(&seq);
                break;
            }

            let Some(packet) = self.buffer.get(&seq) else {
                continue;
            };

            if !packet.is_fragment() {
                let Some(packet) = self.buffer.remove(&seq) else {
                    continue;
                };
                self.mark_processed(seq);
                self.remote_next += 1;
                if let Some(action) = self.on_single_packet(packet) {
                    actions.push(action);
                }
                continue;
            }

            let group_id = packet.group_id;
            let qty = packet.qty;
            let fragment_seqs = self.buffer.values()
                .filter(|p| p.group_id == group_id && !self.processed.contains(&p.seq))
                .map(|p| p.seq)
                .collect::<Vec<_>>();

            if fragment_seqs.len() > qty as usize {
                actions.push(ReceiveAction::ProtocolViolation(RudpError::ProtocolViolation {
                    channel_id: self.channel_id,
                    message: format!("fragment group {} has {} fragments, but declares {}", group_id, fragment_seqs.len(), qty),
                }));
                return actions;
            }
            if fragment_seqs.len() < qty as usize {
                trace!("channel {}: fragment group {} has {} of {} fragments", self.channel_id, group_id, fragment_seqs.len(), qty);
                break;
            }

            let mut message = Vec::new();
            for fragment_seq in fragment_seqs {
                if let Some(fragment) = self.buffer.remove(&fragment_seq) {
                    message.extend_from_slice(&fragment.payload);
                }
                self.mark_processed(fragment_seq);
            }
            self.remote_next += qty;
            actions.push(ReceiveAction::Deliver(message));
        }

        self.buffer.retain(|seq, _| !self.processed.contains(seq));
        let oldest_remembered = self.remote_next.saturating_sub(PROCESSED_SEQ_HISTORY);
        self.processed.retain(|seq| *seq >= oldest_remembered);

        actions
    }

    fn mark_processed(&mut self, seq: Seq) {
        self.processed.insert(seq);
    }

    fn on_single_packet(&self, packet: MessagePacket) -> Option<ReceiveAction> {
        match (packet.kind, self.role) {
            (MessageKind::Data, _) => Some(ReceiveAction::Deliver(packet.payload)),
            (MessageKind::Syn, ChannelRole::Server) => Some(ReceiveAction::IncomingConnection),
            (MessageKind::Ack, ChannelRole::Client) => Some(ReceiveAction::HandshakeAcknowledged),
            (kind, role) => {
                debug!("channel {}: ignoring {:?} packet {} in {:?} role", self.channel_id, kind, packet.seq, role);
                None
            }
        }
    }

    #[cfg(test)]
    pub fn remote_next(&self) -> Seq {
        self.remote_next
    }

    #[cfg(test)]
    pub fn buffered_seqs(&self) -> Vec<Seq> {
        self.buffer.keys().cloned().collect()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use rand::seq::SliceRandom;

    fn packet(seq: Seq, group_id: i32, qty: i32, payload: &[u8]) -> MessagePacket {
        MessagePacket {
            channel_id: 1,
            seq,
            group_id,
            qty,
            kind: MessageKind::Data,
            payload: payload.to_vec(),
        }
    }

    fn handshake(seq: Seq, kind: MessageKind) -> MessagePacket {
        MessagePacket {
            channel_id: 1,
            seq,
            group_id: 1,
            qty: 0,
            kind,
            payload: vec![],
        }
    }

    fn delivered(actions: Vec<ReceiveAction>) -> Vec<Vec<u8>> {
        actions.into_iter()
            .map(|a| match a {
                ReceiveAction::Deliver(msg) => msg,
                other => panic!("unexpected action {:?}", other),
            })
            .collect()
    }

    /// three single messages at 100..=102, a group of three fragments at 103..=105, one more
    ///  single message at 106
    fn sequence() -> Vec<MessagePacket> {
        vec![
            packet(100, 1, 0, b"a"),
            packet(101, 2, 0, b"b"),
            packet(102, 3, 0, b"c"),
            packet(103, 4, 3, b"d1"),
            packet(104, 4, 3, b"d2"),
            packet(105, 4, 3, b"d3"),
            packet(106, 5, 0, b"e"),
        ]
    }

    fn expected_sequence() -> Vec<Vec<u8>> {
        vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d1d2d3".to_vec(), b"e".to_vec()]
    }

    #[rstest]
    #[case::in_order(vec![0, 1, 2, 3, 4, 5, 6])]
    #[case::reversed(vec![6, 5, 4, 3, 2, 1, 0])]
    #[case::fragments_reversed(vec![0, 1, 2, 5, 4, 3, 6])]
    #[case::group_before_gap(vec![3, 4, 5, 6, 2, 1, 0])]
    #[case::interleaved(vec![4, 0, 6, 2, 5, 1, 3])]
    #[case::last_fragment_last(vec![0, 1, 2, 3, 4, 6, 5])]
    fn test_reordering(#[case] arrival_order: Vec<usize>) {
        let packets = sequence();

        let mut buffers = ReceiveBuffers::new(1, ChannelRole::Server, 100);
        let mut all_delivered = Vec::new();
        for idx in arrival_order {
            assert!(buffers.insert(packets[idx].clone()));
            all_delivered.extend(delivered(buffers.process()));
        }

        assert_eq!(all_delivered, expected_sequence());
        assert_eq!(buffers.remote_next(), 107);
        assert!(buffers.buffered_seqs().is_empty());
    }

    #[test]
    fn test_reordering_random_permutations() {
        for _ in 0..50 {
            let mut packets = sequence();
            packets.shuffle(&mut rand::rng());

            let mut buffers = ReceiveBuffers::new(1, ChannelRole::Client, 100);
            let mut all_delivered = Vec::new();
            for p in packets {
                buffers.insert(p);
                all_delivered.extend(delivered(buffers.process()));
            }
            assert_eq!(all_delivered, expected_sequence());
        }
    }

    #[test]
    fn test_batch_delivery_in_one_pass() {
        let mut buffers = ReceiveBuffers::new(1, ChannelRole::Server, 100);
        for p in sequence().into_iter().rev() {
            buffers.insert(p);
        }
        assert_eq!(delivered(buffers.process()), expected_sequence());
    }

    #[rstest]
    #[case::buffered(false)]
    #[case::delivered(true)]
    fn test_duplicate_suppression(#[case] process_in_between: bool) {
        let mut buffers = ReceiveBuffers::new(1, ChannelRole::Server, 100);

        let mut all_delivered = Vec::new();
        assert!(buffers.insert(packet(100, 1, 0, b"x")));
        if process_in_between {
            all_delivered.extend(delivered(buffers.process()));
        }
        assert!(!buffers.insert(packet(100, 1, 0, b"x")));
        all_delivered.extend(delivered(buffers.process()));

        assert_eq!(all_delivered, vec![b"x".to_vec()]);
    }

    #[test]
    fn test_duplicate_fragment_suppression() {
        let mut buffers = ReceiveBuffers::new(1, ChannelRole::Server, 100);
        buffers.insert(packet(100, 7, 2, b"a"));
        assert!(!buffers.insert(packet(100, 7, 2, b"a")));
        assert!(delivered(buffers.process()).is_empty());

        buffers.insert(packet(101, 7, 2, b"b"));
        assert_eq!(delivered(buffers.process()), vec![b"ab".to_vec()]);

        assert!(!buffers.insert(packet(101, 7, 2, b"b")));
        assert!(delivered(buffers.process()).is_empty());
        assert_eq!(buffers.remote_next(), 102);
    }

    #[test]
    fn test_gap_keeps_later_packets_buffered() {
        let mut buffers = ReceiveBuffers::new(1, ChannelRole::Server, 100);
        buffers.insert(packet(101, 2, 0, b"b"));
        buffers.insert(packet(102, 3, 0, b"c"));
        assert!(delivered(buffers.process()).is_empty());
        assert_eq!(buffers.buffered_seqs(), vec![101, 102]);
        assert_eq!(buffers.remote_next(), 100);
    }

    #[test]
    fn test_incomplete_group_blocks_later_packets() {
        let mut buffers = ReceiveBuffers::new(1, ChannelRole::Server, 100);
        buffers.insert(packet(100, 1, 2, b"a"));
        buffers.insert(packet(102, 2, 0, b"c"));
        assert!(delivered(buffers.process()).is_empty());

        buffers.insert(packet(101, 1, 2, b"b"));
        assert_eq!(delivered(buffers.process()), vec![b"ab".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_group_overrun_is_protocol_violation() {
        let mut buffers = ReceiveBuffers::new(1, ChannelRole::Server, 100);
        buffers.insert(packet(100, 1, 0, b"ok"));
        buffers.insert(packet(101, 2, 2, b"a"));
        buffers.insert(packet(102, 2, 2, b"b"));
        buffers.insert(packet(103, 2, 2, b"c"));

        let actions = buffers.process();
        assert_eq!(actions.len(), 2);
        assert!(matches!(&actions[0], ReceiveAction::Deliver(msg) if msg == b"ok"));
        assert!(matches!(&actions[1], ReceiveAction::ProtocolViolation(RudpError::ProtocolViolation { channel_id: 1, .. })));
    }

    #[rstest]
    #[case::server_syn(ChannelRole::Server, MessageKind::Syn, true)]
    #[case::server_ack(ChannelRole::Server, MessageKind::Ack, false)]
    #[case::client_ack(ChannelRole::Client, MessageKind::Ack, true)]
    #[case::client_syn(ChannelRole::Client, MessageKind::Syn, false)]
    fn test_handshake_packets(#[case] role: ChannelRole, #[case] kind: MessageKind, #[case] expect_action: bool) {
        let mut buffers = ReceiveBuffers::new(1, role, 100);
        buffers.insert(handshake(100, kind));
        buffers.insert(packet(101, 2, 0, b"data"));

        let actions = buffers.process();
        let mut actions = actions.into_iter();
        if expect_action {
            match (role, actions.next()) {
                (ChannelRole::Server, Some(ReceiveAction::IncomingConnection)) => {}
                (ChannelRole::Client, Some(ReceiveAction::HandshakeAcknowledged)) => {}
                (_, other) => panic!("unexpected action {:?}", other),
            }
        }
        assert!(matches!(actions.next(), Some(ReceiveAction::Deliver(msg)) if msg == b"data"));
        assert!(actions.next().is_none());
        assert_eq!(buffers.remote_next(), 102);
    }

    #[test]
    fn test_syn_is_processed_once() {
        let mut buffers = ReceiveBuffers::new(1, ChannelRole::Server, 100);
        buffers.insert(handshake(100, MessageKind::Syn));
        assert!(matches!(buffers.process().as_slice(), [ReceiveAction::IncomingConnection]));

        assert!(!buffers.insert(handshake(100, MessageKind::Syn)));
        assert!(buffers.process().is_empty());
    }

    #[test]
    fn test_processed_history_is_bounded() {
        let mut buffers = ReceiveBuffers::new(1, ChannelRole::Server, 0);
        for seq in 0..10_000 {
            buffers.insert(packet(seq, seq + 1, 0, b""));
            buffers.process();
        }
        assert!(buffers.processed.len() <= PROCESSED_SEQ_HISTORY as usize);
        assert!(!buffers.insert(packet(5, 6, 0, b"")));
    }
}
