use std::net::SocketAddr;
use std::sync::Arc;
use rustc_hash::FxHashMap;

use crate::channel::{Channel, ChannelRole};
use crate::error::RudpError;
use crate::packet::{ChannelId, CONNECTION_CHANNEL_ID};
use crate::state::State;

/// All channels of a connection, grouped by peer. Channel ids are unique per peer.
///
/// The table itself is not synchronized, the owning connection keeps it behind a single lock
///  so that lookup and allocation are both critical sections.
#[derive(Default)]
pub(crate) struct ChannelTable {
    by_peer: FxHashMap<SocketAddr, Vec<Arc<Channel>>>,
}

impl ChannelTable {
    pub fn get(&self, peer_addr: SocketAddr, channel_id: ChannelId) -> Option<Arc<Channel>> {
        self.by_peer.get(&peer_addr)?
            .iter()
            .find(|c| c.id() == channel_id)
            .cloned()
    }

    /// a channel that can still carry traffic, i.e. it exists and is not closing or closed
    pub fn get_usable(&self, peer_addr: SocketAddr, channel_id: ChannelId) -> Result<Arc<Channel>, RudpError> {
        self.get(peer_addr, channel_id)
            .filter(|c| c.state().is_usable())
            .ok_or(RudpError::UnknownChannel { peer_addr, channel_id })
    }

    /// A server role channel with the given name that never received anything, typically
    ///  because the peer's previous request was answered but the answer was lost
    pub fn find_reusable(&self, peer_addr: SocketAddr, name: &str) -> Option<Arc<Channel>> {
        self.by_peer.get(&peer_addr)?
            .iter()
            .find(|c| c.role() == ChannelRole::Server
                && c.name() == name
                && !c.is_used()
                && c.state().is_usable())
            .cloned()
    }

    /// the smallest id that is not taken for this peer, ids start at 1
    pub fn next_free_id(&self, peer_addr: SocketAddr) -> ChannelId {
        let Some(channels) = self.by_peer.get(&peer_addr) else {
            return CONNECTION_CHANNEL_ID + 1;
        };

        let mut candidate = CONNECTION_CHANNEL_ID + 1;
        while channels.iter().any(|c| c.id() == candidate) {
            candidate += 1;
        }
        candidate
    }

    pub fn insert(&mut self, channel: Arc<Channel>) {
        self.by_peer.entry(channel.peer_addr())
            .or_default()
            .push(channel);
    }

    /// Drops closed channels from the table, returning how many were removed
    pub fn remove_closed(&mut self) -> usize {
        let mut num_removed = 0;
        for channels in self.by_peer.values_mut() {
            let len_before = channels.len();
            channels.retain(|c| c.state() != State::Closed);
            num_removed += len_before - channels.len();
        }
        self.by_peer.retain(|_, channels| !channels.is_empty());
        num_removed
    }

    pub fn for_peer(&self, peer_addr: SocketAddr) -> impl Iterator<Item=&Arc<Channel>> {
        self.by_peer.get(&peer_addr)
            .into_iter()
            .flatten()
    }

    pub fn iter(&self) -> impl Iterator<Item=&Arc<Channel>> {
        self.by_peer.values()
            .flatten()
    }

    pub fn unclosed(&self) -> Vec<Arc<Channel>> {
        self.iter()
            .filter(|c| c.state() != State::Closed)
            .cloned()
            .collect()
    }
}
