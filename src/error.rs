use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

use crate::packet::ChannelId;
use crate::state::State;

/// Everything that can go wrong on a channel or connection.
///
/// Only [RudpError::InvalidState] is ever returned to application code. The other variants
///  are handled where they occur (logged, published as a connection event, or turned into a
///  local channel teardown) and never stop the dispatch loop or unrelated channels.
#[derive(Error, Debug)]
pub enum RudpError {
    #[error("datagram transport error for {endpoint}: {source}")]
    Transport {
        endpoint: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("protocol violation on channel {channel_id}: {message}")]
    ProtocolViolation {
        channel_id: ChannelId,
        message: String,
    },

    #[error("channel {channel_id} is {state:?}, which does not allow this operation")]
    InvalidState {
        channel_id: ChannelId,
        state: State,
    },

    #[error("no usable channel {channel_id} for peer {peer_addr}")]
    UnknownChannel {
        peer_addr: SocketAddr,
        channel_id: ChannelId,
    },

    #[error("peer {peer_addr} on channel {channel_id} was silent for {silence:?}")]
    PeerTimeout {
        peer_addr: SocketAddr,
        channel_id: ChannelId,
        silence: Duration,
    },
}
