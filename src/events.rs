use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

use crate::channel::Channel;
use crate::packet::ChannelId;

/// Lifecycle notifications of a [crate::connection::Connection] and its channels
#[derive(Clone, Debug)]
pub enum ConnectionEvent {
    /// client side: the peer assigned a channel in response to a channel request. The
    ///  application is expected to call [Channel::connect] on it.
    ChannelAssigned(Arc<Channel>),
    /// server side: a client completed the handshake on this channel
    IncomingConnection(Arc<Channel>),
    /// client side: the server acknowledged the handshake, the channel is ready for traffic
    Connected(Arc<Channel>),
    ChannelClosed {
        peer_addr: SocketAddr,
        channel_id: ChannelId,
    },
    /// sending a datagram failed. This is informational, lost packets are retransmitted
    ///  regardless.
    TransportError {
        endpoint: SocketAddr,
        message: String,
    },
}


pub struct ConnectionEventNotifier {
    sender: broadcast::Sender<ConnectionEvent>,
}
impl ConnectionEventNotifier {
    pub fn new(capacity: usize) -> ConnectionEventNotifier {
        let (sender, _) = broadcast::channel(capacity);

        ConnectionEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: ConnectionEvent) {
        trace!("event: {:?}", event);
        // no subscribers is fine
        let _ = self.sender.send(event);
    }
}
