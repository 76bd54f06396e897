use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;

use crate::packet::ChannelId;

/// Application callback for received messages. It is called from a channel's receive loop, in
///  order of sending per channel, with fragmented messages already reassembled.
///
/// The receive loop waits for this call to complete, so long-running work should be handed
///  off to a separate task.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    async fn on_message(&self, peer_addr: SocketAddr, channel_id: ChannelId, msg_buf: &[u8]);
}
