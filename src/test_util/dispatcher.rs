use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::message_dispatcher::MessageDispatcher;
use crate::packet::ChannelId;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReceivedMessage {
    pub peer_addr: SocketAddr,
    pub channel_id: ChannelId,
    pub payload: Vec<u8>,
}

/// A [MessageDispatcher] that records everything it receives, for later assertions
#[derive(Default)]
pub struct CollectingMessageDispatcher {
    messages: RwLock<Vec<ReceivedMessage>>,
}

impl CollectingMessageDispatcher {
    pub fn new() -> Arc<CollectingMessageDispatcher> {
        Default::default()
    }

    pub async fn messages(&self) -> Vec<ReceivedMessage> {
        self.messages.read().await.clone()
    }

    pub async fn payloads(&self) -> Vec<Vec<u8>> {
        self.messages.read().await
            .iter()
            .map(|m| m.payload.clone())
            .collect()
    }

    pub async fn num_messages(&self) -> usize {
        self.messages.read().await.len()
    }

    /// Polls until at least `num_messages` were received, returning `false` if that did not
    ///  happen within `max_wait`
    pub async fn wait_for_messages(&self, num_messages: usize, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        while self.num_messages().await < num_messages {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }
}

#[async_trait]
impl MessageDispatcher for CollectingMessageDispatcher {
    async fn on_message(&self, peer_addr: SocketAddr, channel_id: ChannelId, msg_buf: &[u8]) {
        self.messages.write().await
            .push(ReceivedMessage {
                peer_addr,
                channel_id,
                payload: msg_buf.to_vec(),
            });
    }
}
