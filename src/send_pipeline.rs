use std::net::SocketAddr;
use std::sync::Arc;
use bytes::BytesMut;
use tracing::{trace, warn};

use crate::config::RudpConfig;
use crate::datagram_socket::DatagramSocket;
use crate::error::RudpError;
use crate::events::{ConnectionEvent, ConnectionEventNotifier};
use crate::packet::{ControlPacket, MessagePacket};
use crate::serializer::PacketSerializer;

/// The single path from packets to the wire: encodes a packet with the configured header
///  prefix and hands it to the socket.
///
/// Sending is fire-and-forget. Failures are logged and published as
///  [ConnectionEvent::TransportError], reliability is left to the channels' retransmission.
pub struct SendPipeline {
    socket: Arc<dyn DatagramSocket>,
    serializer: Arc<dyn PacketSerializer>,
    config: Arc<RudpConfig>,
    events: Arc<ConnectionEventNotifier>,
}

impl SendPipeline {
    pub fn new(
        socket: Arc<dyn DatagramSocket>,
        serializer: Arc<dyn PacketSerializer>,
        config: Arc<RudpConfig>,
        events: Arc<ConnectionEventNotifier>,
    ) -> SendPipeline {
        SendPipeline {
            socket,
            serializer,
            config,
            events,
        }
    }

    pub async fn send_message_packet(&self, to: SocketAddr, packet: &MessagePacket) {
        trace!("sending message packet to {:?}: {}", to, packet);

        let mut buf = BytesMut::new();
        self.serializer.serialize(&self.config.message_packet_header, packet, &mut buf);
        self.do_send_packet(to, &buf).await;
    }

    pub async fn send_control_packet(&self, to: SocketAddr, packet: &ControlPacket) {
        trace!("sending control packet to {:?}: {:?}", to, packet);

        let mut buf = BytesMut::new();
        packet.ser(&self.config.control_packet_header, &mut buf);
        self.do_send_packet(to, &buf).await;
    }

    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        if let Err(e) = self.socket.send_to(to, packet_buf).await {
            let err = RudpError::Transport { endpoint: to, source: e };
            warn!("{}", err);
            self.events.send_event(ConnectionEvent::TransportError {
                endpoint: to,
                message: err.to_string(),
            });
        }
    }
}
