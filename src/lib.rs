//! A reliable, ordered, message oriented transport over UDP.
//!
//! Many independent *channels* are multiplexed over a single UDP socket. Each channel provides
//!  a handshake before traffic, in-order delivery of messages, transparent fragmentation and
//!  reassembly of messages that do not fit into a single datagram, retransmission of
//!  unacknowledged packets, and liveness detection with automatic teardown if the peer goes
//!  silent.
//!
//! It is explicitly *not* a TCP replacement: there is no congestion control, no flow control,
//!  no encryption, and no ordering across channels.
//!
//! ## Establishing a channel
//!
//! ```ascii
//!  client connection                               server connection
//!       | -- CHANNEL_REQUEST(name) ------------------------> |  find or allocate channel id
//!       | <------------------------- CHANNEL_ASSIGN(id, name) |  (server role channel: OPEN)
//!  create client role channel (OPENING)                       |
//!  application calls Channel::connect (CONNECTING)            |
//!       | -- SYN (seq 100) ---------------------------------> |
//!       | <------------------------------------ ACK(100) ctrl |  incoming connection event
//!       | <---------------------------- ACK message (seq 200) |
//!       | -- ACK(200) ctrl ---------------------------------> |
//!  CONNECTED, connected event                                 |
//! ```
//!
//! The client's first sequence number is 100, the server's is 200 (both configurable). The
//!  handshake packets are regular sequenced packets, so they are retransmitted until
//!  acknowledged and processed exactly once. Channel requests and assignments are not
//!  retransmitted; a client may simply request again.
//!
//! ## Reliability
//!
//! Every message packet is acknowledged individually by a control packet carrying its seq
//!  (there are no cumulative acks). Unacknowledged packets are sent again after a retransmit
//!  timeout, keeping their seq. The receiver buffers packets until all packets before them
//!  were delivered; a fragmented message is delivered as a whole when all its fragments are
//!  there.
//!
//! If a channel's peer was silent for some time, the channel sends PING probes. If the peer
//!  stays silent past the dead peer threshold, the channel closes itself.
//!
//! ## Wire format
//!
//! All numbers are little endian. The two packet kinds are told apart by a two byte prefix.
//!  Datagrams with an unknown prefix are dropped.
//!
//! Message packet (application data and handshake):
//! ```ascii
//!  0: 0xFF 0x01
//!  2: channel id (i32)
//!  6: seq (i32)
//! 10: group id (i32) - shared by all fragments of a message
//! 14: qty (i32) - number of fragments in the group, 0 for unfragmented messages
//! 18: kind (u8) - SYN = 1, ACK = 2, DATA = 3
//! 19: payload length (i32)
//! 23: payload
//! ```
//!
//! Control packet:
//! ```ascii
//!  0: 0xFF 0x02
//!  2: channel id (i32) - 0 for connection level packets
//!  6: kind (u8) - ACK = 1, PING = 2, CHANNEL_REQUEST = 3, CHANNEL_ASSIGN = 4
//!  7: int arg (i32) - acked seq (ACK), 0 = probe / 1 = reply (PING), assigned id (CHANNEL_ASSIGN)
//! 11: string arg - channel name, UTF-8 prefixed with its length as a varint
//! ```

pub mod channel;
mod channel_table;
pub mod config;
pub mod connection;
pub mod datagram_socket;
pub mod error;
pub mod events;
pub mod message_dispatcher;
pub mod packet;
pub mod safe_converter;
pub mod send_pipeline;
pub mod serializer;
pub mod state;
pub mod util;
pub mod test_util;

pub use channel::{Channel, ChannelRole};
pub use config::RudpConfig;
pub use connection::{Connection, ConnectionRole};
pub use error::RudpError;
pub use events::ConnectionEvent;
pub use message_dispatcher::MessageDispatcher;
pub use state::State;


#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
