use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use anyhow::anyhow;
use tokio::net::{lookup_host, ToSocketAddrs, UdpSocket};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, span, trace, Instrument, Level};

use crate::channel::{Channel, ChannelRole};
use crate::channel_table::ChannelTable;
use crate::config::RudpConfig;
use crate::datagram_socket::DatagramSocket;
use crate::events::{ConnectionEvent, ConnectionEventNotifier};
use crate::message_dispatcher::MessageDispatcher;
use crate::packet::{ChannelId, ControlKind, ControlPacket, DatagramKind, MessagePacket, CONNECTION_CHANNEL_ID, PING_PROBE};
use crate::send_pipeline::SendPipeline;
use crate::serializer::{BinarySerializer, PacketSerializer};
use crate::state::State;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionRole {
    /// accepts channel requests from any peer
    Server,
    /// talks to a single remote connection, requesting channels from it
    Client { remote_addr: SocketAddr },
}

/// Connection is where all other parts of the protocol come together: It owns a datagram
///  socket and the table of channels multiplexed over it, runs the channel request / assign
///  handshake, and dispatches incoming datagrams to their channels.
///
/// A server role connection assigns channels when peers request them. A client role
///  connection requests channels from its remote peer and publishes a
///  [ConnectionEvent::ChannelAssigned] event for each assignment, upon which the application
///  calls [Channel::connect].
pub struct Connection {
    role: ConnectionRole,
    local_addr: SocketAddr,
    config: Arc<RudpConfig>,
    serializer: Arc<dyn PacketSerializer>,
    send_pipeline: Arc<SendPipeline>,
    message_dispatcher: Arc<dyn MessageDispatcher>,
    events: Arc<ConnectionEventNotifier>,
    channels: Mutex<ChannelTable>,
    is_accepting: AtomicBool,
    recv_loop_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Binds a UDP socket to the given address and accepts channel requests on it
    pub async fn server(
        local_addr: SocketAddr,
        config: Arc<RudpConfig>,
        message_dispatcher: Arc<dyn MessageDispatcher>,
    ) -> anyhow::Result<Arc<Connection>> {
        config.validate()?;

        let socket = UdpSocket::bind(local_addr).await?;
        info!("bound server socket to {:?}", socket.local_addr()?);

        Self::with_socket(ConnectionRole::Server, Arc::new(socket), Arc::new(BinarySerializer), config, message_dispatcher)
    }

    /// Resolves the remote address (which may be a host name) and binds a UDP socket to an
    ///  ephemeral port of the same address family
    pub async fn client(
        remote: impl ToSocketAddrs,
        config: Arc<RudpConfig>,
        message_dispatcher: Arc<dyn MessageDispatcher>,
    ) -> anyhow::Result<Arc<Connection>> {
        config.validate()?;

        let remote_addr = lookup_host(remote).await?
            .next()
            .ok_or_else(|| anyhow!("remote address does not resolve to a socket address"))?;

        let bind_addr: SocketAddr = if remote_addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        }
        else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        info!("bound client socket to {:?} for remote {:?}", socket.local_addr()?, remote_addr);

        Self::with_socket(ConnectionRole::Client { remote_addr }, Arc::new(socket), Arc::new(BinarySerializer), config, message_dispatcher)
    }

    /// Runs a connection over an arbitrary datagram socket, e.g. a simulated network in tests
    pub fn with_socket(
        role: ConnectionRole,
        socket: Arc<dyn DatagramSocket>,
        serializer: Arc<dyn PacketSerializer>,
        config: Arc<RudpConfig>,
        message_dispatcher: Arc<dyn MessageDispatcher>,
    ) -> anyhow::Result<Arc<Connection>> {
        config.validate()?;

        let local_addr = socket.local_addr()?;
        let events = Arc::new(ConnectionEventNotifier::new(config.event_channel_capacity));
        let send_pipeline = Arc::new(SendPipeline::new(socket.clone(), serializer.clone(), config.clone(), events.clone()));

        let connection = Arc::new(Connection {
            role,
            local_addr,
            serializer,
            send_pipeline,
            message_dispatcher,
            events,
            channels: Default::default(),
            is_accepting: AtomicBool::new(true),
            recv_loop_handle: Default::default(),
            config,
        });

        let handle = tokio::spawn(Self::recv_loop(
            Arc::downgrade(&connection),
            socket,
            connection.config.receive_buffer_size,
        ));
        if let Ok(mut recv_loop_handle) = connection.recv_loop_handle.lock() {
            *recv_loop_handle = Some(handle);
        }

        Ok(connection)
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub async fn channel(&self, peer_addr: SocketAddr, channel_id: ChannelId) -> Option<Arc<Channel>> {
        self.channels.lock().await
            .get(peer_addr, channel_id)
    }

    pub async fn channels(&self) -> Vec<Arc<Channel>> {
        self.channels.lock().await
            .iter()
            .cloned()
            .collect()
    }

    /// Asks the peer for a channel with the given name. No local channel exists until the
    ///  peer's assignment arrives, see [ConnectionEvent::ChannelAssigned].
    ///
    /// The request is not retransmitted. If no assignment arrives, it is safe to request
    ///  again: the peer reuses the channel it assigned for a lost request.
    ///
    /// The peer reuses an existing channel only if it was requested with the same name and
    ///  never received any traffic, so both sides always agree on id and name. A request
    ///  with a different name gets a newly allocated channel.
    pub async fn request_channel(&self, peer_addr: SocketAddr, name: &str) {
        debug!("requesting channel {:?} from {:?}", name, peer_addr);
        self.send_pipeline.send_control_packet(peer_addr, &ControlPacket::channel_request(name)).await;
    }

    /// Aggregate state: a client role connection is [State::Connected] while any channel to its
    ///  remote peer is between handshake start and closing. A server role connection is
    ///  [State::Open] while it accepts requests or any channel is open. Both are
    ///  [State::Closed] otherwise.
    pub async fn state(&self) -> State {
        let channels = self.channels.lock().await;
        match self.role {
            ConnectionRole::Client { remote_addr } => {
                let is_connected = channels.for_peer(remote_addr)
                    .any(|c| (State::Connecting..State::Closing).contains(&c.state()));
                if is_connected { State::Connected } else { State::Closed }
            }
            ConnectionRole::Server => {
                let is_open = self.is_accepting() || channels.iter()
                    .any(|c| c.state() == State::Open);
                if is_open { State::Open } else { State::Closed }
            }
        }
    }

    fn is_accepting(&self) -> bool {
        self.is_accepting.load(Ordering::Acquire)
    }

    /// Stops accepting channels, closes all channels and stops receiving. This returns when
    ///  all channels are closed and no more packets are sent.
    ///
    /// When called from a [MessageDispatcher] callback, the channel running that callback is
    ///  closed in the background, see [Channel::disconnect].
    pub async fn disconnect(&self) {
        if self.is_accepting.swap(false, Ordering::AcqRel) {
            info!("disconnecting {:?}", self.local_addr);
        }

        loop {
            let (calling_channels, channels): (Vec<_>, Vec<_>) = self.channels.lock().await
                .unclosed()
                .into_iter()
                .partition(|c| c.is_running_on_own_loop());

            // this only initiates closing, the channel terminates after the callback returns
            for channel in calling_channels {
                channel.disconnect().await;
            }
            if channels.is_empty() {
                break;
            }
            for channel in channels {
                channel.disconnect().await;
            }
        }

        let recv_loop_handle = self.recv_loop_handle.lock()
            .ok()
            .and_then(|mut h| h.take());
        if let Some(handle) = recv_loop_handle {
            handle.abort();
            let _ = handle.await;
        }
        info!("disconnected {:?}", self.local_addr);
    }

    async fn recv_loop(connection: Weak<Connection>, socket: Arc<dyn DatagramSocket>, buffer_size: usize) {
        info!("starting receive loop");

        let mut buf = vec![0u8; buffer_size];
        loop {
            let received = socket.recv_from(&mut buf).await;

            let Some(connection) = connection.upgrade() else {
                break;
            };

            let (num_read, from) = match received {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };

            let span = span!(Level::TRACE, "datagram_received", ?from);
            connection.on_datagram(from, &buf[..num_read])
                .instrument(span)
                .await;
        }
        info!("receive loop terminated");
    }

    /// Handles a single incoming datagram. Malformed or unexpected datagrams are logged and
    ///  dropped, they never affect other traffic.
    pub async fn on_datagram(&self, from: SocketAddr, buf: &[u8]) {
        match DatagramKind::classify(buf, &self.config.message_packet_header, &self.config.control_packet_header) {
            DatagramKind::Message => {
                match self.serializer.deserialize(&self.config.message_packet_header, buf) {
                    Ok(packet) => self.on_message_packet(from, packet).await,
                    Err(e) => debug!("unparsable message packet from {:?}: {} - dropping", from, e),
                }
            }
            DatagramKind::Control => {
                match ControlPacket::deser(&self.config.control_packet_header, buf) {
                    Ok(packet) => self.on_control_packet(from, packet).await,
                    Err(e) => debug!("unparsable control packet from {:?}: {} - dropping", from, e),
                }
            }
            DatagramKind::Unrecognized => {
                trace!("datagram from {:?} has no known header - dropping", from);
            }
        }
    }

    async fn on_message_packet(&self, from: SocketAddr, packet: MessagePacket) {
        let channel = match self.channels.lock().await.get_usable(from, packet.channel_id) {
            Ok(channel) => channel,
            Err(e) => {
                trace!("{} - dropping message packet {}", e, packet);
                return;
            }
        };

        trace!("received message packet {}", packet);
        let seq = packet.seq;
        channel.add_received_packet(packet).await;
        channel.refresh_liveness().await;
        if channel.state().is_usable() {
            self.send_pipeline.send_control_packet(from, &ControlPacket::ack(channel.id(), seq)).await;
        }
    }

    async fn on_control_packet(&self, from: SocketAddr, packet: ControlPacket) {
        trace!("received control packet {:?}", packet);

        if packet.channel_id == CONNECTION_CHANNEL_ID {
            match packet.kind {
                ControlKind::ChannelRequest => self.on_channel_request(from, &packet.string_arg).await,
                ControlKind::ChannelAssign => self.on_channel_assign(from, packet.int_arg, &packet.string_arg).await,
                ControlKind::Ack | ControlKind::Ping => {
                    debug!("{:?} from {:?} without a channel - ignoring", packet.kind, from);
                }
            }
            return;
        }

        let channel = match self.channels.lock().await.get_usable(from, packet.channel_id) {
            Ok(channel) => channel,
            Err(e) => {
                trace!("{} - dropping control packet", e);
                return;
            }
        };

        match packet.kind {
            ControlKind::Ack => {
                channel.refresh_liveness().await;
                channel.acknowledge_packet(packet.int_arg).await;
            }
            ControlKind::Ping => {
                channel.refresh_liveness().await;
                if packet.int_arg == PING_PROBE && channel.state().is_usable() {
                    self.send_pipeline.send_control_packet(from, &ControlPacket::ping_reply(channel.id())).await;
                }
            }
            ControlKind::ChannelRequest | ControlKind::ChannelAssign => {
                debug!("{:?} from {:?} on channel {} - ignoring", packet.kind, from, packet.channel_id);
            }
        }
    }

    async fn on_channel_request(&self, from: SocketAddr, name: &str) {
        if !self.is_accepting() {
            debug!("channel request from {:?} while disconnecting - ignoring", from);
            return;
        }

        let channel = {
            let mut channels = self.channels.lock().await;
            channels.remove_closed();

            match channels.find_reusable(from, name) {
                Some(channel) => {
                    debug!("reusing channel {} ({:?}) for {:?}", channel.id(), name, from);
                    channel
                }
                None => {
                    let id = channels.next_free_id(from);
                    debug!("allocating channel {} ({:?}) for {:?}", id, name, from);
                    let channel = self.start_channel(id, name, ChannelRole::Server, from).await;
                    channels.insert(channel.clone());
                    channel
                }
            }
        };

        self.send_pipeline.send_control_packet(from, &ControlPacket::channel_assign(channel.id(), channel.name())).await;
    }

    async fn on_channel_assign(&self, from: SocketAddr, channel_id: ChannelId, name: &str) {
        if channel_id <= CONNECTION_CHANNEL_ID {
            debug!("invalid channel id {} assigned by {:?} - ignoring", channel_id, from);
            return;
        }
        if !self.is_accepting() {
            debug!("channel assignment from {:?} while disconnecting - ignoring", from);
            return;
        }

        let channel = {
            let mut channels = self.channels.lock().await;
            channels.remove_closed();

            if channels.get(from, channel_id).is_some() {
                debug!("channel {} was assigned by {:?} already - ignoring", channel_id, from);
                return;
            }

            let channel = self.start_channel(channel_id, name, ChannelRole::Client, from).await;
            channels.insert(channel.clone());
            channel
        };

        debug!("channel {} ({:?}) assigned by {:?}", channel_id, name, from);
        self.events.send_event(ConnectionEvent::ChannelAssigned(channel));
    }

    async fn start_channel(&self, id: ChannelId, name: &str, role: ChannelRole, peer_addr: SocketAddr) -> Arc<Channel> {
        Channel::start(
            id,
            name,
            role,
            peer_addr,
            self.config.clone(),
            self.send_pipeline.clone(),
            self.message_dispatcher.clone(),
            self.events.clone(),
        ).await
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Ok(mut recv_loop_handle) = self.recv_loop_handle.lock() {
            if let Some(handle) = recv_loop_handle.take() {
                handle.abort();
            }
        }
        if let Ok(channels) = self.channels.try_lock() {
            for channel in channels.iter() {
                channel.signal_close();
            }
        }
    }
}
