//! A channel is one reliable, ordered stream of messages between two endpoints, multiplexed
//!  with other channels over a single datagram socket.
//!
//! Each channel runs four background tasks:
//! * the *send loop* transmits queued packets and retransmits overdue ones
//! * the *retransmit monitor* checks for overdue pending packets and wakes the send loop
//! * the *receive loop* reorders and reassembles received packets and delivers them
//! * the *keepalive loop* probes quiet peers and tears the channel down if they stay silent
//!
//! Every loop sleeps until it is woken or its poll interval elapses, and exits once the
//!  channel is closing. [Channel::disconnect] waits for all four to terminate.

mod liveness;
mod receive_buffers;
mod send_buffers;

use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::{self, JoinHandle};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio::select;
use tracing::{debug, error, trace, warn};

use crate::config::RudpConfig;
use crate::error::RudpError;
use crate::events::{ConnectionEvent, ConnectionEventNotifier};
use crate::message_dispatcher::MessageDispatcher;
use crate::packet::{ChannelId, ControlPacket, MessageKind, MessagePacket, Seq};
use crate::send_pipeline::SendPipeline;
use crate::state::{AtomicState, State};
use liveness::Liveness;
use receive_buffers::{ReceiveAction, ReceiveBuffers};
use send_buffers::{SendBuffers, Transmission};

/// Which side of the channel handshake this end is on
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ChannelRole {
    /// allocated the channel in response to a channel request, waits for the peer's SYN
    Server,
    /// requested the channel, initiates the SYN handshake
    Client,
}

impl ChannelRole {
    fn local_start_sequence(self, config: &RudpConfig) -> Seq {
        match self {
            ChannelRole::Server => config.server_start_sequence,
            ChannelRole::Client => config.client_start_sequence,
        }
    }

    fn remote_start_sequence(self, config: &RudpConfig) -> Seq {
        match self {
            ChannelRole::Server => config.client_start_sequence,
            ChannelRole::Client => config.server_start_sequence,
        }
    }

    /// the state in which the application may send data
    fn ready_state(self) -> State {
        match self {
            ChannelRole::Server => State::Open,
            ChannelRole::Client => State::Connected,
        }
    }
}

pub struct Channel {
    id: ChannelId,
    name: String,
    role: ChannelRole,
    peer_addr: SocketAddr,
    config: Arc<RudpConfig>,
    state: AtomicState,
    is_used: AtomicBool,
    send_pipeline: Arc<SendPipeline>,
    message_dispatcher: Arc<dyn MessageDispatcher>,
    events: Arc<ConnectionEventNotifier>,

    send_buffers: Mutex<SendBuffers>,
    receive_buffers: Mutex<ReceiveBuffers>,
    last_liveness: RwLock<Option<Instant>>,

    send_wakeup: Notify,
    retransmit_monitor_wakeup: Notify,
    receive_wakeup: Notify,
    keepalive_wakeup: Notify,
    loop_handles: Mutex<Vec<JoinHandle<()>>>,
    loop_task_ids: OnceLock<Vec<task::Id>>,
    myself: Weak<Channel>,
}

impl Debug for Channel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("role", &self.role)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl Channel {
    /// Creates a channel and starts its background loops. Server role channels are open for
    ///  traffic right away, client role channels wait for [Channel::connect].
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn start(
        id: ChannelId,
        name: &str,
        role: ChannelRole,
        peer_addr: SocketAddr,
        config: Arc<RudpConfig>,
        send_pipeline: Arc<SendPipeline>,
        message_dispatcher: Arc<dyn MessageDispatcher>,
        events: Arc<ConnectionEventNotifier>,
    ) -> Arc<Channel> {
        // server role channels are active from the start, client role channels from connect()
        let last_liveness = match role {
            ChannelRole::Server => Some(Instant::now()),
            ChannelRole::Client => None,
        };

        let channel = Arc::new_cyclic(|myself| Channel {
            id,
            name: name.to_string(),
            role,
            peer_addr,
            state: AtomicState::new(State::Opening),
            is_used: AtomicBool::new(false),
            send_pipeline,
            message_dispatcher,
            events,
            send_buffers: Mutex::new(SendBuffers::new(id, role.local_start_sequence(&config), config.max_fragment_size())),
            receive_buffers: Mutex::new(ReceiveBuffers::new(id, role, role.remote_start_sequence(&config))),
            last_liveness: RwLock::new(last_liveness),
            send_wakeup: Notify::new(),
            retransmit_monitor_wakeup: Notify::new(),
            receive_wakeup: Notify::new(),
            keepalive_wakeup: Notify::new(),
            loop_handles: Mutex::new(Vec::new()),
            loop_task_ids: OnceLock::new(),
            myself: myself.clone(),
            config,
        });

        {
            let mut handles = channel.loop_handles.lock().await;
            handles.push(tokio::spawn(channel.clone().send_loop()));
            handles.push(tokio::spawn(channel.clone().retransmit_monitor_loop()));
            handles.push(tokio::spawn(channel.clone().receive_loop()));
            handles.push(tokio::spawn(channel.clone().keepalive_loop()));
            let _ = channel.loop_task_ids.set(handles.iter().map(|h| h.id()).collect());
        }

        if role == ChannelRole::Server && channel.state.transition(State::Opening, State::Open) {
            debug!("channel {} ({:?}) for {:?}: open", id, name, peer_addr);
        }
        else {
            debug!("channel {} ({:?}) for {:?}: waiting for connect", id, name, peer_addr);
        }

        channel
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> State {
        self.state.load()
    }

    /// `true` once any message packet was received on this channel
    pub fn is_used(&self) -> bool {
        self.is_used.load(Ordering::Acquire)
    }

    /// Starts the client side handshake by sending a SYN. This is valid only once, on a client
    ///  role channel that was just assigned.
    pub async fn connect(&self) -> Result<(), RudpError> {
        if self.role != ChannelRole::Client || !self.state.transition(State::Opening, State::Connecting) {
            return Err(RudpError::InvalidState {
                channel_id: self.id,
                state: self.state(),
            });
        }

        debug!("channel {} for {:?}: connecting", self.id, self.peer_addr);
        self.refresh_liveness().await;
        self.send_buffers.lock().await
            .enqueue(MessageKind::Syn, &[]);
        self.send_wakeup.notify_one();
        Ok(())
    }

    /// Queues a message for sending, splitting it into fragments if it is longer than the
    ///  maximum fragment size. The message is transmitted (and retransmitted until it is
    ///  acknowledged) by the channel's send loop.
    pub async fn send_data(&self, data: &[u8]) -> Result<(), RudpError> {
        let state = self.state();
        if state != self.role.ready_state() {
            return Err(RudpError::InvalidState {
                channel_id: self.id,
                state,
            });
        }

        let num_packets = self.send_buffers.lock().await
            .enqueue(MessageKind::Data, data);
        trace!("channel {}: enqueued message of {} bytes as {} packet(s)", self.id, data.len(), num_packets);
        self.send_wakeup.notify_one();
        Ok(())
    }

    pub async fn acknowledge_packet(&self, seq: Seq) {
        if !self.send_buffers.lock().await.acknowledge(seq) {
            trace!("channel {}: ack for packet {} that is not pending", self.id, seq);
        }
    }

    pub async fn add_received_packet(&self, packet: MessagePacket) {
        self.is_used.store(true, Ordering::Release);
        if self.receive_buffers.lock().await.insert(packet) {
            self.receive_wakeup.notify_one();
        }
    }

    pub async fn refresh_liveness(&self) {
        *self.last_liveness.write().await = Some(Instant::now());
    }

    /// Closes the channel, returning after all background loops terminated. No packets are
    ///  sent for this channel once this returns.
    ///
    /// Calling this repeatedly or concurrently is safe, every call returns only after the
    ///  channel is closed.
    ///
    /// The exception is a call from code running on one of the channel's own loops, typically
    ///  a [MessageDispatcher] callback. The loop can only terminate after the callback
    ///  returns, so such a call initiates closing and returns without waiting. The channel is
    ///  [State::Closing] at that point and becomes [State::Closed] in the background.
    pub fn disconnect(&self) -> impl std::future::Future<Output = ()> + Send + '_ {
        async move {
            if self.state.begin_closing() {
                debug!("channel {} for {:?}: closing", self.id, self.peer_addr);
            }
            self.wake_all_loops();

            if self.is_running_on_own_loop() {
                debug!("channel {}: disconnect called from the channel's own loop - finishing in the background", self.id);
                if let Some(channel) = self.myself.upgrade() {
                    tokio::spawn(async move {
                        channel.disconnect().await;
                    });
                }
                return;
            }

            // holding the lock while joining makes concurrent callers wait for termination
            let mut handles = self.loop_handles.lock().await;
            for handle in handles.drain(..) {
                if let Err(e) = handle.await {
                    if e.is_panic() {
                        error!("channel {}: background loop panicked: {}", self.id, e);
                    }
                }
            }

            if self.state.finish_closing() {
                debug!("channel {} for {:?}: closed", self.id, self.peer_addr);
                self.events.send_event(ConnectionEvent::ChannelClosed {
                    peer_addr: self.peer_addr,
                    channel_id: self.id,
                });
            }
        }
    }

    /// Initiates teardown from inside one of the channel's own loops, which must return
    ///  right after calling this
    fn disconnect_in_background(self: &Arc<Self>) {
        self.state.begin_closing();
        let channel = self.clone();
        tokio::spawn(async move {
            channel.disconnect().await;
        });
    }

    /// Makes the background loops terminate without waiting for them, for contexts that cannot
    ///  await [Channel::disconnect]
    pub(crate) fn signal_close(&self) {
        self.state.begin_closing();
        self.wake_all_loops();
    }

    /// `true` if the calling code runs on one of this channel's background loops
    pub(crate) fn is_running_on_own_loop(&self) -> bool {
        match (task::try_id(), self.loop_task_ids.get()) {
            (Some(current), Some(loop_task_ids)) => loop_task_ids.contains(&current),
            _ => false,
        }
    }

    fn wake_all_loops(&self) {
        self.send_wakeup.notify_one();
        self.retransmit_monitor_wakeup.notify_one();
        self.receive_wakeup.notify_one();
        self.keepalive_wakeup.notify_one();
    }

    fn is_closing(&self) -> bool {
        !self.state().is_usable()
    }

    async fn sleep_until_woken(&self, notify: &Notify) {
        let _ = time::timeout(self.config.max_poll_interval, notify.notified()).await;
    }

    async fn send_loop(self: Arc<Self>) {
        loop {
            if self.is_closing() {
                break;
            }

            let transmission = self.send_buffers.lock().await
                .next_transmission(Instant::now(), self.config.retransmit_timeout);

            match transmission {
                Transmission::Idle => {}
                Transmission::Fresh(packets) | Transmission::Retransmit(packets) => {
                    for packet in &packets {
                        self.send_pipeline.send_message_packet(self.peer_addr, packet).await;
                    }
                }
            }

            self.sleep_until_woken(&self.send_wakeup).await;
        }
        trace!("channel {}: send loop terminated", self.id);
    }

    async fn retransmit_monitor_loop(self: Arc<Self>) {
        let mut interval = time::interval(self.config.retransmit_check_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = interval.tick() => {}
                _ = self.retransmit_monitor_wakeup.notified() => {}
            }
            if self.is_closing() {
                break;
            }

            let has_overdue = self.send_buffers.lock().await
                .has_overdue(Instant::now(), self.config.retransmit_timeout);
            if has_overdue {
                self.send_wakeup.notify_one();
            }
        }
        trace!("channel {}: retransmit monitor terminated", self.id);
    }

    async fn receive_loop(self: Arc<Self>) {
        loop {
            if self.is_closing() {
                break;
            }

            let actions = self.receive_buffers.lock().await
                .process();

            for action in actions {
                if self.is_closing() {
                    break;
                }
                match action {
                    ReceiveAction::Deliver(message) => {
                        self.message_dispatcher.on_message(self.peer_addr, self.id, &message).await;
                    }
                    ReceiveAction::IncomingConnection => {
                        debug!("channel {} for {:?}: incoming connection", self.id, self.peer_addr);
                        self.send_buffers.lock().await
                            .enqueue(MessageKind::Ack, &[]);
                        self.send_wakeup.notify_one();
                        self.events.send_event(ConnectionEvent::IncomingConnection(self.clone()));
                    }
                    ReceiveAction::HandshakeAcknowledged => {
                        if self.state.transition(State::Connecting, State::Connected) {
                            debug!("channel {} for {:?}: connected", self.id, self.peer_addr);
                            self.events.send_event(ConnectionEvent::Connected(self.clone()));
                        }
                        else {
                            debug!("channel {}: handshake reply in state {:?} - ignoring", self.id, self.state());
                        }
                    }
                    ReceiveAction::ProtocolViolation(e) => {
                        error!("{} - closing channel", e);
                        self.disconnect_in_background();
                        return;
                    }
                }
            }

            self.sleep_until_woken(&self.receive_wakeup).await;
        }
        trace!("channel {}: receive loop terminated", self.id);
    }

    async fn keepalive_loop(self: Arc<Self>) {
        let mut interval = time::interval(self.config.keepalive_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = interval.tick() => {}
                _ = self.keepalive_wakeup.notified() => {}
            }
            if self.is_closing() {
                break;
            }

            let last_liveness = *self.last_liveness.read().await;
            match Liveness::check(last_liveness, Instant::now(), &self.config) {
                Liveness::Unknown | Liveness::Alive => {}
                Liveness::Probe => {
                    debug!("channel {}: no traffic from {:?} recently, sending ping", self.id, self.peer_addr);
                    self.send_pipeline.send_control_packet(self.peer_addr, &ControlPacket::ping_probe(self.id)).await;
                }
                Liveness::Dead(silence) => {
                    let e = RudpError::PeerTimeout {
                        peer_addr: self.peer_addr,
                        channel_id: self.id,
                        silence,
                    };
                    warn!("{} - closing channel", e);
                    self.disconnect_in_background();
                    return;
                }
            }
        }
        trace!("channel {}: keepalive loop terminated", self.id);
    }
}
