#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time;
use tracing::Level;

use rudp::serializer::BinarySerializer;
use rudp::test_util::dispatcher::CollectingMessageDispatcher;
use rudp::test_util::sim_network::SimNetwork;
use rudp::{Channel, Connection, ConnectionEvent, ConnectionRole, RudpConfig, State};

#[ctor::ctor]
fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(Level::DEBUG)
        .try_init()
        .ok();
}

pub fn server_addr() -> SocketAddr {
    SocketAddr::from(([10, 0, 0, 1], 7000))
}

pub fn client_addr() -> SocketAddr {
    SocketAddr::from(([10, 0, 0, 2], 7001))
}

pub struct Endpoint {
    pub connection: Arc<Connection>,
    pub dispatcher: Arc<CollectingMessageDispatcher>,
    pub events: broadcast::Receiver<ConnectionEvent>,
}

pub fn endpoint(network: &SimNetwork, role: ConnectionRole, addr: SocketAddr, config: Arc<RudpConfig>) -> Endpoint {
    let dispatcher = CollectingMessageDispatcher::new();
    let connection = Connection::with_socket(
        role,
        network.bind(addr).unwrap(),
        Arc::new(BinarySerializer),
        config,
        dispatcher.clone(),
    ).unwrap();
    let events = connection.subscribe();

    Endpoint {
        connection,
        dispatcher,
        events,
    }
}

pub async fn next_event(events: &mut broadcast::Receiver<ConnectionEvent>) -> ConnectionEvent {
    time::timeout(Duration::from_secs(60), events.recv()).await
        .expect("no event within timeout")
        .expect("event channel closed")
}

pub struct ConnectedPair {
    pub server: Endpoint,
    pub client: Endpoint,
    pub server_channel: Arc<Channel>,
    pub client_channel: Arc<Channel>,
}

/// Requests a channel from the server, connects it and waits until both sides report the
///  handshake as complete
pub async fn request_and_connect(server: &mut Endpoint, client: &mut Endpoint, name: &str) -> (Arc<Channel>, Arc<Channel>) {
    client.connection.request_channel(server_addr(), name).await;

    let client_channel = match next_event(&mut client.events).await {
        ConnectionEvent::ChannelAssigned(channel) => channel,
        other => panic!("expected channel assignment, was {:?}", other),
    };
    assert_eq!(client_channel.state(), State::Opening);
    client_channel.connect().await.unwrap();

    match next_event(&mut client.events).await {
        ConnectionEvent::Connected(channel) => assert_eq!(channel.id(), client_channel.id()),
        other => panic!("expected connected event, was {:?}", other),
    }
    let server_channel = match next_event(&mut server.events).await {
        ConnectionEvent::IncomingConnection(channel) => channel,
        other => panic!("expected incoming connection, was {:?}", other),
    };

    (server_channel, client_channel)
}

pub async fn connected_pair(network: &SimNetwork, config: RudpConfig) -> ConnectedPair {
    let config = Arc::new(config);
    let mut server = endpoint(network, ConnectionRole::Server, server_addr(), config.clone());
    let mut client = endpoint(network, ConnectionRole::Client { remote_addr: server_addr() }, client_addr(), config);

    let (server_channel, client_channel) = request_and_connect(&mut server, &mut client, "test").await;

    ConnectedPair {
        server,
        client,
        server_channel,
        client_channel,
    }
}
