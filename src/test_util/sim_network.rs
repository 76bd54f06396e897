use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::trace;

use crate::datagram_socket::DatagramSocket;

type Datagram = (SocketAddr, Vec<u8>);

struct SimNetworkInner {
    endpoints: FxHashMap<SocketAddr, mpsc::UnboundedSender<Datagram>>,
    loss_probability: f64,
    is_partitioned: bool,
}

/// An in-memory datagram network. Datagrams are delivered instantly and in order unless they
///  are dropped, either randomly based on a configurable loss probability or because the
///  network is partitioned.
///
/// Sending to an address that nobody is bound to silently drops the datagram, like UDP does.
pub struct SimNetwork {
    inner: Arc<Mutex<SimNetworkInner>>,
}

impl SimNetwork {
    pub fn new() -> Arc<SimNetwork> {
        Arc::new(SimNetwork {
            inner: Arc::new(Mutex::new(SimNetworkInner {
                endpoints: FxHashMap::default(),
                loss_probability: 0.0,
                is_partitioned: false,
            })),
        })
    }

    pub fn bind(&self, addr: SocketAddr) -> anyhow::Result<Arc<SimSocket>> {
        let (sender, receiver) = mpsc::unbounded_channel();

        let mut inner = self.inner.lock()
            .map_err(|_| anyhow!("simulated network is poisoned"))?;
        if inner.endpoints.contains_key(&addr) {
            bail!("address {:?} is in use", addr);
        }
        inner.endpoints.insert(addr, sender);

        Ok(Arc::new(SimSocket {
            addr,
            network: self.inner.clone(),
            inbox: tokio::sync::Mutex::new(receiver),
        }))
    }

    /// probability in `[0.0, 1.0]` that any given datagram is lost
    pub fn set_loss_probability(&self, loss_probability: f64) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.loss_probability = loss_probability;
        }
    }

    /// while partitioned, all datagrams are lost
    pub fn set_partitioned(&self, is_partitioned: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.is_partitioned = is_partitioned;
        }
    }
}

pub struct SimSocket {
    addr: SocketAddr,
    network: Arc<Mutex<SimNetworkInner>>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Datagram>>,
}

#[async_trait]
impl DatagramSocket for SimSocket {
    async fn send_to(&self, to: SocketAddr, packet_buf: &[u8]) -> std::io::Result<()> {
        let inner = self.network.lock()
            .map_err(|_| std::io::Error::new(ErrorKind::Other, "simulated network is poisoned"))?;

        if inner.is_partitioned {
            trace!("simulated network: partitioned, dropping datagram {:?} -> {:?}", self.addr, to);
            return Ok(());
        }
        if inner.loss_probability > 0.0 && rand::random::<f64>() < inner.loss_probability {
            trace!("simulated network: losing datagram {:?} -> {:?}", self.addr, to);
            return Ok(());
        }

        match inner.endpoints.get(&to) {
            Some(sender) => {
                // the receiver is only gone if the socket was dropped, which is plain loss
                let _ = sender.send((self.addr, packet_buf.to_vec()));
            }
            None => {
                trace!("simulated network: no endpoint at {:?}", to);
            }
        }
        Ok(())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        let (from, datagram) = self.inbox.lock().await
            .recv().await
            .ok_or_else(|| std::io::Error::new(ErrorKind::ConnectionAborted, "simulated network was shut down"))?;

        let len = datagram.len().min(buf.len());
        buf[..len].copy_from_slice(&datagram[..len]);
        Ok((len, from))
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        Ok(self.addr)
    }
}
