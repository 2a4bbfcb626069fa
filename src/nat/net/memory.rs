// src/nat/net/memory.rs
//! In-process datagram network
//!
//! Sockets bound on a [`MemoryNetwork`] exchange datagrams through channels,
//! so agents can run against fixed addresses such as `192.168.1.5:50000`
//! without touching the host network. A filter can drop datagrams to
//! emulate loss or firewalls.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::trace;

use super::{DatagramSocket, LocalInterface, Platform, SocketFactory, StaticInterfaces};

/// First port handed out for port-0 binds
pub const FIRST_EPHEMERAL_PORT: u16 = 50000;

type Filter = Arc<dyn Fn(SocketAddr, SocketAddr) -> bool + Send + Sync>;
type Datagram = (Bytes, SocketAddr);

#[derive(Default)]
struct NetState {
    mailboxes: HashMap<SocketAddr, mpsc::UnboundedSender<Datagram>>,
    filter: Option<Filter>,
}

/// A simulated network shared by every socket bound on it
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a socket; port 0 takes the lowest free port from 50000 up
    pub fn bind(&self, addr: SocketAddr) -> io::Result<Arc<MemorySocket>> {
        let mut state = self.state.lock();

        let addr = if addr.port() == 0 {
            let port = (FIRST_EPHEMERAL_PORT..=u16::MAX)
                .find(|port| !state.mailboxes.contains_key(&SocketAddr::new(addr.ip(), *port)))
                .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no free ports"))?;
            SocketAddr::new(addr.ip(), port)
        } else {
            addr
        };

        if state.mailboxes.contains_key(&addr) {
            return Err(io::Error::new(io::ErrorKind::AddrInUse, format!("{} in use", addr)));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.mailboxes.insert(addr, tx);
        trace!("Memory socket bound on {}", addr);

        Ok(Arc::new(MemorySocket {
            addr,
            rx: AsyncMutex::new(rx),
            network: Arc::downgrade(&self.state),
        }))
    }

    /// Deliver only datagrams for which `filter(from, to)` returns true
    pub fn set_filter<F>(&self, filter: F)
    where
        F: Fn(SocketAddr, SocketAddr) -> bool + Send + Sync + 'static,
    {
        self.state.lock().filter = Some(Arc::new(filter));
    }

    /// Deliver everything again
    pub fn clear_filter(&self) {
        self.state.lock().filter = None;
    }

    /// Socket factory binding on this network
    pub fn socket_factory(&self) -> Arc<dyn SocketFactory> {
        Arc::new(self.clone())
    }

    /// Platform whose interfaces are `addrs`, in that order
    pub fn platform(&self, addrs: &[IpAddr]) -> Platform {
        let interfaces = addrs
            .iter()
            .enumerate()
            .map(|(i, addr)| LocalInterface::new(format!("mem{}", i), *addr, false))
            .collect();
        Platform::new(self.socket_factory(), Arc::new(StaticInterfaces(interfaces)))
    }

    fn deliver(&self, data: &[u8], from: SocketAddr, to: SocketAddr) {
        let state = self.state.lock();
        if let Some(filter) = &state.filter {
            if !filter(from, to) {
                trace!("Filter dropped {} -> {}", from, to);
                return;
            }
        }
        match state.mailboxes.get(&to) {
            Some(tx) => {
                let _ = tx.send((Bytes::copy_from_slice(data), from));
            }
            None => trace!("No socket on {}, dropping datagram from {}", to, from),
        }
    }
}

impl SocketFactory for MemoryNetwork {
    fn bind(&self, addr: SocketAddr) -> BoxFuture<'_, io::Result<Arc<dyn DatagramSocket>>> {
        Box::pin(async move { MemoryNetwork::bind(self, addr).map(|s| s as Arc<dyn DatagramSocket>) })
    }
}

/// Socket on a [`MemoryNetwork`]; unbinds on drop
pub struct MemorySocket {
    addr: SocketAddr,
    rx: AsyncMutex<mpsc::UnboundedReceiver<Datagram>>,
    network: Weak<Mutex<NetState>>,
}

impl DatagramSocket for MemorySocket {
    fn send_to<'a>(&'a self, data: &'a [u8], target: SocketAddr) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(async move {
            let state = self
                .network
                .upgrade()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "network is gone"))?;
            MemoryNetwork { state }.deliver(data, self.addr, target);
            Ok(data.len())
        })
    }

    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<(usize, SocketAddr)>> {
        Box::pin(async move {
            let (data, from) = self
                .rx
                .lock()
                .await
                .recv()
                .await
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket unbound"))?;
            let n = data.len().min(buf.len());
            buf[..n].copy_from_slice(&data[..n]);
            Ok((n, from))
        })
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}

impl Drop for MemorySocket {
    fn drop(&mut self) {
        if let Some(state) = self.network.upgrade() {
            state.lock().mailboxes.remove(&self.addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ephemeral_ports_and_delivery() {
        let net = MemoryNetwork::new();
        let a = net.bind("192.168.1.5:0".parse().unwrap()).unwrap();
        let b = net.bind("192.168.1.6:0".parse().unwrap()).unwrap();
        let a2 = net.bind("192.168.1.5:0".parse().unwrap()).unwrap();

        assert_eq!(a.local_addr().unwrap(), "192.168.1.5:50000".parse().unwrap());
        assert_eq!(b.local_addr().unwrap(), "192.168.1.6:50000".parse().unwrap());
        assert_eq!(a2.local_addr().unwrap(), "192.168.1.5:50001".parse().unwrap());
        assert!(net.bind("192.168.1.5:50000".parse().unwrap()).is_err());

        a.send_to(b"hello", b.local_addr().unwrap()).await.unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from, a.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_filter_and_unbind() {
        let net = MemoryNetwork::new();
        let a = net.bind("10.0.0.1:1000".parse().unwrap()).unwrap();
        let b = net.bind("10.0.0.2:1000".parse().unwrap()).unwrap();
        let b_addr = b.local_addr().unwrap();

        net.set_filter(|from, _| from.port() != 1000);
        a.send_to(b"lost", b_addr).await.unwrap();
        net.clear_filter();
        a.send_to(b"kept", b_addr).await.unwrap();

        let mut buf = [0u8; 16];
        let (n, _) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"kept");

        drop(b);
        assert!(net.bind(b_addr).is_ok());
    }
}
