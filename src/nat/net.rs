// src/nat/net.rs
//! Socket and interface facilities the agent runs on
//!
//! The agent never touches `tokio::net` or the OS interface table directly.
//! Everything goes through the traits below so that an embedding application
//! (or a test) can supply its own datagram transport and interface list.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::net::UdpSocket;
use tracing::{debug, trace};

pub mod memory;

pub use memory::{MemoryNetwork, MemorySocket};

/// A bound datagram endpoint
pub trait DatagramSocket: Send + Sync {
    /// Send one datagram to `target`
    fn send_to<'a>(&'a self, data: &'a [u8], target: SocketAddr) -> BoxFuture<'a, io::Result<usize>>;

    /// Wait for the next datagram
    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<(usize, SocketAddr)>>;

    /// Address this socket is bound to
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl DatagramSocket for UdpSocket {
    fn send_to<'a>(&'a self, data: &'a [u8], target: SocketAddr) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(UdpSocket::send_to(self, data, target))
    }

    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<(usize, SocketAddr)>> {
        Box::pin(UdpSocket::recv_from(self, buf))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// Creates bound datagram sockets
pub trait SocketFactory: Send + Sync {
    /// Bind a socket on `addr` (port 0 picks an ephemeral port)
    fn bind(&self, addr: SocketAddr) -> BoxFuture<'_, io::Result<Arc<dyn DatagramSocket>>>;
}

/// UDP sockets from the tokio runtime
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSocketFactory;

impl SocketFactory for TokioSocketFactory {
    fn bind(&self, addr: SocketAddr) -> BoxFuture<'_, io::Result<Arc<dyn DatagramSocket>>> {
        Box::pin(async move {
            let socket = UdpSocket::bind(addr).await?;
            trace!("Bound UDP socket {}", socket.local_addr()?);
            Ok(Arc::new(socket) as Arc<dyn DatagramSocket>)
        })
    }
}

/// One address of a local network interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalInterface {
    /// Interface name (e.g. `eth0`)
    pub name: String,
    /// Unicast address assigned to the interface
    pub addr: IpAddr,
    /// Loopback interface
    pub is_loopback: bool,
}

impl LocalInterface {
    /// Build an interface entry
    pub fn new(name: impl Into<String>, addr: IpAddr, is_loopback: bool) -> Self {
        Self { name: name.into(), addr, is_loopback }
    }

    /// Whether this address may back a host candidate
    pub fn is_usable_for_candidates(&self) -> bool {
        if self.is_loopback || self.addr.is_loopback() || self.addr.is_unspecified() || self.addr.is_multicast() {
            return false;
        }
        match self.addr {
            IpAddr::V4(v4) => !v4.is_broadcast(),
            // fe80::/10 needs a scope id we cannot carry in a candidate line
            IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) != 0xfe80,
        }
    }
}

/// Source of the local interface list
pub trait InterfaceProvider: Send + Sync {
    /// Enumerate interface addresses in preference order
    fn interfaces(&self) -> io::Result<Vec<LocalInterface>>;
}

/// Interfaces reported by the operating system
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInterfaces;

impl InterfaceProvider for SystemInterfaces {
    fn interfaces(&self) -> io::Result<Vec<LocalInterface>> {
        let interfaces = if_addrs::get_if_addrs()?
            .into_iter()
            .map(|iface| LocalInterface {
                is_loopback: iface.is_loopback(),
                addr: iface.ip(),
                name: iface.name,
            })
            .collect::<Vec<_>>();
        debug!("System reported {} interface addresses", interfaces.len());
        Ok(interfaces)
    }
}

/// A fixed interface list
#[derive(Debug, Default, Clone)]
pub struct StaticInterfaces(pub Vec<LocalInterface>);

impl InterfaceProvider for StaticInterfaces {
    fn interfaces(&self) -> io::Result<Vec<LocalInterface>> {
        Ok(self.0.clone())
    }
}

/// The facilities an agent is built on
#[derive(Clone)]
pub struct Platform {
    /// Socket factory
    pub sockets: Arc<dyn SocketFactory>,
    /// Interface enumeration
    pub interfaces: Arc<dyn InterfaceProvider>,
}

impl Platform {
    /// Combine a socket factory and an interface provider
    pub fn new(sockets: Arc<dyn SocketFactory>, interfaces: Arc<dyn InterfaceProvider>) -> Self {
        Self { sockets, interfaces }
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::new(Arc::new(TokioSocketFactory), Arc::new(SystemInterfaces))
    }
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform").finish_non_exhaustive()
    }
}
