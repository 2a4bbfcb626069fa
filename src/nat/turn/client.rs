// src/nat/turn/client.rs
//! TURN client (RFC 5766): allocation, refresh, permissions, channels
//!
//! The allocation is also exposed as a [`DatagramSocket`] ([`RelayedSocket`])
//! so relay candidates are checked and used exactly like host candidates.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::BoxFuture;
use md5::{Digest, Md5};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::nat::error::{NatError, NatResult, StunError};
use crate::nat::ice::Candidate;
use crate::nat::net::{DatagramSocket, SocketFactory};
use crate::nat::stun::{
    decode_channel_data, encode_channel_data, is_channel_data, resolve_server, spawn_receiver, transact_with_server, Attribute,
    Inbound, InboundKind, Message, MessageClass, MessageType, RetryPolicy, TransactionId, TransactionTable,
};

/// Default TURN port
pub const DEFAULT_TURN_PORT: u16 = 3478;

/// IANA protocol number for UDP in REQUESTED-TRANSPORT
const TRANSPORT_UDP: u8 = 17;

/// Channel numbers available to clients (RFC 5766 Section 11)
pub const CHANNEL_MIN: u16 = 0x4000;
pub const CHANNEL_MAX: u16 = 0x7FFE;

/// Permissions last 300 s on the server; re-install before that
const PERMISSION_REFRESH: Duration = Duration::from_secs(240);

/// Unauthenticated attempt, authenticated attempt, one stale-nonce retry
const MAX_AUTH_ATTEMPTS: u32 = 3;

/// Below this much remaining lease the allocation is considered lost
const MIN_REFRESH_MARGIN: Duration = Duration::from_secs(2);

/// TURN server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnServerConfig {
    /// Server host name or IP literal
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Realm to expect; learned from the server when absent
    pub realm: Option<String>,
    /// Requested allocation lifetime in seconds
    pub lifetime_secs: u32,
    /// TURN over TLS (not supported)
    pub use_tls: bool,
}

impl Default for TurnServerConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: DEFAULT_TURN_PORT,
            username: String::new(),
            password: String::new(),
            realm: None,
            lifetime_secs: 600,
            use_tls: false,
        }
    }
}

/// State of a successful allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Relayed transport address on the server
    pub relayed: SocketAddr,
    /// Our address as seen by the server
    pub mapped: Option<SocketAddr>,
    pub lifetime: Duration,
    pub expires_at: Instant,
}

struct LongTermAuth {
    realm: String,
    nonce: Vec<u8>,
    key: Vec<u8>,
}

/// Long-term credential key: MD5(username:realm:password)
pub fn long_term_key(username: &str, realm: &str, password: &str) -> Vec<u8> {
    Md5::digest(format!("{}:{}:{}", username, realm, password).as_bytes()).to_vec()
}

/// TURN client bound to one local socket and one server
pub struct TurnClient {
    config: TurnServerConfig,
    server: SocketAddr,
    socket: Arc<dyn DatagramSocket>,
    transactions: Arc<TransactionTable>,
    policy: RetryPolicy,
    software: Option<String>,
    auth: Mutex<Option<LongTermAuth>>,
    allocation: Mutex<Option<Allocation>>,
    permissions: Mutex<HashMap<IpAddr, Instant>>,
    channels: Mutex<HashMap<SocketAddr, u16>>,
    relayed_rx: AsyncMutex<mpsc::UnboundedReceiver<Inbound>>,
    lost: AtomicBool,
    cancel: CancellationToken,
}

impl TurnClient {
    /// Resolve the configured server, bind a socket on `local` and start the client
    pub async fn connect(
        factory: &dyn SocketFactory,
        local: SocketAddr,
        config: TurnServerConfig,
        policy: RetryPolicy,
        software: Option<String>,
    ) -> NatResult<Arc<Self>> {
        if config.use_tls {
            return Err(NatError::NotSupported("TURN over TLS".to_string()));
        }
        let server = resolve_server(&config.server, config.port, Some(local.is_ipv6())).await?;
        let socket = factory.bind(local).await?;
        Ok(Self::new(socket, server, config, policy, software))
    }

    /// Start a client on an already bound socket
    pub fn new(
        socket: Arc<dyn DatagramSocket>,
        server: SocketAddr,
        config: TurnServerConfig,
        policy: RetryPolicy,
        software: Option<String>,
    ) -> Arc<Self> {
        let transactions = Arc::new(TransactionTable::new());
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        spawn_receiver(socket.clone(), transactions.clone(), Some(tx), cancel.clone());

        Arc::new(Self {
            config,
            server,
            socket,
            transactions,
            policy,
            software,
            auth: Mutex::new(None),
            allocation: Mutex::new(None),
            permissions: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            relayed_rx: AsyncMutex::new(rx),
            lost: AtomicBool::new(false),
            cancel,
        })
    }

    /// TURN server address
    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// Local address of the socket talking to the server
    pub fn local_addr(&self) -> NatResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Current allocation, if any
    pub fn allocation(&self) -> Option<Allocation> {
        *self.allocation.lock()
    }

    /// Whether the lease ran out without a successful refresh
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Allocate a relayed address and return it as a Relay candidate
    pub async fn allocate(&self, component_id: u32, local_preference: u32) -> NatResult<Candidate> {
        if self.allocation.lock().is_some() {
            return Err(NatError::InvalidState("allocation already exists".to_string()));
        }
        info!("Requesting TURN allocation on {} for component {}", self.server, component_id);

        let response = self
            .request(
                MessageType::AllocateRequest,
                vec![
                    Attribute::RequestedTransport(TRANSPORT_UDP),
                    Attribute::Lifetime(self.config.lifetime_secs),
                ],
            )
            .await?;

        let relayed = response
            .attributes
            .iter()
            .find_map(|attr| match attr {
                Attribute::XorRelayedAddress(addr) => Some(*addr),
                _ => None,
            })
            .ok_or(StunError::MissingAttribute("XOR-RELAYED-ADDRESS"))?;
        let mapped = response.mapped_address();
        let lifetime = lifetime_of(&response).unwrap_or(Duration::from_secs(self.config.lifetime_secs as u64));

        *self.allocation.lock() = Some(Allocation {
            relayed,
            mapped,
            lifetime,
            expires_at: Instant::now() + lifetime,
        });
        self.lost.store(false, Ordering::SeqCst);

        info!("TURN allocation {} -> {} (lifetime {:?})", self.local_addr()?, relayed, lifetime);

        let related = match mapped {
            Some(addr) => addr,
            None => self.local_addr()?,
        };
        Ok(Candidate::new_relay(relayed, related, component_id, local_preference, self.server))
    }

    /// Extend the allocation lease; returns the lifetime granted
    pub async fn refresh(&self) -> NatResult<Duration> {
        if self.allocation.lock().is_none() {
            return Err(NatError::InvalidState("no allocation to refresh".to_string()));
        }

        let response = self
            .request(MessageType::RefreshRequest, vec![Attribute::Lifetime(self.config.lifetime_secs)])
            .await;

        let response = match response {
            Ok(response) => response,
            Err(NatError::Stun(StunError::ErrorResponse { code: 437, reason })) => {
                // Allocation Mismatch: the server no longer knows us
                self.mark_lost();
                return Err(StunError::ErrorResponse { code: 437, reason }.into());
            }
            Err(e) => return Err(e),
        };

        let lifetime = lifetime_of(&response).unwrap_or(Duration::from_secs(self.config.lifetime_secs as u64));
        if let Some(allocation) = self.allocation.lock().as_mut() {
            allocation.lifetime = lifetime;
            allocation.expires_at = Instant::now() + lifetime;
        }
        debug!("Refreshed TURN allocation on {} for {:?}", self.server, lifetime);
        Ok(lifetime)
    }

    /// Keep the allocation alive until cancelled, refreshing at half the lifetime
    pub fn start_refresh_timer(self: &Arc<Self>) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let Some(allocation) = client.allocation() else { break };
                let remaining = allocation.expires_at.saturating_duration_since(Instant::now());
                if remaining < MIN_REFRESH_MARGIN {
                    warn!("TURN allocation {} expired before it could be refreshed", allocation.relayed);
                    client.mark_lost();
                    break;
                }

                tokio::select! {
                    _ = client.cancel.cancelled() => break,
                    _ = sleep(remaining / 2) => {}
                }

                if let Err(e) = client.refresh().await {
                    warn!("TURN refresh on {} failed: {}", client.server, e);
                    if client.is_lost() {
                        break;
                    }
                }
            }
        })
    }

    /// Authorize `peer` to exchange relayed traffic with us
    pub async fn create_permission(&self, peer: SocketAddr) -> NatResult<()> {
        self.require_allocation()?;
        if self.has_fresh_permission(&peer.ip()) {
            return Ok(());
        }

        self.request(MessageType::CreatePermissionRequest, vec![Attribute::XorPeerAddress(peer)])
            .await?;
        self.permissions.lock().insert(peer.ip(), Instant::now());
        debug!("TURN permission installed for {}", peer.ip());
        Ok(())
    }

    /// Bind a channel to `peer`; returns the channel number
    pub async fn channel_bind(&self, peer: SocketAddr) -> NatResult<u16> {
        self.require_allocation()?;

        let channel = {
            let channels = self.channels.lock();
            match channels.get(&peer) {
                Some(channel) => *channel,
                None => (CHANNEL_MIN..=CHANNEL_MAX)
                    .find(|n| !channels.values().any(|used| used == n))
                    .ok_or_else(|| NatError::ResourceExhausted("no free TURN channel numbers".to_string()))?,
            }
        };

        self.request(
            MessageType::ChannelBindRequest,
            vec![Attribute::ChannelNumber(channel), Attribute::XorPeerAddress(peer)],
        )
        .await?;

        self.channels.lock().insert(peer, channel);
        // A channel binding also installs a permission
        self.permissions.lock().insert(peer.ip(), Instant::now());
        debug!("TURN channel 0x{:04X} bound to {}", channel, peer);
        Ok(channel)
    }

    /// Relay `data` to `peer` (ChannelData if a channel is bound, else a Send indication)
    pub async fn send_to_peer(&self, data: &[u8], peer: SocketAddr) -> NatResult<()> {
        self.create_permission(peer).await?;

        let channel = self.channels.lock().get(&peer).copied();
        let frame = match channel {
            Some(channel) => encode_channel_data(channel, data)?,
            None => Message::new(MessageType::SendIndication, TransactionId::new())
                .with_attribute(Attribute::XorPeerAddress(peer))
                .with_attribute(Attribute::Data(data.to_vec()))
                .encode(None, false)?,
        };

        self.socket.send_to(&frame, self.server).await?;
        Ok(())
    }

    /// Next datagram relayed to us by the server, as `(payload, peer)`
    pub async fn recv_from_peer(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut rx = self.relayed_rx.lock().await;
        loop {
            let inbound = rx
                .recv()
                .await
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "TURN client closed"))?;

            if inbound.from != self.server {
                trace!("Ignoring datagram from {} on TURN socket", inbound.from);
                continue;
            }

            if let Some((payload, peer)) = self.unwrap_relayed(inbound.kind) {
                let n = payload.len().min(buf.len());
                buf[..n].copy_from_slice(&payload[..n]);
                return Ok((n, peer));
            }
        }
    }

    /// Delete the allocation (Refresh with lifetime 0) and stop the client
    pub async fn close(&self) {
        if self.allocation.lock().take().is_some() {
            let request = Message::new(MessageType::RefreshRequest, TransactionId::new())
                .with_attribute(Attribute::Lifetime(0));
            let result = self.send_once(request).await;
            match result {
                Ok(()) => debug!("TURN allocation on {} released", self.server),
                Err(e) => debug!("TURN deallocation on {} failed: {}", self.server, e),
            }
        }
        self.permissions.lock().clear();
        self.channels.lock().clear();
        self.transactions.cancel_all();
        self.cancel.cancel();
    }

    /// Relayed socket view of this allocation
    pub fn relayed_socket(self: &Arc<Self>) -> NatResult<Arc<RelayedSocket>> {
        let relayed = self.require_allocation()?.relayed;
        Ok(Arc::new(RelayedSocket { client: Arc::clone(self), relayed }))
    }

    fn require_allocation(&self) -> NatResult<Allocation> {
        self.allocation()
            .ok_or_else(|| NatError::InvalidState("no TURN allocation".to_string()))
    }

    fn has_fresh_permission(&self, ip: &IpAddr) -> bool {
        self.permissions
            .lock()
            .get(ip)
            .map(|installed| installed.elapsed() < PERMISSION_REFRESH)
            .unwrap_or(false)
    }

    fn mark_lost(&self) {
        self.lost.store(true, Ordering::SeqCst);
        self.allocation.lock().take();
        self.permissions.lock().clear();
        self.channels.lock().clear();
    }

    fn unwrap_relayed(&self, kind: InboundKind) -> Option<(Bytes, SocketAddr)> {
        match kind {
            InboundKind::Stun { message, .. } if message.message_type == MessageType::DataIndication => {
                let mut peer = None;
                let mut data = None;
                for attr in message.attributes {
                    match attr {
                        Attribute::XorPeerAddress(addr) => peer = Some(addr),
                        Attribute::Data(bytes) => data = Some(Bytes::from(bytes)),
                        _ => {}
                    }
                }
                data.zip(peer)
            }
            InboundKind::Data(frame) if is_channel_data(&frame) => {
                let (channel, payload) = match decode_channel_data(&frame) {
                    Ok(parts) => parts,
                    Err(e) => {
                        debug!("Dropping ChannelData: {}", e);
                        return None;
                    }
                };
                let peer = self
                    .channels
                    .lock()
                    .iter()
                    .find_map(|(peer, n)| (*n == channel).then_some(*peer));
                if peer.is_none() {
                    debug!("ChannelData on unbound channel 0x{:04X}", channel);
                }
                peer.map(|peer| (frame.slice_ref(payload), peer))
            }
            other => {
                trace!("Ignoring {:?} on TURN socket", other);
                None
            }
        }
    }

    /// One long-term-authenticated exchange, answering 401/438 challenges
    async fn request(&self, message_type: MessageType, attributes: Vec<Attribute>) -> NatResult<Message> {
        for attempt in 1..=MAX_AUTH_ATTEMPTS {
            let mut request = Message::new(message_type, TransactionId::new());
            for attr in &attributes {
                request.add_attribute(attr.clone());
            }
            if let Some(software) = &self.software {
                request.add_attribute(Attribute::Software(software.clone()));
            }
            let key = self.add_auth_attributes(&mut request);
            let encoded = request.encode(key.as_deref(), true)?;

            let response = transact_with_server(
                self.socket.as_ref(),
                &self.transactions,
                &request,
                &encoded,
                self.server,
                self.policy,
            )
            .await?;

            let message = response.message;
            if !message.unknown_attributes.is_empty() {
                return Err(StunError::UnknownComprehensionRequired(message.unknown_attributes).into());
            }

            match message.message_type.class() {
                MessageClass::SuccessResponse => {
                    if let Some(key) = &key {
                        if message.has_attribute(crate::nat::stun::AttributeType::MessageIntegrity) {
                            message.verify_integrity(key, &response.raw)?;
                        }
                    }
                    return Ok(message);
                }
                MessageClass::ErrorResponse => {
                    let (code, reason) = message.error_code().unwrap_or((0, ""));
                    match code {
                        401 if key.is_some() => {
                            return Err(NatError::Authentication(format!(
                                "{} rejected credentials for '{}'",
                                self.server, self.config.username
                            )));
                        }
                        401 | 438 => {
                            debug!("TURN {:?} challenged with {} (attempt {})", message_type, code, attempt);
                            self.learn_auth(&message)?;
                        }
                        _ => {
                            return Err(StunError::ErrorResponse { code, reason: reason.to_string() }.into());
                        }
                    }
                }
                _ => return Err(StunError::UnexpectedMessage(message.message_type as u16).into()),
            }
        }

        Err(NatError::Authentication(format!(
            "{:?} not accepted after {} attempts",
            message_type, MAX_AUTH_ATTEMPTS
        )))
    }

    /// Single unauthenticated-retry-free exchange used on shutdown
    async fn send_once(&self, mut request: Message) -> NatResult<()> {
        let key = self.add_auth_attributes(&mut request);
        let encoded = request.encode(key.as_deref(), true)?;
        let policy = RetryPolicy::new(self.policy.timeout, 0);
        transact_with_server(self.socket.as_ref(), &self.transactions, &request, &encoded, self.server, policy).await?;
        Ok(())
    }

    fn add_auth_attributes(&self, request: &mut Message) -> Option<Vec<u8>> {
        let auth = self.auth.lock();
        let auth = auth.as_ref()?;
        request.add_attribute(Attribute::Username(self.config.username.clone()));
        request.add_attribute(Attribute::Realm(auth.realm.clone()));
        request.add_attribute(Attribute::Nonce(auth.nonce.clone()));
        Some(auth.key.clone())
    }

    fn learn_auth(&self, challenge: &Message) -> NatResult<()> {
        let mut realm = None;
        let mut nonce = None;
        for attr in &challenge.attributes {
            match attr {
                Attribute::Realm(r) => realm = Some(r.clone()),
                Attribute::Nonce(n) => nonce = Some(n.clone()),
                _ => {}
            }
        }

        let nonce = nonce.ok_or(StunError::MissingAttribute("NONCE"))?;
        let realm = match (realm, &self.config.realm, self.auth.lock().as_ref()) {
            (Some(realm), _, _) => realm,
            (None, Some(configured), _) => configured.clone(),
            (None, None, Some(previous)) => previous.realm.clone(),
            (None, None, None) => return Err(StunError::MissingAttribute("REALM").into()),
        };

        let key = long_term_key(&self.config.username, &realm, &self.config.password);
        *self.auth.lock() = Some(LongTermAuth { realm, nonce, key });
        Ok(())
    }
}

fn lifetime_of(message: &Message) -> Option<Duration> {
    message.attributes.iter().find_map(|attr| match attr {
        Attribute::Lifetime(secs) => Some(Duration::from_secs(*secs as u64)),
        _ => None,
    })
}

/// A TURN allocation used as a datagram socket; `local_addr` is the relayed address
pub struct RelayedSocket {
    client: Arc<TurnClient>,
    relayed: SocketAddr,
}

impl RelayedSocket {
    /// Client behind this socket
    pub fn client(&self) -> &Arc<TurnClient> {
        &self.client
    }
}

impl DatagramSocket for RelayedSocket {
    fn send_to<'a>(&'a self, data: &'a [u8], target: SocketAddr) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(async move {
            match self.client.send_to_peer(data, target).await {
                Ok(()) => Ok(data.len()),
                Err(NatError::Io(e)) => Err(e),
                Err(e) => Err(io::Error::new(io::ErrorKind::Other, e.to_string())),
            }
        })
    }

    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<(usize, SocketAddr)>> {
        Box::pin(self.client.recv_from_peer(buf))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.relayed)
    }
}
