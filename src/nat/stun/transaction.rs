// src/nat/stun/transaction.rs
//! Outstanding STUN transactions, retransmission and inbound demultiplexing
//!
//! Every socket owned by an agent (or a standalone client) is drained by a
//! single receive loop. Responses are matched to their pending request by the
//! exact 96-bit transaction id; everything else is handed upward.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::protocol::{is_stun, Message, TransactionId};
use crate::nat::error::{NatError, NatResult};
use crate::nat::net::DatagramSocket;

/// Largest datagram we read from a socket
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// Retransmission schedule: `retries + 1` sends with a fixed per-attempt timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub retries: u32,
}

impl RetryPolicy {
    pub fn new(timeout: Duration, retries: u32) -> Self {
        Self { timeout, retries }
    }

    /// Time after which the transaction gives up
    pub fn total(&self) -> Duration {
        self.timeout * (self.retries + 1)
    }
}

/// A response delivered to a pending transaction
#[derive(Debug, Clone)]
pub struct StunResponse {
    pub message: Message,
    /// Bytes the message was decoded from (for integrity checks)
    pub raw: Bytes,
    pub from: SocketAddr,
}

/// Bookkeeping for one outstanding request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunTransaction {
    pub id: TransactionId,
    pub target: SocketAddr,
    pub retransmissions: u32,
    pub deadline: Instant,
    /// Only a response from `target` completes the transaction
    pub strict_source: bool,
}

struct Pending {
    transaction: StunTransaction,
    tx: oneshot::Sender<StunResponse>,
}

/// Pending transactions of one agent or client
#[derive(Default)]
pub struct TransactionTable {
    pending: Mutex<HashMap<TransactionId, Pending>>,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, transaction: StunTransaction) -> NatResult<oneshot::Receiver<StunResponse>> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock();
        if pending.contains_key(&transaction.id) {
            return Err(NatError::InvalidState(format!(
                "transaction {:?} already pending",
                transaction.id
            )));
        }
        pending.insert(transaction.id, Pending { transaction, tx });
        Ok(rx)
    }

    fn note_attempt(&self, id: &TransactionId, attempt: u32, deadline: Instant) {
        if let Some(entry) = self.pending.lock().get_mut(id) {
            entry.transaction.retransmissions = attempt;
            entry.transaction.deadline = deadline;
        }
    }

    /// Hand `response` to the request with the same transaction id.
    /// Returns false when nothing was waiting for it.
    /// A strict transaction ignores responses from anywhere but its target
    /// and keeps waiting.
    pub fn complete(&self, response: StunResponse) -> bool {
        let entry = {
            let mut pending = self.pending.lock();
            let id = response.message.transaction_id;
            match pending.get(&id) {
                Some(entry) if entry.transaction.strict_source && entry.transaction.target != response.from => {
                    debug!(
                        "Discarding response {:?} from {}, expected {}",
                        id, response.from, entry.transaction.target
                    );
                    None
                }
                Some(_) => pending.remove(&id),
                None => None,
            }
        };
        match entry {
            Some(entry) => entry.tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Forget a pending transaction
    pub fn cancel(&self, id: &TransactionId) {
        self.pending.lock().remove(id);
    }

    /// Drop every pending transaction; waiters see a cancellation
    pub fn cancel_all(&self) {
        let dropped = self.pending.lock().drain().count();
        if dropped > 0 {
            debug!("Cancelled {} pending STUN transactions", dropped);
        }
    }

    /// Snapshot of the outstanding transactions
    pub fn pending(&self) -> Vec<StunTransaction> {
        self.pending.lock().values().map(|p| p.transaction.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Classify a received datagram. Responses complete their transaction
    /// and yield `None`; malformed STUN is dropped.
    pub fn dispatch(&self, data: Bytes, from: SocketAddr) -> Option<InboundKind> {
        if !is_stun(&data) {
            return Some(InboundKind::Data(data));
        }

        let message = match Message::decode(&data) {
            Ok(message) => message,
            Err(e) => {
                debug!("Dropping malformed STUN datagram from {}: {}", from, e);
                return None;
            }
        };

        if message.message_type.is_response() {
            let id = message.transaction_id;
            if !self.complete(StunResponse { message, raw: data, from }) {
                trace!("Discarding unmatched STUN response {:?} from {}", id, from);
            }
            None
        } else {
            Some(InboundKind::Stun { message, raw: data })
        }
    }
}

/// Removes the entry if the waiting future is dropped early
struct PendingGuard<'a> {
    table: &'a TransactionTable,
    id: TransactionId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.cancel(&self.id);
    }
}

/// Send `encoded` (the wire form of `request`) to `target` and wait for the
/// matching response, retransmitting per `policy`
///
/// Any source may answer; callers that care (ICE checks) compare
/// `StunResponse::from` themselves.
pub async fn transact(
    socket: &dyn DatagramSocket,
    table: &TransactionTable,
    request: &Message,
    encoded: &[u8],
    target: SocketAddr,
    policy: RetryPolicy,
) -> NatResult<StunResponse> {
    exchange(socket, table, request, encoded, target, policy, false).await
}

/// Like [`transact`], but responses from anywhere except `target` are
/// discarded and the exchange keeps waiting
pub async fn transact_with_server(
    socket: &dyn DatagramSocket,
    table: &TransactionTable,
    request: &Message,
    encoded: &[u8],
    target: SocketAddr,
    policy: RetryPolicy,
) -> NatResult<StunResponse> {
    exchange(socket, table, request, encoded, target, policy, true).await
}

async fn exchange(
    socket: &dyn DatagramSocket,
    table: &TransactionTable,
    request: &Message,
    encoded: &[u8],
    target: SocketAddr,
    policy: RetryPolicy,
    strict_source: bool,
) -> NatResult<StunResponse> {
    let id = request.transaction_id;
    let mut rx = table.register(StunTransaction {
        id,
        target,
        retransmissions: 0,
        deadline: Instant::now() + policy.timeout,
        strict_source,
    })?;
    let _guard = PendingGuard { table, id };

    for attempt in 0..=policy.retries {
        socket.send_to(encoded, target).await?;
        table.note_attempt(&id, attempt, Instant::now() + policy.timeout);
        trace!("Sent {:?} to {} (attempt {})", request.message_type, target, attempt + 1);

        match timeout(policy.timeout, &mut rx).await {
            Ok(Ok(response)) => return Ok(response),
            Ok(Err(_)) => {
                return Err(NatError::InvalidState("transaction cancelled".to_string()));
            }
            Err(_) => debug!(
                "Timeout waiting for {:?} response from {} (attempt {})",
                request.message_type,
                target,
                attempt + 1
            ),
        }
    }

    Err(NatError::Timeout(policy.total()))
}

/// What arrived on a socket
#[derive(Debug, Clone)]
pub enum InboundKind {
    /// STUN request or indication
    Stun { message: Message, raw: Bytes },
    /// Anything that is not STUN
    Data(Bytes),
}

/// A datagram that was not consumed by the transaction table
#[derive(Debug, Clone)]
pub struct Inbound {
    /// Local address of the socket it arrived on
    pub local: SocketAddr,
    pub from: SocketAddr,
    pub kind: InboundKind,
}

/// Drain `socket` until `cancel` fires, completing transactions in `table`
/// and forwarding everything else to `sink`
pub fn spawn_receiver(
    socket: Arc<dyn DatagramSocket>,
    table: Arc<TransactionTable>,
    sink: Option<mpsc::UnboundedSender<Inbound>>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let local = match socket.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!("Receive loop could not read local address: {}", e);
                return;
            }
        };
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            let (len, from) = tokio::select! {
                _ = cancel.cancelled() => break,
                res = socket.recv_from(&mut buf) => match res {
                    Ok(received) => received,
                    // ICMP unreachable surfaces as a reset on some platforms
                    Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => continue,
                    Err(e) => {
                        warn!("Receive loop on {} stopped: {}", local, e);
                        break;
                    }
                },
            };

            let data = Bytes::copy_from_slice(&buf[..len]);
            if let Some(kind) = table.dispatch(data, from) {
                match &sink {
                    Some(sink) => {
                        if sink.send(Inbound { local, from, kind }).is_err() {
                            break;
                        }
                    }
                    None => trace!("Ignoring unsolicited datagram on {} from {}", local, from),
                }
            }
        }

        trace!("Receive loop on {} finished", local);
    })
}
