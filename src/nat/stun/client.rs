// src/nat/stun/client.rs
//! STUN Binding client (server-reflexive address discovery)

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::lookup_host;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::protocol::{Attribute, Message, MessageType, TransactionId};
use super::transaction::{spawn_receiver, transact_with_server, RetryPolicy, TransactionTable};
use crate::nat::error::{NatError, NatResult, StunError};
use crate::nat::net::{DatagramSocket, SocketFactory};

/// Default STUN port (RFC 5389 Section 18.4)
pub const DEFAULT_STUN_PORT: u16 = 3478;

/// STUN client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StunConfig {
    /// Fixed per-attempt timeout in milliseconds
    pub timeout_ms: u64,

    /// Retransmissions after the first send
    pub retries: u32,

    /// SOFTWARE attribute value
    pub software: Option<String>,
}

impl Default for StunConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 3000,
            retries: 3,
            software: None,
        }
    }
}

impl StunConfig {
    /// Retransmission schedule for this configuration
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(self.timeout_ms), self.retries)
    }
}

/// STUN client bound to one local socket
pub struct StunClient {
    socket: Arc<dyn DatagramSocket>,
    transactions: Arc<TransactionTable>,
    config: StunConfig,
    /// Set when this client runs its own receive loop
    receiver: Option<CancellationToken>,
}

impl StunClient {
    /// Client on a socket whose datagrams are already fed into `transactions`
    pub fn new(socket: Arc<dyn DatagramSocket>, transactions: Arc<TransactionTable>, config: StunConfig) -> Self {
        Self {
            socket,
            transactions,
            config,
            receiver: None,
        }
    }

    /// Bind a fresh socket on `local` and drain it with a private receive loop
    pub async fn bind(factory: &dyn SocketFactory, local: SocketAddr, config: StunConfig) -> NatResult<Self> {
        let socket = factory.bind(local).await?;
        let transactions = Arc::new(TransactionTable::new());
        let cancel = CancellationToken::new();
        spawn_receiver(socket.clone(), transactions.clone(), None, cancel.clone());

        Ok(Self {
            socket,
            transactions,
            config,
            receiver: Some(cancel),
        })
    }

    /// Local address of the underlying socket
    pub fn local_addr(&self) -> NatResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Client configuration
    pub fn config(&self) -> &StunConfig {
        &self.config
    }

    /// Ask `server` for our server-reflexive address
    pub async fn binding_request(&self, server: SocketAddr) -> NatResult<SocketAddr> {
        let mut request = Message::new(MessageType::BindingRequest, TransactionId::new());
        if let Some(software) = &self.config.software {
            request.add_attribute(Attribute::Software(software.clone()));
        }
        let encoded = request.encode(None, true)?;

        let response = transact_with_server(
            self.socket.as_ref(),
            &self.transactions,
            &request,
            &encoded,
            server,
            self.config.retry_policy(),
        )
        .await?;

        let message = response.message;
        if !message.unknown_attributes.is_empty() {
            return Err(StunError::UnknownComprehensionRequired(message.unknown_attributes).into());
        }

        match message.message_type {
            MessageType::BindingResponse => {
                let mapped = message
                    .mapped_address()
                    .ok_or(StunError::MissingAttribute("XOR-MAPPED-ADDRESS"))?;
                debug!("STUN server {} sees us as {}", server, mapped);
                Ok(mapped)
            }
            MessageType::BindingError => {
                let (code, reason) = message.error_code().unwrap_or((0, "no ERROR-CODE"));
                info!("STUN server {} rejected binding: {} {}", server, code, reason);
                Err(StunError::ErrorResponse { code, reason: reason.to_string() }.into())
            }
            other => Err(StunError::UnexpectedMessage(other as u16).into()),
        }
    }
}

impl Drop for StunClient {
    fn drop(&mut self) {
        if let Some(cancel) = &self.receiver {
            cancel.cancel();
        }
    }
}

/// Resolve `host:port`, preferring an address of the requested family
pub async fn resolve_server(host: &str, port: u16, want_ipv6: Option<bool>) -> NatResult<SocketAddr> {
    if host.is_empty() {
        return Err(NatError::InvalidParam("empty server host".to_string()));
    }
    if let Ok(ip) = host.trim_matches(|c| c == '[' || c == ']').parse() {
        return Ok(SocketAddr::new(ip, port));
    }

    let addrs: Vec<SocketAddr> = lookup_host((host, port)).await?.collect();
    let chosen = match want_ipv6 {
        Some(v6) => addrs.iter().find(|a| a.is_ipv6() == v6).copied(),
        None => addrs.first().copied(),
    };

    chosen.ok_or_else(|| NatError::InvalidParam(format!("{} did not resolve to a usable address", host)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat::net::TokioSocketFactory;
    use crate::nat::stun::protocol::MessageClass;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::net::UdpSocket;

    #[derive(Clone, Copy)]
    enum Behaviour {
        Answer,
        FlipTransactionBit,
        Reject,
        DropFirst,
    }

    /// Minimal STUN server answering on loopback
    async fn spawn_server(behaviour: Behaviour) -> (SocketAddr, Arc<AtomicU32>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let seen = Arc::new(AtomicU32::new(0));
        let counter = seen.clone();

        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            loop {
                let Ok((len, from)) = socket.recv_from(&mut buf).await else { break };
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let request = Message::decode(&buf[..len]).unwrap();

                let mut response = match behaviour {
                    Behaviour::Reject => {
                        Message::response_to(&request, MessageClass::ErrorResponse).unwrap().with_attribute(
                            Attribute::ErrorCode { code: 400, reason: "Bad Request".to_string() },
                        )
                    }
                    _ => Message::response_to(&request, MessageClass::SuccessResponse)
                        .unwrap()
                        .with_attribute(Attribute::XorMappedAddress(from)),
                };

                match behaviour {
                    Behaviour::DropFirst if n == 0 => continue,
                    Behaviour::FlipTransactionBit => {
                        let mut bytes = *request.transaction_id.as_bytes();
                        bytes[5] ^= 0x10;
                        response.transaction_id = TransactionId::from_bytes(bytes);
                    }
                    _ => {}
                }

                let encoded = response.encode(None, true).unwrap();
                let _ = socket.send_to(&encoded, from).await;
            }
        });

        (addr, seen)
    }

    fn fast_config() -> StunConfig {
        StunConfig {
            timeout_ms: 100,
            retries: 2,
            software: Some("sharp-ice test".to_string()),
        }
    }

    #[tokio::test]
    async fn test_binding_request_returns_mapped_address() {
        let (server, _) = spawn_server(Behaviour::Answer).await;
        let client = StunClient::bind(&TokioSocketFactory, "127.0.0.1:0".parse().unwrap(), fast_config())
            .await
            .unwrap();

        let mapped = client.binding_request(server).await.unwrap();
        assert_eq!(mapped, client.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_mismatched_transaction_id_times_out() {
        let (server, seen) = spawn_server(Behaviour::FlipTransactionBit).await;
        let client = StunClient::bind(&TokioSocketFactory, "127.0.0.1:0".parse().unwrap(), fast_config())
            .await
            .unwrap();

        let result = client.binding_request(server).await;
        assert!(matches!(result, Err(NatError::Timeout(_))), "got {:?}", result);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_error_response_is_protocol_error() {
        let (server, _) = spawn_server(Behaviour::Reject).await;
        let client = StunClient::bind(&TokioSocketFactory, "127.0.0.1:0".parse().unwrap(), fast_config())
            .await
            .unwrap();

        match client.binding_request(server).await {
            Err(NatError::Stun(StunError::ErrorResponse { code, .. })) => assert_eq!(code, 400),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retransmits_after_loss() {
        let (server, seen) = spawn_server(Behaviour::DropFirst).await;
        let client = StunClient::bind(&TokioSocketFactory, "127.0.0.1:0".parse().unwrap(), fast_config())
            .await
            .unwrap();

        assert!(client.binding_request(server).await.is_ok());
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_resolve_literal_addresses() {
        assert_eq!(
            resolve_server("192.0.2.10", 3478, None).await.unwrap(),
            "192.0.2.10:3478".parse().unwrap()
        );
        assert_eq!(
            resolve_server("[2001:db8::1]", 19302, Some(true)).await.unwrap(),
            "[2001:db8::1]:19302".parse().unwrap()
        );
        assert!(resolve_server("", 3478, None).await.is_err());
    }
}
