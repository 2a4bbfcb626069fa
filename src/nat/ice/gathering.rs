// src/nat/ice/gathering.rs
//! ICE candidate gathering (RFC 8445 Section 5.1.1)
//!
//! Host candidates come from the interface list, server reflexive ones from
//! STUN Binding requests sent on the host sockets, relayed ones from TURN
//! allocations on dedicated sockets. Failures of a single interface or
//! server are logged and skipped.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, info, warn};

use super::candidate::{Candidate, CandidateType};
use super::priority::local_preference_for_index;
use crate::nat::error::NatResult;
use crate::nat::net::{DatagramSocket, Platform};
use crate::nat::stun::{RetryPolicy, StunClient, StunConfig, TransactionTable};
use crate::nat::turn::{TurnClient, TurnServerConfig};

/// A local candidate together with the socket it sends from
#[derive(Clone)]
pub struct LocalBinding {
    pub candidate: Candidate,
    pub socket: Arc<dyn DatagramSocket>,
}

impl LocalBinding {
    /// Local preference encoded in the candidate priority
    pub fn local_preference(&self) -> u32 {
        (self.candidate.priority >> 8) & 0xFFFF
    }
}

/// Bind one socket per usable interface and component
///
/// Interface order defines local preference, the first usable interface
/// being preferred.
pub async fn gather_host_candidates<F>(platform: &Platform, components: u32, mut emit: F) -> Vec<LocalBinding>
where
    F: FnMut(&Candidate),
{
    let interfaces = match platform.interfaces.interfaces() {
        Ok(list) => list,
        Err(e) => {
            warn!("Interface enumeration failed: {}", e);
            return Vec::new();
        }
    };

    let usable: Vec<_> = interfaces
        .into_iter()
        .filter(|iface| {
            let usable = iface.is_usable_for_candidates();
            if !usable {
                debug!("Skipping interface {} ({})", iface.name, iface.addr);
            }
            usable
        })
        .collect();

    let mut bindings = Vec::new();
    for (index, iface) in usable.iter().enumerate() {
        let local_preference = local_preference_for_index(index);

        for component_id in 1..=components {
            let socket = match platform.sockets.bind(SocketAddr::new(iface.addr, 0)).await {
                Ok(socket) => socket,
                Err(e) => {
                    warn!("Cannot bind on {} ({}): {}", iface.name, iface.addr, e);
                    continue;
                }
            };
            let addr = match socket.local_addr() {
                Ok(addr) => addr,
                Err(e) => {
                    warn!("Socket on {} has no local address: {}", iface.addr, e);
                    continue;
                }
            };

            let candidate = Candidate::new_host(addr, component_id, local_preference);
            info!("Host candidate {} on {}", candidate, iface.name);
            emit(&candidate);
            bindings.push(LocalBinding { candidate, socket });
        }
    }

    bindings
}

/// Ask every STUN server for the mapped address of every host socket of the
/// same address family
///
/// The host sockets must already be drained into `transactions`. Mapped
/// addresses equal to the host address (no NAT) or already known are dropped.
pub async fn gather_server_reflexive<F>(
    hosts: &[LocalBinding],
    servers: &[SocketAddr],
    transactions: &Arc<TransactionTable>,
    config: &StunConfig,
    mut emit: F,
) -> Vec<Candidate>
where
    F: FnMut(&Candidate),
{
    let mut requests = FuturesUnordered::new();
    for host in hosts {
        for server in servers.iter().filter(|s| s.is_ipv4() == host.candidate.addr.is_ipv4()) {
            let client = StunClient::new(host.socket.clone(), transactions.clone(), config.clone());
            let server = *server;
            requests.push(async move {
                let result = client.binding_request(server).await;
                (host, server, result)
            });
        }
    }

    let mut seen = HashSet::new();
    let mut candidates = Vec::new();
    while let Some((host, server, result)) = requests.next().await {
        let mapped = match result {
            Ok(mapped) => mapped,
            Err(e) => {
                warn!("STUN server {} failed for {}: {}", server, host.candidate.addr, e);
                continue;
            }
        };

        if mapped == host.candidate.addr {
            debug!("{} is not behind a NAT according to {}", mapped, server);
            continue;
        }
        if !seen.insert((mapped, host.candidate.component_id)) {
            continue;
        }

        let candidate = Candidate::new_server_reflexive(
            mapped,
            host.candidate.addr,
            host.candidate.component_id,
            host.local_preference(),
            server,
        );
        info!("Server reflexive candidate {} via {}", candidate, server);
        emit(&candidate);
        candidates.push(candidate);
    }

    candidates
}

/// A relay candidate and the TURN client keeping its allocation alive
pub struct RelayBinding {
    pub candidate: Candidate,
    pub client: Arc<TurnClient>,
}

/// Allocate one relayed address per TURN server and component
///
/// Each allocation gets its own socket, bound on the IP of the preferred
/// host candidate of that component.
pub async fn gather_relay_candidates<F>(
    platform: &Platform,
    hosts: &[LocalBinding],
    servers: &[TurnServerConfig],
    policy: RetryPolicy,
    software: Option<String>,
    mut emit: F,
) -> Vec<RelayBinding>
where
    F: FnMut(&Candidate),
{
    let mut allocations = FuturesUnordered::new();
    for (server_index, server) in servers.iter().enumerate() {
        // One allocation per component, from its preferred host
        let mut components = HashSet::new();
        for host in hosts {
            if host.candidate.typ != CandidateType::Host || !components.insert(host.candidate.component_id) {
                continue;
            }

            let local_preference = local_preference_for_index(server_index);
            let software = software.clone();
            allocations.push(async move {
                let result = allocate(platform, host, server, policy, software, local_preference).await;
                (server, result)
            });
        }
    }

    let mut relays = Vec::new();
    while let Some((server, result)) = allocations.next().await {
        match result {
            Ok(relay) => {
                info!("Relay candidate {} via {}", relay.candidate, server.server);
                emit(&relay.candidate);
                relays.push(relay);
            }
            Err(e) => warn!("TURN server {} failed: {}", server.server, e),
        }
    }

    relays
}

async fn allocate(
    platform: &Platform,
    host: &LocalBinding,
    server: &TurnServerConfig,
    policy: RetryPolicy,
    software: Option<String>,
    local_preference: u32,
) -> NatResult<RelayBinding> {
    let bind = SocketAddr::new(host.candidate.addr.ip(), 0);
    let client = TurnClient::connect(platform.sockets.as_ref(), bind, server.clone(), policy, software).await?;

    match client.allocate(host.candidate.component_id, local_preference).await {
        Ok(candidate) => Ok(RelayBinding { candidate, client }),
        Err(e) => {
            client.close().await;
            Err(e)
        }
    }
}
