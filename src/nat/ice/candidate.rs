// src/nat/ice/candidate.rs
//! ICE candidate and candidate pair representation

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use super::foundation::{calculate_foundation, calculate_pair_foundation};
use super::priority::{calculate_pair_priority, calculate_priority};

/// ICE candidate type (RFC 8445 Section 5.1.1.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandidateType {
    /// Host candidate (local address)
    Host,
    /// Server reflexive (from STUN)
    ServerReflexive,
    /// Peer reflexive (discovered during connectivity checks)
    PeerReflexive,
    /// Relayed candidate (from TURN)
    Relay,
}

impl CandidateType {
    /// SDP token for this type
    pub fn to_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::ServerReflexive => "srflx",
            Self::PeerReflexive => "prflx",
            Self::Relay => "relay",
        }
    }

    /// Parse an SDP type token
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "host" => Some(Self::Host),
            "srflx" => Some(Self::ServerReflexive),
            "prflx" => Some(Self::PeerReflexive),
            "relay" => Some(Self::Relay),
            _ => None,
        }
    }

    /// Type preference (RFC 8445 Section 5.1.2.2)
    pub fn preference(&self) -> u32 {
        super::priority::get_type_preference(*self)
    }
}

/// Transport protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportProtocol {
    Udp,
    Tcp,
}

impl TransportProtocol {
    /// SDP token for this transport
    pub fn to_str(&self) -> &'static str {
        match self {
            Self::Udp => "UDP",
            Self::Tcp => "TCP",
        }
    }
}

/// ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Candidate {
    /// Groups candidates with equivalent connectivity properties
    pub foundation: String,

    /// Component ID (1 for media, 2 for control)
    pub component_id: u32,

    /// Transport protocol
    pub transport: TransportProtocol,

    /// Priority (RFC 8445 Section 5.1.2)
    pub priority: u32,

    /// Transport address
    pub addr: SocketAddr,

    /// Candidate type
    pub typ: CandidateType,

    /// Related address (for reflexive/relay candidates)
    pub related_addr: Option<SocketAddr>,
}

impl Candidate {
    /// Create a host candidate
    pub fn new_host(addr: SocketAddr, component_id: u32, local_preference: u32) -> Self {
        Self {
            foundation: calculate_foundation(CandidateType::Host, &addr.ip(), TransportProtocol::Udp, None),
            component_id,
            transport: TransportProtocol::Udp,
            priority: calculate_priority(CandidateType::Host, local_preference, component_id),
            addr,
            typ: CandidateType::Host,
            related_addr: None,
        }
    }

    /// Create a server reflexive candidate learned from `server`
    pub fn new_server_reflexive(
        addr: SocketAddr,
        base: SocketAddr,
        component_id: u32,
        local_preference: u32,
        server: SocketAddr,
    ) -> Self {
        Self {
            foundation: calculate_foundation(
                CandidateType::ServerReflexive,
                &base.ip(),
                TransportProtocol::Udp,
                Some(&server),
            ),
            component_id,
            transport: TransportProtocol::Udp,
            priority: calculate_priority(CandidateType::ServerReflexive, local_preference, component_id),
            addr,
            typ: CandidateType::ServerReflexive,
            related_addr: Some(base),
        }
    }

    /// Create a peer reflexive candidate with an explicit priority
    pub fn new_peer_reflexive(addr: SocketAddr, base: SocketAddr, component_id: u32, priority: u32) -> Self {
        Self {
            foundation: calculate_foundation(CandidateType::PeerReflexive, &base.ip(), TransportProtocol::Udp, None),
            component_id,
            transport: TransportProtocol::Udp,
            priority,
            addr,
            typ: CandidateType::PeerReflexive,
            related_addr: Some(base),
        }
    }

    /// Create a relay candidate allocated on `server`
    pub fn new_relay(
        addr: SocketAddr,
        related: SocketAddr,
        component_id: u32,
        local_preference: u32,
        server: SocketAddr,
    ) -> Self {
        Self {
            foundation: calculate_foundation(CandidateType::Relay, &related.ip(), TransportProtocol::Udp, Some(&server)),
            component_id,
            transport: TransportProtocol::Udp,
            priority: calculate_priority(CandidateType::Relay, local_preference, component_id),
            addr,
            typ: CandidateType::Relay,
            related_addr: Some(related),
        }
    }

    /// Priority this candidate would have as a peer reflexive candidate,
    /// sent in the PRIORITY attribute of checks (RFC 8445 Section 7.1.1)
    pub fn peer_reflexive_priority(&self) -> u32 {
        let local_preference = (self.priority >> 8) & 0xFFFF;
        calculate_priority(CandidateType::PeerReflexive, local_preference, self.component_id)
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&super::sdp::to_sdp(self))
    }
}

/// Candidate pair check state (RFC 8445 Section 6.1.2.6)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidatePairState {
    Frozen,
    Waiting,
    InProgress,
    Succeeded,
    Failed,
}

impl CandidatePairState {
    /// Succeeded or Failed
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// A (local, remote) candidate pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidatePair {
    pub local: Candidate,
    pub remote: Candidate,
    pub priority: u64,
    /// `local_foundation:remote_foundation`
    pub foundation: String,
    pub state: CandidatePairState,
    pub nominated: bool,
}

impl CandidatePair {
    /// Create a Frozen pair, computing its priority from our role
    pub fn new(local: Candidate, remote: Candidate, controlling: bool) -> Self {
        let priority = if controlling {
            calculate_pair_priority(local.priority, remote.priority)
        } else {
            calculate_pair_priority(remote.priority, local.priority)
        };
        let foundation = calculate_pair_foundation(&local.foundation, &remote.foundation);

        Self {
            local,
            remote,
            priority,
            foundation,
            state: CandidatePairState::Frozen,
            nominated: false,
        }
    }

    /// Recompute the priority after a role change
    pub fn recompute_priority(&mut self, controlling: bool) {
        self.priority = if controlling {
            calculate_pair_priority(self.local.priority, self.remote.priority)
        } else {
            calculate_pair_priority(self.remote.priority, self.local.priority)
        };
    }

    /// Both ends of the pair
    pub fn addresses(&self) -> (SocketAddr, SocketAddr) {
        (self.local.addr, self.remote.addr)
    }
}

impl fmt::Display for CandidatePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {} {} ({:?})",
            self.local.typ.to_str(),
            self.local.addr,
            self.remote.typ.to_str(),
            self.remote.addr,
            self.state
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_candidate() {
        let c = Candidate::new_host("192.168.1.5:50000".parse().unwrap(), 1, 65535);
        assert_eq!(c.priority, 2130706431);
        assert_eq!(c.typ, CandidateType::Host);
        assert!(c.related_addr.is_none());
    }

    #[test]
    fn test_reflexive_candidates_share_foundation_per_server() {
        let base = "192.168.1.5:50000".parse().unwrap();
        let server = "203.0.113.1:3478".parse().unwrap();
        let rtp = Candidate::new_server_reflexive("198.51.100.1:61000".parse().unwrap(), base, 1, 65535, server);
        let rtcp = Candidate::new_server_reflexive("198.51.100.1:61001".parse().unwrap(), base, 2, 65535, server);

        assert_eq!(rtp.foundation, rtcp.foundation);
        assert_eq!(rtp.related_addr, Some(base));
        assert!(rtp.priority > rtcp.priority);
    }

    #[test]
    fn test_peer_reflexive_priority() {
        let host = Candidate::new_host("192.168.1.5:50000".parse().unwrap(), 1, 65535);
        assert_eq!(host.peer_reflexive_priority(), (110 << 24) | (65535 << 8) | 255);
    }

    #[test]
    fn test_pair_priority_depends_on_role() {
        let local = Candidate::new_host("192.168.1.5:50000".parse().unwrap(), 1, 65535);
        let remote = Candidate::new_server_reflexive(
            "198.51.100.1:61000".parse().unwrap(),
            "10.0.0.2:5000".parse().unwrap(),
            1,
            65535,
            "203.0.113.1:3478".parse().unwrap(),
        );

        let controlling = CandidatePair::new(local.clone(), remote.clone(), true);
        let mut controlled = CandidatePair::new(local, remote, false);
        assert_eq!(controlling.priority, controlled.priority + 1);
        assert_eq!(controlling.state, CandidatePairState::Frozen);

        controlled.recompute_priority(true);
        assert_eq!(controlling.priority, controlled.priority);
    }
}
