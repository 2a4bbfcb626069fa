// src/nat/ice/foundation.rs
//! Foundation calculation for ICE candidates (RFC 8445 Section 5.1.1.3)
//!
//! Two candidates share a foundation when they have the same type, base IP
//! address, transport protocol and STUN/TURN server. Pairs whose local and
//! remote foundations both match are redundant for checking purposes.

use std::net::{IpAddr, SocketAddr};

use sha2::{Digest, Sha256};

use crate::nat::ice::candidate::{CandidateType, TransportProtocol};

/// Foundation length in characters
const FOUNDATION_LENGTH: usize = 8;

/// Calculate the foundation of a candidate
///
/// `server` is the STUN server (server reflexive) or TURN server (relay) the
/// candidate was learned from; it is ignored for host and peer reflexive types.
pub fn calculate_foundation(
    candidate_type: CandidateType,
    base_ip: &IpAddr,
    transport: TransportProtocol,
    server: Option<&SocketAddr>,
) -> String {
    let mut hasher = Sha256::new();

    hasher.update([candidate_type as u8, transport as u8]);
    hasher.update(base_ip.to_string().as_bytes());

    if let (CandidateType::ServerReflexive | CandidateType::Relay, Some(server)) = (candidate_type, server) {
        hasher.update(b"server:");
        hasher.update(server.to_string().as_bytes());
    }

    let digest = hasher.finalize();
    digest
        .iter()
        .take(FOUNDATION_LENGTH / 2)
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Foundation of a candidate pair: `local:remote`
pub fn calculate_pair_foundation(local: &str, remote: &str) -> String {
    format!("{}:{}", local, remote)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_properties_same_foundation() {
        let ip: IpAddr = "192.168.1.5".parse().unwrap();
        let a = calculate_foundation(CandidateType::Host, &ip, TransportProtocol::Udp, None);
        let b = calculate_foundation(CandidateType::Host, &ip, TransportProtocol::Udp, None);
        assert_eq!(a, b);
        assert_eq!(a.len(), FOUNDATION_LENGTH);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_distinguishing_properties() {
        let ip: IpAddr = "192.168.1.5".parse().unwrap();
        let other_ip: IpAddr = "192.168.1.6".parse().unwrap();
        let stun1: SocketAddr = "203.0.113.1:3478".parse().unwrap();
        let stun2: SocketAddr = "203.0.113.2:3478".parse().unwrap();

        let host = calculate_foundation(CandidateType::Host, &ip, TransportProtocol::Udp, None);
        assert_ne!(host, calculate_foundation(CandidateType::Host, &other_ip, TransportProtocol::Udp, None));
        assert_ne!(host, calculate_foundation(CandidateType::Host, &ip, TransportProtocol::Tcp, None));
        assert_ne!(
            calculate_foundation(CandidateType::ServerReflexive, &ip, TransportProtocol::Udp, Some(&stun1)),
            calculate_foundation(CandidateType::ServerReflexive, &ip, TransportProtocol::Udp, Some(&stun2))
        );
        // Host foundations ignore any server argument
        assert_eq!(host, calculate_foundation(CandidateType::Host, &ip, TransportProtocol::Udp, Some(&stun1)));
    }

    #[test]
    fn test_pair_foundation() {
        assert_eq!(calculate_pair_foundation("1a2b", "3c4d"), "1a2b:3c4d");
    }
}
