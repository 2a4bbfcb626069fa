// src/nat/ice/mod.rs
//! ICE (Interactive Connectivity Establishment, RFC 8445)
//!
//! - [`candidate`], [`priority`], [`foundation`]: the candidate data model
//! - [`sdp`]: `candidate:` attribute lines
//! - [`gathering`]: host, server reflexive and relay candidates
//! - [`check_list`]: pair formation, pruning, ordering and freezing
//! - [`connectivity`]: check requests, responses and role conflicts
//! - [`agent`]: the state machine tying it all together
//!
//! Only UDP is supported. TCP candidates parse but are rejected by the agent.

use crate::nat::error::{NatError, NatResult};

pub mod candidate;
pub mod foundation;
pub mod priority;
pub mod sdp;
pub mod gathering;
pub mod check_list;
pub mod connectivity;
pub mod agent;

// Re-export main types for convenience
pub use agent::{
    IceAgent, IceConfig, IceEvent, IceEventCallback, IceMode, IceRole, IceState,
    NominationMode, StunServerConfig, MAX_STUN_SERVERS, MAX_TURN_SERVERS,
};

pub use candidate::{Candidate, CandidatePair, CandidatePairState, CandidateType, TransportProtocol};

pub use check_list::{CheckList, PairKey};

pub use connectivity::{IceCredentials, PWD_LENGTH, UFRAG_LENGTH};

pub use priority::{calculate_pair_priority, calculate_priority, local_preference_for_index};

pub use foundation::{calculate_foundation, calculate_pair_foundation};

pub use sdp::{from_sdp, to_sdp};

/// Supported ICE specifications
pub const SUPPORTED_SPECS: &[&str] = &[
    "RFC 8445 - Interactive Connectivity Establishment (ICE)",
    "RFC 5389 - Session Traversal Utilities for NAT (STUN)",
    "RFC 5766 - Traversal Using Relays around NAT (TURN)",
    "RFC 5245 - candidate attribute syntax",
];

/// Validate ICE configuration
pub fn validate_ice_config(config: &IceConfig) -> NatResult<()> {
    if config.components == 0 || config.components > 2 {
        return Err(NatError::InvalidParam(format!(
            "components must be 1 or 2, got {}",
            config.components
        )));
    }

    if config.stun_servers.len() > MAX_STUN_SERVERS {
        return Err(NatError::InvalidParam(format!(
            "at most {} STUN servers, got {}",
            MAX_STUN_SERVERS,
            config.stun_servers.len()
        )));
    }
    if config.turn_servers.len() > MAX_TURN_SERVERS {
        return Err(NatError::InvalidParam(format!(
            "at most {} TURN servers, got {}",
            MAX_TURN_SERVERS,
            config.turn_servers.len()
        )));
    }

    if config.stun_servers.iter().any(|s| s.server.is_empty()) || config.turn_servers.iter().any(|s| s.server.is_empty())
    {
        return Err(NatError::InvalidParam("server host must not be empty".to_string()));
    }
    if config.turn_servers.iter().any(|s| s.use_tls) {
        return Err(NatError::NotSupported("TLS transport to TURN servers".to_string()));
    }

    let timeouts = [
        ("stun_timeout_ms", config.stun_timeout_ms),
        ("check_timeout_ms", config.check_timeout_ms),
        ("connectivity_check_timeout_ms", config.connectivity_check_timeout_ms),
        ("nomination_timeout_ms", config.nomination_timeout_ms),
        ("check_pacing_ms", config.check_pacing_ms),
    ];
    if let Some((name, _)) = timeouts.iter().find(|(_, value)| *value == 0) {
        return Err(NatError::InvalidParam(format!("{} must be positive", name)));
    }

    if config.max_concurrent_checks == 0 {
        return Err(NatError::InvalidParam("max_concurrent_checks must be positive".to_string()));
    }

    Ok(())
}
