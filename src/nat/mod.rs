// src/nat/mod.rs
//! NAT traversal: STUN, TURN and ICE
//!
//! Sockets and interface enumeration are reached through the traits in
//! [`net`], so the whole stack can run over tokio UDP or over an in-process
//! [`net::MemoryNetwork`].

pub mod error;
pub mod net;
pub mod stun;
pub mod turn;
pub mod ice;

pub use error::{IoErrorContext, NatError, NatResult, StunError};

pub use net::{
    DatagramSocket, InterfaceProvider, LocalInterface, MemoryNetwork, Platform, SocketFactory,
    StaticInterfaces, SystemInterfaces, TokioSocketFactory,
};

pub use stun::{StunClient, StunConfig, DEFAULT_STUN_PORT};

pub use turn::{TurnClient, TurnServerConfig, DEFAULT_TURN_PORT};

pub use ice::{
    Candidate, CandidatePair, CandidatePairState, CandidateType, IceAgent, IceConfig, IceCredentials,
    IceEvent, IceEventCallback, IceMode, IceRole, IceState, NominationMode, StunServerConfig,
    TransportProtocol,
};
