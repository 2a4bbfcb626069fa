// src/nat/stun/mod.rs
//! STUN (Session Traversal Utilities for NAT)
//!
//! - [`protocol`]: the binary message codec shared by STUN, TURN and ICE checks
//! - [`transaction`]: transaction-id matching, retransmission, inbound demux
//! - [`client`]: Binding requests for server-reflexive discovery

pub mod protocol;
pub mod transaction;
pub mod client;

pub use protocol::{
    Attribute, AttributeType, Message, MessageClass, MessageType, TransactionId,
    HEADER_SIZE, MAGIC_COOKIE, MAX_MESSAGE_SIZE,
    is_stun, is_channel_data, encode_channel_data, decode_channel_data,
};

pub use transaction::{
    Inbound, InboundKind, RetryPolicy, StunResponse, StunTransaction, TransactionTable,
    spawn_receiver, transact, transact_with_server,
};

pub use client::{resolve_server, StunClient, StunConfig, DEFAULT_STUN_PORT};
