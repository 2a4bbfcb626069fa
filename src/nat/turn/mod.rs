// src/nat/turn/mod.rs
//! TURN client (RFC 5766)
//!
//! Allocations with long-term credentials, refresh, permissions, channels,
//! and a [`RelayedSocket`] that lets relay candidates be used like any other
//! local socket.

pub mod client;

pub use client::{
    long_term_key, Allocation, RelayedSocket, TurnClient, TurnServerConfig,
    CHANNEL_MAX, CHANNEL_MIN, DEFAULT_TURN_PORT,
};
