//! SHARP ICE Library (lib.rs)
//!
//! NAT traversal engine: an ICE agent (RFC 8445) gathering host, server
//! reflexive and relay candidates through STUN (RFC 5389) and TURN
//! (RFC 5766), running connectivity checks and selecting a candidate pair
//! per component.

#![warn(clippy::all)]

// NAT traversal module
pub mod nat;

// Re-export main types
pub use nat::ice::{
    from_sdp, to_sdp, Candidate, CandidatePair, CandidatePairState, CandidateType, IceAgent, IceConfig,
    IceCredentials, IceEvent, IceEventCallback, IceMode, IceRole, IceState, NominationMode, StunServerConfig,
    TransportProtocol,
};
pub use nat::net::{DatagramSocket, MemoryNetwork, Platform, SocketFactory};
pub use nat::turn::TurnServerConfig;

// Re-export error types
pub use nat::error::{NatError, NatResult};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging system with custom configuration
///
/// `RUST_LOG` wins over `level` when set. Calling this twice is harmless:
/// the second subscriber is not installed.
///
/// # Example
/// ```
/// sharp_ice::init_logging("info");
/// ```
pub fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let mut filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // Reduce verbosity of some dependencies
    for directive in ["tokio=warn", "runtime=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(true),
        )
        .with(filter)
        .try_init();
}

/// Local network interfaces usable for host candidates, one per line
pub fn interface_summary() -> String {
    use nat::net::{InterfaceProvider, SystemInterfaces};

    let mut info = format!("SHARP ICE v{}\nUsable interfaces:", VERSION);
    match SystemInterfaces.interfaces() {
        Ok(interfaces) => {
            let usable: Vec<_> = interfaces.into_iter().filter(|i| i.is_usable_for_candidates()).collect();
            if usable.is_empty() {
                info.push_str("\n  none");
            }
            for iface in usable {
                let family = if iface.addr.is_ipv4() { "IPv4" } else { "IPv6" };
                info.push_str(&format!("\n  {} ({}): {}", iface.name, family, iface.addr));
            }
        }
        Err(e) => info.push_str(&format!("\n  enumeration failed: {}", e)),
    }
    info
}
