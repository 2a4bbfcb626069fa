// src/nat/error.rs
//! Error types shared by the STUN, TURN and ICE layers

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by NAT traversal operations
#[derive(Debug, Error)]
pub enum NatError {
    /// Bad caller input (malformed address, out-of-range value)
    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// No response within the retry budget
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Malformed or unexpected wire message
    #[error("STUN error: {0}")]
    Stun(#[from] StunError),

    /// Socket-level failure
    #[error("Network I/O error: {0}")]
    Io(#[from] io::Error),

    /// Candidate line could not be parsed
    #[error("SDP parse error: {0}")]
    Sdp(String),

    /// TURN server rejected our credentials
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Resource exhaustion
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Optional feature that is not implemented
    #[error("Not supported: {0}")]
    NotSupported(String),
}

impl NatError {
    /// Whether this error came from the wire protocol layer
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Self::Stun(_))
    }
}

/// STUN-specific errors following RFC 5389 / RFC 8489
#[derive(Debug, Error)]
pub enum StunError {
    /// Invalid magic cookie
    #[error("Invalid magic cookie: expected 0x2112A442, got 0x{0:08X}")]
    InvalidMagicCookie(u32),

    /// Message parsing error
    #[error("Failed to parse STUN message: {0}")]
    ParseError(String),

    /// Attribute parsing error
    #[error("Failed to parse attribute 0x{attr_type:04X}: {reason}")]
    AttributeParseError { attr_type: u16, reason: String },

    /// Missing required attribute
    #[error("Missing required attribute: {0}")]
    MissingAttribute(&'static str),

    /// MESSAGE-INTEGRITY did not verify
    #[error("MESSAGE-INTEGRITY check failed")]
    IntegrityCheckFailed,

    /// FINGERPRINT did not verify
    #[error("FINGERPRINT check failed")]
    FingerprintCheckFailed,

    /// STUN error response
    #[error("STUN error response: {code} - {reason}")]
    ErrorResponse { code: u16, reason: String },

    /// Response came back with an unexpected message type
    #[error("Unexpected STUN message type 0x{0:04X}")]
    UnexpectedMessage(u16),

    /// Invalid address family
    #[error("Invalid address family: {0}")]
    InvalidAddressFamily(u8),

    /// Unknown comprehension-required attributes
    #[error("Unknown comprehension-required attributes: {0:?}")]
    UnknownComprehensionRequired(Vec<u16>),
}

/// Result type for NAT operations
pub type NatResult<T> = Result<T, NatError>;

/// Convert I/O errors to NAT errors with context
pub trait IoErrorContext<T> {
    /// Attach `context` to an I/O failure
    fn nat_context(self, context: &str) -> NatResult<T>;
}

impl<T> IoErrorContext<T> for io::Result<T> {
    fn nat_context(self, context: &str) -> NatResult<T> {
        self.map_err(|e| NatError::Io(io::Error::new(e.kind(), format!("{}: {}", context, e))))
    }
}
