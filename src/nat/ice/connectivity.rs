// src/nat/ice/connectivity.rs
//! ICE connectivity check messages (RFC 8445 Section 7)
//!
//! Building and validating the Binding requests/responses exchanged on
//! candidate pairs. Sending, retransmission and pair state live in the agent;
//! everything here is a pure function of its inputs.

use std::net::SocketAddr;

use bytes::Bytes;
use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::agent::IceRole;
use crate::nat::error::{NatError, NatResult};
use crate::nat::stun::{Attribute, AttributeType, Message, MessageClass, MessageType, StunResponse, TransactionId};

/// Characters allowed in ufrag/pwd (RFC 8839 `ice-char`)
const ICE_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// Generated username fragment length
pub const UFRAG_LENGTH: usize = 8;

/// Generated password length
pub const PWD_LENGTH: usize = 24;

const MIN_UFRAG_LENGTH: usize = 4;
const MIN_PWD_LENGTH: usize = 22;
const MAX_CREDENTIAL_LENGTH: usize = 256;

/// ICE short-term credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCredentials {
    /// Username fragment
    pub ufrag: String,
    /// Password
    pub pwd: String,
}

impl IceCredentials {
    /// Validate credentials received from the peer
    pub fn new(ufrag: impl Into<String>, pwd: impl Into<String>) -> NatResult<Self> {
        let ufrag = ufrag.into();
        let pwd = pwd.into();

        validate_ice_chars("ufrag", &ufrag, MIN_UFRAG_LENGTH)?;
        validate_ice_chars("pwd", &pwd, MIN_PWD_LENGTH)?;

        Ok(Self { ufrag, pwd })
    }

    /// Generate fresh random credentials from the OS random source
    pub fn generate() -> Self {
        Self {
            ufrag: random_ice_string(UFRAG_LENGTH),
            pwd: random_ice_string(PWD_LENGTH),
        }
    }
}

fn random_ice_string(len: usize) -> String {
    let mut rng = OsRng;
    (0..len)
        .map(|_| ICE_CHARS[rng.gen_range(0..ICE_CHARS.len())] as char)
        .collect()
}

fn validate_ice_chars(what: &str, value: &str, min_len: usize) -> NatResult<()> {
    if value.len() < min_len || value.len() > MAX_CREDENTIAL_LENGTH {
        return Err(NatError::InvalidParam(format!(
            "{} must be {}..={} characters, got {}",
            what,
            min_len,
            MAX_CREDENTIAL_LENGTH,
            value.len()
        )));
    }
    if !value.bytes().all(|b| ICE_CHARS.contains(&b)) {
        return Err(NatError::InvalidParam(format!("{} contains characters outside [A-Za-z0-9+/]", what)));
    }
    Ok(())
}

/// Build a connectivity check request
///
/// USERNAME is `remote_ufrag:local_ufrag` and MESSAGE-INTEGRITY is keyed
/// with the remote password.
#[allow(clippy::too_many_arguments)]
pub fn build_check_request(
    local: &IceCredentials,
    remote: &IceCredentials,
    priority: u32,
    role: IceRole,
    tie_breaker: u64,
    use_candidate: bool,
    software: Option<&str>,
) -> NatResult<(Message, Bytes)> {
    let mut request = Message::new(MessageType::BindingRequest, TransactionId::new())
        .with_attribute(Attribute::Username(format!("{}:{}", remote.ufrag, local.ufrag)))
        .with_attribute(Attribute::Priority(priority));

    request.add_attribute(match role {
        IceRole::Controlling => Attribute::IceControlling(tie_breaker),
        IceRole::Controlled => Attribute::IceControlled(tie_breaker),
    });
    if use_candidate {
        request.add_attribute(Attribute::UseCandidate);
    }
    if let Some(software) = software {
        request.add_attribute(Attribute::Software(software.to_string()));
    }

    let encoded = request.encode(Some(remote.pwd.as_bytes()), true)?;
    Ok((request, encoded))
}

/// Result of one connectivity check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Authenticated success; `mapped` is our address as the peer saw it
    Succeeded { mapped: SocketAddr },
    /// 487 Role Conflict from the peer
    RoleConflict,
    /// Any other failure
    Failed(String),
}

/// Evaluate the response to a check sent to `remote`
pub fn evaluate_check_response(response: &StunResponse, remote: SocketAddr, remote_pwd: &str) -> CheckOutcome {
    // Responses must come back from where the request went (RFC 8445 Section 7.2.5.2.1)
    if response.from != remote {
        return CheckOutcome::Failed(format!("non-symmetric response from {}", response.from));
    }

    let message = &response.message;
    match message.message_type.class() {
        MessageClass::SuccessResponse => {}
        MessageClass::ErrorResponse => {
            return match message.error_code() {
                Some((487, _)) => CheckOutcome::RoleConflict,
                Some((code, reason)) => CheckOutcome::Failed(format!("error {} {}", code, reason)),
                None => CheckOutcome::Failed("error response without ERROR-CODE".to_string()),
            };
        }
        _ => return CheckOutcome::Failed(format!("unexpected {:?}", message.message_type)),
    }

    if !message.unknown_attributes.is_empty() {
        return CheckOutcome::Failed(format!("unknown attributes {:04X?}", message.unknown_attributes));
    }
    if let Err(e) = message.verify_integrity(remote_pwd.as_bytes(), &response.raw) {
        return CheckOutcome::Failed(format!("integrity: {}", e));
    }
    if message.has_attribute(AttributeType::Fingerprint) {
        if let Err(e) = message.verify_fingerprint(&response.raw) {
            return CheckOutcome::Failed(format!("fingerprint: {}", e));
        }
    }

    match message.mapped_address() {
        Some(mapped) => CheckOutcome::Succeeded { mapped },
        None => CheckOutcome::Failed("response without XOR-MAPPED-ADDRESS".to_string()),
    }
}

/// An authenticated incoming check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCheck {
    /// Peer's ufrag (second half of USERNAME)
    pub remote_ufrag: String,
    /// PRIORITY attribute (priority of a peer reflexive candidate for the source)
    pub priority: u32,
    pub use_candidate: bool,
    /// Role the sender claims, with its tie-breaker
    pub remote_role: (IceRole, u64),
}

/// Why an incoming check is not accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckRejection {
    /// Drop without answering
    Discard(String),
    /// Answer with an error response
    Error { code: u16, reason: &'static str, unknown: Vec<u16> },
}

impl CheckRejection {
    fn error(code: u16, reason: &'static str) -> Self {
        Self::Error { code, reason, unknown: Vec::new() }
    }
}

/// Authenticate an incoming Binding request against our credentials
pub fn validate_check_request(
    request: &Message,
    raw: &[u8],
    local: &IceCredentials,
) -> Result<IncomingCheck, CheckRejection> {
    if request.has_attribute(AttributeType::Fingerprint) && request.verify_fingerprint(raw).is_err() {
        return Err(CheckRejection::Discard("bad FINGERPRINT".to_string()));
    }

    if !request.unknown_attributes.is_empty() {
        return Err(CheckRejection::Error {
            code: 420,
            reason: "Unknown Attribute",
            unknown: request.unknown_attributes.clone(),
        });
    }

    let username = request.username().ok_or_else(|| CheckRejection::error(400, "Bad Request"))?;
    if !request.has_attribute(AttributeType::MessageIntegrity) {
        return Err(CheckRejection::error(400, "Bad Request"));
    }

    let remote_ufrag = match username.split_once(':') {
        Some((ours, theirs)) if ours == local.ufrag => theirs.to_string(),
        _ => return Err(CheckRejection::error(401, "Unauthorized")),
    };

    if request.verify_integrity(local.pwd.as_bytes(), raw).is_err() {
        return Err(CheckRejection::error(401, "Unauthorized"));
    }

    let mut priority = None;
    let mut use_candidate = false;
    let mut remote_role = None;
    for attr in &request.attributes {
        match attr {
            Attribute::Priority(p) => priority = Some(*p),
            Attribute::UseCandidate => use_candidate = true,
            Attribute::IceControlling(tb) => remote_role = Some((IceRole::Controlling, *tb)),
            Attribute::IceControlled(tb) => remote_role = Some((IceRole::Controlled, *tb)),
            _ => {}
        }
    }

    Ok(IncomingCheck {
        remote_ufrag,
        priority: priority.ok_or_else(|| CheckRejection::error(400, "Bad Request"))?,
        use_candidate,
        remote_role: remote_role.ok_or_else(|| CheckRejection::error(400, "Bad Request"))?,
    })
}

/// Outcome of comparing roles on an incoming check (RFC 8445 Section 7.3.1.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleResolution {
    /// Roles are complementary
    Keep,
    /// We lost the tie-break and must take the other role
    Switch,
    /// We won the tie-break; answer 487
    Reject,
}

/// Apply the tie-breaker rule to a check claiming `remote_role`
pub fn resolve_role_conflict(our_role: IceRole, our_tie_breaker: u64, remote_role: (IceRole, u64)) -> RoleResolution {
    let (their_role, their_tie_breaker) = remote_role;
    if their_role != our_role {
        return RoleResolution::Keep;
    }

    let we_win = our_tie_breaker >= their_tie_breaker;
    match (our_role, we_win) {
        (IceRole::Controlling, true) => RoleResolution::Reject,
        (IceRole::Controlling, false) => RoleResolution::Switch,
        (IceRole::Controlled, true) => RoleResolution::Switch,
        (IceRole::Controlled, false) => RoleResolution::Reject,
    }
}

/// Success response for an accepted check, reflecting the source address
pub fn build_success_response(
    request: &Message,
    source: SocketAddr,
    local_pwd: &str,
    software: Option<&str>,
) -> NatResult<Bytes> {
    let mut response = Message::response_to(request, MessageClass::SuccessResponse)?
        .with_attribute(Attribute::XorMappedAddress(source));
    if let Some(software) = software {
        response.add_attribute(Attribute::Software(software.to_string()));
    }
    response.encode(Some(local_pwd.as_bytes()), true)
}

/// Error response; `integrity_key` is set only once the request authenticated
pub fn build_error_response(
    request: &Message,
    code: u16,
    reason: &str,
    unknown: &[u16],
    integrity_key: Option<&[u8]>,
) -> NatResult<Bytes> {
    let mut response = Message::response_to(request, MessageClass::ErrorResponse)?.with_attribute(Attribute::ErrorCode {
        code,
        reason: reason.to_string(),
    });
    if !unknown.is_empty() {
        response.add_attribute(Attribute::UnknownAttributes(unknown.to_vec()));
    }
    response.encode(integrity_key, true)
}
