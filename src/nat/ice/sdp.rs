// src/nat/ice/sdp.rs
//! Candidate attribute lines (RFC 8839 Section 5.1)
//!
//! `candidate:<foundation> <component> <transport> <priority> <address> <port> typ <type> [raddr <addr> rport <port>]`

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use super::candidate::{Candidate, CandidateType, TransportProtocol};
use crate::nat::error::{NatError, NatResult};

const PREFIX: &str = "candidate:";

/// Longest foundation RFC 8839 allows
const MAX_FOUNDATION_LENGTH: usize = 32;

/// Render a candidate as an attribute line (without the `a=` prefix)
pub fn to_sdp(candidate: &Candidate) -> String {
    let mut line = format!(
        "{}{} {} {} {} {} {} typ {}",
        PREFIX,
        candidate.foundation,
        candidate.component_id,
        candidate.transport.to_str(),
        candidate.priority,
        candidate.addr.ip(),
        candidate.addr.port(),
        candidate.typ.to_str(),
    );

    if let Some(related) = &candidate.related_addr {
        line.push_str(&format!(" raddr {} rport {}", related.ip(), related.port()));
    }

    line
}

/// Parse an attribute line; a leading `a=` is accepted
pub fn from_sdp(line: &str) -> NatResult<Candidate> {
    let line = line.trim();
    let line = line.strip_prefix("a=").unwrap_or(line);
    let body = line
        .strip_prefix(PREFIX)
        .ok_or_else(|| parse_error(format!("missing '{}' prefix", PREFIX)))?;

    let mut tokens = body.split_whitespace();
    let mut next = |what: &str| tokens.next().ok_or_else(|| parse_error(format!("missing {}", what)));

    let foundation = next("foundation")?.to_string();
    if foundation.len() > MAX_FOUNDATION_LENGTH
        || !foundation.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/')
    {
        return Err(parse_error(format!("invalid foundation '{}'", foundation)));
    }

    let component_id: u32 = parse_token(next("component id")?, "component id")?;
    if !(1..=256).contains(&component_id) {
        return Err(parse_error(format!("component id {} out of range", component_id)));
    }

    let transport = match next("transport")?.to_ascii_uppercase().as_str() {
        "UDP" => TransportProtocol::Udp,
        "TCP" => TransportProtocol::Tcp,
        other => return Err(parse_error(format!("unknown transport '{}'", other))),
    };

    let priority: u32 = parse_token(next("priority")?, "priority")?;
    let ip: IpAddr = parse_token(next("address")?, "address")?;
    let port: u16 = parse_token(next("port")?, "port")?;

    if next("typ")? != "typ" {
        return Err(parse_error("expected 'typ'".to_string()));
    }
    let type_token = next("candidate type")?;
    let typ = CandidateType::from_token(type_token)
        .ok_or_else(|| parse_error(format!("unknown candidate type '{}'", type_token)))?;

    // Extension attributes come in name/value pairs
    let mut raddr: Option<IpAddr> = None;
    let mut rport: Option<u16> = None;
    while let Some(name) = tokens.next() {
        let value = tokens
            .next()
            .ok_or_else(|| parse_error(format!("'{}' has no value", name)))?;
        match name {
            "raddr" => raddr = Some(parse_token(value, "raddr")?),
            "rport" => rport = Some(parse_token(value, "rport")?),
            _ => {}
        }
    }

    let related_addr = match (raddr, rport) {
        (Some(ip), Some(port)) => Some(SocketAddr::new(ip, port)),
        (None, None) => None,
        _ => return Err(parse_error("raddr and rport must appear together".to_string())),
    };

    Ok(Candidate {
        foundation,
        component_id,
        transport,
        priority,
        addr: SocketAddr::new(ip, port),
        typ,
        related_addr,
    })
}

impl FromStr for Candidate {
    type Err = NatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        from_sdp(s)
    }
}

fn parse_token<T: FromStr>(token: &str, what: &str) -> NatResult<T> {
    token
        .parse()
        .map_err(|_| parse_error(format!("invalid {} '{}'", what, token)))
}

fn parse_error(reason: String) -> NatError {
    NatError::Sdp(reason)
}
