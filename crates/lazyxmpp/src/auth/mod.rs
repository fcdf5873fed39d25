//! SASL mechanism handling.
//!
//! Only PLAIN and ANONYMOUS are supported. PLAIN payload parsing is strict
//! about the RFC 4616 framing: the payload must decode to
//! `authzid NUL authcid NUL password` with an empty authzid, a non-empty
//! authcid, and nothing left over.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use thiserror::Error;

/// Supported SASL mechanisms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    /// RFC 4616 PLAIN
    Plain,
    /// RFC 4505 ANONYMOUS
    Anonymous,
}

impl Mechanism {
    /// Parse a mechanism name as it appears in the `mechanism` attribute.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "PLAIN" => Some(Mechanism::Plain),
            "ANONYMOUS" => Some(Mechanism::Anonymous),
            _ => None,
        }
    }
}

/// Credentials extracted from a well-formed PLAIN payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainCredentials {
    /// The authentication id (node part of the JID)
    pub node: String,
    /// The plaintext password
    pub password: String,
}

/// Structural failures of a PLAIN payload. Each of these maps to a SASL
/// `malformed-request` failure on the wire.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlainError {
    /// The payload was not valid base64
    #[error("invalid base64 payload")]
    BadBase64,
    /// The payload was empty or did not start with a NUL authzid separator
    #[error("missing leading NUL separator")]
    MissingLeadingNul,
    /// No NUL separator between authcid and password
    #[error("missing NUL separator after authcid")]
    MissingSeparator,
    /// The authcid was empty
    #[error("empty authcid")]
    EmptyNode,
    /// The credential parts were not valid UTF-8
    #[error("credentials are not valid UTF-8")]
    BadUtf8,
}

/// Decode and validate a base64 PLAIN payload.
pub fn parse_plain(data: &str) -> Result<PlainCredentials, PlainError> {
    let decoded = BASE64_STANDARD
        .decode(data.trim())
        .map_err(|_| PlainError::BadBase64)?;

    // The authzid must be empty, so the payload starts with a NUL.
    if decoded.first() != Some(&0) {
        return Err(PlainError::MissingLeadingNul);
    }

    let rest = &decoded[1..];
    let sep = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or(PlainError::MissingSeparator)?;
    if sep == 0 {
        return Err(PlainError::EmptyNode);
    }

    let node = std::str::from_utf8(&rest[..sep]).map_err(|_| PlainError::BadUtf8)?;
    let password = std::str::from_utf8(&rest[sep + 1..]).map_err(|_| PlainError::BadUtf8)?;

    Ok(PlainCredentials {
        node: node.to_string(),
        password: password.to_string(),
    })
}
