//! Shared value types: volume-name normalization and network endpoints.

use std::fmt;
use std::str::FromStr;

use sha2::{Digest, Sha256};
use thiserror::Error;

/// The array rejects object labels longer than this.
pub const MAX_VOLUME_NAME_LEN: usize = 30;

/// Default iSCSI data port.
pub const ISCSI_PORT: u16 = 3260;

const FINGERPRINT_LEN: usize = 8;

/// Fit a requested volume name into the array's label limit.
///
/// Names that fit pass through unchanged. Longer names become
/// `<prefix>_<fingerprint>` where the fingerprint is the first 8 hex chars of
/// the SHA-256 of the full name, so the result is deterministic and distinct
/// names keep distinct labels even when their prefixes collide. The prefix is
/// cut on a char boundary, so multi-byte names only shorten the prefix.
pub fn normalize_volume_name(name: &str) -> String {
    if name.len() <= MAX_VOLUME_NAME_LEN {
        return name.to_string();
    }
    let digest = Sha256::digest(name.as_bytes());
    let mut fingerprint = String::with_capacity(FINGERPRINT_LEN);
    for byte in digest.iter().take(FINGERPRINT_LEN / 2) {
        fingerprint.push_str(&format!("{byte:02x}"));
    }
    let mut cut = MAX_VOLUME_NAME_LEN - 1 - FINGERPRINT_LEN;
    while !name.is_char_boundary(cut) {
        cut -= 1;
    }
    let prefix = &name[..cut];
    format!("{prefix}_{fingerprint}")
}

/// A network endpoint as `host:port`, with IPv6 hosts bracketed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EndpointParseError {
    #[error("empty endpoint")]
    Empty,
    #[error("invalid port in endpoint: {0}")]
    InvalidPort(String),
    #[error("unclosed bracket in endpoint: {0}")]
    UnclosedBracket(String),
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host`, `host:port`, `[v6]` or `[v6]:port`, defaulting the port
    /// when absent.
    pub fn parse(s: &str, default_port: u16) -> Result<Self, EndpointParseError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(EndpointParseError::Empty);
        }

        if let Some(rest) = s.strip_prefix('[') {
            let Some((host, after)) = rest.split_once(']') else {
                return Err(EndpointParseError::UnclosedBracket(s.to_string()));
            };
            let port = match after.strip_prefix(':') {
                Some(p) => p
                    .parse()
                    .map_err(|_| EndpointParseError::InvalidPort(s.to_string()))?,
                None => default_port,
            };
            return Ok(Self::new(host, port));
        }

        // A bare address with more than one colon is IPv6 without a port.
        if s.matches(':').count() > 1 {
            return Ok(Self::new(s, default_port));
        }

        match s.split_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| EndpointParseError::InvalidPort(s.to_string()))?;
                Ok(Self::new(host, port))
            }
            None => Ok(Self::new(s, default_port)),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s, ISCSI_PORT)
    }
}
