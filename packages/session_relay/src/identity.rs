//! Sender identity: resolving credentials into endpoint names, and filtering
//! received messages by expected sender.
//!
//! The relay never looks inside a credential. Whatever certificate or key
//! format the network layer carries is decoded by an [`IdentityResolver`].

use std::fmt;

use crate::error::RelayError;

/// Name of a network endpoint, e.g. `peer0.org1` or `peer0.org1:7051`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct EndpointName(String);

impl EndpointName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The name without any `:port` suffix.
    pub fn host(&self) -> &str {
        host_part(&self.0)
    }
}

impl fmt::Display for EndpointName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for EndpointName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EndpointName({})", self.0)
    }
}

impl From<&str> for EndpointName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

fn host_part(endpoint: &str) -> &str {
    endpoint.split(':').next().unwrap_or(endpoint)
}

/// Turns the raw credential attached to an inbound item into the sender's
/// endpoint name.
pub trait IdentityResolver: Send + Sync + 'static {
    fn resolve(&self, credential: &[u8]) -> Result<EndpointName, RelayError>;
}

/// Resolver for networks whose credential is the endpoint name itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainIdentityResolver;

impl IdentityResolver for PlainIdentityResolver {
    fn resolve(&self, credential: &[u8]) -> Result<EndpointName, RelayError> {
        let name = std::str::from_utf8(credential)
            .map_err(|e| RelayError::InvalidCredential(format!("not utf-8: {e}")))?
            .trim();
        if name.is_empty() {
            return Err(RelayError::InvalidCredential("empty identity".into()));
        }
        Ok(EndpointName::new(name))
    }
}

/// Which senders a receive is willing to accept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderFilter {
    Any,
    /// Only messages whose sender host matches this endpoint's host.
    Endpoint(String),
}

impl SenderFilter {
    /// Build from an optional source endpoint; blank means any sender.
    pub fn from_source(source: Option<&str>) -> Self {
        match source.map(str::trim) {
            Some(s) if !s.is_empty() => Self::Endpoint(s.to_string()),
            _ => Self::Any,
        }
    }

    pub fn accepts(&self, sender: &EndpointName) -> bool {
        match self {
            Self::Any => true,
            Self::Endpoint(expected) => host_part(expected) == sender.host(),
        }
    }

    /// Mismatch error for a rejected sender.
    pub fn mismatch(&self, sender: &EndpointName) -> RelayError {
        RelayError::SenderMismatch {
            expected: self.to_string(),
            actual: sender.to_string(),
        }
    }
}

impl fmt::Display for SenderFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("*"),
            Self::Endpoint(e) => f.write_str(e),
        }
    }
}
