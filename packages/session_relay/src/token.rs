//! Session tokens and per-direction sub-tokens.
//!
//! A sub-token is the base token followed by an 8-byte little-endian counter:
//!
//! ```text
//! [base token bytes ...][u64 counter, LE]
//! ```

use std::fmt;

/// Width of the counter suffix appended by [`SessionToken::with_counter`].
pub const COUNTER_WIDTH: usize = 8;

/// Opaque byte string correlating a publish with its receiver.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionToken(Vec<u8>);

impl SessionToken {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// A fresh transaction-style identifier (time-ordered UUID, text form).
    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7().to_string().into_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Derive the token used by one individual read or write.
    pub fn with_counter(&self, counter: u64) -> SessionToken {
        let mut bytes = Vec::with_capacity(self.0.len() + COUNTER_WIDTH);
        bytes.extend_from_slice(&self.0);
        bytes.extend_from_slice(&counter.to_le_bytes());
        SessionToken(bytes)
    }

    /// Split a sub-token back into base and counter. Returns `None` when the
    /// token is too short to carry a counter.
    pub fn split_counter(&self) -> Option<(SessionToken, u64)> {
        let cut = self.0.len().checked_sub(COUNTER_WIDTH)?;
        let mut counter = [0u8; COUNTER_WIDTH];
        counter.copy_from_slice(&self.0[cut..]);
        Some((
            SessionToken(self.0[..cut].to_vec()),
            u64::from_le_bytes(counter),
        ))
    }

    /// Lowercase hex of the raw bytes, used in logs and error messages.
    pub fn to_hex(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0)
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionToken({})", self.to_hex())
    }
}

impl From<&str> for SessionToken {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for SessionToken {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for SessionToken {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}
