//! Versioned JSON envelope for messages crossing the peer network.
//!
//! Envelope: `{ "v": 1, "type": "...", "data": {...} }`
//!
//! Byte fields inside `data` are URL-safe base64 without padding.

use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// Current envelope version.
pub const ENVELOPE_VERSION: u32 = 1;

/// Maximum encoded envelope size (16 MiB). Larger envelopes are rejected.
pub const MAX_ENVELOPE_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    v: u32,
    /// Message type tag (matches the serde `type` field of the payload).
    #[serde(rename = "type")]
    msg_type: String,
    data: serde_json::Value,
}

/// Everything the peer network carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GossipMessage {
    /// Private payload addressed to a session.
    SessionData {
        #[serde(with = "base64_bytes")]
        session: Vec<u8>,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    /// Liveness traffic; never relevant to sessions.
    Heartbeat { seq: u64 },
}

/// Tag of a [`GossipMessage`], used by accept predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    SessionData,
    Heartbeat,
}

impl GossipMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::SessionData { .. } => MessageKind::SessionData,
            Self::Heartbeat { .. } => MessageKind::Heartbeat,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Self::SessionData { .. } => "SessionData",
            Self::Heartbeat { .. } => "Heartbeat",
        }
    }
}

/// Serialize a message into envelope bytes.
pub fn encode(msg: &GossipMessage) -> Result<Vec<u8>, RelayError> {
    let envelope = Envelope {
        v: ENVELOPE_VERSION,
        msg_type: msg.type_name().to_string(),
        data: serde_json::to_value(msg)?,
    };
    let bytes = serde_json::to_vec(&envelope)?;
    if bytes.len() > MAX_ENVELOPE_SIZE {
        return Err(RelayError::Encoding(format!(
            "message too large: {} bytes (max {})",
            bytes.len(),
            MAX_ENVELOPE_SIZE
        )));
    }
    Ok(bytes)
}

/// Parse envelope bytes.
///
/// Returns `Ok(None)` for envelopes from a newer protocol version or with a
/// message type this build does not know; those are skipped, not errors.
pub fn decode(bytes: &[u8]) -> Result<Option<GossipMessage>, RelayError> {
    if bytes.len() > MAX_ENVELOPE_SIZE {
        return Err(RelayError::Encoding(format!(
            "message too large: {} bytes (max {})",
            bytes.len(),
            MAX_ENVELOPE_SIZE
        )));
    }

    let envelope: Envelope = serde_json::from_slice(bytes)?;

    // Forward compatibility: ignore unknown versions
    if envelope.v != ENVELOPE_VERSION {
        tracing::warn!(version = envelope.v, "unknown envelope version, skipping");
        return Ok(None);
    }

    match serde_json::from_value::<GossipMessage>(envelope.data) {
        Ok(msg) => Ok(Some(msg)),
        Err(e) => {
            tracing::warn!(
                msg_type = %envelope.msg_type,
                error = %e,
                "unknown or malformed gossip message, skipping"
            );
            Ok(None)
        }
    }
}

mod base64_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&data_encoding::BASE64URL_NOPAD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        data_encoding::BASE64URL_NOPAD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
