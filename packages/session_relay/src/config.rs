//! Runtime configuration for the relay and for connections built on it.

use std::time::Duration;

use crate::store::DEFAULT_TTL;

/// Relay and send-path tunables.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayConfig {
    /// How long an unclaimed message is retained.
    pub retention_ttl: Duration,
    /// How long SEND waits for peer acknowledgments.
    pub ack_timeout: Duration,
    pub max_peers: usize,
    pub min_ack: usize,
    /// Inbound items buffered between the network and the intake loop.
    pub intake_buffer: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            retention_ttl: DEFAULT_TTL,
            ack_timeout: Duration::from_secs(3),
            max_peers: 1,
            min_ack: 1,
            intake_buffer: 1024,
        }
    }
}

/// Handshake and steady-state timing for a `Connection`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Receive timeout between Active probes.
    pub probe_interval: Duration,
    /// Receive timeout once the connection is established.
    pub steady_timeout: Duration,
    /// Upper bound on the whole opening exchange (`None` = wait forever).
    pub open_timeout: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_millis(50),
            steady_timeout: Duration::from_secs(240),
            open_timeout: Some(Duration::from_secs(240)),
        }
    }
}
