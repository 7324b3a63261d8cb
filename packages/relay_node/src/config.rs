use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use session_relay::{ConnectionConfig, RelayConfig};

// =============================================================================
// File config (figment-deserialized from defaults / relay.toml / env vars)
// =============================================================================
//
//   relay.toml:      [connection]
//                    probe_interval_ms = 200
//
//   env var:         RELAY_CONNECTION__PROBE_INTERVAL_MS=200   (double underscore = nesting)

/// Named timing presets.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    /// probe=50ms, ack timeout=3s
    Lan,
    /// probe=200ms, ack timeout=10s
    Wan,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub profile: Option<Profile>,
    #[serde(default)]
    pub relay: RelayFileConfig,
    #[serde(default)]
    pub connection: ConnectionFileConfig,
}

/// Relay and send tunables (lives under `[relay]` in relay.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayFileConfig {
    #[serde(default = "default_retention_ttl_secs")]
    pub retention_ttl_secs: u64,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_one")]
    pub max_peers: usize,
    #[serde(default = "default_one")]
    pub min_ack: usize,
    #[serde(default = "default_intake_buffer")]
    pub intake_buffer: usize,
}

impl Default for RelayFileConfig {
    fn default() -> Self {
        Self {
            retention_ttl_secs: default_retention_ttl_secs(),
            ack_timeout_ms: default_ack_timeout_ms(),
            max_peers: default_one(),
            min_ack: default_one(),
            intake_buffer: default_intake_buffer(),
        }
    }
}

/// Connection timing (lives under `[connection]` in relay.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionFileConfig {
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    #[serde(default = "default_steady_timeout_secs")]
    pub steady_timeout_secs: u64,
    /// 0 = no bound on the opening exchange.
    #[serde(default = "default_open_timeout_secs")]
    pub open_timeout_secs: u64,
}

impl Default for ConnectionFileConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: default_probe_interval_ms(),
            steady_timeout_secs: default_steady_timeout_secs(),
            open_timeout_secs: default_open_timeout_secs(),
        }
    }
}

fn default_retention_ttl_secs() -> u64 {
    10
}
fn default_ack_timeout_ms() -> u64 {
    3000
}
fn default_one() -> usize {
    1
}
fn default_intake_buffer() -> usize {
    1024
}
fn default_probe_interval_ms() -> u64 {
    50
}
fn default_steady_timeout_secs() -> u64 {
    240
}
fn default_open_timeout_secs() -> u64 {
    240
}

/// Build a figment that layers: defaults → profile defaults → relay.toml → RELAY_* env vars.
///
/// The CLI profile takes priority over a profile named in the file.
pub fn load_config(config_dir: &Path, cli_profile: Option<&Profile>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    // Pass 1: peek at the profile
    let base = Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_dir.join("relay.toml")))
        .merge(Env::prefixed("RELAY_").split("__"));

    let profile: Option<Profile> = cli_profile
        .cloned()
        .or_else(|| base.extract_inner("profile").ok());

    // Pass 2: profile defaults between struct defaults and the file
    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Serialized::defaults(profile_to_file_config(profile.as_ref())))
        .merge(Toml::file(config_dir.join("relay.toml")))
        .merge(Env::prefixed("RELAY_").split("__"))
}

fn profile_to_file_config(profile: Option<&Profile>) -> FileConfig {
    match profile {
        Some(Profile::Lan) => FileConfig {
            profile: Some(Profile::Lan),
            ..Default::default()
        },
        Some(Profile::Wan) => FileConfig {
            profile: Some(Profile::Wan),
            relay: RelayFileConfig {
                ack_timeout_ms: 10_000,
                ..Default::default()
            },
            connection: ConnectionFileConfig {
                probe_interval_ms: 200,
                ..Default::default()
            },
        },
        None => FileConfig::default(),
    }
}

impl RelayFileConfig {
    pub fn to_relay_config(&self) -> RelayConfig {
        RelayConfig {
            retention_ttl: Duration::from_secs(self.retention_ttl_secs),
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            max_peers: self.max_peers,
            min_ack: self.min_ack,
            intake_buffer: self.intake_buffer,
        }
    }
}

impl ConnectionFileConfig {
    pub fn to_connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            probe_interval: Duration::from_millis(self.probe_interval_ms),
            steady_timeout: Duration::from_secs(self.steady_timeout_secs),
            open_timeout: (self.open_timeout_secs > 0)
                .then(|| Duration::from_secs(self.open_timeout_secs)),
        }
    }
}
