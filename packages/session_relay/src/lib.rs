//! Private, off-ledger payload exchange between two independently executing
//! invocations, built on a best-effort one-shot peer send primitive.
//!
//! Layers, leaves first:
//! - `stream_reader`: byte stream over a "next whole message" source
//! - `store` / `subscriptions` / `relay`: rendezvous of publishes and receives
//! - `acceptor`: intake loop from the peer network into the relay
//! - `handshake` / `connection`: Active/Passive open and per-direction sub-tokens
//! - `facade`: SEND / RECEIVE verbs

pub mod acceptor;
pub mod config;
pub mod connection;
pub mod error;
pub mod facade;
pub mod handshake;
pub mod identity;
pub mod network;
pub mod relay;
pub mod store;
pub mod stream_reader;
pub mod subscriptions;
pub mod token;
pub mod wire;

pub use config::{ConnectionConfig, RelayConfig};
pub use connection::{Connection, SessionTransport};
pub use error::RelayError;
pub use facade::{CommService, Response, Status};
pub use handshake::Role;
pub use identity::{EndpointName, IdentityResolver, PlainIdentityResolver, SenderFilter};
pub use network::{MemoryNetwork, MemoryPeer, PeerNetwork};
pub use relay::{PendingMessage, SessionRelay};
pub use stream_reader::{MessageSource, StreamReader};
pub use token::SessionToken;
