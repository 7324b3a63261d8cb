//! A handshake-established session with per-direction sub-session tokens.
//!
//! Every write is sent on `session ‖ write_seq` and every read waits on
//! `session ‖ read_seq` (8-byte little-endian). Both ends must agree on the
//! relative order of their reads and writes; nothing here reconciles them.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::config::ConnectionConfig;
use crate::error::RelayError;
use crate::handshake::{self, HandshakeState, Role};
use crate::stream_reader::{MessageSource, StreamReader};
use crate::token::SessionToken;

/// Send/receive primitives a connection is written against.
pub trait SessionTransport: Send + Sync {
    fn send_message(
        &self,
        payload: &[u8],
        token: &SessionToken,
        target: &str,
    ) -> impl Future<Output = Result<(), RelayError>> + Send;

    /// `None` timeout waits indefinitely.
    fn receive_message(
        &self,
        token: &SessionToken,
        timeout: Option<Duration>,
        source: &str,
    ) -> impl Future<Output = Result<Vec<u8>, RelayError>> + Send;
}

impl<T: SessionTransport> SessionTransport for Arc<T> {
    fn send_message(
        &self,
        payload: &[u8],
        token: &SessionToken,
        target: &str,
    ) -> impl Future<Output = Result<(), RelayError>> + Send {
        (**self).send_message(payload, token, target)
    }

    fn receive_message(
        &self,
        token: &SessionToken,
        timeout: Option<Duration>,
        source: &str,
    ) -> impl Future<Output = Result<Vec<u8>, RelayError>> + Send {
        (**self).receive_message(token, timeout, source)
    }
}

pub struct Connection<T> {
    transport: T,
    session: SessionToken,
    peer: String,
    role: Role,
    state: HandshakeState,
    write_seq: u64,
    read_seq: u64,
    config: ConnectionConfig,
}

impl<T: SessionTransport> Connection<T> {
    /// Run the opening exchange and return an established connection.
    pub async fn open(
        transport: T,
        session: SessionToken,
        peer: impl Into<String>,
        role: Role,
        config: ConnectionConfig,
    ) -> Result<Self, RelayError> {
        let peer = peer.into();
        handshake::establish(&transport, &session, &peer, role, &config).await?;
        Ok(Self {
            transport,
            session,
            peer,
            role,
            state: HandshakeState::Established,
            write_seq: 0,
            read_seq: 0,
            config,
        })
    }

    /// Skip the opening exchange. Both ends must do the same.
    pub fn without_handshake(
        transport: T,
        session: SessionToken,
        peer: impl Into<String>,
        role: Role,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            transport,
            session,
            peer: peer.into(),
            role,
            state: HandshakeState::Established,
            write_seq: 0,
            read_seq: 0,
            config,
        }
    }

    pub fn session(&self) -> &SessionToken {
        &self.session
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn write_seq(&self) -> u64 {
        self.write_seq
    }

    pub fn read_seq(&self) -> u64 {
        self.read_seq
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Receive timeout for subsequent reads.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.config.steady_timeout = timeout;
    }

    /// Send `payload` as the next message in the write direction.
    ///
    /// The counter advances only on success, so a failed write may be
    /// retried on the same sub-token.
    pub async fn write(&mut self, payload: &[u8]) -> Result<usize, RelayError> {
        let token = self.session.with_counter(self.write_seq);
        self.transport
            .send_message(payload, &token, &self.peer)
            .await?;
        trace!(session = %self.session, seq = self.write_seq, bytes = payload.len(), "wrote");
        self.write_seq += 1;
        Ok(payload.len())
    }

    /// Wait for the next whole message in the read direction.
    pub async fn read_message(&mut self) -> Result<Vec<u8>, RelayError> {
        let token = self.session.with_counter(self.read_seq);
        let msg = self
            .transport
            .receive_message(&token, Some(self.config.steady_timeout), &self.peer)
            .await?;
        trace!(session = %self.session, seq = self.read_seq, bytes = msg.len(), "read");
        self.read_seq += 1;
        Ok(msg)
    }

    /// Writes are sent whole; nothing is buffered.
    pub async fn flush(&mut self) -> Result<(), RelayError> {
        Ok(())
    }

    /// Byte-level reads over this connection. Writes stay reachable via
    /// [`StreamReader::get_mut`].
    pub fn into_stream(self) -> StreamReader<Self> {
        debug!(session = %self.session, peer = %self.peer, "wrapping connection as stream");
        StreamReader::new(self)
    }
}

impl<T: SessionTransport> MessageSource for Connection<T> {
    type Error = RelayError;

    async fn next_message(&mut self) -> Result<Option<Vec<u8>>, RelayError> {
        self.read_message().await.map(Some)
    }
}

impl<T> std::fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("session", &self.session)
            .field("peer", &self.peer)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("write_seq", &self.write_seq)
            .field("read_seq", &self.read_seq)
            .finish()
    }
}
