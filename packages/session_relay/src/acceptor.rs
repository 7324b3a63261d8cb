//! Intake from the peer network into the relay.
//!
//! One loop per node drains inbound items. Session-data items are
//! acknowledged right away, before any receiver has consumed them, so the
//! sender's ack wait never depends on the receiving invocation's timing.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::identity::IdentityResolver;
use crate::network::{InboundItem, PeerNetwork};
use crate::relay::{Delivery, PendingMessage, SessionRelay};
use crate::token::SessionToken;
use crate::wire::{GossipMessage, MessageKind};

/// Accept predicate for this protocol's traffic.
pub fn is_session_data(msg: &GossipMessage) -> bool {
    msg.kind() == MessageKind::SessionData
}

pub struct InboundAcceptor {
    relay: Arc<SessionRelay>,
    resolver: Arc<dyn IdentityResolver>,
}

impl InboundAcceptor {
    pub fn new(relay: Arc<SessionRelay>, resolver: Arc<dyn IdentityResolver>) -> Self {
        Self { relay, resolver }
    }

    /// Process one inbound item. Returns `None` when the item was ignored.
    ///
    /// Items of any other kind are left untouched (not even acknowledged).
    pub fn handle(&self, mut item: InboundItem) -> Option<Delivery> {
        if !is_session_data(item.message()) {
            return None;
        }
        item.ack();

        let (message, connection) = item.into_parts();
        let GossipMessage::SessionData { session, data } = message else {
            return None;
        };

        let sender = match self.resolver.resolve(&connection.identity) {
            Ok(sender) => sender,
            Err(e) => {
                warn!(endpoint = %connection.endpoint, error = %e, "dropping message with unresolvable sender");
                return None;
            }
        };

        let token = SessionToken::new(session);
        debug!(
            session = %token,
            sender = %sender,
            bytes = data.len(),
            "session message arrived"
        );
        Some(
            self.relay
                .publish_or_store(&token, PendingMessage::new(data, sender)),
        )
    }

    /// Drain the network's session-data stream until cancelled or closed.
    ///
    /// Flips `ready` to `true` once the accept stream is registered.
    pub async fn run<N: PeerNetwork>(
        self,
        network: Arc<N>,
        buffer: usize,
        ready: watch::Sender<bool>,
        cancel: CancellationToken,
    ) -> Result<(), RelayError> {
        network.ready().await;
        let mut inbound = network.accept(is_session_data, buffer)?;
        let _ = ready.send(true);
        info!(endpoint = network.local_endpoint(), "intake loop started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(endpoint = network.local_endpoint(), "intake loop cancelled");
                    break;
                }
                item = inbound.recv() => match item {
                    Some(item) => {
                        self.handle(item);
                    }
                    None => {
                        warn!(endpoint = network.local_endpoint(), "inbound stream closed");
                        break;
                    }
                },
            }
        }
        Ok(())
    }
}
