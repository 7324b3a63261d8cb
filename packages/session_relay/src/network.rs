//! The peer network collaborator: what the relay needs from the transport
//! below it, plus an in-process implementation.
//!
//! The real network owns discovery, transport and acknowledgment. The relay
//! only needs three things from it:
//! - `accept`: a buffered stream of inbound items matching a predicate
//! - `send_to_peer`: one-shot delivery to eligible members, waiting for acks
//! - `ready`: resolves once the network can be used
//!
//! [`MemoryNetwork`] wires any number of [`MemoryPeer`]s together in one
//! process, carrying real envelope bytes between them.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::RelayError;
use crate::wire::{self, GossipMessage};

/// Pure function over an inbound message, deciding whether a subscriber wants it.
pub type AcceptPredicate = fn(&GossipMessage) -> bool;

/// Outcome reported back to the sender for one delivered item.
pub type AckResult = Result<(), String>;

/// A member of the network as seen by eligibility checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkMember {
    pub endpoint: String,
}

impl NetworkMember {
    pub fn preferred_endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// How widely to send, and what counts as success.
#[derive(Clone)]
pub struct SendCriteria {
    pub max_peers: usize,
    pub min_ack: usize,
    pub timeout: Duration,
    pub is_eligible: Arc<dyn Fn(&NetworkMember) -> bool + Send + Sync>,
}

impl SendCriteria {
    /// Exactly one peer, the one whose preferred endpoint is `endpoint`.
    pub fn to_endpoint(endpoint: &str, max_peers: usize, min_ack: usize, timeout: Duration) -> Self {
        let endpoint = endpoint.to_string();
        Self {
            max_peers,
            min_ack,
            timeout,
            is_eligible: Arc::new(move |member| member.preferred_endpoint() == endpoint),
        }
    }
}

impl std::fmt::Debug for SendCriteria {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendCriteria")
            .field("max_peers", &self.max_peers)
            .field("min_ack", &self.min_ack)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Who an inbound item came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub endpoint: String,
    /// Raw credential; decoded by an `IdentityResolver`, never by the relay.
    pub identity: Vec<u8>,
}

/// One message received from the network, acknowledgeable once.
#[derive(Debug)]
pub struct InboundItem {
    message: GossipMessage,
    connection: ConnectionInfo,
    ack: Option<oneshot::Sender<AckResult>>,
}

impl InboundItem {
    /// Build an item and the receiver its sender waits on for the ack.
    pub fn new(
        message: GossipMessage,
        connection: ConnectionInfo,
    ) -> (Self, oneshot::Receiver<AckResult>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                message,
                connection,
                ack: Some(tx),
            },
            rx,
        )
    }

    pub fn message(&self) -> &GossipMessage {
        &self.message
    }

    pub fn connection(&self) -> &ConnectionInfo {
        &self.connection
    }

    /// Acknowledge receipt to the sender. Later calls are no-ops.
    pub fn ack(&mut self) {
        if let Some(tx) = self.ack.take() {
            let _ = tx.send(Ok(()));
        }
    }

    /// Reject the item. Later calls are no-ops.
    pub fn nack(&mut self, reason: impl Into<String>) {
        if let Some(tx) = self.ack.take() {
            let _ = tx.send(Err(reason.into()));
        }
    }

    pub fn is_acked(&self) -> bool {
        self.ack.is_none()
    }

    pub fn into_parts(self) -> (GossipMessage, ConnectionInfo) {
        (self.message, self.connection)
    }
}

/// Contract the relay requires from the peer network.
pub trait PeerNetwork: Send + Sync + 'static {
    /// This node's own endpoint name.
    fn local_endpoint(&self) -> &str;

    /// Resolves once the network can accept and send.
    fn ready(&self) -> impl Future<Output = ()> + Send;

    /// Subscribe to inbound items matching `predicate`, buffering up to
    /// `buffer` undelivered items.
    fn accept(
        &self,
        predicate: AcceptPredicate,
        buffer: usize,
    ) -> Result<mpsc::Receiver<InboundItem>, RelayError>;

    /// Send to eligible peers; fails unless `min_ack` acknowledgments arrive
    /// within `criteria.timeout`. No retry.
    fn send_to_peer(
        &self,
        message: &GossipMessage,
        criteria: SendCriteria,
    ) -> impl Future<Output = Result<(), RelayError>> + Send;
}

struct Subscriber {
    predicate: AcceptPredicate,
    tx: mpsc::Sender<InboundItem>,
}

struct PeerSlot {
    identity: Vec<u8>,
    reachable: bool,
    subscribers: Vec<Subscriber>,
}

/// In-process network hub connecting [`MemoryPeer`]s.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    peers: Arc<Mutex<HashMap<String, PeerSlot>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join with the endpoint's host name as credential.
    pub fn join(&self, endpoint: &str) -> MemoryPeer {
        let host = endpoint.split(':').next().unwrap_or(endpoint);
        self.join_with_identity(endpoint, host.as_bytes().to_vec())
    }

    pub fn join_with_identity(&self, endpoint: &str, identity: Vec<u8>) -> MemoryPeer {
        let mut peers = self.lock();
        peers.insert(
            endpoint.to_string(),
            PeerSlot {
                identity,
                reachable: true,
                subscribers: Vec::new(),
            },
        );
        debug!(endpoint, "peer joined memory network");
        MemoryPeer {
            network: self.clone(),
            endpoint: endpoint.to_string(),
        }
    }

    /// Unreachable peers silently swallow everything sent to them.
    pub fn set_reachable(&self, endpoint: &str, reachable: bool) {
        if let Some(slot) = self.lock().get_mut(endpoint) {
            slot.reachable = reachable;
        }
    }

    pub fn members(&self) -> Vec<NetworkMember> {
        let mut members: Vec<NetworkMember> = self
            .lock()
            .keys()
            .map(|endpoint| NetworkMember {
                endpoint: endpoint.clone(),
            })
            .collect();
        members.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        members
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PeerSlot>> {
        // A poisoned map only means another thread panicked mid-update; the
        // map itself is still structurally valid.
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(&self, endpoint: &str, subscriber: Subscriber) -> Result<(), RelayError> {
        let mut peers = self.lock();
        let slot = peers
            .get_mut(endpoint)
            .ok_or_else(|| RelayError::Closed(format!("{endpoint} left the network")))?;
        slot.subscribers.push(subscriber);
        Ok(())
    }

    /// Hand envelope bytes to `to`. Returns the ack receiver when some
    /// subscriber took the item.
    fn deliver(&self, from: &str, to: &str, bytes: &[u8]) -> Option<oneshot::Receiver<AckResult>> {
        let message = match wire::decode(bytes) {
            Ok(Some(message)) => message,
            Ok(None) => return None,
            Err(e) => {
                warn!(to, error = %e, "dropping undecodable envelope");
                return None;
            }
        };

        let mut peers = self.lock();
        let identity = peers.get(from)?.identity.clone();
        let slot = peers.get_mut(to)?;
        if !slot.reachable {
            debug!(from, to, "peer unreachable, dropping");
            return None;
        }

        slot.subscribers.retain(|s| !s.tx.is_closed());
        let subscriber = slot.subscribers.iter().find(|s| (s.predicate)(&message))?;
        let (item, ack_rx) = InboundItem::new(
            message,
            ConnectionInfo {
                endpoint: from.to_string(),
                identity,
            },
        );
        match subscriber.tx.try_send(item) {
            Ok(()) => Some(ack_rx),
            Err(e) => {
                warn!(to, error = %e, "inbound buffer full or closed, dropping");
                None
            }
        }
    }
}

/// One node's handle on a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryPeer {
    network: MemoryNetwork,
    endpoint: String,
}

impl MemoryPeer {
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

impl PeerNetwork for MemoryPeer {
    fn local_endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn ready(&self) {}

    fn accept(
        &self,
        predicate: AcceptPredicate,
        buffer: usize,
    ) -> Result<mpsc::Receiver<InboundItem>, RelayError> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        self.network
            .register(&self.endpoint, Subscriber { predicate, tx })?;
        Ok(rx)
    }

    async fn send_to_peer(
        &self,
        message: &GossipMessage,
        criteria: SendCriteria,
    ) -> Result<(), RelayError> {
        let bytes = wire::encode(message)?;

        let targets: Vec<String> = self
            .network
            .members()
            .into_iter()
            .filter(|m| m.endpoint != self.endpoint && (criteria.is_eligible)(m))
            .take(criteria.max_peers)
            .map(|m| m.endpoint)
            .collect();

        if targets.is_empty() {
            return Err(RelayError::NetworkSend {
                endpoint: "<none>".into(),
                reason: "no eligible peers".into(),
            });
        }

        let pending: Vec<_> = targets
            .iter()
            .filter_map(|to| self.network.deliver(&self.endpoint, to, &bytes))
            .collect();

        // Unrepresentable timeouts wait on acks without a deadline.
        let deadline = tokio::time::Instant::now().checked_add(criteria.timeout);
        let mut acked = 0;
        for rx in pending {
            if acked >= criteria.min_ack {
                break;
            }
            let outcome = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, rx).await,
                None => Ok(rx.await),
            };
            match outcome {
                Ok(Ok(Ok(()))) => acked += 1,
                Ok(Ok(Err(reason))) => debug!(%reason, "peer rejected message"),
                Ok(Err(_)) => debug!("peer dropped message without ack"),
                Err(_) => break,
            }
        }

        if acked < criteria.min_ack {
            return Err(RelayError::NetworkSend {
                endpoint: targets.join(","),
                reason: format!(
                    "received {acked} of {} required acks within {:?}",
                    criteria.min_ack, criteria.timeout
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_only(msg: &GossipMessage) -> bool {
        matches!(msg, GossipMessage::SessionData { .. })
    }

    fn data(session: &[u8], payload: &[u8]) -> GossipMessage {
        GossipMessage::SessionData {
            session: session.to_vec(),
            data: payload.to_vec(),
        }
    }

    #[tokio::test]
    async fn delivers_and_waits_for_ack() {
        let net = MemoryNetwork::new();
        let a = net.join("a:1");
        let b = net.join("b:1");
        let mut inbox = b.accept(session_only, 8).unwrap();

        let acker = tokio::spawn(async move {
            let mut item = inbox.recv().await.unwrap();
            assert_eq!(item.connection().endpoint, "a:1");
            assert_eq!(item.connection().identity, b"a");
            item.ack();
            item.into_parts().0
        });

        a.send_to_peer(
            &data(b"s", b"hi"),
            SendCriteria::to_endpoint("b:1", 1, 1, Duration::from_secs(1)),
        )
        .await
        .unwrap();
        assert_eq!(acker.await.unwrap(), data(b"s", b"hi"));
    }

    #[tokio::test]
    async fn unbounded_ack_timeout_still_completes() {
        let net = MemoryNetwork::new();
        let a = net.join("a");
        let b = net.join("b");
        let mut inbox = b.accept(session_only, 8).unwrap();
        tokio::spawn(async move { inbox.recv().await.unwrap().ack() });

        a.send_to_peer(
            &data(b"s", b"x"),
            SendCriteria::to_endpoint("b", 1, 1, Duration::MAX),
        )
        .await
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_send_fails_after_timeout() {
        let net = MemoryNetwork::new();
        let a = net.join("a");
        let b = net.join("b");
        // Held but never acked.
        let _inbox = b.accept(session_only, 8).unwrap();

        let err = a
            .send_to_peer(
                &data(b"s", b"x"),
                SendCriteria::to_endpoint("b", 1, 1, Duration::from_secs(3)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "network_send_failure");
    }

    #[tokio::test]
    async fn unreachable_peer_fails_send() {
        let net = MemoryNetwork::new();
        let a = net.join("a");
        let b = net.join("b");
        let _inbox = b.accept(session_only, 8).unwrap();
        net.set_reachable("b", false);

        let result = a
            .send_to_peer(
                &data(b"s", b"x"),
                SendCriteria::to_endpoint("b", 1, 1, Duration::from_millis(50)),
            )
            .await;
        assert!(matches!(result, Err(RelayError::NetworkSend { .. })));
    }

    #[tokio::test]
    async fn no_eligible_peer() {
        let net = MemoryNetwork::new();
        let a = net.join("a");
        let result = a
            .send_to_peer(
                &data(b"s", b"x"),
                SendCriteria::to_endpoint("nobody", 1, 1, Duration::from_millis(50)),
            )
            .await;
        assert!(matches!(result, Err(RelayError::NetworkSend { .. })));
    }

    #[tokio::test]
    async fn predicate_filters_items() {
        let net = MemoryNetwork::new();
        let a = net.join("a");
        let b = net.join("b");
        let mut inbox = b.accept(session_only, 8).unwrap();

        let result = a
            .send_to_peer(
                &GossipMessage::Heartbeat { seq: 1 },
                SendCriteria::to_endpoint("b", 1, 1, Duration::from_millis(50)),
            )
            .await;
        assert!(result.is_err());
        assert!(inbox.try_recv().is_err());
    }

    #[test]
    fn ack_is_single_use() {
        let (mut item, mut rx) = InboundItem::new(
            GossipMessage::Heartbeat { seq: 0 },
            ConnectionInfo {
                endpoint: "x".into(),
                identity: vec![],
            },
        );
        assert!(!item.is_acked());
        item.ack();
        item.nack("late");
        assert!(item.is_acked());
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
    }
}
