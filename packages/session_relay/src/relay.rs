//! SessionRelay: rendezvous between asynchronous publishes and synchronous
//! receives, keyed by session token.
//!
//! Two independently guarded structures:
//! - the retention store, holding messages nobody was waiting for (TTL-bound)
//! - the waiter table, holding receives that arrived before their message
//!
//! A publish first tries a waiter, otherwise stores, then retries a waiter
//! once in case one registered in between. A receive registers its waiter
//! *before* draining the store, so a publish landing between the drain and
//! the wait is caught by one or the other.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::identity::{EndpointName, SenderFilter};
use crate::store::RetentionStore;
use crate::subscriptions::{Subscription, WaiterTable};
use crate::token::SessionToken;

/// A message waiting to be claimed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub payload: Vec<u8>,
    pub sender: EndpointName,
    pub arrived_at: Instant,
}

impl PendingMessage {
    pub fn new(payload: Vec<u8>, sender: EndpointName) -> Self {
        Self {
            payload,
            sender,
            arrived_at: Instant::now(),
        }
    }
}

/// Where a published message ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Stored,
}

pub struct SessionRelay {
    store: RetentionStore<PendingMessage>,
    waiters: WaiterTable<PendingMessage>,
}

impl SessionRelay {
    pub fn new(config: &RelayConfig) -> Self {
        Self::with_ttl(config.retention_ttl)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            store: RetentionStore::new(ttl),
            waiters: WaiterTable::new(),
        }
    }

    /// Register a single-fire waiter on `token`.
    pub fn subscribe(
        &self,
        token: SessionToken,
        deadline: Option<Instant>,
    ) -> Subscription<PendingMessage> {
        self.waiters.subscribe(token, deadline)
    }

    /// Deliver to a waiting receive, or retain for one that has yet to come.
    pub fn publish_or_store(&self, token: &SessionToken, msg: PendingMessage) -> Delivery {
        let msg = match self.waiters.deliver(token, msg) {
            Ok(()) => return Delivery::Delivered,
            Err(msg) => msg,
        };

        let arrived_at = msg.arrived_at;
        let bytes = msg.payload.len();
        let id = self.store.insert_at(token.clone(), msg, arrived_at);
        debug!(session = %token, bytes, "no waiter, message stored");

        // A waiter may have registered between the failed delivery and the insert.
        if self.waiters.has_waiter(token) {
            return self.redeliver_stored(token, id);
        }
        Delivery::Stored
    }

    /// Move stored entry `id` to a waiter. If the waiter is gone by then, the
    /// message goes back with its original arrival time.
    fn redeliver_stored(&self, token: &SessionToken, id: u64) -> Delivery {
        let Some((msg, arrived_at)) = self.store.take_by_id(token, id) else {
            // Already claimed by a receive draining the store.
            return Delivery::Stored;
        };
        match self.waiters.deliver(token, msg) {
            Ok(()) => {
                debug!(session = %token, "stored message handed to late waiter");
                Delivery::Delivered
            }
            Err(msg) => {
                self.store.insert_at(token.clone(), msg, arrived_at);
                Delivery::Stored
            }
        }
    }

    /// Claim the next message on `token` from a sender `filter` accepts.
    ///
    /// Stored messages are checked first. Stored messages from other senders
    /// stay in place for their intended receiver; a live delivery from
    /// another sender is discarded and the wait continues. `None` timeout
    /// waits indefinitely.
    pub async fn receive(
        &self,
        token: &SessionToken,
        timeout: Option<Duration>,
        filter: &SenderFilter,
    ) -> Result<PendingMessage, RelayError> {
        let started = Instant::now();
        // A timeout too large to represent waits indefinitely.
        let deadline = timeout.and_then(|t| started.checked_add(t));

        loop {
            let sub = self.waiters.subscribe(token.clone(), deadline);

            if let Some(msg) = self.store.take_first(token, |m| filter.accepts(&m.sender)) {
                if let Some(raced) = sub.cancel() {
                    self.publish_or_store(token, raced);
                }
                info!(session = %token, sender = %msg.sender, bytes = msg.payload.len(), "received stored message");
                return Ok(msg);
            }
            if self.store.count(token) > 0 {
                debug!(session = %token, expected = %filter, "stored messages from other senders left in place");
            }

            match sub.recv().await {
                Ok(msg) if filter.accepts(&msg.sender) => {
                    info!(session = %token, sender = %msg.sender, bytes = msg.payload.len(), "received message");
                    return Ok(msg);
                }
                Ok(msg) => {
                    let err = filter.mismatch(&msg.sender);
                    warn!(session = %token, error = %err, "discarding message, still waiting");
                }
                Err(RelayError::Timeout { .. }) => {
                    return Err(RelayError::Timeout {
                        session: token.to_hex(),
                        waited: started.elapsed(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Messages currently retained (expired-but-unpurged included).
    pub fn pending_count(&self) -> usize {
        self.store.len()
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }
}

impl Default for SessionRelay {
    fn default() -> Self {
        Self::new(&RelayConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn msg(payload: &[u8], sender: &str) -> PendingMessage {
        PendingMessage::new(payload.to_vec(), EndpointName::from(sender))
    }

    fn token(s: &str) -> SessionToken {
        SessionToken::from(s)
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_token_times_out_no_earlier_than_deadline() {
        let relay = SessionRelay::default();
        let start = Instant::now();
        let err = relay
            .receive(&token("never"), Some(Duration::from_millis(300)), &SenderFilter::Any)
            .await
            .unwrap_err();
        let waited = start.elapsed();
        assert!(matches!(err, RelayError::Timeout { .. }));
        assert!(waited >= Duration::from_millis(300));
        assert!(waited < Duration::from_millis(350));
        assert_eq!(relay.waiter_count(), 0);
    }

    #[tokio::test]
    async fn publish_then_receive_exactly_once() {
        let relay = SessionRelay::default();
        assert_eq!(relay.publish_or_store(&token("t"), msg(b"m", "x")), Delivery::Stored);

        let got = relay
            .receive(&token("t"), Some(Duration::from_millis(50)), &SenderFilter::Any)
            .await
            .unwrap();
        assert_eq!(got.payload, b"m");

        let again = relay
            .receive(&token("t"), Some(Duration::from_millis(50)), &SenderFilter::Any)
            .await;
        assert!(matches!(again, Err(RelayError::Timeout { .. })));
    }

    #[tokio::test]
    async fn receive_then_publish() {
        let relay = Arc::new(SessionRelay::default());
        let r = relay.clone();
        let waiting = tokio::spawn(async move {
            r.receive(&token("t"), Some(Duration::from_secs(5)), &SenderFilter::Any)
                .await
        });

        while relay.waiter_count() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            relay.publish_or_store(&token("t"), msg(b"late", "x")),
            Delivery::Delivered
        );
        assert_eq!(waiting.await.unwrap().unwrap().payload, b"late");
        assert_eq!(relay.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stored_message_from_wrong_sender_is_never_returned() {
        let relay = SessionRelay::default();
        relay.publish_or_store(&token("t"), msg(b"from-x", "x"));

        let filter = SenderFilter::Endpoint("y:7051".into());
        let result = relay
            .receive(&token("t"), Some(Duration::from_millis(100)), &filter)
            .await;
        assert!(matches!(result, Err(RelayError::Timeout { .. })));

        // Left in place for the right receiver.
        let got = relay
            .receive(&token("t"), Some(Duration::from_millis(100)), &SenderFilter::Endpoint("x".into()))
            .await
            .unwrap();
        assert_eq!(got.payload, b"from-x");
    }

    #[tokio::test]
    async fn live_mismatch_keeps_waiting_for_right_sender() {
        let relay = Arc::new(SessionRelay::default());
        let r = relay.clone();
        let waiting = tokio::spawn(async move {
            r.receive(
                &token("t"),
                Some(Duration::from_secs(5)),
                &SenderFilter::Endpoint("y".into()),
            )
            .await
        });

        while relay.waiter_count() == 0 {
            tokio::task::yield_now().await;
        }
        relay.publish_or_store(&token("t"), msg(b"wrong", "x"));
        while relay.waiter_count() == 0 {
            tokio::task::yield_now().await;
        }
        relay.publish_or_store(&token("t"), msg(b"right", "y"));

        assert_eq!(waiting.await.unwrap().unwrap().payload, b"right");
    }

    #[tokio::test(start_paused = true)]
    async fn stored_message_unreachable_after_ttl() {
        let relay = SessionRelay::with_ttl(Duration::from_secs(10));
        relay.publish_or_store(&token("t"), msg(b"m", "x"));

        tokio::time::advance(Duration::from_secs(10)).await;
        let result = relay
            .receive(&token("t"), Some(Duration::from_millis(10)), &SenderFilter::Any)
            .await;
        assert!(matches!(result, Err(RelayError::Timeout { .. })));
        assert_eq!(relay.pending_count(), 0);
    }

    #[tokio::test]
    async fn tokens_do_not_cross() {
        let relay = SessionRelay::default();
        relay.publish_or_store(&token("a"), msg(b"for-a", "x"));
        let result = relay
            .receive(&token("b"), Some(Duration::from_millis(20)), &SenderFilter::Any)
            .await;
        assert!(result.is_err());
        assert_eq!(relay.pending_count(), 1);
    }

    #[tokio::test]
    async fn one_delivery_satisfies_one_of_two_racing_receives() {
        let relay = Arc::new(SessionRelay::default());
        let mut handles = Vec::new();
        for _ in 0..2 {
            let r = relay.clone();
            handles.push(tokio::spawn(async move {
                r.receive(&token("t"), Some(Duration::from_millis(200)), &SenderFilter::Any)
                    .await
            }));
        }
        while relay.waiter_count() < 2 {
            tokio::task::yield_now().await;
        }
        relay.publish_or_store(&token("t"), msg(b"only", "x"));

        let mut ok = 0;
        for h in handles {
            if h.await.unwrap().is_ok() {
                ok += 1;
            }
        }
        assert_eq!(ok, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn publish_racing_a_deadline_is_returned_or_stored() {
        for i in 0..500u64 {
            let relay = Arc::new(SessionRelay::default());
            let r = relay.clone();
            let waiting = tokio::spawn(async move {
                r.receive(&token("race"), Some(Duration::from_micros(1500)), &SenderFilter::Any)
                    .await
            });

            tokio::time::sleep(Duration::from_micros(1000 + (i % 10) * 100)).await;
            let outcome = relay.publish_or_store(&token("race"), msg(b"m", "x"));

            match waiting.await.unwrap() {
                Ok(got) => {
                    assert_eq!(got.payload, b"m");
                    assert_eq!(relay.pending_count(), 0, "iteration {i}");
                }
                Err(RelayError::Timeout { .. }) => {
                    assert_eq!(outcome, Delivery::Stored, "iteration {i}");
                    assert_eq!(relay.pending_count(), 1, "iteration {i}");
                }
                Err(e) => panic!("iteration {i}: {e}"),
            }
        }
    }

    #[tokio::test]
    async fn stored_message_is_handed_to_waiter_that_registered_late() {
        let relay = SessionRelay::default();
        let m = msg(b"m", "x");
        let id = relay.store.insert_at(token("t"), m.clone(), m.arrived_at);
        let sub = relay.subscribe(token("t"), None);

        assert_eq!(relay.redeliver_stored(&token("t"), id), Delivery::Delivered);
        assert_eq!(relay.pending_count(), 0);
        assert_eq!(sub.recv().await.unwrap().payload, b"m");
    }

    #[tokio::test(start_paused = true)]
    async fn vanished_waiter_restores_with_original_arrival() {
        let relay = SessionRelay::with_ttl(Duration::from_secs(10));
        let m = msg(b"m", "x");
        let id = relay.store.insert_at(token("t"), m.clone(), m.arrived_at);

        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(relay.redeliver_stored(&token("t"), id), Delivery::Stored);
        assert_eq!(relay.store.count(&token("t")), 1);

        // Expires 10s after arrival, not 10s after the re-store.
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(relay.store.count(&token("t")), 0);
    }

    #[tokio::test]
    async fn unrepresentable_timeout_waits_without_deadline() {
        let relay = Arc::new(SessionRelay::default());
        let r = relay.clone();
        let waiting = tokio::spawn(async move {
            r.receive(&token("t"), Some(Duration::MAX), &SenderFilter::Any)
                .await
        });
        while relay.waiter_count() == 0 {
            tokio::task::yield_now().await;
        }
        relay.publish_or_store(&token("t"), msg(b"m", "x"));
        assert_eq!(waiting.await.unwrap().unwrap().payload, b"m");
    }
}
