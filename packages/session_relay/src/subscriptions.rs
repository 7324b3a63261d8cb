//! Single-fire waiters keyed by session token.
//!
//! A [`Subscription`] receives at most one message. Delivery removes it from
//! the table, as does a lapsed deadline or dropping it, so a later unrelated
//! publish never lands on a waiter nobody is reading.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::error::RelayError;
use crate::token::SessionToken;

struct Waiter<M> {
    id: u64,
    tx: oneshot::Sender<M>,
}

type Waiters<M> = HashMap<SessionToken, VecDeque<Waiter<M>>>;

/// Outstanding subscriptions, oldest first per token.
pub struct WaiterTable<M> {
    waiters: Arc<Mutex<Waiters<M>>>,
    next_id: AtomicU64,
}

impl<M> Default for WaiterTable<M> {
    fn default() -> Self {
        Self {
            waiters: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<M> WaiterTable<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter on `token`. `None` deadline waits indefinitely.
    pub fn subscribe(&self, token: SessionToken, deadline: Option<Instant>) -> Subscription<M> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.waiters)
            .entry(token.clone())
            .or_default()
            .push_back(Waiter { id, tx });
        Subscription {
            token,
            id,
            started: Instant::now(),
            deadline,
            rx,
            table: Arc::downgrade(&self.waiters),
        }
    }

    /// Hand `msg` to the oldest live waiter on `token`. Gives the message
    /// back when nobody is waiting.
    pub fn deliver(&self, token: &SessionToken, mut msg: M) -> Result<(), M> {
        let mut waiters = lock(&self.waiters);
        let Some(queue) = waiters.get_mut(token) else {
            return Err(msg);
        };
        while let Some(waiter) = queue.pop_front() {
            match waiter.tx.send(msg) {
                Ok(()) => {
                    debug!(session = %token, waiter = waiter.id, "delivered to waiter");
                    if queue.is_empty() {
                        waiters.remove(token);
                    }
                    return Ok(());
                }
                // Receiver already gone; try the next one.
                Err(back) => msg = back,
            }
        }
        waiters.remove(token);
        Err(msg)
    }

    pub fn has_waiter(&self, token: &SessionToken) -> bool {
        lock(&self.waiters)
            .get(token)
            .is_some_and(|q| q.iter().any(|w| !w.tx.is_closed()))
    }

    /// Total registered waiters across all tokens.
    pub fn len(&self) -> usize {
        lock(&self.waiters).values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One registered waiter.
pub struct Subscription<M> {
    token: SessionToken,
    id: u64,
    started: Instant,
    deadline: Option<Instant>,
    rx: oneshot::Receiver<M>,
    table: Weak<Mutex<Waiters<M>>>,
}

impl<M> Subscription<M> {
    pub fn token(&self) -> &SessionToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Wait for the single message, up to the deadline.
    ///
    /// At the deadline the waiter is withdrawn before returning; a message
    /// delivered in the meantime is returned rather than lost.
    pub async fn recv(mut self) -> Result<M, RelayError> {
        let received = match self.deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, &mut self.rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.unregister();
                    self.rx.close();
                    return match self.rx.try_recv() {
                        Ok(msg) => {
                            debug!(session = %self.token, waiter = self.id, "delivery raced the deadline");
                            Ok(msg)
                        }
                        Err(_) => Err(RelayError::Timeout {
                            session: self.token.to_hex(),
                            waited: self.started.elapsed(),
                        }),
                    };
                }
            },
            None => (&mut self.rx).await,
        };
        received.map_err(|_| RelayError::Closed("waiter table dropped".into()))
    }

    /// Withdraw the waiter. Returns a message that was delivered before the
    /// withdrawal took effect, so the caller can route it elsewhere.
    pub fn cancel(mut self) -> Option<M> {
        self.unregister();
        self.rx.close();
        self.rx.try_recv().ok()
    }

    fn unregister(&self) {
        let Some(table) = self.table.upgrade() else {
            return;
        };
        let mut waiters = lock(&table);
        if let Some(queue) = waiters.get_mut(&self.token) {
            queue.retain(|w| w.id != self.id);
            if queue.is_empty() {
                waiters.remove(&self.token);
            }
        }
    }
}

impl<M> Drop for Subscription<M> {
    fn drop(&mut self) {
        self.unregister();
    }
}

fn lock<M>(waiters: &Mutex<Waiters<M>>) -> MutexGuard<'_, Waiters<M>> {
    waiters.lock().unwrap_or_else(|e| e.into_inner())
}
