//! Three-message open exchange that fixes Active/Passive roles.
//!
//! ```text
//! Active                      Passive
//!   | -- ZERO (probe, repeat) --> |
//!   | <---------- ONE ----------- |   passive is listening
//!   | ----------- TWO ----------> |   active heard it
//! ```
//!
//! The relay is single-shot, not an ordered channel: a probe sent before the
//! passive side subscribes may sit in retention or be lost, so ZERO is
//! repeated every probe interval until ONE comes back.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::connection::SessionTransport;
use crate::error::RelayError;
use crate::token::SessionToken;

pub const ZERO: u8 = b'0';
pub const ONE: u8 = b'1';
pub const TWO: u8 = b'2';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Probes until the peer answers; leads the exchange.
    Active,
    /// Waits to be probed.
    Passive,
}

impl Role {
    pub fn from_leader(is_leader: bool) -> Self {
        if is_leader { Self::Active } else { Self::Passive }
    }
}

/// Progress of the opening exchange. A stalled open is reported by the
/// phase it stalled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Active: sending ZERO, waiting for ONE. Passive: waiting for ZERO.
    Opening,
    /// Passive only: ONE sent, waiting for TWO.
    Confirming,
    Established,
}

/// Result of a completed opening exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Established {
    pub role: Role,
    /// ZERO probes sent (Active) or received (Passive) before completion.
    pub probes: u32,
}

/// Run the opening exchange for `role` against `peer` on `session`.
///
/// Bounded by `config.open_timeout` when set.
pub async fn establish<T: SessionTransport>(
    transport: &T,
    session: &SessionToken,
    peer: &str,
    role: Role,
    config: &ConnectionConfig,
) -> Result<Established, RelayError> {
    let started = Instant::now();
    let mut state = HandshakeState::Opening;
    let exchange = async {
        match role {
            Role::Active => {
                open_active(transport, session, peer, config.probe_interval, &mut state).await
            }
            Role::Passive => {
                open_passive(transport, session, peer, config.steady_timeout, &mut state).await
            }
        }
    };

    let probes = match config.open_timeout {
        Some(limit) => {
            let outcome = tokio::time::timeout(limit, exchange).await;
            match outcome {
                Ok(result) => result?,
                Err(_) => {
                    warn!(session = %session, peer, ?role, ?state, "open timed out");
                    return Err(RelayError::Timeout {
                        session: session.to_hex(),
                        waited: started.elapsed(),
                    });
                }
            }
        }
        None => {
            warn!(session = %session, ?role, "opening connection with no deadline");
            exchange.await?
        }
    };

    info!(session = %session, peer, ?role, probes, "connection established");
    Ok(Established { role, probes })
}

async fn open_active<T: SessionTransport>(
    transport: &T,
    session: &SessionToken,
    peer: &str,
    probe_interval: Duration,
    state: &mut HandshakeState,
) -> Result<u32, RelayError> {
    let mut probes = 0u32;
    loop {
        probes += 1;
        if let Err(e) = transport.send_message(&[ZERO], session, peer).await {
            if !e.is_transient() {
                return Err(e);
            }
            debug!(session = %session, error = %e, "probe not delivered, retrying");
            tokio::time::sleep(probe_interval).await;
            continue;
        }

        match transport
            .receive_message(session, Some(probe_interval), peer)
            .await
        {
            Ok(reply) if reply == [ONE] => {
                transport.send_message(&[TWO], session, peer).await?;
                advance(state, HandshakeState::Established, session);
                return Ok(probes);
            }
            Ok(other) => debug!(session = %session, reply = ?other, "ignoring reply while probing"),
            Err(RelayError::Timeout { .. }) => {}
            Err(e) => return Err(e),
        }
    }
}

async fn open_passive<T: SessionTransport>(
    transport: &T,
    session: &SessionToken,
    peer: &str,
    confirm_timeout: Duration,
    state: &mut HandshakeState,
) -> Result<u32, RelayError> {
    let mut probes = 0u32;
    loop {
        match transport.receive_message(session, None, peer).await {
            Ok(msg) if msg == [ZERO] => {
                probes += 1;
                break;
            }
            Ok(other) => debug!(session = %session, msg = ?other, "ignoring message before first probe"),
            Err(RelayError::Timeout { .. }) => {}
            Err(e) => return Err(e),
        }
    }

    transport.send_message(&[ONE], session, peer).await?;
    advance(state, HandshakeState::Confirming, session);

    loop {
        let msg = transport
            .receive_message(session, Some(confirm_timeout), peer)
            .await?;
        match msg.as_slice() {
            [ZERO] => probes += 1,
            [TWO] => {
                advance(state, HandshakeState::Established, session);
                return Ok(probes);
            }
            _ => return Err(RelayError::ProtocolViolation { received: msg }),
        }
    }
}

fn advance(state: &mut HandshakeState, next: HandshakeState, session: &SessionToken) {
    debug!(session = %session, from = ?*state, to = ?next, "handshake state");
    *state = next;
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Scripted peer: replies are queued, every send is recorded in order
    /// together with the replies consumed before it.
    #[derive(Default)]
    struct Scripted {
        replies: Mutex<VecDeque<Result<Vec<u8>, RelayError>>>,
        log: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn with_replies(replies: Vec<Result<Vec<u8>, RelayError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                log: Mutex::default(),
            })
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    fn timed_out() -> Result<Vec<u8>, RelayError> {
        Err(RelayError::Timeout {
            session: String::new(),
            waited: Duration::ZERO,
        })
    }

    impl SessionTransport for Scripted {
        async fn send_message(
            &self,
            payload: &[u8],
            _token: &SessionToken,
            _target: &str,
        ) -> Result<(), RelayError> {
            self.log
                .lock()
                .unwrap()
                .push(format!("send {}", String::from_utf8_lossy(payload)));
            Ok(())
        }

        async fn receive_message(
            &self,
            _token: &SessionToken,
            timeout: Option<Duration>,
            _source: &str,
        ) -> Result<Vec<u8>, RelayError> {
            let reply = self.replies.lock().unwrap().pop_front();
            match reply {
                Some(Ok(bytes)) => {
                    self.log
                        .lock()
                        .unwrap()
                        .push(format!("recv {}", String::from_utf8_lossy(&bytes)));
                    Ok(bytes)
                }
                Some(Err(e)) => {
                    if let Some(t) = timeout {
                        tokio::time::sleep(t).await;
                    }
                    Err(e)
                }
                // Script exhausted: behave like a silent peer.
                None => match timeout {
                    Some(t) => {
                        tokio::time::sleep(t).await;
                        timed_out()
                    }
                    None => std::future::pending().await,
                },
            }
        }
    }

    fn fast() -> ConnectionConfig {
        ConnectionConfig {
            probe_interval: Duration::from_millis(10),
            steady_timeout: Duration::from_secs(1),
            open_timeout: Some(Duration::from_secs(5)),
        }
    }

    #[tokio::test]
    async fn active_reprobes_until_one() {
        let peer = Scripted::with_replies(vec![timed_out(), timed_out(), Ok(vec![ONE])]);
        let done = establish(&peer, &"s".into(), "p", Role::Active, &fast())
            .await
            .unwrap();
        assert_eq!(done.probes, 3);
        assert_eq!(
            peer.log(),
            ["send 0", "send 0", "send 0", "recv 1", "send 2"]
        );
    }

    #[tokio::test]
    async fn active_never_sends_two_before_one() {
        let peer = Scripted::with_replies(vec![Ok(vec![ZERO]), Ok(vec![TWO]), Ok(vec![ONE])]);
        establish(&peer, &"s".into(), "p", Role::Active, &fast())
            .await
            .unwrap();
        let log = peer.log();
        let one = log.iter().position(|l| l == "recv 1").unwrap();
        let two = log.iter().position(|l| l == "send 2").unwrap();
        assert!(one < two);
        assert_eq!(log.iter().filter(|l| *l == "send 2").count(), 1);
    }

    #[tokio::test]
    async fn passive_answers_first_probe_then_waits_for_two() {
        let peer = Scripted::with_replies(vec![
            Ok(b"junk".to_vec()),
            Ok(vec![ZERO]),
            Ok(vec![ZERO]),
            Ok(vec![TWO]),
        ]);
        let done = establish(&peer, &"s".into(), "p", Role::Passive, &fast())
            .await
            .unwrap();
        assert_eq!(done.probes, 2);
        assert_eq!(
            peer.log(),
            ["recv junk", "recv 0", "send 1", "recv 0", "recv 2"]
        );
    }

    #[tokio::test]
    async fn passive_rejects_unexpected_confirm() {
        let peer = Scripted::with_replies(vec![Ok(vec![ZERO]), Ok(vec![b'7'])]);
        let err = establish(&peer, &"s".into(), "p", Role::Passive, &fast())
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::ProtocolViolation { received: vec![b'7'] });
    }

    #[tokio::test(start_paused = true)]
    async fn passive_confirm_timeout_is_fatal() {
        let peer = Scripted::with_replies(vec![Ok(vec![ZERO]), Ok(vec![ZERO])]);
        // Script runs dry while waiting for TWO.
        let err = establish(&peer, &"s".into(), "p", Role::Passive, &fast())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Timeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn open_timeout_bounds_active_probing() {
        let peer = Scripted::with_replies(vec![]);
        let config = ConnectionConfig {
            open_timeout: Some(Duration::from_millis(200)),
            ..fast()
        };
        let err = establish(&peer, &"s".into(), "p", Role::Active, &config)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Timeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn passive_stalls_in_confirming_after_answering() {
        let peer = Scripted::with_replies(vec![Ok(vec![ZERO])]);
        let mut state = HandshakeState::Opening;
        let stalled = tokio::time::timeout(
            Duration::from_millis(500),
            open_passive(&peer, &"s".into(), "p", Duration::from_secs(1), &mut state),
        )
        .await;
        assert!(stalled.is_err());
        assert_eq!(state, HandshakeState::Confirming);
        assert_eq!(peer.log(), ["recv 0", "send 1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn active_stays_opening_without_reply() {
        let peer = Scripted::with_replies(vec![]);
        let mut state = HandshakeState::Opening;
        let stalled = tokio::time::timeout(
            Duration::from_millis(55),
            open_active(&peer, &"s".into(), "p", Duration::from_millis(10), &mut state),
        )
        .await;
        assert!(stalled.is_err());
        assert_eq!(state, HandshakeState::Opening);
    }

    #[tokio::test]
    async fn both_roles_finish_established() {
        let active = Scripted::with_replies(vec![Ok(vec![ONE])]);
        let mut state = HandshakeState::Opening;
        open_active(&active, &"s".into(), "p", Duration::from_millis(10), &mut state)
            .await
            .unwrap();
        assert_eq!(state, HandshakeState::Established);

        let passive = Scripted::with_replies(vec![Ok(vec![ZERO]), Ok(vec![TWO])]);
        let mut state = HandshakeState::Opening;
        open_passive(&passive, &"s".into(), "p", Duration::from_secs(1), &mut state)
            .await
            .unwrap();
        assert_eq!(state, HandshakeState::Established);
    }

    #[test]
    fn leader_is_active() {
        assert_eq!(Role::from_leader(true), Role::Active);
        assert_eq!(Role::from_leader(false), Role::Passive);
    }
}
