//! SEND / RECEIVE verbs for invokers, over one node's relay and network.
//!
//! Construction is explicit: [`CommService::start`] builds the relay,
//! spawns the intake loop and hands back a shared handle. Request paths
//! await [`CommService::ready`] instead of polling for a global.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::acceptor::InboundAcceptor;
use crate::config::RelayConfig;
use crate::connection::SessionTransport;
use crate::error::RelayError;
use crate::identity::{IdentityResolver, SenderFilter};
use crate::network::{PeerNetwork, SendCriteria};
use crate::relay::SessionRelay;
use crate::token::SessionToken;
use crate::wire::GossipMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Error,
}

/// Answer to one [`CommService::invoke`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub payload: Vec<u8>,
    pub message: String,
}

impl Response {
    pub fn success(payload: Vec<u8>) -> Self {
        Self {
            status: Status::Ok,
            payload,
            message: String::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            payload: Vec::new(),
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

pub struct CommService<N: PeerNetwork> {
    network: Arc<N>,
    relay: Arc<SessionRelay>,
    config: RelayConfig,
    ready: watch::Receiver<bool>,
    cancel: CancellationToken,
    intake: Mutex<Option<JoinHandle<Result<(), RelayError>>>>,
}

impl<N: PeerNetwork> CommService<N> {
    /// Build the relay and spawn the intake loop. Must be called from
    /// within a tokio runtime.
    pub fn start(
        network: Arc<N>,
        resolver: Arc<dyn IdentityResolver>,
        config: RelayConfig,
    ) -> Arc<Self> {
        let relay = Arc::new(SessionRelay::new(&config));
        let (ready_tx, ready_rx) = watch::channel(false);
        let cancel = CancellationToken::new();

        let acceptor = InboundAcceptor::new(relay.clone(), resolver);
        let intake = tokio::spawn(acceptor.run(
            network.clone(),
            config.intake_buffer,
            ready_tx,
            cancel.child_token(),
        ));
        info!(endpoint = network.local_endpoint(), "comm service starting");

        Arc::new(Self {
            network,
            relay,
            config,
            ready: ready_rx,
            cancel,
            intake: Mutex::new(Some(intake)),
        })
    }

    /// Resolves once the intake loop is accepting. Fails if it exited first.
    pub async fn ready(&self) -> Result<(), RelayError> {
        let mut ready = self.ready.clone();
        ready
            .wait_for(|up| *up)
            .await
            .map(|_| ())
            .map_err(|_| RelayError::Closed("intake loop exited before it was ready".into()))
    }

    pub fn relay(&self) -> &Arc<SessionRelay> {
        &self.relay
    }

    pub fn endpoint(&self) -> &str {
        self.network.local_endpoint()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Deliver `payload` on `token` to the peer at `target`.
    ///
    /// One attempt: fails unless the configured number of acks arrive within
    /// the ack timeout.
    pub async fn send(
        &self,
        payload: &[u8],
        token: &SessionToken,
        target: &str,
    ) -> Result<(), RelayError> {
        if token.is_empty() {
            return Err(RelayError::Validation("session token is empty".into()));
        }
        if target.is_empty() {
            return Err(RelayError::Validation("target endpoint is empty".into()));
        }

        let message = GossipMessage::SessionData {
            session: token.as_bytes().to_vec(),
            data: payload.to_vec(),
        };
        let criteria = SendCriteria::to_endpoint(
            target,
            self.config.max_peers,
            self.config.min_ack,
            self.config.ack_timeout,
        );

        if let Err(e) = self.network.send_to_peer(&message, criteria).await {
            warn!(session = %token, target, error = %e, "send failed");
            return Err(e);
        }
        debug!(session = %token, target, bytes = payload.len(), "sent");
        Ok(())
    }

    /// Claim the next message on `token` from a sender `filter` accepts.
    pub async fn receive(
        &self,
        token: &SessionToken,
        timeout: Option<Duration>,
        filter: &SenderFilter,
    ) -> Result<Vec<u8>, RelayError> {
        if token.is_empty() {
            return Err(RelayError::Validation("session token is empty".into()));
        }
        self.relay
            .receive(token, timeout, filter)
            .await
            .map(|msg| msg.payload)
    }

    /// Dispatch a verb by name with positional byte-string arguments.
    pub async fn invoke(&self, function: &str, args: &[Vec<u8>]) -> Response {
        match function {
            "init" => Response::success(Vec::new()),
            "send" => self.invoke_send(args).await,
            "receive" => self.invoke_receive(args).await,
            other => Response::error(format!("function [{other}] does not exist")),
        }
    }

    async fn invoke_send(&self, args: &[Vec<u8>]) -> Response {
        let [payload, token, target] = args else {
            return Response::error(format!(
                "send failed: {}",
                RelayError::Validation(format!(
                    "expected payload, session and target, got {} arguments",
                    args.len()
                ))
            ));
        };
        let target = match text_arg("target", target) {
            Ok(target) => target,
            Err(e) => return Response::error(format!("send failed: {e}")),
        };

        match self
            .send(payload, &SessionToken::new(token.as_slice()), target)
            .await
        {
            Ok(()) => Response::success(Vec::new()),
            Err(e) => Response::error(format!("send failed: {e}")),
        }
    }

    async fn invoke_receive(&self, args: &[Vec<u8>]) -> Response {
        let (token, timeout, source) = match parse_receive_args(args) {
            Ok(parsed) => parsed,
            Err(e) => {
                error!(error = %e, "rejecting receive");
                return Response::error(e.to_string());
            }
        };
        let filter = SenderFilter::from_source(source);

        match self.receive(&token, Some(timeout), &filter).await {
            Ok(payload) => Response::success(payload),
            Err(RelayError::Timeout { .. }) => {
                Response::error(format!("no message from {filter} on session {token}"))
            }
            Err(e) => Response::error(e.to_string()),
        }
    }

    /// Stop the intake loop and wait for it to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let intake = self
            .intake
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = intake {
            match handle.await {
                Ok(Ok(())) => info!(endpoint = self.endpoint(), "comm service stopped"),
                Ok(Err(e)) => warn!(endpoint = self.endpoint(), error = %e, "intake loop failed"),
                Err(e) => warn!(endpoint = self.endpoint(), error = %e, "intake task panicked"),
            }
        }
    }
}

impl<N: PeerNetwork> Drop for CommService<N> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl<N: PeerNetwork> SessionTransport for CommService<N> {
    async fn send_message(
        &self,
        payload: &[u8],
        token: &SessionToken,
        target: &str,
    ) -> Result<(), RelayError> {
        self.send(payload, token, target).await
    }

    async fn receive_message(
        &self,
        token: &SessionToken,
        timeout: Option<Duration>,
        source: &str,
    ) -> Result<Vec<u8>, RelayError> {
        self.receive(token, timeout, &SenderFilter::from_source(Some(source)))
            .await
    }
}

fn text_arg<'a>(name: &str, raw: &'a [u8]) -> Result<&'a str, RelayError> {
    std::str::from_utf8(raw)
        .map(str::trim)
        .map_err(|_| RelayError::Validation(format!("{name} is not valid UTF-8")))
}

fn parse_receive_args(args: &[Vec<u8>]) -> Result<(SessionToken, Duration, Option<&str>), RelayError> {
    let (token, timeout, source) = match args {
        [token, timeout] => (token, timeout, None),
        [token, timeout, source] => (token, timeout, Some(source)),
        _ => {
            return Err(RelayError::Validation(format!(
                "expected session, timeout and optional source, got {} arguments",
                args.len()
            )));
        }
    };

    let millis: u64 = text_arg("timeout", timeout)?
        .parse()
        .map_err(|_| RelayError::Validation("the second argument 'timeout' needs to be an integer".into()))?;
    let source = source.map(|s| text_arg("source", s)).transpose()?;

    Ok((
        SessionToken::new(token.as_slice()),
        Duration::from_millis(millis),
        source,
    ))
}
