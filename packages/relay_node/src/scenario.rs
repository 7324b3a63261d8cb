//! Two-node scenarios over an in-process network.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail, ensure};
use session_relay::{
    CommService, Connection, ConnectionConfig, MemoryNetwork, MemoryPeer, PlainIdentityResolver,
    RelayConfig, Role, SessionToken,
};
use tracing::info;

pub const LEADER: &str = "peer0.org1:7051";
pub const FOLLOWER: &str = "peer0.org2:7051";

type Node = Arc<CommService<MemoryPeer>>;

async fn start_pair(config: &RelayConfig) -> Result<(Node, Node)> {
    let net = MemoryNetwork::new();
    let mut nodes = Vec::with_capacity(2);
    for endpoint in [LEADER, FOLLOWER] {
        let node = CommService::start(
            Arc::new(net.join(endpoint)),
            Arc::new(PlainIdentityResolver),
            config.clone(),
        );
        node.ready()
            .await
            .with_context(|| format!("starting node {endpoint}"))?;
        nodes.push(node);
    }
    let follower = nodes.pop().context("follower missing")?;
    let leader = nodes.pop().context("leader missing")?;
    Ok((leader, follower))
}

fn bytes(parts: &[&[u8]]) -> Vec<Vec<u8>> {
    parts.iter().map(|p| p.to_vec()).collect()
}

/// Leader sends then receives; follower receives then sends. Both sides
/// only use the invocation verbs.
pub async fn exchange(config: &RelayConfig, receive_timeout: Duration) -> Result<()> {
    let (leader, follower) = start_pair(config).await?;
    let tx = SessionToken::generate();
    let millis = receive_timeout.as_millis().to_string();
    info!(session = %tx, "starting exchange");

    let leader_side = async {
        let sent = leader
            .invoke("send", &bytes(&[b"hello from org1", tx.as_bytes(), FOLLOWER.as_bytes()]))
            .await;
        ensure!(sent.is_ok(), "leader: {}", sent.message);
        let reply = leader
            .invoke("receive", &bytes(&[tx.as_bytes(), millis.as_bytes(), FOLLOWER.as_bytes()]))
            .await;
        ensure!(reply.is_ok(), "leader: {}", reply.message);
        Ok(reply.payload)
    };

    let follower_side = async {
        let got = follower
            .invoke("receive", &bytes(&[tx.as_bytes(), millis.as_bytes(), LEADER.as_bytes()]))
            .await;
        ensure!(got.is_ok(), "follower: {}", got.message);
        let sent = follower
            .invoke("send", &bytes(&[b"hello from org2", tx.as_bytes(), LEADER.as_bytes()]))
            .await;
        ensure!(sent.is_ok(), "follower: {}", sent.message);
        Ok(got.payload)
    };

    let (at_leader, at_follower) = tokio::try_join!(leader_side, follower_side)?;
    println!("{LEADER} got: {}", String::from_utf8_lossy(&at_leader));
    println!("{FOLLOWER} got: {}", String::from_utf8_lossy(&at_follower));

    leader.shutdown().await;
    follower.shutdown().await;
    Ok(())
}

/// Open a connection and bounce `size` bytes `rounds` times.
pub async fn ping_pong(
    relay: &RelayConfig,
    connection: &ConnectionConfig,
    rounds: u32,
    size: usize,
) -> Result<Duration> {
    if size == 0 {
        bail!("payload size must be at least one byte");
    }
    let (leader, follower) = start_pair(relay).await?;
    let tx = SessionToken::generate();

    let passive = {
        let (node, tx, config) = (follower.clone(), tx.clone(), connection.clone());
        tokio::spawn(async move {
            let conn = Connection::open(node, tx, LEADER, Role::Passive, config).await?;
            let mut stream = conn.into_stream();
            let mut buf = vec![0u8; size];
            for _ in 0..rounds {
                let n = stream.read_full(&mut buf).await?;
                stream.get_mut().write(&buf[..n]).await?;
            }
            Ok::<_, session_relay::RelayError>(())
        })
    };

    let conn = Connection::open(leader.clone(), tx, FOLLOWER, Role::Active, connection.clone())
        .await
        .context("opening active side")?;
    info!(rounds, size, "connection established, starting rounds");

    let payload = vec![0xA5u8; size];
    let mut stream = conn.into_stream();
    let mut buf = vec![0u8; size];
    let started = Instant::now();
    for round in 0..rounds {
        stream.get_mut().write(&payload).await?;
        let n = stream
            .read_full(&mut buf)
            .await
            .with_context(|| format!("round {round}"))?;
        ensure!(buf[..n] == payload[..], "round {round}: payload corrupted");
    }
    let elapsed = started.elapsed();

    passive.await.context("passive side panicked")??;
    leader.shutdown().await;
    follower.shutdown().await;
    Ok(elapsed)
}
