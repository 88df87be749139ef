//! Test pool (Stratum server role).
//!
//! Accepts miners, runs the subscribe/authorize/submit handshake for each
//! one, records submitted shares, and pushes a freshly synthesized job to
//! every connected session on a fixed interval.
//!
//! Ownership is split so nothing needs a lock: each connection task owns
//! its [`Session`] and socket; the accept loop owns the [`Broadcaster`] and
//! therefore the session registry; shares go to a [`ShareLog`] actor; and
//! counters live in lock-free [`Stats`].

mod broadcaster;

pub use broadcaster::{Broadcaster, ConnectionId, JobGenerator};

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::append_log::{LogConfig, ShareLog};
use crate::stats::Stats;
use crate::stratum_v1::protocol::{self, AcceptAll, Authorizer, DEFAULT_EXTRANONCE2_SIZE};
use crate::stratum_v1::{
    Job, LineFramer, Session, StratumResult, decode, write_message,
};
use crate::tracing::prelude::*;
use crate::validate::validate_share;

/// Jobs a session may have queued before the broadcaster starts skipping it.
const SESSION_JOB_QUEUE: usize = 8;

/// Test pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Address to listen on
    pub bind_addr: String,

    /// How often to broadcast a new job
    pub job_interval: Duration,

    /// Extranonce2 size handed out at subscribe
    pub extranonce2_size: usize,

    /// Difficulty announced right after subscribe, if any
    pub initial_difficulty: Option<f64>,

    /// JSON-lines file mirroring the share log
    pub share_log_path: Option<PathBuf>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3333".to_string(),
            job_interval: Duration::from_secs(10),
            extranonce2_size: DEFAULT_EXTRANONCE2_SIZE,
            initial_difficulty: None,
            share_log_path: None,
        }
    }
}

/// A bound, not yet running, test pool.
pub struct Pool {
    listener: TcpListener,
    config: PoolConfig,
    authorizer: Arc<dyn Authorizer>,
    stats: Arc<Stats>,
    share_log: ShareLog,
}

/// What every connection task needs from the pool.
#[derive(Clone)]
struct ConnectionContext {
    authorizer: Arc<dyn Authorizer>,
    stats: Arc<Stats>,
    share_log: ShareLog,
    extranonce2_size: usize,
    initial_difficulty: Option<f64>,
}

impl Pool {
    /// Bind the listening socket and start the share log.
    pub async fn bind(config: PoolConfig) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let share_log = ShareLog::spawn(LogConfig {
            path: config.share_log_path.clone(),
            keep_in_memory: true,
        })
        .await?;

        Ok(Self {
            listener,
            config,
            authorizer: Arc::new(AcceptAll),
            stats: Stats::new(),
            share_log,
        })
    }

    /// Replace the default accept-everything authorization policy.
    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> Arc<Stats> {
        self.stats.clone()
    }

    pub fn share_log(&self) -> ShareLog {
        self.share_log.clone()
    }

    /// Serve miners until `shutdown` is cancelled.
    ///
    /// Returns once every connection task has finished.
    pub async fn run(self, shutdown: CancellationToken) -> StratumResult<()> {
        let addr = self.listener.local_addr()?;
        info!(addr = %addr, "Pool listening");

        let ctx = ConnectionContext {
            authorizer: self.authorizer,
            stats: self.stats,
            share_log: self.share_log,
            extranonce2_size: self.config.extranonce2_size,
            initial_difficulty: self.config.initial_difficulty,
        };

        let tracker = TaskTracker::new();
        let mut broadcaster = Broadcaster::new();
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel::<ConnectionId>();

        let mut ticker = tokio::time::interval(self.config.job_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; jobs start one interval in
        ticker.tick().await;

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                            continue;
                        }
                    };

                    let (job_tx, job_rx) = mpsc::channel(SESSION_JOB_QUEUE);
                    let id = broadcaster.register(job_tx);
                    info!(peer = %peer, "Miner connected");

                    tracker.spawn(serve_connection(
                        id,
                        stream,
                        ctx.clone(),
                        job_rx,
                        shutdown.clone(),
                        closed_tx.clone(),
                    ));
                }

                Some(id) = closed_rx.recv() => {
                    broadcaster.unregister(id);
                }

                _ = ticker.tick() => {
                    broadcaster.tick();
                }

                _ = shutdown.cancelled() => break,
            }
        }

        tracker.close();
        tracker.wait().await;
        info!("Pool stopped");
        Ok(())
    }
}

/// Drive one miner connection until it closes or the pool shuts down.
async fn serve_connection(
    id: ConnectionId,
    stream: TcpStream,
    ctx: ConnectionContext,
    mut jobs: mpsc::Receiver<Arc<Job>>,
    shutdown: CancellationToken,
    closed: mpsc::UnboundedSender<ConnectionId>,
) {
    let peer = stream.peer_addr().ok();
    let (read_half, write_half) = stream.into_split();
    let mut frames = FramedRead::new(read_half, LineFramer::new());
    let mut writer = BufWriter::new(write_half);

    let mut guard = ctx.stats.track_connection();
    let mut session = Session::new();

    let result: StratumResult<()> = async {
        loop {
            tokio::select! {
                frame = frames.next() => {
                    let Some(frame) = frame else {
                        break;
                    };
                    let frame = frame?;

                    let msg = match decode(&frame) {
                        Ok(msg) => msg,
                        Err(e) => {
                            debug!(error = %e, "Dropping undecodable frame");
                            ctx.stats.undecodable_frame();
                            continue;
                        }
                    };

                    let was_subscribed = session.subscribed;
                    let action = protocol::handle_request(
                        &mut session,
                        &msg,
                        ctx.authorizer.as_ref(),
                        ctx.extranonce2_size,
                    );

                    if let Some(share) = action.share {
                        ctx.stats.share_submitted();
                        match session.current_job.as_deref() {
                            Some(job) if job.job_id == share.job_id => {
                                let report = validate_share(job, &session, &share);
                                debug!(valid = report.valid, errors = ?report.errors, "Share checked");
                            }
                            _ => debug!(job_id = %share.job_id, "Share for unknown or stale job"),
                        }
                        ctx.share_log.append(share);
                    }

                    if let Some(response) = &action.response {
                        write_message(&mut writer, response).await?;
                    }

                    // Authorize is accepted without a prior subscribe, so the
                    // flags are tracked separately rather than as one ordered state
                    if !was_subscribed && session.subscribed {
                        guard.subscribed();
                        if let Some(difficulty) = ctx.initial_difficulty {
                            write_message(&mut writer, &protocol::set_difficulty(difficulty)).await?;
                        }
                    }
                    if session.authorized {
                        guard.authorized();
                    }
                }

                Some(job) = jobs.recv() => {
                    write_message(&mut writer, &crate::stratum_v1::Message::notify(&job)).await?;
                    session.set_job(job);
                }

                _ = shutdown.cancelled() => break,
            }
        }
        Ok(())
    }
    .await;

    if let Err(e) = result {
        debug!(peer = ?peer, error = %e, "Connection error");
    }
    let _ = writer.shutdown().await;
    let _ = closed.send(id);
    info!(peer = ?peer, "Miner disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stratum_v1::{Connection, Message, Transport, method};
    use serde_json::json;

    async fn start(config: PoolConfig) -> (SocketAddr, Arc<Stats>, ShareLog, CancellationToken) {
        let pool = Pool::bind(PoolConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            ..config
        })
        .await
        .unwrap();
        let addr = pool.local_addr().unwrap();
        let stats = pool.stats();
        let log = pool.share_log();
        let shutdown = CancellationToken::new();
        tokio::spawn(pool.run(shutdown.clone()));
        (addr, stats, log, shutdown)
    }

    async fn connect(addr: SocketAddr) -> Connection {
        Connection::connect(&addr.to_string(), Duration::from_secs(5))
            .await
            .unwrap()
    }

    async fn call(conn: &mut Connection, msg: Message) -> Message {
        conn.write_message(&msg).await.unwrap();
        conn.read_message().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_handshake_and_share_log() {
        let (addr, stats, log, shutdown) = start(PoolConfig::default()).await;
        let mut conn = connect(addr).await;

        let submit = Message::request(
            1,
            method::SUBMIT,
            json!(["rig.1", "1", "00000000", "504e86b9", "deadbeef"]),
        );
        let early = call(&mut conn, submit.clone()).await;
        assert_eq!(early.result(), Some(&json!(false)));

        let sub = call(&mut conn, Message::request(2, method::SUBSCRIBE, json!(["rig.1"]))).await;
        let parsed = protocol::parse_subscribe_result(sub.result().unwrap()).unwrap();
        assert_eq!(parsed.extranonce2_size, 4);

        let auth = call(
            &mut conn,
            Message::request(3, method::AUTHORIZE, json!(["rig.1", "x"])),
        )
        .await;
        assert_eq!(auth.result(), Some(&json!(true)));

        let mut submit = submit;
        submit.set_id(Some(4));
        let accepted = call(&mut conn, submit).await;
        assert_eq!(accepted, Message::response(Some(4), json!(true)));

        let shares = log.snapshot().await;
        assert_eq!(shares.len(), 1);
        assert_eq!(shares[0].nonce, "deadbeef");

        let snap = stats.snapshot();
        assert_eq!(snap.active_connections, 1);
        assert_eq!(snap.subscriptions, 1);
        assert_eq!(snap.authorizations, 1);
        assert_eq!(snap.shares_submitted, 1);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_initial_difficulty_follows_subscribe() {
        let (addr, _stats, _log, shutdown) = start(PoolConfig {
            initial_difficulty: Some(16.0),
            ..Default::default()
        })
        .await;
        let mut conn = connect(addr).await;

        call(&mut conn, Message::request(1, method::SUBSCRIBE, json!(["rig.1"]))).await;
        let next = conn.read_message().await.unwrap().unwrap();
        assert_eq!(next.method(), Some(method::SET_DIFFICULTY));
        assert_eq!(next.params(), &[json!(16.0)]);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_authorize_without_subscribe_is_not_counted_as_subscribed() {
        let (addr, stats, _log, shutdown) = start(PoolConfig {
            initial_difficulty: Some(8.0),
            ..Default::default()
        })
        .await;
        let mut conn = connect(addr).await;

        let auth = call(
            &mut conn,
            Message::request(1, method::AUTHORIZE, json!(["rig.1", "x"])),
        )
        .await;
        assert_eq!(auth.result(), Some(&json!(true)));

        // No set_difficulty in between: the next frame answers this request
        let reply = call(&mut conn, Message::request(2, method::GET_TRANSACTIONS, json!([]))).await;
        assert_eq!(reply, Message::response(Some(2), json!([])));

        let snap = stats.snapshot();
        assert_eq!(snap.subscriptions, 0);
        assert_eq!(snap.authorizations, 1);

        // Subscribing afterwards still gets the difficulty
        call(&mut conn, Message::request(3, method::SUBSCRIBE, json!(["rig.1"]))).await;
        let next = conn.read_message().await.unwrap().unwrap();
        assert_eq!(next.method(), Some(method::SET_DIFFICULTY));
        assert_eq!(stats.snapshot().subscriptions, 1);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_session() {
        let (addr, _stats, _log, shutdown) = start(PoolConfig {
            job_interval: Duration::from_millis(200),
            ..Default::default()
        })
        .await;

        let mut conns = Vec::new();
        for _ in 0..3 {
            conns.push(connect(addr).await);
        }

        // The connections may straddle one tick, so look for a job every
        // session saw among its first two.
        let mut seen = Vec::new();
        for conn in &mut conns {
            let mut ids = std::collections::HashSet::new();
            for _ in 0..2 {
                let msg = tokio::time::timeout(Duration::from_secs(5), conn.read_message())
                    .await
                    .unwrap()
                    .unwrap()
                    .unwrap();
                assert_eq!(msg.method(), Some(method::NOTIFY));
                assert!(msg.is_notification());
                ids.insert(Job::from_notify_params(msg.params()).unwrap().job_id);
            }
            seen.push(ids);
        }

        let common: Vec<_> = seen[0]
            .iter()
            .filter(|id| seen.iter().all(|ids| ids.contains(*id)))
            .collect();
        assert!(!common.is_empty(), "{:?}", seen);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_undecodable_frame_is_dropped() {
        let (addr, stats, _log, shutdown) = start(PoolConfig::default()).await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let (rd, mut wr) = stream.into_split();
        wr.write_all(b"this is not json\n{\"id\":7,\"method\":\"mining.get_transactions\",\"params\":[]}\n")
            .await
            .unwrap();

        let mut frames = FramedRead::new(rd, LineFramer::new());
        let reply = decode(&frames.next().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply, Message::response(Some(7), json!([])));
        assert_eq!(stats.snapshot().undecodable_frames, 1);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_connections() {
        let pool = Pool::bind(PoolConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
        let addr = pool.local_addr().unwrap();
        let stats = pool.stats();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(pool.run(shutdown.clone()));

        let mut conn = connect(addr).await;
        call(&mut conn, Message::request(1, method::SUBSCRIBE, json!([]))).await;

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(stats.snapshot().active_connections, 0);
        assert!(conn.read_message().await.unwrap().is_none());
    }
}
