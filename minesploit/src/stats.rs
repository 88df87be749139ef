//! Live counters shared by the pool and the relay.
//!
//! Connection tasks update the counters with relaxed atomics; readers take a
//! [`StatsSnapshot`] without pausing anything. `active_connections`,
//! `subscriptions`, and `authorizations` are gauges of sessions currently in
//! that state. The share counters only grow.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::api_client::types::StatsSnapshot;

#[derive(Debug, Default)]
pub struct Stats {
    active_connections: AtomicU64,
    subscriptions: AtomicU64,
    authorizations: AtomicU64,
    shares_submitted: AtomicU64,
    shares_stolen: AtomicU64,
    undecodable_frames: AtomicU64,
}

impl Stats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Count a connection as active until the returned guard is dropped.
    pub fn track_connection(self: &Arc<Self>) -> ConnectionGuard {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            stats: self.clone(),
            subscribed: false,
            authorized: false,
        }
    }

    pub fn share_submitted(&self) {
        self.shares_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn share_stolen(&self) {
        self.shares_stolen.fetch_add(1, Ordering::Relaxed);
    }

    pub fn undecodable_frame(&self) {
        self.undecodable_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            active_connections: self.active_connections.load(Ordering::Relaxed),
            subscriptions: self.subscriptions.load(Ordering::Relaxed),
            authorizations: self.authorizations.load(Ordering::Relaxed),
            shares_submitted: self.shares_submitted.load(Ordering::Relaxed),
            shares_stolen: self.shares_stolen.load(Ordering::Relaxed),
            undecodable_frames: self.undecodable_frames.load(Ordering::Relaxed),
        }
    }
}

/// Keeps one connection counted in the gauges.
///
/// Dropping the guard removes the connection, and its subscription and
/// authorization if they were recorded, on every exit path.
#[derive(Debug)]
pub struct ConnectionGuard {
    stats: Arc<Stats>,
    subscribed: bool,
    authorized: bool,
}

impl ConnectionGuard {
    /// Record that this connection subscribed. Idempotent.
    pub fn subscribed(&mut self) {
        if !self.subscribed {
            self.subscribed = true;
            self.stats.subscriptions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record that this connection authorized. Idempotent.
    pub fn authorized(&mut self) {
        if !self.authorized {
            self.authorized = true;
            self.stats.authorizations.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        if self.subscribed {
            self.stats.subscriptions.fetch_sub(1, Ordering::Relaxed);
        }
        if self.authorized {
            self.stats.authorizations.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_releases_gauges() {
        let stats = Stats::new();
        {
            let mut guard = stats.track_connection();
            guard.subscribed();
            guard.subscribed();
            guard.authorized();

            let snap = stats.snapshot();
            assert_eq!(snap.active_connections, 1);
            assert_eq!(snap.subscriptions, 1);
            assert_eq!(snap.authorizations, 1);
        }

        let snap = stats.snapshot();
        assert_eq!(snap.active_connections, 0);
        assert_eq!(snap.subscriptions, 0);
        assert_eq!(snap.authorizations, 0);
    }

    #[test]
    fn test_share_counters_accumulate() {
        let stats = Stats::new();
        stats.share_submitted();
        stats.share_submitted();
        stats.share_stolen();
        stats.undecodable_frame();

        let snap = stats.snapshot();
        assert_eq!(snap.shares_submitted, 2);
        assert_eq!(snap.shares_stolen, 1);
        assert_eq!(snap.undecodable_frames, 1);
    }
}
