//! Request-id correlation for rewritten submits.
//!
//! When the relay rewrites a miner's `mining.submit` it gives the upstream
//! copy a fresh id from a range miners never use, so the pool's reply can be
//! recognised and routed back under the miner's original id. Ids are
//! allocated by the miner→pool leg and the table is owned by the pool→miner
//! leg; entries travel between them as [`Correlation`] values.

use std::collections::HashMap;

use crate::tracing::prelude::*;

/// First id of the range reserved for relay-originated requests.
///
/// Real miners count up from small integers; they do not get anywhere near
/// 2^32 within a connection.
pub const RELAY_ID_BASE: u64 = 1 << 32;

/// Id of the relay's own `mining.authorize`. Never entered in the table.
pub const RELAY_AUTH_ID: u64 = RELAY_ID_BASE;

/// Hands out upstream ids for rewritten requests. Never reuses an id.
#[derive(Debug)]
pub struct IdAllocator {
    next: u64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            next: RELAY_AUTH_ID + 1,
        }
    }

    pub fn next_id(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// One rewritten request awaiting its upstream response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Correlation {
    pub upstream_id: u64,
    pub downstream_id: u64,
    /// Report the share as accepted whatever the pool says
    pub force_accept: bool,
}

/// Live correlations of one relay pair.
///
/// At most one live entry exists per downstream id; registering a second
/// submit under the same downstream id evicts the first.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    by_upstream: HashMap<u64, Correlation>,
    by_downstream: HashMap<u64, u64>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: Correlation) {
        if let Some(stale) = self.by_downstream.insert(entry.downstream_id, entry.upstream_id) {
            warn!(
                downstream_id = entry.downstream_id,
                upstream_id = stale,
                "Miner reused a request id with a submit still outstanding, dropping the older one"
            );
            self.by_upstream.remove(&stale);
        }
        self.by_upstream.insert(entry.upstream_id, entry);
    }

    /// Remove and return the entry for `upstream_id`.
    pub fn take(&mut self, upstream_id: u64) -> Option<Correlation> {
        let entry = self.by_upstream.remove(&upstream_id)?;
        if self.by_downstream.get(&entry.downstream_id) == Some(&upstream_id) {
            self.by_downstream.remove(&entry.downstream_id);
        }
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.by_upstream.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_upstream.is_empty()
    }
}
