//! API data transfer objects.
//!
//! These types define the API contract shared between the server and
//! clients.

use serde::{Deserialize, Serialize};

/// Counters of a running pool or relay.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct StatsSnapshot {
    /// Open miner connections (relay: open pairs)
    pub active_connections: u64,
    /// Connections currently subscribed
    pub subscriptions: u64,
    /// Connections currently authorized
    pub authorizations: u64,
    /// Every `mining.submit` seen since start
    pub shares_submitted: u64,
    /// Submits rewritten to the relay's own identity
    pub shares_stolen: u64,
    /// Frames that were not valid Stratum JSON
    pub undecodable_frames: u64,
}
