//! Stratum V1 pool, worker, and man-in-the-middle relays for mining-protocol
//! security research.

pub mod api;
pub mod api_client;
pub mod append_log;
pub mod check;
pub mod daemon;
pub mod pool;
pub mod relay;
pub mod stats;
pub mod stratum_v1;
pub mod tracing;
pub mod validate;
