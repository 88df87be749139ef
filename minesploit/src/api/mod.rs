//! HTTP API server.
//!
//! Read-only monitoring of a running pool or relay. Built on Axum; exposes
//! a health check and the live [`StatsSnapshot`](crate::api_client::types::StatsSnapshot).
//!
//! The API binds to localhost only by default and does not require
//! authentication for local access.

mod server;
mod v0;

pub use server::{ApiConfig, serve};
