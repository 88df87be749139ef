//! Stratum v1 wire protocol: framing, message codec, session state, and the
//! client and server halves of the handshake.
//!
//! Stratum v1 is newline-delimited JSON-RPC over raw TCP:
//!
//! - **Client requests**: `mining.subscribe`, `mining.authorize`,
//!   `mining.submit`, `mining.get_transactions`
//! - **Server notifications**: `mining.notify` (new work),
//!   `mining.set_difficulty`
//! - **Responses**: a result (usually boolean) or an error array
//!
//! The pool, the relay, and the worker all share the pieces in this module.
//!
//! # Usage
//!
//! ```rust,ignore
//! use minesploit::stratum_v1::{ClientConfig, ClientEvent, StratumClient};
//!
//! let (event_tx, mut event_rx) = mpsc::channel(100);
//! let config = ClientConfig {
//!     url: "stratum+tcp://127.0.0.1:3333".to_string(),
//!     username: "rig.1".to_string(),
//!     ..Default::default()
//! };
//!
//! let client = StratumClient::new(config, event_tx, shutdown_token);
//! tokio::spawn(client.run());
//!
//! while let Some(event) = event_rx.recv().await {
//!     if let ClientEvent::NewJob(job) = event { /* handle new work */ }
//! }
//! ```

mod client;
mod connection;
mod error;
mod framer;
mod messages;
pub mod protocol;
mod session;

pub use client::{ClientConfig, StratumClient};
pub(crate) use connection::{write_frame, write_message};
pub use connection::{Connection, Transport, connect_with_timeout, strip_scheme};
pub use error::{DecodeError, StratumError, StratumResult};
pub use framer::LineFramer;
pub use messages::{
    ClientCommand, ClientEvent, Message, SubmitParams, decode, encode, method,
};
pub use session::{Job, Session, SessionState, ShareSubmission};
