//! Server-side request handling and shared result parsing.
//!
//! [`handle_request`] is the pool's half of the subscribe → authorize →
//! submit sequence. It is a plain function over a [`Session`] so the same
//! rules can be tested without sockets; the pool's connection task does the
//! I/O and the bookkeeping around it.

use std::collections::HashMap;

use rand::RngCore;
use serde_json::{Value, json};

use super::error::{StratumError, StratumResult};
use super::messages::{Message, method};
use super::session::{Session, ShareSubmission};
use crate::tracing::prelude::*;

/// Extranonce2 size the test pool hands out.
pub const DEFAULT_EXTRANONCE2_SIZE: usize = 4;

/// Stratum error code for "Other/Unknown".
const ERROR_OTHER: i64 = 20;

/// Decides whether a worker's credentials are accepted.
///
/// The test pool defaults to [`AcceptAll`], which is what a research target
/// pool with open authorization looks like.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, worker_name: &str, password: &str) -> bool;
}

/// Accept any worker name and password.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl Authorizer for AcceptAll {
    fn authorize(&self, _worker_name: &str, _password: &str) -> bool {
        true
    }
}

/// Accept only the listed worker/password pairs.
#[derive(Debug, Default, Clone)]
pub struct StaticCredentials {
    passwords: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, worker_name: impl Into<String>, password: impl Into<String>) -> Self {
        self.passwords.insert(worker_name.into(), password.into());
        self
    }
}

impl Authorizer for StaticCredentials {
    fn authorize(&self, worker_name: &str, password: &str) -> bool {
        self.passwords
            .get(worker_name)
            .is_some_and(|expected| expected == password)
    }
}

/// Outcome of handling one client request on the server side.
#[derive(Debug, Default)]
pub struct ServerAction {
    /// Response to write back, if the request gets one
    pub response: Option<Message>,
    /// Share to append to the share log
    pub share: Option<ShareSubmission>,
}

impl ServerAction {
    fn respond(response: Message) -> Self {
        Self {
            response: Some(response),
            share: None,
        }
    }
}

/// Handle one decoded client message against the connection's session.
///
/// Unknown methods and stray responses are logged and produce no reply.
pub fn handle_request(
    session: &mut Session,
    msg: &Message,
    authorizer: &dyn Authorizer,
    extranonce2_size: usize,
) -> ServerAction {
    let Message::Request { id, method, .. } = msg else {
        debug!(id = ?msg.id(), "Ignoring response sent by client");
        return ServerAction::default();
    };
    let id = *id;
    let params = msg.params();

    match method.as_str() {
        method::SUBSCRIBE => {
            let session_id = random_hex(8);
            let extranonce1 = random_hex(4);
            session.mark_subscribed(Some(session_id.clone()), extranonce1.clone(), extranonce2_size);
            let agent = params.first().and_then(Value::as_str);
            debug!(
                session_id = %session_id,
                extranonce1 = %extranonce1,
                worker = ?agent,
                "Subscribed"
            );
            ServerAction::respond(Message::response(
                id,
                json!([[session_id, [extranonce1, extranonce2_size]], null]),
            ))
        }

        method::AUTHORIZE => {
            let worker = params.first().and_then(Value::as_str).unwrap_or_default();
            let password = params.get(1).and_then(Value::as_str).unwrap_or_default();
            let accepted = authorizer.authorize(worker, password);
            if accepted {
                session.mark_authorized(worker);
                info!(worker = %worker, "Worker authorized");
            } else {
                warn!(worker = %worker, "Worker authorization refused");
            }
            ServerAction::respond(Message::response(id, Value::Bool(accepted)))
        }

        method::SUBMIT => {
            if !session.authorized {
                debug!("Rejecting submit from unauthorized session");
                return ServerAction::respond(Message::response(id, Value::Bool(false)));
            }
            match ShareSubmission::from_submit_params(params) {
                Ok(share) => {
                    info!(
                        worker = %share.worker_name,
                        job_id = %share.job_id,
                        nonce = %share.nonce,
                        "Share submitted"
                    );
                    ServerAction {
                        response: Some(Message::response(id, Value::Bool(true))),
                        share: Some(share),
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Malformed submit");
                    ServerAction::respond(Message::error_response(id, ERROR_OTHER, &e.to_string()))
                }
            }
        }

        method::GET_TRANSACTIONS => {
            ServerAction::respond(Message::response(id, Value::Array(Vec::new())))
        }

        other => {
            warn!(method = %other, "Unknown method, not responding");
            ServerAction::default()
        }
    }
}

/// `mining.set_difficulty` notification.
pub fn set_difficulty(difficulty: f64) -> Message {
    Message::notification(method::SET_DIFFICULTY, json!([difficulty]))
}

/// Subscription details as returned by `mining.subscribe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub session_id: Option<String>,
    pub extranonce1: String,
    pub extranonce2_size: usize,
}

/// Parse a `mining.subscribe` result.
///
/// Accepts both layouts seen in the wild:
///
/// - `[[subscriptions...], extranonce1, extranonce2_size]`, the common form
/// - `[[session_id, [extranonce1, extranonce2_size]], null]`, what the test
///   pool in this crate emits
pub fn parse_subscribe_result(result: &Value) -> StratumResult<Subscription> {
    let arr = result
        .as_array()
        .ok_or_else(|| StratumError::InvalidMessage("subscribe result not an array".into()))?;

    if let (Some(Value::String(extranonce1)), Some(size)) = (arr.get(1), arr.get(2)) {
        let extranonce2_size = size
            .as_u64()
            .ok_or_else(|| StratumError::InvalidMessage("extranonce2_size not a number".into()))?;
        let session_id = arr
            .first()
            .and_then(Value::as_array)
            .and_then(|subs| subs.first())
            .and_then(Value::as_array)
            .and_then(|sub| sub.get(1))
            .and_then(Value::as_str)
            .map(str::to_owned);
        return Ok(Subscription {
            session_id,
            extranonce1: extranonce1.clone(),
            extranonce2_size: extranonce2_size as usize,
        });
    }

    // [[session_id, [extranonce1, size]], null]
    let inner = arr
        .first()
        .and_then(Value::as_array)
        .ok_or_else(|| StratumError::InvalidMessage("subscribe result too short".into()))?;
    let session_id = inner.first().and_then(Value::as_str).map(str::to_owned);
    let nonces = inner
        .get(1)
        .and_then(Value::as_array)
        .ok_or_else(|| StratumError::InvalidMessage("missing extranonce pair".into()))?;
    let extranonce1 = nonces
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| StratumError::InvalidMessage("extranonce1 not a string".into()))?;
    let extranonce2_size = nonces
        .get(1)
        .and_then(Value::as_u64)
        .ok_or_else(|| StratumError::InvalidMessage("extranonce2_size not a number".into()))?;

    Ok(Subscription {
        session_id,
        extranonce1: extranonce1.to_string(),
        extranonce2_size: extranonce2_size as usize,
    })
}

/// Human-readable reason from a Stratum error value.
pub fn error_reason(error: &Value) -> String {
    match error.as_array().and_then(|arr| arr.get(1)).and_then(Value::as_str) {
        Some(reason) => reason.to_string(),
        None => error.to_string(),
    }
}

/// `bytes` random bytes, hex encoded.
pub fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}
