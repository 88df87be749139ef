//! Checks run against a remote mining endpoint.
//!
//! A [`Check`] connects to a target, pokes at it, and reports what it found
//! as a [`CheckResult`]. [`StratumHandshakeProbe`] is the built-in one: it
//! fingerprints a Stratum V1 endpoint and flags pools that authorize any
//! worker name and password they are given.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::stratum_v1::protocol::{error_reason, parse_subscribe_result, random_hex};
use crate::stratum_v1::{Connection, Message, StratumError, StratumResult, Transport, method};
use crate::tracing::prelude::*;

/// Outcome of a check. `success` means the check's condition was found.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckResult {
    pub success: bool,
    pub message: String,
    pub details: Map<String, Value>,
}

impl CheckResult {
    fn found(message: impl Into<String>, details: Map<String, Value>) -> Self {
        Self {
            success: true,
            message: message.into(),
            details,
        }
    }

    fn not_found(message: impl Into<String>, details: Map<String, Value>) -> Self {
        Self {
            success: false,
            message: message.into(),
            details,
        }
    }
}

#[async_trait]
pub trait Check: Send + Sync {
    fn name(&self) -> &str;

    /// Run against `target` (host:port or stratum+tcp://host:port).
    ///
    /// Errors mean the check could not run at all, e.g. the target did not
    /// accept a connection.
    async fn check(&self, target: &str) -> anyhow::Result<CheckResult>;
}

/// Subscribe, then authorize with made-up credentials.
#[derive(Debug, Clone)]
pub struct StratumHandshakeProbe {
    /// Bound on connecting and on each response
    pub timeout: Duration,
}

impl Default for StratumHandshakeProbe {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl Check for StratumHandshakeProbe {
    fn name(&self) -> &str {
        "stratum-handshake"
    }

    async fn check(&self, target: &str) -> anyhow::Result<CheckResult> {
        let mut conn = Connection::connect(target, self.timeout).await?;
        let mut details = Map::new();

        let subscribe = Message::request(1, method::SUBSCRIBE, json!(["minesploit-probe"]));
        let response = match self.call(&mut conn, &subscribe, &mut details).await {
            Ok(response) => response,
            Err(e) => {
                let _ = conn.close().await;
                return Ok(CheckResult::not_found(
                    format!("No Stratum V1 subscribe response: {}", e),
                    details,
                ));
            }
        };

        let subscription = match response.result().map(parse_subscribe_result) {
            Some(Ok(sub)) => sub,
            _ => {
                let reason = response.error().map(error_reason).unwrap_or_else(|| "malformed result".into());
                let _ = conn.close().await;
                return Ok(CheckResult::not_found(
                    format!("Subscribe refused: {}", reason),
                    details,
                ));
            }
        };
        details.insert("extranonce1".into(), json!(subscription.extranonce1));
        details.insert("extranonce2_size".into(), json!(subscription.extranonce2_size));
        if let Some(session_id) = &subscription.session_id {
            details.insert("session_id".into(), json!(session_id));
        }

        let worker = format!("probe.{}", random_hex(4));
        let authorize = Message::request(2, method::AUTHORIZE, json!([worker, random_hex(8)]));
        let response = self.call(&mut conn, &authorize, &mut details).await;
        let _ = conn.close().await;
        let response = response?;

        details.insert("probe_worker".into(), json!(worker));
        let accepted = response.result().and_then(Value::as_bool).unwrap_or(false);
        debug!(endpoint = %target, accepted, "Probe authorize answered");

        if accepted {
            Ok(CheckResult::found(
                "Pool authorizes arbitrary credentials",
                details,
            ))
        } else {
            Ok(CheckResult::not_found(
                "Stratum V1 endpoint rejects unknown workers",
                details,
            ))
        }
    }
}

impl StratumHandshakeProbe {
    /// Send `request` and wait for the response with the same id, noting
    /// any notifications that arrive first.
    async fn call(
        &self,
        conn: &mut Connection,
        request: &Message,
        details: &mut Map<String, Value>,
    ) -> StratumResult<Message> {
        conn.write_message(request).await?;
        tokio::time::timeout(self.timeout, read_response(conn, request.id(), details))
            .await
            .map_err(|_| StratumError::Timeout)?
    }
}

async fn read_response(
    conn: &mut Connection,
    id: Option<u64>,
    details: &mut Map<String, Value>,
) -> StratumResult<Message> {
    loop {
        let Some(msg) = conn.read_message().await? else {
            return Err(StratumError::Disconnected);
        };
        if msg.is_response() && msg.id() == id {
            return Ok(msg);
        }
        if let Some(method) = msg.method() {
            let seen = details
                .entry("notifications")
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(methods) = seen {
                if !methods.iter().any(|m| m == method) {
                    methods.push(json!(method));
                }
            }
        }
    }
}
