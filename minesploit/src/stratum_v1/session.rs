//! Per-connection protocol state and the work/share data model.
//!
//! A [`Session`] belongs to exactly one connection and lives as long as it.
//! Jobs are immutable snapshots shared between sessions behind an `Arc`; a
//! newer job supersedes an older one but never modifies it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use super::error::{StratumError, StratumResult};

/// Work unit announced by `mining.notify`.
///
/// Fields stay in the hex-string form Stratum uses on the wire; the relay
/// and test pool never need to interpret them, and share validation decodes
/// only what it checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub prev_hash: String,
    /// Coinbase transaction up to the extranonces
    pub coinbase1: String,
    /// Coinbase transaction after the extranonces
    pub coinbase2: String,
    pub merkle_branches: Vec<String>,
    pub version: String,
    pub nbits: String,
    pub ntime: String,
    /// If true, abandon all previous jobs
    pub clean_jobs: bool,
}

impl Job {
    /// Parse from `mining.notify` parameters.
    pub fn from_notify_params(params: &[Value]) -> StratumResult<Self> {
        if params.len() < 9 {
            return Err(StratumError::InvalidMessage(format!(
                "mining.notify needs 9 params, got {}",
                params.len()
            )));
        }

        let merkle_branches = params[4]
            .as_array()
            .ok_or_else(|| StratumError::InvalidMessage("merkle branches not an array".into()))?
            .iter()
            .map(|b| hex_field(b, "merkle branch"))
            .collect::<StratumResult<Vec<_>>>()?;

        Ok(Self {
            job_id: string_field(&params[0], "job_id")?,
            prev_hash: hex_field(&params[1], "prev_hash")?,
            coinbase1: hex_field(&params[2], "coinbase1")?,
            coinbase2: hex_field(&params[3], "coinbase2")?,
            merkle_branches,
            version: hex_field(&params[5], "version")?,
            nbits: hex_field(&params[6], "nbits")?,
            ntime: hex_field(&params[7], "ntime")?,
            clean_jobs: params[8]
                .as_bool()
                .ok_or_else(|| StratumError::InvalidMessage("clean_jobs not a bool".into()))?,
        })
    }

    /// Convert to `mining.notify` parameters.
    pub fn to_notify_params(&self) -> Value {
        serde_json::json!([
            self.job_id,
            self.prev_hash,
            self.coinbase1,
            self.coinbase2,
            self.merkle_branches,
            self.version,
            self.nbits,
            self.ntime,
            self.clean_jobs,
        ])
    }
}

/// A share accepted into the share log. Never modified once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareSubmission {
    pub worker_name: String,
    pub job_id: String,
    pub extranonce2: String,
    pub ntime: String,
    pub nonce: String,
    #[serde(with = "time::serde::rfc3339")]
    pub submitted_at: OffsetDateTime,
}

impl ShareSubmission {
    /// Parse from `mining.submit` parameters, stamping the current time.
    pub fn from_submit_params(params: &[Value]) -> StratumResult<Self> {
        if params.len() < 5 {
            return Err(StratumError::InvalidMessage(format!(
                "mining.submit needs 5 params, got {}",
                params.len()
            )));
        }

        Ok(Self {
            worker_name: string_field(&params[0], "worker_name")?,
            job_id: string_field(&params[1], "job_id")?,
            extranonce2: string_field(&params[2], "extranonce2")?,
            ntime: string_field(&params[3], "ntime")?,
            nonce: string_field(&params[4], "nonce")?,
            submitted_at: OffsetDateTime::now_utc(),
        })
    }
}

fn string_field(value: &Value, name: &str) -> StratumResult<String> {
    value
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| StratumError::InvalidMessage(format!("{} not a string", name)))
}

fn hex_field(value: &Value, name: &str) -> StratumResult<String> {
    let s = string_field(value, name)?;
    if !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(StratumError::InvalidMessage(format!("{} not hex", name)));
    }
    Ok(s)
}

/// Where a session is in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Connected,
    Subscribed,
    Authorized,
}

/// Protocol state of one connection.
///
/// Owned by the task driving that connection; never shared.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub session_id: Option<String>,
    /// Hex-encoded extranonce1 assigned at subscribe
    pub extranonce1: Option<String>,
    pub extranonce2_size: usize,
    pub subscribed: bool,
    pub authorized: bool,
    pub worker_name: Option<String>,
    pub current_job: Option<Arc<Job>>,
    pub difficulty: Option<f64>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Furthest handshake step reached. A worker may authorize without
    /// subscribing, so `Authorized` does not imply `subscribed`.
    pub fn state(&self) -> SessionState {
        if self.authorized {
            SessionState::Authorized
        } else if self.subscribed {
            SessionState::Subscribed
        } else {
            SessionState::Connected
        }
    }

    /// Record subscription details.
    pub fn mark_subscribed(
        &mut self,
        session_id: Option<String>,
        extranonce1: String,
        extranonce2_size: usize,
    ) {
        self.session_id = session_id;
        self.extranonce1 = Some(extranonce1);
        self.extranonce2_size = extranonce2_size;
        self.subscribed = true;
    }

    /// Record a successful authorization.
    pub fn mark_authorized(&mut self, worker_name: impl Into<String>) {
        self.worker_name = Some(worker_name.into());
        self.authorized = true;
    }

    /// Replace the current job.
    pub fn set_job(&mut self, job: Arc<Job>) {
        self.current_job = Some(job);
    }
}
