//! Periodic job synthesis and fan-out to connected sessions.
//!
//! The broadcaster owns the registry of connected sessions. Each session is
//! represented by the sending half of a small bounded queue drained by its
//! connection task. Delivery uses `try_send`, so a slow or dead session can
//! never hold up the others: a full queue loses that one job, and a closed
//! queue removes the session from the registry.

use std::sync::Arc;

use slotmap::{SlotMap, new_key_type};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::stratum_v1::Job;
use crate::stratum_v1::protocol::random_hex;
use crate::tracing::prelude::*;

new_key_type! {
    /// Registry key of one pool connection.
    pub struct ConnectionId;
}

/// Fixed block version announced in every synthesized job.
const JOB_VERSION: &str = "20000000";

/// Fixed compact target announced in every synthesized job.
const JOB_NBITS: &str = "1d00ffff";

/// Synthesizes plausible-looking jobs with random contents.
#[derive(Debug, Default)]
pub struct JobGenerator {
    next_job_id: u64,
}

impl JobGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce the next job. Job ids increase monotonically.
    pub fn next_job(&mut self) -> Job {
        self.next_job_id += 1;

        let ntime = time::OffsetDateTime::now_utc().unix_timestamp() as u32;
        let branch_count = rand::random::<usize>() % 4;

        Job {
            job_id: format!("{:x}", self.next_job_id),
            prev_hash: random_hex(32),
            coinbase1: random_hex(42),
            coinbase2: random_hex(36),
            merkle_branches: (0..branch_count).map(|_| random_hex(32)).collect(),
            version: JOB_VERSION.to_string(),
            nbits: JOB_NBITS.to_string(),
            ntime: format!("{:08x}", ntime),
            clean_jobs: true,
        }
    }
}

/// Registry of connected sessions plus the generator feeding them.
#[derive(Debug, Default)]
pub struct Broadcaster {
    generator: JobGenerator,
    sessions: SlotMap<ConnectionId, mpsc::Sender<Arc<Job>>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, jobs: mpsc::Sender<Arc<Job>>) -> ConnectionId {
        self.sessions.insert(jobs)
    }

    pub fn unregister(&mut self, id: ConnectionId) {
        self.sessions.remove(id);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Generate a job and deliver it to every registered session.
    ///
    /// Does nothing and returns `None` when no session is connected.
    pub fn tick(&mut self) -> Option<Arc<Job>> {
        if self.sessions.is_empty() {
            return None;
        }

        let job = Arc::new(self.generator.next_job());
        let mut closed = Vec::new();

        for (id, tx) in &self.sessions {
            match tx.try_send(job.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(connection = ?id, job_id = %job.job_id, "Session queue full, job skipped");
                }
                Err(TrySendError::Closed(_)) => closed.push(id),
            }
        }

        for id in closed {
            trace!(connection = ?id, "Pruning closed session");
            self.sessions.remove(id);
        }

        debug!(job_id = %job.job_id, sessions = self.sessions.len(), "Broadcast job");
        Some(job)
    }
}
