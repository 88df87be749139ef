//! Structural share checks and merkle-root reconstruction.
//!
//! A share is only meaningful relative to the job and session it was mined
//! for. [`validate_share`] checks the submitted fields against both and, when
//! they are well formed, rebuilds the coinbase and the merkle root the miner
//! must have hashed. It does not check proof of work.

use bitcoin::hashes::{Hash, sha256d};

use crate::stratum_v1::{Job, Session, ShareSubmission};

/// Result of checking one share.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShareReport {
    pub valid: bool,
    pub errors: Vec<String>,
    /// Merkle root (hex, internal byte order) when it could be computed
    pub merkle_root: Option<String>,
}

/// Check a share against its job and the session that submitted it.
pub fn validate_share(job: &Job, session: &Session, share: &ShareSubmission) -> ShareReport {
    let mut errors = Vec::new();

    if share.job_id != job.job_id {
        errors.push(format!("job id {} does not match {}", share.job_id, job.job_id));
    }
    check_hex_len(&share.nonce, 8, "nonce", &mut errors);
    check_hex_len(&share.ntime, 8, "ntime", &mut errors);
    check_hex_len(&share.extranonce2, session.extranonce2_size * 2, "extranonce2", &mut errors);

    let merkle_root = match coinbase(job, session, share) {
        Ok(coinbase) => match decode_branches(&job.merkle_branches) {
            Ok(branches) => Some(hex::encode(merkle_root(&coinbase, &branches))),
            Err(e) => {
                errors.push(e);
                None
            }
        },
        Err(e) => {
            errors.push(e);
            None
        }
    };

    ShareReport {
        valid: errors.is_empty(),
        errors,
        merkle_root,
    }
}

fn check_hex_len(value: &str, expected: usize, name: &str, errors: &mut Vec<String>) {
    if value.len() != expected {
        errors.push(format!("{} must be {} hex chars, got {}", name, expected, value.len()));
    } else if hex::decode(value).is_err() {
        errors.push(format!("{} is not valid hex", name));
    }
}

/// Assemble coinbase1 || extranonce1 || extranonce2 || coinbase2.
fn coinbase(job: &Job, session: &Session, share: &ShareSubmission) -> Result<Vec<u8>, String> {
    let extranonce1 = session.extranonce1.as_deref().ok_or("session has no extranonce1")?;

    let mut bytes = Vec::new();
    for (part, name) in [
        (job.coinbase1.as_str(), "coinbase1"),
        (extranonce1, "extranonce1"),
        (share.extranonce2.as_str(), "extranonce2"),
        (job.coinbase2.as_str(), "coinbase2"),
    ] {
        let decoded = hex::decode(part).map_err(|e| format!("{}: {}", name, e))?;
        bytes.extend_from_slice(&decoded);
    }
    Ok(bytes)
}

fn decode_branches(branches: &[String]) -> Result<Vec<[u8; 32]>, String> {
    branches
        .iter()
        .map(|b| {
            let bytes = hex::decode(b).map_err(|e| format!("merkle branch: {}", e))?;
            <[u8; 32]>::try_from(bytes.as_slice())
                .map_err(|_| format!("merkle branch must be 32 bytes, got {}", bytes.len()))
        })
        .collect()
}

/// Hash the coinbase and climb the merkle tree with `branches`.
pub fn merkle_root(coinbase: &[u8], branches: &[[u8; 32]]) -> [u8; 32] {
    let mut current = sha256d::Hash::hash(coinbase).to_byte_array();

    for branch in branches {
        let mut combined = [0u8; 64];
        combined[..32].copy_from_slice(&current);
        combined[32..].copy_from_slice(branch);
        current = sha256d::Hash::hash(&combined).to_byte_array();
    }

    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    fn job() -> Job {
        Job {
            job_id: "1".into(),
            prev_hash: "00".repeat(32),
            coinbase1: "0100".into(),
            coinbase2: "ffff".into(),
            merkle_branches: vec!["11".repeat(32)],
            version: "20000000".into(),
            nbits: "1d00ffff".into(),
            ntime: "504e86b9".into(),
            clean_jobs: true,
        }
    }

    fn session() -> Session {
        let mut session = Session::new();
        session.mark_subscribed(None, "aabbccdd".into(), 4);
        session
    }

    fn share(extranonce2: &str, nonce: &str) -> ShareSubmission {
        ShareSubmission {
            worker_name: "rig.1".into(),
            job_id: "1".into(),
            extranonce2: extranonce2.into(),
            ntime: "504e86b9".into(),
            nonce: nonce.into(),
            submitted_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn test_valid_share_computes_root() {
        let report = validate_share(&job(), &session(), &share("00000001", "deadbeef"));
        assert!(report.valid, "{:?}", report.errors);

        let coinbase = hex::decode("0100aabbccdd00000001ffff").unwrap();
        let expected = merkle_root(&coinbase, &[[0x11; 32]]);
        assert_eq!(report.merkle_root, Some(hex::encode(expected)));
    }

    #[test]
    fn test_wrong_lengths_are_reported() {
        let report = validate_share(&job(), &session(), &share("0001", "beef"));
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 2);
    }

    #[test]
    fn test_non_hex_nonce() {
        let report = validate_share(&job(), &session(), &share("00000001", "zzzzzzzz"));
        assert!(!report.valid);
        assert!(report.errors[0].contains("nonce"));
    }

    #[test]
    fn test_merkle_root_without_branches_is_coinbase_hash() {
        let coinbase = b"coinbase";
        assert_eq!(
            merkle_root(coinbase, &[]),
            sha256d::Hash::hash(coinbase).to_byte_array()
        );
    }
}
