//! HMAC-chained, append-only audit log (§4.2).
//!
//! Every record's `hmac` covers its own fields plus `prev_hmac`, so
//! truncating or reordering the file breaks the chain at the first
//! touched record. The audit key is derived once, from the master
//! password and a salt stored in [`crate::model::VaultMetadata`], and
//! never touches disk.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::crypto;
use crate::error::AuditError;
use crate::model::{AuditOutcome, AuditRecord, ZERO_HMAC_SENTINEL};

/// Argon2id parameters for the audit key, deliberately cheaper than the
/// recovery KDF since it runs on every unlock and every append.
const AUDIT_ARGON2_TIME: u32 = 2;
const AUDIT_ARGON2_MEMORY_KIB: u32 = 19 * 1024;
const AUDIT_ARGON2_THREADS: u32 = 1;
const AUDIT_ARGON2_OUTPUT_LEN: usize = 32;

/// Derives the audit HMAC key from the master password, independent of
/// the master key used for the payload — a compromise of one must not
/// automatically grant the other.
pub fn derive_audit_key(password: &[u8], salt: &[u8; 32]) -> Result<[u8; 32], AuditError> {
    let out = crypto::argon2id_derive(
        password,
        salt,
        AUDIT_ARGON2_TIME,
        AUDIT_ARGON2_MEMORY_KIB,
        AUDIT_ARGON2_THREADS,
        AUDIT_ARGON2_OUTPUT_LEN,
    )
    .map_err(|e| AuditError::ChainBroken(e.to_string()))?;
    out.try_into().map_err(|_| AuditError::ChainBroken("audit key derivation returned wrong length".to_string()))
}

/// An open handle onto the audit log file, tracking the chain tip and
/// next sequence number so `append` never has to re-read the whole file.
pub struct AuditLog {
    path: PathBuf,
    file: File,
    key: [u8; 32],
    last_hmac: String,
    next_seq: u64,
}

impl AuditLog {
    /// Opens (creating if absent) the audit log at `path`, walking any
    /// existing records to find the chain tip and verifying the chain as
    /// it goes.
    pub fn open(path: &Path, key: [u8; 32]) -> Result<Self, AuditError> {
        let existing = if path.exists() {
            let reader = BufReader::new(File::open(path)?);
            let mut last_hmac = ZERO_HMAC_SENTINEL.to_string();
            let mut next_seq = 1u64;
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let record: AuditRecord = serde_json::from_str(&line)
                    .map_err(|e| AuditError::ChainBroken(format!("malformed record: {e}")))?;
                if record.seq != next_seq {
                    let msg = format!("expected seq {next_seq}, found {}", record.seq);
                    tracing::warn!(path = %path.display(), reason = %msg, "audit chain broken");
                    return Err(AuditError::ChainBroken(msg));
                }
                if record.prev_hmac != last_hmac {
                    let msg = format!("chain break at seq {}", record.seq);
                    tracing::warn!(path = %path.display(), reason = %msg, "audit chain broken");
                    return Err(AuditError::ChainBroken(msg));
                }
                let expected_hmac = compute_hmac(&key, &record);
                if !crypto::constant_time_eq(expected_hmac.as_bytes(), record.hmac.as_bytes()) {
                    let msg = format!("hmac mismatch at seq {}", record.seq);
                    tracing::warn!(path = %path.display(), reason = %msg, "audit chain broken");
                    return Err(AuditError::ChainBroken(msg));
                }
                last_hmac = record.hmac;
                next_seq += 1;
            }
            Some((last_hmac, next_seq))
        } else {
            None
        };

        let (last_hmac, next_seq) = existing.unwrap_or_else(|| (ZERO_HMAC_SENTINEL.to_string(), 1));

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { path: path.to_path_buf(), file, key, last_hmac, next_seq })
    }

    /// Appends a new record, chaining it onto the current tip and
    /// flushing before returning so a crash right after `append` cannot
    /// silently drop the write.
    pub fn append(
        &mut self,
        event: &str,
        outcome: AuditOutcome,
        credential: Option<String>,
        machine: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), AuditError> {
        let mut record = AuditRecord {
            seq: self.next_seq,
            time: now,
            event: event.to_string(),
            outcome,
            credential,
            machine,
            prev_hmac: self.last_hmac.clone(),
            hmac: String::new(),
        };
        record.hmac = compute_hmac(&self.key, &record);

        let line = serde_json::to_string(&record).map_err(|e| AuditError::Append(e.to_string()))?;
        writeln!(self.file, "{line}")?;
        self.file.flush()?;
        self.file.sync_all()?;

        self.last_hmac = record.hmac;
        self.next_seq += 1;
        Ok(())
    }

    /// Re-reads the log from disk and verifies every link in the chain,
    /// independent of the in-memory tip tracked by this handle.
    pub fn verify(&self) -> Result<u64, AuditError> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut last_hmac = ZERO_HMAC_SENTINEL.to_string();
        let mut count = 0u64;
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: AuditRecord = serde_json::from_str(&line)
                .map_err(|e| AuditError::ChainBroken(format!("malformed record: {e}")))?;
            if record.prev_hmac != last_hmac {
                let msg = format!("chain break at seq {}", record.seq);
                tracing::warn!(path = %self.path.display(), reason = %msg, "audit chain broken");
                return Err(AuditError::ChainBroken(msg));
            }
            let expected_hmac = compute_hmac(&self.key, &record);
            if !crypto::constant_time_eq(expected_hmac.as_bytes(), record.hmac.as_bytes()) {
                let msg = format!("hmac mismatch at seq {}", record.seq);
                tracing::warn!(path = %self.path.display(), reason = %msg, "audit chain broken");
                return Err(AuditError::ChainBroken(msg));
            }
            last_hmac = record.hmac.clone();
            count += 1;
        }
        Ok(count)
    }

    pub fn len(&self) -> u64 {
        self.next_seq - 1
    }

    pub fn is_empty(&self) -> bool {
        self.next_seq == 1
    }
}

/// Mirrors [`AuditRecord`] minus the `hmac` field itself, in the same key
/// order, so the HMAC covers the canonical JSON serialization of
/// everything else in the record (§6: "keys in the order above").
#[derive(serde::Serialize)]
struct HmacInput<'a> {
    seq: u64,
    time: DateTime<Utc>,
    event: &'a str,
    outcome: AuditOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    credential: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    machine: Option<&'a str>,
    prev_hmac: &'a str,
}

fn compute_hmac(key: &[u8; 32], record: &AuditRecord) -> String {
    let input = HmacInput {
        seq: record.seq,
        time: record.time,
        event: &record.event,
        outcome: record.outcome,
        credential: record.credential.as_deref(),
        machine: record.machine.as_deref(),
        prev_hmac: &record.prev_hmac,
    };
    let message = serde_json::to_vec(&input).expect("HmacInput is always serializable");
    hex::encode(crypto::hmac_sha256(key, &message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key() -> [u8; 32] {
        [42u8; 32]
    }

    #[test]
    fn append_then_reopen_preserves_chain_tip() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("audit.log");

        {
            let mut log = AuditLog::open(&path, key()).expect("open");
            log.append("unlock", AuditOutcome::Success, None, None, Utc::now()).expect("append");
            log.append("add_credential", AuditOutcome::Success, Some("github".to_string()), None, Utc::now())
                .expect("append");
            assert_eq!(log.len(), 2);
        }

        let mut reopened = AuditLog::open(&path, key()).expect("reopen");
        assert_eq!(reopened.next_seq, 3);
        reopened.append("lock", AuditOutcome::Success, None, None, Utc::now()).expect("append");
        assert_eq!(reopened.verify().expect("verify"), 3);
    }

    #[test]
    fn verify_detects_tampering() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("audit.log");

        {
            let mut log = AuditLog::open(&path, key()).expect("open");
            log.append("unlock", AuditOutcome::Failure, None, None, Utc::now()).expect("append");
            log.append("unlock", AuditOutcome::Success, None, None, Utc::now()).expect("append");
        }

        let contents = std::fs::read_to_string(&path).expect("read");
        let mut lines: Vec<String> = contents.lines().map(str::to_string).collect();
        lines[0] = lines[0].replace("\"failure\"", "\"success\"");
        std::fs::write(&path, lines.join("\n") + "\n").expect("write");

        let result = AuditLog::open(&path, key());
        assert!(matches!(result, Err(AuditError::ChainBroken(_))));
    }

    #[test]
    fn different_key_fails_to_open_nonempty_log() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("audit.log");

        {
            let mut log = AuditLog::open(&path, key()).expect("open");
            log.append("unlock", AuditOutcome::Success, None, None, Utc::now()).expect("append");
        }

        let other_key = [7u8; 32];
        let result = AuditLog::open(&path, other_key);
        assert!(matches!(result, Err(AuditError::ChainBroken(_))));
    }
}
