//! Sync hook (§4.6): a thin wrapper around an injectable command executor.
//!
//! A no-op unless sync is enabled and a remote path is configured.
//! Failures here are never fatal — they are reported to the caller as a
//! warning string and local operations proceed regardless.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::Path;

use crate::error::SyncError;
use crate::model::SyncState;

/// Metadata entry returned by a remote directory listing.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteEntry {
    pub name: String,
    pub size: u64,
    pub mtime: DateTime<Utc>,
    pub is_dir: bool,
}

/// The collaborator interface the core consumes for sync (§6). The core
/// never parses a specific executable's output beyond the documented
/// metadata-listing JSON.
pub trait CommandExecutor {
    /// Runs `name` with `args`, returning captured stdout on success.
    fn run(&self, name: &str, args: &[&str]) -> Result<Vec<u8>, String>;
    /// Runs `name` with `args`, discarding stdout.
    fn run_no_output(&self, name: &str, args: &[&str]) -> Result<(), String>;
}

/// Where the remote vault directory lives and how to reach it, supplied
/// by the caller. The core does not resolve this itself (§6 Path provider).
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub enabled: bool,
    pub remote_path: Option<String>,
}

/// Result of a `smart_pull` or `smart_push` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Sync is disabled or unconfigured; nothing happened.
    NoOp,
    /// No remote change (pull) or nothing to push (push).
    Unchanged,
    /// The operation ran and copied bytes.
    Synced,
    /// Local and remote have diverged; the sticky conflict flag is now set.
    Conflict,
}

/// Runs `smart_pull` against `vault_dir`, using `executor` to talk to the
/// remote and `state` as the last-observed sync metadata (mutated in
/// place on success).
pub fn smart_pull(
    config: &SyncConfig,
    executor: &dyn CommandExecutor,
    vault_dir: &Path,
    vault_path: &Path,
    state: &mut Option<SyncState>,
) -> Result<SyncOutcome, SyncError> {
    let Some(remote_path) = (if config.enabled { config.remote_path.as_deref() } else { None }) else {
        return Ok(SyncOutcome::NoOp);
    };

    let listing = list_remote(executor, remote_path)?;
    let Some(remote_vault) = listing.iter().find(|e| !e.is_dir && e.name == vault_file_name(vault_path)) else {
        return Ok(SyncOutcome::NoOp);
    };

    if let Some(existing) = state {
        if existing.remote_mod_time == remote_vault.mtime && existing.remote_size == remote_vault.size {
            return Ok(SyncOutcome::Unchanged);
        }

        if vault_path.is_file() {
            let local_hash = hash_file(vault_path).map_err(|e| SyncError::Unavailable(e.to_string()))?;
            if local_hash != existing.last_push_hash {
                return Ok(SyncOutcome::Conflict);
            }
        }
    }

    copy_remote_to_local(executor, remote_path, vault_dir)?;

    let new_state = SyncState {
        last_push_hash: state.as_ref().map(|s| s.last_push_hash.clone()).unwrap_or_default(),
        last_push_time: state.as_ref().map(|s| s.last_push_time).unwrap_or_else(Utc::now),
        remote_mod_time: remote_vault.mtime,
        remote_size: remote_vault.size,
    };
    *state = Some(new_state);

    Ok(SyncOutcome::Synced)
}

/// Runs `smart_push` after a successful local save.
pub fn smart_push(
    config: &SyncConfig,
    executor: &dyn CommandExecutor,
    vault_dir: &Path,
    vault_path: &Path,
    state: &mut Option<SyncState>,
) -> Result<SyncOutcome, SyncError> {
    let Some(remote_path) = (if config.enabled { config.remote_path.as_deref() } else { None }) else {
        return Ok(SyncOutcome::NoOp);
    };

    let local_hash = hash_file(vault_path).map_err(|e| SyncError::Unavailable(e.to_string()))?;
    if let Some(existing) = state {
        if existing.last_push_hash == local_hash {
            return Ok(SyncOutcome::Unchanged);
        }
    }

    copy_local_to_remote(executor, vault_dir, remote_path)?;

    let listing = list_remote(executor, remote_path)?;
    let remote_vault = listing
        .iter()
        .find(|e| !e.is_dir && e.name == vault_file_name(vault_path))
        .ok_or_else(|| SyncError::Unavailable("remote listing missing vault after push".to_string()))?;

    *state = Some(SyncState {
        last_push_hash: local_hash,
        last_push_time: Utc::now(),
        remote_mod_time: remote_vault.mtime,
        remote_size: remote_vault.size,
    });

    Ok(SyncOutcome::Synced)
}

fn vault_file_name(vault_path: &Path) -> String {
    vault_path.file_name().and_then(|n| n.to_str()).unwrap_or("vault").to_string()
}

fn list_remote(executor: &dyn CommandExecutor, remote_path: &str) -> Result<Vec<RemoteEntry>, SyncError> {
    let output = executor.run("rclone", &["lsjson", remote_path]).map_err(SyncError::Unavailable)?;
    serde_json::from_slice(&output)
        .map_err(|e| SyncError::Unavailable(format!("malformed remote listing: {e}")))
}

fn copy_remote_to_local(executor: &dyn CommandExecutor, remote_path: &str, vault_dir: &Path) -> Result<(), SyncError> {
    let local = vault_dir.to_string_lossy().into_owned();
    executor
        .run_no_output("rclone", &["copy", remote_path, &local, "--exclude", ".sync-state"])
        .map_err(SyncError::Unavailable)
}

fn copy_local_to_remote(executor: &dyn CommandExecutor, vault_dir: &Path, remote_path: &str) -> Result<(), SyncError> {
    let local = vault_dir.to_string_lossy().into_owned();
    executor
        .run_no_output("rclone", &["copy", &local, remote_path, "--exclude", ".sync-state"])
        .map_err(SyncError::Unavailable)
}

fn hash_file(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Loads `.sync-state` next to the vault, if present.
pub fn load_state(vault_dir: &Path) -> Result<Option<SyncState>, SyncError> {
    let path = vault_dir.join(".sync-state");
    if !path.is_file() {
        return Ok(None);
    }
    let bytes = std::fs::read(&path).map_err(|e| SyncError::Unavailable(e.to_string()))?;
    let state = serde_json::from_slice(&bytes)
        .map_err(|e| SyncError::Unavailable(format!("malformed sync state: {e}")))?;
    Ok(Some(state))
}

/// Persists `.sync-state` next to the vault. Never pushed to the remote.
pub fn save_state(vault_dir: &Path, state: &SyncState) -> Result<(), SyncError> {
    let path = vault_dir.join(".sync-state");
    let bytes = serde_json::to_vec_pretty(state).map_err(|e| SyncError::Unavailable(e.to_string()))?;
    std::fs::write(&path, bytes).map_err(|e| SyncError::Unavailable(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use tempfile::TempDir;

    struct FakeExecutor {
        listing: Vec<u8>,
        copy_calls: RefCell<Vec<Vec<String>>>,
    }

    impl CommandExecutor for FakeExecutor {
        fn run(&self, _name: &str, _args: &[&str]) -> Result<Vec<u8>, String> {
            Ok(self.listing.clone())
        }

        fn run_no_output(&self, _name: &str, args: &[&str]) -> Result<(), String> {
            self.copy_calls.borrow_mut().push(args.iter().map(|s| s.to_string()).collect());
            Ok(())
        }
    }

    #[test]
    fn smart_pull_is_noop_when_disabled() {
        let dir = TempDir::new().expect("tempdir");
        let vault_path = dir.path().join("vault.dat");
        let config = SyncConfig { enabled: false, remote_path: Some("remote:vault".to_string()) };
        let executor = FakeExecutor { listing: b"[]".to_vec(), copy_calls: RefCell::new(Vec::new()) };
        let mut state = None;
        let outcome = smart_pull(&config, &executor, dir.path(), &vault_path, &mut state).expect("pull");
        assert_eq!(outcome, SyncOutcome::NoOp);
    }

    #[test]
    fn smart_pull_returns_unchanged_when_remote_metadata_matches() {
        let dir = TempDir::new().expect("tempdir");
        let vault_path = dir.path().join("vault.dat");
        std::fs::write(&vault_path, b"vault bytes").expect("write");

        let mtime = Utc::now();
        let listing = format!(
            r#"[{{"name":"vault.dat","size":11,"mtime":"{}","is_dir":false}}]"#,
            mtime.to_rfc3339()
        );
        let config = SyncConfig { enabled: true, remote_path: Some("remote:vault".to_string()) };
        let executor = FakeExecutor { listing: listing.into_bytes(), copy_calls: RefCell::new(Vec::new()) };
        let mut state = Some(SyncState {
            last_push_hash: hash_file(&vault_path).expect("hash"),
            last_push_time: mtime,
            remote_mod_time: mtime,
            remote_size: 11,
        });
        let outcome = smart_pull(&config, &executor, dir.path(), &vault_path, &mut state).expect("pull");
        assert_eq!(outcome, SyncOutcome::Unchanged);
        assert!(executor.copy_calls.borrow().is_empty());
    }

    #[test]
    fn smart_pull_detects_conflict_on_local_divergence() {
        let dir = TempDir::new().expect("tempdir");
        let vault_path = dir.path().join("vault.dat");
        std::fs::write(&vault_path, b"changed locally").expect("write");

        let old_mtime = Utc::now() - chrono::Duration::hours(1);
        let new_mtime = Utc::now();
        let listing = format!(
            r#"[{{"name":"vault.dat","size":99,"mtime":"{}","is_dir":false}}]"#,
            new_mtime.to_rfc3339()
        );
        let config = SyncConfig { enabled: true, remote_path: Some("remote:vault".to_string()) };
        let executor = FakeExecutor { listing: listing.into_bytes(), copy_calls: RefCell::new(Vec::new()) };
        let mut state = Some(SyncState {
            last_push_hash: "0000".repeat(16),
            last_push_time: old_mtime,
            remote_mod_time: old_mtime,
            remote_size: 50,
        });
        let outcome = smart_pull(&config, &executor, dir.path(), &vault_path, &mut state).expect("pull");
        assert_eq!(outcome, SyncOutcome::Conflict);
    }

    #[test]
    fn smart_push_skips_when_hash_unchanged() {
        let dir = TempDir::new().expect("tempdir");
        let vault_path = dir.path().join("vault.dat");
        std::fs::write(&vault_path, b"stable contents").expect("write");
        let hash = hash_file(&vault_path).expect("hash");

        let config = SyncConfig { enabled: true, remote_path: Some("remote:vault".to_string()) };
        let executor = FakeExecutor { listing: b"[]".to_vec(), copy_calls: RefCell::new(Vec::new()) };
        let mut state =
            Some(SyncState { last_push_hash: hash, last_push_time: Utc::now(), remote_mod_time: Utc::now(), remote_size: 15 });
        let outcome = smart_push(&config, &executor, dir.path(), &vault_path, &mut state).expect("push");
        assert_eq!(outcome, SyncOutcome::Unchanged);
        assert!(executor.copy_calls.borrow().is_empty());
    }
}
