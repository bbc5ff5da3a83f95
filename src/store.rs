//! On-disk envelope format and atomic write protocol (§4.4).
//!
//! The store never decrypts the payload; it only persists and rotates
//! bytes. Verification that a given key can open the payload is supplied
//! by the caller as a callback, since only the vault service knows the
//! current key.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::crypto;
use crate::error::StoreError;
use crate::model::VaultMetadata;

const MAGIC: &[u8; 4] = b"VLT1";
const FORMAT_VERSION: u16 = 1;

/// Everything read back from a vault file: the parsed header plus the
/// still-encrypted payload (nonce + ciphertext + tag, undifferentiated).
pub struct VaultFile {
    pub metadata: VaultMetadata,
    pub payload: Vec<u8>,
}

/// `true` iff a regular file exists at `path`.
pub fn exists(path: &Path) -> bool {
    path.is_file()
}

/// Reads and parses a vault file. Fails with
/// [`StoreError::Corrupted`] on a short read, bad magic, or version
/// mismatch; with [`StoreError::Absent`] if the file does not exist.
pub fn read(path: &Path) -> Result<VaultFile, StoreError> {
    if !path.is_file() {
        return Err(StoreError::Absent);
    }
    let mut buf = Vec::new();
    File::open(path)?.read_to_end(&mut buf)?;
    parse(&buf)
}

/// Reads the vault at `path`, falling back to `<basename>.backup` if the
/// primary is missing, corrupted, or fails `validate` (§4.4: "readers
/// first try the primary path; if it is missing or fails to
/// authenticate, they try `.backup`"). `validate` should attempt whatever
/// authentication the caller needs (e.g. unwrapping the master key) and
/// report `true` only on success; it may be called against both files.
///
/// On total failure, returns the primary's own read result so existing
/// per-file error handling (absent vs. corrupted vs. authentication
/// failure) still applies to callers that don't care about the backup.
pub fn read_with_backup_fallback(
    path: &Path,
    validate: impl Fn(&VaultFile) -> bool,
) -> Result<VaultFile, StoreError> {
    let primary = read(path);
    if let Ok(vault_file) = &primary {
        if validate(vault_file) {
            return primary;
        }
    }

    if let Ok(vault_file) = read(&backup_path_for(path)) {
        if validate(&vault_file) {
            return Ok(vault_file);
        }
    }

    primary
}

fn backup_path_for(path: &Path) -> PathBuf {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let basename = path.file_name().and_then(|n| n.to_str()).unwrap_or("vault");
    dir.join(format!("{basename}.backup"))
}

fn parse(buf: &[u8]) -> Result<VaultFile, StoreError> {
    if buf.len() < 4 + 2 + 4 {
        return Err(StoreError::Corrupted("file too short for header".to_string()));
    }
    if &buf[0..4] != MAGIC {
        return Err(StoreError::Corrupted("bad magic".to_string()));
    }
    let version = u16::from_be_bytes([buf[4], buf[5]]);
    if version != FORMAT_VERSION {
        return Err(StoreError::Corrupted(format!("unsupported format version {version}")));
    }
    let metadata_len = u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]) as usize;
    let metadata_start = 10;
    let metadata_end = metadata_start
        .checked_add(metadata_len)
        .ok_or_else(|| StoreError::Corrupted("metadata length overflow".to_string()))?;
    if buf.len() < metadata_end {
        return Err(StoreError::Corrupted("truncated metadata".to_string()));
    }
    let metadata: VaultMetadata = serde_json::from_slice(&buf[metadata_start..metadata_end])
        .map_err(|e| StoreError::Corrupted(format!("malformed metadata json: {e}")))?;
    let payload = buf[metadata_end..].to_vec();
    if payload.len() < 12 + 16 {
        return Err(StoreError::Corrupted("payload too short for nonce and tag".to_string()));
    }
    Ok(VaultFile { metadata, payload })
}

fn serialize(metadata: &VaultMetadata, payload: &[u8]) -> Result<Vec<u8>, StoreError> {
    let metadata_json =
        serde_json::to_vec(metadata).map_err(|e| StoreError::Corrupted(format!("metadata serialize: {e}")))?;
    let metadata_len: u32 = metadata_json
        .len()
        .try_into()
        .map_err(|_| StoreError::Corrupted("metadata too large".to_string()))?;
    let mut buf = Vec::with_capacity(10 + metadata_json.len() + payload.len());
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
    buf.extend_from_slice(&metadata_len.to_be_bytes());
    buf.extend_from_slice(&metadata_json);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Writes `metadata` + `payload` to `path` through the atomic-write
/// protocol (§4.4): temp file → fsync → caller verification → rotate
/// `.backup` → rename → fsync directory.
///
/// `verify` receives the bytes just written and must return `true` iff
/// they can be opened with the current key; on `false` the temp file is
/// discarded and the vault on disk is left untouched.
pub fn write_atomic(
    path: &Path,
    metadata: &VaultMetadata,
    payload: &[u8],
    verify: impl FnOnce(&VaultFile) -> bool,
) -> Result<(), StoreError> {
    let buf = serialize(metadata, payload)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let basename = path.file_name().and_then(|n| n.to_str()).unwrap_or("vault");

    let temp_path = dir.join(format!("{basename}.tmp.{}", temp_suffix()));
    {
        let mut temp_file = {
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                OpenOptions::new().write(true).create_new(true).mode(0o600).open(&temp_path)?
            }
            #[cfg(not(unix))]
            {
                OpenOptions::new().write(true).create_new(true).open(&temp_path)?
            }
        };
        temp_file.write_all(&buf)?;
        temp_file.flush()?;
        temp_file.sync_all()?;
    }
    tracing::debug!(temp_path = %temp_path.display(), "vault temp file written and fsynced");

    let verify_result = {
        let mut reread = Vec::new();
        File::open(&temp_path)?.read_to_end(&mut reread)?;
        match parse(&reread) {
            Ok(vault_file) => verify(&vault_file),
            Err(_) => false,
        }
    };
    if !verify_result {
        let _ = fs::remove_file(&temp_path);
        tracing::warn!(path = %path.display(), "vault write verification failed, vault on disk unchanged");
        return Err(StoreError::VerificationFailed);
    }

    if path.is_file() {
        fs::rename(path, backup_path_for(path))?;
        tracing::debug!(path = %path.display(), "previous vault rotated into backup");
    }
    fs::rename(&temp_path, path)?;
    sync_directory(dir)?;

    tracing::debug!(path = %path.display(), "vault write committed");
    Ok(())
}

#[cfg(unix)]
fn sync_directory(dir: &Path) -> Result<(), StoreError> {
    let dir_handle = File::open(dir)?;
    dir_handle.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_directory(_dir: &Path) -> Result<(), StoreError> {
    Ok(())
}

fn temp_suffix() -> String {
    let stamp = Utc::now().format("%Y%m%d-%H%M%S");
    let random = hex::encode(crypto::csprng_bytes(4));
    format!("{stamp}.{random}")
}

/// Removes any `<dir>/*.tmp.*` files left behind by an interrupted save.
pub fn cleanup_temps(dir: &Path) -> Result<usize, StoreError> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.contains(".tmp.") {
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// One row of [`list_backups`] output.
pub struct BackupInfo {
    pub path: PathBuf,
    pub age_seconds: i64,
    pub size_bytes: u64,
    pub integrity_ok: bool,
}

/// Enumerates `.backup` and `.manual.backup` files next to vaults in
/// `dir`, reporting age, size, and whether the header parses cleanly.
pub fn list_backups(dir: &Path) -> Result<Vec<BackupInfo>, StoreError> {
    let mut backups = Vec::new();
    let now = Utc::now();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !(name.ends_with(".backup") || name.contains(".manual.backup")) {
            continue;
        }
        let metadata = entry.metadata()?;
        let modified: chrono::DateTime<Utc> = metadata.modified()?.into();
        let integrity_ok = read(&entry.path()).is_ok();
        backups.push(BackupInfo {
            path: entry.path(),
            age_seconds: (now - modified).num_seconds().max(0),
            size_bytes: metadata.len(),
            integrity_ok,
        });
    }
    Ok(backups)
}

/// Copies the current vault to a timestamped manual backup, preserving
/// permissions.
pub fn create_manual_backup(path: &Path) -> Result<PathBuf, StoreError> {
    if !path.is_file() {
        return Err(StoreError::Absent);
    }
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let basename = path.file_name().and_then(|n| n.to_str()).unwrap_or("vault");
    let stamp = Utc::now().format("%Y%m%d-%H%M%S");
    let backup_path = dir.join(format!("{basename}.{stamp}.manual.backup"));
    fs::copy(path, &backup_path)?;
    Ok(backup_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MasterKdfParams, SealedBlob};
    use tempfile::TempDir;

    fn sample_metadata() -> VaultMetadata {
        let now = Utc::now();
        VaultMetadata {
            format_version: FORMAT_VERSION,
            master_kdf: MasterKdfParams {
                algorithm: "pbkdf2-sha256".to_string(),
                iterations: 600_000,
                salt: [1u8; 32],
                output_len: 32,
            },
            vault_salt: [2u8; 32],
            master_key_wrap: SealedBlob { nonce: [3u8; 12], ciphertext: vec![4u8; 48] },
            audit_enabled: false,
            audit_kdf_salt: None,
            recovery: None,
            created_at: now,
            last_save_at: now,
        }
    }

    #[test]
    fn write_then_read_roundtrips_metadata_and_payload() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("vault.dat");
        let metadata = sample_metadata();
        let payload = vec![9u8; 12 + 16 + 5];

        write_atomic(&path, &metadata, &payload, |_| true).expect("write");
        let read_back = read(&path).expect("read");
        assert_eq!(read_back.payload, payload);
        assert_eq!(read_back.metadata.master_kdf.iterations, 600_000);
    }

    #[test]
    fn failed_verification_leaves_existing_vault_untouched() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("vault.dat");
        let metadata = sample_metadata();
        let first_payload = vec![1u8; 28];
        write_atomic(&path, &metadata, &first_payload, |_| true).expect("first write");

        let second_payload = vec![2u8; 28];
        let result = write_atomic(&path, &metadata, &second_payload, |_| false);
        assert!(matches!(result, Err(StoreError::VerificationFailed)));

        let still_there = read(&path).expect("read");
        assert_eq!(still_there.payload, first_payload);
    }

    #[test]
    fn second_write_rotates_previous_into_backup() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("vault.dat");
        let metadata = sample_metadata();
        write_atomic(&path, &metadata, &vec![1u8; 28], |_| true).expect("first");
        write_atomic(&path, &metadata, &vec![2u8; 28], |_| true).expect("second");

        let backup_path = dir.path().join("vault.dat.backup");
        assert!(backup_path.is_file());
        let backup = read(&backup_path).expect("read backup");
        assert_eq!(backup.payload, vec![1u8; 28]);
    }

    #[test]
    fn read_rejects_bad_magic() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("vault.dat");
        fs::write(&path, b"XXXX\x00\x01\x00\x00\x00\x00").expect("write garbage");
        assert!(matches!(read(&path), Err(StoreError::Corrupted(_))));
    }

    #[test]
    fn read_with_backup_fallback_uses_backup_when_primary_absent() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("vault.dat");
        let metadata = sample_metadata();
        write_atomic(&path, &metadata, &vec![1u8; 28], |_| true).expect("first");
        write_atomic(&path, &metadata, &vec![2u8; 28], |_| true).expect("second, rotates backup");

        fs::remove_file(&path).expect("remove primary");
        let found = read_with_backup_fallback(&path, |_| true).expect("fallback to backup");
        assert_eq!(found.payload, vec![1u8; 28]);
    }

    #[test]
    fn read_with_backup_fallback_returns_primary_error_when_both_fail_validation() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("vault.dat");
        let metadata = sample_metadata();
        write_atomic(&path, &metadata, &vec![1u8; 28], |_| true).expect("write");

        let found = read_with_backup_fallback(&path, |_| false);
        assert_eq!(found.expect("primary still returned despite failing validate").payload, vec![1u8; 28]);
    }

    #[test]
    fn cleanup_temps_removes_orphaned_files() {
        let dir = TempDir::new().expect("tempdir");
        fs::write(dir.path().join("vault.dat.tmp.20260101-000000.ab12"), b"orphan").expect("write");
        fs::write(dir.path().join("vault.dat"), b"not orphan").expect("write");
        let removed = cleanup_temps(dir.path()).expect("cleanup");
        assert_eq!(removed, 1);
        assert!(dir.path().join("vault.dat").is_file());
    }
}
