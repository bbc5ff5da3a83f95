//! The top-level state machine and the only component holding plaintext
//! credentials in memory (§4.5).
//!
//! States: Absent → Locked → Unlocked → Locked. A single [`RwLock`]
//! protects the credential map, lock-state, unlock-attempt counters, and
//! conflict flag together, matching the concurrency model in §5: reads
//! (`list`, `get` without usage update) can share the lock, every mutation
//! takes it exclusively.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use zeroize::Zeroizing;

use crate::audit::AuditLog;
use crate::crypto;
use crate::error::{PolicyRule, VaultError};
use crate::model::{
    AuditOutcome, Credential, CredentialMap, Field, MasterKdfParams, RecoveryMetadata, SealedBlob, UsageRecord,
    VaultMetadata,
};
use crate::recovery;
use crate::store;
use crate::sync::{self, CommandExecutor, SyncConfig, SyncOutcome};

const AUDIT_LOG_FILE_NAME: &str = "audit.log";
const MAX_FAILURES_BEFORE_BACKOFF: u32 = 5;
const BACKOFF_CAP_SECS: u64 = 30;

/// Minimum password length enforced by the policy (§7).
pub const MIN_PASSWORD_LENGTH: usize = 12;

/// Checks a candidate master password against the policy in §7, returning
/// every violated rule so the caller can show an actionable message.
pub fn check_password_policy(password: &str) -> Result<(), VaultError> {
    let mut violations = Vec::new();
    if password.chars().count() < MIN_PASSWORD_LENGTH {
        violations.push(PolicyRule::MinLength);
    }
    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        violations.push(PolicyRule::MissingUpper);
    }
    if !password.chars().any(|c| c.is_ascii_lowercase()) {
        violations.push(PolicyRule::MissingLower);
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        violations.push(PolicyRule::MissingDigit);
    }
    if !password.chars().any(|c| c.is_ascii_punctuation()) {
        violations.push(PolicyRule::MissingSpecial);
    }
    if violations.is_empty() {
        Ok(())
    } else {
        Err(VaultError::WeakPassword(violations))
    }
}

/// Rolling-window rate limiter for unlock attempts (§4.5). Tracks failures
/// within the last 60 seconds and escalates the required delay once 5
/// have accumulated. Per-process only, never persisted.
struct UnlockAttemptLimiter {
    recent_failures: VecDeque<Instant>,
    locked_out_until: Option<Instant>,
}

impl UnlockAttemptLimiter {
    fn new() -> Self {
        Self { recent_failures: VecDeque::new(), locked_out_until: None }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&front) = self.recent_failures.front() {
            if now.duration_since(front) > Duration::from_secs(60) {
                self.recent_failures.pop_front();
            } else {
                break;
            }
        }
    }

    /// Returns `Err(seconds_remaining)` if a caller must wait before the
    /// next attempt is accepted.
    fn check(&mut self, now: Instant) -> Result<(), u64> {
        if let Some(until) = self.locked_out_until {
            if now < until {
                return Err((until - now).as_secs().max(1));
            }
            self.locked_out_until = None;
        }
        Ok(())
    }

    fn record_failure(&mut self, now: Instant) {
        self.prune(now);
        self.recent_failures.push_back(now);
        let count = self.recent_failures.len() as u32;
        if count >= MAX_FAILURES_BEFORE_BACKOFF {
            let exponent = count - MAX_FAILURES_BEFORE_BACKOFF;
            let delay_secs = 2u64.saturating_pow(exponent).min(BACKOFF_CAP_SECS);
            self.locked_out_until = Some(now + Duration::from_secs(delay_secs));
        }
    }

    fn record_success(&mut self) {
        self.recent_failures.clear();
        self.locked_out_until = None;
    }
}

/// In-memory material available only while [`LockState::Unlocked`].
struct UnlockedState {
    master_key: Zeroizing<[u8; 32]>,
    payload_key: Zeroizing<[u8; 32]>,
    credentials: CredentialMap,
}

enum LockState {
    Locked,
    Unlocked(UnlockedState),
}

/// Tunables passed in at construction (§2.3: the core takes configuration
/// as explicit arguments rather than loading a config file itself).
pub struct ServiceConfig {
    pub vault_path: PathBuf,
    pub sync: SyncConfig,
}

/// The vault service: the only component that ever holds plaintext
/// credentials.
pub struct VaultService {
    config: ServiceConfig,
    state: RwLock<LockState>,
    metadata: RwLock<Option<VaultMetadata>>,
    audit: Mutex<Option<AuditLog>>,
    audit_degraded: RwLock<bool>,
    limiter: Mutex<UnlockAttemptLimiter>,
    conflicted: RwLock<bool>,
    executor: Option<Box<dyn CommandExecutor + Send + Sync>>,
    /// Set on every unlock and mutation, cleared on `lock()`. Backs
    /// `seconds_since_last_activity`/`lock_if_idle`; this crate does not
    /// own a polling thread itself (§3 "Auto-lock / inactivity tracking").
    last_activity: Mutex<Option<Instant>>,
}

impl VaultService {
    pub fn new(config: ServiceConfig, executor: Option<Box<dyn CommandExecutor + Send + Sync>>) -> Self {
        Self {
            config,
            state: RwLock::new(LockState::Locked),
            metadata: RwLock::new(None),
            audit: Mutex::new(None),
            audit_degraded: RwLock::new(false),
            limiter: Mutex::new(UnlockAttemptLimiter::new()),
            conflicted: RwLock::new(false),
            executor,
            last_activity: Mutex::new(None),
        }
    }

    fn touch_activity(&self) {
        *self.last_activity.lock().expect("lock poisoned") = Some(Instant::now());
    }

    /// Seconds since the vault was last unlocked or mutated, or `None` if
    /// currently locked.
    pub fn seconds_since_last_activity(&self) -> Option<u64> {
        if !self.is_unlocked() {
            return None;
        }
        self.last_activity.lock().expect("lock poisoned").map(|instant| instant.elapsed().as_secs())
    }

    /// Locks the vault if it has been idle for at least `idle_timeout`.
    /// Returns `true` if a lock was performed. The caller owns the
    /// timer/thread that invokes this periodically; this crate never
    /// spawns one itself.
    pub fn lock_if_idle(&self, idle_timeout: Duration) -> bool {
        match self.seconds_since_last_activity() {
            Some(idle_secs) if idle_secs >= idle_timeout.as_secs() => {
                self.lock();
                true
            }
            _ => false,
        }
    }

    fn vault_dir(&self) -> PathBuf {
        self.config.vault_path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf()
    }

    fn audit_log_path(&self) -> PathBuf {
        self.vault_dir().join(AUDIT_LOG_FILE_NAME)
    }

    pub fn is_unlocked(&self) -> bool {
        matches!(*self.state.read().expect("lock poisoned"), LockState::Unlocked(_))
    }

    pub fn is_conflicted(&self) -> bool {
        *self.conflicted.read().expect("lock poisoned")
    }

    /// `true` once an audit append or chain-open has failed (§7:
    /// `audit-append-failed` and `audit-chain-broken` are both surfaced
    /// as warnings rather than failing the mutation that triggered them).
    pub fn is_audit_degraded(&self) -> bool {
        *self.audit_degraded.read().expect("lock poisoned")
    }

    /// Verifies the audit chain independent of vault unlock, given only
    /// the master password and the vault file (§6 "audit-verify function").
    pub fn verify_audit_log(&self, master_password: &str) -> Result<u64, VaultError> {
        let vault_file = store::read(&self.config.vault_path)?;
        if !vault_file.metadata.audit_enabled {
            return Ok(0);
        }
        let salt = vault_file
            .metadata
            .audit_kdf_salt
            .ok_or_else(|| VaultError::MetadataCorrupted("audit enabled but no salt recorded".to_string()))?;
        let key = crate::audit::derive_audit_key(master_password.as_bytes(), &salt)?;
        let log = AuditLog::open(&self.audit_log_path(), key)?;
        Ok(log.verify()?)
    }

    /// Enumerates automatic and manual backups next to the vault (§6
    /// "backup-list function").
    pub fn list_backups(&self) -> Result<Vec<store::BackupInfo>, VaultError> {
        Ok(store::list_backups(&self.vault_dir())?)
    }

    /// Copies the current vault to a timestamped manual backup.
    pub fn create_manual_backup(&self) -> Result<PathBuf, VaultError> {
        Ok(store::create_manual_backup(&self.config.vault_path)?)
    }

    /// `initialize(master_password, enable_audit, enable_recovery, recovery_passphrase)`.
    /// Valid only in Absent. Post: Unlocked.
    pub fn initialize(
        &self,
        master_password: &str,
        enable_audit: bool,
        enable_recovery: bool,
        recovery_passphrase: Option<&str>,
    ) -> Result<Option<String>, VaultError> {
        if store::exists(&self.config.vault_path) {
            return Err(VaultError::AlreadyInitialized);
        }
        check_password_policy(master_password)?;

        let now = Utc::now();
        let master_salt = crypto::generate_salt32();
        let vault_salt = crypto::generate_salt32();
        let payload_key = crypto::generate_salt32();

        let master_key = crypto::derive_master_key(
            master_password.as_bytes(),
            &master_salt,
            crypto::DEFAULT_PBKDF2_ITERATIONS,
        );
        let wrap_key = crypto::derive_payload_wrap_key(&master_key, &vault_salt);
        let master_wrap_nonce = crypto::generate_nonce();
        let master_key_wrap_ciphertext = crypto::aes_gcm_seal(&wrap_key, &payload_key, &master_wrap_nonce)?;

        let empty_map = CredentialMap::new();
        let payload_json = serde_json::to_vec(&empty_map)
            .map_err(|e| VaultError::MetadataCorrupted(e.to_string()))?;
        let payload_nonce = crypto::generate_nonce();
        let payload_ciphertext = crypto::aes_gcm_seal(&payload_key, &payload_json, &payload_nonce)?;
        let mut payload_bytes = payload_nonce.to_vec();
        payload_bytes.extend_from_slice(&payload_ciphertext);

        let mut audit_kdf_salt = None;
        let mut audit_log = None;
        if enable_audit {
            let salt = crypto::generate_salt32();
            let audit_key = crate::audit::derive_audit_key(master_password.as_bytes(), &salt)?;
            let log = AuditLog::open(&self.audit_log_path(), audit_key)?;
            audit_kdf_salt = Some(salt);
            audit_log = Some(log);
        }

        let mut recovery_metadata: Option<RecoveryMetadata> = None;
        let mut mnemonic = None;
        if enable_recovery {
            let setup = recovery::setup(recovery_passphrase.unwrap_or(""), &payload_key)?;
            recovery_metadata = Some(setup.metadata);
            mnemonic = Some(setup.mnemonic);
        }

        let metadata = VaultMetadata {
            format_version: 1,
            master_kdf: MasterKdfParams {
                algorithm: "pbkdf2-sha256".to_string(),
                iterations: crypto::DEFAULT_PBKDF2_ITERATIONS,
                salt: master_salt,
                output_len: 32,
            },
            vault_salt,
            master_key_wrap: SealedBlob { nonce: master_wrap_nonce, ciphertext: master_key_wrap_ciphertext },
            audit_enabled: enable_audit,
            audit_kdf_salt,
            recovery: recovery_metadata,
            created_at: now,
            last_save_at: now,
        };

        store::write_atomic(&self.config.vault_path, &metadata, &payload_bytes, |vault_file| {
            crypto::aes_gcm_open(&payload_key, &payload_ciphertext, &payload_nonce).is_ok()
                && vault_file.payload == payload_bytes
        })?;

        *self.metadata.write().expect("lock poisoned") = Some(metadata);
        *self.state.write().expect("lock poisoned") = LockState::Unlocked(UnlockedState {
            master_key: Zeroizing::new(master_key),
            payload_key: Zeroizing::new(payload_key),
            credentials: empty_map,
        });
        if let Some(log) = audit_log {
            *self.audit.lock().expect("lock poisoned") = Some(log);
        }
        self.touch_activity();
        self.record_audit("initialize", AuditOutcome::Success, None);
        tracing::info!(path = %self.config.vault_path.display(), "vault initialized and unlocked");

        Ok(mnemonic)
    }

    /// `unlock(master_password)`. Valid in Locked. Post: Unlocked on success.
    pub fn unlock(&self, master_password: &str) -> Result<(), VaultError> {
        if self.is_unlocked() {
            return Ok(());
        }

        {
            let mut limiter = self.limiter.lock().expect("lock poisoned");
            if let Err(remaining) = limiter.check(Instant::now()) {
                return Err(VaultError::RateLimited(remaining));
            }
        }

        if self.config.sync.enabled {
            if let Some(executor) = self.executor.as_deref() {
                let mut state = sync::load_state(&self.vault_dir()).unwrap_or(None);
                match sync::smart_pull(
                    &self.config.sync,
                    executor,
                    &self.vault_dir(),
                    &self.config.vault_path,
                    &mut state,
                ) {
                    Ok(SyncOutcome::Conflict) => {
                        *self.conflicted.write().expect("lock poisoned") = true;
                        tracing::warn!(path = %self.config.vault_path.display(), "sync conflict detected");
                    }
                    Ok(_) => {
                        if let Some(state) = &state {
                            let _ = sync::save_state(&self.vault_dir(), state);
                        }
                    }
                    Err(_) => {}
                }
            }
        }

        // Falls back to `.backup` if the primary file is missing,
        // corrupted, or doesn't authenticate under this password — a
        // crash can leave only the backup on disk (§4.4).
        let vault_file = store::read_with_backup_fallback(&self.config.vault_path, |candidate| {
            try_unlock_vault_file(master_password, candidate).is_some()
        })?;
        let candidate_master_key = crypto::derive_master_key(
            master_password.as_bytes(),
            &vault_file.metadata.master_kdf.salt,
            vault_file.metadata.master_kdf.iterations,
        );
        let wrap_key = crypto::derive_payload_wrap_key(&candidate_master_key, &vault_file.metadata.vault_salt);

        let payload_key_result = crypto::aes_gcm_open(
            &wrap_key,
            &vault_file.metadata.master_key_wrap.ciphertext,
            &vault_file.metadata.master_key_wrap.nonce,
        );
        let payload_key = match payload_key_result {
            Ok(bytes) => bytes,
            Err(_) => {
                // Cannot append a `failure` record here: the audit key is
                // itself derived from the master password, so a wrong
                // password cannot produce a valid chain continuation.
                self.limiter.lock().expect("lock poisoned").record_failure(Instant::now());
                return Err(VaultError::AuthenticationFailed);
            }
        };
        let payload_key: [u8; 32] =
            payload_key.try_into().map_err(|_| VaultError::MetadataCorrupted("payload key wrong length".to_string()))?;

        if vault_file.payload.len() < 12 {
            return Err(VaultError::CorruptedEnvelope("payload shorter than nonce".to_string()));
        }
        let (nonce_bytes, ciphertext) = vault_file.payload.split_at(12);
        let nonce: [u8; 12] = nonce_bytes.try_into().expect("checked length above");

        let plaintext = match crypto::aes_gcm_open(&payload_key, ciphertext, &nonce) {
            Ok(p) => p,
            Err(_) => {
                // The master key unwrapped correctly but the payload itself
                // didn't authenticate — this is envelope corruption, not a
                // wrong password, so the audit key derivation is valid here.
                self.ensure_audit_open(master_password, &vault_file.metadata);
                self.limiter.lock().expect("lock poisoned").record_failure(Instant::now());
                self.record_audit("unlock", AuditOutcome::Failure, None);
                return Err(VaultError::AuthenticationFailed);
            }
        };
        let credentials: CredentialMap =
            serde_json::from_slice(&plaintext).map_err(|e| VaultError::CorruptedEnvelope(e.to_string()))?;

        self.ensure_audit_open(master_password, &vault_file.metadata);
        self.limiter.lock().expect("lock poisoned").record_success();

        *self.metadata.write().expect("lock poisoned") = Some(vault_file.metadata);
        *self.state.write().expect("lock poisoned") = LockState::Unlocked(UnlockedState {
            master_key: Zeroizing::new(candidate_master_key),
            payload_key: Zeroizing::new(payload_key),
            credentials,
        });
        self.touch_activity();

        self.record_audit("unlock", AuditOutcome::Success, None);
        tracing::info!(path = %self.config.vault_path.display(), "vault unlocked");

        let backup_path = self.vault_dir().join(format!(
            "{}.backup",
            self.config.vault_path.file_name().and_then(|n| n.to_str()).unwrap_or("vault")
        ));
        let _ = std::fs::remove_file(backup_path);

        Ok(())
    }

    fn ensure_audit_open(&self, master_password: &str, metadata: &VaultMetadata) {
        if !metadata.audit_enabled {
            return;
        }
        let Some(salt) = metadata.audit_kdf_salt else { return };
        let mut audit = self.audit.lock().expect("lock poisoned");
        if audit.is_some() {
            return;
        }
        match crate::audit::derive_audit_key(master_password.as_bytes(), &salt) {
            Ok(key) => match AuditLog::open(&self.audit_log_path(), key) {
                Ok(log) => *audit = Some(log),
                Err(_) => {
                    *self.audit_degraded.write().expect("lock poisoned") = true;
                    tracing::warn!("audit log failed to open, continuing in degraded mode");
                }
            },
            Err(_) => {
                *self.audit_degraded.write().expect("lock poisoned") = true;
                tracing::warn!("audit key derivation failed, continuing in degraded mode");
            }
        }
    }

    fn record_audit(&self, event: &str, outcome: AuditOutcome, credential: Option<String>) {
        let mut audit = self.audit.lock().expect("lock poisoned");
        if let Some(log) = audit.as_mut() {
            if log.append(event, outcome, credential, None, Utc::now()).is_err() {
                *self.audit_degraded.write().expect("lock poisoned") = true;
                tracing::warn!(event, "audit append failed, continuing in degraded mode");
            }
        }
    }

    /// `lock()`. Zeroizes the master key and every credential secret,
    /// drops the map. Idempotent.
    pub fn lock(&self) {
        let mut state = self.state.write().expect("lock poisoned");
        *state = LockState::Locked;
        *self.last_activity.lock().expect("lock poisoned") = None;
        tracing::info!(path = %self.config.vault_path.display(), "vault locked");
    }

    /// `change_password(current, new)`. Re-wraps the unchanged payload key
    /// under a freshly derived master key; the payload itself is never
    /// touched. Does not refresh the recovery wrap — the vault recovery
    /// key is not held in memory on this path, only during
    /// `recover_to_new_password`.
    pub fn change_password(&self, current: &str, new: &str) -> Result<(), VaultError> {
        check_password_policy(new)?;

        let mut state = self.state.write().expect("lock poisoned");
        let unlocked = match &*state {
            LockState::Unlocked(u) => u,
            LockState::Locked => return Err(VaultError::AuthenticationFailed),
        };

        let old_master_kdf = {
            let metadata_guard = self.metadata.read().expect("lock poisoned");
            let old_metadata = metadata_guard.as_ref().ok_or(VaultError::AbsentVault)?;
            old_metadata.master_kdf.clone()
        };
        let check_key = crypto::derive_master_key(current.as_bytes(), &old_master_kdf.salt, old_master_kdf.iterations);
        if !crypto::constant_time_eq(check_key.as_slice(), unlocked.master_key.as_slice()) {
            return Err(VaultError::AuthenticationFailed);
        }

        {
            let mut metadata_guard = self.metadata.write().expect("lock poisoned");
            let old_metadata = metadata_guard.as_ref().ok_or(VaultError::AbsentVault)?;

            let new_salt = crypto::generate_salt32();
            let new_master_key =
                crypto::derive_master_key(new.as_bytes(), &new_salt, crypto::DEFAULT_PBKDF2_ITERATIONS);
            let wrap_key = crypto::derive_payload_wrap_key(&new_master_key, &old_metadata.vault_salt);
            let wrap_nonce = crypto::generate_nonce();
            let wrap_ciphertext = crypto::aes_gcm_seal(&wrap_key, unlocked.payload_key.as_slice(), &wrap_nonce)?;

            let mut new_metadata = old_metadata.clone();
            new_metadata.master_kdf = MasterKdfParams {
                algorithm: "pbkdf2-sha256".to_string(),
                iterations: crypto::DEFAULT_PBKDF2_ITERATIONS,
                salt: new_salt,
                output_len: 32,
            };
            new_metadata.master_key_wrap = SealedBlob { nonce: wrap_nonce, ciphertext: wrap_ciphertext };
            new_metadata.last_save_at = Utc::now();

            let vault_file = store::read(&self.config.vault_path)?;
            let payload_key = *unlocked.payload_key;
            store::write_atomic(&self.config.vault_path, &new_metadata, &vault_file.payload, |candidate| {
                verify_master_key_unwraps_payload(candidate, &new_master_key, &payload_key)
            })?;

            if let LockState::Unlocked(u) = &mut *state {
                u.master_key = Zeroizing::new(new_master_key);
            }
            *metadata_guard = Some(new_metadata);
        }
        drop(state);

        self.record_audit("change_password", AuditOutcome::Success, None);
        Ok(())
    }

    /// `recover_to_new_password(challenge_words, passphrase, new_password)`.
    /// Valid whenever recovery metadata is present; does not require the
    /// vault to already be unlocked. Refreshes the recovery-slot payload
    /// key wrap (§9 Open Question resolution: the refresh point named in
    /// the spec is this recovery path, since only here is the vault
    /// recovery key available in memory).
    pub fn recover_to_new_password(
        &self,
        challenge_words: &[String],
        passphrase: &str,
        new_password: &str,
    ) -> Result<(), VaultError> {
        check_password_policy(new_password)?;

        let vault_file = store::read(&self.config.vault_path)?;
        let recovery_metadata = vault_file.metadata.recovery.clone().ok_or(VaultError::RecoveryDisabled)?;

        let vault_recovery_key = recovery::execute(challenge_words, passphrase, &recovery_metadata)?;
        let payload_key = recovery::unwrap_payload_key(&vault_recovery_key, &recovery_metadata)?;

        let new_salt = crypto::generate_salt32();
        let new_master_key =
            crypto::derive_master_key(new_password.as_bytes(), &new_salt, crypto::DEFAULT_PBKDF2_ITERATIONS);
        let wrap_key = crypto::derive_payload_wrap_key(&new_master_key, &vault_file.metadata.vault_salt);
        let wrap_nonce = crypto::generate_nonce();
        let wrap_ciphertext = crypto::aes_gcm_seal(&wrap_key, payload_key.as_slice(), &wrap_nonce)?;

        let refreshed_payload_key_wrap = recovery::rewrap_payload_key(&vault_recovery_key, &payload_key)?;

        let mut new_metadata = vault_file.metadata.clone();
        new_metadata.master_kdf = MasterKdfParams {
            algorithm: "pbkdf2-sha256".to_string(),
            iterations: crypto::DEFAULT_PBKDF2_ITERATIONS,
            salt: new_salt,
            output_len: 32,
        };
        new_metadata.master_key_wrap = SealedBlob { nonce: wrap_nonce, ciphertext: wrap_ciphertext };
        let mut refreshed_recovery = recovery_metadata;
        refreshed_recovery.payload_key_wrap = refreshed_payload_key_wrap;
        new_metadata.recovery = Some(refreshed_recovery);
        new_metadata.last_save_at = Utc::now();

        let payload_key_array: [u8; 32] = *payload_key;
        store::write_atomic(&self.config.vault_path, &new_metadata, &vault_file.payload, |candidate| {
            verify_master_key_unwraps_payload(candidate, &new_master_key, &payload_key_array)
        })?;

        self.record_audit("recover_to_new_password", AuditOutcome::Success, None);
        Ok(())
    }

    /// `add(service, username, password, url?, notes?, category?)`.
    pub fn add(
        &self,
        service: &str,
        username: &str,
        password: Vec<u8>,
        url: Option<String>,
        notes: Option<String>,
        category: Option<String>,
    ) -> Result<(), VaultError> {
        if service.is_empty() {
            return Err(VaultError::UnknownService(service.to_string()));
        }
        let mut state = self.state.write().expect("lock poisoned");
        let unlocked = match &mut *state {
            LockState::Unlocked(u) => u,
            LockState::Locked => return Err(VaultError::AuthenticationFailed),
        };
        if unlocked.credentials.contains_key(service) {
            return Err(VaultError::DuplicateService(service.to_string()));
        }
        let now = Utc::now();
        unlocked
            .credentials
            .insert(service.to_string(), Credential::new(service.to_string(), username.to_string(), password, url, notes, category, now));

        self.save_locked(&mut state)?;
        self.touch_activity();
        self.record_audit("add_credential", AuditOutcome::Success, Some(service.to_string()));
        Ok(())
    }

    /// `get(service, caller_cwd, caller_fields_read)`. Records usage and
    /// saves, per §4.5.
    pub fn get(&self, service: &str, caller_cwd: &Path, caller_fields_read: &[Field]) -> Result<Credential, VaultError> {
        let mut state = self.state.write().expect("lock poisoned");
        let unlocked = match &mut *state {
            LockState::Unlocked(u) => u,
            LockState::Locked => return Err(VaultError::AuthenticationFailed),
        };
        let credential = unlocked.credentials.get_mut(service).ok_or_else(|| VaultError::UnknownService(service.to_string()))?;

        let now = Utc::now();
        let location = caller_cwd.to_string_lossy().into_owned();
        let entry = credential.usage.entry(location.clone()).or_insert_with(|| {
            UsageRecord::new(location.clone(), detect_git_repository(caller_cwd), now)
        });
        entry.record_access(caller_fields_read, now);

        let result = credential.clone();
        self.save_locked(&mut state)?;
        self.touch_activity();
        self.record_audit("get_credential", AuditOutcome::Success, Some(service.to_string()));
        Ok(result)
    }

    /// `list(filter)`. Read-only; does not record usage or save.
    pub fn list(&self, filter: impl Fn(&Credential) -> bool) -> Result<Vec<Credential>, VaultError> {
        let state = self.state.read().expect("lock poisoned");
        let unlocked = match &*state {
            LockState::Unlocked(u) => u,
            LockState::Locked => return Err(VaultError::AuthenticationFailed),
        };
        Ok(unlocked.credentials.values().filter(|c| filter(c)).cloned().collect())
    }

    /// `update(service, fields)`. `update_fn` mutates the credential in place.
    pub fn update(&self, service: &str, update_fn: impl FnOnce(&mut Credential)) -> Result<(), VaultError> {
        let mut state = self.state.write().expect("lock poisoned");
        let unlocked = match &mut *state {
            LockState::Unlocked(u) => u,
            LockState::Locked => return Err(VaultError::AuthenticationFailed),
        };
        let credential = unlocked.credentials.get_mut(service).ok_or_else(|| VaultError::UnknownService(service.to_string()))?;
        update_fn(credential);
        credential.touch(Utc::now());

        self.save_locked(&mut state)?;
        self.touch_activity();
        self.record_audit("update_credential", AuditOutcome::Success, Some(service.to_string()));
        Ok(())
    }

    /// `delete(service)`.
    pub fn delete(&self, service: &str) -> Result<(), VaultError> {
        let mut state = self.state.write().expect("lock poisoned");
        let unlocked = match &mut *state {
            LockState::Unlocked(u) => u,
            LockState::Locked => return Err(VaultError::AuthenticationFailed),
        };
        if unlocked.credentials.remove(service).is_none() {
            return Err(VaultError::UnknownService(service.to_string()));
        }

        self.save_locked(&mut state)?;
        self.touch_activity();
        self.record_audit("delete_credential", AuditOutcome::Success, Some(service.to_string()));
        Ok(())
    }

    /// Re-encrypts the in-memory credential map and writes it through the
    /// atomic-write protocol, holding the exclusive state lock already
    /// acquired by the caller.
    fn save_locked(&self, state: &mut LockState) -> Result<(), VaultError> {
        let unlocked = match state {
            LockState::Unlocked(u) => u,
            LockState::Locked => return Err(VaultError::AuthenticationFailed),
        };
        let mut metadata_guard = self.metadata.write().expect("lock poisoned");
        let metadata = metadata_guard.as_mut().ok_or(VaultError::AbsentVault)?;

        let payload_json =
            serde_json::to_vec(&unlocked.credentials).map_err(|e| VaultError::MetadataCorrupted(e.to_string()))?;
        let payload_nonce = crypto::generate_nonce();
        let payload_ciphertext = crypto::aes_gcm_seal(&unlocked.payload_key, &payload_json, &payload_nonce)?;
        let mut payload_bytes = payload_nonce.to_vec();
        payload_bytes.extend_from_slice(&payload_ciphertext);

        metadata.last_save_at = Utc::now();
        let payload_key = *unlocked.payload_key;

        store::write_atomic(&self.config.vault_path, metadata, &payload_bytes, |candidate| {
            if candidate.payload.len() < 12 {
                return false;
            }
            let (nonce_bytes, ciphertext) = candidate.payload.split_at(12);
            let Ok(nonce): Result<[u8; 12], _> = nonce_bytes.try_into() else { return false };
            crypto::aes_gcm_open(&payload_key, ciphertext, &nonce).is_ok()
        })?;

        if self.config.sync.enabled {
            if let Some(executor) = self.executor.as_deref() {
                let mut sync_state = sync::load_state(&self.vault_dir()).unwrap_or(None);
                if let Ok(outcome) = sync::smart_push(
                    &self.config.sync,
                    executor,
                    &self.vault_dir(),
                    &self.config.vault_path,
                    &mut sync_state,
                ) {
                    if outcome == SyncOutcome::Synced {
                        if let Some(s) = &sync_state {
                            let _ = sync::save_state(&self.vault_dir(), s);
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

/// Helper for `change_password`/`recover_to_new_password` atomic-write
/// verification: re-derives the wrap key from a just-written candidate
/// envelope and confirms it unwraps to the expected (unchanged) payload
/// key.
fn verify_master_key_unwraps_payload(
    candidate: &store::VaultFile,
    master_key: &[u8; 32],
    expected_payload_key: &[u8; 32],
) -> bool {
    let wrap_key = crypto::derive_payload_wrap_key(master_key, &candidate.metadata.vault_salt);
    match crypto::aes_gcm_open(
        &wrap_key,
        &candidate.metadata.master_key_wrap.ciphertext,
        &candidate.metadata.master_key_wrap.nonce,
    ) {
        Ok(payload_key) => payload_key.as_slice() == expected_payload_key.as_slice(),
        Err(_) => false,
    }
}

/// Attempts a full unlock of `candidate` under `master_password`, used only
/// to pick between the primary and `.backup` vault files (§4.4). Mirrors the
/// derivation in `unlock` itself but discards the result either way; `unlock`
/// re-derives everything afterward against whichever file this validates.
fn try_unlock_vault_file(master_password: &str, candidate: &store::VaultFile) -> Option<[u8; 32]> {
    let master_key = crypto::derive_master_key(
        master_password.as_bytes(),
        &candidate.metadata.master_kdf.salt,
        candidate.metadata.master_kdf.iterations,
    );
    let wrap_key = crypto::derive_payload_wrap_key(&master_key, &candidate.metadata.vault_salt);
    let payload_key = crypto::aes_gcm_open(
        &wrap_key,
        &candidate.metadata.master_key_wrap.ciphertext,
        &candidate.metadata.master_key_wrap.nonce,
    )
    .ok()?;
    let payload_key: [u8; 32] = payload_key.try_into().ok()?;

    if candidate.payload.len() < 12 {
        return None;
    }
    let (nonce_bytes, ciphertext) = candidate.payload.split_at(12);
    let nonce: [u8; 12] = nonce_bytes.try_into().expect("checked length above");
    crypto::aes_gcm_open(&payload_key, ciphertext, &nonce).ok()?;

    Some(payload_key)
}

/// Walks `path`'s ancestors for a `.git` directory; returns
/// `remote.origin.url` from `.git/config` if present, else the
/// repository root directory name, else an empty string.
fn detect_git_repository(path: &Path) -> String {
    for ancestor in path.ancestors() {
        let git_dir = ancestor.join(".git");
        if git_dir.is_dir() {
            if let Ok(config) = std::fs::read_to_string(git_dir.join("config")) {
                if let Some(url) = parse_origin_url(&config) {
                    return url;
                }
            }
            return ancestor.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        }
    }
    String::new()
}

fn parse_origin_url(config: &str) -> Option<String> {
    let mut in_origin_section = false;
    for line in config.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('[') {
            in_origin_section = trimmed == "[remote \"origin\"]";
            continue;
        }
        if in_origin_section {
            if let Some(rest) = trimmed.strip_prefix("url") {
                if let Some(value) = rest.trim_start().strip_prefix('=') {
                    return Some(value.trim().to_string());
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn service_at(dir: &Path) -> VaultService {
        VaultService::new(ServiceConfig { vault_path: dir.join("vault.dat"), sync: SyncConfig { enabled: false, remote_path: None } }, None)
    }

    /// Routes this crate's `tracing` events through the test harness so a
    /// failing test's logs show up under `cargo test -- --nocapture`.
    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().with_env_filter("vault_core=debug").try_init();
    }

    #[test]
    fn check_password_policy_rejects_weak_passwords() {
        let result = check_password_policy("short");
        assert!(matches!(result, Err(VaultError::WeakPassword(_))));
        assert!(check_password_policy("Correct-Horse-Battery1").is_ok());
    }

    #[test]
    fn initialize_then_unlock_roundtrip() {
        init_tracing();
        let dir = TempDir::new().expect("tempdir");
        let service = service_at(dir.path());
        service.initialize("Correct-Horse-Battery1", false, false, None).expect("initialize");
        assert!(service.is_unlocked());
        assert!(service.seconds_since_last_activity().is_some());

        service.lock();
        assert!(!service.is_unlocked());
        assert!(service.seconds_since_last_activity().is_none());

        service.unlock("Correct-Horse-Battery1").expect("unlock");
        assert!(service.is_unlocked());
    }

    #[test]
    fn lock_if_idle_locks_once_timeout_elapsed() {
        let dir = TempDir::new().expect("tempdir");
        let service = service_at(dir.path());
        service.initialize("Correct-Horse-Battery1", false, false, None).expect("initialize");

        assert!(!service.lock_if_idle(Duration::from_secs(60)));
        assert!(service.is_unlocked());

        assert!(service.lock_if_idle(Duration::from_secs(0)));
        assert!(!service.is_unlocked());
    }

    #[test]
    fn unlock_with_wrong_password_fails() {
        let dir = TempDir::new().expect("tempdir");
        let service = service_at(dir.path());
        service.initialize("Correct-Horse-Battery1", false, false, None).expect("initialize");
        service.lock();

        let result = service.unlock("Totally-Wrong-Password1");
        assert!(matches!(result, Err(VaultError::AuthenticationFailed)));
    }

    #[test]
    fn add_then_get_records_usage() {
        let dir = TempDir::new().expect("tempdir");
        let service = service_at(dir.path());
        service.initialize("Correct-Horse-Battery1", false, false, None).expect("initialize");

        service.add("github", "octocat", b"hunter2".to_vec(), None, None, None).expect("add");
        let cwd = dir.path().join("project");
        std::fs::create_dir_all(&cwd).expect("mkdir");

        let credential = service.get("github", &cwd, &[Field::Password, Field::Username]).expect("get");
        let usage = credential.usage.get(&cwd.to_string_lossy().into_owned()).expect("usage recorded");
        assert_eq!(usage.access_count, 1);
        assert_eq!(usage.field_counts[&Field::Password], 1);
    }

    #[test]
    fn add_duplicate_service_fails() {
        let dir = TempDir::new().expect("tempdir");
        let service = service_at(dir.path());
        service.initialize("Correct-Horse-Battery1", false, false, None).expect("initialize");
        service.add("github", "octocat", b"hunter2".to_vec(), None, None, None).expect("add");
        let result = service.add("github", "octocat", b"different".to_vec(), None, None, None);
        assert!(matches!(result, Err(VaultError::DuplicateService(_))));
    }

    #[test]
    fn delete_unknown_service_fails() {
        let dir = TempDir::new().expect("tempdir");
        let service = service_at(dir.path());
        service.initialize("Correct-Horse-Battery1", false, false, None).expect("initialize");
        let result = service.delete("nonexistent");
        assert!(matches!(result, Err(VaultError::UnknownService(_))));
    }

    #[test]
    fn change_password_allows_unlock_with_new_password_only() {
        let dir = TempDir::new().expect("tempdir");
        let service = service_at(dir.path());
        service.initialize("Correct-Horse-Battery1", false, false, None).expect("initialize");
        service.add("github", "octocat", b"hunter2".to_vec(), None, None, None).expect("add");

        service.change_password("Correct-Horse-Battery1", "New-Password-Here2").expect("change password");
        service.lock();

        assert!(matches!(service.unlock("Correct-Horse-Battery1"), Err(VaultError::AuthenticationFailed)));
        assert!(service.unlock("New-Password-Here2").is_ok());

        let credential = service
            .list(|_| true)
            .expect("list")
            .into_iter()
            .find(|c| c.service == "github")
            .expect("credential survives password change");
        assert_eq!(credential.secret.as_bytes(), b"hunter2");
    }

    #[test]
    fn recovery_flow_recovers_without_original_password() {
        let dir = TempDir::new().expect("tempdir");
        let service = service_at(dir.path());
        let mnemonic = service
            .initialize("Correct-Horse-Battery1", false, true, None)
            .expect("initialize")
            .expect("mnemonic returned");
        service.add("github", "octocat", b"hunter2".to_vec(), None, None, None).expect("add");
        service.lock();

        let words: Vec<String> = mnemonic.split_whitespace().map(str::to_string).collect();
        let metadata = store::read(&dir.path().join("vault.dat")).expect("read").metadata;
        let recovery_metadata = metadata.recovery.expect("recovery enabled");
        let challenge_words: Vec<String> =
            recovery_metadata.challenge_positions.iter().map(|&pos| words[pos as usize].clone()).collect();

        service
            .recover_to_new_password(&challenge_words, "", "Recovered-Password3")
            .expect("recover to new password");

        service.unlock("Recovered-Password3").expect("unlock with recovered password");
        let credential = service
            .list(|_| true)
            .expect("list")
            .into_iter()
            .find(|c| c.service == "github")
            .expect("credential survives recovery");
        assert_eq!(credential.secret.as_bytes(), b"hunter2");
    }

    #[test]
    fn unlock_rate_limits_after_five_failures() {
        let dir = TempDir::new().expect("tempdir");
        let service = service_at(dir.path());
        service.initialize("Correct-Horse-Battery1", false, false, None).expect("initialize");
        service.lock();

        for _ in 0..5 {
            let _ = service.unlock("wrong-password-not-matching-policy");
        }
        let sixth = service.unlock("wrong-password-not-matching-policy");
        assert!(matches!(sixth, Err(VaultError::RateLimited(_))));
    }

    #[test]
    fn unlock_falls_back_to_backup_when_primary_is_missing() {
        init_tracing();
        let dir = TempDir::new().expect("tempdir");
        let service = service_at(dir.path());
        service.initialize("Correct-Horse-Battery1", false, false, None).expect("initialize");
        service.lock();

        let vault_path = dir.path().join("vault.dat");
        let backup_path = dir.path().join("vault.dat.backup");
        std::fs::rename(&vault_path, &backup_path).expect("rename into backup");
        assert!(!vault_path.exists());

        service.unlock("Correct-Horse-Battery1").expect("unlock from backup");
        assert!(service.is_unlocked());
    }

    #[test]
    fn unlock_falls_back_to_backup_when_primary_is_corrupted() {
        let dir = TempDir::new().expect("tempdir");
        let service = service_at(dir.path());
        service.initialize("Correct-Horse-Battery1", false, false, None).expect("initialize");
        service.lock();

        let vault_path = dir.path().join("vault.dat");
        let backup_path = dir.path().join("vault.dat.backup");
        std::fs::copy(&vault_path, &backup_path).expect("copy into backup");
        std::fs::write(&vault_path, b"not a valid vault envelope").expect("corrupt primary");

        service.unlock("Correct-Horse-Battery1").expect("unlock from backup");
        assert!(service.is_unlocked());
    }

    #[test]
    fn detect_git_repository_falls_back_to_empty_string() {
        let dir = TempDir::new().expect("tempdir");
        assert_eq!(detect_git_repository(dir.path()), "");
    }

    #[test]
    fn detect_git_repository_reads_origin_url() {
        let dir = TempDir::new().expect("tempdir");
        let git_dir = dir.path().join(".git");
        std::fs::create_dir_all(&git_dir).expect("mkdir");
        std::fs::write(
            git_dir.join("config"),
            "[core]\n\trepositoryformatversion = 0\n[remote \"origin\"]\n\turl = git@example.com:org/repo.git\n",
        )
        .expect("write config");
        assert_eq!(detect_git_repository(dir.path()), "git@example.com:org/repo.git");
    }
}
