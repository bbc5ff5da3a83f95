//! Crate-wide error taxonomy.
//!
//! Every sub-module returns its own error type; they all convert losslessly
//! into [`VaultError`] so a caller can match on a stable discriminant
//! without the core ever collapsing kinds into a string. The one place
//! collapsing does happen is intentional: several authentication-adjacent
//! causes (wrong password, tampered payload) are folded into
//! [`VaultError::AuthenticationFailed`] so failures don't leak which part
//! was wrong.

use thiserror::Error;

/// Top-level error kind for every public operation in this crate.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("no vault file present at the configured path")]
    AbsentVault,

    #[error("a vault already exists at the configured path")]
    AlreadyInitialized,

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("password does not meet policy: {0:?}")]
    WeakPassword(Vec<PolicyRule>),

    #[error("a credential named {0:?} already exists")]
    DuplicateService(String),

    #[error("no credential named {0:?}")]
    UnknownService(String),

    #[error("vault envelope is corrupted: {0}")]
    CorruptedEnvelope(String),

    #[error("atomic save verification failed, vault on disk is unchanged")]
    VerificationFailed,

    #[error("recovery is not enabled for this vault")]
    RecoveryDisabled,

    #[error("recovery requires exactly 6 challenge words, got {0}")]
    InvalidWordCount(usize),

    #[error("word is not in the BIP39 wordlist")]
    InvalidWord,

    #[error("reconstructed mnemonic failed its BIP39 checksum")]
    InvalidMnemonicChecksum,

    #[error("recovery decryption failed")]
    RecoveryDecryptionFailed,

    #[error("vault metadata is corrupted: {0}")]
    MetadataCorrupted(String),

    #[error("audit chain is broken: {0}")]
    AuditChainBroken(String),

    #[error("audit append failed: {0}")]
    AuditAppendFailed(String),

    #[error("sync conflict detected, local changes were not overwritten")]
    SyncConflict,

    #[error("sync is unavailable: {0}")]
    SyncUnavailable(String),

    #[error("too many failed unlock attempts, retry in {0}s")]
    RateLimited(u64),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A single failed password-policy rule, reported so the caller can show
/// an actionable message without the core formatting user-facing text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyRule {
    MinLength,
    MissingUpper,
    MissingLower,
    MissingDigit,
    MissingSpecial,
}

impl From<CryptoError> for VaultError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::AuthenticationFailed => VaultError::AuthenticationFailed,
            CryptoError::Kdf(msg) => VaultError::MetadataCorrupted(msg),
            CryptoError::InvalidLength(msg) => VaultError::MetadataCorrupted(msg),
        }
    }
}

impl From<StoreError> for VaultError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Io(err) => VaultError::Io(err),
            StoreError::Corrupted(msg) => VaultError::CorruptedEnvelope(msg),
            StoreError::VerificationFailed => VaultError::VerificationFailed,
            StoreError::Absent => VaultError::AbsentVault,
        }
    }
}

impl From<AuditError> for VaultError {
    fn from(e: AuditError) -> Self {
        match e {
            AuditError::ChainBroken(msg) => VaultError::AuditChainBroken(msg),
            AuditError::Append(msg) => VaultError::AuditAppendFailed(msg),
            AuditError::Io(err) => VaultError::Io(err),
        }
    }
}

impl From<RecoveryError> for VaultError {
    fn from(e: RecoveryError) -> Self {
        match e {
            RecoveryError::InvalidCount(n) => VaultError::InvalidWordCount(n),
            RecoveryError::InvalidWord => VaultError::InvalidWord,
            RecoveryError::MetadataCorrupted(msg) => VaultError::MetadataCorrupted(msg),
            RecoveryError::InvalidMnemonicChecksum => VaultError::InvalidMnemonicChecksum,
            RecoveryError::DecryptionFailed => VaultError::RecoveryDecryptionFailed,
        }
    }
}

impl From<SyncError> for VaultError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::Conflict => VaultError::SyncConflict,
            SyncError::Unavailable(msg) => VaultError::SyncUnavailable(msg),
        }
    }
}

/// Errors from the crypto primitives module (§4.1).
#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD tag check failed, or Argon2/PBKDF2 parameters were rejected.
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("kdf error: {0}")]
    Kdf(String),
    #[error("invalid buffer length: {0}")]
    InvalidLength(String),
}

/// Errors from the vault store module (§4.4).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("corrupted envelope: {0}")]
    Corrupted(String),
    #[error("verification failed")]
    VerificationFailed,
    #[error("no vault file present")]
    Absent,
}

/// Errors from the audit log module (§4.2).
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit chain broken: {0}")]
    ChainBroken(String),
    #[error("audit append failed: {0}")]
    Append(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors from the recovery module (§4.3).
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("expected exactly 6 challenge words, got {0}")]
    InvalidCount(usize),
    #[error("word is not in the BIP39 wordlist")]
    InvalidWord,
    #[error("recovery metadata is corrupted: {0}")]
    MetadataCorrupted(String),
    #[error("reconstructed mnemonic failed its BIP39 checksum")]
    InvalidMnemonicChecksum,
    #[error("recovery decryption failed")]
    DecryptionFailed,
}

/// Errors from the sync hook module (§4.6).
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync conflict detected")]
    Conflict,
    #[error("sync unavailable: {0}")]
    Unavailable(String),
}
