//! Core data structures (§3).
//!
//! Secret-bearing fields use [`SecretBytes`], a zeroizing byte buffer that
//! serializes as base64 so the JSON payload round-trips through
//! [`serde_json`] without ever materializing the secret as a plain `String`.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// A byte buffer holding sensitive material, zeroized on drop.
#[derive(Clone, Default)]
pub struct SecretBytes(Vec<u8>);

impl SecretBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_vec(mut self) -> Vec<u8> {
        std::mem::take(&mut self.0)
    }
}

impl std::fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretBytes(<redacted>)")
    }
}

impl Drop for SecretBytes {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl Serialize for SecretBytes {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&BASE64.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for SecretBytes {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let bytes = BASE64
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)?;
        Ok(SecretBytes(bytes))
    }
}

/// Fields of a [`Credential`] that can be exposed to a caller on `get`,
/// used as the key space for [`UsageRecord::field_counts`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Password,
    Username,
    Url,
    Notes,
}

/// Per-(credential, absolute path) access counters (§3 UsageRecord).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Absolute directory path, stored verbatim and never normalized.
    pub location: String,
    /// Repository name captured on first access; immutable afterwards.
    pub git_repository: String,
    pub field_counts: BTreeMap<Field, u64>,
    pub last_access: DateTime<Utc>,
    pub access_count: u64,
}

impl UsageRecord {
    pub fn new(location: String, git_repository: String, now: DateTime<Utc>) -> Self {
        Self {
            location,
            git_repository,
            field_counts: BTreeMap::new(),
            last_access: now,
            access_count: 0,
        }
    }

    /// Records one access, bumping the counters for every field exposed.
    pub fn record_access(&mut self, fields: &[Field], now: DateTime<Utc>) {
        for field in fields {
            *self.field_counts.entry(*field).or_insert(0) += 1;
        }
        self.last_access = now;
        self.access_count += 1;
    }
}

/// A single password entry (§3 Credential).
///
/// `service` is the immutable map key; it is duplicated onto the struct so
/// a `Credential` remains self-describing once pulled out of the map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub service: String,
    pub username: String,
    pub secret: SecretBytes,
    pub url: Option<String>,
    pub notes: Option<String>,
    pub category: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Keyed by absolute directory path.
    #[serde(default)]
    pub usage: BTreeMap<String, UsageRecord>,
}

impl Credential {
    pub fn new(
        service: String,
        username: String,
        secret: Vec<u8>,
        url: Option<String>,
        notes: Option<String>,
        category: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            service,
            username,
            secret: SecretBytes::new(secret),
            url,
            notes,
            category,
            created_at: now,
            updated_at: now,
            usage: BTreeMap::new(),
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

/// In-memory credential map; an ordered mapping keyed by service name
/// (§9 design note: avoid unordered hashing where order matters for
/// deterministic listing and serialization).
pub type CredentialMap = BTreeMap<String, Credential>;

/// KDF identifier + parameters for the master key (§3 VaultMetadata).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterKdfParams {
    pub algorithm: String,
    pub iterations: u32,
    #[serde(with = "base64_fixed_32")]
    pub salt: [u8; 32],
    pub output_len: usize,
}

/// An AES-256-GCM sealed blob: nonce + ciphertext-with-tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedBlob {
    #[serde(with = "base64_fixed_12")]
    pub nonce: [u8; 12],
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
}

/// Argon2id parameters shared by the two recovery KDFs (§3 RecoveryMetadata).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Argon2Params {
    pub time: u32,
    pub memory_kib: u32,
    pub threads: u32,
    #[serde(with = "base64_fixed_32")]
    pub challenge_salt: [u8; 32],
    #[serde(with = "base64_fixed_32")]
    pub recovery_salt: [u8; 32],
}

/// Present iff recovery was enabled at `initialize` time (§3 RecoveryMetadata).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryMetadata {
    pub enabled: bool,
    pub schema_version: u16,
    pub passphrase_required: bool,
    /// Sorted, 6 distinct positions in [0, 24).
    pub challenge_positions: Vec<u8>,
    pub kdf: Argon2Params,
    pub stored_words: SealedBlob,
    pub vault_recovery_key: SealedBlob,
    /// The vault's payload key, wrapped under the vault recovery key.
    /// Refreshed on every `change_password` (§9 Open Question resolution).
    pub payload_key_wrap: SealedBlob,
}

/// The on-disk envelope header, everything outside the encrypted payload
/// (§3 VaultMetadata).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultMetadata {
    pub format_version: u16,
    pub master_kdf: MasterKdfParams,
    /// Vault-wide salt; used as HKDF context when deriving the
    /// payload-key-wrap key from the master key, so the raw master key is
    /// never used directly as an AEAD key (§9 Open Question resolution).
    #[serde(with = "base64_fixed_32")]
    pub vault_salt: [u8; 32],
    /// The vault's random data-encryption key, wrapped under the master key.
    pub master_key_wrap: SealedBlob,
    pub audit_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(with = "base64_fixed_32_opt", default)]
    pub audit_kdf_salt: Option<[u8; 32]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery: Option<RecoveryMetadata>,
    pub created_at: DateTime<Utc>,
    pub last_save_at: DateTime<Utc>,
}

/// A single HMAC-chained audit record (§3 AuditRecord, §6 file layout).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub seq: u64,
    pub time: DateTime<Utc>,
    pub event: String,
    pub outcome: AuditOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine: Option<String>,
    pub prev_hmac: String,
    pub hmac: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Failure,
}

/// The 64 zero hex characters used as record 1's `prev_hmac` (§3).
pub const ZERO_HMAC_SENTINEL: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";
const _: () = assert!(ZERO_HMAC_SENTINEL.len() == 64);

/// Sibling file to the vault, non-secret (§3 SyncState).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
    pub last_push_hash: String,
    pub last_push_time: DateTime<Utc>,
    pub remote_mod_time: DateTime<Utc>,
    pub remote_size: u64,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        BASE64.decode(encoded.as_bytes()).map_err(serde::de::Error::custom)
    }
}

mod base64_fixed_32 {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let encoded = String::deserialize(d)?;
        let bytes = BASE64.decode(encoded.as_bytes()).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

mod base64_fixed_32_opt {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<[u8; 32]>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => s.serialize_str(&BASE64.encode(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<[u8; 32]>, D::Error> {
        let encoded: Option<String> = Option::deserialize(d)?;
        match encoded {
            None => Ok(None),
            Some(encoded) => {
                let bytes = BASE64.decode(encoded.as_bytes()).map_err(serde::de::Error::custom)?;
                let arr: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| serde::de::Error::custom("expected 32 bytes"))?;
                Ok(Some(arr))
            }
        }
    }
}

mod base64_fixed_12 {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 12], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 12], D::Error> {
        let encoded = String::deserialize(d)?;
        let bytes = BASE64.decode(encoded.as_bytes()).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 12 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_bytes_roundtrip_through_json() {
        let secret = SecretBytes::new(b"hunter2xyz!".to_vec());
        let json = serde_json::to_string(&secret).expect("serialize");
        let back: SecretBytes = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.as_bytes(), b"hunter2xyz!");
    }

    #[test]
    fn usage_record_counts_are_additive() {
        let now = Utc::now();
        let mut record = UsageRecord::new("/tmp".to_string(), String::new(), now);
        record.record_access(&[Field::Password], now);
        record.record_access(&[Field::Password, Field::Username], now);
        assert_eq!(record.field_counts[&Field::Password], 2);
        assert_eq!(record.field_counts[&Field::Username], 1);
        assert_eq!(record.access_count, 2);
    }
}
