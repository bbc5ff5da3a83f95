//! Cryptographic primitives (§4.1). Pure computation: no file I/O, no
//! knowledge of the envelope format.
//!
//! # Security
//!
//! - **Master-key KDF**: PBKDF2-HMAC-SHA256, 600,000 iterations by default
//!   for new vaults. Vaults written with an older iteration count keep it.
//! - **Payload cipher**: AES-256-GCM, 12-byte nonce, fresh per encryption.
//! - **Recovery KDF**: Argon2id, 64 MiB memory, 1 iteration, 4 threads.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::CryptoError;

/// Domain-separation label for deriving the payload-key-wrap key from the
/// raw master key, so the master key is never used directly as an AEAD
/// key (§9 Open Question resolution).
const PAYLOAD_WRAP_HKDF_INFO: &[u8] = b"vault-core payload-key-wrap v1";

type HmacSha256 = Hmac<Sha256>;

/// PBKDF2-HMAC-SHA256 iteration count for newly initialized vaults.
pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 600_000;

/// Argon2id parameters used for the recovery KDFs (§4.1, §4.3).
pub const RECOVERY_ARGON2_TIME: u32 = 1;
pub const RECOVERY_ARGON2_MEMORY_KIB: u32 = 64 * 1024;
pub const RECOVERY_ARGON2_THREADS: u32 = 4;
pub const RECOVERY_ARGON2_OUTPUT_LEN: usize = 32;

/// Derives the 32-byte master key from the master password via
/// PBKDF2-HMAC-SHA256.
pub fn derive_master_key(password: &[u8], salt: &[u8; 32], iterations: u32) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut key);
    key
}

/// Seals `plaintext` under `key` with AES-256-GCM, returning
/// ciphertext||tag. Additional authenticated data is always empty.
pub fn aes_gcm_seal(key: &[u8; 32], plaintext: &[u8], nonce: &[u8; 12]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| CryptoError::InvalidLength(e.to_string()))?;
    let nonce = Nonce::<aes_gcm::aead::consts::U12>::from(*nonce);
    cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| CryptoError::AuthenticationFailed)
}

/// Opens an AES-256-GCM sealed blob. Fails with
/// [`CryptoError::AuthenticationFailed`] on any tag mismatch, whether
/// caused by a wrong key or tampered ciphertext — callers must not
/// distinguish the two.
pub fn aes_gcm_open(key: &[u8; 32], ciphertext_with_tag: &[u8], nonce: &[u8; 12]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| CryptoError::InvalidLength(e.to_string()))?;
    let nonce = Nonce::<aes_gcm::aead::consts::U12>::from(*nonce);
    cipher
        .decrypt(&nonce, ciphertext_with_tag)
        .map_err(|_| CryptoError::AuthenticationFailed)
}

/// Derives the key that wraps the vault's payload key, from the raw
/// master key plus the vault-wide salt used as HKDF context. Keeping
/// this one step removed from the master key means rotating the wrap
/// (e.g. on `change_password`) never touches the payload itself.
pub fn derive_payload_wrap_key(master_key: &[u8; 32], vault_salt: &[u8; 32]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(vault_salt), master_key);
    let mut wrap_key = [0u8; 32];
    hk.expand(PAYLOAD_WRAP_HKDF_INFO, &mut wrap_key)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    wrap_key
}

/// Argon2id key derivation used by the recovery module.
pub fn argon2id_derive(
    secret: &[u8],
    salt: &[u8],
    time: u32,
    memory_kib: u32,
    threads: u32,
    out_len: usize,
) -> Result<Vec<u8>, CryptoError> {
    let params = Params::new(memory_kib, time, threads, Some(out_len))
        .map_err(|e| CryptoError::Kdf(format!("argon2 params: {e}")))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut out = vec![0u8; out_len];
    argon2
        .hash_password_into(secret, salt, &mut out)
        .map_err(|e| CryptoError::Kdf(format!("argon2: {e}")))?;
    Ok(out)
}

/// HMAC-SHA256 over `message` under `key`.
pub fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts a key of any length");
    mac.update(message);
    mac.finalize().into_bytes().into()
}

/// Fills and returns `n` cryptographically secure random bytes.
pub fn csprng_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Generates a fresh 12-byte AES-GCM nonce. Call once per encryption —
/// reusing a nonce under the same key is forbidden.
pub fn generate_nonce() -> [u8; 12] {
    let mut nonce = [0u8; 12];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Generates a fresh 32-byte salt.
pub fn generate_salt32() -> [u8; 32] {
    let mut salt = [0u8; 32];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Constant-time byte comparison. Returns `false` immediately on length
/// mismatch, which is not itself secret-dependent for the fixed-length
/// hashes and nonces this crate compares.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Zeroizes a byte buffer in place.
pub fn zero(buf: &mut [u8]) {
    use zeroize::Zeroize;
    buf.zeroize();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aes_gcm_roundtrip() {
        let key = generate_salt32();
        let nonce = generate_nonce();
        let ciphertext = aes_gcm_seal(&key, b"hello vault", &nonce).expect("seal");
        let plaintext = aes_gcm_open(&key, &ciphertext, &nonce).expect("open");
        assert_eq!(plaintext, b"hello vault");
    }

    #[test]
    fn aes_gcm_open_rejects_wrong_key() {
        let key = generate_salt32();
        let other = generate_salt32();
        let nonce = generate_nonce();
        let ciphertext = aes_gcm_seal(&key, b"secret", &nonce).expect("seal");
        assert!(aes_gcm_open(&other, &ciphertext, &nonce).is_err());
    }

    #[test]
    fn aes_gcm_open_rejects_tampered_ciphertext() {
        let key = generate_salt32();
        let nonce = generate_nonce();
        let mut ciphertext = aes_gcm_seal(&key, b"secret", &nonce).expect("seal");
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0x01;
        assert!(aes_gcm_open(&key, &ciphertext, &nonce).is_err());
    }

    #[test]
    fn pbkdf2_is_deterministic_for_same_salt_and_iterations() {
        let salt = generate_salt32();
        let a = derive_master_key(b"correct horse battery staple", &salt, 10_000);
        let b = derive_master_key(b"correct horse battery staple", &salt, 10_000);
        assert_eq!(a, b);
    }

    #[test]
    fn argon2id_derive_is_deterministic() {
        let salt = generate_salt32();
        let a = argon2id_derive(b"secret", &salt, 1, 8 * 1024, 1, 32).expect("derive");
        let b = argon2id_derive(b"secret", &salt, 1, 8 * 1024, 1, 32).expect("derive");
        assert_eq!(a, b);
    }

    #[test]
    fn derive_payload_wrap_key_is_deterministic_and_salt_sensitive() {
        let master_key = generate_salt32();
        let salt_a = generate_salt32();
        let salt_b = generate_salt32();
        let wrap_a1 = derive_payload_wrap_key(&master_key, &salt_a);
        let wrap_a2 = derive_payload_wrap_key(&master_key, &salt_a);
        let wrap_b = derive_payload_wrap_key(&master_key, &salt_b);
        assert_eq!(wrap_a1, wrap_a2);
        assert_ne!(wrap_a1, wrap_b);
    }

    #[test]
    fn constant_time_eq_rejects_different_lengths() {
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
    }
}
