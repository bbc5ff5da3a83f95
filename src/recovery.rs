//! BIP39 split-mnemonic recovery (§4.3).
//!
//! A 24-word mnemonic is generated once at vault setup and split into a
//! 6-word "challenge" set and an 18-word "stored" set. The stored set is
//! encrypted under a key derived from the challenge words; the vault's
//! recovery key is encrypted under a key derived from the full phrase.
//! Recovering the vault recovery key therefore requires presenting the 6
//! challenge words (to unwrap the stored 18) before the full phrase can be
//! reassembled and used for the second unwrap.

use bip39::{Language, Mnemonic};
use chrono::Utc;
use zeroize::Zeroizing;

use crate::crypto;
use crate::error::RecoveryError;
use crate::model::{Argon2Params, RecoveryMetadata, SealedBlob};

/// Number of words split into the "challenge" set, and recorded positions.
pub const CHALLENGE_WORD_COUNT: usize = 6;
/// Total words in the recovery mnemonic.
pub const TOTAL_WORD_COUNT: usize = 24;

/// Returned once, at setup time, to be shown to the user and never stored.
pub struct RecoverySetup {
    /// Space-joined 24-word mnemonic. Caller must display and discard.
    pub mnemonic: String,
    pub metadata: RecoveryMetadata,
}

/// Computes the BIP39 seed algorithm (PBKDF2-HMAC-SHA512, 2048 rounds,
/// salt = "mnemonic" + passphrase) over an arbitrary space-joined word
/// list. Used for the 6-word and 18-word partial lists as well as the
/// full 24-word phrase — none of the partial lists are valid standalone
/// mnemonics, so the bip39 crate's own seed derivation (which requires a
/// checksummed mnemonic) does not apply uniformly across all three.
fn bip39_seed(words_joined: &str, passphrase: &str) -> Zeroizing<[u8; 64]> {
    let salt = format!("mnemonic{passphrase}");
    let mut seed = [0u8; 64];
    pbkdf2::pbkdf2_hmac::<sha2::Sha512>(words_joined.as_bytes(), salt.as_bytes(), 2048, &mut seed);
    Zeroizing::new(seed)
}

fn is_wordlist_word(word: &str) -> bool {
    Language::English.word_list().iter().any(|w| *w == word)
}

/// Sets up recovery for a freshly generated vault: rolls 256 bits of
/// entropy, derives the 24-word mnemonic, splits it, and encrypts both
/// the stored 18 words and the supplied `payload_key` under
/// recovery-specific keys.
///
/// Returns the mnemonic exactly once — it is the caller's responsibility
/// to display it and never persist it.
pub fn setup(passphrase: &str, payload_key: &[u8; 32]) -> Result<RecoverySetup, RecoveryError> {
    let entropy = crypto::csprng_bytes(32);
    let mnemonic = Mnemonic::from_entropy(&entropy)
        .map_err(|e| RecoveryError::MetadataCorrupted(format!("mnemonic generation: {e}")))?;
    let words: Vec<String> = mnemonic.to_string().split_whitespace().map(str::to_string).collect();
    if words.len() != TOTAL_WORD_COUNT {
        return Err(RecoveryError::MetadataCorrupted(format!(
            "expected {TOTAL_WORD_COUNT} words, got {}",
            words.len()
        )));
    }

    let mut positions: Vec<u8> = (0..TOTAL_WORD_COUNT as u8).collect();
    shuffle(&mut positions);
    let mut challenge_positions: Vec<u8> = positions[..CHALLENGE_WORD_COUNT].to_vec();
    challenge_positions.sort_unstable();

    let challenge_words: Vec<&str> = challenge_positions
        .iter()
        .map(|&pos| words[pos as usize].as_str())
        .collect();
    let stored_positions: Vec<u8> = (0..TOTAL_WORD_COUNT as u8)
        .filter(|p| !challenge_positions.contains(p))
        .collect();
    let stored_words: Vec<&str> = stored_positions.iter().map(|&pos| words[pos as usize].as_str()).collect();

    let challenge_salt = crypto::generate_salt32();
    let recovery_salt = crypto::generate_salt32();

    let challenge_seed = bip39_seed(&challenge_words.join(" "), passphrase);
    let challenge_key: [u8; 32] = crypto::argon2id_derive(
        challenge_seed.as_ref(),
        &challenge_salt,
        crypto::RECOVERY_ARGON2_TIME,
        crypto::RECOVERY_ARGON2_MEMORY_KIB,
        crypto::RECOVERY_ARGON2_THREADS,
        crypto::RECOVERY_ARGON2_OUTPUT_LEN,
    )
    .map_err(|e| RecoveryError::MetadataCorrupted(e.to_string()))?
    .try_into()
    .expect("argon2id_derive returns 32 bytes");

    let full_seed = bip39_seed(&words.join(" "), passphrase);
    let recovery_key_encryption_key: [u8; 32] = crypto::argon2id_derive(
        full_seed.as_ref(),
        &recovery_salt,
        crypto::RECOVERY_ARGON2_TIME,
        crypto::RECOVERY_ARGON2_MEMORY_KIB,
        crypto::RECOVERY_ARGON2_THREADS,
        crypto::RECOVERY_ARGON2_OUTPUT_LEN,
    )
    .map_err(|e| RecoveryError::MetadataCorrupted(e.to_string()))?
    .try_into()
    .expect("argon2id_derive returns 32 bytes");

    let stored_words_json =
        serde_json::to_vec(&stored_words).map_err(|e| RecoveryError::MetadataCorrupted(e.to_string()))?;
    let stored_words_nonce = crypto::generate_nonce();
    let stored_words_ciphertext = crypto::aes_gcm_seal(&challenge_key, &stored_words_json, &stored_words_nonce)
        .map_err(|e| RecoveryError::MetadataCorrupted(e.to_string()))?;

    let vault_recovery_key = crypto::generate_salt32();
    let vrk_nonce = crypto::generate_nonce();
    let vrk_ciphertext = crypto::aes_gcm_seal(&recovery_key_encryption_key, &vault_recovery_key, &vrk_nonce)
        .map_err(|e| RecoveryError::MetadataCorrupted(e.to_string()))?;

    let wrap_nonce = crypto::generate_nonce();
    let wrap_ciphertext = crypto::aes_gcm_seal(&vault_recovery_key, payload_key, &wrap_nonce)
        .map_err(|e| RecoveryError::MetadataCorrupted(e.to_string()))?;

    let metadata = RecoveryMetadata {
        enabled: true,
        schema_version: 1,
        passphrase_required: !passphrase.is_empty(),
        challenge_positions,
        kdf: Argon2Params {
            time: crypto::RECOVERY_ARGON2_TIME,
            memory_kib: crypto::RECOVERY_ARGON2_MEMORY_KIB,
            threads: crypto::RECOVERY_ARGON2_THREADS,
            challenge_salt,
            recovery_salt,
        },
        stored_words: SealedBlob { nonce: stored_words_nonce, ciphertext: stored_words_ciphertext },
        vault_recovery_key: SealedBlob { nonce: vrk_nonce, ciphertext: vrk_ciphertext },
        payload_key_wrap: SealedBlob { nonce: wrap_nonce, ciphertext: wrap_ciphertext },
    };

    Ok(RecoverySetup { mnemonic: words.join(" "), metadata })
}

/// Re-wraps `payload_key` under the vault recovery key, refreshing the
/// envelope slot. Only called from the recovery flow itself, since that
/// is the only place the vault recovery key is available in memory; a
/// plain password change never touches this slot.
pub fn rewrap_payload_key(
    vault_recovery_key: &[u8; 32],
    payload_key: &[u8; 32],
) -> Result<SealedBlob, RecoveryError> {
    let nonce = crypto::generate_nonce();
    let ciphertext = crypto::aes_gcm_seal(vault_recovery_key, payload_key, &nonce)
        .map_err(|e| RecoveryError::MetadataCorrupted(e.to_string()))?;
    Ok(SealedBlob { nonce, ciphertext })
}

/// Picks 3 distinct positions among the 24, for a transcription-error
/// check independent of the recovery execution path (§4.3 Verification).
pub fn pick_verification_positions() -> [u8; 3] {
    let mut positions: Vec<u8> = (0..TOTAL_WORD_COUNT as u8).collect();
    shuffle(&mut positions);
    [positions[0], positions[1], positions[2]]
}

/// Checks that the user's transcribed words match the original mnemonic
/// at the given positions (case-insensitive, whitespace-trimmed).
pub fn verify_transcription(full_words: &[String], checks: &[(u8, String)]) -> bool {
    checks.iter().all(|(pos, word)| {
        full_words
            .get(*pos as usize)
            .map(|expected| expected.trim().eq_ignore_ascii_case(word.trim()))
            .unwrap_or(false)
    })
}

/// Recovers the vault recovery key from 6 challenge words (in the order
/// recorded by `metadata.challenge_positions`) and an optional passphrase.
///
/// On any cryptographic failure (wrong word, wrong passphrase, tampered
/// ciphertext) this returns [`RecoveryError::DecryptionFailed`] without
/// indicating which check failed — this is the collapsed kind described
/// in the testable property for word substitution (§8 property 6).
pub fn execute(
    challenge_words: &[String],
    passphrase: &str,
    metadata: &RecoveryMetadata,
) -> Result<Zeroizing<[u8; 32]>, RecoveryError> {
    if challenge_words.len() != CHALLENGE_WORD_COUNT {
        return Err(RecoveryError::InvalidCount(challenge_words.len()));
    }
    for word in challenge_words {
        if !is_wordlist_word(word.trim()) {
            return Err(RecoveryError::InvalidWord);
        }
    }
    if metadata.challenge_positions.len() != CHALLENGE_WORD_COUNT
        || metadata.challenge_positions.iter().any(|p| *p as usize >= TOTAL_WORD_COUNT)
        || metadata.stored_words.nonce.len() != 12
        || metadata.stored_words.ciphertext.is_empty()
        || metadata.vault_recovery_key.nonce.len() != 12
        || metadata.vault_recovery_key.ciphertext.is_empty()
    {
        return Err(RecoveryError::MetadataCorrupted("malformed recovery metadata".to_string()));
    }

    let challenge_joined: String =
        challenge_words.iter().map(|w| w.trim().to_ascii_lowercase()).collect::<Vec<_>>().join(" ");
    let challenge_seed = bip39_seed(&challenge_joined, passphrase);
    let challenge_key: [u8; 32] = crypto::argon2id_derive(
        challenge_seed.as_ref(),
        &metadata.kdf.challenge_salt,
        metadata.kdf.time,
        metadata.kdf.memory_kib,
        metadata.kdf.threads,
        crypto::RECOVERY_ARGON2_OUTPUT_LEN,
    )
    .map_err(|_| RecoveryError::DecryptionFailed)?
    .try_into()
    .map_err(|_| RecoveryError::DecryptionFailed)?;

    let stored_words_json = crypto::aes_gcm_open(
        &challenge_key,
        &metadata.stored_words.ciphertext,
        &metadata.stored_words.nonce,
    )
    .map_err(|_| RecoveryError::DecryptionFailed)?;
    let stored_words: Vec<String> =
        serde_json::from_slice(&stored_words_json).map_err(|_| RecoveryError::DecryptionFailed)?;

    let stored_positions: Vec<u8> =
        (0..TOTAL_WORD_COUNT as u8).filter(|p| !metadata.challenge_positions.contains(p)).collect();
    if stored_positions.len() != stored_words.len() {
        return Err(RecoveryError::MetadataCorrupted("stored word count mismatch".to_string()));
    }

    let mut full_words: Vec<String> = vec![String::new(); TOTAL_WORD_COUNT];
    for (pos, word) in metadata.challenge_positions.iter().zip(challenge_words.iter()) {
        full_words[*pos as usize] = word.trim().to_ascii_lowercase();
    }
    for (pos, word) in stored_positions.iter().zip(stored_words.iter()) {
        full_words[*pos as usize] = word.clone();
    }

    let full_phrase = full_words.join(" ");
    Mnemonic::parse_in(Language::English, full_phrase.as_str())
        .map_err(|_| RecoveryError::InvalidMnemonicChecksum)?;

    let full_seed = bip39_seed(&full_phrase, passphrase);
    let recovery_key_encryption_key: [u8; 32] = crypto::argon2id_derive(
        full_seed.as_ref(),
        &metadata.kdf.recovery_salt,
        metadata.kdf.time,
        metadata.kdf.memory_kib,
        metadata.kdf.threads,
        crypto::RECOVERY_ARGON2_OUTPUT_LEN,
    )
    .map_err(|_| RecoveryError::DecryptionFailed)?
    .try_into()
    .map_err(|_| RecoveryError::DecryptionFailed)?;

    let vault_recovery_key = crypto::aes_gcm_open(
        &recovery_key_encryption_key,
        &metadata.vault_recovery_key.ciphertext,
        &metadata.vault_recovery_key.nonce,
    )
    .map_err(|_| RecoveryError::DecryptionFailed)?;

    let arr: [u8; 32] = vault_recovery_key.try_into().map_err(|_| RecoveryError::DecryptionFailed)?;
    Ok(Zeroizing::new(arr))
}

/// Unwraps the payload key from `metadata.payload_key_wrap` using an
/// already-recovered vault recovery key.
pub fn unwrap_payload_key(
    vault_recovery_key: &[u8; 32],
    metadata: &RecoveryMetadata,
) -> Result<Zeroizing<[u8; 32]>, RecoveryError> {
    let payload_key = crypto::aes_gcm_open(
        vault_recovery_key,
        &metadata.payload_key_wrap.ciphertext,
        &metadata.payload_key_wrap.nonce,
    )
    .map_err(|_| RecoveryError::DecryptionFailed)?;
    let arr: [u8; 32] = payload_key.try_into().map_err(|_| RecoveryError::DecryptionFailed)?;
    Ok(Zeroizing::new(arr))
}

/// Fisher-Yates shuffle seeded from the CSPRNG.
fn shuffle(items: &mut [u8]) {
    for i in (1..items.len()).rev() {
        let random = crypto::csprng_bytes(4);
        let r = u32::from_le_bytes(random.try_into().expect("4 bytes"));
        let j = (r as usize) % (i + 1);
        items.swap(i, j);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_produces_checksummed_mnemonic() {
        let payload_key = [7u8; 32];
        let setup = setup("", &payload_key).expect("setup");
        let words: Vec<&str> = setup.mnemonic.split_whitespace().collect();
        assert_eq!(words.len(), TOTAL_WORD_COUNT);
        assert!(Mnemonic::parse_in(Language::English, setup.mnemonic.as_str()).is_ok());
        assert_eq!(setup.metadata.challenge_positions.len(), CHALLENGE_WORD_COUNT);
    }

    #[test]
    fn execute_recovers_the_payload_key_end_to_end() {
        let payload_key = [9u8; 32];
        let setup = setup("correct-horse", &payload_key).expect("setup");
        let words: Vec<String> = setup.mnemonic.split_whitespace().map(str::to_string).collect();

        let challenge_words: Vec<String> = setup
            .metadata
            .challenge_positions
            .iter()
            .map(|&pos| words[pos as usize].clone())
            .collect();

        let vrk = execute(&challenge_words, "correct-horse", &setup.metadata).expect("recovery");
        let recovered_payload_key = unwrap_payload_key(&vrk, &setup.metadata).expect("unwrap");
        assert_eq!(recovered_payload_key.as_ref(), &payload_key);
    }

    #[test]
    fn execute_rejects_wrong_word() {
        let payload_key = [1u8; 32];
        let setup = setup("", &payload_key).expect("setup");
        let words: Vec<String> = setup.mnemonic.split_whitespace().map(str::to_string).collect();
        let mut challenge_words: Vec<String> = setup
            .metadata
            .challenge_positions
            .iter()
            .map(|&pos| words[pos as usize].clone())
            .collect();

        let replacement = if challenge_words[0] == "abandon" { "ability" } else { "abandon" };
        challenge_words[0] = replacement.to_string();

        let result = execute(&challenge_words, "", &setup.metadata);
        assert!(matches!(result, Err(RecoveryError::DecryptionFailed) | Err(RecoveryError::InvalidWord)));
    }

    #[test]
    fn execute_rejects_wrong_count() {
        let payload_key = [1u8; 32];
        let setup = setup("", &payload_key).expect("setup");
        let words: Vec<String> = setup.mnemonic.split_whitespace().map(str::to_string).collect();
        let too_few: Vec<String> = words[0..5].to_vec();
        assert!(matches!(execute(&too_few, "", &setup.metadata), Err(RecoveryError::InvalidCount(5))));

        let too_many: Vec<String> = words[0..7].to_vec();
        assert!(matches!(execute(&too_many, "", &setup.metadata), Err(RecoveryError::InvalidCount(7))));
    }

    #[test]
    fn verify_transcription_is_case_and_whitespace_insensitive() {
        let full_words: Vec<String> = vec!["abandon".to_string(), "ability".to_string(), "able".to_string()];
        let checks = vec![(0u8, " Abandon ".to_string()), (1u8, "ABILITY".to_string())];
        assert!(verify_transcription(&full_words, &checks));
    }
}
