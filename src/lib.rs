//! A single-user, offline-first password vault engine.
//!
//! This crate is the core: the cryptographic envelope, the master-key
//! lifecycle, the atomic persistence protocol, the append-only
//! HMAC-signed audit log, and the BIP39 split-mnemonic recovery
//! subsystem. It does not include a command-line front end, a TUI, a
//! config-file loader, OS-keychain bindings, or a sync executor binary —
//! those are collaborators that consume the APIs here.
//!
//! - [`crypto`] — AES-256-GCM, PBKDF2-SHA256, Argon2id, HMAC-SHA256, CSPRNG.
//! - [`model`] — the data model shared by every other module.
//! - [`recovery`] — BIP39 split-mnemonic setup and execution.
//! - [`audit`] — the HMAC-chained, append-only audit log.
//! - [`store`] — the on-disk envelope and atomic write protocol.
//! - [`service`] — the lock/unlock state machine and mutation API.
//! - [`sync`] — the injectable-executor sync hook.
//! - [`collaborators`] — capability traits the core consumes but does not implement.
//! - [`error`] — the crate-wide error taxonomy.
//!
//! # Architecture
//!
//! ```text
//! service.rs ──── lock/unlock state machine, mutation API
//!     │      │
//!     │      └── sync.rs ── injectable command executor
//!     ▼
//! store.rs ─────── envelope + atomic write protocol
//!     │
//!     ▼
//! audit.rs, recovery.rs ── HMAC chain, BIP39 split-mnemonic
//!     │
//!     ▼
//! crypto.rs ────── AES-256-GCM, PBKDF2, Argon2id, HMAC, CSPRNG
//!     │
//!     ▼
//! model.rs ─────── Credential, VaultMetadata, AuditRecord, ...
//! ```
//!
//! # Security properties
//!
//! - **PBKDF2-SHA256** master-key derivation (600,000 iterations for new vaults)
//! - **AES-256-GCM** payload encryption, fresh nonce per write
//! - **Argon2id** recovery-key derivation (64 MiB memory)
//! - **Zeroize** on every secret buffer, on every exit path
//! - **Rate limiting** with escalating backoff on failed unlock attempts

pub mod audit;
pub mod collaborators;
pub mod crypto;
pub mod error;
pub mod model;
pub mod recovery;
pub mod service;
pub mod store;
pub mod sync;
