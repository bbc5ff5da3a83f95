//! Capability traits the core consumes but does not implement (§6).
//!
//! Production implementations (an OS keychain binding, a per-OS path
//! resolver) live outside this crate; only the trait boundary and a
//! recording fake for tests live here.

/// OS secret store used to optionally cache the master password
/// (§6 "OS secret store"). The core treats every error as "unavailable"
/// and never depends on a specific backend.
pub trait SecretStore {
    fn store(&self, entry_key: &str, bytes: &[u8]) -> Result<(), String>;
    fn fetch(&self, entry_key: &str) -> Result<Vec<u8>, String>;
    fn delete(&self, entry_key: &str) -> Result<(), String>;
}

/// Supplies the vault directory's absolute path; the core never resolves
/// this itself (§6 "Path provider").
pub trait PathProvider {
    fn vault_dir(&self) -> std::path::PathBuf;
}

#[cfg(test)]
pub mod fakes {
    use super::{PathProvider, SecretStore};
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::path::PathBuf;

    /// Records every call made to it, for assertions in collaborator tests.
    #[derive(Default)]
    pub struct RecordingSecretStore {
        entries: RefCell<HashMap<String, Vec<u8>>>,
    }

    impl SecretStore for RecordingSecretStore {
        fn store(&self, entry_key: &str, bytes: &[u8]) -> Result<(), String> {
            self.entries.borrow_mut().insert(entry_key.to_string(), bytes.to_vec());
            Ok(())
        }

        fn fetch(&self, entry_key: &str) -> Result<Vec<u8>, String> {
            self.entries.borrow().get(entry_key).cloned().ok_or_else(|| "not found".to_string())
        }

        fn delete(&self, entry_key: &str) -> Result<(), String> {
            self.entries.borrow_mut().remove(entry_key);
            Ok(())
        }
    }

    pub struct FixedPathProvider(pub PathBuf);

    impl PathProvider for FixedPathProvider {
        fn vault_dir(&self) -> PathBuf {
            self.0.clone()
        }
    }

    #[test]
    fn recording_secret_store_round_trips() {
        let store = RecordingSecretStore::default();
        store.store("master", b"hunter2").expect("store");
        assert_eq!(store.fetch("master").expect("fetch"), b"hunter2");
        store.delete("master").expect("delete");
        assert!(store.fetch("master").is_err());
    }
}
