//! Persistence port: a flat string key/value store with change subscriptions.
//!
//! Every implementation behaves like browser local storage: values are whole
//! strings, writes replace them, and there are no partial updates. A batch written
//! through [`KeyValueStore::set_many`] lands together or not at all.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, warn};

use crate::crypto::{
    decrypt_envelope_with_key, derive_key, encrypt_text_with_key, envelope_salt, random_salt,
    CryptoEnvelope, CryptoError, DEFAULT_PBKDF2_ITERATIONS,
};

pub const DATA_FILE: &str = "bursary.enc";
pub const PLAIN_DATA_FILE: &str = "bursary-store.json";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("i/o failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode store document: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("storage lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    pub removed: bool,
}

pub type StorageListener = Arc<dyn Fn(&StorageEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn set_many(&self, entries: &[(&str, String)]) -> Result<(), StorageError>;

    fn set(&self, key: &str, value: String) -> Result<(), StorageError> {
        self.set_many(&[(key, value)])
    }

    fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// Listeners run after the write has landed, outside any store lock.
    fn subscribe(&self, listener: StorageListener) -> SubscriptionId;

    fn unsubscribe(&self, id: SubscriptionId);
}

#[derive(Default)]
struct ListenerSet {
    next_id: u64,
    entries: Vec<(SubscriptionId, StorageListener)>,
}

#[derive(Clone, Default)]
struct Listeners(Arc<Mutex<ListenerSet>>);

impl Listeners {
    fn subscribe(&self, listener: StorageListener) -> SubscriptionId {
        let mut guard = match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.next_id += 1;
        let id = SubscriptionId(guard.next_id);
        guard.entries.push((id, listener));
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        if let Ok(mut guard) = self.0.lock() {
            guard.entries.retain(|(entry_id, _)| *entry_id != id);
        }
    }

    fn notify(&self, events: &[StorageEvent]) {
        let listeners: Vec<StorageListener> = match self.0.lock() {
            Ok(guard) => guard.entries.iter().map(|(_, l)| Arc::clone(l)).collect(),
            Err(_) => return,
        };
        for event in events {
            for listener in &listeners {
                listener(event);
            }
        }
    }
}

fn written_events(entries: &[(&str, String)]) -> Vec<StorageEvent> {
    entries
        .iter()
        .map(|(key, _)| StorageEvent {
            key: (*key).to_string(),
            removed: false,
        })
        .collect()
}

/// In-process store. Clones share both the data and the subscriber list, so two
/// clones behave like two views over one browser profile.
#[derive(Clone, Default)]
pub struct MemoryStore {
    data: Arc<Mutex<BTreeMap<String, String>>>,
    listeners: Listeners,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let guard = self.data.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(guard.get(key).cloned())
    }

    fn set_many(&self, entries: &[(&str, String)]) -> Result<(), StorageError> {
        {
            let mut guard = self.data.lock().map_err(|_| StorageError::Poisoned)?;
            for (key, value) in entries {
                guard.insert((*key).to_string(), value.clone());
            }
        }
        self.listeners.notify(&written_events(entries));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let existed = {
            let mut guard = self.data.lock().map_err(|_| StorageError::Poisoned)?;
            guard.remove(key).is_some()
        };
        if existed {
            self.listeners.notify(&[StorageEvent {
                key: key.to_string(),
                removed: true,
            }]);
        }
        Ok(())
    }

    fn subscribe(&self, listener: StorageListener) -> SubscriptionId {
        self.listeners.subscribe(listener)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.listeners.unsubscribe(id)
    }
}

struct FileCipher {
    password: String,
    iterations: u32,
    cached: Mutex<Option<(Vec<u8>, [u8; 32])>>,
}

impl FileCipher {
    fn key_for_salt(&self, salt: &[u8]) -> [u8; 32] {
        if let Ok(guard) = self.cached.lock() {
            if let Some((cached_salt, key)) = guard.as_ref() {
                if cached_salt.as_slice() == salt {
                    return *key;
                }
            }
        }
        let key = derive_key(self.password.as_str(), salt, self.iterations);
        if let Ok(mut guard) = self.cached.lock() {
            *guard = Some((salt.to_vec(), key));
        }
        key
    }

    fn write_key(&self) -> (Vec<u8>, [u8; 32]) {
        if let Ok(guard) = self.cached.lock() {
            if let Some((salt, key)) = guard.as_ref() {
                return (salt.clone(), *key);
            }
        }
        let salt = random_salt();
        let key = self.key_for_salt(&salt);
        (salt.to_vec(), key)
    }
}

/// One JSON document of keys on disk, re-read on every access so that writes
/// from other processes are always observed (last writer wins).
pub struct FileStore {
    path: PathBuf,
    cipher: Option<FileCipher>,
    write_lock: Mutex<()>,
    listeners: Listeners,
}

impl FileStore {
    pub fn open(root: &Path) -> Self {
        FileStore {
            path: root.join(PLAIN_DATA_FILE),
            cipher: None,
            write_lock: Mutex::new(()),
            listeners: Listeners::default(),
        }
    }

    pub fn open_encrypted(root: &Path, password: &str) -> Self {
        Self::open_encrypted_with_iterations(root, password, DEFAULT_PBKDF2_ITERATIONS)
    }

    /// Files written with one iteration count can only be read back with the same count.
    pub fn open_encrypted_with_iterations(root: &Path, password: &str, iterations: u32) -> Self {
        FileStore {
            path: root.join(DATA_FILE),
            cipher: Some(FileCipher {
                password: password.to_string(),
                iterations,
                cached: Mutex::new(None),
            }),
            write_lock: Mutex::new(()),
            listeners: Listeners::default(),
        }
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    fn read_document(&self) -> Result<BTreeMap<String, String>, StorageError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let raw = fs::read_to_string(&self.path).map_err(|source| StorageError::Io {
            path: self.path.clone(),
            source,
        })?;
        let plaintext = match &self.cipher {
            None => raw,
            Some(cipher) => {
                let envelope: CryptoEnvelope = match serde_json::from_str(raw.as_str()) {
                    Ok(value) => value,
                    Err(err) => {
                        warn!(path = %self.path.display(), %err, "store envelope unreadable; starting empty");
                        return Ok(BTreeMap::new());
                    }
                };
                let salt = envelope_salt(&envelope)?;
                let key = cipher.key_for_salt(salt.as_slice());
                decrypt_envelope_with_key(&envelope, &key)?
            }
        };
        match serde_json::from_str::<BTreeMap<String, String>>(plaintext.as_str()) {
            Ok(document) => Ok(document),
            Err(err) => {
                warn!(path = %self.path.display(), %err, "store document corrupted; starting empty");
                Ok(BTreeMap::new())
            }
        }
    }

    fn write_document(&self, document: &BTreeMap<String, String>) -> Result<(), StorageError> {
        let plaintext = serde_json::to_string(document)?;
        let content = match &self.cipher {
            None => plaintext,
            Some(cipher) => {
                let (salt, key) = cipher.write_key();
                let envelope = encrypt_text_with_key(plaintext.as_str(), salt.as_slice(), &key)?;
                serde_json::to_string(&envelope)?
            }
        };
        write_text_file(self.path.as_path(), content.as_str())
    }

    fn modify(
        &self,
        apply: impl FnOnce(&mut BTreeMap<String, String>) -> bool,
    ) -> Result<bool, StorageError> {
        let _guard = self.write_lock.lock().map_err(|_| StorageError::Poisoned)?;
        let mut document = self.read_document()?;
        if !apply(&mut document) {
            return Ok(false);
        }
        self.write_document(&document)?;
        debug!(path = %self.path.display(), keys = document.len(), "store document written");
        Ok(true)
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.read_document()?.remove(key))
    }

    fn set_many(&self, entries: &[(&str, String)]) -> Result<(), StorageError> {
        self.modify(|document| {
            for (key, value) in entries {
                document.insert((*key).to_string(), value.clone());
            }
            true
        })?;
        self.listeners.notify(&written_events(entries));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let removed = self.modify(|document| document.remove(key).is_some())?;
        if removed {
            self.listeners.notify(&[StorageEvent {
                key: key.to_string(),
                removed: true,
            }]);
        }
        Ok(())
    }

    fn subscribe(&self, listener: StorageListener) -> SubscriptionId {
        self.listeners.subscribe(listener)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.listeners.unsubscribe(id)
    }
}

/// Writes through a sibling temp file and renames it into place.
pub(crate) fn write_text_file(path: &Path, content: &str) -> Result<(), StorageError> {
    let io_err = |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, content).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn memory_store_clones_share_data_and_listeners() {
        let first = MemoryStore::new();
        let second = first.clone();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let id = first.subscribe(Arc::new(move |event: &StorageEvent| {
            assert_eq!(event.key, "k");
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        second.set("k", "v".to_string()).expect("set");
        assert_eq!(first.get("k").expect("get").as_deref(), Some("v"));
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        first.unsubscribe(id);
        second.set("k", "w".to_string()).expect("set");
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removing_a_missing_key_is_silent() {
        let store = MemoryStore::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        store.subscribe(Arc::new(move |_: &StorageEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        store.remove("absent").expect("remove");
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn file_store_reads_back_batched_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::open(dir.path());
        store
            .set_many(&[("a", "1".to_string()), ("b", "2".to_string())])
            .expect("write");

        let reopened = FileStore::open(dir.path());
        assert_eq!(reopened.get("a").expect("get").as_deref(), Some("1"));
        assert_eq!(reopened.get("b").expect("get").as_deref(), Some("2"));
        reopened.remove("a").expect("remove");
        assert_eq!(store.get("a").expect("get"), None);
    }

    #[test]
    fn corrupted_file_document_reads_as_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join(PLAIN_DATA_FILE), "{not json").expect("seed");
        let store = FileStore::open(dir.path());
        assert_eq!(store.get("anything").expect("get"), None);
        store.set("fresh", "1".to_string()).expect("overwrite");
        assert_eq!(store.get("fresh").expect("get").as_deref(), Some("1"));
    }

    #[test]
    fn encrypted_store_requires_the_right_password() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::open_encrypted_with_iterations(dir.path(), "pw", 1_000);
        store.set("budget_total", "500".to_string()).expect("write");

        let raw = fs::read_to_string(dir.path().join(DATA_FILE)).expect("raw");
        assert!(!raw.contains("budget_total"));

        let same = FileStore::open_encrypted_with_iterations(dir.path(), "pw", 1_000);
        assert_eq!(same.get("budget_total").expect("get").as_deref(), Some("500"));

        let wrong = FileStore::open_encrypted_with_iterations(dir.path(), "nope", 1_000);
        assert!(matches!(
            wrong.get("budget_total"),
            Err(StorageError::Crypto(CryptoError::Rejected))
        ));
    }
}
