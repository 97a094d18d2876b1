//! Administrator credential, stored as a PBKDF2 hash under [`ADMIN_AUTH_KEY`].

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::crypto::{decode_b64, derive_key, encode_b64, random_salt, DEFAULT_PBKDF2_ITERATIONS};
use crate::error::{BursaryError, BursaryResult};
use crate::kv::{KeyValueStore, StorageError};

pub const ADMIN_AUTH_KEY: &str = "admin_auth";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRecord {
    pub salt: String,
    pub hash: String,
    #[serde(default = "default_pbkdf2_iterations")]
    pub iterations: u32,
}

fn default_pbkdf2_iterations() -> u32 {
    DEFAULT_PBKDF2_ITERATIONS
}

impl AuthRecord {
    fn hash_password(password: &str, iterations: u32) -> Self {
        let salt = random_salt();
        let key = derive_key(password, &salt, iterations);
        AuthRecord {
            salt: encode_b64(&salt),
            hash: encode_b64(key.as_slice()),
            iterations,
        }
    }

    pub fn matches(&self, password: &str) -> bool {
        if password.is_empty() {
            return false;
        }
        let salt = match decode_b64(self.salt.as_str()) {
            Ok(value) => value,
            Err(_) => return false,
        };
        let key = derive_key(password, salt.as_slice(), self.iterations.max(1));
        encode_b64(key.as_slice()) == self.hash
    }
}

/// An unreadable or incomplete credential reads as absent.
pub fn read_auth_record(kv: &dyn KeyValueStore) -> Result<Option<AuthRecord>, StorageError> {
    let Some(raw) = kv.get(ADMIN_AUTH_KEY)? else {
        return Ok(None);
    };
    let mut record: AuthRecord = match serde_json::from_str(raw.as_str()) {
        Ok(value) => value,
        Err(err) => {
            warn!(key = ADMIN_AUTH_KEY, %err, "admin credential unreadable; treating as unset");
            return Ok(None);
        }
    };
    if record.salt.is_empty() || record.hash.is_empty() {
        return Ok(None);
    }
    if record.iterations == 0 {
        record.iterations = DEFAULT_PBKDF2_ITERATIONS;
    }
    Ok(Some(record))
}

fn write_auth_record(kv: &dyn KeyValueStore, record: &AuthRecord) -> Result<(), StorageError> {
    kv.set(ADMIN_AUTH_KEY, serde_json::to_string(record)?)
}

/// First-run setup. Refuses to overwrite an existing credential; use
/// [`change_admin_password`] for that.
pub fn setup_admin(
    kv: &dyn KeyValueStore,
    password: &str,
    iterations: Option<u32>,
) -> BursaryResult<AuthRecord> {
    if password.is_empty() {
        return Err(BursaryError::validation("password", "is required"));
    }
    if read_auth_record(kv)?.is_some() {
        return Err(BursaryError::validation(
            "password",
            "an administrator credential is already set",
        ));
    }
    let record = AuthRecord::hash_password(
        password,
        iterations.unwrap_or(DEFAULT_PBKDF2_ITERATIONS).max(1),
    );
    write_auth_record(kv, &record)?;
    info!("administrator credential created");
    Ok(record)
}

pub fn verify_admin(kv: &dyn KeyValueStore, password: &str) -> Result<bool, StorageError> {
    Ok(read_auth_record(kv)?.is_some_and(|record| record.matches(password)))
}

/// Returns `false` when no credential exists or `current` does not match.
pub fn change_admin_password(
    kv: &dyn KeyValueStore,
    current: &str,
    next: &str,
    iterations: Option<u32>,
) -> BursaryResult<bool> {
    let Some(existing) = read_auth_record(kv)? else {
        return Ok(false);
    };
    if next.is_empty() || !existing.matches(current) {
        return Ok(false);
    }
    let record = AuthRecord::hash_password(next, iterations.unwrap_or(existing.iterations).max(1));
    write_auth_record(kv, &record)?;
    info!("administrator credential changed");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;

    #[test]
    fn setup_then_verify() {
        let kv = MemoryStore::new();
        assert!(!verify_admin(&kv, "secret").expect("verify"));
        let record = setup_admin(&kv, "secret", Some(1_000)).expect("setup");
        assert_eq!(record.iterations, 1_000);
        assert!(verify_admin(&kv, "secret").expect("verify"));
        assert!(!verify_admin(&kv, "Secret").expect("verify"));
        assert!(!verify_admin(&kv, "").expect("verify"));
    }

    #[test]
    fn setup_does_not_overwrite() {
        let kv = MemoryStore::new();
        setup_admin(&kv, "first", Some(1_000)).expect("setup");
        assert!(setup_admin(&kv, "second", Some(1_000)).is_err());
        assert!(verify_admin(&kv, "first").expect("verify"));
    }

    #[test]
    fn change_requires_current_password() {
        let kv = MemoryStore::new();
        assert!(!change_admin_password(&kv, "a", "b", None).expect("change"));
        setup_admin(&kv, "first", Some(1_000)).expect("setup");
        assert!(!change_admin_password(&kv, "wrong", "second", None).expect("change"));
        assert!(change_admin_password(&kv, "first", "second", None).expect("change"));
        assert!(verify_admin(&kv, "second").expect("verify"));
        assert!(!verify_admin(&kv, "first").expect("verify"));
        assert_eq!(
            read_auth_record(&kv).expect("read").map(|r| r.iterations),
            Some(1_000)
        );
    }

    #[test]
    fn garbage_credential_reads_as_unset() {
        let kv = MemoryStore::new();
        kv.set(ADMIN_AUTH_KEY, "{not json".to_string()).expect("seed");
        assert_eq!(read_auth_record(&kv).expect("read"), None);
    }
}
