use aes_gcm::aead::{rand_core::RngCore, Aead, OsRng};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use pbkdf2::pbkdf2_hmac;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 200_000;
const ENVELOPE_VERSION: u8 = 1;
const TAG_LEN: usize = 16;
const IV_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("cipher failure: {0}")]
    Cipher(String),
    #[error("malformed envelope: {0}")]
    Malformed(&'static str),
    #[error("wrong password or tampered data")]
    Rejected,
}

/// On-disk form of an AES-256-GCM encrypted payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoEnvelope {
    pub v: u8,
    pub salt: String,
    pub iv: String,
    pub tag: String,
    pub data: String,
}

pub fn derive_key(password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations.max(1), &mut key);
    key
}

pub fn random_salt() -> [u8; 16] {
    let mut salt = [0u8; 16];
    OsRng.fill_bytes(&mut salt);
    salt
}

pub fn encrypt_text_with_key(
    text: &str,
    salt: &[u8],
    key: &[u8; 32],
) -> Result<CryptoEnvelope, CryptoError> {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    let cipher =
        Aes256Gcm::new_from_slice(key.as_slice()).map_err(|err| CryptoError::Cipher(err.to_string()))?;
    let nonce = Nonce::from_slice(&iv);
    let encrypted = cipher
        .encrypt(nonce, text.as_bytes())
        .map_err(|err| CryptoError::Cipher(err.to_string()))?;

    if encrypted.len() < TAG_LEN {
        return Err(CryptoError::Malformed("encryption output too short"));
    }
    let (data, tag) = encrypted.split_at(encrypted.len() - TAG_LEN);

    Ok(CryptoEnvelope {
        v: ENVELOPE_VERSION,
        salt: encode_b64(salt),
        iv: encode_b64(&iv),
        tag: encode_b64(tag),
        data: encode_b64(data),
    })
}

pub fn decrypt_envelope_with_key(
    payload: &CryptoEnvelope,
    key: &[u8; 32],
) -> Result<String, CryptoError> {
    let iv = decode_b64(payload.iv.as_str())?;
    let tag = decode_b64(payload.tag.as_str())?;
    let data = decode_b64(payload.data.as_str())?;
    if iv.len() != IV_LEN || tag.len() != TAG_LEN {
        return Err(CryptoError::Malformed("iv or tag has the wrong length"));
    }

    let cipher =
        Aes256Gcm::new_from_slice(key.as_slice()).map_err(|err| CryptoError::Cipher(err.to_string()))?;
    let nonce = Nonce::from_slice(iv.as_slice());
    let mut combined = Vec::with_capacity(data.len() + tag.len());
    combined.extend_from_slice(data.as_slice());
    combined.extend_from_slice(tag.as_slice());

    let decrypted = cipher
        .decrypt(nonce, combined.as_slice())
        .map_err(|_| CryptoError::Rejected)?;
    String::from_utf8(decrypted).map_err(|_| CryptoError::Malformed("plaintext is not utf-8"))
}

pub fn envelope_salt(payload: &CryptoEnvelope) -> Result<Vec<u8>, CryptoError> {
    let salt = decode_b64(payload.salt.as_str())?;
    if salt.is_empty() {
        return Err(CryptoError::Malformed("empty salt"));
    }
    Ok(salt)
}

pub fn decode_b64(value: &str) -> Result<Vec<u8>, CryptoError> {
    B64.decode(value)
        .map_err(|_| CryptoError::Malformed("invalid base64"))
}

pub fn encode_b64(bytes: &[u8]) -> String {
    B64.encode(bytes)
}
