//! Field-level encryption for provider tokens at rest.
//!
//! Unlike a full-disk-encrypted vault there is no per-session user
//! passphrase here — the core runs as an unattended service, so the
//! encryption key is a master secret supplied once via configuration and
//! HKDF is used to derive a purpose-bound subkey rather than using that
//! secret directly. Ciphertext, nonce and AEAD are otherwise the same
//! primitives the desktop vault used. Grounded on `original_source`'s
//! `provider_token_repository.py` ("tokens encrypted at rest, decrypted
//! only on read", spec.md §6) and the teacher's AES-GCM usage.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroize;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("invalid ciphertext encoding")]
    InvalidEncoding,
}

/// A master secret loaded once at startup (`config::Config::token_master_key`),
/// zeroized on drop so it doesn't linger in memory past its owner's lifetime.
pub struct MasterKey([u8; 32]);

impl MasterKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        MasterKey(bytes)
    }

    /// Derives a master key from an arbitrary-length secret (e.g. an env var
    /// that isn't necessarily 32 bytes) by hashing it with SHA-256.
    pub fn from_secret(secret: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(secret);
        let digest = hasher.finalize();
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        MasterKey(key)
    }

    /// Generates a fresh random key, for tests and first-run bootstrapping.
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        MasterKey(key)
    }

    /// Derives a purpose-bound 32-byte subkey via HKDF-SHA256, so provider
    /// tokens and any future encrypted field use independent keys even
    /// though they share one master secret.
    fn derive_subkey(&self, purpose: &[u8]) -> Result<[u8; 32], CryptoError> {
        let hk = Hkdf::<Sha256>::new(None, &self.0);
        let mut subkey = [0u8; 32];
        hk.expand(purpose, &mut subkey).map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
        Ok(subkey)
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

const PROVIDER_TOKEN_PURPOSE: &[u8] = b"vitalloop.provider_token.v1";

/// Ciphertext + nonce, safe to store in the `provider_tokens` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedBlob {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; 12],
}

impl EncryptedBlob {
    pub fn to_hex(&self) -> String {
        let mut bytes = Vec::with_capacity(12 + self.ciphertext.len());
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&self.ciphertext);
        hex::encode(bytes)
    }

    pub fn from_hex(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(encoded).map_err(|_| CryptoError::InvalidEncoding)?;
        if bytes.len() < 12 {
            return Err(CryptoError::InvalidEncoding);
        }
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&bytes[0..12]);
        Ok(EncryptedBlob { ciphertext: bytes[12..].to_vec(), nonce })
    }
}

/// Encrypts a provider access/refresh token for storage. Call once per
/// token; a fresh random nonce is drawn each time so identical plaintext
/// tokens never produce identical ciphertext.
pub fn encrypt_provider_token(master: &MasterKey, plaintext: &str) -> Result<EncryptedBlob, CryptoError> {
    let subkey = master.derive_subkey(PROVIDER_TOKEN_PURPOSE)?;
    let cipher = Aes256Gcm::new_from_slice(&subkey).map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

    let mut nonce_bytes = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher.encrypt(nonce, plaintext.as_bytes()).map_err(|e| CryptoError::Encryption(e.to_string()))?;

    Ok(EncryptedBlob { ciphertext, nonce: nonce_bytes })
}

/// Decrypts a provider token on read. Returns an error (never a silent
/// default) if the ciphertext doesn't verify against the derived subkey.
pub fn decrypt_provider_token(master: &MasterKey, blob: &EncryptedBlob) -> Result<String, CryptoError> {
    let subkey = master.derive_subkey(PROVIDER_TOKEN_PURPOSE)?;
    let cipher = Aes256Gcm::new_from_slice(&subkey).map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let nonce = Nonce::from_slice(&blob.nonce);

    let plaintext =
        cipher.decrypt(nonce, blob.ciphertext.as_ref()).map_err(|_| CryptoError::Decryption("AEAD verification failed".to_string()))?;

    String::from_utf8(plaintext).map_err(|_| CryptoError::Decryption("decrypted bytes were not valid UTF-8".to_string()))
}

// ============================================
// Hashing
// ============================================

pub fn hash_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Chains an audit entry onto the previous entry's hash, so tampering with
/// any one audit row is detectable by recomputing the chain forward.
pub fn hash_chain_entry(previous_hash: &str, entry_data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(previous_hash.as_bytes());
    hasher.update(entry_data);
    hex::encode(hasher.finalize())
}

// ============================================
// Token generation
// ============================================

/// Random hex token, used for idempotency keys and job identifiers that
/// need uniqueness without a UUID's dashes.
pub fn generate_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(&bytes)
}
