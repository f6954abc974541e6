//! PIN-derived symmetric encryption for locally persisted values.
//!
//! Key derivation: PBKDF2-HMAC-SHA256, 120 000 rounds, 16-byte salt, 256-bit key.
//! AEAD: AES-256-GCM with a fresh random 12-byte nonce per call.
//!
//! Persisted envelope (JSON string):
//!   `{"v":1,"iv":"<base64 12 bytes>","data":"<base64 ciphertext+tag>"}`

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use base64::{engine::general_purpose, Engine as _};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::canonical::to_canonical_bytes;
use crate::error::{KinError, Result};

pub const ENVELOPE_VERSION: u8 = 1;
pub const PBKDF2_ITERATIONS: u32 = 120_000;
pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
pub const KEY_LEN: usize = 32;
const TAG_LEN: usize = 16;

// ── PIN ─────────────────────────────────────────────────────────────────────

/// A validated four-digit PIN. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Pin(String);

impl Pin {
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.len() == 4 && raw.bytes().all(|b| b.is_ascii_digit()) {
            Ok(Self(raw.to_owned()))
        } else {
            Err(KinError::InvalidPin)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Pin(****)")
    }
}

// ── Key derivation ──────────────────────────────────────────────────────────

/// 256-bit AES key derived from a PIN. Never persisted; zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey([u8; KEY_LEN]);

impl DerivedKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DerivedKey(..)")
    }
}

pub fn derive_key(pin: &Pin, salt_hex: &str) -> Result<DerivedKey> {
    let salt = decode_salt(salt_hex)?;
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(pin.as_str().as_bytes(), &salt, PBKDF2_ITERATIONS, &mut key);
    Ok(DerivedKey(key))
}

fn decode_salt(salt_hex: &str) -> Result<[u8; SALT_LEN]> {
    if salt_hex.len() != SALT_LEN * 2 {
        return Err(KinError::KeyDerivation(format!(
            "salt must be {} hex chars, got {}",
            SALT_LEN * 2,
            salt_hex.len()
        )));
    }
    let bytes = hex::decode(salt_hex)
        .map_err(|e| KinError::KeyDerivation(format!("salt is not hex: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| KinError::KeyDerivation("salt length invalid".into()))
}

/// Fresh 16-byte salt as 32 lowercase hex chars.
pub fn generate_salt_hex() -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    hex::encode(salt)
}

// ── PIN hashing ─────────────────────────────────────────────────────────────

/// Argon2id PHC string for the PIN.
pub fn hash_pin(pin: &Pin) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(pin.as_str().as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| KinError::KeyDerivation(format!("argon2 hash: {e}")))
}

/// Hex SHA-256 of the PIN, the format older installations stored.
pub fn legacy_pin_hash(pin: &Pin) -> String {
    hex::encode(Sha256::digest(pin.as_str().as_bytes()))
}

pub fn verify_pin_hash(pin: &Pin, stored: &str, is_secure: bool) -> bool {
    if is_secure {
        match PasswordHash::new(stored) {
            Ok(parsed) => Argon2::default()
                .verify_password(pin.as_str().as_bytes(), &parsed)
                .is_ok(),
            Err(_) => false,
        }
    } else {
        !stored.is_empty() && legacy_pin_hash(pin) == stored.to_ascii_lowercase()
    }
}

// ── Envelope ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EncryptedEnvelope {
    pub v: u8,
    pub iv: String,
    pub data: String,
}

impl EncryptedEnvelope {
    /// Structural check. Returns `None` for anything that is not a well-formed
    /// version-1 envelope; never fails loudly.
    pub fn parse(raw: &str) -> Option<Self> {
        let envelope: EncryptedEnvelope = serde_json::from_str(raw).ok()?;
        if envelope.v != ENVELOPE_VERSION {
            return None;
        }
        let iv = general_purpose::STANDARD.decode(&envelope.iv).ok()?;
        let data = general_purpose::STANDARD.decode(&envelope.data).ok()?;
        if iv.len() != NONCE_LEN || data.len() < TAG_LEN {
            return None;
        }
        Some(envelope)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

pub fn is_encrypted_envelope(raw: &str) -> bool {
    EncryptedEnvelope::parse(raw).is_some()
}

/// Encrypt a JSON-serialisable value. The nonce is always generated here.
pub fn encrypt<T: Serialize + ?Sized>(value: &T, key: &DerivedKey) -> Result<EncryptedEnvelope> {
    let plaintext = to_canonical_bytes(&serde_json::to_value(value)?);
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| KinError::Encryption)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_slice())
        .map_err(|_| KinError::Encryption)?;
    Ok(EncryptedEnvelope {
        v: ENVELOPE_VERSION,
        iv: general_purpose::STANDARD.encode(nonce),
        data: general_purpose::STANDARD.encode(ciphertext),
    })
}

pub fn decrypt<T: DeserializeOwned>(envelope: &EncryptedEnvelope, key: &DerivedKey) -> Result<T> {
    if envelope.v != ENVELOPE_VERSION {
        return Err(KinError::Decryption);
    }
    let iv = general_purpose::STANDARD
        .decode(&envelope.iv)
        .map_err(|_| KinError::Decryption)?;
    if iv.len() != NONCE_LEN {
        return Err(KinError::Decryption);
    }
    let ciphertext = general_purpose::STANDARD
        .decode(&envelope.data)
        .map_err(|_| KinError::Decryption)?;
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| KinError::Decryption)?;
    let plaintext = zeroize::Zeroizing::new(
        cipher
            .decrypt(Nonce::from_slice(&iv), ciphertext.as_slice())
            .map_err(|_| KinError::Decryption)?,
    );
    Ok(serde_json::from_slice(&plaintext)?)
}
