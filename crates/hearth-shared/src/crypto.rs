use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::constants::{
    IV_SIZE, KDF_CONTEXT_KEY_FINGERPRINT, KEY_FINGERPRINT_LEN, SYMMETRIC_KEY_SIZE, TAG_SIZE,
};
use crate::error::CryptoError;
use crate::types::RoomId;

/// AES-256 key material. Crosses boundaries only as Base64; `Debug` prints
/// the fingerprint, never the bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct Key([u8; SYMMETRIC_KEY_SIZE]);

impl Key {
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|_| CryptoError::InvalidKey)?;
        let arr: [u8; SYMMETRIC_KEY_SIZE] =
            bytes.try_into().map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self(arr))
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Opaque identifier safe to log or hand to transport.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_KEY_FINGERPRINT);
        hasher.update(&self.0);
        let hash = hasher.finalize();
        hex::encode(&hash.as_bytes()[..KEY_FINGERPRINT_LEN / 2])
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new((&self.0).into())
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Key({})", self.fingerprint())
    }
}

/// Base64 of `IV || ciphertext || tag`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncryptedPayload(pub String);

impl EncryptedPayload {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EncryptedPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn generate_key() -> Key {
    let mut key = [0u8; SYMMETRIC_KEY_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut key);
    Key(key)
}

pub fn generate_iv() -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    iv
}

/// Base64 decodable and exactly 256 bits. Does not try the key.
pub fn is_valid_key(candidate: &str) -> bool {
    !candidate.is_empty() && Key::from_base64(candidate).is_ok()
}

pub fn encrypt(plaintext: &[u8], key: &Key) -> Result<EncryptedPayload, CryptoError> {
    seal(plaintext, key, &[])
}

pub fn decrypt(payload: &EncryptedPayload, key: &Key) -> Result<Vec<u8>, CryptoError> {
    open(payload, key, &[])
}

// Binds the room id as associated data so a ciphertext lifted from one room
// fails authentication in another, even under the same key.
pub fn encrypt_bound(
    plaintext: &[u8],
    key: &Key,
    room: RoomId,
) -> Result<EncryptedPayload, CryptoError> {
    seal(plaintext, key, &room_aad(room))
}

pub fn decrypt_bound(
    payload: &EncryptedPayload,
    key: &Key,
    room: RoomId,
) -> Result<Vec<u8>, CryptoError> {
    open(payload, key, &room_aad(room))
}

fn room_aad(room: RoomId) -> [u8; 8] {
    room.0.to_be_bytes()
}

fn seal(plaintext: &[u8], key: &Key, aad: &[u8]) -> Result<EncryptedPayload, CryptoError> {
    if plaintext.is_empty() {
        return Err(CryptoError::EncryptionFailed);
    }

    let iv = generate_iv();
    let ciphertext = key
        .cipher()
        .encrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut combined = Vec::with_capacity(IV_SIZE + ciphertext.len());
    combined.extend_from_slice(&iv);
    combined.extend_from_slice(&ciphertext);
    Ok(EncryptedPayload(STANDARD.encode(combined)))
}

fn open(payload: &EncryptedPayload, key: &Key, aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let combined = STANDARD
        .decode(payload.as_str())
        .map_err(|_| CryptoError::DecryptionFailed)?;

    if combined.len() < IV_SIZE + TAG_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let (iv, ciphertext) = combined.split_at(IV_SIZE);
    key.cipher()
        .decrypt(
            Nonce::from_slice(iv),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed)
}
