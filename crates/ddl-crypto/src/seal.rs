//! Data-response sealing.
//!
//! Each response item is encrypted for the requesting user:
//! - fresh 256-bit AES key per item, AES-256-GCM with a 12-byte nonce
//! - AES key wrapped with the user's RSA public key (OAEP, SHA-256)
//! - `hash` is the SHA-256 hex of the plaintext JSON, checked on open

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::rngs::OsRng;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;

use crate::CryptoError;

const KEY_LENGTH: usize = 32;
const NONCE_LENGTH: usize = 12;

/// Wire form of one sealed response item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedItem {
    pub aes_key: String,
    pub nonce: String,
    pub auth_tag: String,
    pub encrypted_payload: String,
    pub hash: String,
}

impl SealedItem {
    /// Check if a JSON value looks like a sealed item.
    pub fn is_sealed(value: &Value) -> bool {
        ["aesKey", "nonce", "authTag", "encryptedPayload", "hash"]
            .iter()
            .all(|k| value.get(k).and_then(|v| v.as_str()).is_some())
    }
}

/// AES-256-GCM with a single raw key.
struct Aes256GcmProvider {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl Aes256GcmProvider {
    fn with_key(key_bytes: &[u8]) -> Result<Self, CryptoError> {
        let unbound = UnboundKey::new(&AES_256_GCM, key_bytes)
            .map_err(|_| CryptoError::EncryptionFailed("invalid key".into()))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// Returns (nonce, ciphertext, tag).
    fn encrypt(&self, plaintext: &[u8]) -> Result<([u8; NONCE_LENGTH], Vec<u8>, Vec<u8>), CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| CryptoError::EncryptionFailed("RNG failure".into()))?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        // ring appends the auth tag to the ciphertext
        let mut in_out = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::EncryptionFailed("seal failed".into()))?;

        let tag = in_out.split_off(in_out.len() - AES_256_GCM.tag_len());
        Ok((nonce_bytes, in_out, tag))
    }

    fn decrypt(&self, nonce: &[u8], ciphertext: &[u8], tag: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = Nonce::try_assume_unique_for_key(nonce).map_err(|_| CryptoError::DecryptionFailed)?;
        let mut in_out = Vec::with_capacity(ciphertext.len() + tag.len());
        in_out.extend_from_slice(ciphertext);
        in_out.extend_from_slice(tag);
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::DecryptionFailed)?;
        Ok(plaintext.to_vec())
    }
}

pub fn seal_item(user_key: &RsaPublicKey, item: &Value) -> Result<SealedItem, CryptoError> {
    let plaintext = serde_json::to_vec(item)?;

    let mut key_bytes = [0u8; KEY_LENGTH];
    SystemRandom::new()
        .fill(&mut key_bytes)
        .map_err(|_| CryptoError::EncryptionFailed("RNG failure".into()))?;
    let provider = Aes256GcmProvider::with_key(&key_bytes)?;
    let (nonce, ciphertext, tag) = provider.encrypt(&plaintext)?;

    let wrapped = user_key
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &key_bytes)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    Ok(SealedItem {
        aes_key: BASE64.encode(wrapped),
        nonce: BASE64.encode(nonce),
        auth_tag: BASE64.encode(tag),
        encrypted_payload: BASE64.encode(ciphertext),
        hash: crate::sha256_hex(&plaintext),
    })
}

pub fn open_item(user_key: &RsaPrivateKey, sealed: &SealedItem) -> Result<Value, CryptoError> {
    let wrapped = BASE64.decode(&sealed.aes_key)?;
    let key_bytes = user_key
        .decrypt(Oaep::new::<Sha256>(), &wrapped)
        .map_err(|_| CryptoError::DecryptionFailed)?;
    let provider = Aes256GcmProvider::with_key(&key_bytes)?;

    let plaintext = provider.decrypt(
        &BASE64.decode(&sealed.nonce)?,
        &BASE64.decode(&sealed.encrypted_payload)?,
        &BASE64.decode(&sealed.auth_tag)?,
    )?;
    if crate::sha256_hex(&plaintext) != sealed.hash {
        return Err(CryptoError::HashMismatch);
    }
    Ok(serde_json::from_slice(&plaintext)?)
}

/// Seal every item of a response payload.
pub fn seal_items(user_key: &RsaPublicKey, items: &[Value]) -> Result<Vec<Value>, CryptoError> {
    items
        .iter()
        .map(|item| Ok(serde_json::to_value(seal_item(user_key, item)?)?))
        .collect()
}

/// Open every item of a sealed response payload.
pub fn open_items(user_key: &RsaPrivateKey, items: &[Value]) -> Result<Vec<Value>, CryptoError> {
    items
        .iter()
        .map(|item| {
            let sealed: SealedItem = serde_json::from_value(item.clone())?;
            open_item(user_key, &sealed)
        })
        .collect()
}
