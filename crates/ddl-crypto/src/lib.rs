//! DDL Crypto -- RSA-PSS message signatures, network key pairs, response sealing.
//!
//! Signatures:
//! - RSA-PSS, SHA-256 for both the message digest and MGF1
//! - maximum salt length for the key size
//! - base64 (standard alphabet) on the wire
//!
//! Keys travel as PEM: PKCS#8 for private keys, SubjectPublicKeyInfo for
//! public keys.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::pss::{BlindedSigningKey, Signature, VerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

pub mod keys;
pub mod seal;

// Re-exports
pub use keys::NetworkKeyPair;
pub use seal::{open_item, open_items, seal_item, seal_items, SealedItem};

/// SHA-256 output length in bytes.
const HASH_LENGTH: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("signature does not match payload")]
    InvalidSignature,
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("signing failed: {0}")]
    SigningFailed(String),
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("decryption failed: authentication tag mismatch")]
    DecryptionFailed,
    #[error("sealed item hash mismatch")]
    HashMismatch,
    #[error("base64 decode error: {0}")]
    Base64Error(#[from] base64::DecodeError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Largest PSS salt the modulus allows: `emLen - hLen - 2`.
pub fn max_salt_len(key: &RsaPublicKey) -> usize {
    let em_bits = key.n().bits().saturating_sub(1);
    let em_len = em_bits.div_ceil(8);
    em_len.saturating_sub(HASH_LENGTH + 2)
}

pub fn parse_private_key(pem: &str) -> Result<RsaPrivateKey, CryptoError> {
    RsaPrivateKey::from_pkcs8_pem(pem).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

pub fn parse_public_key(pem: &str) -> Result<RsaPublicKey, CryptoError> {
    RsaPublicKey::from_public_key_pem(pem).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

/// Sign `payload` with an already-parsed key. Returns base64.
pub fn sign_with(key: &RsaPrivateKey, payload: &[u8]) -> Result<String, CryptoError> {
    let salt_len = max_salt_len(&key.to_public_key());
    let signer = BlindedSigningKey::<Sha256>::new_with_salt_len(key.clone(), salt_len);
    let signature = signer
        .try_sign_with_rng(&mut OsRng, payload)
        .map_err(|e| CryptoError::SigningFailed(e.to_string()))?;
    Ok(BASE64.encode(signature.to_vec()))
}

/// Sign `payload` with a PEM private key. Returns base64.
pub fn sign(private_key_pem: &str, payload: &[u8]) -> Result<String, CryptoError> {
    sign_with(&parse_private_key(private_key_pem)?, payload)
}

/// Verify a base64 signature with an already-parsed key.
pub fn verify_with(key: &RsaPublicKey, signature_b64: &str, payload: &[u8]) -> Result<(), CryptoError> {
    let raw = BASE64.decode(signature_b64.trim())?;
    let signature = Signature::try_from(raw.as_slice()).map_err(|_| CryptoError::InvalidSignature)?;
    let verifier = VerifyingKey::<Sha256>::new_with_salt_len(key.clone(), max_salt_len(key));
    verifier
        .verify(payload, &signature)
        .map_err(|_| CryptoError::InvalidSignature)
}

/// Verify a base64 signature with a PEM public key. Any mismatch, including
/// a malformed signature, is [`CryptoError::InvalidSignature`].
pub fn verify(public_key_pem: &str, signature_b64: &str, payload: &[u8]) -> Result<(), CryptoError> {
    verify_with(&parse_public_key(public_key_pem)?, signature_b64, payload)
}

/// SHA-256 hash of data, returned as hex string.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
