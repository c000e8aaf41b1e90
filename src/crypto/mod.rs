//! Message sealing.
//!
//! A participant-supplied secret is stretched with Argon2id over a random
//! per-message salt into a 256-bit key, and the message body is sealed with
//! AES-256-GCM under a fresh 96-bit IV. The secret itself is never stored:
//! only its [`fingerprint`] is kept, to reject a wrong secret before the
//! cipher is touched.
//!
//! ```rust,ignore
//! let params = KdfParams::default();
//! let salt = generate_salt();
//! let key = derive_key("pw1", &salt, &params)?;
//! let sealed = seal("hello", &key)?;
//! assert_eq!(open(&sealed.ciphertext, &sealed.iv, &sealed.auth_tag, &key)?, "hello");
//! ```

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};

/// Salt size for Argon2id (16 bytes)
pub const SALT_SIZE: usize = 16;
/// AES-GCM nonce size (12 bytes)
pub const IV_SIZE: usize = 12;
/// AES-GCM authentication tag size (16 bytes)
pub const TAG_SIZE: usize = 16;
/// Derived key size (32 bytes)
pub const KEY_SIZE: usize = 32;

/// Context string for secret fingerprints. Changing it invalidates every stored hash.
const FINGERPRINT_CONTEXT: &str = "bazaar-messaging 2024-05 message secret fingerprint";

/// Errors raised while sealing or opening a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Wrong secret, wrong salt, or tampered data. Deliberately carries no detail.
    Authentication,
    /// Argon2 refused the parameters or the inputs.
    KeyDerivation(String),
    /// The cipher could not seal the plaintext.
    Encryption(String),
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CryptoError::Authentication => write!(f, "cannot decrypt message"),
            CryptoError::KeyDerivation(msg) => write!(f, "Key derivation failed: {}", msg),
            CryptoError::Encryption(msg) => write!(f, "Encryption failed: {}", msg),
        }
    }
}

impl std::error::Error for CryptoError {}

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub memory_kib: u32,
    /// Number of passes
    pub iterations: u32,
    /// Degree of parallelism
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        // argon2 crate defaults (OWASP minimum for Argon2id)
        Self {
            memory_kib: 19_456,
            iterations: 2,
            parallelism: 1,
        }
    }
}

/// A derived message key. Debug output never prints the bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct MessageKey([u8; KEY_SIZE]);

impl MessageKey {
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MessageKey(..)")
    }
}

/// Output of [`seal`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedMessage {
    pub ciphertext: Vec<u8>,
    pub iv: [u8; IV_SIZE],
    pub auth_tag: [u8; TAG_SIZE],
}

/// Generate a random salt for [`derive_key`].
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Derive a 256-bit key from a secret using Argon2id.
///
/// Deterministic for a given `(secret, salt, params)`.
pub fn derive_key(secret: &str, salt: &[u8], params: &KdfParams) -> Result<MessageKey, CryptoError> {
    let params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| CryptoError::KeyDerivation(format!("Argon2 params invalid: {}", e)))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut output = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(secret.as_bytes(), salt, &mut output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

    Ok(MessageKey(output))
}

/// Seal a plaintext under `key` with a fresh random IV.
pub fn seal(plaintext: &str, key: &MessageKey) -> Result<SealedMessage, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    let mut iv = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut iv);

    // aes-gcm appends the tag to the ciphertext
    let mut ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext.as_bytes())
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    let tag_start = ciphertext.len() - TAG_SIZE;
    let mut auth_tag = [0u8; TAG_SIZE];
    auth_tag.copy_from_slice(&ciphertext[tag_start..]);
    ciphertext.truncate(tag_start);

    Ok(SealedMessage {
        ciphertext,
        iv,
        auth_tag,
    })
}

/// Open a sealed message.
///
/// Any failure (malformed iv or tag, integrity check, invalid UTF-8) is
/// reported as [`CryptoError::Authentication`].
pub fn open(
    ciphertext: &[u8],
    iv: &[u8],
    auth_tag: &[u8],
    key: &MessageKey,
) -> Result<String, CryptoError> {
    if iv.len() != IV_SIZE || auth_tag.len() != TAG_SIZE {
        return Err(CryptoError::Authentication);
    }

    let cipher =
        Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::Authentication)?;

    let mut combined = Vec::with_capacity(ciphertext.len() + TAG_SIZE);
    combined.extend_from_slice(ciphertext);
    combined.extend_from_slice(auth_tag);

    let plaintext = cipher
        .decrypt(Nonce::from_slice(iv), combined.as_slice())
        .map_err(|_| CryptoError::Authentication)?;

    String::from_utf8(plaintext).map_err(|_| CryptoError::Authentication)
}

/// One-way fingerprint of a secret, hex encoded.
///
/// Only used to check that a resupplied secret matches the one a message
/// was sealed with. It is not key material.
pub fn fingerprint(secret: &str) -> String {
    let mut hasher = blake3::Hasher::new_derive_key(FINGERPRINT_CONTEXT);
    hasher.update(secret.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Check a resupplied secret against a stored fingerprint.
pub fn verify_fingerprint(secret: &str, stored: &str) -> bool {
    let computed = fingerprint(secret);
    // Equal-length hex strings; fold so the comparison does not short-circuit.
    computed.len() == stored.len()
        && computed
            .bytes()
            .zip(stored.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

/// Encode bytes for storage in a text column.
pub fn encode(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Decode a stored text column. Garbage decodes as an authentication failure.
pub fn decode(text: &str) -> Result<Vec<u8>, CryptoError> {
    BASE64.decode(text).map_err(|_| CryptoError::Authentication)
}
