//! Cryptographic primitives for Ensemble.
//!
//! Provides two things:
//!   1. BLAKE3 hashing for content hashes of code units, key derivation
//!   2. Sealing of code units for delivery to devices
//!
//! A sealed unit has the layout
//!
//! ```text
//! [32-byte BLAKE3(plaintext)] [ChaCha20-Poly1305 ciphertext + 16-byte tag] [12-byte IV]
//! ```
//!
//! The receiver must decrypt first and only then compare the hash header
//! against the decrypted bytes. The header is deliberately not bound as
//! associated data, so a corrupted header surfaces as an integrity failure
//! rather than a decryption failure.
//!
//! Key material derives ZeroizeOnDrop. There is no unsafe code in this module.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

// ── BLAKE3 ────────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

// ── Layout ────────────────────────────────────────────────────────────────────

/// Length of the content hash header.
pub const HASH_LEN: usize = 32;

/// Length of the trailing initialization vector.
pub const IV_LEN: usize = 12;

/// Length of the Poly1305 tag appended to the ciphertext.
pub const TAG_LEN: usize = 16;

/// Smallest possible sealed unit (empty plaintext).
pub const MIN_SEALED_LEN: usize = HASH_LEN + TAG_LEN + IV_LEN;

/// BLAKE3 key-derivation context for the pre-shared code key.
/// Changing this string invalidates every deployed key.
const KEY_CONTEXT: &str = "ensemble 2024-01 code unit key";

// ── Key ───────────────────────────────────────────────────────────────────────

/// Pre-shared symmetric key known to the controller and every device.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CodeKey([u8; 32]);

impl CodeKey {
    /// Derive the key from the configured passphrase.
    pub fn from_passphrase(passphrase: &str) -> Self {
        Self(blake3::derive_key(KEY_CONTEXT, passphrase.as_bytes()))
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.0))
    }
}

impl std::fmt::Debug for CodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CodeKey(..)")
    }
}

// ── Sealing ───────────────────────────────────────────────────────────────────

/// Generate a random IV.
pub fn generate_iv() -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

/// Seal a code unit for transfer: hash header, ciphertext, trailing IV.
pub fn seal(key: &CodeKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let iv = generate_iv();
    let ciphertext = key
        .cipher()
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| CryptoError::Encryption)?;

    let mut out = Vec::with_capacity(HASH_LEN + ciphertext.len() + IV_LEN);
    out.extend_from_slice(&hash(plaintext));
    out.extend_from_slice(&ciphertext);
    out.extend_from_slice(&iv);
    Ok(out)
}

/// The three regions of a sealed unit, borrowed from the received bytes.
#[derive(Debug, Clone, Copy)]
pub struct SealedParts<'a> {
    pub header: [u8; HASH_LEN],
    pub ciphertext: &'a [u8],
    pub iv: [u8; IV_LEN],
}

impl<'a> SealedParts<'a> {
    /// Split raw bytes into header, ciphertext and IV. Checks length only.
    pub fn split(bytes: &'a [u8]) -> Result<Self, CryptoError> {
        if bytes.len() < MIN_SEALED_LEN {
            return Err(CryptoError::TooShort(bytes.len()));
        }
        let iv_start = bytes.len() - IV_LEN;

        let mut header = [0u8; HASH_LEN];
        header.copy_from_slice(&bytes[..HASH_LEN]);
        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&bytes[iv_start..]);

        Ok(Self {
            header,
            ciphertext: &bytes[HASH_LEN..iv_start],
            iv,
        })
    }

    /// Decrypt the payload region. Fails if the key does not match.
    pub fn decrypt(&self, key: &CodeKey) -> Result<Vec<u8>, CryptoError> {
        key.cipher()
            .decrypt(Nonce::from_slice(&self.iv), self.ciphertext)
            .map_err(|_| CryptoError::Decryption)
    }

    /// Compare the header against the hash of already-decrypted bytes.
    pub fn verify(&self, plaintext: &[u8]) -> Result<(), CryptoError> {
        let actual = hash(plaintext);
        if actual != self.header {
            return Err(CryptoError::Integrity {
                expected: self.header,
                actual,
            });
        }
        Ok(())
    }
}

/// Decrypt then verify. Returns the verified plaintext.
pub fn open(key: &CodeKey, bytes: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let parts = SealedParts::split(bytes)?;
    let plaintext = parts.decrypt(key)?;
    parts.verify(&plaintext)?;
    Ok(plaintext)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("sealed unit too short ({0} bytes, need at least {})", MIN_SEALED_LEN)]
    TooShort(usize),

    #[error("encryption failed")]
    Encryption,

    #[error("decryption failed (controller and device keys probably differ)")]
    Decryption,

    #[error("content hash mismatch")]
    Integrity {
        expected: [u8; HASH_LEN],
        actual: [u8; HASH_LEN],
    },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
