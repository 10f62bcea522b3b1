//! AES-256-GCM envelope encryption for protocol messages.
//!
//! The key never travels through the gateway: the sharing side prints it as a
//! URL fragment (`#key=<url-safe-base64>`) and the joining side reads it back
//! from the fragment, which browsers and HTTP clients never send on the wire.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use rand::RngCore;

use super::ProtocolError;

/// Key length in bytes (AES-256).
pub const KEY_LEN: usize = 32;
/// GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// A 256-bit session encryption key.
///
/// Nonces are drawn fresh from the thread CSPRNG for every [`seal`] call, so a
/// key can safely encrypt any number of messages.
///
/// [`seal`]: SessionKey::seal
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        SessionKey(key)
    }

    /// Parse a key from the url-safe base64 form used in the URL fragment.
    pub fn from_base64(encoded: &str) -> Result<Self, ProtocolError> {
        let bytes = URL_SAFE
            .decode(encoded)
            .map_err(|e| ProtocolError::BadKey(e.to_string()))?;
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|v: Vec<u8>| {
            ProtocolError::BadKey(format!("expected {KEY_LEN} bytes, got {}", v.len()))
        })?;
        Ok(SessionKey(key))
    }

    /// Encode the key for embedding in a URL fragment.
    pub fn to_base64(&self) -> String {
        URL_SAFE.encode(self.0)
    }

    /// Encrypt `plaintext`, returning the ciphertext (with appended GCM tag)
    /// and the random nonce used.
    pub fn seal(&self, plaintext: &[u8]) -> Result<(Vec<u8>, [u8; NONCE_LEN]), ProtocolError> {
        let cipher = Aes256Gcm::new((&self.0).into());
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| ProtocolError::CryptoFail)?;
        Ok((ciphertext, nonce_bytes))
    }

    /// Decrypt and authenticate a sealed message. Any tampering with the
    /// ciphertext or nonce, or a mismatched key, yields [`ProtocolError::CryptoFail`].
    pub fn open(&self, ciphertext: &[u8], nonce: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        if nonce.len() != NONCE_LEN {
            return Err(ProtocolError::CryptoFail);
        }
        let cipher = Aes256Gcm::new((&self.0).into());
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| ProtocolError::CryptoFail)
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never log key material.
        f.write_str("SessionKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let key = SessionKey::generate();
        let (ct, nonce) = key.seal(b"echo hi").unwrap();
        assert_eq!(key.open(&ct, &nonce).unwrap(), b"echo hi");
    }

    #[test]
    fn nonces_are_unique() {
        let key = SessionKey::generate();
        let (ct1, n1) = key.seal(b"same plaintext").unwrap();
        let (ct2, n2) = key.seal(b"same plaintext").unwrap();
        assert_ne!(n1, n2);
        assert_ne!(ct1, ct2);
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = SessionKey::generate();
        let (mut ct, nonce) = key.seal(b"payload").unwrap();
        ct[0] ^= 0x01;
        assert!(matches!(key.open(&ct, &nonce), Err(ProtocolError::CryptoFail)));
    }

    #[test]
    fn tampered_nonce_fails() {
        let key = SessionKey::generate();
        let (ct, mut nonce) = key.seal(b"payload").unwrap();
        nonce[3] ^= 0x80;
        assert!(matches!(key.open(&ct, &nonce), Err(ProtocolError::CryptoFail)));
    }

    #[test]
    fn wrong_key_fails() {
        let key = SessionKey::generate();
        let other = SessionKey::generate();
        let (ct, nonce) = key.seal(b"payload").unwrap();
        assert!(matches!(other.open(&ct, &nonce), Err(ProtocolError::CryptoFail)));
    }

    #[test]
    fn base64_roundtrip() {
        let key = SessionKey::generate();
        let parsed = SessionKey::from_base64(&key.to_base64()).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn short_key_rejected() {
        let short = URL_SAFE.encode([0u8; 16]);
        assert!(matches!(
            SessionKey::from_base64(&short),
            Err(ProtocolError::BadKey(_))
        ));
    }
}
