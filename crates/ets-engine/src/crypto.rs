//! Secrets
//!
//! Completion secrets and at-rest protection of script sources.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::{EtsError, Result};

const NONCE_LEN: usize = 12;

/// 32 random bytes, hex encoded
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// Constant-time comparison of a candidate against a stored hash
pub fn secret_matches(expected_hash: &str, candidate: &str) -> bool {
    let actual = hash_secret(candidate);
    expected_hash.len() == actual.len()
        && bool::from(expected_hash.as_bytes().ct_eq(actual.as_bytes()))
}

/// AES-256-GCM cipher for script sources. Ciphertexts are
/// `base64(nonce || ciphertext)`.
pub struct ScriptCipher {
    cipher: Aes256Gcm,
}

impl ScriptCipher {
    pub fn new(key: &[u8]) -> Result<Self> {
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| EtsError::Crypto {
            message: format!("script key must be 32 bytes, got {}", key.len()),
        })?;
        Ok(Self { cipher })
    }

    pub fn from_base64_key(encoded: &str) -> Result<Self> {
        let key = BASE64.decode(encoded.trim()).map_err(|e| EtsError::Crypto {
            message: format!("script key is not valid base64: {}", e),
        })?;
        Self::new(&key)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| EtsError::Crypto { message: format!("encryption failed: {}", e) })?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(nonce.as_slice());
        combined.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(combined))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let combined = BASE64.decode(encoded).map_err(|e| EtsError::Crypto {
            message: format!("ciphertext is not valid base64: {}", e),
        })?;
        if combined.len() <= NONCE_LEN {
            return Err(EtsError::Crypto { message: "ciphertext too short".to_string() });
        }

        let (nonce, ciphertext) = combined.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| EtsError::Crypto { message: format!("decryption failed: {}", e) })?;

        String::from_utf8(plaintext).map_err(|e| EtsError::Crypto {
            message: format!("script source is not UTF-8: {}", e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> ScriptCipher {
        ScriptCipher::new(&[7u8; 32]).unwrap()
    }

    #[test]
    fn test_secret_hash_matching() {
        let secret = generate_secret();
        let hash = hash_secret(&secret);

        assert!(secret_matches(&hash, &secret));
        assert!(!secret_matches(&hash, &generate_secret()));
        assert!(!secret_matches("", &secret));
    }

    #[test]
    fn test_script_cipher() {
        let cipher = cipher();
        let source = "module.exports = (input) => ({ approved: true });";

        let encrypted = cipher.encrypt(source).unwrap();
        assert_ne!(encrypted, source);
        assert_ne!(encrypted, cipher.encrypt(source).unwrap(), "nonce must vary");
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), source);
    }

    #[test]
    fn test_script_cipher_rejects_foreign_ciphertext() {
        let encrypted = cipher().encrypt("return 1;").unwrap();
        let other = ScriptCipher::new(&[9u8; 32]).unwrap();

        assert!(matches!(other.decrypt(&encrypted), Err(EtsError::Crypto { .. })));
        assert!(matches!(cipher().decrypt("AAAA"), Err(EtsError::Crypto { .. })));
    }

    #[test]
    fn test_key_length_is_checked() {
        assert!(ScriptCipher::new(&[1u8; 16]).is_err());
        let key = BASE64.encode([3u8; 32]);
        assert!(ScriptCipher::from_base64_key(&key).is_ok());
        assert!(ScriptCipher::from_base64_key("not base64!").is_err());
    }
}
