use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose, Engine as _};
use rand::RngCore;
use std::sync::Arc;

use crate::error::MailroomError;

/// Encrypts SMTP passwords and webhook secrets at rest. Ciphertexts are
/// base64("nonce || aes-256-gcm(plaintext)") with a 96-bit random nonce.
#[derive(Clone)]
pub struct EncryptionService {
    cipher: Arc<Aes256Gcm>,
}

impl EncryptionService {
    pub fn new(key: &[u8; 32]) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(key);
        let cipher = Aes256Gcm::new(key);
        Self {
            cipher: Arc::new(cipher),
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, MailroomError> {
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| MailroomError::Crypto(format!("Encryption failed: {e}")))?;

        let mut combined = nonce_bytes.to_vec();
        combined.extend_from_slice(&ciphertext);

        Ok(general_purpose::STANDARD.encode(&combined))
    }

    pub fn decrypt(&self, ciphertext: &str) -> Result<String, MailroomError> {
        let combined = general_purpose::STANDARD
            .decode(ciphertext)
            .map_err(|e| MailroomError::Crypto(format!("Failed to decode ciphertext: {e}")))?;

        if combined.len() < 12 {
            return Err(MailroomError::Crypto(
                "Invalid ciphertext: too short".to_string(),
            ));
        }

        let (nonce_bytes, encrypted_data) = combined.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext_bytes = self
            .cipher
            .decrypt(nonce, encrypted_data)
            .map_err(|e| MailroomError::Crypto(format!("Decryption failed: {e}")))?;

        String::from_utf8(plaintext_bytes)
            .map_err(|e| MailroomError::Crypto(format!("Invalid UTF-8: {e}")))
    }
}

/// SHA-256 hex digest used for API key storage; the raw key never touches the
/// database.
pub fn sha256_hex(input: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let key = [0u8; 32];
        let service = EncryptionService::new(&key);

        let plaintext = "relay-password-12345";
        let encrypted = service.encrypt(plaintext).unwrap();
        let decrypted = service.decrypt(&encrypted).unwrap();

        assert_eq!(plaintext, decrypted);
    }

    #[test]
    fn test_encryption_produces_different_ciphertexts() {
        let key = [1u8; 32];
        let service = EncryptionService::new(&key);

        let plaintext = "same-value";
        let encrypted1 = service.encrypt(plaintext).unwrap();
        let encrypted2 = service.encrypt(plaintext).unwrap();

        // Different nonces should produce different ciphertexts
        assert_ne!(encrypted1, encrypted2);

        assert_eq!(service.decrypt(&encrypted1).unwrap(), plaintext);
        assert_eq!(service.decrypt(&encrypted2).unwrap(), plaintext);
    }

    #[test]
    fn test_decrypt_wrong_key_fails() {
        let service1 = EncryptionService::new(&[3u8; 32]);
        let service2 = EncryptionService::new(&[4u8; 32]);

        let encrypted = service1.encrypt("webhook-secret").unwrap();
        assert!(service2.decrypt(&encrypted).is_err());
    }

    #[test]
    fn test_decrypt_invalid_ciphertext() {
        let service = EncryptionService::new(&[2u8; 32]);
        assert!(service.decrypt("invalid-base64!").is_err());
        assert!(service.decrypt("aGVsbG8=").is_err()); // shorter than a nonce
    }

    #[test]
    fn test_sha256_hex_is_stable() {
        assert_eq!(
            sha256_hex("mk_test_key"),
            sha256_hex("mk_test_key"),
        );
        assert_ne!(sha256_hex("a"), sha256_hex("b"));
        assert_eq!(sha256_hex("").len(), 64);
    }
}
