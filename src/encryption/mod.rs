//! Encryptor (spec §4.2): symmetric, authenticated encrypt/decrypt of
//! cluster credentials under a single process-wide key.
//!
//! Grounded on the teacher's `rise-backend/src/encryption/providers/local.rs`.

use crate::error::{CoreError, CoreResult};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

#[async_trait]
pub trait Encryptor: Send + Sync {
    async fn encrypt(&self, plaintext: &str) -> CoreResult<String>;
    async fn decrypt(&self, ciphertext: &str) -> CoreResult<String>;
}

/// AES-256-GCM over a single process-wide key, grounded on the teacher's
/// `LocalEncryptionProvider`.
pub struct AesGcmEncryptor {
    cipher: Aes256Gcm,
}

impl AesGcmEncryptor {
    pub fn new(key_base64: &str) -> CoreResult<Self> {
        let key_bytes = BASE64
            .decode(key_base64)
            .map_err(|e| CoreError::Invalid(format!("encryption key is not valid base64: {e}")))?;

        if key_bytes.len() != 32 {
            return Err(CoreError::Invalid(format!(
                "encryption key must be 32 bytes (256 bits), got {}",
                key_bytes.len()
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|e| CoreError::Fatal(format!("failed to construct AES-256-GCM cipher: {e}")))?;

        Ok(Self { cipher })
    }
}

#[async_trait]
impl Encryptor for AesGcmEncryptor {
    async fn encrypt(&self, plaintext: &str) -> CoreResult<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| CoreError::Fatal(format!("encryption failed: {e}")))?;

        let mut combined = nonce.to_vec();
        combined.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(combined))
    }

    async fn decrypt(&self, ciphertext_base64: &str) -> CoreResult<String> {
        let combined = BASE64
            .decode(ciphertext_base64)
            .map_err(|e| CoreError::Invalid(format!("ciphertext is not valid base64: {e}")))?;

        if combined.len() < 12 {
            return Err(CoreError::Invalid("ciphertext too short".to_string()));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext_bytes = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CoreError::Invalid("DecryptError: AEAD authentication failed".to_string()))?;

        String::from_utf8(plaintext_bytes)
            .map_err(|e| CoreError::Invalid(format!("decrypted data is not valid UTF-8: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn random_key() -> String {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        BASE64.encode(key)
    }

    #[tokio::test]
    async fn roundtrip() {
        let provider = AesGcmEncryptor::new(&random_key()).unwrap();
        let ciphertext = provider.encrypt("my secret password").await.unwrap();
        let plaintext = provider.decrypt(&ciphertext).await.unwrap();
        assert_eq!(plaintext, "my secret password");
    }

    #[tokio::test]
    async fn different_nonces_each_call() {
        let provider = AesGcmEncryptor::new(&random_key()).unwrap();
        let a = provider.encrypt("same message").await.unwrap();
        let b = provider.encrypt("same message").await.unwrap();
        assert_ne!(a, b);
        assert_eq!(provider.decrypt(&a).await.unwrap(), "same message");
        assert_eq!(provider.decrypt(&b).await.unwrap(), "same message");
    }

    #[tokio::test]
    async fn decrypt_with_different_key_fails() {
        let provider_a = AesGcmEncryptor::new(&random_key()).unwrap();
        let provider_b = AesGcmEncryptor::new(&random_key()).unwrap();
        let ciphertext = provider_a.encrypt("top secret").await.unwrap();
        let result = provider_b.decrypt(&ciphertext).await;
        assert!(result.is_err());
    }

    #[test]
    fn rejects_short_key() {
        let short_key = BASE64.encode(b"tooshort");
        assert!(AesGcmEncryptor::new(&short_key).is_err());
    }
}
