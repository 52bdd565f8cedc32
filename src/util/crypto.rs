use crate::error::{Error, Result};
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use ring::digest;
use sha2::Sha256;

/// AES-GCM encryption utility
pub struct AesGcm {
    cipher: Aes256Gcm,
}

impl AesGcm {
    /// Create a new AES-GCM cipher with the given key
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != 32 {
            return Err(Error::Crypto("AES key must be 32 bytes".to_string()));
        }

        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| Error::Crypto(format!("Failed to create AES cipher: {}", e)))?;

        Ok(Self { cipher })
    }

    /// Encrypt data with the given nonce
    pub fn encrypt(&self, nonce: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        self.encrypt_with_aad(nonce, data, &[])
    }

    /// Decrypt data with the given nonce
    pub fn decrypt(&self, nonce: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        self.decrypt_with_aad(nonce, data, &[])
    }

    /// Encrypt data binding additional authenticated data
    pub fn encrypt_with_aad(&self, nonce: &[u8], data: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if nonce.len() != 12 {
            return Err(Error::Crypto("Nonce must be 12 bytes".to_string()));
        }

        let nonce = Nonce::from_slice(nonce);
        self.cipher
            .encrypt(nonce, Payload { msg: data, aad })
            .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))
    }

    /// Decrypt data verifying additional authenticated data
    pub fn decrypt_with_aad(&self, nonce: &[u8], data: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if nonce.len() != 12 {
            return Err(Error::Crypto("Nonce must be 12 bytes".to_string()));
        }

        let nonce = Nonce::from_slice(nonce);
        self.cipher
            .decrypt(nonce, Payload { msg: data, aad })
            .map_err(|e| Error::Crypto(format!("Decryption failed: {}", e)))
    }
}

/// HKDF key derivation
pub fn hkdf_expand(key: &[u8], info: &[u8], length: usize) -> Result<Vec<u8>> {
    let hk = Hkdf::<Sha256>::new(None, key);
    let mut output = vec![0u8; length];
    hk.expand(info, &mut output)
        .map_err(|e| Error::Crypto(format!("HKDF expansion failed: {}", e)))?;
    Ok(output)
}

/// SHA-256 hash
pub fn sha256(data: &[u8]) -> Vec<u8> {
    digest::digest(&digest::SHA256, data).as_ref().to_vec()
}

/// Generate random bytes
pub fn random_bytes(length: usize) -> Vec<u8> {
    use ring::rand::{SecureRandom, SystemRandom};

    let rng = SystemRandom::new();
    let mut bytes = vec![0u8; length];
    rng.fill(&mut bytes).expect("system RNG failure");
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aes_gcm_round_trip() {
        let key = [3u8; 32];
        let nonce = [7u8; 12];
        let aes = AesGcm::new(&key).unwrap();

        let ciphertext = aes.encrypt(&nonce, b"payload").unwrap();
        assert_ne!(ciphertext, b"payload");
        let plaintext = aes.decrypt(&nonce, &ciphertext).unwrap();
        assert_eq!(plaintext, b"payload");
    }

    #[test]
    fn test_aes_gcm_aad_binding() {
        let key = [3u8; 32];
        let nonce = [7u8; 12];
        let aes = AesGcm::new(&key).unwrap();

        let ciphertext = aes.encrypt_with_aad(&nonce, b"payload", b"msg-id").unwrap();
        assert!(aes.decrypt_with_aad(&nonce, &ciphertext, b"msg-id").is_ok());
        assert!(aes.decrypt_with_aad(&nonce, &ciphertext, b"other").is_err());
    }

    #[test]
    fn test_hkdf_expand_deterministic() {
        let a = hkdf_expand(&[1u8; 32], b"info", 32).unwrap();
        let b = hkdf_expand(&[1u8; 32], b"info", 32).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_random_bytes_length() {
        assert_eq!(random_bytes(12).len(), 12);
        assert_ne!(random_bytes(12), random_bytes(12));
    }
}
