use base64::Engine;
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use secrecy::SecretString;
use zeroize::Zeroizing;

use crate::utils::error::{MonitorError, Result};

/// Length of the AES-256-GCM master key in bytes
pub const MASTER_KEY_LEN: usize = 32;

/// Encrypt-at-rest boundary for channel secrets.
///
/// Ciphertexts are `base64(nonce || ciphertext || tag)`. The caller supplies
/// an associated-data string (the owning channel id) so a ciphertext copied
/// onto another channel record fails to open.
pub struct SecretCipher {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl SecretCipher {
    /// Build a cipher from raw key bytes
    pub fn new(key_bytes: &[u8]) -> Result<Self> {
        if key_bytes.len() != MASTER_KEY_LEN {
            return Err(MonitorError::encryption(format!(
                "Master key must be {} bytes, got {}",
                MASTER_KEY_LEN,
                key_bytes.len()
            )));
        }
        let unbound = UnboundKey::new(&aead::AES_256_GCM, key_bytes)
            .map_err(|_| MonitorError::encryption("Failed to load master key"))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// Build a cipher from a base64-encoded key
    pub fn from_base64_key(encoded: &str) -> Result<Self> {
        let decoded = Zeroizing::new(
            base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .map_err(|e| MonitorError::encryption(format!("Invalid master key encoding: {}", e)))?,
        );
        Self::new(&decoded)
    }

    /// Build a cipher from the base64 key stored in an environment variable
    pub fn from_env(var: &str) -> Result<Self> {
        let encoded = Zeroizing::new(std::env::var(var).map_err(|_| {
            MonitorError::config(format!("Environment variable {} is not set", var))
        })?);
        Self::from_base64_key(&encoded)
    }

    /// Generate a fresh base64-encoded master key
    pub fn generate_key() -> Result<String> {
        let mut key = Zeroizing::new([0u8; MASTER_KEY_LEN]);
        SystemRandom::new()
            .fill(&mut key[..])
            .map_err(|_| MonitorError::encryption("Failed to generate key"))?;
        Ok(base64::engine::general_purpose::STANDARD.encode(&key[..]))
    }

    /// Encrypt a plaintext secret bound to `context`
    pub fn seal(&self, plaintext: &str, context: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| MonitorError::encryption("Failed to generate nonce"))?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = plaintext.as_bytes().to_vec();
        self.key
            .seal_in_place_append_tag(nonce, Aad::from(context.as_bytes()), &mut in_out)
            .map_err(|_| MonitorError::encryption("Failed to encrypt secret"))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&in_out);
        Ok(base64::engine::general_purpose::STANDARD.encode(sealed))
    }

    /// Decrypt a sealed secret; the plaintext only exists inside the returned `SecretString`
    pub fn open(&self, sealed: &str, context: &str) -> Result<SecretString> {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(sealed)
            .map_err(|e| MonitorError::encryption(format!("Invalid ciphertext encoding: {}", e)))?;
        if decoded.len() < NONCE_LEN + aead::AES_256_GCM.tag_len() {
            return Err(MonitorError::encryption("Ciphertext too short"));
        }

        let (nonce_bytes, ciphertext) = decoded.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| MonitorError::encryption("Invalid nonce"))?;

        let mut in_out = Zeroizing::new(ciphertext.to_vec());
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::from(context.as_bytes()), in_out.as_mut_slice())
            .map_err(|_| MonitorError::encryption("Failed to decrypt secret"))?;

        let text = std::str::from_utf8(plaintext)
            .map_err(|_| MonitorError::encryption("Secret is not valid UTF-8"))?;
        Ok(SecretString::new(text.to_string()))
    }
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCipher").field("algorithm", &"AES-256-GCM").finish()
    }
}
