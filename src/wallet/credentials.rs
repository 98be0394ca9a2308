//! X credential encryption using AES-256-GCM with Argon2id key derivation
//!
//! Access and refresh tokens of linked X accounts are sealed with a
//! server-side secret before they reach the database.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use anyhow::{anyhow, Context, Result};
use argon2::Argon2;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Sealed credential with all data needed for decryption
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedCredential {
    /// AES-256-GCM ciphertext
    pub ciphertext: Vec<u8>,
    /// Salt for Argon2id key derivation (16 bytes)
    pub salt: Vec<u8>,
    /// Nonce for AES-GCM (12 bytes)
    pub nonce: Vec<u8>,
}

/// Plaintext tokens for a linked X account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XTokens {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Seals and opens credentials with the configured server secret
#[derive(Clone)]
pub struct CredentialVault {
    secret: String,
}

impl CredentialVault {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn seal(&self, tokens: &XTokens) -> Result<EncryptedCredential> {
        let plaintext = serde_json::to_vec(tokens).context("Failed to serialize tokens")?;
        encrypt(&plaintext, &self.secret)
    }

    pub fn open(&self, sealed: &EncryptedCredential) -> Result<XTokens> {
        let plaintext = decrypt(sealed, &self.secret)?;
        serde_json::from_slice(&plaintext).context("Invalid credential payload")
    }
}

fn derive_key(secret: &str, salt: &[u8]) -> Result<[u8; 32]> {
    let mut key_bytes = [0u8; 32];
    Argon2::default()
        .hash_password_into(secret.as_bytes(), salt, &mut key_bytes)
        .map_err(|e| anyhow!("Failed to derive key: {}", e))?;
    Ok(key_bytes)
}

fn encrypt(plaintext: &[u8], secret: &str) -> Result<EncryptedCredential> {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    let key_bytes = derive_key(secret, &salt)?;

    let mut nonce_bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);

    let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
    let cipher = Aes256Gcm::new(key);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| anyhow!("Encryption failed: {}", e))?;

    Ok(EncryptedCredential {
        ciphertext,
        salt: salt.to_vec(),
        nonce: nonce_bytes.to_vec(),
    })
}

fn decrypt(sealed: &EncryptedCredential, secret: &str) -> Result<Vec<u8>> {
    if sealed.nonce.len() != 12 {
        return Err(anyhow!("Invalid nonce length: {}", sealed.nonce.len()));
    }
    let key_bytes = derive_key(secret, &sealed.salt)?;

    let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
    let cipher = Aes256Gcm::new(key);
    let nonce = Nonce::from_slice(&sealed.nonce);

    cipher
        .decrypt(nonce, sealed.ciphertext.as_ref())
        .map_err(|_| anyhow!("Decryption failed - wrong credential secret"))
}
