//! Wallet identity and credential storage
//!
//! Provides wallet sign-in verification and encryption of linked X tokens.

mod credentials;
mod identity;

pub use credentials::{CredentialVault, EncryptedCredential, XTokens};
pub use identity::{generate_nonce, normalize_address, sign_in_message, verify_signature};
