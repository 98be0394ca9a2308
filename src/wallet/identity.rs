//! Wallet identity: address normalization and sign-in signature checks

use alloy::primitives::{Address, Signature};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::RngCore;
use std::str::FromStr;

/// Parse an Ethereum address and return it lowercased with `0x` prefix.
/// Wallets are keyed by this form everywhere in the database.
pub fn normalize_address(address: &str) -> Result<String> {
    let parsed = Address::from_str(address.trim()).context("Invalid wallet address")?;
    Ok(parsed.to_string().to_lowercase())
}

/// Random hex nonce for a sign-in challenge
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Message the wallet signs (EIP-191 personal message) to open a session
pub fn sign_in_message(address: &str, nonce: &str, issued_at: DateTime<Utc>) -> String {
    format!(
        "Sign in to Social Markets\n\nWallet: {}\nNonce: {}\nIssued At: {}",
        address,
        nonce,
        issued_at.to_rfc3339()
    )
}

/// True if `signature` over `message` recovers to `expected_address`
pub fn verify_signature(message: &str, signature: &str, expected_address: &str) -> Result<bool> {
    let signature = Signature::from_str(signature.trim()).context("Malformed signature")?;
    let recovered = signature
        .recover_address_from_msg(message.as_bytes())
        .context("Failed to recover signer")?;
    let expected = Address::from_str(expected_address.trim()).context("Invalid wallet address")?;
    Ok(recovered == expected)
}
