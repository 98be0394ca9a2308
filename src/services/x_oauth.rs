//! OAuth 2.0 authorization-code flow with PKCE for linking X accounts

use crate::config::XApi;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Server-side state kept between initiate and callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingLink {
    pub wallet: String,
    pub code_verifier: String,
    pub redirect_uri: String,
}

/// Random 32-byte hex `state` parameter
pub fn generate_state() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Random base64url PKCE verifier (43 characters)
pub fn generate_code_verifier() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// S256 challenge: base64url(sha256(verifier)) without padding
pub fn code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Browser URL that starts the X consent screen
pub fn authorize_url(client_id: &str, redirect_uri: &str, state: &str, challenge: &str) -> String {
    format!(
        "{}?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}&code_challenge={}&code_challenge_method=S256",
        XApi::AUTHORIZE_URL,
        urlencoding::encode(client_id),
        urlencoding::encode(redirect_uri),
        urlencoding::encode(XApi::SCOPES),
        urlencoding::encode(state),
        urlencoding::encode(challenge),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_matches_rfc7636_vector() {
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(
            code_challenge(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn test_generated_values() {
        let state = generate_state();
        assert_eq!(state.len(), 64);
        assert_ne!(state, generate_state());

        let verifier = generate_code_verifier();
        assert_eq!(verifier.len(), 43);
        assert!(verifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_authorize_url() {
        let url = authorize_url("client 1", "https://app.example/api/auth/x/callback", "st", "ch");
        assert!(url.starts_with("https://twitter.com/i/oauth2/authorize?response_type=code"));
        assert!(url.contains("client_id=client%201"));
        assert!(url.contains("redirect_uri=https%3A%2F%2Fapp.example%2Fapi%2Fauth%2Fx%2Fcallback"));
        assert!(url.contains("scope=tweet.read%20users.read"));
        assert!(url.contains("code_challenge_method=S256"));
    }
}
