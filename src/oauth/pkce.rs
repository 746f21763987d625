//! Anti-replay state and PKCE generation.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Generate an OAuth state token with 256 bits of entropy.
///
/// Returns a 43-character base64url string, safe to place in a query string.
pub fn generate_oauth_state() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// PKCE verifier and S256 challenge.
#[derive(Clone, Debug)]
pub struct PkceChallenge {
    /// Kept server-side in the state record, sent at token exchange
    pub verifier: String,
    /// Sent on the authorization URL
    pub challenge: String,
}

impl PkceChallenge {
    pub const METHOD: &'static str = "S256";
}

/// Generate a PKCE verifier and its S256 challenge.
///
/// The verifier is 32 random bytes, base64url-encoded (43 characters).
pub fn generate_pkce() -> PkceChallenge {
    let mut verifier_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut verifier_bytes);
    let verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);

    PkceChallenge {
        challenge: challenge_for(&verifier),
        verifier,
    }
}

/// S256 challenge for a verifier
pub fn challenge_for(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_is_random_and_url_safe() {
        let a = generate_oauth_state();
        let b = generate_oauth_state();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(a
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_pkce_challenge_matches_verifier() {
        let pkce = generate_pkce();
        assert_eq!(pkce.verifier.len(), 43);
        assert_eq!(pkce.challenge, challenge_for(&pkce.verifier));
        assert_ne!(pkce.challenge, pkce.verifier);
    }

    #[test]
    fn test_rfc7636_example() {
        // Appendix B of RFC 7636
        assert_eq!(
            challenge_for("dBjftJeZ4CVP-mJ0kKx_Zy1KZJVWnOb_2PNSpIt_zXc"),
            "E9Melhoa2OwvFWIKLWvCTjyI2F-s1ZcLRlA8KDNpsEc"
        );
    }
}
