//! Credential vault
//!
//! Encrypts OAuth token sets before they reach the store. Ciphertext is
//! `base64(nonce || AES-256-GCM(json(credentials)))` with a fresh 96-bit nonce
//! per encryption.

use crate::{ChangeflowError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Required key length in bytes
pub const KEY_LEN: usize = 32;

/// Plaintext token set held inside the vault envelope
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// `None` for tokens that never expire
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"[redacted]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[redacted]"),
            )
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .field("token_type", &self.token_type)
            .finish()
    }
}

/// Freshness of an access token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    Active,
    /// Valid now but inside the refresh window
    Expiring,
    Expired,
}

impl Credentials {
    /// Classify the access token, treating anything inside `skew` of expiry as expiring
    pub fn status(&self, now: DateTime<Utc>, skew: Duration) -> TokenStatus {
        match self.expires_at {
            None => TokenStatus::Active,
            Some(at) if now >= at => TokenStatus::Expired,
            Some(at) if now + skew >= at => TokenStatus::Expiring,
            Some(_) => TokenStatus::Active,
        }
    }

    pub fn needs_refresh(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        self.status(now, skew) != TokenStatus::Active
    }

    /// Granted scopes, accepting space- or comma-separated lists
    pub fn scopes(&self) -> Vec<String> {
        self.scope
            .as_deref()
            .unwrap_or_default()
            .split([' ', ','])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Symmetric encryption for stored credentials.
///
/// The key is injected at construction; the vault is the only component that
/// can turn ciphertext back into [`Credentials`].
pub struct CredentialVault {
    key: Vec<u8>,
}

impl fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialVault").finish_non_exhaustive()
    }
}

impl CredentialVault {
    /// Create a vault from raw key bytes
    pub fn new(key: impl Into<Vec<u8>>) -> Result<Self> {
        let key = key.into();
        if key.len() != KEY_LEN {
            return Err(ChangeflowError::Config(format!(
                "Encryption key must be {} bytes, got {}",
                KEY_LEN,
                key.len()
            )));
        }
        Ok(Self { key })
    }

    /// Create a vault from a base64-encoded key
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let key = STANDARD
            .decode(encoded.trim())
            .map_err(|e| ChangeflowError::Config(format!("Encryption key is not valid base64: {}", e)))?;
        Self::new(key)
    }

    /// Generate a random base64-encoded key
    pub fn generate_key() -> Result<String> {
        let mut key = [0u8; KEY_LEN];
        SystemRandom::new()
            .fill(&mut key)
            .map_err(|_| ChangeflowError::Other("Failed to generate encryption key".to_string()))?;
        Ok(STANDARD.encode(key))
    }

    fn sealing_key(&self) -> Result<LessSafeKey> {
        let unbound = UnboundKey::new(&AES_256_GCM, &self.key)
            .map_err(|_| ChangeflowError::Config("Invalid encryption key".to_string()))?;
        Ok(LessSafeKey::new(unbound))
    }

    /// Encrypt a credential set
    pub fn encrypt(&self, credentials: &Credentials) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        SystemRandom::new()
            .fill(&mut nonce_bytes)
            .map_err(|_| ChangeflowError::Other("Failed to generate nonce".to_string()))?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut data = serde_json::to_vec(credentials)?;
        self.sealing_key()?
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut data)
            .map_err(|_| ChangeflowError::Other("Failed to encrypt credentials".to_string()))?;

        let mut combined = nonce_bytes.to_vec();
        combined.extend(data);
        Ok(STANDARD.encode(combined))
    }

    /// Decrypt a credential set.
    ///
    /// Any failure (wrong key, tampering, truncation, malformed payload) is a
    /// [`ChangeflowError::Decryption`], never an empty result.
    pub fn decrypt(&self, ciphertext: &str) -> Result<Credentials> {
        let combined = STANDARD.decode(ciphertext.trim()).map_err(|_| {
            warn!("Credential blob is not valid base64");
            ChangeflowError::Decryption("ciphertext is not valid base64".to_string())
        })?;

        if combined.len() <= NONCE_LEN {
            warn!(len = combined.len(), "Credential blob too short");
            return Err(ChangeflowError::Decryption(
                "ciphertext is too short".to_string(),
            ));
        }

        let (nonce_bytes, sealed) = combined.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| ChangeflowError::Decryption("invalid nonce".to_string()))?;

        let mut sealed = sealed.to_vec();
        let plaintext = self
            .sealing_key()?
            .open_in_place(nonce, Aad::empty(), &mut sealed)
            .map_err(|_| {
                warn!("Credential blob failed authentication");
                ChangeflowError::Decryption(
                    "authentication failed (wrong key or corrupted data)".to_string(),
                )
            })?;

        serde_json::from_slice(plaintext).map_err(|_| {
            ChangeflowError::Decryption("decrypted payload is not a credential set".to_string())
        })
    }
}
