//! Error types for Changeflow
//!
//! Defines the error taxonomy shared by the transport, OAuth, vault, adapter
//! and store layers. Uses thiserror for ergonomic error handling.

use crate::model::Provider;
use crate::transport::retry::{RetryDecision, RetryableError};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for Changeflow operations
pub type Result<T> = std::result::Result<T, ChangeflowError>;

/// Why an OAuth state token was rejected.
///
/// Every variant is a security failure: the flow is aborted and never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OAuthStateError {
    /// Unknown state, or a state that was already consumed
    #[error("OAuth state not found or already consumed")]
    NotFound,

    /// The state belongs to a different user
    #[error("OAuth state does not belong to the authenticated user")]
    OwnerMismatch,

    /// The state was issued for another provider
    #[error("OAuth state was issued for {expected}, not {actual}")]
    ProviderMismatch { expected: Provider, actual: Provider },

    /// The state outlived its expiry
    #[error("OAuth state expired")]
    Expired,
}

/// Comprehensive error type for Changeflow operations
#[derive(Error, Debug)]
pub enum ChangeflowError {
    /// Engine-level configuration errors (bad file, missing vault key)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A provider is not set up (missing client id/secret)
    #[error("{provider} is not configured: {reason}")]
    NotConfigured { provider: Provider, reason: String },

    /// The attempt exceeded its deadline and was aborted
    #[error("Request to {url} timed out after {}ms", .after.as_millis())]
    Timeout { url: String, after: Duration },

    /// Transport-level failure (connection refused/reset, DNS)
    #[error("Network error: {0}")]
    Network(String),

    /// Retryable HTTP status seen by the transport retry loop
    #[error("Retryable HTTP status {status}")]
    RetryableStatus {
        status: u16,
        retry_after: Option<Duration>,
    },

    /// Retries exhausted on transient failures
    #[error("{provider} unavailable after {attempts} attempts (last status: {})", .status.map(|s| s.to_string()).unwrap_or_else(|| "network error".to_string()))]
    UpstreamUnavailable {
        provider: Provider,
        status: Option<u16>,
        attempts: u32,
    },

    /// The provider rejected the access token (HTTP 401)
    #[error("{0} rejected the access token")]
    AuthExpired(Provider),

    /// Non-retryable provider API error
    #[error("{provider} API error: HTTP {status}: {message}")]
    Upstream {
        provider: Provider,
        status: u16,
        message: String,
    },

    /// OAuth state validation failed
    #[error("OAuth state rejected: {0}")]
    OAuthState(#[from] OAuthStateError),

    /// The provider redirected back with an `error` parameter
    #[error("Authorization denied by {provider}: {reason}")]
    OAuthDenied { provider: Provider, reason: String },

    /// The token endpoint rejected a grant
    #[error("{provider} token request failed: {message}")]
    TokenExchange { provider: Provider, message: String },

    /// A refresh is required but no refresh token is stored
    #[error("{0} issued no refresh token; reconnect the integration")]
    MissingRefreshToken(Provider),

    /// The organization has no integration for this provider
    #[error("Organization {organization_id} has no {provider} integration")]
    NotConnected {
        organization_id: String,
        provider: Provider,
    },

    /// The integration was disconnected
    #[error("{provider} integration for {organization_id} is inactive")]
    IntegrationInactive {
        organization_id: String,
        provider: Provider,
    },

    /// Vault could not decrypt a credential blob
    #[error("Credential decryption failed: {0}")]
    Decryption(String),

    /// A stored record failed schema validation
    #[error("Invalid stored record: {0}")]
    Validation(String),

    /// The caller asked for something the provider cannot serve
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// SQLite database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// HTTP client errors outside of request execution (client build, body decode)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl ChangeflowError {
    /// Whether this error is a security failure that must be audited
    pub fn is_security(&self) -> bool {
        matches!(
            self,
            ChangeflowError::OAuthState(_) | ChangeflowError::Decryption(_)
        )
    }

    /// Whether this error means "not set up" rather than "temporarily broken"
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ChangeflowError::Config(_) | ChangeflowError::NotConfigured { .. }
        )
    }
}

impl RetryableError for ChangeflowError {
    fn retry_decision(&self) -> RetryDecision {
        match self {
            ChangeflowError::Network(_) => RetryDecision::Retry,
            ChangeflowError::RetryableStatus {
                retry_after: Some(delay),
                ..
            } => RetryDecision::RetryAfter(*delay),
            ChangeflowError::RetryableStatus { .. } => RetryDecision::Retry,
            // A timed-out attempt was aborted by the caller's deadline
            ChangeflowError::Timeout { .. } => RetryDecision::NoRetry,
            _ => RetryDecision::NoRetry,
        }
    }
}
