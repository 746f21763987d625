//! Configuration validation
//!
//! Validates Changeflow configuration for correctness:
//! - Valid URLs for the app and every endpoint override
//! - Sane retry bounds and concurrency limits
//! - Provider credentials that are partially filled in
//! - A usable vault key

use super::changeflow_config::{ChangeflowConfig, ProviderSettings, MAX_LIFETIME_SECS};
use crate::model::Provider;
use crate::vault::CredentialVault;
use crate::ChangeflowError;

/// Validation error details
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub provider: Option<Provider>,
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            provider: None,
            field: field.into(),
            message: message.into(),
        }
    }

    fn with_provider(mut self, provider: Provider) -> Self {
        self.provider = Some(provider);
        self
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(provider) = self.provider {
            write!(f, "[{}] {}: {}", provider, self.field, self.message)
        } else {
            write!(f, "{}: {}", self.field, self.message)
        }
    }
}

/// Validation result
pub type ValidationResult = std::result::Result<(), Vec<ValidationError>>;

/// Validate a Changeflow configuration, reporting every problem found
pub fn validate_config(config: &ChangeflowConfig) -> ValidationResult {
    let mut errors = Vec::new();

    if !is_http_url(&config.app_base_url) {
        errors.push(ValidationError::new(
            "app_base_url",
            format!("Invalid URL: {}", config.app_base_url),
        ));
    }

    let retry = &config.retry;
    if retry.min_timeout_ms == 0 {
        errors.push(ValidationError::new(
            "retry.min_timeout_ms",
            "Minimum backoff must be greater than 0",
        ));
    }
    if retry.max_timeout_ms < retry.min_timeout_ms {
        errors.push(ValidationError::new(
            "retry.max_timeout_ms",
            format!(
                "Maximum backoff ({}ms) is below the minimum ({}ms)",
                retry.max_timeout_ms, retry.min_timeout_ms
            ),
        ));
    }
    if retry.request_timeout_ms == 0 {
        errors.push(ValidationError::new(
            "retry.request_timeout_ms",
            "Request timeout must be greater than 0",
        ));
    }

    for (provider, permits) in &config.limits {
        if *permits == 0 {
            errors.push(
                ValidationError::new("limits", "Permit count must be at least 1")
                    .with_provider(*provider),
            );
        }
    }

    if config.state_ttl_secs == 0 {
        errors.push(ValidationError::new(
            "state_ttl_secs",
            "OAuth state lifetime must be greater than 0",
        ));
    }
    for (field, secs) in [
        ("state_ttl_secs", config.state_ttl_secs),
        ("refresh_skew_secs", config.refresh_skew_secs),
    ] {
        if secs > MAX_LIFETIME_SECS {
            errors.push(ValidationError::new(
                field,
                format!("{}s exceeds the maximum of {}s", secs, MAX_LIFETIME_SECS),
            ));
        }
    }

    match config.encryption_key() {
        Ok(key) => {
            if let Err(e) = CredentialVault::from_base64(&key) {
                errors.push(ValidationError::new("encryption_key", e.to_string()));
            }
        }
        Err(_) => {
            tracing::warn!(
                env_var = %config.encryption_key_env,
                "Encryption key not set (this may be intentional if set at runtime)"
            );
        }
    }

    for provider in Provider::ALL {
        if let Some(settings) = config.provider(provider) {
            if let Err(mut provider_errors) = validate_provider(provider, settings) {
                errors.append(&mut provider_errors);
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate one provider block
fn validate_provider(provider: Provider, settings: &ProviderSettings) -> ValidationResult {
    let mut errors = Vec::new();

    let has_id = settings.client_id().is_some();
    let has_secret = settings.client_secret.is_some() || settings.client_secret_env.is_some();

    if has_id && !has_secret {
        errors.push(
            ValidationError::new("client_secret", "client_id is set but no client secret")
                .with_provider(provider),
        );
    }
    if has_secret && !has_id {
        errors.push(
            ValidationError::new("client_id", "client secret is set but no client_id")
                .with_provider(provider),
        );
    }

    if let Some(ref var) = settings.client_secret_env {
        if std::env::var(var).is_err() {
            tracing::warn!(
                provider = %provider,
                env_var = %var,
                "Environment variable not set (this may be intentional if set at runtime)"
            );
        }
    }

    let urls = [
        ("redirect_url", &settings.redirect_url),
        ("authorize_url", &settings.authorize_url),
        ("token_url", &settings.token_url),
        ("api_base_url", &settings.api_base_url),
        ("resources_url", &settings.resources_url),
    ];
    for (field, value) in urls {
        if let Some(url) = value {
            if !is_http_url(url) {
                errors.push(
                    ValidationError::new(field, format!("Invalid URL: {}", url))
                        .with_provider(provider),
                );
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn is_http_url(value: &str) -> bool {
    url::Url::parse(value)
        .map(|u| matches!(u.scheme(), "http" | "https") && u.host().is_some())
        .unwrap_or(false)
}

/// Validate configuration and return a Result
pub fn validate_config_result(config: &ChangeflowConfig) -> crate::Result<()> {
    validate_config(config).map_err(|errors| {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        ChangeflowError::Config(format!(
            "Configuration validation failed:\n  - {}",
            messages.join("\n  - ")
        ))
    })
}
