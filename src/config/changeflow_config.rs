//! Changeflow configuration file handling
//!
//! Loads and manages the ~/.config/changeflow/config.yaml file.

use crate::model::Provider;
use crate::transport::RetryPolicy;
use crate::vault::CredentialVault;
use crate::{ChangeflowError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default environment variable holding the vault key
pub const DEFAULT_KEY_ENV: &str = "CHANGEFLOW_ENCRYPTION_KEY";

/// Upper bound for `state_ttl_secs` and `refresh_skew_secs` (one year)
pub const MAX_LIFETIME_SECS: u64 = 365 * 24 * 60 * 60;

/// Retry settings for provider calls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_min_timeout_ms")]
    pub min_timeout_ms: u64,

    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,

    /// Deadline for a single attempt
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_min_timeout_ms() -> u64 {
    500
}

fn default_max_timeout_ms() -> u64 {
    8000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            min_timeout_ms: default_min_timeout_ms(),
            max_timeout_ms: default_max_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// OAuth client and endpoint settings for one provider
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Inline secret, or `$VAR` to read it from the environment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,

    /// Environment variable holding the secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret_env: Option<String>,

    /// Explicit callback URL; derived from `app_base_url` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorize_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base_url: Option<String>,

    /// Accessible-resources endpoint (Jira)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources_url: Option<String>,
}

impl fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "[redacted]"))
            .field("client_secret_env", &self.client_secret_env)
            .field("redirect_url", &self.redirect_url)
            .field("authorize_url", &self.authorize_url)
            .field("token_url", &self.token_url)
            .field("api_base_url", &self.api_base_url)
            .field("resources_url", &self.resources_url)
            .finish()
    }
}

impl ProviderSettings {
    /// Client id, treating an empty string as unset
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref().filter(|s| !s.trim().is_empty())
    }

    /// Resolve the client secret from the inline value or the environment
    pub fn client_secret(&self) -> Option<String> {
        let secret = match self.client_secret.as_deref() {
            Some(value) if value.starts_with('$') => {
                std::env::var(value.trim_start_matches('$')).ok()
            }
            Some(value) => Some(value.to_string()),
            None => self
                .client_secret_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok()),
        };
        secret.filter(|s| !s.trim().is_empty())
    }
}

/// Per-provider settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github: Option<ProviderSettings>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jira: Option<ProviderSettings>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linear: Option<ProviderSettings>,
}

impl ProvidersConfig {
    pub fn get(&self, provider: Provider) -> Option<&ProviderSettings> {
        match provider {
            Provider::GitHub => self.github.as_ref(),
            Provider::Jira => self.jira.as_ref(),
            Provider::Linear => self.linear.as_ref(),
        }
    }

    pub fn set(&mut self, provider: Provider, settings: ProviderSettings) {
        let slot = match provider {
            Provider::GitHub => &mut self.github,
            Provider::Jira => &mut self.jira,
            Provider::Linear => &mut self.linear,
        };
        *slot = Some(settings);
    }
}

/// Changeflow configuration
///
/// Represents the complete ~/.config/changeflow/config.yaml file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeflowConfig {
    /// Public base URL of the application, used to derive OAuth callbacks
    #[serde(default = "default_app_base_url")]
    pub app_base_url: String,

    /// Environment variable holding the base64 vault key
    #[serde(default = "default_key_env")]
    pub encryption_key_env: String,

    /// Inline base64 vault key; takes precedence over `encryption_key_env`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,

    /// SQLite database for integrations, OAuth state and cached items
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,

    #[serde(default)]
    pub retry: RetrySettings,

    /// Concurrent in-flight requests per provider
    #[serde(default)]
    pub limits: HashMap<Provider, usize>,

    /// Lifetime of an OAuth state record
    #[serde(default = "default_state_ttl_secs")]
    pub state_ttl_secs: u64,

    /// Refresh access tokens this long before they expire
    #[serde(default = "default_refresh_skew_secs")]
    pub refresh_skew_secs: u64,

    #[serde(default)]
    pub providers: ProvidersConfig,
}

fn default_app_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_key_env() -> String {
    DEFAULT_KEY_ENV.to_string()
}

fn default_store_path() -> PathBuf {
    // Always use ~/.config for consistency across platforms (macOS, Linux)
    let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(".config");
    path.push("changeflow");
    path.push("changeflow.db");
    path
}

fn bounded_seconds(secs: u64) -> chrono::Duration {
    // Fits in i64 after the clamp
    chrono::Duration::seconds(secs.min(MAX_LIFETIME_SECS) as i64)
}

fn default_state_ttl_secs() -> u64 {
    600
}

fn default_refresh_skew_secs() -> u64 {
    60
}

impl ChangeflowConfig {
    /// Create a configuration with defaults and no providers
    pub fn new() -> Self {
        Self {
            app_base_url: default_app_base_url(),
            encryption_key_env: default_key_env(),
            encryption_key: None,
            store_path: default_store_path(),
            retry: RetrySettings::default(),
            limits: HashMap::new(),
            state_ttl_secs: default_state_ttl_secs(),
            refresh_skew_secs: default_refresh_skew_secs(),
            providers: ProvidersConfig::default(),
        }
    }

    /// Load configuration from the default path (~/.config/changeflow/config.yaml)
    pub fn load_default() -> Result<Self> {
        let path = Self::default_path();
        Self::load(&path)
    }

    /// Load configuration from a specific path
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ChangeflowError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        tracing::info!(path = %path.display(), "Loading Changeflow configuration");

        let content = fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;

        tracing::debug!(
            providers = config.configured_providers().len(),
            store = %config.store_path.display(),
            "Configuration loaded successfully"
        );

        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        tracing::info!(path = %path.display(), "Saving Changeflow configuration");

        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)?;

        Ok(())
    }

    /// Get the default config path (~/.config/changeflow/config.yaml)
    pub fn default_path() -> PathBuf {
        let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(".config");
        path.push("changeflow");
        path.push("config.yaml");
        path
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            min_timeout: Duration::from_millis(self.retry.min_timeout_ms),
            max_timeout: Duration::from_millis(self.retry.max_timeout_ms),
            request_timeout: Duration::from_millis(self.retry.request_timeout_ms),
        }
    }

    /// OAuth state lifetime, clamped to [`MAX_LIFETIME_SECS`]
    pub fn state_ttl(&self) -> chrono::Duration {
        bounded_seconds(self.state_ttl_secs)
    }

    /// Refresh lead time, clamped to [`MAX_LIFETIME_SECS`]
    pub fn refresh_skew(&self) -> chrono::Duration {
        bounded_seconds(self.refresh_skew_secs)
    }

    pub fn provider(&self, provider: Provider) -> Option<&ProviderSettings> {
        self.providers.get(provider)
    }

    /// Providers with a client id and a resolvable secret
    pub fn configured_providers(&self) -> Vec<Provider> {
        Provider::ALL
            .into_iter()
            .filter(|p| {
                self.provider(*p)
                    .map(|s| s.client_id().is_some() && s.client_secret().is_some())
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Callback URL for a provider: explicit override or `{app_base_url}/api/auth/{provider}/callback`
    pub fn redirect_url(&self, provider: Provider) -> String {
        self.provider(provider)
            .and_then(|s| s.redirect_url.clone())
            .unwrap_or_else(|| {
                format!(
                    "{}/api/auth/{}/callback",
                    self.app_base_url.trim_end_matches('/'),
                    provider
                )
            })
    }

    /// Base64 vault key from the inline value or the configured environment variable
    pub fn encryption_key(&self) -> Result<String> {
        if let Some(key) = self.encryption_key.as_deref().filter(|k| !k.is_empty()) {
            return Ok(key.to_string());
        }
        std::env::var(&self.encryption_key_env).map_err(|_| {
            ChangeflowError::Config(format!(
                "No encryption key: set {} or encryption_key",
                self.encryption_key_env
            ))
        })
    }

    /// Build the credential vault from the configured key
    pub fn vault(&self) -> Result<CredentialVault> {
        CredentialVault::from_base64(&self.encryption_key()?)
    }
}

impl Default for ChangeflowConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn github_settings() -> ProviderSettings {
        ProviderSettings {
            client_id: Some("gh-client".to_string()),
            client_secret: Some("gh-secret".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = ChangeflowConfig::new();
        assert_eq!(config.encryption_key_env, DEFAULT_KEY_ENV);
        assert_eq!(config.state_ttl_secs, 600);
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert!(config.configured_providers().is_empty());
    }

    #[test]
    fn test_minimal_yaml_fills_defaults() {
        let yaml = r#"
app_base_url: https://app.example.com/
limits:
  github: 2
providers:
  github:
    client_id: abc
    client_secret: shh
"#;
        let config: ChangeflowConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.limits.get(&Provider::GitHub), Some(&2));
        assert_eq!(config.retry.max_timeout_ms, 8000);
        assert_eq!(config.configured_providers(), vec![Provider::GitHub]);
        assert_eq!(
            config.redirect_url(Provider::GitHub),
            "https://app.example.com/api/auth/github/callback"
        );
    }

    #[test]
    fn test_lifetimes_are_clamped() {
        let mut config = ChangeflowConfig::new();
        config.state_ttl_secs = u64::MAX;
        config.refresh_skew_secs = u64::MAX;

        let cap = chrono::Duration::seconds(MAX_LIFETIME_SECS as i64);
        assert_eq!(config.state_ttl(), cap);
        assert_eq!(config.refresh_skew(), cap);
    }

    #[test]
    fn test_redirect_url_override() {
        let mut config = ChangeflowConfig::new();
        config.providers.set(
            Provider::Linear,
            ProviderSettings {
                redirect_url: Some("https://tunnel.example/cb".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(config.redirect_url(Provider::Linear), "https://tunnel.example/cb");
    }

    #[test]
    fn test_client_secret_from_env() {
        std::env::set_var("CHANGEFLOW_TEST_JIRA_SECRET", "from-env");
        let settings = ProviderSettings {
            client_id: Some("jira".to_string()),
            client_secret_env: Some("CHANGEFLOW_TEST_JIRA_SECRET".to_string()),
            ..Default::default()
        };
        assert_eq!(settings.client_secret().as_deref(), Some("from-env"));

        let settings = ProviderSettings {
            client_secret: Some("$CHANGEFLOW_TEST_JIRA_SECRET".to_string()),
            ..Default::default()
        };
        assert_eq!(settings.client_secret().as_deref(), Some("from-env"));

        let settings = ProviderSettings {
            client_secret: Some("$CHANGEFLOW_TEST_UNSET_SECRET".to_string()),
            ..Default::default()
        };
        assert!(settings.client_secret().is_none());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let rendered = format!("{:?}", github_settings());
        assert!(rendered.contains("gh-client"));
        assert!(!rendered.contains("gh-secret"));
    }

    #[test]
    fn test_inline_encryption_key() {
        let mut config = ChangeflowConfig::new();
        config.encryption_key_env = "CHANGEFLOW_TEST_KEY_UNSET".to_string();
        assert!(matches!(config.vault(), Err(ChangeflowError::Config(_))));

        config.encryption_key = Some(CredentialVault::generate_key().unwrap());
        assert!(config.vault().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path();

        let mut config = ChangeflowConfig::new();
        config.providers.set(Provider::GitHub, github_settings());
        config.limits.insert(Provider::Jira, 3);
        config.save(path).unwrap();

        let loaded = ChangeflowConfig::load(path).unwrap();
        assert_eq!(loaded.providers, config.providers);
        assert_eq!(loaded.limits.get(&Provider::Jira), Some(&3));
    }

    #[test]
    fn test_default_path() {
        let path = ChangeflowConfig::default_path();
        assert!(path.ends_with("changeflow/config.yaml"));
    }

    #[test]
    fn test_load_missing_file() {
        let result = ChangeflowConfig::load("/nonexistent/config.yaml");
        assert!(matches!(result, Err(ChangeflowError::Config(_))));
    }
}
