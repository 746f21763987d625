//! Static per-provider OAuth table and resolved client settings

use super::pkce::PkceChallenge;
use crate::config::ChangeflowConfig;
use crate::model::Provider;
use crate::{ChangeflowError, Result};
use std::fmt;
use url::Url;

/// How a token endpoint expects its request body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenBodyFormat {
    Form,
    Json,
}

/// Fixed OAuth facts about a provider
#[derive(Debug)]
pub struct ProviderSpec {
    pub provider: Provider,
    pub authorize_url: &'static str,
    pub token_url: &'static str,
    pub api_base_url: &'static str,
    /// Endpoint listing the sites a token can reach
    pub resources_url: Option<&'static str>,
    pub scopes: &'static [&'static str],
    pub scope_separator: &'static str,
    pub extra_authorize_params: &'static [(&'static str, &'static str)],
    pub token_body: TokenBodyFormat,
    pub uses_pkce: bool,
}

static GITHUB: ProviderSpec = ProviderSpec {
    provider: Provider::GitHub,
    authorize_url: "https://github.com/login/oauth/authorize",
    token_url: "https://github.com/login/oauth/access_token",
    api_base_url: "https://api.github.com",
    resources_url: None,
    scopes: &["repo", "read:user"],
    scope_separator: " ",
    extra_authorize_params: &[],
    token_body: TokenBodyFormat::Form,
    uses_pkce: false,
};

static JIRA: ProviderSpec = ProviderSpec {
    provider: Provider::Jira,
    authorize_url: "https://auth.atlassian.com/authorize",
    token_url: "https://auth.atlassian.com/oauth/token",
    api_base_url: "https://api.atlassian.com",
    resources_url: Some("https://api.atlassian.com/oauth/token/accessible-resources"),
    scopes: &["read:jira-work", "read:jira-user", "offline_access"],
    scope_separator: " ",
    extra_authorize_params: &[("audience", "api.atlassian.com"), ("prompt", "consent")],
    token_body: TokenBodyFormat::Json,
    uses_pkce: false,
};

static LINEAR: ProviderSpec = ProviderSpec {
    provider: Provider::Linear,
    authorize_url: "https://linear.app/oauth/authorize",
    token_url: "https://api.linear.app/oauth/token",
    api_base_url: "https://api.linear.app",
    resources_url: None,
    scopes: &["read"],
    scope_separator: ",",
    extra_authorize_params: &[],
    token_body: TokenBodyFormat::Form,
    uses_pkce: true,
};

/// Look up the static table entry for a provider
pub fn provider_spec(provider: Provider) -> &'static ProviderSpec {
    match provider {
        Provider::GitHub => &GITHUB,
        Provider::Jira => &JIRA,
        Provider::Linear => &LINEAR,
    }
}

/// API base URL for a provider, honoring a configured override
pub fn api_base_url(config: &ChangeflowConfig, provider: Provider) -> String {
    config
        .provider(provider)
        .and_then(|s| s.api_base_url.clone())
        .unwrap_or_else(|| provider_spec(provider).api_base_url.to_string())
        .trim_end_matches('/')
        .to_string()
}

/// A provider's OAuth client with credentials and endpoints resolved
#[derive(Clone)]
pub struct OAuthClient {
    pub provider: Provider,
    pub client_id: String,
    client_secret: String,
    pub redirect_url: String,
    pub authorize_url: String,
    pub token_url: String,
    pub resources_url: Option<String>,
    pub spec: &'static ProviderSpec,
}

impl fmt::Debug for OAuthClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthClient")
            .field("provider", &self.provider)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[redacted]")
            .field("redirect_url", &self.redirect_url)
            .field("token_url", &self.token_url)
            .finish_non_exhaustive()
    }
}

impl OAuthClient {
    /// Resolve a provider's client from configuration.
    ///
    /// A missing client id or secret is [`ChangeflowError::NotConfigured`] for
    /// this provider only.
    pub fn resolve(provider: Provider, config: &ChangeflowConfig) -> Result<Self> {
        let spec = provider_spec(provider);
        let settings = config
            .provider(provider)
            .ok_or_else(|| ChangeflowError::NotConfigured {
                provider,
                reason: "no provider settings".to_string(),
            })?;

        let client_id = settings
            .client_id()
            .ok_or_else(|| ChangeflowError::NotConfigured {
                provider,
                reason: "missing client_id".to_string(),
            })?
            .to_string();

        let client_secret = settings
            .client_secret()
            .ok_or_else(|| ChangeflowError::NotConfigured {
                provider,
                reason: "missing client secret".to_string(),
            })?;

        Ok(Self {
            provider,
            client_id,
            client_secret,
            redirect_url: config.redirect_url(provider),
            authorize_url: settings
                .authorize_url
                .clone()
                .unwrap_or_else(|| spec.authorize_url.to_string()),
            token_url: settings
                .token_url
                .clone()
                .unwrap_or_else(|| spec.token_url.to_string()),
            resources_url: spec.resources_url.map(|default| {
                settings
                    .resources_url
                    .clone()
                    .unwrap_or_else(|| default.to_string())
            }),
            spec,
        })
    }

    pub fn client_secret(&self) -> &str {
        &self.client_secret
    }

    pub fn scope(&self) -> String {
        self.spec.scopes.join(self.spec.scope_separator)
    }

    /// Build the authorization redirect URL
    pub fn authorization_url(&self, state: &str, pkce: Option<&PkceChallenge>) -> Result<String> {
        let mut url = Url::parse(&self.authorize_url).map_err(|e| {
            ChangeflowError::Config(format!(
                "Invalid authorize URL for {}: {}",
                self.provider, e
            ))
        })?;

        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("client_id", &self.client_id)
                .append_pair("redirect_uri", &self.redirect_url)
                .append_pair("response_type", "code")
                .append_pair("scope", &self.scope())
                .append_pair("state", state);

            for (key, value) in self.spec.extra_authorize_params {
                query.append_pair(key, value);
            }

            if let Some(pkce) = pkce {
                query
                    .append_pair("code_challenge", &pkce.challenge)
                    .append_pair("code_challenge_method", PkceChallenge::METHOD);
            }
        }

        Ok(url.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderSettings;
    use std::collections::HashMap;

    fn config_with(provider: Provider, settings: ProviderSettings) -> ChangeflowConfig {
        let mut config = ChangeflowConfig::new();
        config.app_base_url = "https://app.example.com".to_string();
        config.providers.set(provider, settings);
        config
    }

    fn credentials() -> ProviderSettings {
        ProviderSettings {
            client_id: Some("client".to_string()),
            client_secret: Some("secret".to_string()),
            ..Default::default()
        }
    }

    fn query(url: &str) -> HashMap<String, String> {
        Url::parse(url).unwrap().query_pairs().into_owned().collect()
    }

    #[test]
    fn test_missing_credentials_is_not_configured() {
        let config = ChangeflowConfig::new();
        assert!(matches!(
            OAuthClient::resolve(Provider::GitHub, &config),
            Err(ChangeflowError::NotConfigured {
                provider: Provider::GitHub,
                ..
            })
        ));

        let config = config_with(
            Provider::Jira,
            ProviderSettings {
                client_id: Some("client".to_string()),
                ..Default::default()
            },
        );
        let err = OAuthClient::resolve(Provider::Jira, &config).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("secret"));
    }

    #[test]
    fn test_github_authorization_url() {
        let config = config_with(Provider::GitHub, credentials());
        let client = OAuthClient::resolve(Provider::GitHub, &config).unwrap();
        let url = client.authorization_url("st4te", None).unwrap();

        assert!(url.starts_with("https://github.com/login/oauth/authorize?"));
        let params = query(&url);
        assert_eq!(params["client_id"], "client");
        assert_eq!(params["state"], "st4te");
        assert_eq!(params["scope"], "repo read:user");
        assert_eq!(
            params["redirect_uri"],
            "https://app.example.com/api/auth/github/callback"
        );
        assert!(!params.contains_key("code_challenge"));
    }

    #[test]
    fn test_jira_authorization_url_has_audience() {
        let config = config_with(Provider::Jira, credentials());
        let client = OAuthClient::resolve(Provider::Jira, &config).unwrap();
        let params = query(&client.authorization_url("s", None).unwrap());

        assert_eq!(params["audience"], "api.atlassian.com");
        assert_eq!(params["prompt"], "consent");
        assert!(params["scope"].contains("offline_access"));
        assert_eq!(client.spec.token_body, TokenBodyFormat::Json);
    }

    #[test]
    fn test_linear_uses_pkce() {
        let config = config_with(Provider::Linear, credentials());
        let client = OAuthClient::resolve(Provider::Linear, &config).unwrap();
        assert!(client.spec.uses_pkce);

        let pkce = super::super::pkce::generate_pkce();
        let params = query(&client.authorization_url("s", Some(&pkce)).unwrap());
        assert_eq!(params["code_challenge"], pkce.challenge);
        assert_eq!(params["code_challenge_method"], "S256");
    }

    #[test]
    fn test_endpoint_overrides() {
        let config = config_with(
            Provider::GitHub,
            ProviderSettings {
                token_url: Some("http://127.0.0.1:9/token".to_string()),
                api_base_url: Some("https://ghe.example.com/api/v3/".to_string()),
                ..credentials()
            },
        );
        let client = OAuthClient::resolve(Provider::GitHub, &config).unwrap();
        assert_eq!(client.token_url, "http://127.0.0.1:9/token");
        assert_eq!(
            api_base_url(&config, Provider::GitHub),
            "https://ghe.example.com/api/v3"
        );
        assert_eq!(
            api_base_url(&ChangeflowConfig::new(), Provider::Linear),
            "https://api.linear.app"
        );
    }

    #[test]
    fn test_debug_redacts_secret() {
        let config = config_with(Provider::GitHub, credentials());
        let client = OAuthClient::resolve(Provider::GitHub, &config).unwrap();
        let rendered = format!("{:?}", client);
        assert!(!rendered.contains("\"secret\""));
        assert!(rendered.contains("[redacted]"));
    }
}
