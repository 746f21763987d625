//! OAuth token lifecycle
//!
//! Drives an authorization flow from redirect to stored credentials, and keeps
//! access tokens fresh afterwards:
//!
//! ```text
//! Initiated -> CodeReceived -> TokenExchanged -> [Active <-> Refreshing] -> Revoked/Expired
//! ```
//!
//! Token endpoints are called through the same [`Gateway`] as data requests,
//! so token traffic counts against the provider's concurrency budget.

pub mod pkce;
pub mod providers;

pub use pkce::{generate_oauth_state, generate_pkce, PkceChallenge};
pub use providers::{api_base_url, provider_spec, OAuthClient, ProviderSpec, TokenBodyFormat};

use crate::config::ChangeflowConfig;
use crate::error::OAuthStateError;
use crate::model::{AccessibleResource, IntegrationConfig, IntegrationRecord, OAuthStateRecord, Provider};
use crate::store::Store;
use crate::transport::{decode_response, Gateway};
use crate::vault::{CredentialVault, Credentials, TokenStatus};
use crate::{ChangeflowError, Result};
use chrono::{DateTime, Duration, Utc};
use reqwest::{header, Request};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Authorization redirect handed to the user agent
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub provider: Provider,
    pub url: String,
    pub state: String,
    pub expires_at: DateTime<Utc>,
}

/// Query parameters delivered to the callback route
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    #[serde(default)]
    pub code: Option<String>,
    pub state: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// A valid access token for one call chain.
///
/// Never persisted; obtain a fresh one from [`OAuthManager::access_token`]
/// for each call chain.
#[derive(Clone)]
pub struct AccessToken {
    pub provider: Provider,
    pub organization_id: String,
    pub config: IntegrationConfig,
    /// Set when this token came from a refresh in the same call
    pub refreshed: bool,
    token: String,
}

impl AccessToken {
    pub fn new(
        provider: Provider,
        organization_id: impl Into<String>,
        token: impl Into<String>,
        config: IntegrationConfig,
    ) -> Self {
        Self {
            provider,
            organization_id: organization_id.into(),
            config,
            refreshed: false,
            token: token.into(),
        }
    }

    /// Mark the token as freshly issued by a refresh
    pub fn mark_refreshed(mut self) -> Self {
        self.refreshed = true;
        self
    }

    pub fn secret(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("provider", &self.provider)
            .field("organization_id", &self.organization_id)
            .field("token", &"[redacted]")
            .finish()
    }
}

/// Token endpoint response; success and error fields share one shape
#[derive(Debug, Default, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

enum Grant<'a> {
    AuthorizationCode {
        code: &'a str,
        verifier: Option<&'a str>,
    },
    RefreshToken(&'a str),
}

impl Grant<'_> {
    fn name(&self) -> &'static str {
        match self {
            Grant::AuthorizationCode { .. } => "authorization_code",
            Grant::RefreshToken(_) => "refresh_token",
        }
    }
}

/// First characters of a state token, for audit logs
fn state_prefix(state: &str) -> &str {
    let end = state
        .char_indices()
        .nth(8)
        .map(|(i, _)| i)
        .unwrap_or(state.len());
    &state[..end]
}

/// Authorization-code exchange, refresh and credential storage for all providers
pub struct OAuthManager {
    config: Arc<ChangeflowConfig>,
    gateway: Gateway,
    vault: Arc<CredentialVault>,
    store: Arc<dyn Store>,
}

impl OAuthManager {
    pub fn new(
        config: Arc<ChangeflowConfig>,
        gateway: Gateway,
        vault: Arc<CredentialVault>,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            config,
            gateway,
            vault,
            store,
        }
    }

    pub fn config(&self) -> &ChangeflowConfig {
        &self.config
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Start a flow: persist a fresh state record and build the redirect URL
    pub fn begin_authorization(
        &self,
        provider: Provider,
        user_id: &str,
    ) -> Result<AuthorizationRequest> {
        let client = OAuthClient::resolve(provider, &self.config)?;

        let now = Utc::now();
        if let Err(e) = self.store.purge_expired_oauth_states(now) {
            warn!(error = %e, "Failed to purge expired OAuth states");
        }

        let state = generate_oauth_state();
        let pkce = client.spec.uses_pkce.then(generate_pkce);
        let expires_at = now + self.config.state_ttl();

        self.store.save_oauth_state(&OAuthStateRecord {
            state: state.clone(),
            provider,
            user_id: user_id.to_string(),
            pkce_verifier: pkce.as_ref().map(|p| p.verifier.clone()),
            expires_at,
        })?;

        let url = client.authorization_url(&state, pkce.as_ref())?;

        info!(
            provider = %provider,
            user = %user_id,
            state = %state_prefix(&state),
            pkce = pkce.is_some(),
            "Authorization flow initiated"
        );

        Ok(AuthorizationRequest {
            provider,
            url,
            state,
            expires_at,
        })
    }

    /// Handle the callback: consume the state, exchange the code, store the integration.
    ///
    /// State failures are security errors and abort the flow. A callback that
    /// carries `error` still consumes its state before failing.
    pub async fn complete_authorization(
        &self,
        provider: Provider,
        organization_id: &str,
        user_id: &str,
        params: CallbackParams,
    ) -> Result<IntegrationRecord> {
        let client = OAuthClient::resolve(provider, &self.config)?;

        let record = self
            .store
            .consume_oauth_state(provider, &params.state, user_id)
            .map_err(|e| {
                warn!(
                    provider = %provider,
                    user = %user_id,
                    state = %state_prefix(&params.state),
                    error = %e,
                    "OAuth state rejected"
                );
                e
            })?;

        if record.is_expired(Utc::now()) {
            warn!(
                provider = %provider,
                user = %user_id,
                state = %state_prefix(&params.state),
                expired_at = %record.expires_at,
                "OAuth state rejected: expired"
            );
            return Err(OAuthStateError::Expired.into());
        }

        if let Some(error) = params.error {
            let reason = match params.error_description {
                Some(description) => format!("{}: {}", error, description),
                None => error,
            };
            warn!(provider = %provider, user = %user_id, reason = %reason, "Authorization denied");
            return Err(ChangeflowError::OAuthDenied { provider, reason });
        }

        let code = params
            .code
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                ChangeflowError::InvalidRequest("callback is missing the authorization code".to_string())
            })?;

        let credentials = self
            .request_token(
                &client,
                Grant::AuthorizationCode {
                    code: &code,
                    verifier: record.pkce_verifier.as_deref(),
                },
            )
            .await?;

        let previous = self.store.get_integration(organization_id, provider)?;
        let mut config = IntegrationConfig {
            scopes: credentials.scopes(),
            resources: Vec::new(),
            preferred_resource_id: previous.and_then(|p| p.config.preferred_resource_id),
        };

        if let Some(ref resources_url) = client.resources_url {
            config.resources = self
                .fetch_accessible_resources(provider, resources_url, &credentials.access_token)
                .await?;
            let preferred_still_reachable = config
                .preferred_resource_id
                .as_ref()
                .map(|id| config.resources.iter().any(|r| &r.id == id))
                .unwrap_or(false);
            if !preferred_still_reachable {
                config.preferred_resource_id = config.resources.first().map(|r| r.id.clone());
            }
        }

        let record = IntegrationRecord {
            organization_id: organization_id.to_string(),
            provider,
            encrypted_credentials: self.vault.encrypt(&credentials)?,
            config,
            is_active: true,
            updated_at: Utc::now(),
        };
        self.store.upsert_integration(&record)?;

        info!(
            provider = %provider,
            organization = %organization_id,
            scopes = ?record.config.scopes,
            resources = record.config.resources.len(),
            expires_at = ?credentials.expires_at,
            "Integration connected"
        );

        Ok(record)
    }

    /// Exchange an authorization code for a token set
    pub async fn exchange_code(
        &self,
        provider: Provider,
        code: &str,
        pkce_verifier: Option<&str>,
    ) -> Result<Credentials> {
        let client = OAuthClient::resolve(provider, &self.config)?;
        self.request_token(
            &client,
            Grant::AuthorizationCode {
                code,
                verifier: pkce_verifier,
            },
        )
        .await
    }

    /// Run the refresh-token grant and store the new token set.
    ///
    /// A rotated refresh token replaces the stored one; when the provider
    /// returns none, the previous refresh token is kept.
    pub async fn refresh(&self, organization_id: &str, provider: Provider) -> Result<Credentials> {
        let record = self.active_integration(organization_id, provider)?;
        let current = self.vault.decrypt(&record.encrypted_credentials)?;
        self.refresh_record(record, current).await
    }

    async fn refresh_record(
        &self,
        mut record: IntegrationRecord,
        current: Credentials,
    ) -> Result<Credentials> {
        let provider = record.provider;
        let refresh_token = current
            .refresh_token
            .clone()
            .ok_or(ChangeflowError::MissingRefreshToken(provider))?;

        let client = OAuthClient::resolve(provider, &self.config)?;
        let issued = self
            .request_token(&client, Grant::RefreshToken(&refresh_token))
            .await?;

        let rotated = issued.refresh_token.is_some();
        let credentials = Credentials {
            refresh_token: issued.refresh_token.or(current.refresh_token),
            scope: issued.scope.or(current.scope),
            token_type: issued.token_type.or(current.token_type),
            ..issued
        };

        let scopes = credentials.scopes();
        if !scopes.is_empty() {
            record.config.scopes = scopes;
        }
        record.encrypted_credentials = self.vault.encrypt(&credentials)?;
        record.updated_at = Utc::now();
        self.store.upsert_integration(&record)?;

        info!(
            provider = %provider,
            organization = %record.organization_id,
            rotated,
            expires_at = ?credentials.expires_at,
            "Access token refreshed"
        );

        Ok(credentials)
    }

    /// A usable access token, refreshing first when it is expired or about to expire
    pub async fn access_token(&self, organization_id: &str, provider: Provider) -> Result<AccessToken> {
        let record = self.active_integration(organization_id, provider)?;
        let credentials = self.vault.decrypt(&record.encrypted_credentials)?;
        let config = record.config.clone();

        let (credentials, refreshed) = match credentials.status(Utc::now(), self.config.refresh_skew()) {
            TokenStatus::Active => (credentials, false),
            TokenStatus::Expiring if credentials.refresh_token.is_none() => {
                debug!(provider = %provider, "Token expiring but not refreshable; using it");
                (credentials, false)
            }
            status => {
                debug!(provider = %provider, ?status, "Refreshing access token");
                (self.refresh_record(record, credentials).await?, true)
            }
        };

        let token = AccessToken::new(provider, organization_id, credentials.access_token, config);
        Ok(if refreshed { token.mark_refreshed() } else { token })
    }

    /// Freshness of the stored access token
    pub fn token_status(&self, organization_id: &str, provider: Provider) -> Result<TokenStatus> {
        let record = self.active_integration(organization_id, provider)?;
        let credentials = self.vault.decrypt(&record.encrypted_credentials)?;
        Ok(credentials.status(Utc::now(), self.config.refresh_skew()))
    }

    /// Mark an integration inactive; later token requests fail with `IntegrationInactive`
    pub fn disconnect(&self, organization_id: &str, provider: Provider) -> Result<()> {
        let mut record = self.integration(organization_id, provider)?;
        record.is_active = false;
        record.updated_at = Utc::now();
        self.store.upsert_integration(&record)?;

        info!(provider = %provider, organization = %organization_id, "Integration disconnected");
        Ok(())
    }

    /// Select which reachable site API calls use
    pub fn set_preferred_resource(
        &self,
        organization_id: &str,
        provider: Provider,
        resource_id: &str,
    ) -> Result<()> {
        let mut record = self.active_integration(organization_id, provider)?;
        if !record.config.resources.iter().any(|r| r.id == resource_id) {
            return Err(ChangeflowError::InvalidRequest(format!(
                "{} is not reachable by the {} integration",
                resource_id, provider
            )));
        }
        record.config.preferred_resource_id = Some(resource_id.to_string());
        record.updated_at = Utc::now();
        self.store.upsert_integration(&record)
    }

    /// Sites the token can reach (Jira cloud instances)
    pub async fn fetch_accessible_resources(
        &self,
        provider: Provider,
        resources_url: &str,
        access_token: &str,
    ) -> Result<Vec<AccessibleResource>> {
        let request = self
            .gateway
            .client()
            .get(resources_url)
            .bearer_auth(access_token)
            .header(header::ACCEPT, "application/json")
            .build()?;

        let resources: Vec<AccessibleResource> = self.gateway.send_json(provider, request).await?;
        debug!(provider = %provider, count = resources.len(), "Fetched accessible resources");
        Ok(resources)
    }

    fn integration(&self, organization_id: &str, provider: Provider) -> Result<IntegrationRecord> {
        self.store
            .get_integration(organization_id, provider)?
            .ok_or_else(|| ChangeflowError::NotConnected {
                organization_id: organization_id.to_string(),
                provider,
            })
    }

    fn active_integration(&self, organization_id: &str, provider: Provider) -> Result<IntegrationRecord> {
        let record = self.integration(organization_id, provider)?;
        if !record.is_active {
            return Err(ChangeflowError::IntegrationInactive {
                organization_id: organization_id.to_string(),
                provider,
            });
        }
        Ok(record)
    }

    fn token_request(&self, client: &OAuthClient, grant: &Grant<'_>) -> Result<Request> {
        let mut params: Vec<(&str, &str)> = vec![
            ("grant_type", grant.name()),
            ("client_id", client.client_id.as_str()),
            ("client_secret", client.client_secret()),
        ];

        match grant {
            Grant::AuthorizationCode { code, verifier } => {
                params.push(("code", *code));
                params.push(("redirect_uri", client.redirect_url.as_str()));
                if let Some(verifier) = *verifier {
                    params.push(("code_verifier", verifier));
                }
            }
            Grant::RefreshToken(token) => params.push(("refresh_token", *token)),
        }

        let builder = self
            .gateway
            .client()
            .post(&client.token_url)
            .header(header::ACCEPT, "application/json");

        let builder = match client.spec.token_body {
            TokenBodyFormat::Form => builder.form(&params),
            TokenBodyFormat::Json => {
                let body: serde_json::Map<String, serde_json::Value> = params
                    .iter()
                    .map(|(k, v)| (k.to_string(), serde_json::Value::from(*v)))
                    .collect();
                builder.json(&body)
            }
        };

        Ok(builder.build()?)
    }

    async fn request_token(&self, client: &OAuthClient, grant: Grant<'_>) -> Result<Credentials> {
        let provider = client.provider;
        let request = self.token_request(client, &grant)?;
        let response = self.gateway.send(provider, request).await?;
        let status = response.status();

        if !status.is_success() {
            let parsed: TokenResponse = response.json().unwrap_or_default();
            let message = match (parsed.error, parsed.error_description) {
                (Some(error), Some(description)) => format!("{}: {}", error, description),
                (Some(error), None) => error,
                _ => format!("HTTP {}", status.as_u16()),
            };
            warn!(provider = %provider, grant = grant.name(), status = status.as_u16(), "Token request rejected");
            return Err(ChangeflowError::TokenExchange { provider, message });
        }

        let token: TokenResponse = decode_response(provider, response)?;

        // GitHub reports grant errors with a 200 status
        if let Some(error) = token.error {
            let message = match token.error_description {
                Some(description) => format!("{}: {}", error, description),
                None => error,
            };
            warn!(provider = %provider, grant = grant.name(), "Token request rejected");
            return Err(ChangeflowError::TokenExchange { provider, message });
        }

        let access_token = token
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ChangeflowError::TokenExchange {
                provider,
                message: "response carried no access_token".to_string(),
            })?;

        debug!(provider = %provider, grant = grant.name(), "Token request succeeded");

        Ok(Credentials {
            access_token,
            refresh_token: token.refresh_token.filter(|t| !t.is_empty()),
            expires_at: token.expires_in.and_then(|secs| {
                let expires_at = expiry_after(Utc::now(), secs);
                if expires_at.is_none() {
                    warn!(provider = %provider, expires_in = secs, "Token lifetime out of range; treating as non-expiring");
                }
                expires_at
            }),
            scope: token.scope,
            token_type: token.token_type,
        })
    }
}

/// Absolute expiry for an `expires_in` lifetime.
///
/// Non-positive lifetimes are already expired. `None` when the lifetime
/// cannot be represented as a timestamp.
fn expiry_after(now: DateTime<Utc>, secs: i64) -> Option<DateTime<Utc>> {
    if secs <= 0 {
        return Some(now);
    }
    Duration::try_seconds(secs).and_then(|lifetime| now.checked_add_signed(lifetime))
}
