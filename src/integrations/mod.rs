//! Provider adapters
//!
//! One adapter per provider behind the [`ProviderAdapter`] capability,
//! selected through an [`AdapterRegistry`] keyed by provider.
//!
//! # Built-in Adapters
//!
//! - **GitHub**: REST API, page-number pagination driven by the `Link` header
//! - **Jira**: Cloud REST API v3 on the site resolved at connect time, offset pagination
//! - **Linear**: GraphQL, cursor pagination
//!
//! Adapters return provider-native records untouched; [`crate::normalize`]
//! turns them into [`crate::ChangeItem`]s. All requests go through the
//! shared [`Gateway`], so they are retried and rate-limited per provider.

pub mod github;
pub mod jira;
pub mod linear;

pub use github::GitHubAdapter;
pub use jira::JiraAdapter;
pub use linear::LinearAdapter;

use crate::config::ChangeflowConfig;
use crate::model::{ChangeType, Provider};
use crate::oauth::{api_base_url, AccessToken};
use crate::transport::Gateway;
use crate::{ChangeflowError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Largest page any supported provider serves
pub const MAX_PAGE_SIZE: u32 = 100;

/// Page size used when the caller asks for zero
pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Clamp a requested page size to the provider maximum
pub fn clamp_page_size(requested: u32) -> u32 {
    match requested {
        0 => DEFAULT_PAGE_SIZE,
        n => n.min(MAX_PAGE_SIZE),
    }
}

/// Position of a page in a provider's native pagination scheme
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum PageCursor {
    /// 1-based page number (GitHub)
    Page(u32),
    /// Zero-based item offset (Jira)
    Offset(u32),
    /// Opaque end cursor (Linear)
    After(String),
}

/// Generic pagination request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// `None` for the first page
    pub cursor: Option<PageCursor>,
    pub per_page: u32,
}

impl PageRequest {
    pub fn first(per_page: u32) -> Self {
        Self {
            cursor: None,
            per_page,
        }
    }

    pub fn at(cursor: PageCursor, per_page: u32) -> Self {
        Self {
            cursor: Some(cursor),
            per_page,
        }
    }

    /// Page size after clamping
    pub fn limit(&self) -> u32 {
        clamp_page_size(self.per_page)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::first(DEFAULT_PAGE_SIZE)
    }
}

/// One page of results plus the cursor for the next, if any
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<PageCursor>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self { items, next: None }
    }
}

/// A container of change activity: repository, Jira project or Linear team
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Project {
    pub id: String,
    /// Value to pass as [`ChangeQuery::scope`]
    pub key: String,
    pub name: String,
    pub url: Option<String>,
}

/// What to list from a provider
#[derive(Debug, Clone)]
pub struct ChangeQuery {
    pub change_type: ChangeType,
    /// Repository (`owner/name`), Jira project key or Linear team key
    pub scope: Option<String>,
    /// Only records updated at or after this instant
    pub since: Option<DateTime<Utc>>,
    pub page: PageRequest,
}

impl ChangeQuery {
    pub fn new(change_type: ChangeType) -> Self {
        Self {
            change_type,
            scope: None,
            since: None,
            page: PageRequest::default(),
        }
    }

    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn page(mut self, page: PageRequest) -> Self {
        self.page = page;
        self
    }
}

/// A record exactly as the provider returned it
#[derive(Debug, Clone, PartialEq)]
pub enum NativeRecord {
    GitHubCommit {
        repository: String,
        raw: serde_json::Value,
    },
    GitHubIssue {
        repository: String,
        raw: serde_json::Value,
    },
    JiraIssue {
        /// Browse base of the Jira site, e.g. `https://acme.atlassian.net`
        site_url: String,
        raw: serde_json::Value,
    },
    LinearIssue {
        raw: serde_json::Value,
    },
}

impl NativeRecord {
    pub fn provider(&self) -> Provider {
        match self {
            NativeRecord::GitHubCommit { .. } | NativeRecord::GitHubIssue { .. } => Provider::GitHub,
            NativeRecord::JiraIssue { .. } => Provider::Jira,
            NativeRecord::LinearIssue { .. } => Provider::Linear,
        }
    }

    pub fn raw(&self) -> &serde_json::Value {
        match self {
            NativeRecord::GitHubCommit { raw, .. }
            | NativeRecord::GitHubIssue { raw, .. }
            | NativeRecord::JiraIssue { raw, .. }
            | NativeRecord::LinearIssue { raw } => raw,
        }
    }
}

/// Provider-specific request shaping and pagination
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    /// Change types this provider can list
    fn change_types(&self) -> &'static [ChangeType];

    /// Repositories, projects or teams visible to the token
    async fn list_projects(&self, token: &AccessToken, page: &PageRequest) -> Result<Page<Project>>;

    /// One page of native change records
    async fn list_changes(&self, token: &AccessToken, query: &ChangeQuery) -> Result<Page<NativeRecord>>;
}

fn unsupported(provider: Provider, change_type: ChangeType) -> ChangeflowError {
    ChangeflowError::InvalidRequest(format!(
        "{} does not provide {} records",
        provider, change_type
    ))
}

/// Adapters keyed by provider
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Provider, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the built-in adapters against the configured API hosts
    pub fn with_builtin(config: &ChangeflowConfig, gateway: Gateway) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(GitHubAdapter::new(
            gateway.clone(),
            api_base_url(config, Provider::GitHub),
        )));
        registry.register(Arc::new(JiraAdapter::new(
            gateway.clone(),
            api_base_url(config, Provider::Jira),
        )));
        registry.register(Arc::new(LinearAdapter::new(
            gateway,
            api_base_url(config, Provider::Linear),
        )));
        registry
    }

    /// Add or replace the adapter for its provider
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.provider(), adapter);
    }

    pub fn get(&self, provider: Provider) -> Result<Arc<dyn ProviderAdapter>> {
        self.adapters
            .get(&provider)
            .cloned()
            .ok_or_else(|| ChangeflowError::NotConfigured {
                provider,
                reason: "no adapter registered".to_string(),
            })
    }

    pub fn providers(&self) -> Vec<Provider> {
        let mut providers: Vec<Provider> = self.adapters.keys().copied().collect();
        providers.sort();
        providers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::ProviderLimiter;
    use crate::transport::{RetryPolicy, Transport};

    #[test]
    fn test_clamp_page_size() {
        assert_eq!(clamp_page_size(0), DEFAULT_PAGE_SIZE);
        assert_eq!(clamp_page_size(25), 25);
        assert_eq!(clamp_page_size(100), 100);
        assert_eq!(clamp_page_size(500), MAX_PAGE_SIZE);
        assert_eq!(PageRequest::first(1000).limit(), 100);
    }

    #[test]
    fn test_query_builder() {
        let query = ChangeQuery::new(ChangeType::Commit)
            .scope("octo/repo")
            .page(PageRequest::at(PageCursor::Page(3), 10));
        assert_eq!(query.scope.as_deref(), Some("octo/repo"));
        assert_eq!(query.page.cursor, Some(PageCursor::Page(3)));
        assert!(query.since.is_none());
    }

    #[test]
    fn test_registry_lookup() {
        let gateway = Gateway::new(
            Transport::new().unwrap(),
            Arc::new(ProviderLimiter::default()),
            RetryPolicy::default(),
        );
        let registry = AdapterRegistry::with_builtin(&ChangeflowConfig::new(), gateway);

        assert_eq!(registry.providers(), Provider::ALL.to_vec());
        for provider in Provider::ALL {
            assert_eq!(registry.get(provider).unwrap().provider(), provider);
        }
        assert!(matches!(
            AdapterRegistry::new().get(Provider::Jira),
            Err(ChangeflowError::NotConfigured { .. })
        ));
    }

    #[test]
    fn test_native_record_provider() {
        let record = NativeRecord::JiraIssue {
            site_url: "https://acme.atlassian.net".to_string(),
            raw: serde_json::json!({"key": "ENG-1"}),
        };
        assert_eq!(record.provider(), Provider::Jira);
        assert_eq!(record.raw()["key"], "ENG-1");
    }
}
