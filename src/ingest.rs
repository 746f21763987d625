//! Ingestion orchestration
//!
//! Ties the pieces together for one organization: obtain a token, ask the
//! provider's adapter for a page, normalize it, upsert it into the cache.
//!
//! A provider 401 triggers exactly one refresh and one retry. A second 401
//! is returned to the caller.

use crate::cache::{CacheWriter, UpsertReport};
use crate::config::ChangeflowConfig;
use crate::integrations::{AdapterRegistry, ChangeQuery, Page, PageRequest, Project};
use crate::limiter::ProviderLimiter;
use crate::model::{ChangeItem, ChangeType, Provider};
use crate::normalize::normalize_all;
use crate::oauth::{AccessToken, OAuthManager};
use crate::store::{SqliteStore, Store, StoreConfig};
use crate::transport::{Gateway, Transport};
use crate::{ChangeflowError, Result};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

/// Default page budget for one sync
pub const DEFAULT_MAX_PAGES: u32 = 10;

/// What a sync should pull
#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub provider: Provider,
    pub change_type: ChangeType,
    pub scope: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub per_page: u32,
    /// Stop after this many pages even if the provider has more
    pub max_pages: u32,
}

impl SyncRequest {
    pub fn new(provider: Provider, change_type: ChangeType) -> Self {
        Self {
            provider,
            change_type,
            scope: None,
            since: None,
            per_page: crate::integrations::MAX_PAGE_SIZE,
            max_pages: DEFAULT_MAX_PAGES,
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

    fn query(&self, page: PageRequest) -> ChangeQuery {
        ChangeQuery {
            change_type: self.change_type,
            scope: self.scope.clone(),
            since: self.since,
            page,
        }
    }
}

/// Outcome of a sync
#[derive(Debug)]
pub struct SyncReport {
    pub provider: Provider,
    pub pages: u32,
    pub fetched: usize,
    pub upsert: UpsertReport,
    /// `true` when the page budget ran out before the provider's last page
    pub truncated: bool,
}

/// Caller-level ingestion engine
pub struct IngestEngine {
    oauth: OAuthManager,
    adapters: AdapterRegistry,
    cache: CacheWriter,
}

impl IngestEngine {
    pub fn new(oauth: OAuthManager, adapters: AdapterRegistry, cache: CacheWriter) -> Self {
        Self {
            oauth,
            adapters,
            cache,
        }
    }

    /// Build the full stack from configuration: transport, limiter, vault and SQLite store
    pub fn from_config(config: ChangeflowConfig) -> Result<Self> {
        let config = Arc::new(config);

        let gateway = Gateway::new(
            Transport::new()?,
            Arc::new(ProviderLimiter::new(&config.limits)),
            config.retry_policy(),
        );
        let vault = Arc::new(config.vault()?);
        let store: Arc<dyn Store> =
            Arc::new(SqliteStore::new(StoreConfig::new(config.store_path.clone()))?);

        let adapters = AdapterRegistry::with_builtin(&config, gateway.clone());
        let cache = CacheWriter::new(store.clone());
        let oauth = OAuthManager::new(config, gateway, vault, store);

        Ok(Self::new(oauth, adapters, cache))
    }

    pub fn oauth(&self) -> &OAuthManager {
        &self.oauth
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }

    pub fn cache(&self) -> &CacheWriter {
        &self.cache
    }

    /// Run `op` with a valid token, refreshing and retrying once on `AuthExpired`.
    ///
    /// A token that was just refreshed is not refreshed again; its rejection
    /// is returned as-is.
    async fn with_token<T, F, Fut>(&self, organization_id: &str, provider: Provider, op: F) -> Result<T>
    where
        F: Fn(AccessToken) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let token = self.oauth.access_token(organization_id, provider).await?;
        let config = token.config.clone();
        let already_refreshed = token.refreshed;

        match op(token).await {
            Err(ChangeflowError::AuthExpired(p)) if already_refreshed => {
                warn!(
                    provider = %provider,
                    organization = %organization_id,
                    "Provider rejected a freshly refreshed token; not refreshing again"
                );
                Err(ChangeflowError::AuthExpired(p))
            }
            Err(ChangeflowError::AuthExpired(_)) => {
                warn!(
                    provider = %provider,
                    organization = %organization_id,
                    "Provider rejected access token; refreshing once"
                );
                let credentials = self.oauth.refresh(organization_id, provider).await?;
                let token = AccessToken::new(provider, organization_id, credentials.access_token, config)
                    .mark_refreshed();
                op(token).await
            }
            other => other,
        }
    }

    /// Repositories, projects or teams visible to the organization's token
    pub async fn list_projects(
        &self,
        organization_id: &str,
        provider: Provider,
        page: &PageRequest,
    ) -> Result<Page<Project>> {
        let adapter = self.adapters.get(provider)?;
        self.with_token(organization_id, provider, |token| {
            let adapter = adapter.clone();
            async move { adapter.list_projects(&token, page).await }
        })
        .await
    }

    /// Fetch and normalize one page, without caching it
    pub async fn fetch(
        &self,
        organization_id: &str,
        provider: Provider,
        query: &ChangeQuery,
    ) -> Result<Page<ChangeItem>> {
        let adapter = self.adapters.get(provider)?;
        let page = self
            .with_token(organization_id, provider, |token| {
                let adapter = adapter.clone();
                async move { adapter.list_changes(&token, query).await }
            })
            .await?;

        Ok(Page {
            items: normalize_all(&page.items),
            next: page.next,
        })
    }

    /// Page through a provider, caching each page as it arrives.
    ///
    /// A fetch error aborts the sync; pages already cached stay cached.
    pub async fn sync(&self, organization_id: &str, request: &SyncRequest) -> Result<SyncReport> {
        let mut report = SyncReport {
            provider: request.provider,
            pages: 0,
            fetched: 0,
            upsert: UpsertReport::default(),
            truncated: false,
        };
        let mut page = PageRequest::first(request.per_page);

        loop {
            let query = request.query(page.clone());
            let result = self.fetch(organization_id, request.provider, &query).await?;

            report.pages += 1;
            report.fetched += result.items.len();
            report
                .upsert
                .merge(self.cache.upsert(organization_id, &result.items));

            match result.next {
                Some(cursor) if report.pages < request.max_pages => {
                    page = PageRequest::at(cursor, request.per_page);
                }
                Some(_) => {
                    report.truncated = true;
                    break;
                }
                None => break,
            }
        }

        info!(
            provider = %request.provider,
            organization = %organization_id,
            change_type = %request.change_type,
            pages = report.pages,
            fetched = report.fetched,
            written = report.upsert.written,
            failed = report.upsert.failures.len(),
            "Sync complete"
        );
        Ok(report)
    }

    /// Run several syncs concurrently; each provider's limiter still applies
    pub async fn sync_all(
        &self,
        organization_id: &str,
        requests: &[SyncRequest],
    ) -> Vec<(SyncRequest, Result<SyncReport>)> {
        let results =
            futures::future::join_all(requests.iter().map(|r| self.sync(organization_id, r))).await;
        requests.iter().cloned().zip(results).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_request_builder() {
        let request = SyncRequest::new(Provider::GitHub, ChangeType::Commit)
            .scope("octo/app")
            .since(Utc::now());
        assert_eq!(request.max_pages, DEFAULT_MAX_PAGES);

        let query = request.query(PageRequest::first(5));
        assert_eq!(query.scope.as_deref(), Some("octo/app"));
        assert_eq!(query.change_type, ChangeType::Commit);
        assert!(query.since.is_some());
        assert_eq!(query.page.per_page, 5);
    }
}
