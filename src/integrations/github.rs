//! GitHub Integration Adapter
//!
//! Lists repositories, commits and issues through the REST API v3.

use super::{unsupported, ChangeQuery, NativeRecord, Page, PageCursor, PageRequest, Project, ProviderAdapter};
use crate::model::{ChangeType, Provider};
use crate::oauth::AccessToken;
use crate::transport::{check_status, Gateway, HttpResponse};
use crate::{ChangeflowError, Result};
use async_trait::async_trait;
use chrono::SecondsFormat;
use reqwest::{header, Request};
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

const ACCEPT_V3: &str = "application/vnd.github.v3+json";

/// GitHub REST client for change ingestion
pub struct GitHubAdapter {
    gateway: Gateway,
    base_url: String,
}

/// Repository (REST API format)
#[derive(Debug, Clone, Deserialize)]
struct GitHubRepo {
    id: u64,
    full_name: String,
    name: String,
    #[serde(default)]
    html_url: Option<String>,
}

impl GitHubAdapter {
    /// Create a new GitHub adapter
    ///
    /// `base_url` is `https://api.github.com` or an Enterprise `/api/v3` root.
    pub fn new(gateway: Gateway, base_url: impl Into<String>) -> Self {
        Self {
            gateway,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Validate an `owner/name` repository reference
    fn repository(scope: Option<&str>) -> Result<String> {
        let repo = scope.ok_or_else(|| {
            ChangeflowError::InvalidRequest("GitHub requests need a repository (owner/name)".to_string())
        })?;

        let mut parts = repo.split('/');
        let valid = matches!(
            (parts.next(), parts.next(), parts.next()),
            (Some(owner), Some(name), None) if is_name(owner) && is_name(name)
        );
        if !valid {
            return Err(ChangeflowError::InvalidRequest(format!(
                "Invalid GitHub repository '{}': expected owner/name",
                repo
            )));
        }
        Ok(repo.to_string())
    }

    fn get(&self, token: &AccessToken, path: &str, query: &[(&str, String)]) -> Result<Request> {
        Ok(self
            .gateway
            .client()
            .get(format!("{}{}", self.base_url, path))
            .query(query)
            .bearer_auth(token.secret())
            .header(header::ACCEPT, ACCEPT_V3)
            .build()?)
    }

    fn page_query(page: &PageRequest) -> Result<(u32, Vec<(&'static str, String)>)> {
        let number = match &page.cursor {
            None => 1,
            Some(PageCursor::Page(n)) => (*n).max(1),
            Some(other) => {
                return Err(ChangeflowError::InvalidRequest(format!(
                    "GitHub paginates by page number, got {:?}",
                    other
                )))
            }
        };
        let query = vec![
            ("per_page", page.limit().to_string()),
            ("page", number.to_string()),
        ];
        Ok((number, query))
    }

    /// Fetch one page of a JSON array endpoint
    async fn fetch_page<T: serde::de::DeserializeOwned>(
        &self,
        request: Request,
        page: &PageRequest,
        number: u32,
    ) -> Result<Page<T>> {
        let response = self.gateway.send(Provider::GitHub, request).await?;
        let response = check_status(Provider::GitHub, response)?;
        let link = link_header(&response);

        let items: Vec<T> = response.json()?;
        let next = match link {
            Some(link) => next_page_from_link(&link).map(PageCursor::Page),
            // Without a Link header a full page may still have a successor
            None if items.len() as u32 >= page.limit() => Some(PageCursor::Page(number + 1)),
            None => None,
        };

        Ok(Page { items, next })
    }

    /// List commits on a repository's default branch
    pub async fn list_commits(&self, token: &AccessToken, query: &ChangeQuery) -> Result<Page<NativeRecord>> {
        let repository = Self::repository(query.scope.as_deref())?;
        let (number, mut params) = Self::page_query(&query.page)?;
        if let Some(since) = query.since {
            params.push(("since", since.to_rfc3339_opts(SecondsFormat::Secs, true)));
        }

        debug!(repository = %repository, page = number, "Listing GitHub commits");

        let request = self.get(token, &format!("/repos/{}/commits", repository), &params)?;
        let page: Page<serde_json::Value> = self.fetch_page(request, &query.page, number).await?;

        info!(repository = %repository, returned = page.items.len(), "GitHub commits fetched");

        Ok(Page {
            items: page
                .items
                .into_iter()
                .map(|raw| NativeRecord::GitHubCommit {
                    repository: repository.clone(),
                    raw,
                })
                .collect(),
            next: page.next,
        })
    }

    /// List issues (open and closed), excluding pull requests
    pub async fn list_issues(&self, token: &AccessToken, query: &ChangeQuery) -> Result<Page<NativeRecord>> {
        let repository = Self::repository(query.scope.as_deref())?;
        let (number, mut params) = Self::page_query(&query.page)?;
        params.push(("state", "all".to_string()));
        params.push(("sort", "updated".to_string()));
        params.push(("direction", "desc".to_string()));
        if let Some(since) = query.since {
            params.push(("since", since.to_rfc3339_opts(SecondsFormat::Secs, true)));
        }

        debug!(repository = %repository, page = number, "Listing GitHub issues");

        let request = self.get(token, &format!("/repos/{}/issues", repository), &params)?;
        let page: Page<serde_json::Value> = self.fetch_page(request, &query.page, number).await?;
        let fetched = page.items.len();

        // The issues endpoint also returns pull requests
        let items: Vec<NativeRecord> = page
            .items
            .into_iter()
            .filter(|raw| raw.get("pull_request").is_none())
            .map(|raw| NativeRecord::GitHubIssue {
                repository: repository.clone(),
                raw,
            })
            .collect();

        info!(
            repository = %repository,
            returned = items.len(),
            pull_requests = fetched - items.len(),
            "GitHub issues fetched"
        );

        Ok(Page {
            items,
            next: page.next,
        })
    }
}

#[async_trait]
impl ProviderAdapter for GitHubAdapter {
    fn provider(&self) -> Provider {
        Provider::GitHub
    }

    fn change_types(&self) -> &'static [ChangeType] {
        &[ChangeType::Commit, ChangeType::Issue]
    }

    async fn list_projects(&self, token: &AccessToken, page: &PageRequest) -> Result<Page<Project>> {
        let (number, mut params) = Self::page_query(page)?;
        params.push(("sort", "updated".to_string()));

        let request = self.get(token, "/user/repos", &params)?;
        let repos: Page<GitHubRepo> = self.fetch_page(request, page, number).await?;

        Ok(Page {
            items: repos
                .items
                .into_iter()
                .map(|repo| Project {
                    id: repo.id.to_string(),
                    key: repo.full_name,
                    name: repo.name,
                    url: repo.html_url,
                })
                .collect(),
            next: repos.next,
        })
    }

    async fn list_changes(&self, token: &AccessToken, query: &ChangeQuery) -> Result<Page<NativeRecord>> {
        match query.change_type {
            ChangeType::Commit => self.list_commits(token, query).await,
            ChangeType::Issue => self.list_issues(token, query).await,
            other => Err(unsupported(Provider::GitHub, other)),
        }
    }
}

fn is_name(part: &str) -> bool {
    !part.is_empty()
        && part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn link_header(response: &HttpResponse) -> Option<String> {
    response
        .headers()
        .get(header::LINK)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Page number of the `rel="next"` entry in a `Link` header
fn next_page_from_link(link: &str) -> Option<u32> {
    link.split(',').find_map(|entry| {
        let mut parts = entry.split(';');
        let target = parts.next()?.trim().trim_start_matches('<').trim_end_matches('>');
        let is_next = parts.any(|p| p.trim() == "rel=\"next\"");
        if !is_next {
            return None;
        }
        Url::parse(target)
            .ok()?
            .query_pairs()
            .find(|(k, _)| k == "page")
            .and_then(|(_, v)| v.parse().ok())
    })
}
