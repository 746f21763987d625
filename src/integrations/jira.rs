//! JIRA Integration Adapter
//!
//! Reads projects and issues from Jira Cloud through the Atlassian API
//! gateway. Every call is scoped to the site chosen when the organization
//! connected; the site's cloud id forms part of the path.
//!
//! Pagination uses `startAt`/`maxResults` offsets.

use super::{unsupported, ChangeQuery, NativeRecord, Page, PageCursor, PageRequest, Project, ProviderAdapter};
use crate::model::{AccessibleResource, ChangeType, Provider};
use crate::oauth::AccessToken;
use crate::transport::Gateway;
use crate::{ChangeflowError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, Request};
use serde::Deserialize;
use tracing::{debug, info};

/// Fields requested for each issue
const ISSUE_FIELDS: &str =
    "summary,description,status,assignee,labels,created,updated,issuetype,priority";

/// Jira Cloud REST client
pub struct JiraAdapter {
    gateway: Gateway,
    base_url: String,
}

/// Issue search response
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JiraSearchResponse {
    #[serde(default)]
    start_at: u32,
    #[serde(default)]
    total: u32,
    #[serde(default)]
    issues: Vec<serde_json::Value>,
}

/// Paginated project search response
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JiraProjectPage {
    #[serde(default)]
    start_at: u32,
    #[serde(default)]
    is_last: bool,
    #[serde(default)]
    values: Vec<JiraProject>,
}

#[derive(Debug, Deserialize)]
struct JiraProject {
    id: String,
    key: String,
    name: String,
}

impl JiraAdapter {
    /// Create a new JIRA adapter against the API gateway root
    pub fn new(gateway: Gateway, base_url: impl Into<String>) -> Self {
        Self {
            gateway,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// The connected site for this token
    fn site(token: &AccessToken) -> Result<&AccessibleResource> {
        token.config.preferred_resource().ok_or_else(|| {
            ChangeflowError::InvalidRequest(
                "No accessible Jira site for this organization; reconnect Jira".to_string(),
            )
        })
    }

    /// REST v3 root for a site
    fn site_api(&self, site: &AccessibleResource) -> String {
        format!("{}/ex/jira/{}/rest/api/3", self.base_url, site.id)
    }

    /// Keep only characters valid in a project key
    fn sanitize_key(key: &str) -> String {
        key.chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect()
    }

    /// Build the JQL for an issue search
    fn build_jql(project: Option<&str>, since: Option<DateTime<Utc>>) -> Result<String> {
        let mut clauses = Vec::new();

        if let Some(project) = project {
            // Sanitize to prevent JQL injection
            let key = Self::sanitize_key(project);
            if key.is_empty() {
                return Err(ChangeflowError::InvalidRequest(format!(
                    "Invalid Jira project key: '{}'",
                    project
                )));
            }
            clauses.push(format!("project = \"{}\"", key));
        }

        if let Some(since) = since {
            // Epoch millis; JQL date literals are read in the profile timezone
            clauses.push(format!("updated >= {}", since.timestamp_millis()));
        }

        let order = "ORDER BY updated DESC";
        Ok(if clauses.is_empty() {
            order.to_string()
        } else {
            format!("{} {}", clauses.join(" AND "), order)
        })
    }

    fn start_at(page: &PageRequest) -> Result<u32> {
        match &page.cursor {
            None => Ok(0),
            Some(PageCursor::Offset(n)) => Ok(*n),
            Some(other) => Err(ChangeflowError::InvalidRequest(format!(
                "Jira paginates by offset, got {:?}",
                other
            ))),
        }
    }

    fn get(&self, token: &AccessToken, url: &str, query: &[(&str, String)]) -> Result<Request> {
        Ok(self
            .gateway
            .client()
            .get(url)
            .query(query)
            .bearer_auth(token.secret())
            .header(header::ACCEPT, "application/json")
            .build()?)
    }

    /// Search issues, newest update first
    pub async fn search(&self, token: &AccessToken, query: &ChangeQuery) -> Result<Page<NativeRecord>> {
        let site = Self::site(token)?;
        let jql = Self::build_jql(query.scope.as_deref(), query.since)?;
        let start_at = Self::start_at(&query.page)?;
        let max_results = query.page.limit();

        debug!(site = %site.name, jql = %jql, start_at, max_results, "Searching JIRA issues");

        let request = self.get(
            token,
            &format!("{}/search", self.site_api(site)),
            &[
                ("jql", jql),
                ("startAt", start_at.to_string()),
                ("maxResults", max_results.to_string()),
                ("fields", ISSUE_FIELDS.to_string()),
            ],
        )?;
        let result: JiraSearchResponse = self.gateway.send_json(Provider::Jira, request).await?;

        let returned = result.issues.len() as u32;
        let consumed = result.start_at + returned;
        // An empty page ends iteration even if the total disagrees
        let next = (returned > 0 && consumed < result.total).then_some(PageCursor::Offset(consumed));

        info!(total = result.total, returned, "JIRA search complete");

        let site_url = site.url.trim_end_matches('/').to_string();
        Ok(Page {
            items: result
                .issues
                .into_iter()
                .map(|raw| NativeRecord::JiraIssue {
                    site_url: site_url.clone(),
                    raw,
                })
                .collect(),
            next,
        })
    }
}

#[async_trait]
impl ProviderAdapter for JiraAdapter {
    fn provider(&self) -> Provider {
        Provider::Jira
    }

    fn change_types(&self) -> &'static [ChangeType] {
        &[ChangeType::Ticket, ChangeType::Issue]
    }

    async fn list_projects(&self, token: &AccessToken, page: &PageRequest) -> Result<Page<Project>> {
        let site = Self::site(token)?;
        let start_at = Self::start_at(page)?;

        let request = self.get(
            token,
            &format!("{}/project/search", self.site_api(site)),
            &[
                ("startAt", start_at.to_string()),
                ("maxResults", page.limit().to_string()),
            ],
        )?;
        let result: JiraProjectPage = self.gateway.send_json(Provider::Jira, request).await?;

        let returned = result.values.len() as u32;
        let next = (!result.is_last && returned > 0)
            .then_some(PageCursor::Offset(result.start_at + returned));
        let site_url = site.url.trim_end_matches('/');

        Ok(Page {
            items: result
                .values
                .into_iter()
                .map(|p| Project {
                    url: Some(format!("{}/browse/{}", site_url, p.key)),
                    id: p.id,
                    key: p.key,
                    name: p.name,
                })
                .collect(),
            next,
        })
    }

    async fn list_changes(&self, token: &AccessToken, query: &ChangeQuery) -> Result<Page<NativeRecord>> {
        match query.change_type {
            ChangeType::Ticket | ChangeType::Issue => self.search(token, query).await,
            other => Err(unsupported(Provider::Jira, other)),
        }
    }
}
